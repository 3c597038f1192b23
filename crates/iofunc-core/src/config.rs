// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount configuration

use serde::{Deserialize, Serialize};

use crate::error::{IoFuncError, IoResult};

/// Width of offsets and inode numbers reported to clients.
///
/// Attributes always keep 64-bit values internally; a 32-bit mount rejects
/// seeks beyond `i32::MAX` and truncates at the reply boundary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OffsetWidth {
    Bits32,
    #[default]
    Bits64,
}

impl OffsetWidth {
    /// Largest offset a client may seek to
    pub fn max_offset(self) -> u64 {
        match self {
            OffsetWidth::Bits32 => i32::MAX as u64,
            OffsetWidth::Bits64 => i64::MAX as u64,
        }
    }

    pub fn truncate(self, value: u64) -> u64 {
        match self {
            OffsetWidth::Bits32 => value & u64::from(u32::MAX),
            OffsetWidth::Bits64 => value,
        }
    }
}

/// Permission enforcement knobs
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SecurityPolicy {
    /// Evaluate mode bits and ACLs on open/read/write
    #[serde(default = "default_true")]
    pub enforce_permissions: bool,
    /// uid 0 passes read/write checks without consulting mode bits
    #[serde(default = "default_true")]
    pub root_bypass: bool,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            enforce_permissions: true,
            root_bypass: true,
        }
    }
}

/// Configuration bits reported through `pathconf` and consulted by defaults
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MountConfBits {
    /// Only privileged clients may give files away
    #[serde(default = "default_true")]
    pub chown_restricted: bool,
    /// Over-long names are an error rather than truncated
    #[serde(default = "default_true")]
    pub no_trunc: bool,
    /// Synchronous I/O is honoured
    #[serde(default)]
    pub sync_io: bool,
    /// Access control lists are supported
    #[serde(default)]
    pub acl: bool,
    /// Reads do not stamp access times
    #[serde(default)]
    pub noatime: bool,
}

impl Default for MountConfBits {
    fn default() -> Self {
        Self {
            chown_restricted: true,
            no_trunc: true,
            sync_io: false,
            acl: false,
            noatime: false,
        }
    }
}

/// Everything needed to build a [`crate::Mount`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MountConfig {
    #[serde(default)]
    pub offset_width: OffsetWidth,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    #[serde(default)]
    pub dev: u64,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub conf: MountConfBits,
    /// Upper bound on registrations purged by one strict notify removal
    #[serde(default = "default_notify_remove_limit")]
    pub notify_remove_limit: usize,
    /// Longest name accepted for a node
    #[serde(default = "default_name_max")]
    pub name_max: usize,
    #[serde(default)]
    pub security: SecurityPolicy,
}

fn default_true() -> bool {
    true
}

fn default_block_size() -> u32 {
    512
}

fn default_notify_remove_limit() -> usize {
    64
}

fn default_name_max() -> usize {
    255
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            offset_width: OffsetWidth::default(),
            block_size: default_block_size(),
            dev: 0,
            read_only: false,
            conf: MountConfBits::default(),
            notify_remove_limit: default_notify_remove_limit(),
            name_max: default_name_max(),
            security: SecurityPolicy::default(),
        }
    }
}

impl MountConfig {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Load a configuration file, choosing the format by extension
    pub fn load(path: &std::path::Path) -> IoResult<Self> {
        let bytes = std::fs::read(path)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => {
                let text = String::from_utf8(bytes).map_err(|_| IoFuncError::InvalidArgument)?;
                Self::from_toml_str(&text).map_err(|e| IoFuncError::Internal(e.to_string()))?
            }
            _ => Self::from_json_bytes(&bytes).map_err(|e| IoFuncError::Internal(e.to_string()))?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> IoResult<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(IoFuncError::InvalidArgument);
        }
        if self.notify_remove_limit == 0 {
            return Err(IoFuncError::InvalidArgument);
        }
        Ok(())
    }
}
