// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Access control lists
//!
//! An [`Acl`] pairs a function table with an opaque buffer. The default
//! [`PosixAcl`] table stores POSIX.1e entries as 8-byte little-endian
//! records: tag (u16), permissions (u16), qualifier (u32).

use std::borrow::Cow;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{IoFuncError, IoResult};
use crate::types::{Access, ClientInfo};

pub const ACL_RECORD_LEN: usize = 8;
pub const ACL_MAX_ENTRIES: usize = 32;

pub const ACL_READ: u16 = 0o4;
pub const ACL_WRITE: u16 = 0o2;
pub const ACL_EXECUTE: u16 = 0o1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclTag {
    UserObj,
    User,
    GroupObj,
    Group,
    Mask,
    Other,
}

impl AclTag {
    fn to_wire(self) -> u16 {
        match self {
            AclTag::UserObj => 0x01,
            AclTag::User => 0x02,
            AclTag::GroupObj => 0x04,
            AclTag::Group => 0x08,
            AclTag::Mask => 0x10,
            AclTag::Other => 0x20,
        }
    }

    fn from_wire(raw: u16) -> IoResult<Self> {
        Ok(match raw {
            0x01 => AclTag::UserObj,
            0x02 => AclTag::User,
            0x04 => AclTag::GroupObj,
            0x08 => AclTag::Group,
            0x10 => AclTag::Mask,
            0x20 => AclTag::Other,
            _ => return Err(IoFuncError::InvalidArgument),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    pub tag: AclTag,
    pub perms: u16,
    /// uid or gid for `User`/`Group`, ignored otherwise
    #[serde(default)]
    pub qualifier: u32,
}

impl AclEntry {
    pub fn new(tag: AclTag, perms: u16, qualifier: u32) -> Self {
        Self { tag, perms, qualifier }
    }
}

pub fn encode_entries(entries: &[AclEntry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(entries.len() * ACL_RECORD_LEN);
    for entry in entries {
        buf.extend_from_slice(&entry.tag.to_wire().to_le_bytes());
        buf.extend_from_slice(&entry.perms.to_le_bytes());
        buf.extend_from_slice(&entry.qualifier.to_le_bytes());
    }
    buf
}

pub fn decode_entries(buf: &[u8]) -> IoResult<Vec<AclEntry>> {
    if buf.len() % ACL_RECORD_LEN != 0 {
        return Err(IoFuncError::InvalidArgument);
    }
    buf.chunks_exact(ACL_RECORD_LEN)
        .map(|rec| {
            let tag = AclTag::from_wire(u16::from_le_bytes([rec[0], rec[1]]))?;
            let perms = u16::from_le_bytes([rec[2], rec[3]]);
            let qualifier = u32::from_le_bytes([rec[4], rec[5], rec[6], rec[7]]);
            Ok(AclEntry { tag, perms, qualifier })
        })
        .collect()
}

/// Owner and group of the node an ACL is evaluated against
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AclSubject {
    pub uid: u32,
    pub gid: u32,
}

/// Operations over an ACL buffer
pub trait AclFuncs: Send + Sync + std::fmt::Debug {
    /// Build an ACL equivalent to `mode`'s permission bits
    fn init(&self, mode: u32) -> IoResult<Vec<u8>>;
    /// Release resources tied to `buf`
    fn fini(&self, _buf: &[u8]) {}
    fn query(&self, buf: &[u8]) -> IoResult<Vec<AclEntry>>;
    /// Validate and serialize new entries
    fn set(&self, entries: &[AclEntry]) -> IoResult<Vec<u8>>;
    fn check(
        &self,
        buf: &[u8],
        subject: AclSubject,
        client: &ClientInfo,
        access: Access,
    ) -> IoResult<bool>;
    /// Fold the ACL into the mode reported by `stat`
    fn stat(&self, buf: &[u8], mode: u32) -> IoResult<u32>;
}

/// An attribute's ACL
#[derive(Clone, Debug)]
pub struct Acl {
    funcs: Arc<dyn AclFuncs>,
    buffer: Cow<'static, [u8]>,
}

impl Acl {
    pub fn from_mode(funcs: Arc<dyn AclFuncs>, mode: u32) -> IoResult<Self> {
        let buffer = Cow::Owned(funcs.init(mode)?);
        Ok(Self { funcs, buffer })
    }

    pub fn from_entries(funcs: Arc<dyn AclFuncs>, entries: &[AclEntry]) -> IoResult<Self> {
        let buffer = Cow::Owned(funcs.set(entries)?);
        Ok(Self { funcs, buffer })
    }

    /// Wrap a static buffer, e.g. a driver's compiled-in default.
    pub fn borrowed(funcs: Arc<dyn AclFuncs>, buffer: &'static [u8]) -> Self {
        Self {
            funcs,
            buffer: Cow::Borrowed(buffer),
        }
    }

    pub fn funcs(&self) -> &Arc<dyn AclFuncs> {
        &self.funcs
    }

    /// The same ACL with owner, group-class and other permissions taken
    /// from `mode`. The mask stands in for the group class when present.
    pub fn with_mode(&self, mode: u32) -> IoResult<Acl> {
        let has_mask = self.entries()?.iter().any(|e| e.tag == AclTag::Mask);
        let entries: Vec<AclEntry> = self
            .entries()?
            .into_iter()
            .map(|mut e| {
                match e.tag {
                    AclTag::UserObj => e.perms = ((mode >> 6) & 0o7) as u16,
                    AclTag::Mask => e.perms = ((mode >> 3) & 0o7) as u16,
                    AclTag::GroupObj if !has_mask => e.perms = ((mode >> 3) & 0o7) as u16,
                    AclTag::Other => e.perms = (mode & 0o7) as u16,
                    _ => {}
                }
                e
            })
            .collect();
        Acl::from_entries(Arc::clone(&self.funcs), &entries)
    }

    /// Whether the buffer was dynamically allocated and is dropped with the ACL
    pub fn is_allocated(&self) -> bool {
        matches!(self.buffer, Cow::Owned(_))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn entries(&self) -> IoResult<Vec<AclEntry>> {
        self.funcs.query(&self.buffer)
    }

    pub fn check(
        &self,
        subject: AclSubject,
        client: &ClientInfo,
        access: Access,
    ) -> IoResult<bool> {
        self.funcs.check(&self.buffer, subject, client, access)
    }

    pub fn stat_mode(&self, mode: u32) -> IoResult<u32> {
        self.funcs.stat(&self.buffer, mode)
    }
}

impl Drop for Acl {
    fn drop(&mut self) {
        self.funcs.fini(&self.buffer);
    }
}

/// POSIX.1e access control lists
#[derive(Clone, Copy, Debug, Default)]
pub struct PosixAcl;

impl PosixAcl {
    fn validate(entries: &[AclEntry]) -> IoResult<()> {
        if entries.len() > ACL_MAX_ENTRIES {
            return Err(IoFuncError::InvalidArgument);
        }
        let count = |tag| entries.iter().filter(|e| e.tag == tag).count();
        if count(AclTag::UserObj) != 1
            || count(AclTag::GroupObj) != 1
            || count(AclTag::Other) != 1
        {
            return Err(IoFuncError::InvalidArgument);
        }
        let named = count(AclTag::User) + count(AclTag::Group);
        match count(AclTag::Mask) {
            0 if named > 0 => return Err(IoFuncError::InvalidArgument),
            0 | 1 => {}
            _ => return Err(IoFuncError::InvalidArgument),
        }
        for tag in [AclTag::User, AclTag::Group] {
            let mut ids: Vec<u32> =
                entries.iter().filter(|e| e.tag == tag).map(|e| e.qualifier).collect();
            let total = ids.len();
            ids.sort_unstable();
            ids.dedup();
            if ids.len() != total {
                return Err(IoFuncError::InvalidArgument);
            }
        }
        if entries.iter().any(|e| e.perms & !0o7 != 0) {
            return Err(IoFuncError::InvalidArgument);
        }
        Ok(())
    }

    fn perms(entries: &[AclEntry], tag: AclTag) -> u16 {
        entries.iter().find(|e| e.tag == tag).map(|e| e.perms).unwrap_or(0)
    }
}

impl AclFuncs for PosixAcl {
    fn init(&self, mode: u32) -> IoResult<Vec<u8>> {
        let entries = [
            AclEntry::new(AclTag::UserObj, ((mode >> 6) & 0o7) as u16, 0),
            AclEntry::new(AclTag::GroupObj, ((mode >> 3) & 0o7) as u16, 0),
            AclEntry::new(AclTag::Other, (mode & 0o7) as u16, 0),
        ];
        Ok(encode_entries(&entries))
    }

    fn query(&self, buf: &[u8]) -> IoResult<Vec<AclEntry>> {
        decode_entries(buf)
    }

    fn set(&self, entries: &[AclEntry]) -> IoResult<Vec<u8>> {
        Self::validate(entries)?;
        let mut sorted = entries.to_vec();
        sorted.sort_by_key(|e| (e.tag, e.qualifier));
        Ok(encode_entries(&sorted))
    }

    fn check(
        &self,
        buf: &[u8],
        subject: AclSubject,
        client: &ClientInfo,
        access: Access,
    ) -> IoResult<bool> {
        let entries = decode_entries(buf)?;
        let wanted = access.bits() as u16;
        let mask = entries.iter().find(|e| e.tag == AclTag::Mask).map(|e| e.perms).unwrap_or(0o7);
        let grants = |perms: u16| perms & wanted == wanted;

        if client.uid == subject.uid {
            return Ok(grants(Self::perms(&entries, AclTag::UserObj)));
        }
        let named = entries.iter().find(|e| e.tag == AclTag::User && e.qualifier == client.uid);
        if let Some(user) = named {
            return Ok(grants(user.perms & mask));
        }
        let mut group_matched = false;
        for entry in &entries {
            let member = match entry.tag {
                AclTag::GroupObj => client.in_group(subject.gid),
                AclTag::Group => client.in_group(entry.qualifier),
                _ => false,
            };
            if member {
                group_matched = true;
                if grants(entry.perms & mask) {
                    return Ok(true);
                }
            }
        }
        if group_matched {
            return Ok(false);
        }
        Ok(grants(Self::perms(&entries, AclTag::Other)))
    }

    fn stat(&self, buf: &[u8], mode: u32) -> IoResult<u32> {
        let entries = decode_entries(buf)?;
        let user = u32::from(Self::perms(&entries, AclTag::UserObj));
        let group = match entries.iter().find(|e| e.tag == AclTag::Mask) {
            Some(mask) => u32::from(mask.perms),
            None => u32::from(Self::perms(&entries, AclTag::GroupObj)),
        };
        let other = u32::from(Self::perms(&entries, AclTag::Other));
        Ok((mode & !0o777) | (user << 6) | (group << 3) | other)
    }
}
