// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount descriptor and the per-mount function table

use bitflags::bitflags;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::attr::Attr;
use crate::config::{MountConfig, OffsetWidth};
use crate::context::Context;
use crate::error::IoResult;
use crate::messages::OpenRequest;
use crate::ocb::Ocb;
use crate::types::{Ino, OcbId};

bitflags! {
    /// Mount-wide flags
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MountFlags: u32 {
        const READONLY = 0x0001;
        const BITS32 = 0x0002;
    }
}

/// Overridable hooks for OCB allocation and attribute locking.
///
/// Every default handler goes through this table, so a driver that needs a
/// larger OCB or a different lock discipline overrides only these methods.
pub trait IoFuncs: Send + Sync {
    fn ocb_calloc(
        &self,
        ctx: &Context,
        attr: &Arc<Attr>,
        open: &OpenRequest,
    ) -> IoResult<Arc<Ocb>> {
        Ok(Arc::new(Ocb::new(attr.mount().allocate_ocb_id(), Arc::clone(attr), ctx, open)))
    }

    fn ocb_free(&self, ocb: Arc<Ocb>) {
        drop(ocb);
    }

    fn attr_lock(&self, attr: &Attr) {
        attr.lock_raw();
    }

    fn attr_unlock(&self, attr: &Attr) -> IoResult<()> {
        attr.unlock_raw()
    }

    fn attr_trylock(&self, attr: &Attr) -> IoResult<()> {
        attr.trylock_raw()
    }
}

/// Function table with the built-in behavior for every hook
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultIoFuncs;

impl IoFuncs for DefaultIoFuncs {}

/// Configuration shared by every attribute of one mounted resource
pub struct Mount {
    config: MountConfig,
    flags: MountFlags,
    funcs: Box<dyn IoFuncs>,
    next_ino: AtomicU64,
    next_ocb_id: AtomicU64,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("dev", &self.config.dev)
            .field("flags", &self.flags)
            .field("block_size", &self.config.block_size)
            .finish()
    }
}

impl Mount {
    pub fn new(config: MountConfig) -> Arc<Self> {
        Self::with_funcs(config, Box::new(DefaultIoFuncs))
    }

    pub fn with_funcs(config: MountConfig, funcs: Box<dyn IoFuncs>) -> Arc<Self> {
        let mut flags = MountFlags::empty();
        if config.read_only {
            flags |= MountFlags::READONLY;
        }
        if config.offset_width == OffsetWidth::Bits32 {
            flags |= MountFlags::BITS32;
        }
        Arc::new(Self {
            config,
            flags,
            funcs,
            next_ino: AtomicU64::new(1),
            next_ocb_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn flags(&self) -> MountFlags {
        self.flags
    }

    pub fn funcs(&self) -> &dyn IoFuncs {
        self.funcs.as_ref()
    }

    pub fn dev(&self) -> u64 {
        self.config.dev
    }

    pub fn block_size(&self) -> u32 {
        self.config.block_size
    }

    pub fn offset_width(&self) -> OffsetWidth {
        self.config.offset_width
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(MountFlags::READONLY)
    }

    pub fn allocate_ino(&self) -> Ino {
        Ino(self.next_ino.fetch_add(1, Ordering::Relaxed))
    }

    pub fn allocate_ocb_id(&self) -> OcbId {
        OcbId(self.next_ocb_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_follow_config() {
        let mount = Mount::new(MountConfig {
            read_only: true,
            offset_width: OffsetWidth::Bits32,
            ..MountConfig::default()
        });
        assert!(mount.is_read_only());
        assert_eq!(mount.flags(), MountFlags::READONLY | MountFlags::BITS32);
    }

    #[test]
    fn ids_are_unique() {
        let mount = Mount::new(MountConfig::default());
        let a = mount.allocate_ino();
        let b = mount.allocate_ino();
        assert_ne!(a, b);
        assert_ne!(mount.allocate_ocb_id(), mount.allocate_ocb_id());
    }
}
