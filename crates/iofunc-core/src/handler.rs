// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-operation handler table
//!
//! A driver overrides the operations it cares about and inherits the
//! built-in semantics for the rest.

use std::sync::Arc;

use crate::acl::AclEntry;
use crate::attr::{Attr, MmapProt, PowerMode};
use crate::context::Context;
use crate::defaults::{self, Outcome};
use crate::driver::Driver;
use crate::error::IoResult;
use crate::lock::{ByteLock, LockRequest};
use crate::messages::{AclCmd, DevctlCmd, OpenRequest, PathconfName, PowerCmd, SpaceOp, UtimeTimes};
use crate::notify::{NotifyReply, NotifyRequest};
use crate::ocb::{CloseFlags, Ocb};
use crate::types::{FdInfo, RcvId, ShareMode, Stat, Whence};

pub trait IoHandler: Send + Sync {
    fn driver(&self) -> &dyn Driver;

    fn open(&self, ctx: &Context, attr: &Arc<Attr>, req: &OpenRequest) -> IoResult<Arc<Ocb>> {
        defaults::open_default(ctx, attr, self.driver(), req)
    }

    fn read(
        &self,
        ctx: &Context,
        ocb: &Arc<Ocb>,
        nbytes: usize,
        offset: Option<u64>,
    ) -> IoResult<Outcome<Vec<u8>>> {
        defaults::read_default(ctx, ocb, self.driver(), nbytes, offset)
    }

    fn write(
        &self,
        ctx: &Context,
        ocb: &Arc<Ocb>,
        data: &[u8],
        offset: Option<u64>,
    ) -> IoResult<usize> {
        defaults::write_default(ctx, ocb, self.driver(), data, offset)
    }

    fn lseek(&self, ctx: &Context, ocb: &Arc<Ocb>, offset: i64, whence: Whence) -> IoResult<u64> {
        defaults::lseek_default(ctx, ocb, offset, whence)
    }

    fn stat(&self, ctx: &Context, ocb: &Arc<Ocb>) -> IoResult<Stat> {
        defaults::stat_default(ctx, ocb)
    }

    fn chmod(&self, ctx: &Context, ocb: &Arc<Ocb>, mode: u32) -> IoResult<()> {
        defaults::chmod_default(ctx, ocb, mode)
    }

    fn chown(
        &self,
        ctx: &Context,
        ocb: &Arc<Ocb>,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> IoResult<()> {
        defaults::chown_default(ctx, ocb, uid, gid)
    }

    fn utime(&self, ctx: &Context, ocb: &Arc<Ocb>, times: Option<UtimeTimes>) -> IoResult<()> {
        defaults::utime_default(ctx, ocb, times)
    }

    fn devctl(&self, ctx: &Context, ocb: &Arc<Ocb>, cmd: DevctlCmd) -> IoResult<i64> {
        defaults::devctl_default(ctx, ocb, cmd)
    }

    fn sync(&self, ctx: &Context, ocb: &Arc<Ocb>, data_only: bool) -> IoResult<()> {
        defaults::sync_default(ctx, ocb, self.driver(), data_only)
    }

    fn power(&self, ctx: &Context, ocb: &Arc<Ocb>, cmd: PowerCmd) -> IoResult<PowerMode> {
        defaults::power_default(ctx, ocb, cmd)
    }

    fn mmap(
        &self,
        ctx: &Context,
        ocb: &Arc<Ocb>,
        prot: MmapProt,
        shared: bool,
        offset: u64,
        len: u64,
    ) -> IoResult<()> {
        defaults::mmap_default(ctx, ocb, prot, shared, offset, len)
    }

    fn space(
        &self,
        ctx: &Context,
        ocb: &Arc<Ocb>,
        op: SpaceOp,
        whence: Whence,
        start: i64,
        len: u64,
    ) -> IoResult<u64> {
        defaults::space_default(ctx, ocb, self.driver(), op, whence, start, len)
    }

    fn lock(
        &self,
        ctx: &Context,
        ocb: &Arc<Ocb>,
        req: &LockRequest,
    ) -> IoResult<Outcome<Option<ByteLock>>> {
        defaults::lock_default(ctx, ocb, req)
    }

    fn unblock(&self, ctx: &Context, attr: &Attr, rcvid: RcvId) -> IoResult<bool> {
        defaults::unblock_default(ctx, attr, rcvid)
    }

    fn close_dup(&self, ctx: &Context, ocb: &Arc<Ocb>) -> IoResult<Option<CloseFlags>> {
        defaults::close_dup_default(ctx, ocb, self.driver())
    }

    fn notify(&self, ctx: &Context, ocb: &Arc<Ocb>, req: &NotifyRequest) -> IoResult<NotifyReply> {
        defaults::notify_default(ctx, ocb, self.driver(), req)
    }

    fn openfd(
        &self,
        ctx: &Context,
        ocb: &Arc<Ocb>,
        oflag: i32,
        share: ShareMode,
        target_pid: u32,
    ) -> IoResult<Arc<Ocb>> {
        defaults::openfd_default(ctx, ocb, oflag, share, target_pid)
    }

    fn fdinfo(&self, ctx: &Context, ocb: &Arc<Ocb>) -> IoResult<FdInfo> {
        defaults::fdinfo_default(ctx, ocb)
    }

    fn pathconf(&self, ctx: &Context, ocb: &Arc<Ocb>, name: PathconfName) -> IoResult<i64> {
        defaults::pathconf_default(ctx, ocb, name)
    }

    fn acl(&self, ctx: &Context, ocb: &Arc<Ocb>, cmd: &AclCmd) -> IoResult<Vec<AclEntry>> {
        defaults::acl_default(ctx, ocb, cmd)
    }
}

/// Handler that uses the built-in semantics for every operation
#[derive(Debug, Default)]
pub struct DefaultHandler<D> {
    driver: D,
}

impl<D: Driver> DefaultHandler<D> {
    pub fn new(driver: D) -> Self {
        Self { driver }
    }

    pub fn inner(&self) -> &D {
        &self.driver
    }
}

impl<D: Driver> IoHandler for DefaultHandler<D> {
    fn driver(&self) -> &dyn Driver {
        &self.driver
    }
}
