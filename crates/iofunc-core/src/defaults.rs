// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Built-in semantics for every message a resource manager receives
//!
//! Each handler takes the attribute lock for the duration of its work and
//! leaves through the guard, so the lock is released on every path. Handlers
//! that may not answer immediately return [`Outcome::Deferred`] after
//! parking the request; the reply then goes out through the transport.

use std::sync::Arc;

use crate::ability::Ability;
use crate::acl::{Acl, AclEntry, AclSubject, PosixAcl};
use crate::attr::{Attr, AttrFlags, AttrState, BlockedRead, MmapEntry, MmapProt, PowerMode};
use crate::context::Context;
use crate::driver::{Driver, NodeInfo, ReadOutcome};
use crate::error::{IoFuncError, IoResult};
use crate::lock::{ByteLock, LockCmd, LockKind, LockRequest, LockRequestState, PendingLock};
use crate::messages::{
    AclCmd, DevctlCmd, OpenRequest, PathconfName, PowerCmd, Response, SpaceOp, UtimeTimes,
};
use crate::notify::{NotifyChannel, NotifyCond, NotifyDelivery, NotifyReply, NotifyRequest};
use crate::ocb::{ocb_attach, ocb_calloc, ocb_detach, ocb_free, CloseFlags, Ocb, OcbFlags};
use crate::types::{is_dir, Access, FdInfo, IoFlags, RcvId, ShareMode, Stat, Whence};

const SETID_BITS: u32 = (libc::S_ISUID | libc::S_ISGID) as u32;

/// Result of a handler that may defer its reply
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome<T> {
    Ready(T),
    /// Parked; the reply is sent later through [`crate::Transport`]
    Deferred,
}

fn deliver(ctx: &Context, deliveries: Vec<NotifyDelivery>) {
    for delivery in deliveries {
        ctx.transport.deliver_event(&delivery.waiter, delivery.cond);
    }
}

fn reply_granted(ctx: &Context, granted: Vec<PendingLock>) {
    for waiter in granted {
        ctx.transport.reply(waiter.rcvid, Response::Ok);
    }
}

fn is_owner_or_root(ctx: &Context, state: &AttrState) -> bool {
    ctx.client.is_root() || ctx.client.uid == state.uid
}

/// Mandatory locking applies to files with set-group-id but no group execute.
fn mandatory_locking(state: &AttrState) -> bool {
    state.mode & libc::S_ISGID as u32 != 0
        && state.mode & libc::S_IXGRP as u32 == 0
        && !is_dir(state.mode)
}

fn check_mandatory(
    ocb: &Ocb,
    state: &AttrState,
    kind: LockKind,
    start: u64,
    len: usize,
) -> IoResult<()> {
    if len == 0 || !mandatory_locking(state) {
        return Ok(());
    }
    let span = ByteLock {
        owner: ocb.id(),
        pid: ocb.pid(),
        kind,
        start,
        end: start.saturating_add(len as u64 - 1),
    };
    if state.locks.conflict(&span).is_some() {
        return Err(IoFuncError::WouldBlock);
    }
    Ok(())
}

/// Decide whether the sender may access the node as `access`.
pub fn check_access(ctx: &Context, attr: &Attr, state: &AttrState, access: Access) -> IoResult<()> {
    let mount = attr.mount();
    let policy = &mount.config().security;
    if !policy.enforce_permissions {
        return Ok(());
    }
    let client = &ctx.client;
    if client.is_root() && policy.root_bypass {
        if access.exec && !is_dir(state.mode) && state.mode & 0o111 == 0 {
            return Err(IoFuncError::AccessDenied);
        }
        return Ok(());
    }

    let mut access = access;
    if access.read && ctx.has_ability(Ability::Read) {
        access.read = false;
    }
    let wanted = access.bits();
    if wanted == 0 {
        return Ok(());
    }

    if mount.config().conf.acl {
        if let Some(acl) = &state.acl {
            let subject = AclSubject {
                uid: state.uid,
                gid: state.gid,
            };
            return if acl.check(subject, client, access)? {
                Ok(())
            } else {
                Err(IoFuncError::AccessDenied)
            };
        }
    }

    let granted = if client.uid == state.uid {
        (state.mode >> 6) & 0o7
    } else if client.in_group(state.gid) {
        (state.mode >> 3) & 0o7
    } else {
        state.mode & 0o7
    };
    if granted & wanted == wanted {
        Ok(())
    } else {
        Err(IoFuncError::AccessDenied)
    }
}

/// Check permissions, build and attach an OCB for `req`.
pub fn open_default(
    ctx: &Context,
    attr: &Arc<Attr>,
    driver: &dyn Driver,
    req: &OpenRequest,
) -> IoResult<Arc<Ocb>> {
    let ioflag = IoFlags::from_oflag(req.oflag);
    let guard = attr.lock();
    {
        let state = guard.state();
        if ioflag.intersects(IoFlags::WRITE | IoFlags::TRUNC) {
            attr.check_writable(&state)?;
        }
        check_access(ctx, attr, &state, Access::for_ioflags(ioflag))?;
        if is_dir(state.mode) && ioflag.contains(IoFlags::WRITE) {
            return Err(IoFuncError::IsDirectory);
        }
    }

    let ocb = ocb_calloc(ctx, attr, req)?;
    if let Err(err) = ocb_attach(ctx, &ocb) {
        ocb_free(ocb);
        return Err(err);
    }

    if ioflag.contains(IoFlags::TRUNC | IoFlags::WRITE) {
        let mut state = guard.state();
        if state.size != 0 {
            driver.resize(&NodeInfo::of(attr.ino(), &state), 0)?;
            state.size = 0;
            state.flags |= AttrFlags::DIRTY_SIZE;
        }
        state.flags |= AttrFlags::MTIME | AttrFlags::CTIME;
    }
    Ok(ocb)
}

/// The handle must have been opened for reading.
pub fn read_verify(_ctx: &Context, ocb: &Ocb) -> IoResult<()> {
    if !ocb.can_read() {
        return Err(IoFuncError::BadFileDescriptor);
    }
    Ok(())
}

/// The handle must have been opened for writing and the node be writable.
pub fn write_verify(_ctx: &Context, ocb: &Ocb, state: &AttrState) -> IoResult<()> {
    if !ocb.can_write() {
        return Err(IoFuncError::BadFileDescriptor);
    }
    ocb.attr().check_writable(state)
}

pub fn read_default(
    ctx: &Context,
    ocb: &Arc<Ocb>,
    driver: &dyn Driver,
    nbytes: usize,
    offset: Option<u64>,
) -> IoResult<Outcome<Vec<u8>>> {
    read_verify(ctx, ocb)?;
    let attr = ocb.attr();
    let guard = attr.lock();
    let mut state = guard.state();
    let pos = offset.unwrap_or_else(|| ocb.offset());
    check_mandatory(ocb, &state, LockKind::Read, pos, nbytes)?;
    if nbytes == 0 {
        return Ok(Outcome::Ready(Vec::new()));
    }

    let node = NodeInfo::of(attr.ino(), &state);
    match driver.read_at(&node, pos, nbytes)? {
        ReadOutcome::Data(data) => {
            if offset.is_none() && !node.is_fifo() {
                ocb.set_offset(pos + data.len() as u64);
            }
            if !attr.mount().config().conf.noatime {
                state.flags |= AttrFlags::ATIME;
            }
            Ok(Outcome::Ready(data))
        }
        ReadOutcome::WouldBlock if ocb.ioflag().contains(IoFlags::NONBLOCK) => {
            Err(IoFuncError::WouldBlock)
        }
        ReadOutcome::WouldBlock => {
            state.blocked_reads.push(
                ctx.rcvid,
                ctx.key(),
                BlockedRead {
                    ocb: Arc::clone(ocb),
                    nbytes,
                },
            );
            Ok(Outcome::Deferred)
        }
    }
}

/// Serve parked readers until the driver runs dry.
fn wake_readers(
    ctx: &Context,
    attr: &Attr,
    state: &mut AttrState,
    driver: &dyn Driver,
) -> IoResult<()> {
    while let Some(waiter) = state.blocked_reads.pop() {
        let node = NodeInfo::of(attr.ino(), state);
        let reader = &waiter.data.ocb;
        match driver.read_at(&node, reader.offset(), waiter.data.nbytes)? {
            ReadOutcome::Data(data) => {
                if !node.is_fifo() {
                    reader.set_offset(reader.offset() + data.len() as u64);
                }
                state.flags |= AttrFlags::ATIME;
                ctx.transport.reply(waiter.rcvid, Response::Data { data });
            }
            ReadOutcome::WouldBlock => {
                state.blocked_reads.requeue_front(waiter);
                break;
            }
        }
    }
    Ok(())
}

fn notify_input(ctx: &Context, attr: &Attr, state: &mut AttrState, driver: &dyn Driver) {
    let node = NodeInfo::of(attr.ino(), state);
    let count = driver.input_count(&node);
    if state.notify.input_check(count, true) {
        let deliveries = state.notify.trigger(NotifyChannel::Input, count);
        deliver(ctx, deliveries);
    }
}

pub fn write_default(
    ctx: &Context,
    ocb: &Arc<Ocb>,
    driver: &dyn Driver,
    data: &[u8],
    offset: Option<u64>,
) -> IoResult<usize> {
    let attr = ocb.attr();
    let guard = attr.lock();
    let mut state = guard.state();
    write_verify(ctx, ocb, &state)?;
    let ioflag = ocb.ioflag();
    let pos = if ioflag.contains(IoFlags::APPEND) {
        state.size
    } else {
        offset.unwrap_or_else(|| ocb.offset())
    };
    check_mandatory(ocb, &state, LockKind::Write, pos, data.len())?;
    if data.is_empty() {
        return Ok(0);
    }
    let end = pos
        .checked_add(data.len() as u64)
        .filter(|end| *end <= attr.mount().offset_width().max_offset())
        .ok_or(IoFuncError::InvalidArgument)?;

    let node = NodeInfo::of(attr.ino(), &state);
    let written = driver.write_at(&node, pos, data)?;
    let end = end - (data.len() - written) as u64;
    if !node.is_fifo() {
        if end > state.size {
            state.size = end;
            state.flags |= AttrFlags::DIRTY_SIZE;
        }
        if offset.is_none() || ioflag.contains(IoFlags::APPEND) {
            ocb.set_offset(end);
        }
    }
    state.flags |= AttrFlags::MTIME | AttrFlags::CTIME;

    if ioflag.intersects(IoFlags::SYNC | IoFlags::DSYNC) {
        state.time_update();
        let dirty = state.dirty();
        let flushed = driver.flush(&NodeInfo::of(attr.ino(), &state), dirty)?;
        state.clear_dirty(flushed);
    }

    wake_readers(ctx, attr, &mut state, driver)?;
    notify_input(ctx, attr, &mut state, driver);
    Ok(written)
}

/// Move the handle offset. `lseek(0, Cur)` only reports it.
pub fn lseek_default(_ctx: &Context, ocb: &Ocb, offset: i64, whence: Whence) -> IoResult<u64> {
    let attr = ocb.attr();
    let guard = attr.lock();
    let base = match whence {
        Whence::Set => 0,
        Whence::Cur => ocb.offset(),
        Whence::End => guard.state().size,
    };
    let target = i128::from(base) + i128::from(offset);
    let max = attr.mount().offset_width().max_offset();
    if target < 0 || target > i128::from(max) {
        return Err(IoFuncError::InvalidArgument);
    }
    let target = target as u64;
    ocb.set_offset(target);
    Ok(target)
}

pub fn stat_default(_ctx: &Context, ocb: &Ocb) -> IoResult<Stat> {
    let attr = ocb.attr();
    let mount = attr.mount();
    let guard = attr.lock();
    let mut state = guard.state();
    state.time_update();
    let mut mode = state.mode;
    if mount.config().conf.acl {
        if let Some(acl) = &state.acl {
            mode = acl.stat_mode(mode)?;
        }
    }
    let blksize = mount.block_size();
    Ok(Stat {
        ino: attr.ino().0,
        size: state.size,
        dev: mount.dev(),
        rdev: state.rdev,
        uid: state.uid,
        gid: state.gid,
        mode,
        nlink: state.nlink,
        atime: state.atime,
        mtime: state.mtime,
        ctime: state.ctime,
        blksize,
        blocks: state.size.div_ceil(u64::from(blksize)),
    })
}

pub fn chmod_default(ctx: &Context, ocb: &Ocb, mode: u32) -> IoResult<()> {
    let attr = ocb.attr();
    let guard = attr.lock();
    let mut state = guard.state();
    attr.check_writable(&state)?;
    if !is_owner_or_root(ctx, &state) {
        return Err(IoFuncError::NotPermitted);
    }
    let mut perms = mode & 0o7777;
    if !ctx.client.is_root() && !ctx.client.in_group(state.gid) {
        perms &= !(libc::S_ISGID as u32);
    }
    let new_mode = (state.mode & libc::S_IFMT as u32) | perms;
    if let Some(acl) = &state.acl {
        let updated = acl.with_mode(new_mode)?;
        state.acl = Some(updated);
        state.flags |= AttrFlags::DIRTY_ACL;
    }
    state.mode = new_mode;
    state.flags |= AttrFlags::DIRTY_MODE | AttrFlags::CTIME;
    Ok(())
}

/// Change ownership.
///
/// Root and holders of the chown ability may give the node to anyone.
/// Otherwise only the owner may act, and with restricted chown only to a
/// group it belongs to. Unprivileged changes clear set-id bits.
pub fn chown_default(ctx: &Context, ocb: &Ocb, uid: Option<u32>, gid: Option<u32>) -> IoResult<()> {
    let attr = ocb.attr();
    let restricted = attr.mount().config().conf.chown_restricted;
    let privileged = ctx.client.is_root() || ctx.has_ability(Ability::Chown);
    let guard = attr.lock();
    let mut state = guard.state();
    attr.check_writable(&state)?;

    let new_uid = uid.unwrap_or(state.uid);
    let new_gid = gid.unwrap_or(state.gid);
    if !privileged {
        if ctx.client.uid != state.uid {
            return Err(IoFuncError::NotPermitted);
        }
        if restricted && new_uid != state.uid {
            return Err(IoFuncError::NotPermitted);
        }
        if restricted && new_gid != state.gid && !ctx.client.in_group(new_gid) {
            return Err(IoFuncError::NotPermitted);
        }
    }

    if (new_uid, new_gid) != (state.uid, state.gid) {
        state.uid = new_uid;
        state.gid = new_gid;
        state.flags |= AttrFlags::DIRTY_OWNER;
    }
    if !ctx.client.is_root() && state.mode & SETID_BITS != 0 {
        state.mode &= !SETID_BITS;
        state.flags |= AttrFlags::DIRTY_MODE;
    }
    state.flags |= AttrFlags::CTIME;
    tracing::debug!(
        ino = attr.ino().0,
        uid = new_uid,
        gid = new_gid,
        privileged,
        "ownership changed"
    );
    Ok(())
}

pub fn utime_default(ctx: &Context, ocb: &Ocb, times: Option<UtimeTimes>) -> IoResult<()> {
    let attr = ocb.attr();
    let guard = attr.lock();
    let mut state = guard.state();
    attr.check_writable(&state)?;
    match times {
        Some(times) => {
            if !is_owner_or_root(ctx, &state) {
                return Err(IoFuncError::NotPermitted);
            }
            state.atime = times.atime;
            state.mtime = times.mtime;
            state.flags |= AttrFlags::DIRTY_ATIME | AttrFlags::DIRTY_MTIME | AttrFlags::CTIME;
        }
        None => {
            if !is_owner_or_root(ctx, &state) {
                check_access(ctx, attr, &state, Access::WRITE)?;
            }
            state.flags |= AttrFlags::ATIME | AttrFlags::MTIME | AttrFlags::CTIME;
        }
    }
    state.time_update();
    Ok(())
}

pub fn devctl_default(_ctx: &Context, ocb: &Ocb, cmd: DevctlCmd) -> IoResult<i64> {
    match cmd {
        DevctlCmd::GetFlags => Ok(i64::from(ocb.ioflag().to_oflag())),
        DevctlCmd::SetFlags { flags } => {
            ocb.set_status_flags(IoFlags::from_oflag(flags));
            Ok(0)
        }
        DevctlCmd::GetMountFlags => Ok(i64::from(ocb.attr().mount().flags().bits())),
        DevctlCmd::Other { .. } => Err(IoFuncError::NotTty),
    }
}

/// Stamp pending times and hand the dirty bits to the driver.
pub fn sync_default(
    _ctx: &Context,
    ocb: &Ocb,
    driver: &dyn Driver,
    data_only: bool,
) -> IoResult<()> {
    let attr = ocb.attr();
    let guard = attr.lock();
    let mut state = guard.state();
    state.time_update();
    let mut dirty = state.dirty();
    if data_only {
        dirty &= AttrFlags::DIRTY_SIZE | AttrFlags::DIRTY_MTIME;
    }
    if dirty.is_empty() {
        return Ok(());
    }
    let flushed = driver.flush(&NodeInfo::of(attr.ino(), &state), dirty)?;
    state.clear_dirty(flushed);
    tracing::debug!(ino = attr.ino().0, ?flushed, "attribute flushed");
    Ok(())
}

pub fn power_default(ctx: &Context, ocb: &Ocb, cmd: PowerCmd) -> IoResult<PowerMode> {
    let guard = ocb.attr().lock();
    let mut state = guard.state();
    match cmd {
        PowerCmd::Get => Ok(state.power),
        PowerCmd::Set { mode } => {
            if !ocb.can_write() && !is_owner_or_root(ctx, &state) {
                return Err(IoFuncError::NotPermitted);
            }
            state.power = mode;
            Ok(mode)
        }
    }
}

/// Record a mapping after checking it against the handle's access mode.
pub fn mmap_default(
    _ctx: &Context,
    ocb: &Ocb,
    prot: MmapProt,
    shared: bool,
    offset: u64,
    len: u64,
) -> IoResult<()> {
    if len == 0 {
        return Err(IoFuncError::InvalidArgument);
    }
    if !ocb.can_read() || (prot.contains(MmapProt::WRITE) && shared && !ocb.can_write()) {
        return Err(IoFuncError::AccessDenied);
    }
    let attr = ocb.attr();
    let guard = attr.lock();
    let mut state = guard.state();
    if prot.contains(MmapProt::WRITE) && shared {
        attr.check_writable(&state)?;
    }
    state.mmaps.push(MmapEntry {
        ocb: ocb.id(),
        prot,
        shared,
        offset,
        len,
    });
    if !attr.mount().config().conf.noatime {
        state.flags |= AttrFlags::ATIME;
    }
    ocb.set_flags(OcbFlags::MMAP);
    Ok(())
}

/// Allocate or free a byte range. Returns the resulting size.
pub fn space_default(
    ctx: &Context,
    ocb: &Ocb,
    driver: &dyn Driver,
    op: SpaceOp,
    whence: Whence,
    start: i64,
    len: u64,
) -> IoResult<u64> {
    let attr = ocb.attr();
    let guard = attr.lock();
    let mut state = guard.state();
    write_verify(ctx, ocb, &state)?;
    let base = match whence {
        Whence::Set => 0,
        Whence::Cur => ocb.offset(),
        Whence::End => state.size,
    };
    let first = i128::from(base) + i128::from(start);
    if first < 0 {
        return Err(IoFuncError::InvalidArgument);
    }
    let first = first as u64;
    let len = if op == SpaceOp::Free && len == 0 {
        state.size.saturating_sub(first)
    } else {
        len
    };
    let end = first
        .checked_add(len)
        .filter(|end| *end <= attr.mount().offset_width().max_offset())
        .ok_or(IoFuncError::InvalidArgument)?;

    let node = NodeInfo::of(attr.ino(), &state);
    let new_size = match op {
        SpaceOp::Allocate if end > state.size => {
            driver.resize(&node, end)?;
            end
        }
        SpaceOp::Allocate => state.size,
        SpaceOp::Free if first >= state.size || len == 0 => state.size,
        SpaceOp::Free if end >= state.size => {
            driver.resize(&node, first)?;
            first
        }
        SpaceOp::Free => {
            driver.zero_range(&node, first, len)?;
            state.size
        }
    };
    if new_size != state.size {
        state.size = new_size;
        state.flags |= AttrFlags::DIRTY_SIZE;
    }
    state.flags |= AttrFlags::MTIME | AttrFlags::CTIME;
    Ok(new_size)
}

/// Create a second OCB on the same node with at most the handle's access.
///
/// Handing the OCB to another process needs the dup ability.
pub fn openfd_default(
    ctx: &Context,
    ocb: &Ocb,
    oflag: i32,
    share: ShareMode,
    target_pid: u32,
) -> IoResult<Arc<Ocb>> {
    let requested = IoFlags::from_oflag(oflag);
    let access = IoFlags::READ | IoFlags::WRITE;
    if !((requested & access) - ocb.ioflag()).is_empty() {
        return Err(IoFuncError::AccessDenied);
    }
    if target_pid != ctx.client.pid && !ctx.has_ability(Ability::Dup) {
        return Err(IoFuncError::NotPermitted);
    }
    let attr = Arc::clone(ocb.attr());
    let id = attr.mount().allocate_ocb_id();
    let flags = ocb.flags() & OcbFlags::PRIVILEGED;
    let new_ocb = Arc::new(Ocb::with_ioflag(id, attr, target_pid, requested, share, flags));
    if let Err(err) = ocb_attach(ctx, &new_ocb) {
        ocb_free(new_ocb);
        return Err(err);
    }
    new_ocb.set_offset(ocb.offset());
    Ok(new_ocb)
}

pub fn fdinfo_default(_ctx: &Context, ocb: &Ocb) -> IoResult<FdInfo> {
    let guard = ocb.attr().lock();
    let state = guard.state();
    let counts = state.counts();
    Ok(FdInfo {
        ioflag: ocb.ioflag(),
        offset: ocb.offset(),
        size: state.size,
        share: ocb.share(),
        count: counts.open,
        rcount: counts.readers,
        wcount: counts.writers,
        rlocks: counts.read_locks,
        wlocks: counts.write_locks,
        mmaps: state.mmaps.iter().filter(|m| m.ocb == ocb.id()).count() as u32,
        byte_locks: state.locks.owned_by(ocb.id()) as u32,
    })
}

/// `pathconf` values; -1 means the option is not in effect.
pub fn pathconf_default(_ctx: &Context, ocb: &Ocb, name: PathconfName) -> IoResult<i64> {
    let config = ocb.attr().mount().config();
    let flag = |on: bool| if on { 1 } else { -1 };
    Ok(match name {
        PathconfName::LinkMax => i64::from(u16::MAX),
        PathconfName::NameMax => config.name_max as i64,
        PathconfName::ChownRestricted => flag(config.conf.chown_restricted),
        PathconfName::NoTrunc => flag(config.conf.no_trunc),
        PathconfName::SyncIo => flag(config.conf.sync_io),
        PathconfName::AclExtended => i64::from(config.conf.acl),
        PathconfName::FileSizeBits => match config.offset_width {
            crate::config::OffsetWidth::Bits32 => 32,
            crate::config::OffsetWidth::Bits64 => 64,
        },
    })
}

pub fn acl_default(ctx: &Context, ocb: &Ocb, cmd: &AclCmd) -> IoResult<Vec<AclEntry>> {
    let attr = ocb.attr();
    if !attr.mount().config().conf.acl {
        return Err(IoFuncError::NotSupported);
    }
    let guard = attr.lock();
    let mut state = guard.state();
    match cmd {
        AclCmd::Get => match &state.acl {
            Some(acl) => acl.entries(),
            None => Acl::from_mode(Arc::new(PosixAcl), state.mode)?.entries(),
        },
        AclCmd::Set { entries } => {
            attr.check_writable(&state)?;
            if !is_owner_or_root(ctx, &state) {
                return Err(IoFuncError::NotPermitted);
            }
            let funcs = match &state.acl {
                Some(acl) => Arc::clone(acl.funcs()),
                None => Arc::new(PosixAcl),
            };
            let acl = Acl::from_entries(funcs, entries)?;
            let mode = acl.stat_mode(state.mode)?;
            let stored = acl.entries()?;
            state.acl = Some(acl);
            if mode != state.mode {
                state.mode = mode;
                state.flags |= AttrFlags::DIRTY_MODE;
            }
            state.flags |= AttrFlags::DIRTY_ACL | AttrFlags::CTIME;
            Ok(stored)
        }
        AclCmd::Delete => {
            attr.check_writable(&state)?;
            if !is_owner_or_root(ctx, &state) {
                return Err(IoFuncError::NotPermitted);
            }
            if state.acl.take().is_some() {
                state.flags |= AttrFlags::DIRTY_ACL | AttrFlags::CTIME;
            }
            Ok(Vec::new())
        }
    }
}

/// Record-lock request. `GetLock` reports the first conflict; a waiting
/// set that conflicts is parked until the range frees up or it is unblocked.
pub fn lock_default(
    ctx: &Context,
    ocb: &Ocb,
    req: &LockRequest,
) -> IoResult<Outcome<Option<ByteLock>>> {
    let attr = ocb.attr();
    let guard = attr.lock();
    let mut state = guard.state();
    let (start, end) = req.range(ocb.offset(), state.size)?;

    let Some(kind) = req.kind else {
        if req.cmd == LockCmd::GetLock {
            return Err(IoFuncError::InvalidArgument);
        }
        let granted = state.locks.release(ocb.id(), start, end);
        reply_granted(ctx, granted);
        return Ok(Outcome::Ready(None));
    };
    match kind {
        LockKind::Read if !ocb.can_read() => return Err(IoFuncError::BadFileDescriptor),
        LockKind::Write if !ocb.can_write() => return Err(IoFuncError::BadFileDescriptor),
        _ => {}
    }
    let candidate = ByteLock {
        owner: ocb.id(),
        pid: ocb.pid(),
        kind,
        start,
        end,
    };
    match req.cmd {
        LockCmd::GetLock => Ok(Outcome::Ready(state.locks.test(&candidate))),
        LockCmd::SetLock => {
            state.locks.acquire(candidate, None)?;
            Ok(Outcome::Ready(None))
        }
        LockCmd::SetLockWait => {
            match state.locks.acquire(candidate, Some((ctx.rcvid, ctx.key())))? {
                LockRequestState::Pending => Ok(Outcome::Deferred),
                _ => Ok(Outcome::Ready(None)),
            }
        }
    }
}

/// Cancel a request the sending client parked as `rcvid`. The client gets
/// `EINTR` exactly once; returns false when the request had already been
/// answered or was parked by someone else.
pub fn unblock_default(ctx: &Context, attr: &Attr, rcvid: RcvId) -> IoResult<bool> {
    let guard = attr.lock();
    let mut state = guard.state();
    let pid = ctx.client.pid;
    let cancelled = state.locks.cancel(rcvid, pid).is_some()
        || state.blocked_reads.take(rcvid, pid).is_some();
    if cancelled {
        ctx.transport.reply(rcvid, Response::from(IoFuncError::Interrupted));
    }
    Ok(cancelled)
}

/// A connection sharing `ocb` closed. Locks and counts stay until the last
/// sharing handle goes. Returns the close flags when the OCB itself closed.
pub fn close_dup_default(
    ctx: &Context,
    ocb: &Arc<Ocb>,
    driver: &dyn Driver,
) -> IoResult<Option<CloseFlags>> {
    {
        let guard = ocb.attr().lock();
        guard.state().notify.remove(ctx.key());
    }
    if ocb.drop_handle() > 0 {
        return Ok(None);
    }
    close_ocb_default(ctx, ocb, driver).map(Some)
}

/// Final close: force-release the handle's locks and mappings, answer its
/// parked requests, detach and free it.
pub fn close_ocb_default(
    ctx: &Context,
    ocb: &Arc<Ocb>,
    driver: &dyn Driver,
) -> IoResult<CloseFlags> {
    let attr = ocb.attr();
    let guard = attr.lock();
    {
        let mut state = guard.state();
        let granted = state.locks.release_owner(ocb.id());
        reply_granted(ctx, granted);
        for pending in state.locks.cancel_owner(ocb.id()) {
            ctx.transport.reply(pending.rcvid, Response::from(IoFuncError::BadFileDescriptor));
        }
        for waiter in state.blocked_reads.drain_where(|w| w.data.ocb.id() == ocb.id()) {
            ctx.transport.reply(waiter.rcvid, Response::from(IoFuncError::BadFileDescriptor));
        }
        state.mmaps.retain(|m| m.ocb != ocb.id());
    }

    let closed = ocb_detach(ctx, ocb);
    {
        let mut state = guard.state();
        if closed.contains(CloseFlags::LAST_WRITER) && crate::types::is_fifo(state.mode) {
            // readers waiting on a FIFO with no writers see end of file
            for waiter in state.blocked_reads.drain_where(|_| true) {
                ctx.transport.reply(waiter.rcvid, Response::Data { data: Vec::new() });
            }
            let deliveries = state.notify.trigger_cond(NotifyCond::HUP);
            deliver(ctx, deliveries);
        }
        if closed.contains(CloseFlags::LAST_INUSE) {
            state.time_update();
            if !state.dirty().is_empty() {
                let node = NodeInfo::of(attr.ino(), &state);
                let dirty = state.dirty();
                let flushed = driver.flush(&node, dirty)?;
                state.clear_dirty(flushed);
            }
        }
    }
    drop(guard);
    ocb_free(Arc::clone(ocb));
    Ok(closed)
}

/// Register or poll for readiness on the handle's node.
pub fn notify_default(
    ctx: &Context,
    ocb: &Ocb,
    driver: &dyn Driver,
    req: &NotifyRequest,
) -> IoResult<NotifyReply> {
    let attr = ocb.attr();
    let guard = attr.lock();
    let mut state = guard.state();
    let node = NodeInfo::of(attr.ino(), &state);
    let mut trig = driver.readiness(&node);
    if node.is_fifo() && node.writers == 0 && state.counts().open > 0 && ocb.can_read() {
        trig |= NotifyCond::HUP;
    }
    let reply = state.notify.notify(ctx.key(), ctx.rcvid, req, trig, [1, 1, 1]);
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ability::{AbilityTable, StaticAbilities, CHOWN_ABILITY};
    use crate::config::{MountConfig, OffsetWidth};
    use crate::driver::MemDriver;
    use crate::mount::Mount;
    use crate::notify::NotifyAction;
    use crate::transport::QueueTransport;
    use crate::types::ClientInfo;

    struct Fixture {
        abilities: Arc<StaticAbilities>,
        table: Arc<AbilityTable>,
        transport: Arc<QueueTransport>,
        mount: Arc<Mount>,
        driver: MemDriver,
    }

    impl Fixture {
        fn new(config: MountConfig) -> Self {
            let abilities = Arc::new(StaticAbilities::new());
            let table = AbilityTable::init(Box::new(Arc::clone(&abilities))).expect("abilities");
            let table = Arc::new(table);
            Self {
                abilities,
                table,
                transport: Arc::new(QueueTransport::new()),
                mount: Mount::new(config),
                driver: MemDriver::new(),
            }
        }

        fn ctx(&self, rcvid: u64, client: &ClientInfo) -> Context {
            Context::new(
                RcvId(rcvid),
                1,
                client.clone(),
                Arc::clone(&self.table),
                self.transport.clone(),
            )
        }

        fn node(&self, mode: u32, owner: &ClientInfo) -> Arc<Attr> {
            Attr::init(&self.mount, mode, None, owner)
        }

        fn open(&self, ctx: &Context, attr: &Arc<Attr>, oflag: i32) -> IoResult<Arc<Ocb>> {
            let req = OpenRequest {
                path: "node".into(),
                oflag,
                share: ShareMode::DenyNone,
                mode: 0,
            };
            open_default(ctx, attr, &self.driver, &req)
        }
    }

    fn owner() -> ClientInfo {
        ClientInfo::new(10, 1000, 1000)
    }

    fn stranger() -> ClientInfo {
        ClientInfo::new(20, 2000, 2000)
    }

    const FILE: u32 = libc::S_IFREG as u32;

    #[test]
    fn access_follows_mode_triplets() {
        let fx = Fixture::new(MountConfig::default());
        let attr = fx.node(FILE | 0o640, &owner());
        let guard = attr.lock();
        let state = guard.state();
        assert!(check_access(&fx.ctx(1, &owner()), &attr, &state, Access::WRITE).is_ok());
        let member = ClientInfo::new(30, 3000, 1000);
        assert!(check_access(&fx.ctx(1, &member), &attr, &state, Access::READ).is_ok());
        assert!(matches!(
            check_access(&fx.ctx(1, &member), &attr, &state, Access::WRITE),
            Err(IoFuncError::AccessDenied)
        ));
        assert!(check_access(&fx.ctx(1, &stranger()), &attr, &state, Access::READ).is_err());
        let root = ClientInfo::new(1, 0, 0);
        assert!(check_access(&fx.ctx(1, &root), &attr, &state, Access::WRITE).is_ok());
        assert!(check_access(&fx.ctx(1, &root), &attr, &state, Access::EXEC).is_err());

        fx.abilities.grant(20, crate::ability::READ_ABILITY);
        assert!(check_access(&fx.ctx(1, &stranger()), &attr, &state, Access::READ).is_ok());
    }

    #[test]
    fn read_write_advance_offset_and_stamp() {
        let fx = Fixture::new(MountConfig::default());
        let attr = fx.node(FILE | 0o644, &owner());
        let ctx = fx.ctx(1, &owner());
        let ocb = fx.open(&ctx, &attr, libc::O_RDWR).expect("open");

        assert_eq!(write_default(&ctx, &ocb, &fx.driver, b"hello world", None).unwrap(), 11);
        assert_eq!(ocb.offset(), 11);
        {
            let guard = attr.lock();
            let state = guard.state();
            assert_eq!(state.size, 11);
            let dirty = AttrFlags::DIRTY_SIZE | AttrFlags::MTIME | AttrFlags::CTIME;
            assert!(state.flags.contains(dirty));
        }

        assert_eq!(lseek_default(&ctx, &ocb, 6, Whence::Set).unwrap(), 6);
        assert_eq!(
            read_default(&ctx, &ocb, &fx.driver, 64, None).unwrap(),
            Outcome::Ready(b"world".to_vec())
        );
        assert_eq!(ocb.offset(), 11);
        assert_eq!(
            read_default(&ctx, &ocb, &fx.driver, 5, Some(0)).unwrap(),
            Outcome::Ready(b"hello".to_vec())
        );
        assert_eq!(ocb.offset(), 11, "explicit offset leaves the handle alone");
        assert!(attr.lock().state().flags.contains(AttrFlags::ATIME));
    }

    #[test]
    fn append_writes_at_end() {
        let fx = Fixture::new(MountConfig::default());
        let attr = fx.node(FILE | 0o644, &owner());
        let ctx = fx.ctx(1, &owner());
        let ocb = fx.open(&ctx, &attr, libc::O_WRONLY | libc::O_APPEND).expect("open");
        write_default(&ctx, &ocb, &fx.driver, b"ab", None).unwrap();
        lseek_default(&ctx, &ocb, 0, Whence::Set).unwrap();
        write_default(&ctx, &ocb, &fx.driver, b"cd", None).unwrap();
        assert_eq!(fx.driver.contents(attr.ino()), b"abcd");
    }

    #[test]
    fn verify_rejects_wrong_access_mode() {
        let fx = Fixture::new(MountConfig::default());
        let attr = fx.node(FILE | 0o644, &owner());
        let ctx = fx.ctx(1, &owner());
        let ro = fx.open(&ctx, &attr, libc::O_RDONLY).expect("open");
        assert!(matches!(
            write_default(&ctx, &ro, &fx.driver, b"x", None),
            Err(IoFuncError::BadFileDescriptor)
        ));
        let wo = fx.open(&ctx, &attr, libc::O_WRONLY).expect("open");
        assert!(matches!(
            read_default(&ctx, &wo, &fx.driver, 1, None),
            Err(IoFuncError::BadFileDescriptor)
        ));
    }

    #[test]
    fn read_only_mount_refuses_mutation_unless_synthetic() {
        let fx = Fixture::new(MountConfig {
            read_only: true,
            ..MountConfig::default()
        });
        let attr = fx.node(FILE | 0o666, &owner());
        let ctx = fx.ctx(1, &owner());
        assert!(matches!(fx.open(&ctx, &attr, libc::O_RDWR), Err(IoFuncError::ReadOnly)));
        let ro = fx.open(&ctx, &attr, libc::O_RDONLY).expect("open read-only");
        assert!(matches!(chmod_default(&ctx, &ro, 0o600), Err(IoFuncError::ReadOnly)));

        attr.lock().state().flags |= AttrFlags::SYNTHETIC;
        let rw = fx.open(&ctx, &attr, libc::O_RDWR).expect("synthetic node is writable");
        write_default(&ctx, &rw, &fx.driver, b"ok", None).expect("write");
        chmod_default(&ctx, &rw, 0o600).expect("chmod");
    }

    #[test]
    fn lseek_validates_against_offset_width() {
        let fx = Fixture::new(MountConfig {
            offset_width: OffsetWidth::Bits32,
            ..MountConfig::default()
        });
        let attr = fx.node(FILE | 0o644, &owner());
        let ctx = fx.ctx(1, &owner());
        let ocb = fx.open(&ctx, &attr, libc::O_RDONLY).expect("open");
        lseek_default(&ctx, &ocb, 100, Whence::Set).unwrap();
        assert_eq!(lseek_default(&ctx, &ocb, 0, Whence::Cur).unwrap(), 100);
        assert_eq!(lseek_default(&ctx, &ocb, 0, Whence::Cur).unwrap(), 100);
        assert!(matches!(
            lseek_default(&ctx, &ocb, -101, Whence::Cur),
            Err(IoFuncError::InvalidArgument)
        ));
        assert!(matches!(
            lseek_default(&ctx, &ocb, i64::from(i32::MAX) + 1, Whence::Set),
            Err(IoFuncError::InvalidArgument)
        ));
        assert_eq!(ocb.offset(), 100);
    }

    #[test]
    fn chown_rules() {
        let fx = Fixture::new(MountConfig::default());
        let attr = fx.node(FILE | 0o4755, &owner());
        let owner_ctx = fx.ctx(1, &owner());
        let ocb = fx.open(&owner_ctx, &attr, libc::O_RDONLY).expect("open");

        // owner may not give the file away under restricted chown
        assert!(matches!(
            chown_default(&owner_ctx, &ocb, Some(2000), None),
            Err(IoFuncError::NotPermitted)
        ));
        let other_ctx = fx.ctx(2, &stranger());
        assert!(matches!(
            chown_default(&other_ctx, &ocb, None, Some(2000)),
            Err(IoFuncError::NotPermitted)
        ));

        // owner may move it to one of its groups; set-uid is cleared
        let member = ClientInfo {
            groups: vec![1000, 50],
            ..owner()
        };
        chown_default(&fx.ctx(3, &member), &ocb, None, Some(50)).expect("chgrp");
        {
            let guard = attr.lock();
            let state = guard.state();
            assert_eq!(state.gid, 50);
            assert_eq!(state.mode & SETID_BITS, 0);
            assert!(state.flags.contains(AttrFlags::DIRTY_OWNER | AttrFlags::DIRTY_MODE));
        }

        fx.abilities.grant(20, CHOWN_ABILITY);
        chown_default(&other_ctx, &ocb, Some(2000), Some(2000)).expect("privileged chown");
        assert_eq!(attr.lock().state().uid, 2000);
    }

    #[test]
    fn chmod_only_by_owner() {
        let fx = Fixture::new(MountConfig::default());
        let attr = fx.node(FILE | 0o644, &owner());
        let ctx = fx.ctx(1, &owner());
        let ocb = fx.open(&ctx, &attr, libc::O_RDONLY).expect("open");
        chmod_default(&ctx, &ocb, 0o600 | libc::S_IFDIR as u32).expect("chmod");
        assert_eq!(attr.lock().state().mode, FILE | 0o600);
        assert!(matches!(
            chmod_default(&fx.ctx(2, &stranger()), &ocb, 0o777),
            Err(IoFuncError::NotPermitted)
        ));
    }

    #[test]
    fn utime_explicit_and_now() {
        let fx = Fixture::new(MountConfig::default());
        let attr = fx.node(FILE | 0o666, &owner());
        let ctx = fx.ctx(1, &owner());
        let ocb = fx.open(&ctx, &attr, libc::O_RDONLY).expect("open");
        utime_default(&ctx, &ocb, Some(UtimeTimes { atime: 5, mtime: 7 })).expect("utime");
        {
            let guard = attr.lock();
            let state = guard.state();
            assert_eq!((state.atime, state.mtime), (5, 7));
            assert!(state.ctime > 7);
        }
        let other = fx.ctx(2, &stranger());
        assert!(matches!(
            utime_default(&other, &ocb, Some(UtimeTimes { atime: 1, mtime: 1 })),
            Err(IoFuncError::NotPermitted)
        ));
        utime_default(&other, &ocb, None).expect("world-writable file may be touched");
        assert!(attr.lock().state().mtime > 7);
    }

    #[test]
    fn devctl_flags() {
        let fx = Fixture::new(MountConfig::default());
        let attr = fx.node(FILE | 0o644, &owner());
        let ctx = fx.ctx(1, &owner());
        let ocb = fx.open(&ctx, &attr, libc::O_WRONLY).expect("open");
        assert_eq!(
            devctl_default(&ctx, &ocb, DevctlCmd::GetFlags).unwrap(),
            i64::from(libc::O_WRONLY)
        );
        devctl_default(&ctx, &ocb, DevctlCmd::SetFlags { flags: libc::O_NONBLOCK }).unwrap();
        assert!(ocb.ioflag().contains(IoFlags::NONBLOCK | IoFlags::WRITE));
        assert_eq!(devctl_default(&ctx, &ocb, DevctlCmd::GetMountFlags).unwrap(), 0);
        assert!(matches!(
            devctl_default(&ctx, &ocb, DevctlCmd::Other { code: 99 }),
            Err(IoFuncError::NotTty)
        ));
    }

    #[test]
    fn sync_clears_dirty_bits() {
        let fx = Fixture::new(MountConfig::default());
        let attr = fx.node(FILE | 0o644, &owner());
        let ctx = fx.ctx(1, &owner());
        let ocb = fx.open(&ctx, &attr, libc::O_RDWR).expect("open");
        write_default(&ctx, &ocb, &fx.driver, b"data", None).unwrap();
        sync_default(&ctx, &ocb, &fx.driver, false).unwrap();
        assert!(attr.lock().state().dirty().is_empty());
    }

    #[test]
    fn space_allocates_and_truncates() {
        let fx = Fixture::new(MountConfig::default());
        let attr = fx.node(FILE | 0o644, &owner());
        let ctx = fx.ctx(1, &owner());
        let ocb = fx.open(&ctx, &attr, libc::O_RDWR).expect("open");
        let space =
            |op, start, len| space_default(&ctx, &ocb, &fx.driver, op, Whence::Set, start, len);
        assert_eq!(space(SpaceOp::Allocate, 0, 1024).unwrap(), 1024);
        assert_eq!(space(SpaceOp::Free, 100, 0).unwrap(), 100);
        assert_eq!(fx.driver.contents(attr.ino()).len(), 100);
        assert!(matches!(
            space_default(&ctx, &ocb, &fx.driver, SpaceOp::Free, Whence::Set, -1, 0),
            Err(IoFuncError::InvalidArgument)
        ));
    }

    #[test]
    fn mmap_checks_access_and_is_reported() {
        let fx = Fixture::new(MountConfig::default());
        let attr = fx.node(FILE | 0o644, &owner());
        let ctx = fx.ctx(1, &owner());
        let ro = fx.open(&ctx, &attr, libc::O_RDONLY).expect("open");
        assert!(matches!(
            mmap_default(&ctx, &ro, MmapProt::READ | MmapProt::WRITE, true, 0, 4096),
            Err(IoFuncError::AccessDenied)
        ));
        let prot = MmapProt::READ | MmapProt::WRITE;
        mmap_default(&ctx, &ro, prot, false, 0, 4096).expect("private map");
        assert!(ro.flags().contains(OcbFlags::MMAP));
        assert_eq!(fdinfo_default(&ctx, &ro).unwrap().mmaps, 1);
        close_ocb_default(&ctx, &ro, &fx.driver).unwrap();
        assert!(attr.lock().state().mmaps.is_empty());
    }

    #[test]
    fn openfd_limits_access_and_cross_process_dup() {
        let fx = Fixture::new(MountConfig::default());
        let attr = fx.node(FILE | 0o644, &owner());
        let ctx = fx.ctx(1, &owner());
        let ro = fx.open(&ctx, &attr, libc::O_RDONLY).expect("open");
        assert!(matches!(
            openfd_default(&ctx, &ro, libc::O_RDWR, ShareMode::DenyNone, 10),
            Err(IoFuncError::AccessDenied)
        ));
        assert!(matches!(
            openfd_default(&ctx, &ro, libc::O_RDONLY, ShareMode::DenyNone, 99),
            Err(IoFuncError::NotPermitted)
        ));
        let copy =
            openfd_default(&ctx, &ro, libc::O_RDONLY, ShareMode::DenyNone, 10).expect("openfd");
        assert_ne!(copy.id(), ro.id());
        assert_eq!(attr.counts().open, 2);

        fx.abilities.grant(10, crate::ability::DUP_ABILITY);
        let foreign = openfd_default(&ctx, &ro, libc::O_RDONLY, ShareMode::DenyNone, 99)
            .expect("dup ability");
        assert_eq!(foreign.pid(), 99);
    }

    #[test]
    fn pathconf_reports_mount_bits() {
        let fx = Fixture::new(MountConfig::default());
        let attr = fx.node(FILE | 0o644, &owner());
        let ctx = fx.ctx(1, &owner());
        let ocb = fx.open(&ctx, &attr, libc::O_RDONLY).expect("open");
        assert_eq!(pathconf_default(&ctx, &ocb, PathconfName::NameMax).unwrap(), 255);
        assert_eq!(pathconf_default(&ctx, &ocb, PathconfName::ChownRestricted).unwrap(), 1);
        assert_eq!(pathconf_default(&ctx, &ocb, PathconfName::SyncIo).unwrap(), -1);
        assert_eq!(pathconf_default(&ctx, &ocb, PathconfName::FileSizeBits).unwrap(), 64);
    }

    #[test]
    fn acl_set_get_delete() {
        use crate::acl::AclTag;
        let mut config = MountConfig::default();
        config.conf.acl = true;
        let fx = Fixture::new(config);
        let attr = fx.node(FILE | 0o600, &owner());
        let ctx = fx.ctx(1, &owner());
        let ocb = fx.open(&ctx, &attr, libc::O_RDONLY).expect("open");

        let entries = vec![
            AclEntry::new(AclTag::UserObj, 0o6, 0),
            AclEntry::new(AclTag::User, 0o4, 2000),
            AclEntry::new(AclTag::GroupObj, 0o0, 0),
            AclEntry::new(AclTag::Mask, 0o4, 0),
            AclEntry::new(AclTag::Other, 0o0, 0),
        ];
        let stored = acl_default(&ctx, &ocb, &AclCmd::Set { entries }).expect("set");
        assert_eq!(stored.len(), 5);
        assert!(attr.lock().state().flags.contains(AttrFlags::DIRTY_ACL));
        assert_eq!(stat_default(&ctx, &ocb).unwrap().mode, FILE | 0o640);

        // the named user can now open for reading
        let named = ClientInfo::new(20, 2000, 2000);
        fx.open(&fx.ctx(2, &named), &attr, libc::O_RDONLY).expect("acl grants read");
        assert!(matches!(
            acl_default(&fx.ctx(2, &named), &ocb, &AclCmd::Delete),
            Err(IoFuncError::NotPermitted)
        ));

        acl_default(&ctx, &ocb, &AclCmd::Delete).expect("delete");
        assert_eq!(acl_default(&ctx, &ocb, &AclCmd::Get).unwrap().len(), 3);
    }

    #[test]
    fn acl_unsupported_without_conf_bit() {
        let fx = Fixture::new(MountConfig::default());
        let attr = fx.node(FILE | 0o600, &owner());
        let ctx = fx.ctx(1, &owner());
        let ocb = fx.open(&ctx, &attr, libc::O_RDONLY).expect("open");
        assert!(matches!(acl_default(&ctx, &ocb, &AclCmd::Get), Err(IoFuncError::NotSupported)));
    }

    #[test]
    fn fifo_read_blocks_until_write() {
        let fx = Fixture::new(MountConfig::default());
        let attr = fx.node(libc::S_IFIFO as u32 | 0o666, &owner());
        let reader_ctx = fx.ctx(1, &owner());
        let writer_ctx = fx.ctx(2, &stranger());
        let reader = fx.open(&reader_ctx, &attr, libc::O_RDONLY).expect("reader");
        let writer = fx.open(&writer_ctx, &attr, libc::O_WRONLY).expect("writer");

        let parked = read_default(&reader_ctx, &reader, &fx.driver, 8, None).unwrap();
        assert_eq!(parked, Outcome::Deferred);
        write_default(&writer_ctx, &writer, &fx.driver, b"ping", None).unwrap();
        assert_eq!(
            fx.transport.reply_for(RcvId(1)),
            Some(Response::Data { data: b"ping".to_vec() })
        );

        reader.set_status_flags(IoFlags::NONBLOCK);
        assert!(matches!(
            read_default(&reader_ctx, &reader, &fx.driver, 8, None),
            Err(IoFuncError::WouldBlock)
        ));
    }

    #[test]
    fn last_fifo_writer_close_hangs_up() {
        let fx = Fixture::new(MountConfig::default());
        let attr = fx.node(libc::S_IFIFO as u32 | 0o666, &owner());
        let reader_ctx = fx.ctx(1, &owner());
        let writer_ctx = fx.ctx(2, &stranger());
        let reader = fx.open(&reader_ctx, &attr, libc::O_RDONLY).expect("reader");
        let writer = fx.open(&writer_ctx, &attr, libc::O_WRONLY).expect("writer");

        let req = NotifyRequest {
            action: NotifyAction::CondArm,
            conds: NotifyCond::INPUT,
            event: 42,
        };
        let reply = notify_default(&fx.ctx(3, &owner()), &reader, &fx.driver, &req).unwrap();
        assert_eq!(reply.armed, NotifyCond::INPUT);
        let parked = read_default(&reader_ctx, &reader, &fx.driver, 8, None).unwrap();
        assert_eq!(parked, Outcome::Deferred);

        let closed = close_ocb_default(&writer_ctx, &writer, &fx.driver).unwrap();
        assert!(closed.contains(CloseFlags::LAST_WRITER));
        let events = fx.transport.take_events();
        assert_eq!(events.len(), 1);
        assert!(events[0].cond.contains(NotifyCond::HUP));
        assert_eq!(fx.transport.reply_for(RcvId(1)), Some(Response::Data { data: Vec::new() }));
    }

    #[test]
    fn write_fires_input_notification_once() {
        let fx = Fixture::new(MountConfig::default());
        let attr = fx.node(libc::S_IFIFO as u32 | 0o666, &owner());
        let ctx = fx.ctx(1, &owner());
        let reader = fx.open(&ctx, &attr, libc::O_RDONLY).expect("reader");
        let writer = fx.open(&ctx, &attr, libc::O_WRONLY).expect("writer");
        let req = NotifyRequest {
            action: NotifyAction::PollArm,
            conds: NotifyCond::INPUT,
            event: 1,
        };
        notify_default(&ctx, &reader, &fx.driver, &req).unwrap();
        write_default(&ctx, &writer, &fx.driver, b"a", None).unwrap();
        write_default(&ctx, &writer, &fx.driver, b"b", None).unwrap();
        assert_eq!(fx.transport.take_events().len(), 1);
    }

    #[test]
    fn mandatory_lock_blocks_io() {
        let fx = Fixture::new(MountConfig::default());
        let attr = fx.node(FILE | libc::S_ISGID as u32 | 0o666, &owner());
        let ctx = fx.ctx(1, &owner());
        let holder = fx.open(&ctx, &attr, libc::O_RDWR).expect("holder");
        let other = fx.open(&fx.ctx(2, &stranger()), &attr, libc::O_RDWR).expect("other");
        let req = LockRequest {
            cmd: LockCmd::SetLock,
            kind: Some(LockKind::Write),
            whence: Whence::Set,
            start: 0,
            len: 10,
        };
        assert_eq!(lock_default(&ctx, &holder, &req).unwrap(), Outcome::Ready(None));
        assert!(matches!(
            write_default(&fx.ctx(2, &stranger()), &other, &fx.driver, b"x", Some(5)),
            Err(IoFuncError::WouldBlock)
        ));
        write_default(&fx.ctx(2, &stranger()), &other, &fx.driver, b"x", Some(10))
            .expect("outside the lock");
    }

    #[test]
    fn getlock_reports_conflict() {
        let fx = Fixture::new(MountConfig::default());
        let attr = fx.node(FILE | 0o666, &owner());
        let ctx = fx.ctx(1, &owner());
        let a = fx.open(&ctx, &attr, libc::O_RDWR).expect("a");
        let b = fx.open(&ctx, &attr, libc::O_RDWR).expect("b");
        let mut req = LockRequest {
            cmd: LockCmd::SetLock,
            kind: Some(LockKind::Read),
            whence: Whence::Set,
            start: 0,
            len: 0,
        };
        lock_default(&ctx, &a, &req).unwrap();
        req.cmd = LockCmd::GetLock;
        req.kind = Some(LockKind::Write);
        let Outcome::Ready(Some(conflict)) = lock_default(&ctx, &b, &req).unwrap() else {
            panic!("expected a conflict");
        };
        assert_eq!(conflict.owner, a.id());
        assert_eq!(conflict.end, u64::MAX);
        req.kind = Some(LockKind::Read);
        assert_eq!(lock_default(&ctx, &b, &req).unwrap(), Outcome::Ready(None));
    }
}
