// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Open control blocks: per-open state and the attach/detach protocol

use bitflags::bitflags;
use std::sync::{Arc, Mutex};

use crate::attr::Attr;
use crate::context::Context;
use crate::error::{IoFuncError, IoResult};
use crate::messages::OpenRequest;
use crate::types::{IoFlags, OcbId, ShareMode};

bitflags! {
    /// Framework-private OCB bits
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct OcbFlags: u32 {
        /// Opened by a privileged client
        const PRIVILEGED = 0x01;
        /// The handle has live memory mappings
        const MMAP = 0x02;
    }
}

bitflags! {
    /// Counts that reached zero during [`ocb_detach`]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct CloseFlags: u32 {
        const LAST_INUSE = 0x01;
        const LAST_READER = 0x02;
        const LAST_WRITER = 0x04;
        const LAST_RDLOCK = 0x08;
        const LAST_WRLOCK = 0x10;
    }
}

/// Flags that outlive the open call
const KEPT_IOFLAGS: IoFlags = IoFlags::READ
    .union(IoFlags::WRITE)
    .union(IoFlags::APPEND)
    .union(IoFlags::NONBLOCK)
    .union(IoFlags::SYNC)
    .union(IoFlags::DSYNC);

#[derive(Debug)]
struct OcbState {
    ioflag: IoFlags,
    offset: u64,
    flags: OcbFlags,
    attached: bool,
    handles: u32,
}

#[derive(Debug)]
pub struct Ocb {
    id: OcbId,
    attr: Arc<Attr>,
    pid: u32,
    share: ShareMode,
    state: Mutex<OcbState>,
}

impl Ocb {
    pub fn new(id: OcbId, attr: Arc<Attr>, ctx: &Context, open: &OpenRequest) -> Self {
        let mut flags = OcbFlags::empty();
        if ctx.client.is_root() {
            flags |= OcbFlags::PRIVILEGED;
        }
        let ioflag = IoFlags::from_oflag(open.oflag);
        Self::with_ioflag(id, attr, ctx.client.pid, ioflag, open.share, flags)
    }

    pub fn with_ioflag(
        id: OcbId,
        attr: Arc<Attr>,
        pid: u32,
        ioflag: IoFlags,
        share: ShareMode,
        flags: OcbFlags,
    ) -> Self {
        Self {
            id,
            attr,
            pid,
            share,
            state: Mutex::new(OcbState {
                ioflag: ioflag & KEPT_IOFLAGS,
                offset: 0,
                flags,
                attached: false,
                handles: 1,
            }),
        }
    }

    pub fn id(&self) -> OcbId {
        self.id
    }

    pub fn attr(&self) -> &Arc<Attr> {
        &self.attr
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn share(&self) -> ShareMode {
        self.share
    }

    pub fn ioflag(&self) -> IoFlags {
        self.state.lock().unwrap().ioflag
    }

    /// Replace the settable status bits, keeping the access mode.
    pub fn set_status_flags(&self, flags: IoFlags) {
        let mut state = self.state.lock().unwrap();
        state.ioflag = (state.ioflag - IoFlags::SETTABLE) | (flags & IoFlags::SETTABLE);
    }

    pub fn offset(&self) -> u64 {
        self.state.lock().unwrap().offset
    }

    pub fn set_offset(&self, offset: u64) {
        self.state.lock().unwrap().offset = offset;
    }

    pub fn flags(&self) -> OcbFlags {
        self.state.lock().unwrap().flags
    }

    pub fn set_flags(&self, flags: OcbFlags) {
        self.state.lock().unwrap().flags |= flags;
    }

    pub fn clear_flags(&self, flags: OcbFlags) {
        self.state.lock().unwrap().flags.remove(flags);
    }

    pub fn is_privileged(&self) -> bool {
        self.flags().contains(OcbFlags::PRIVILEGED)
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().unwrap().attached
    }

    pub fn handles(&self) -> u32 {
        self.state.lock().unwrap().handles
    }

    /// Another connection now shares this OCB
    pub fn add_handle(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.handles += 1;
        state.handles
    }

    /// A sharing connection closed; returns how many remain.
    pub fn drop_handle(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.handles = state.handles.saturating_sub(1);
        state.handles
    }

    pub fn can_read(&self) -> bool {
        self.ioflag().contains(IoFlags::READ)
    }

    pub fn can_write(&self) -> bool {
        self.ioflag().contains(IoFlags::WRITE)
    }
}

/// Allocate an OCB through the mount's function table.
pub fn ocb_calloc(ctx: &Context, attr: &Arc<Attr>, open: &OpenRequest) -> IoResult<Arc<Ocb>> {
    attr.mount().funcs().ocb_calloc(ctx, attr, open)
}

pub fn ocb_free(ocb: Arc<Ocb>) {
    let mount = Arc::clone(ocb.attr().mount());
    mount.funcs().ocb_free(ocb);
}

/// Bind `ocb` to its attribute, enforcing share modes.
pub fn ocb_attach(_ctx: &Context, ocb: &Ocb) -> IoResult<()> {
    let guard = ocb.attr().lock();
    let mut attr = guard.state();
    let ioflag = ocb.ioflag();
    let reading = ioflag.contains(IoFlags::READ);
    let writing = ioflag.contains(IoFlags::WRITE);
    let share = ocb.share();

    if (reading && attr.rlocks > 0)
        || (writing && attr.wlocks > 0)
        || (share.denies_read() && attr.rcount > 0)
        || (share.denies_write() && attr.wcount > 0)
    {
        tracing::debug!(ocb = ocb.id().0, ino = ocb.attr().ino().0, ?share, "share mode conflict");
        return Err(IoFuncError::Busy);
    }

    attr.count += 1;
    if reading {
        attr.rcount += 1;
    }
    if writing {
        attr.wcount += 1;
    }
    if share.denies_read() {
        attr.rlocks += 1;
    }
    if share.denies_write() {
        attr.wlocks += 1;
    }
    ocb.state.lock().unwrap().attached = true;
    tracing::debug!(ocb = ocb.id().0, ino = ocb.attr().ino().0, count = attr.count, "ocb attached");
    Ok(())
}

/// Undo [`ocb_attach`]. Detaching an OCB that was never attached is a no-op.
pub fn ocb_detach(_ctx: &Context, ocb: &Ocb) -> CloseFlags {
    {
        let mut state = ocb.state.lock().unwrap();
        if !state.attached {
            return CloseFlags::empty();
        }
        state.attached = false;
    }

    let guard = ocb.attr().lock();
    let mut attr = guard.state();
    let ioflag = ocb.ioflag();
    let share = ocb.share();
    let mut closed = CloseFlags::empty();

    attr.count = attr.count.saturating_sub(1);
    if attr.count == 0 {
        closed |= CloseFlags::LAST_INUSE;
    }
    if ioflag.contains(IoFlags::READ) {
        attr.rcount = attr.rcount.saturating_sub(1);
        if attr.rcount == 0 {
            closed |= CloseFlags::LAST_READER;
        }
    }
    if ioflag.contains(IoFlags::WRITE) {
        attr.wcount = attr.wcount.saturating_sub(1);
        if attr.wcount == 0 {
            closed |= CloseFlags::LAST_WRITER;
        }
    }
    if share.denies_read() {
        attr.rlocks = attr.rlocks.saturating_sub(1);
        if attr.rlocks == 0 {
            closed |= CloseFlags::LAST_RDLOCK;
        }
    }
    if share.denies_write() {
        attr.wlocks = attr.wlocks.saturating_sub(1);
        if attr.wlocks == 0 {
            closed |= CloseFlags::LAST_WRLOCK;
        }
    }
    tracing::debug!(ocb = ocb.id().0, ino = ocb.attr().ino().0, ?closed, "ocb detached");
    closed
}
