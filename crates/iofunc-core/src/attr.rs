// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Attribute store: per-node metadata and its reentrant lock

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use crate::acl::Acl;
use crate::blocked::WaitQueue;
use crate::error::{IoFuncError, IoResult};
use crate::lock::LockList;
use crate::mount::Mount;
use crate::notify::NotifyRegistry;
use crate::ocb::Ocb;
use crate::types::{current_timestamp, is_dir, ClientInfo, Ino, OcbId, Timestamp};

bitflags! {
    /// Pending-stamp and dirty bits of an attribute.
    ///
    /// `ATIME`/`MTIME`/`CTIME` mean "this time is stale and must be stamped
    /// with the current time"; [`AttrState::time_update`] turns them into the
    /// matching `DIRTY_*` bits. `DIRTY_*` bits stay set until a flush clears
    /// them.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AttrFlags: u32 {
        const ATIME = 0x0001;
        const MTIME = 0x0002;
        const CTIME = 0x0004;
        const DIRTY_ATIME = 0x0010;
        const DIRTY_MTIME = 0x0020;
        const DIRTY_CTIME = 0x0040;
        const DIRTY_SIZE = 0x0080;
        const DIRTY_OWNER = 0x0100;
        const DIRTY_MODE = 0x0200;
        const DIRTY_NLINK = 0x0400;
        const DIRTY_RDEV = 0x0800;
        const DIRTY_ACL = 0x1000;
        /// Node exists only in memory; mutable even on a read-only mount
        const SYNTHETIC = 0x8000;
    }
}

impl AttrFlags {
    pub const STALE_TIMES: AttrFlags =
        AttrFlags::ATIME.union(AttrFlags::MTIME).union(AttrFlags::CTIME);
    pub const DIRTY_MASK: AttrFlags = AttrFlags::DIRTY_ATIME
        .union(AttrFlags::DIRTY_MTIME)
        .union(AttrFlags::DIRTY_CTIME)
        .union(AttrFlags::DIRTY_SIZE)
        .union(AttrFlags::DIRTY_OWNER)
        .union(AttrFlags::DIRTY_MODE)
        .union(AttrFlags::DIRTY_NLINK)
        .union(AttrFlags::DIRTY_RDEV)
        .union(AttrFlags::DIRTY_ACL);
}

bitflags! {
    /// Protection requested for a memory mapping
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MmapProt: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

/// One live memory mapping of the node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MmapEntry {
    pub ocb: OcbId,
    pub prot: MmapProt,
    pub shared: bool,
    pub offset: u64,
    pub len: u64,
}

/// Device power mode reported and set through the power handler
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerMode {
    #[default]
    Active,
    Idle,
    Standby,
    Off,
}

/// Open/share counts of an attribute at one instant
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AttrCounts {
    pub open: u32,
    pub readers: u32,
    pub writers: u32,
    /// OCBs that deny read access to others
    pub read_locks: u32,
    /// OCBs that deny write access to others
    pub write_locks: u32,
}

/// A client read that had no data and is waiting for a writer
#[derive(Clone, Debug)]
pub struct BlockedRead {
    pub ocb: Arc<Ocb>,
    pub nbytes: usize,
}

/// Fields protected by the attribute lock
#[derive(Debug)]
pub struct AttrState {
    pub flags: AttrFlags,
    pub(crate) count: u32,
    pub(crate) rcount: u32,
    pub(crate) wcount: u32,
    pub(crate) rlocks: u32,
    pub(crate) wlocks: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub nlink: u32,
    pub rdev: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub acl: Option<Acl>,
    pub mmaps: Vec<MmapEntry>,
    pub locks: LockList,
    pub notify: NotifyRegistry,
    pub power: PowerMode,
    pub(crate) blocked_reads: WaitQueue<BlockedRead>,
}

impl AttrState {
    fn new(mode: u32, uid: u32, gid: u32, now: Timestamp) -> Self {
        Self {
            flags: AttrFlags::empty(),
            count: 0,
            rcount: 0,
            wcount: 0,
            rlocks: 0,
            wlocks: 0,
            size: 0,
            uid,
            gid,
            mode,
            nlink: if is_dir(mode) { 2 } else { 1 },
            rdev: 0,
            atime: now,
            mtime: now,
            ctime: now,
            acl: None,
            mmaps: Vec::new(),
            locks: LockList::default(),
            notify: NotifyRegistry::new(),
            power: PowerMode::default(),
            blocked_reads: WaitQueue::default(),
        }
    }

    pub fn counts(&self) -> AttrCounts {
        AttrCounts {
            open: self.count,
            readers: self.rcount,
            writers: self.wcount,
            read_locks: self.rlocks,
            write_locks: self.wlocks,
        }
    }

    /// Stamp every stale time with a single clock read.
    pub fn time_update(&mut self) {
        let stale = self.flags & AttrFlags::STALE_TIMES;
        if stale.is_empty() {
            return;
        }
        let now = current_timestamp();
        if stale.contains(AttrFlags::ATIME) {
            self.atime = now;
            self.flags |= AttrFlags::DIRTY_ATIME;
        }
        if stale.contains(AttrFlags::MTIME) {
            self.mtime = now;
            self.flags |= AttrFlags::DIRTY_MTIME;
        }
        if stale.contains(AttrFlags::CTIME) {
            self.ctime = now;
            self.flags |= AttrFlags::DIRTY_CTIME;
        }
        self.flags.remove(AttrFlags::STALE_TIMES);
    }

    pub fn dirty(&self) -> AttrFlags {
        self.flags & AttrFlags::DIRTY_MASK
    }

    /// Clear dirty bits after the driver persisted them.
    pub fn clear_dirty(&mut self, flushed: AttrFlags) {
        self.flags.remove(flushed & AttrFlags::DIRTY_MASK);
    }

    pub fn is_synthetic(&self) -> bool {
        self.flags.contains(AttrFlags::SYNTHETIC)
    }
}

#[derive(Debug, Default)]
struct LockOwner {
    thread: Option<ThreadId>,
    depth: u32,
}

/// Reentrant lock keyed by owning thread plus a recursion counter.
#[derive(Debug, Default)]
pub struct AttrLock {
    owner: Mutex<LockOwner>,
    released: Condvar,
}

impl AttrLock {
    pub fn lock(&self) {
        let me = thread::current().id();
        let mut owner = self.owner.lock().unwrap();
        while owner.thread.is_some_and(|t| t != me) {
            owner = self.released.wait(owner).unwrap();
        }
        owner.thread = Some(me);
        owner.depth += 1;
    }

    /// Like [`AttrLock::lock`] but fails with `Busy` instead of waiting.
    pub fn trylock(&self) -> IoResult<()> {
        let me = thread::current().id();
        let mut owner = self.owner.lock().unwrap();
        match owner.thread {
            Some(t) if t != me => Err(IoFuncError::Busy),
            _ => {
                owner.thread = Some(me);
                owner.depth += 1;
                Ok(())
            }
        }
    }

    pub fn unlock(&self) -> IoResult<()> {
        let me = thread::current().id();
        let mut owner = self.owner.lock().unwrap();
        if owner.thread != Some(me) || owner.depth == 0 {
            tracing::warn!("attribute unlock by a thread that does not hold the lock");
            return Err(IoFuncError::NotPermitted);
        }
        owner.depth -= 1;
        if owner.depth == 0 {
            owner.thread = None;
            drop(owner);
            self.released.notify_one();
        }
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.owner.lock().unwrap().thread.is_some()
    }

    pub fn depth(&self) -> u32 {
        self.owner.lock().unwrap().depth
    }

    pub fn held_by_current_thread(&self) -> bool {
        self.owner.lock().unwrap().thread == Some(thread::current().id())
    }
}

/// One logical file or device node
#[derive(Debug)]
pub struct Attr {
    ino: Ino,
    mount: Arc<Mount>,
    lock: AttrLock,
    state: Mutex<AttrState>,
}

impl Attr {
    /// Create a node. Times are stamped with one clock read; the owner comes
    /// from `client`. A set-group-id parent directory passes its group on,
    /// and its set-group-id bit to sub-directories.
    pub fn init(
        mount: &Arc<Mount>,
        mode: u32,
        parent: Option<&Attr>,
        client: &ClientInfo,
    ) -> Arc<Attr> {
        let now = current_timestamp();
        let mut gid = client.gid;
        let mut mode = mode;
        if let Some(parent) = parent {
            let guard = parent.lock();
            let parent_state = guard.state();
            if parent_state.mode & libc::S_ISGID as u32 != 0 {
                gid = parent_state.gid;
                if is_dir(mode) {
                    mode |= libc::S_ISGID as u32;
                }
            }
        }
        let ino = mount.allocate_ino();
        tracing::debug!(ino = ino.0, mode = format_args!("{:o}", mode), "attribute created");
        Arc::new(Attr {
            ino,
            mount: Arc::clone(mount),
            lock: AttrLock::default(),
            state: Mutex::new(AttrState::new(mode, client.uid, gid, now)),
        })
    }

    pub fn ino(&self) -> Ino {
        self.ino
    }

    pub fn mount(&self) -> &Arc<Mount> {
        &self.mount
    }

    /// Acquire the attribute lock through the mount's function table.
    pub fn lock(&self) -> AttrGuard<'_> {
        self.mount.funcs().attr_lock(self);
        AttrGuard { attr: self }
    }

    pub fn trylock(&self) -> IoResult<AttrGuard<'_>> {
        self.mount.funcs().attr_trylock(self)?;
        Ok(AttrGuard { attr: self })
    }

    /// Raw lock primitive used by [`crate::IoFuncs`] implementations.
    pub fn lock_raw(&self) {
        self.lock.lock();
    }

    pub fn trylock_raw(&self) -> IoResult<()> {
        self.lock.trylock()
    }

    pub fn unlock_raw(&self) -> IoResult<()> {
        self.lock.unlock()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn lock_depth(&self) -> u32 {
        self.lock.depth()
    }

    pub fn counts(&self) -> AttrCounts {
        self.lock().state().counts()
    }

    /// Mutating operations are refused on a read-only mount unless the node
    /// is synthetic.
    pub(crate) fn check_writable(&self, state: &AttrState) -> IoResult<()> {
        if self.mount.is_read_only() && !state.is_synthetic() {
            return Err(IoFuncError::ReadOnly);
        }
        Ok(())
    }
}

impl Drop for Attr {
    fn drop(&mut self) {
        if self.lock.is_locked() {
            tracing::warn!(ino = self.ino.0, "attribute dropped while locked");
        }
    }
}

/// Scoped attribute lock. Unlocks on every exit path.
///
/// Field access goes through [`AttrGuard::state`]; keep at most one
/// `state()` borrow alive at a time.
#[must_use = "the attribute is unlocked as soon as the guard is dropped"]
pub struct AttrGuard<'a> {
    attr: &'a Attr,
}

impl<'a> AttrGuard<'a> {
    pub fn attr(&self) -> &'a Attr {
        self.attr
    }

    pub fn state(&self) -> MutexGuard<'a, AttrState> {
        self.attr.state.lock().unwrap()
    }
}

impl Drop for AttrGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.attr.mount.funcs().attr_unlock(self.attr) {
            tracing::warn!(ino = self.attr.ino.0, "attribute unlock failed: {err}");
        }
    }
}
