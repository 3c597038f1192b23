// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! POSIX byte-range record locks
//!
//! Locks are owned by an OCB. Ranges are inclusive and a lock "to end of
//! file" ends at `u64::MAX`. A blocking request that conflicts is queued in
//! FIFO order and granted when the conflict goes away.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::{IoFuncError, IoResult};
use crate::types::{ConnectionKey, OcbId, RcvId, Whence};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockCmd {
    /// Report the first conflicting lock
    GetLock,
    /// Lock or unlock without waiting
    SetLock,
    /// Lock, waiting for conflicting locks to go away
    SetLockWait,
}

/// A client record-lock request (`fcntl` `struct flock`)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub cmd: LockCmd,
    /// `None` unlocks the range
    pub kind: Option<LockKind>,
    pub whence: Whence,
    pub start: i64,
    /// Zero means "to end of file"; negative covers the bytes before `start`
    pub len: i64,
}

impl LockRequest {
    /// Resolve to an inclusive absolute range.
    pub fn range(&self, offset: u64, size: u64) -> IoResult<(u64, u64)> {
        let base: i128 = match self.whence {
            Whence::Set => 0,
            Whence::Cur => i128::from(offset),
            Whence::End => i128::from(size),
        };
        let mut start = base + i128::from(self.start);
        let len = i128::from(self.len);
        if len < 0 {
            start += len;
        }
        if start < 0 || start > i128::from(i64::MAX) {
            return Err(IoFuncError::InvalidArgument);
        }
        let end = match len {
            0 => u64::MAX,
            l if l > 0 => {
                let end = start + l - 1;
                if end > i128::from(i64::MAX) {
                    return Err(IoFuncError::InvalidArgument);
                }
                end as u64
            }
            l => (start - l - 1) as u64,
        };
        Ok((start as u64, end))
    }
}

/// A granted (or requested) lock on `[start, end]`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteLock {
    pub owner: OcbId,
    pub pid: u32,
    pub kind: LockKind,
    pub start: u64,
    pub end: u64,
}

impl ByteLock {
    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start <= end && start <= self.end
    }

    fn conflicts_with(&self, other: &ByteLock) -> bool {
        self.owner != other.owner
            && self.overlaps(other.start, other.end)
            && (self.kind == LockKind::Write || other.kind == LockKind::Write)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockRequestState {
    Pending,
    Granted,
}

/// A blocking request waiting for a conflict to clear
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingLock {
    pub rcvid: RcvId,
    pub key: ConnectionKey,
    pub lock: ByteLock,
}

#[derive(Clone, Debug, Default)]
pub struct LockList {
    granted: Vec<ByteLock>,
    pending: VecDeque<PendingLock>,
}

impl LockList {
    pub fn granted(&self) -> &[ByteLock] {
        &self.granted
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingLock> {
        self.pending.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.granted.is_empty() && self.pending.is_empty()
    }

    pub fn owned_by(&self, owner: OcbId) -> usize {
        self.granted.iter().filter(|l| l.owner == owner).count()
    }

    pub fn conflict(&self, candidate: &ByteLock) -> Option<&ByteLock> {
        self.granted.iter().find(|l| l.conflicts_with(candidate))
    }

    /// `GetLock`: the first lock that would block `candidate`.
    pub fn test(&self, candidate: &ByteLock) -> Option<ByteLock> {
        self.conflict(candidate).copied()
    }

    /// Grant `candidate` now, queue it, or refuse.
    ///
    /// With `wait == None` a conflict is `WouldBlock`. A waiting request
    /// that would close a cycle with the holder's own pending request fails
    /// with `Deadlock`.
    pub fn acquire(
        &mut self,
        candidate: ByteLock,
        wait: Option<(RcvId, ConnectionKey)>,
    ) -> IoResult<LockRequestState> {
        let Some(holder) = self.conflict(&candidate).copied() else {
            self.apply(candidate);
            tracing::debug!(
                owner = candidate.owner.0,
                start = candidate.start,
                end = candidate.end,
                kind = ?candidate.kind,
                "byte lock granted"
            );
            return Ok(LockRequestState::Granted);
        };
        let Some((rcvid, key)) = wait else {
            return Err(IoFuncError::WouldBlock);
        };
        if self.waits_on(holder.owner, candidate.owner) {
            tracing::debug!(
                owner = candidate.owner.0,
                holder = holder.owner.0,
                "byte lock deadlock"
            );
            return Err(IoFuncError::Deadlock);
        }
        self.pending.push_back(PendingLock {
            rcvid,
            key,
            lock: candidate,
        });
        tracing::debug!(
            owner = candidate.owner.0,
            rcvid = rcvid.0,
            holder = holder.owner.0,
            "byte lock pending"
        );
        Ok(LockRequestState::Pending)
    }

    /// Whether `waiter` has a pending request blocked by a lock of `holder`
    fn waits_on(&self, waiter: OcbId, holder: OcbId) -> bool {
        self.pending.iter().filter(|p| p.lock.owner == waiter).any(|p| {
            self.granted
                .iter()
                .any(|l| l.owner == holder && l.conflicts_with(&p.lock))
        })
    }

    /// Install `lock`, replacing and splitting the owner's overlapping
    /// ranges and merging adjacent ranges of the same kind.
    fn apply(&mut self, lock: ByteLock) {
        self.remove_range(lock.owner, lock.start, lock.end);
        let mut merged = lock;
        self.granted.retain(|l| {
            let adjacent = l.owner == merged.owner
                && l.kind == merged.kind
                && (l.end.checked_add(1) == Some(merged.start)
                    || merged.end.checked_add(1) == Some(l.start));
            if adjacent {
                merged.start = merged.start.min(l.start);
                merged.end = merged.end.max(l.end);
            }
            !adjacent
        });
        self.granted.push(merged);
    }

    fn remove_range(&mut self, owner: OcbId, start: u64, end: u64) -> bool {
        let mut changed = false;
        let mut kept = Vec::with_capacity(self.granted.len() + 1);
        for l in self.granted.drain(..) {
            if l.owner != owner || !l.overlaps(start, end) {
                kept.push(l);
                continue;
            }
            changed = true;
            if l.start < start {
                kept.push(ByteLock { end: start - 1, ..l });
            }
            if l.end > end {
                kept.push(ByteLock { start: end + 1, ..l });
            }
        }
        self.granted = kept;
        changed
    }

    /// Unlock `[start, end]` for `owner`. Returns the pending requests that
    /// were granted as a result.
    pub fn release(&mut self, owner: OcbId, start: u64, end: u64) -> Vec<PendingLock> {
        if self.remove_range(owner, start, end) {
            tracing::debug!(owner = owner.0, start, end, "byte lock released");
            self.grant_pending()
        } else {
            Vec::new()
        }
    }

    /// Forced release on detach: drops every lock of `owner`.
    pub fn release_owner(&mut self, owner: OcbId) -> Vec<PendingLock> {
        let before = self.granted.len();
        self.granted.retain(|l| l.owner != owner);
        if self.granted.len() == before {
            return Vec::new();
        }
        let released = before - self.granted.len();
        tracing::debug!(owner = owner.0, released, "byte locks force released");
        self.grant_pending()
    }

    /// Remove the pending requests of `owner` so their senders can be told.
    pub fn cancel_owner(&mut self, owner: OcbId) -> Vec<PendingLock> {
        let (gone, kept): (VecDeque<_>, VecDeque<_>) =
            self.pending.drain(..).partition(|p| p.lock.owner == owner);
        self.pending = kept;
        gone.into_iter().collect()
    }

    /// Drop the pending requests sent by client `pid`, e.g. on disconnect.
    pub fn cancel_client(&mut self, pid: u32) -> Vec<PendingLock> {
        let (gone, kept): (VecDeque<_>, VecDeque<_>) =
            self.pending.drain(..).partition(|p| p.key.pid == pid);
        self.pending = kept;
        gone.into_iter().collect()
    }

    /// Cancel the request client `pid` sent as `rcvid`. `None` if it was
    /// already granted or cancelled, or belongs to another client.
    pub fn cancel(&mut self, rcvid: RcvId, pid: u32) -> Option<PendingLock> {
        let index = self
            .pending
            .iter()
            .position(|p| p.rcvid == rcvid && p.key.pid == pid)?;
        let cancelled = self.pending.remove(index);
        if cancelled.is_some() {
            tracing::debug!(rcvid = rcvid.0, "byte lock request cancelled");
        }
        cancelled
    }

    fn grant_pending(&mut self) -> Vec<PendingLock> {
        let mut granted = Vec::new();
        let mut index = 0;
        while index < self.pending.len() {
            let candidate = self.pending[index].lock;
            if self.conflict(&candidate).is_some() {
                index += 1;
                continue;
            }
            if let Some(waiter) = self.pending.remove(index) {
                self.apply(waiter.lock);
                tracing::debug!(
                    owner = candidate.owner.0,
                    rcvid = waiter.rcvid.0,
                    "pending byte lock granted"
                );
                granted.push(waiter);
            }
        }
        granted
    }
}
