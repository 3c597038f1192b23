// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Deferred replies keyed by receive id
//!
//! A blocked request is answered exactly once: the completion path and the
//! unblock path both go through [`WaitQueue::take`], and only the caller that
//! actually removes the entry may reply.

use std::collections::VecDeque;

use crate::types::{ConnectionKey, RcvId};

#[derive(Clone, Debug)]
pub struct Waiter<T> {
    pub rcvid: RcvId,
    pub key: ConnectionKey,
    pub data: T,
}

/// FIFO of requests whose reply is deferred
#[derive(Debug)]
pub struct WaitQueue<T> {
    waiters: VecDeque<Waiter<T>>,
}

impl<T> Default for WaitQueue<T> {
    fn default() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }
}

impl<T> WaitQueue<T> {
    pub fn push(&mut self, rcvid: RcvId, key: ConnectionKey, data: T) {
        tracing::debug!(rcvid = rcvid.0, pid = key.pid, "reply deferred");
        self.waiters.push_back(Waiter { rcvid, key, data });
    }

    /// Put a waiter back at the head, e.g. when it still cannot be served.
    pub fn requeue_front(&mut self, waiter: Waiter<T>) {
        self.waiters.push_front(waiter);
    }

    /// Remove the waiter client `pid` parked as `rcvid`. `None` means
    /// someone already replied or the request is not that client's.
    pub fn take(&mut self, rcvid: RcvId, pid: u32) -> Option<Waiter<T>> {
        let index = self
            .waiters
            .iter()
            .position(|w| w.rcvid == rcvid && w.key.pid == pid)?;
        self.waiters.remove(index)
    }

    /// Remove and return the oldest waiter.
    pub fn pop(&mut self) -> Option<Waiter<T>> {
        self.waiters.pop_front()
    }

    /// Remove every waiter matching `pred`, oldest first.
    pub fn drain_where(&mut self, mut pred: impl FnMut(&Waiter<T>) -> bool) -> Vec<Waiter<T>> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.waiters.len());
        for waiter in self.waiters.drain(..) {
            if pred(&waiter) {
                taken.push(waiter);
            } else {
                kept.push_back(waiter);
            }
        }
        self.waiters = kept;
        taken
    }

    pub fn contains(&self, rcvid: RcvId) -> bool {
        self.waiters.iter().any(|w| w.rcvid == rcvid)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_is_exactly_once() {
        let mut queue = WaitQueue::default();
        queue.push(RcvId(7), ConnectionKey::new(1, 1), 16usize);
        assert!(queue.contains(RcvId(7)));
        assert!(queue.take(RcvId(7), 2).is_none());
        assert_eq!(queue.take(RcvId(7), 1).map(|w| w.data), Some(16));
        assert!(queue.take(RcvId(7), 1).is_none());
    }

    #[test]
    fn drain_keeps_order_of_the_rest() {
        let mut queue = WaitQueue::default();
        for (rcvid, pid) in [(1, 10), (2, 20), (3, 10), (4, 30)] {
            queue.push(RcvId(rcvid), ConnectionKey::new(pid, 1), ());
        }
        let taken = queue.drain_where(|w| w.key.pid == 10);
        assert_eq!(taken.iter().map(|w| w.rcvid.0).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(queue.pop().map(|w| w.rcvid), Some(RcvId(2)));
        assert_eq!(queue.len(), 1);
    }
}
