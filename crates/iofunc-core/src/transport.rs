// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Outbound side of the message transport
//!
//! Immediate replies are the return value of dispatch. Deferred replies and
//! notification events leave the framework through [`Transport`].

use std::sync::Mutex;

use crate::messages::Response;
use crate::notify::{NotifyCond, NotifyWaiter};
use crate::types::{ConnectionKey, RcvId};

pub trait Transport: Send + Sync {
    /// Answer a request whose reply was deferred
    fn reply(&self, rcvid: RcvId, response: Response);
    /// Deliver the event a client registered through notify
    fn deliver_event(&self, waiter: &NotifyWaiter, cond: NotifyCond);
}

/// An event delivered to a client
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveredEvent {
    pub key: ConnectionKey,
    pub event: u64,
    pub cond: NotifyCond,
}

/// Transport that records everything it is asked to send.
#[derive(Debug, Default)]
pub struct QueueTransport {
    replies: Mutex<Vec<(RcvId, Response)>>,
    events: Mutex<Vec<DeliveredEvent>>,
}

impl QueueTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_replies(&self) -> Vec<(RcvId, Response)> {
        std::mem::take(&mut *self.replies.lock().unwrap())
    }

    pub fn take_events(&self) -> Vec<DeliveredEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn reply_for(&self, rcvid: RcvId) -> Option<Response> {
        self.replies
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| *id == rcvid)
            .map(|(_, r)| r.clone())
    }
}

impl Transport for QueueTransport {
    fn reply(&self, rcvid: RcvId, response: Response) {
        tracing::trace!(rcvid = rcvid.0, ?response, "deferred reply");
        self.replies.lock().unwrap().push((rcvid, response));
    }

    fn deliver_event(&self, waiter: &NotifyWaiter, cond: NotifyCond) {
        tracing::trace!(pid = waiter.key.pid, event = waiter.event, ?cond, "event delivered");
        self.events.lock().unwrap().push(DeliveredEvent {
            key: waiter.key,
            event: waiter.event,
            cond,
        });
    }
}
