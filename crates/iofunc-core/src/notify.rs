// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Readiness notification registry (poll/select semantics)
//!
//! Each attribute owns one registry with three channels. A channel keeps the
//! lowest armed threshold among its waiters, or [`NEVER`] when nobody waits.
//! Triggering removes every satisfied waiter, so each registration is
//! delivered at most once.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::types::{ConnectionKey, RcvId};

/// Threshold of a channel nobody is waiting on
pub const NEVER: u32 = u32::MAX;

bitflags! {
    /// Readiness conditions a client can wait for
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct NotifyCond: u32 {
        const INPUT = 0x0001;
        const OUTPUT = 0x0002;
        const OBAND = 0x0004;
        const RDNORM = 0x0010;
        const WRNORM = 0x0020;
        const RDBAND = 0x0040;
        const PRI = 0x0080;
        const WRBAND = 0x0100;
        const ERR = 0x1000;
        const HUP = 0x2000;
        const NVAL = 0x4000;
    }
}

impl NotifyCond {
    /// Delivered whether or not the client asked for them
    pub const UNMASKABLE: NotifyCond =
        NotifyCond::ERR.union(NotifyCond::HUP).union(NotifyCond::NVAL);

    /// Conditions belonging to each channel, indexed by [`NotifyChannel::index`]
    const CHANNEL_CONDS: [NotifyCond; 3] = [
        NotifyCond::INPUT.union(NotifyCond::RDNORM),
        NotifyCond::OUTPUT.union(NotifyCond::WRNORM),
        NotifyCond::OBAND
            .union(NotifyCond::RDBAND)
            .union(NotifyCond::PRI)
            .union(NotifyCond::WRBAND),
    ];
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyChannel {
    Input,
    Output,
    Oband,
}

impl NotifyChannel {
    pub const ALL: [NotifyChannel; 3] =
        [NotifyChannel::Input, NotifyChannel::Output, NotifyChannel::Oband];

    pub fn index(self) -> usize {
        match self {
            NotifyChannel::Input => 0,
            NotifyChannel::Output => 1,
            NotifyChannel::Oband => 2,
        }
    }

    pub fn conds(self) -> NotifyCond {
        NotifyCond::CHANNEL_CONDS[self.index()]
    }
}

/// What a notify request asks the registry to do
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyAction {
    /// Report readiness, register nothing
    Poll,
    /// Report what is ready and arm the rest
    PollArm,
    /// Arm every requested channel for the next transition
    TranArm,
    /// Arm only if nothing requested is ready yet
    CondArm,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyRequest {
    pub action: NotifyAction,
    pub conds: NotifyCond,
    /// Opaque event the client wants delivered
    #[serde(default)]
    pub event: u64,
}

/// A client waiting on one channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotifyWaiter {
    pub key: ConnectionKey,
    pub rcvid: RcvId,
    pub event: u64,
    pub conds: NotifyCond,
    pub threshold: u32,
}

/// Answer to a notify request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyReply {
    pub ready: NotifyCond,
    pub armed: NotifyCond,
}

/// A waiter removed by a trigger, plus the conditions that fired
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotifyDelivery {
    pub waiter: NotifyWaiter,
    pub cond: NotifyCond,
}

#[derive(Clone, Debug)]
struct Channel {
    threshold: u32,
    waiters: Vec<NotifyWaiter>,
}

impl Channel {
    fn idle() -> Self {
        Self {
            threshold: NEVER,
            waiters: Vec::new(),
        }
    }

    fn rearm(&mut self) {
        self.threshold = self.waiters.iter().map(|w| w.threshold).min().unwrap_or(NEVER);
    }
}

#[derive(Clone, Debug)]
pub struct NotifyRegistry {
    channels: [Channel; 3],
}

impl Default for NotifyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyRegistry {
    pub fn new() -> Self {
        Self {
            channels: [Channel::idle(), Channel::idle(), Channel::idle()],
        }
    }

    /// Disarm every channel and forget all waiters.
    pub fn init(&mut self) {
        *self = Self::new();
    }

    pub fn threshold(&self, channel: NotifyChannel) -> u32 {
        self.channels[channel.index()].threshold
    }

    pub fn waiters(&self, channel: NotifyChannel) -> &[NotifyWaiter] {
        &self.channels[channel.index()].waiters
    }

    pub fn is_empty(&self) -> bool {
        self.channels.iter().all(|c| c.waiters.is_empty())
    }

    /// Handle a notify request.
    ///
    /// `trig` holds the conditions currently satisfied by the resource and
    /// `thresholds` the per-channel counts a new registration arms with.
    pub fn notify(
        &mut self,
        key: ConnectionKey,
        rcvid: RcvId,
        req: &NotifyRequest,
        trig: NotifyCond,
        thresholds: [u32; 3],
    ) -> NotifyReply {
        let ready = (req.conds & trig) | (trig & NotifyCond::UNMASKABLE);
        let to_arm = match req.action {
            NotifyAction::Poll => NotifyCond::empty(),
            NotifyAction::PollArm => req.conds - ready,
            NotifyAction::TranArm => req.conds,
            NotifyAction::CondArm if ready.is_empty() => req.conds,
            NotifyAction::CondArm => NotifyCond::empty(),
        };

        let mut armed = NotifyCond::empty();
        for channel in NotifyChannel::ALL {
            let conds = to_arm & channel.conds();
            if conds.is_empty() {
                continue;
            }
            let threshold = thresholds[channel.index()].max(1);
            let slot = &mut self.channels[channel.index()];
            slot.waiters.retain(|w| w.key != key);
            slot.waiters.push(NotifyWaiter {
                key,
                rcvid,
                event: req.event,
                conds,
                threshold,
            });
            slot.threshold = slot.threshold.min(threshold);
            armed |= conds;
            tracing::debug!(pid = key.pid, coid = key.coid, ?channel, threshold, "notify armed");
        }

        let ready = if req.action == NotifyAction::TranArm {
            trig & NotifyCond::UNMASKABLE
        } else {
            ready
        };
        NotifyReply { ready, armed }
    }

    /// The channel's count is now `count`; wake every waiter it satisfies.
    pub fn trigger(&mut self, channel: NotifyChannel, count: u32) -> Vec<NotifyDelivery> {
        let slot = &mut self.channels[channel.index()];
        if count < slot.threshold {
            return Vec::new();
        }
        let mut delivered = Vec::new();
        slot.waiters.retain(|w| {
            if w.threshold <= count {
                delivered.push(NotifyDelivery {
                    waiter: w.clone(),
                    cond: w.conds,
                });
                false
            } else {
                true
            }
        });
        slot.rearm();
        if !delivered.is_empty() {
            tracing::debug!(?channel, count, woken = delivered.len(), "notify triggered");
        }
        delivered
    }

    /// Deliver unmaskable conditions to every waiter on every channel.
    pub fn trigger_cond(&mut self, cond: NotifyCond) -> Vec<NotifyDelivery> {
        let cond = cond & NotifyCond::UNMASKABLE;
        if cond.is_empty() {
            return Vec::new();
        }
        let mut delivered: Vec<NotifyDelivery> = Vec::new();
        for slot in &mut self.channels {
            for waiter in slot.waiters.drain(..) {
                // one delivery per client even if it waited on several channels
                if let Some(existing) = delivered.iter_mut().find(|d| d.waiter.key == waiter.key) {
                    existing.cond |= waiter.conds;
                    continue;
                }
                delivered.push(NotifyDelivery {
                    cond: cond | waiter.conds,
                    waiter,
                });
            }
            slot.threshold = NEVER;
        }
        if !delivered.is_empty() {
            tracing::debug!(?cond, woken = delivered.len(), "unmaskable notify triggered");
        }
        delivered
    }

    /// Purge every registration of `key`. Returns how many were removed.
    pub fn remove(&mut self, key: ConnectionKey) -> usize {
        let mut removed = 0;
        for slot in &mut self.channels {
            let before = slot.waiters.len();
            slot.waiters.retain(|w| w.key != key);
            removed += before - slot.waiters.len();
            slot.rearm();
        }
        removed
    }

    /// Like [`NotifyRegistry::remove`] but removes at most `limit`
    /// registrations. The flag is true when the limit was reached and more
    /// registrations of `key` may remain.
    pub fn remove_strict(&mut self, key: ConnectionKey, limit: usize) -> (usize, bool) {
        let mut removed = 0;
        for slot in &mut self.channels {
            while removed < limit {
                match slot.waiters.iter().position(|w| w.key == key) {
                    Some(index) => {
                        slot.waiters.remove(index);
                        removed += 1;
                    }
                    None => break,
                }
            }
            slot.rearm();
        }
        let more = removed == limit
            && self.channels.iter().any(|c| c.waiters.iter().any(|w| w.key == key));
        (removed, more)
    }

    /// Input should fire when `count` reaches the armed threshold, or on a
    /// transition while somebody is waiting.
    pub fn input_check(&self, count: u32, transition: bool) -> bool {
        self.channel_check(NotifyChannel::Input, count, transition)
    }

    pub fn output_check(&self, count: u32) -> bool {
        self.channel_check(NotifyChannel::Output, count, false)
    }

    pub fn oband_check(&self, count: u32, transition: bool) -> bool {
        self.channel_check(NotifyChannel::Oband, count, transition)
    }

    fn channel_check(&self, channel: NotifyChannel, count: u32, transition: bool) -> bool {
        let slot = &self.channels[channel.index()];
        (count > 0 && count >= slot.threshold) || (transition && !slot.waiters.is_empty())
    }
}
