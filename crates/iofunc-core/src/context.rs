// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-message context handed to every handler

use std::sync::Arc;

use crate::ability::{Ability, AbilityTable};
use crate::transport::Transport;
use crate::types::{ClientInfo, ConnectionKey, RcvId};

/// Who sent the current message and how to answer them later.
#[derive(Clone)]
pub struct Context {
    pub rcvid: RcvId,
    pub coid: u32,
    pub client: ClientInfo,
    pub abilities: Arc<AbilityTable>,
    pub transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("rcvid", &self.rcvid)
            .field("coid", &self.coid)
            .field("client", &self.client)
            .finish()
    }
}

impl Context {
    pub fn new(
        rcvid: RcvId,
        coid: u32,
        client: ClientInfo,
        abilities: Arc<AbilityTable>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            rcvid,
            coid,
            client,
            abilities,
            transport,
        }
    }

    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(self.client.pid, self.coid)
    }

    /// Whether the sender holds `ability`
    pub fn has_ability(&self, ability: Ability) -> bool {
        self.abilities.check(&self.client, ability)
    }
}
