// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Privilege gate: named abilities looked up once and checked per client

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{IoFuncError, IoResult};
use crate::types::ClientInfo;

pub const CHOWN_ABILITY: &str = "iofunc/chown";
pub const READ_ABILITY: &str = "iofunc/read";
pub const DUP_ABILITY: &str = "iofunc/dup";

/// Identifier the privilege manager assigned to a named ability
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AbilityId(pub u32);

/// Abilities consulted by the default handlers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Ability {
    /// Give files away and bypass the owner check on chown
    Chown,
    /// Read regardless of mode bits
    Read,
    /// Duplicate an OCB into another process
    Dup,
    Custom(AbilityId),
}

/// Interface to the operating system's privilege manager.
#[cfg_attr(test, mockall::automock)]
pub trait AbilityProvider: Send + Sync {
    /// Resolve a name to an id, creating it if the manager allows that
    fn lookup(&self, name: &str) -> IoResult<AbilityId>;
    /// Whether `client` currently holds `id`
    fn holds(&self, client: &ClientInfo, id: AbilityId) -> bool;
}

/// Ability ids resolved once at startup
pub struct AbilityTable {
    provider: Box<dyn AbilityProvider>,
    chown: AbilityId,
    read: AbilityId,
    dup: AbilityId,
}

impl std::fmt::Debug for AbilityTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbilityTable")
            .field("chown", &self.chown)
            .field("read", &self.read)
            .field("dup", &self.dup)
            .finish()
    }
}

impl AbilityTable {
    pub fn init(provider: Box<dyn AbilityProvider>) -> IoResult<Self> {
        let chown = provider.lookup(CHOWN_ABILITY)?;
        let read = provider.lookup(READ_ABILITY)?;
        let dup = provider.lookup(DUP_ABILITY)?;
        tracing::debug!(?chown, ?read, ?dup, "ability table initialized");
        Ok(Self {
            provider,
            chown,
            read,
            dup,
        })
    }

    /// Register a driver-private ability.
    pub fn register(&self, name: &str) -> IoResult<Ability> {
        if name.is_empty() {
            return Err(IoFuncError::InvalidArgument);
        }
        Ok(Ability::Custom(self.provider.lookup(name)?))
    }

    pub fn id(&self, ability: Ability) -> AbilityId {
        match ability {
            Ability::Chown => self.chown,
            Ability::Read => self.read,
            Ability::Dup => self.dup,
            Ability::Custom(id) => id,
        }
    }

    pub fn check(&self, client: &ClientInfo, ability: Ability) -> bool {
        let held = self.provider.holds(client, self.id(ability));
        if !held {
            tracing::trace!(pid = client.pid, ?ability, "ability not held");
        }
        held
    }
}

/// In-process privilege manager: abilities are granted per client pid.
///
/// Root is not treated specially; grant explicitly.
#[derive(Debug, Default)]
pub struct StaticAbilities {
    inner: Mutex<StaticInner>,
}

#[derive(Debug, Default)]
struct StaticInner {
    ids: HashMap<String, AbilityId>,
    grants: HashSet<(u32, AbilityId)>,
}

impl StaticAbilities {
    pub fn new() -> Self {
        Self::default()
    }

    fn id_for(inner: &mut StaticInner, name: &str) -> AbilityId {
        let next = AbilityId(inner.ids.len() as u32 + 1);
        *inner.ids.entry(name.to_string()).or_insert(next)
    }

    pub fn grant(&self, pid: u32, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        let id = Self::id_for(&mut inner, name);
        inner.grants.insert((pid, id));
    }

    pub fn revoke(&self, pid: u32, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(id) = inner.ids.get(name).copied() {
            inner.grants.remove(&(pid, id));
        }
    }
}

impl AbilityProvider for StaticAbilities {
    fn lookup(&self, name: &str) -> IoResult<AbilityId> {
        let mut inner = self.inner.lock().unwrap();
        Ok(Self::id_for(&mut inner, name))
    }

    fn holds(&self, client: &ClientInfo, id: AbilityId) -> bool {
        self.inner.lock().unwrap().grants.contains(&(client.pid, id))
    }
}

impl AbilityProvider for std::sync::Arc<StaticAbilities> {
    fn lookup(&self, name: &str) -> IoResult<AbilityId> {
        self.as_ref().lookup(name)
    }

    fn holds(&self, client: &ClientInfo, id: AbilityId) -> bool {
        self.as_ref().holds(client, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use std::sync::Arc;

    #[test]
    fn init_looks_up_builtin_names() {
        let mut provider = MockAbilityProvider::new();
        provider.expect_lookup().with(eq(CHOWN_ABILITY)).times(1).returning(|_| Ok(AbilityId(10)));
        provider.expect_lookup().with(eq(READ_ABILITY)).times(1).returning(|_| Ok(AbilityId(11)));
        provider.expect_lookup().with(eq(DUP_ABILITY)).times(1).returning(|_| Ok(AbilityId(12)));
        provider
            .expect_holds()
            .withf(|client, id| client.pid == 5 && *id == AbilityId(10))
            .returning(|_, _| true);
        provider.expect_holds().returning(|_, _| false);

        let table = AbilityTable::init(Box::new(provider)).expect("table");
        let client = ClientInfo::new(5, 1000, 1000);
        assert!(table.check(&client, Ability::Chown));
        assert!(!table.check(&client, Ability::Dup));
    }

    #[test]
    fn init_propagates_lookup_failure() {
        let mut provider = MockAbilityProvider::new();
        provider.expect_lookup().returning(|_| Err(IoFuncError::NotPermitted));
        assert!(matches!(
            AbilityTable::init(Box::new(provider)),
            Err(IoFuncError::NotPermitted)
        ));
    }

    #[test]
    fn static_grants_are_per_pid() {
        let abilities = Arc::new(StaticAbilities::new());
        let table = AbilityTable::init(Box::new(Arc::clone(&abilities))).expect("table");
        let alice = ClientInfo::new(1, 1000, 1000);
        let bob = ClientInfo::new(2, 1001, 1001);

        abilities.grant(1, CHOWN_ABILITY);
        assert!(table.check(&alice, Ability::Chown));
        assert!(!table.check(&bob, Ability::Chown));

        let custom = table.register("driver/reset").expect("register");
        abilities.grant(2, "driver/reset");
        assert!(table.check(&bob, custom));

        abilities.revoke(1, CHOWN_ABILITY);
        assert!(!table.check(&alice, Ability::Chown));
        assert!(matches!(table.register(""), Err(IoFuncError::InvalidArgument)));
    }
}
