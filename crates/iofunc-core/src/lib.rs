// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Attribute and open-control-block framework for resource managers.
//!
//! This crate provides:
//! - Per-file attribute records with a reentrant lock and dirty tracking
//! - Open control blocks carrying per-open state and share-mode bookkeeping
//! - Byte-range locks with blocking waiters and deadlock detection
//! - Readiness notification with thresholds and arm/poll actions
//! - Default handlers for every I/O message, overridable per operation
//! - A dispatch layer that keeps one OCB per client connection

pub mod ability;
pub mod acl;
pub mod attr;
pub mod blocked;
pub mod config;
pub mod context;
pub mod defaults;
pub mod driver;
pub mod error;
pub mod handler;
pub mod lock;
pub mod messages;
pub mod mount;
pub mod notify;
pub mod ocb;
pub mod resmgr;
pub mod transport;
pub mod types;

pub use ability::{Ability, AbilityProvider, AbilityTable, StaticAbilities};
pub use acl::{Acl, AclEntry, AclTag, PosixAcl};
pub use attr::{Attr, AttrFlags, AttrGuard, AttrState};
pub use config::{MountConfig, OffsetWidth};
pub use context::Context;
pub use defaults::Outcome;
pub use driver::{Driver, MemDriver};
pub use error::{IoFuncError, IoResult};
pub use handler::{DefaultHandler, IoHandler};
pub use lock::{ByteLock, LockKind, LockRequest};
pub use messages::{Request, Response};
pub use mount::{DefaultIoFuncs, IoFuncs, Mount, MountFlags};
pub use notify::{NotifyCond, NotifyReply, NotifyRequest};
pub use ocb::Ocb;
pub use resmgr::ResourceManager;
pub use transport::{QueueTransport, Transport};
pub use types::{ClientInfo, ConnectionKey, IoFlags, OcbId, RcvId, ShareMode, Whence};
