// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Dispatch layer: resolves messages to an attribute and OCB and runs the
//! handler table

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::ability::AbilityTable;
use crate::attr::{Attr, AttrFlags};
use crate::context::Context;
use crate::defaults::{check_access, Outcome};
use crate::error::{IoFuncError, IoResult};
use crate::handler::IoHandler;
use crate::lock::LockCmd;
use crate::messages::{OpenRequest, Request, Response};
use crate::mount::Mount;
use crate::ocb::Ocb;
use crate::transport::Transport;
use crate::types::{Access, ClientInfo, ConnectionKey, IoFlags, RcvId};

/// Resource manager serving a flat namespace of nodes under one mount.
///
/// `dispatch` may be called from any number of worker threads.
pub struct ResourceManager {
    mount: Arc<Mount>,
    abilities: Arc<AbilityTable>,
    handler: Box<dyn IoHandler>,
    transport: Arc<dyn Transport>,
    root: Arc<Attr>,
    nodes: Mutex<HashMap<String, Arc<Attr>>>,
    connections: Mutex<HashMap<ConnectionKey, Arc<Ocb>>>,
    /// Keys claimed by an open that is still running; locked after `connections`
    binding: Mutex<HashSet<ConnectionKey>>,
}

fn node_name(path: &str) -> &str {
    path.trim_start_matches('/')
}

impl ResourceManager {
    pub fn new(
        mount: Arc<Mount>,
        abilities: Arc<AbilityTable>,
        handler: Box<dyn IoHandler>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let superuser = ClientInfo::new(0, 0, 0);
        let mode = libc::S_IFDIR as u32 | libc::S_ISVTX as u32 | 0o777;
        let root = Attr::init(&mount, mode, None, &superuser);
        root.lock().state().flags |= AttrFlags::SYNTHETIC;
        tracing::info!(
            dev = mount.dev(),
            read_only = mount.is_read_only(),
            "resource manager ready"
        );
        Self {
            mount,
            abilities,
            handler,
            transport,
            root,
            nodes: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            binding: Mutex::new(HashSet::new()),
        }
    }

    pub fn mount(&self) -> &Arc<Mount> {
        &self.mount
    }

    pub fn abilities(&self) -> &Arc<AbilityTable> {
        &self.abilities
    }

    pub fn root(&self) -> &Arc<Attr> {
        &self.root
    }

    /// Build the context for a message received from `client`.
    pub fn context(&self, rcvid: RcvId, coid: u32, client: ClientInfo) -> Context {
        Context::new(rcvid, coid, client, Arc::clone(&self.abilities), Arc::clone(&self.transport))
    }

    /// Add a node to the namespace. Over-long names are refused or
    /// truncated according to the mount's no-trunc bit.
    pub fn create_node(&self, path: &str, mode: u32, owner: &ClientInfo) -> IoResult<Arc<Attr>> {
        let name = self.checked_name(path)?;
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.contains_key(&name) {
            return Err(IoFuncError::AlreadyExists);
        }
        let attr = Attr::init(&self.mount, mode, Some(self.root.as_ref()), owner);
        nodes.insert(name.clone(), Arc::clone(&attr));
        tracing::debug!(name, ino = attr.ino().0, "node created");
        Ok(attr)
    }

    fn checked_name(&self, path: &str) -> IoResult<String> {
        let name = node_name(path);
        if name.is_empty() || name.contains('/') {
            return Err(IoFuncError::InvalidArgument);
        }
        let config = self.mount.config();
        if name.len() <= config.name_max {
            return Ok(name.to_string());
        }
        if config.conf.no_trunc {
            return Err(IoFuncError::NameTooLong);
        }
        let mut end = config.name_max;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        Ok(name[..end].to_string())
    }

    pub fn node(&self, path: &str) -> Option<Arc<Attr>> {
        let name = node_name(path);
        if name.is_empty() {
            return Some(Arc::clone(&self.root));
        }
        self.nodes.lock().unwrap().get(name).cloned()
    }

    /// Remove a name. Open handles keep the attribute alive.
    pub fn unlink(&self, path: &str) -> IoResult<()> {
        let attr = self
            .nodes
            .lock()
            .unwrap()
            .remove(node_name(path))
            .ok_or(IoFuncError::NotFound)?;
        let guard = attr.lock();
        let mut state = guard.state();
        state.nlink = state.nlink.saturating_sub(1);
        state.flags |= AttrFlags::DIRTY_NLINK | AttrFlags::CTIME;
        Ok(())
    }

    pub fn connection(&self, key: ConnectionKey) -> Option<Arc<Ocb>> {
        self.connections.lock().unwrap().get(&key).cloned()
    }

    fn ocb(&self, ctx: &Context) -> IoResult<Arc<Ocb>> {
        self.connection(ctx.key()).ok_or(IoFuncError::BadFileDescriptor)
    }

    fn key_in_use(
        &self,
        connections: &HashMap<ConnectionKey, Arc<Ocb>>,
        key: ConnectionKey,
    ) -> bool {
        connections.contains_key(&key) || self.binding.lock().unwrap().contains(&key)
    }

    /// Bind a fresh OCB to `key`. The key is claimed up front so two opens
    /// on one connection id cannot both succeed, but the table is not held
    /// while `make` waits on attribute locks.
    fn bind_new(
        &self,
        key: ConnectionKey,
        make: impl FnOnce() -> IoResult<Arc<Ocb>>,
    ) -> IoResult<Arc<Ocb>> {
        {
            let connections = self.connections.lock().unwrap();
            if connections.contains_key(&key) || !self.binding.lock().unwrap().insert(key) {
                return Err(IoFuncError::BadFileDescriptor);
            }
        }
        let made = make();
        let mut connections = self.connections.lock().unwrap();
        self.binding.lock().unwrap().remove(&key);
        let ocb = made?;
        connections.insert(key, Arc::clone(&ocb));
        Ok(ocb)
    }

    /// Every attribute a request could be parked on, including unlinked
    /// nodes that are still open.
    fn attrs(&self) -> Vec<Arc<Attr>> {
        let mut attrs = vec![Arc::clone(&self.root)];
        attrs.extend(self.nodes.lock().unwrap().values().cloned());
        for ocb in self.connections.lock().unwrap().values() {
            if !attrs.iter().any(|a| a.ino() == ocb.attr().ino()) {
                attrs.push(Arc::clone(ocb.attr()));
            }
        }
        attrs
    }

    /// Handle one message. `None` means there is nothing to send now: the
    /// reply was deferred, or the message was a pulse.
    pub fn dispatch(&self, ctx: &Context, request: Request) -> Option<Response> {
        let op = request.name();
        tracing::debug!(op, pid = ctx.client.pid, coid = ctx.coid, rcvid = ctx.rcvid.0, "dispatch");
        match self.dispatch_request(ctx, request) {
            Ok(Some(response)) => Some(response.for_width(self.mount.offset_width())),
            Ok(None) => None,
            Err(err) => {
                tracing::debug!(op, errno = err.errno(), "request failed: {err}");
                Some(Response::from(err))
            }
        }
    }

    fn dispatch_request(&self, ctx: &Context, request: Request) -> IoResult<Option<Response>> {
        let handler = self.handler.as_ref();
        let (ocb, request) = match request {
            Request::Open(req) => return self.open(ctx, &req).map(Some),
            Request::Unblock { rcvid } => {
                for attr in self.attrs() {
                    if handler.unblock(ctx, &attr, rcvid)? {
                        break;
                    }
                }
                return Ok(None);
            }
            Request::CloseDup => {
                let ocb = self
                    .connections
                    .lock()
                    .unwrap()
                    .remove(&ctx.key())
                    .ok_or(IoFuncError::BadFileDescriptor)?;
                handler.close_dup(ctx, &ocb)?;
                return Ok(Some(Response::Ok));
            }
            Request::OpenFd {
                oflag,
                share,
                new_coid,
                target_pid,
            } => {
                let ocb = self.ocb(ctx)?;
                let pid = target_pid.unwrap_or(ctx.client.pid);
                let new_ocb = self.bind_new(ConnectionKey::new(pid, new_coid), || {
                    handler.openfd(ctx, &ocb, oflag, share, pid)
                })?;
                return Ok(Some(Response::Opened { ocb: new_ocb.id() }));
            }
            Request::Dup { new_coid } => {
                let ocb = self.ocb(ctx)?;
                let mut connections = self.connections.lock().unwrap();
                let key = ConnectionKey::new(ctx.client.pid, new_coid);
                if self.key_in_use(&connections, key) {
                    return Err(IoFuncError::BadFileDescriptor);
                }
                connections.insert(key, Arc::clone(&ocb));
                ocb.add_handle();
                return Ok(Some(Response::Ok));
            }
            other => (self.ocb(ctx)?, other),
        };

        let response = match request {
            Request::Read { nbytes, offset } => match handler.read(ctx, &ocb, nbytes, offset)? {
                Outcome::Ready(data) => Response::Data { data },
                Outcome::Deferred => return Ok(None),
            },
            Request::Write { data, offset } => Response::Written {
                nbytes: handler.write(ctx, &ocb, &data, offset)?,
            },
            Request::Lseek { offset, whence } => Response::Offset {
                offset: handler.lseek(ctx, &ocb, offset, whence)?,
            },
            Request::Stat => Response::Stat {
                stat: handler.stat(ctx, &ocb)?,
            },
            Request::Chmod { mode } => {
                handler.chmod(ctx, &ocb, mode)?;
                Response::Ok
            }
            Request::Chown { uid, gid } => {
                handler.chown(ctx, &ocb, uid, gid)?;
                Response::Ok
            }
            Request::Utime { times } => {
                handler.utime(ctx, &ocb, times)?;
                Response::Ok
            }
            Request::Devctl { cmd } => Response::Devctl {
                value: handler.devctl(ctx, &ocb, cmd)?,
            },
            Request::Sync { data_only } => {
                handler.sync(ctx, &ocb, data_only)?;
                Response::Ok
            }
            Request::Power { cmd } => Response::Power {
                mode: handler.power(ctx, &ocb, cmd)?,
            },
            Request::Mmap {
                prot,
                shared,
                offset,
                len,
            } => {
                handler.mmap(ctx, &ocb, prot, shared, offset, len)?;
                Response::Ok
            }
            Request::Space {
                space,
                whence,
                start,
                len,
            } => Response::Offset {
                offset: handler.space(ctx, &ocb, space, whence, start, len)?,
            },
            Request::Lock(req) => match handler.lock(ctx, &ocb, &req)? {
                Outcome::Ready(conflict) if req.cmd == LockCmd::GetLock => {
                    Response::Lock { conflict }
                }
                Outcome::Ready(_) => Response::Ok,
                Outcome::Deferred => return Ok(None),
            },
            Request::Notify(req) => Response::Notify {
                reply: handler.notify(ctx, &ocb, &req)?,
            },
            Request::FdInfo => Response::FdInfo {
                info: handler.fdinfo(ctx, &ocb)?,
            },
            Request::Pathconf { name } => Response::Pathconf {
                value: handler.pathconf(ctx, &ocb, name)?,
            },
            Request::Acl { cmd } => Response::Acl {
                entries: handler.acl(ctx, &ocb, &cmd)?,
            },
            Request::Open(_)
            | Request::Unblock { .. }
            | Request::CloseDup
            | Request::OpenFd { .. }
            | Request::Dup { .. } => {
                return Err(IoFuncError::Internal(
                    "connection request reached ocb dispatch".into(),
                ))
            }
        };
        Ok(Some(response))
    }

    fn open(&self, ctx: &Context, req: &OpenRequest) -> IoResult<Response> {
        let ioflag = IoFlags::from_oflag(req.oflag);
        let ocb = self.bind_new(ctx.key(), || {
            let attr = match self.node(&req.path) {
                Some(_) if ioflag.contains(IoFlags::CREAT | IoFlags::EXCL) => {
                    return Err(IoFuncError::AlreadyExists)
                }
                Some(attr) => attr,
                None if ioflag.contains(IoFlags::CREAT) => self.create_for(ctx, req)?,
                None => return Err(IoFuncError::NotFound),
            };
            self.handler.open(ctx, &attr, req)
        })?;
        tracing::debug!(path = req.path, ocb = ocb.id().0, pid = ctx.client.pid, "opened");
        Ok(Response::Opened { ocb: ocb.id() })
    }

    /// `O_CREAT` of a missing name: needs write access to the root.
    fn create_for(&self, ctx: &Context, req: &OpenRequest) -> IoResult<Arc<Attr>> {
        {
            let guard = self.root.lock();
            let state = guard.state();
            check_access(ctx, &self.root, &state, Access::WRITE)?;
        }
        if self.mount.is_read_only() {
            return Err(IoFuncError::ReadOnly);
        }
        let mode = libc::S_IFREG as u32 | (req.mode & 0o7777);
        self.create_node(&req.path, mode, &ctx.client)
    }

    /// The client went away: drop its parked requests and notify
    /// registrations, then close every handle it held.
    pub fn disconnect(&self, client: &ClientInfo) {
        let pid = client.pid;
        let keys: Vec<ConnectionKey> = self
            .connections
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.pid == pid)
            .copied()
            .collect();
        let limit = self.mount.config().notify_remove_limit;

        for attr in self.attrs() {
            let guard = attr.lock();
            let mut state = guard.state();
            let cancelled = state.locks.cancel_client(pid).len()
                + state.blocked_reads.drain_where(|w| w.key.pid == pid).len();
            for key in &keys {
                while let (_, true) = state.notify.remove_strict(*key, limit) {}
            }
            if cancelled > 0 {
                tracing::debug!(pid, ino = attr.ino().0, cancelled, "parked requests dropped");
            }
        }

        for key in keys {
            let Some(ocb) = self.connections.lock().unwrap().remove(&key) else {
                continue;
            };
            let ctx = self.context(RcvId(0), key.coid, client.clone());
            if let Err(err) = self.handler.close_dup(&ctx, &ocb) {
                tracing::warn!(pid, coid = key.coid, "close on disconnect failed: {err}");
            }
        }
        tracing::debug!(pid, "client disconnected");
    }
}
