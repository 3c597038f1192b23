// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end scenarios driven through the dispatch layer

use std::sync::Arc;

use iofunc_core::ability::CHOWN_ABILITY;
use iofunc_core::attr::AttrFlags;
use iofunc_core::messages::{OpenRequest, SpaceOp};
use iofunc_core::notify::NotifyAction;
use iofunc_core::ocb::{ocb_calloc, ocb_free};
use iofunc_core::{
    AbilityTable, ClientInfo, DefaultHandler, IoFuncError, LockKind, LockRequest, MemDriver, Mount,
    MountConfig, NotifyCond, NotifyRequest, QueueTransport, RcvId, Request, ResourceManager,
    Response, ShareMode, StaticAbilities, Whence,
};

struct Harness {
    rm: ResourceManager,
    abilities: Arc<StaticAbilities>,
    transport: Arc<QueueTransport>,
}

impl Harness {
    fn new() -> Self {
        let abilities = Arc::new(StaticAbilities::new());
        let table = Arc::new(
            AbilityTable::init(Box::new(Arc::clone(&abilities))).expect("ability table"),
        );
        let transport = Arc::new(QueueTransport::new());
        let rm = ResourceManager::new(
            Mount::new(MountConfig::default()),
            table,
            Box::new(DefaultHandler::new(MemDriver::new())),
            transport.clone(),
        );
        Self {
            rm,
            abilities,
            transport,
        }
    }

    fn send(
        &self,
        client: &ClientInfo,
        rcvid: u64,
        coid: u32,
        request: Request,
    ) -> Option<Response> {
        let ctx = self.rm.context(RcvId(rcvid), coid, client.clone());
        self.rm.dispatch(&ctx, request)
    }
}

fn alice() -> ClientInfo {
    ClientInfo::new(100, 1000, 1000)
}

fn bob() -> ClientInfo {
    ClientInfo::new(200, 2000, 2000)
}

fn carol() -> ClientInfo {
    ClientInfo::new(300, 3000, 3000)
}

fn open(path: &str, oflag: i32, share: ShareMode) -> Request {
    Request::Open(OpenRequest {
        path: path.into(),
        oflag,
        share,
        mode: 0o644,
    })
}

fn whole_file(cmd: iofunc_core::lock::LockCmd, kind: Option<LockKind>) -> Request {
    Request::Lock(LockRequest {
        cmd,
        kind,
        whence: Whence::Set,
        start: 0,
        len: 0,
    })
}

fn is_opened(response: Option<Response>) -> bool {
    matches!(response, Some(Response::Opened { .. }))
}

#[test]
fn chown_ability_grants_ownership_change() {
    let h = Harness::new();
    let req = open("/shared", libc::O_RDWR | libc::O_CREAT, ShareMode::DenyNone);
    assert!(is_opened(h.send(&alice(), 1, 1, req)));

    assert_eq!(
        h.send(&bob(), 2, 1, open("/shared", libc::O_WRONLY, ShareMode::DenyNone)),
        Some(Response::Error { errno: libc::EACCES })
    );
    assert!(is_opened(h.send(&bob(), 3, 1, open("/shared", libc::O_RDONLY, ShareMode::DenyNone))));
    let chown = Request::Chown {
        uid: Some(2000),
        gid: None,
    };
    assert_eq!(h.send(&bob(), 4, 1, chown.clone()), Some(Response::Error { errno: libc::EPERM }));

    h.abilities.grant(bob().pid, CHOWN_ABILITY);
    assert_eq!(h.send(&bob(), 5, 1, chown), Some(Response::Ok));

    let attr = h.rm.node("/shared").expect("node");
    {
        let guard = attr.lock();
        let state = guard.state();
        assert_eq!(state.uid, 2000);
        assert!(state.flags.contains(AttrFlags::DIRTY_OWNER));
    }
    assert!(is_opened(h.send(&bob(), 6, 2, open("/shared", libc::O_WRONLY, ShareMode::DenyNone))));
}

#[test]
fn deny_write_share_mode_blocks_second_writer() {
    let h = Harness::new();
    let req = open("/log", libc::O_RDWR | libc::O_CREAT, ShareMode::DenyWrite);
    assert!(is_opened(h.send(&alice(), 1, 1, req)));
    assert_eq!(
        h.send(&alice(), 2, 2, open("/log", libc::O_RDWR, ShareMode::DenyWrite)),
        Some(Response::Error { errno: libc::EBUSY })
    );
    // a failed open leaves no connection behind
    assert!(h.rm.connection(iofunc_core::ConnectionKey::new(100, 2)).is_none());

    assert_eq!(h.send(&alice(), 3, 1, Request::CloseDup), Some(Response::Ok));
    assert!(is_opened(h.send(&alice(), 4, 2, open("/log", libc::O_RDWR, ShareMode::DenyWrite))));
}

#[test]
fn blocked_lock_is_cancelled_then_granted() {
    use iofunc_core::lock::LockCmd;

    let h = Harness::new();
    let req = open("/db", libc::O_RDWR | libc::O_CREAT, ShareMode::DenyNone);
    assert!(is_opened(h.send(&alice(), 1, 1, req)));
    h.send(&alice(), 2, 1, Request::Chmod { mode: 0o666 });
    assert!(is_opened(h.send(&bob(), 3, 1, open("/db", libc::O_RDWR, ShareMode::DenyNone))));

    let write_lock = Some(LockKind::Write);
    let set = whole_file(LockCmd::SetLock, write_lock);
    assert_eq!(h.send(&alice(), 4, 1, set), Some(Response::Ok));
    assert_eq!(
        h.send(&bob(), 5, 1, whole_file(LockCmd::SetLock, write_lock)),
        Some(Response::Error { errno: libc::EAGAIN })
    );
    assert_eq!(h.send(&bob(), 10, 1, whole_file(LockCmd::SetLockWait, write_lock)), None);

    // an unblock naming someone else's request leaves it parked
    assert_eq!(h.send(&carol(), 9, 1, Request::Unblock { rcvid: RcvId(10) }), None);
    assert!(h.transport.take_replies().is_empty());

    assert_eq!(h.send(&bob(), 11, 1, Request::Unblock { rcvid: RcvId(10) }), None);
    assert_eq!(
        h.transport.take_replies(),
        vec![(RcvId(10), Response::Error { errno: libc::EINTR })]
    );
    // a second cancellation finds nothing to answer
    h.send(&bob(), 12, 1, Request::Unblock { rcvid: RcvId(10) });
    assert!(h.transport.take_replies().is_empty());

    assert_eq!(h.send(&bob(), 13, 1, whole_file(LockCmd::SetLockWait, write_lock)), None);
    assert_eq!(h.send(&alice(), 14, 1, whole_file(LockCmd::SetLock, None)), Some(Response::Ok));
    assert_eq!(h.transport.reply_for(RcvId(13)), Some(Response::Ok));

    let query = whole_file(LockCmd::GetLock, Some(LockKind::Read));
    let Some(Response::Lock { conflict }) = h.send(&alice(), 15, 1, query) else {
        panic!("expected lock reply");
    };
    assert_eq!(conflict.map(|c| c.pid), Some(bob().pid));
}

#[test]
fn attribute_lock_is_reentrant_per_thread() {
    let h = Harness::new();
    let attr = h.rm.create_node("/r", libc::S_IFREG as u32 | 0o644, &alice()).expect("node");
    let outer = attr.lock();
    let inner = attr.lock();
    assert_eq!(attr.lock_depth(), 2);

    let other = Arc::clone(&attr);
    let busy = std::thread::spawn(move || matches!(other.trylock(), Err(IoFuncError::Busy)))
        .join()
        .expect("thread");
    assert!(busy);

    drop(inner);
    assert!(attr.is_locked());
    drop(outer);
    assert!(!attr.is_locked());
}

#[test]
fn lseek_current_reports_without_moving() {
    let h = Harness::new();
    h.send(&alice(), 1, 1, open("/seek", libc::O_RDWR | libc::O_CREAT, ShareMode::DenyNone));
    h.send(
        &alice(),
        2,
        1,
        Request::Write {
            data: b"0123456789".to_vec(),
            offset: None,
        },
    );
    let here = Request::Lseek {
        offset: 0,
        whence: Whence::Cur,
    };
    assert_eq!(h.send(&alice(), 3, 1, here.clone()), Some(Response::Offset { offset: 10 }));
    assert_eq!(h.send(&alice(), 4, 1, here), Some(Response::Offset { offset: 10 }));
    assert_eq!(
        h.send(
            &alice(),
            5,
            1,
            Request::Lseek {
                offset: -11,
                whence: Whence::End
            }
        ),
        Some(Response::Error { errno: libc::EINVAL })
    );
}

#[test]
fn notify_event_is_delivered_at_most_once() {
    let h = Harness::new();
    h.rm.create_node("/pipe", libc::S_IFIFO as u32 | 0o666, &alice()).expect("fifo");
    let req = open("/pipe", libc::O_RDONLY | libc::O_NONBLOCK, ShareMode::DenyNone);
    assert!(is_opened(h.send(&bob(), 1, 1, req)));
    assert!(is_opened(h.send(&alice(), 2, 1, open("/pipe", libc::O_WRONLY, ShareMode::DenyNone))));

    let Some(Response::Notify { reply }) = h.send(
        &bob(),
        3,
        1,
        Request::Notify(NotifyRequest {
            action: NotifyAction::TranArm,
            conds: NotifyCond::INPUT,
            event: 42,
        }),
    ) else {
        panic!("expected notify reply");
    };
    assert_eq!(reply.armed, NotifyCond::INPUT);

    let write = Request::Write {
        data: b"ping".to_vec(),
        offset: None,
    };
    h.send(&alice(), 4, 1, write.clone());
    h.send(&alice(), 5, 1, write);
    let events = h.transport.take_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, 42);
    assert_eq!(events[0].key.pid, bob().pid);
}

#[test]
fn unattached_ocb_round_trips_through_allocator() {
    let h = Harness::new();
    let attr = h.rm.create_node("/alloc", libc::S_IFREG as u32 | 0o644, &alice()).expect("node");
    let ctx = h.rm.context(RcvId(1), 1, alice());
    let req = OpenRequest {
        path: "/alloc".into(),
        oflag: libc::O_RDONLY,
        share: ShareMode::DenyNone,
        mode: 0,
    };
    let ocb = ocb_calloc(&ctx, &attr, &req).expect("calloc");
    assert!(!ocb.is_attached());
    assert_eq!(attr.counts().open, 0);
    ocb_free(ocb);
    assert_eq!(attr.counts().open, 0);
}

#[test]
fn far_writes_and_allocations_stay_sparse() {
    let h = Harness::new();
    h.send(&alice(), 1, 1, open("/sparse", libc::O_RDWR | libc::O_CREAT, ShareMode::DenyNone));
    let far = 1i64 << 50;
    assert_eq!(
        h.send(&alice(), 2, 1, Request::Lseek { offset: far, whence: Whence::Set }),
        Some(Response::Offset { offset: far as u64 })
    );
    let write = Request::Write {
        data: b"x".to_vec(),
        offset: None,
    };
    assert_eq!(h.send(&alice(), 3, 1, write), Some(Response::Written { nbytes: 1 }));

    let Some(Response::Stat { stat }) = h.send(&alice(), 4, 1, Request::Stat) else {
        panic!("expected stat");
    };
    assert_eq!(stat.size, far as u64 + 1);

    let allocate = Request::Space {
        space: SpaceOp::Allocate,
        whence: Whence::Set,
        start: 0,
        len: 1 << 60,
    };
    assert_eq!(h.send(&alice(), 5, 1, allocate), Some(Response::Offset { offset: 1 << 60 }));
    let free = Request::Space {
        space: SpaceOp::Free,
        whence: Whence::Set,
        start: 0,
        len: far as u64,
    };
    assert_eq!(h.send(&alice(), 6, 1, free), Some(Response::Offset { offset: 1 << 60 }));

    let read = Request::Read {
        nbytes: 4,
        offset: Some(far as u64 - 1),
    };
    assert_eq!(h.send(&alice(), 7, 1, read), Some(Response::Data { data: b"\0x\0\0".to_vec() }));
}
