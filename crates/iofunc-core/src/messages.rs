// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Request and response messages carried by the transport

use serde::{Deserialize, Serialize};

use crate::acl::AclEntry;
use crate::attr::{MmapProt, PowerMode};
use crate::config::OffsetWidth;
use crate::error::IoFuncError;
use crate::lock::{ByteLock, LockRequest};
use crate::notify::{NotifyReply, NotifyRequest};
use crate::types::{FdInfo, OcbId, RcvId, ShareMode, Stat, Timestamp, Whence};

/// Connect message resolving a path to an attribute and creating an OCB
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub path: String,
    /// POSIX `open(2)` flags
    pub oflag: i32,
    #[serde(default)]
    pub share: ShareMode,
    /// Permission bits for `O_CREAT`
    #[serde(default)]
    pub mode: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DevctlCmd {
    /// Report the handle's `open(2)` status flags
    GetFlags,
    /// Replace the settable status flags (append, nonblock, sync, dsync)
    SetFlags { flags: i32 },
    GetMountFlags,
    /// Driver-specific command; the default handler answers `ENOTTY`
    Other { code: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum PowerCmd {
    Get,
    Set { mode: PowerMode },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpaceOp {
    /// Make sure `[start, start + len)` is backed, growing the file if needed
    Allocate,
    /// Release `[start, start + len)`; freeing through the end truncates
    Free,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathconfName {
    LinkMax,
    NameMax,
    ChownRestricted,
    NoTrunc,
    SyncIo,
    AclExtended,
    FileSizeBits,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum AclCmd {
    Get,
    Set { entries: Vec<AclEntry> },
    Delete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtimeTimes {
    pub atime: Timestamp,
    pub mtime: Timestamp,
}

/// A client message addressed to an open handle (or a path, for `Open`)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Open(OpenRequest),
    Read {
        nbytes: usize,
        /// Explicit position; the handle offset is left alone when given
        #[serde(default)]
        offset: Option<u64>,
    },
    Write {
        data: Vec<u8>,
        #[serde(default)]
        offset: Option<u64>,
    },
    Lseek {
        offset: i64,
        whence: Whence,
    },
    Stat,
    Chmod {
        mode: u32,
    },
    Chown {
        #[serde(default)]
        uid: Option<u32>,
        #[serde(default)]
        gid: Option<u32>,
    },
    Utime {
        /// `None` stamps the current time
        #[serde(default)]
        times: Option<UtimeTimes>,
    },
    Devctl {
        #[serde(flatten)]
        cmd: DevctlCmd,
    },
    Sync {
        #[serde(default)]
        data_only: bool,
    },
    Power {
        #[serde(flatten)]
        cmd: PowerCmd,
    },
    Mmap {
        prot: MmapProt,
        #[serde(default)]
        shared: bool,
        #[serde(default)]
        offset: u64,
        len: u64,
    },
    Space {
        space: SpaceOp,
        whence: Whence,
        start: i64,
        len: u64,
    },
    Lock(LockRequest),
    /// Cancellation pulse for a blocked request
    Unblock {
        rcvid: RcvId,
    },
    CloseDup,
    /// Share this handle's OCB under another connection id of the same client
    Dup {
        new_coid: u32,
    },
    Notify(NotifyRequest),
    /// Create a new OCB from this handle, possibly for another process
    OpenFd {
        oflag: i32,
        #[serde(default)]
        share: ShareMode,
        new_coid: u32,
        #[serde(default)]
        target_pid: Option<u32>,
    },
    FdInfo,
    Pathconf {
        name: PathconfName,
    },
    Acl {
        #[serde(flatten)]
        cmd: AclCmd,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Open(_) => "open",
            Request::Read { .. } => "read",
            Request::Write { .. } => "write",
            Request::Lseek { .. } => "lseek",
            Request::Stat => "stat",
            Request::Chmod { .. } => "chmod",
            Request::Chown { .. } => "chown",
            Request::Utime { .. } => "utime",
            Request::Devctl { .. } => "devctl",
            Request::Sync { .. } => "sync",
            Request::Power { .. } => "power",
            Request::Mmap { .. } => "mmap",
            Request::Space { .. } => "space",
            Request::Lock(_) => "lock",
            Request::Unblock { .. } => "unblock",
            Request::CloseDup => "close_dup",
            Request::Dup { .. } => "dup",
            Request::Notify(_) => "notify",
            Request::OpenFd { .. } => "openfd",
            Request::FdInfo => "fdinfo",
            Request::Pathconf { .. } => "pathconf",
            Request::Acl { .. } => "acl",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Opened { ocb: OcbId },
    Data { data: Vec<u8> },
    Written { nbytes: usize },
    Offset { offset: u64 },
    Stat { stat: Stat },
    Devctl { value: i64 },
    Power { mode: PowerMode },
    Notify { reply: NotifyReply },
    /// `GetLock` result; `None` means the range is unlocked
    Lock { conflict: Option<ByteLock> },
    FdInfo { info: FdInfo },
    Pathconf { value: i64 },
    Acl { entries: Vec<AclEntry> },
    Error { errno: i32 },
}

impl Response {
    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }

    pub fn errno(&self) -> Option<i32> {
        match self {
            Response::Error { errno } => Some(*errno),
            _ => None,
        }
    }

    /// Narrow 64-bit fields for clients of a 32-bit mount.
    pub fn for_width(self, width: OffsetWidth) -> Self {
        match self {
            Response::Stat { mut stat } => {
                stat.ino = width.truncate(stat.ino);
                stat.size = width.truncate(stat.size);
                stat.blocks = width.truncate(stat.blocks);
                Response::Stat { stat }
            }
            Response::Offset { offset } => Response::Offset {
                offset: width.truncate(offset),
            },
            Response::FdInfo { mut info } => {
                info.offset = width.truncate(info.offset);
                info.size = width.truncate(info.size);
                Response::FdInfo { info }
            }
            other => other,
        }
    }
}

impl From<IoFuncError> for Response {
    fn from(err: IoFuncError) -> Self {
        Response::Error { errno: err.errno() }
    }
}
