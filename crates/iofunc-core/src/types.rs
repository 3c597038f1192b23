// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions shared across the framework

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Receive id of one client message. Deferred replies are addressed by it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RcvId(pub u64);

/// Opaque open-control-block identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OcbId(pub u64);

/// Inode number of an attribute
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ino(pub u64);

/// A client connection: the client process plus the connection id it uses
/// for one handle. Duplicated handles share an OCB but not a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub pid: u32,
    pub coid: u32,
}

impl ConnectionKey {
    pub fn new(pid: u32, coid: u32) -> Self {
        Self { pid, coid }
    }
}

/// Security identity of the client that sent a message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
    #[serde(default)]
    pub groups: Vec<u32>,
}

impl ClientInfo {
    pub fn new(pid: u32, uid: u32, gid: u32) -> Self {
        Self {
            pid,
            uid,
            gid,
            groups: vec![gid],
        }
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    pub fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }
}

/// Seconds since the epoch, the resolution attribute times are kept at
pub type Timestamp = i64;

pub(crate) fn current_timestamp() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

bitflags! {
    /// Access and status flags an OCB was opened with.
    ///
    /// The access bits are the POSIX access mode plus one, so `O_RDONLY`
    /// becomes `READ`, `O_WRONLY` becomes `WRITE`, `O_RDWR` both, and an
    /// empty set means "not recorded".
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct IoFlags: u32 {
        const READ = 0x0001;
        const WRITE = 0x0002;
        const APPEND = 0x0004;
        const NONBLOCK = 0x0008;
        const SYNC = 0x0010;
        const DSYNC = 0x0020;
        const TRUNC = 0x0040;
        const CREAT = 0x0080;
        const EXCL = 0x0100;
    }
}

impl IoFlags {
    /// Status bits a client may toggle after open via `SETFLAGS`
    pub const SETTABLE: IoFlags = IoFlags::APPEND
        .union(IoFlags::NONBLOCK)
        .union(IoFlags::SYNC)
        .union(IoFlags::DSYNC);

    /// Translate POSIX `open(2)` flags.
    pub fn from_oflag(oflag: i32) -> IoFlags {
        let access = ((oflag & libc::O_ACCMODE) + 1) as u32 & (Self::READ | Self::WRITE).bits();
        let mut flags = IoFlags::from_bits_truncate(access);
        for (posix, ours) in [
            (libc::O_APPEND, IoFlags::APPEND),
            (libc::O_NONBLOCK, IoFlags::NONBLOCK),
            (libc::O_SYNC, IoFlags::SYNC),
            (libc::O_DSYNC, IoFlags::DSYNC),
            (libc::O_TRUNC, IoFlags::TRUNC),
            (libc::O_CREAT, IoFlags::CREAT),
            (libc::O_EXCL, IoFlags::EXCL),
        ] {
            if oflag & posix == posix {
                flags |= ours;
            }
        }
        flags
    }

    /// Inverse of [`IoFlags::from_oflag`] for the bits that survive open.
    pub fn to_oflag(self) -> i32 {
        let access = (self & (IoFlags::READ | IoFlags::WRITE)).bits() as i32;
        let mut oflag = if access == 0 { 0 } else { access - 1 };
        for (posix, ours) in [
            (libc::O_APPEND, IoFlags::APPEND),
            (libc::O_NONBLOCK, IoFlags::NONBLOCK),
            (libc::O_SYNC, IoFlags::SYNC),
            (libc::O_DSYNC, IoFlags::DSYNC),
        ] {
            if self.contains(ours) {
                oflag |= posix;
            }
        }
        oflag
    }
}

/// Share mode requested at open time (deny semantics)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareMode {
    #[default]
    DenyNone,
    DenyRead,
    DenyWrite,
    DenyReadWrite,
}

impl ShareMode {
    pub fn denies_read(self) -> bool {
        matches!(self, ShareMode::DenyRead | ShareMode::DenyReadWrite)
    }

    pub fn denies_write(self) -> bool {
        matches!(self, ShareMode::DenyWrite | ShareMode::DenyReadWrite)
    }
}

/// Origin for `lseek`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// Requested access for [`crate::defaults::check_access`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Access {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

impl Access {
    pub const READ: Access = Access {
        read: true,
        write: false,
        exec: false,
    };
    pub const WRITE: Access = Access {
        read: false,
        write: true,
        exec: false,
    };
    pub const EXEC: Access = Access {
        read: false,
        write: false,
        exec: true,
    };

    pub fn for_ioflags(flags: IoFlags) -> Access {
        Access {
            read: flags.contains(IoFlags::READ),
            write: flags.contains(IoFlags::WRITE),
            exec: false,
        }
    }

    /// rwx bits of this request positioned in the "other" triplet
    pub(crate) fn bits(self) -> u32 {
        (if self.read { 0o4 } else { 0 })
            | (if self.write { 0o2 } else { 0 })
            | (if self.exec { 0o1 } else { 0 })
    }
}

/// File type bits of a mode
pub fn file_type(mode: u32) -> u32 {
    mode & libc::S_IFMT as u32
}

pub fn is_dir(mode: u32) -> bool {
    file_type(mode) == libc::S_IFDIR as u32
}

pub fn is_fifo(mode: u32) -> bool {
    file_type(mode) == libc::S_IFIFO as u32
}

/// Attribute snapshot reported by `stat`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub ino: u64,
    pub size: u64,
    pub dev: u64,
    pub rdev: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub nlink: u32,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub blksize: u32,
    pub blocks: u64,
}

/// Per-handle information returned by `fdinfo`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdInfo {
    pub ioflag: IoFlags,
    pub offset: u64,
    pub size: u64,
    pub share: ShareMode,
    pub count: u32,
    pub rcount: u32,
    pub wcount: u32,
    pub rlocks: u32,
    pub wlocks: u32,
    pub mmaps: u32,
    pub byte_locks: u32,
}
