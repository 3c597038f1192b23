// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the iofunc framework

use std::io;

/// Errors returned by every framework operation.
///
/// Each variant corresponds to the POSIX errno that the transport hands back
/// to the client; see [`IoFuncError::errno`].
#[derive(thiserror::Error, Debug)]
pub enum IoFuncError {
    #[error("permission denied")]
    AccessDenied,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("out of memory")]
    NoMemory,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("read-only filesystem")]
    ReadOnly,
    #[error("resource temporarily unavailable")]
    WouldBlock,
    #[error("resource busy")]
    Busy,
    #[error("interrupted")]
    Interrupted,
    #[error("inappropriate ioctl for device")]
    NotTty,
    #[error("function not implemented")]
    NotSupported,
    #[error("no such file or directory")]
    NotFound,
    #[error("file exists")]
    AlreadyExists,
    #[error("file name too long")]
    NameTooLong,
    #[error("is a directory")]
    IsDirectory,
    #[error("resource deadlock avoided")]
    Deadlock,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl IoFuncError {
    /// The errno value the client observes for this error.
    pub fn errno(&self) -> i32 {
        match self {
            IoFuncError::AccessDenied => libc::EACCES,
            IoFuncError::NotPermitted => libc::EPERM,
            IoFuncError::NoMemory => libc::ENOMEM,
            IoFuncError::InvalidArgument => libc::EINVAL,
            IoFuncError::BadFileDescriptor => libc::EBADF,
            IoFuncError::ReadOnly => libc::EROFS,
            IoFuncError::WouldBlock => libc::EAGAIN,
            IoFuncError::Busy => libc::EBUSY,
            IoFuncError::Interrupted => libc::EINTR,
            IoFuncError::NotTty => libc::ENOTTY,
            IoFuncError::NotSupported => libc::ENOSYS,
            IoFuncError::NotFound => libc::ENOENT,
            IoFuncError::AlreadyExists => libc::EEXIST,
            IoFuncError::NameTooLong => libc::ENAMETOOLONG,
            IoFuncError::IsDirectory => libc::EISDIR,
            IoFuncError::Deadlock => libc::EDEADLK,
            IoFuncError::Internal(_) => libc::EIO,
            IoFuncError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Reconstruct an error from an errno, used when replaying recorded replies.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EACCES => IoFuncError::AccessDenied,
            libc::EPERM => IoFuncError::NotPermitted,
            libc::ENOMEM => IoFuncError::NoMemory,
            libc::EINVAL => IoFuncError::InvalidArgument,
            libc::EBADF => IoFuncError::BadFileDescriptor,
            libc::EROFS => IoFuncError::ReadOnly,
            libc::EAGAIN => IoFuncError::WouldBlock,
            libc::EBUSY => IoFuncError::Busy,
            libc::EINTR => IoFuncError::Interrupted,
            libc::ENOTTY => IoFuncError::NotTty,
            libc::ENOSYS => IoFuncError::NotSupported,
            libc::ENOENT => IoFuncError::NotFound,
            libc::EEXIST => IoFuncError::AlreadyExists,
            libc::ENAMETOOLONG => IoFuncError::NameTooLong,
            libc::EISDIR => IoFuncError::IsDirectory,
            libc::EDEADLK => IoFuncError::Deadlock,
            other => IoFuncError::Io(io::Error::from_raw_os_error(other)),
        }
    }
}

pub type IoResult<T> = Result<T, IoFuncError>;
