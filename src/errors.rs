// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::io;

use thiserror::Error;

/// Platform-neutral error classes surfaced to callers of the client API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("not found")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("i/o error")]
    IoError,
    #[error("out of memory")]
    OutOfMemory,
    #[error("no space")]
    NoSpace,
    #[error("name too long")]
    NameTooLong,
    #[error("host unreachable")]
    HostUnreachable,
    #[error("not a file")]
    NotAFile,
    #[error("is a directory")]
    IsDirectory,
    #[error("unsupported")]
    Unsupported,
    #[error("timeout")]
    Timeout,
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("too many errors")]
    TooManyErrors,
    #[error("protocol unsupported")]
    ProtocolUnsupported,
    #[error("canceled")]
    Canceled,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("file not open")]
    NotOpen,
}

/// Error type returned by every public operation of the crate.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ClientError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ClientError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::IoError, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, msg)
    }

    pub fn canceled(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, msg)
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, msg)
    }

    pub fn unsupported_protocol(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolUnsupported, msg)
    }

    pub fn not_open(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotOpen, msg)
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::OutOfMemory => ErrorKind::OutOfMemory,
            _ => ErrorKind::IoError,
        };
        Self::new(kind, e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ClientError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::new(ErrorKind::Timeout, "operation timed out")
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Fixed mapping of server error numbers onto [`ErrorKind`].
pub fn map_server_errno(errnum: i32) -> ErrorKind {
    use crate::models::reqcode::ServerErrno as E;
    match E::from_i32(errnum) {
        Some(E::NotFound) => ErrorKind::NotFound,
        Some(E::NotAuthorized) => ErrorKind::PermissionDenied,
        Some(E::IoError) => ErrorKind::IoError,
        Some(E::NoMemory) => ErrorKind::OutOfMemory,
        Some(E::NoSpace) => ErrorKind::NoSpace,
        Some(E::ArgTooLong) => ErrorKind::NameTooLong,
        Some(E::NoServer) => ErrorKind::HostUnreachable,
        Some(E::NotFile) => ErrorKind::NotAFile,
        Some(E::IsDirectory) => ErrorKind::IsDirectory,
        Some(E::FsError) => ErrorKind::Unsupported,
        _ => ErrorKind::Canceled,
    }
}
