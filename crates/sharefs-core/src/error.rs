// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for sharefs core

/// Failure reported by a storage engine call.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("no such item")]
    NotFound,
    #[error("item already exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("storage errno {0}")]
    Errno(i32),
}

impl StorageError {
    pub fn errno(&self) -> i32 {
        match self {
            StorageError::NotFound => libc::ENOENT,
            StorageError::AlreadyExists => libc::EEXIST,
            StorageError::NotADirectory => libc::ENOTDIR,
            StorageError::Errno(code) => *code,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Core error type
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    /// A live, incompatible share reservation exists.
    #[error("share reservation conflict")]
    ShareConflict,
    #[error("already exists")]
    AlreadyExists,
    /// The operation needs an open descriptor and the slot is closed.
    #[error("descriptor not open")]
    NotOpen,
    #[error("storage failure: {0}")]
    Storage(StorageError),
    #[error("invalid argument")]
    InvalidArgument,
    #[error("not supported")]
    NotSupported,
    #[error("not found")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("file too big")]
    FileTooBig,
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<StorageError> for FsError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound => FsError::NotFound,
            StorageError::AlreadyExists => FsError::AlreadyExists,
            StorageError::NotADirectory => FsError::NotADirectory,
            other => FsError::Storage(other),
        }
    }
}

impl FsError {
    /// Outcomes a client is expected to see during normal operation.
    /// These are not faults and are never logged above debug.
    pub fn is_expected(&self) -> bool {
        matches!(self, FsError::ShareConflict | FsError::AlreadyExists)
    }

    /// POSIX errno for front-ends that report numeric status codes.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::ShareConflict => libc::EACCES,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NotOpen => libc::EBADF,
            FsError::Storage(err) => err.errno(),
            FsError::InvalidArgument | FsError::Config(_) => libc::EINVAL,
            FsError::NotSupported => libc::ENOTSUP,
            FsError::NotFound => libc::ENOENT,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::FileTooBig => libc::EFBIG,
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;
