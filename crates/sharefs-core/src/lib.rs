// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! sharefs core: share reservations and descriptor lifecycle for one export
//!
//! An [`Export`] arbitrates opens, reads, writes and closes of the objects of
//! one storage engine. Opens made on behalf of a [`ClientState`] are counted
//! in the object's share table and get their own descriptor; stateless
//! operations share the object's global descriptor or open a short-lived one.

pub mod config;
pub mod dir;
pub mod error;
pub mod export;
pub mod fault;
pub mod handle;
pub mod io;
pub mod logging;
pub mod open;
pub mod share;
pub mod slot;
pub mod state;
pub mod storage;
pub mod testing;
pub mod types;

pub use config::{ExportConfig, ModuleConfig, SharefsConfig};
pub use error::{FsError, FsResult, StorageError, StorageResult};
pub use export::Export;
pub use fault::{FaultErrno, FaultInjector, FaultOp, FaultPolicy, FaultRule};
pub use handle::ObjectHandle;
pub use io::{IoLease, ReadOutcome, WriteOutcome};
pub use logging::{LogFormat, LoggingConfig};
pub use open::{CreateRequest, OpenOutcome};
pub use share::ShareReservation;
pub use state::{ClientState, StateId, StateKind};
pub use storage::{Fd, InMemoryEngine, ItemRef, StorageEngine};
pub use types::{
    AttrSet, CreateMode, DirEntry, FileTime, ObjectKey, ObjectType, OpenFlags, Stat, Verifier,
};
