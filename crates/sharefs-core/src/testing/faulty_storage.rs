// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Failure-injecting storage engine decorator
//!
//! `FaultyStorage` delegates to an inner engine and fails selected
//! operations by name, counting every call. Unlike the engine-level
//! `FaultInjector`, it wraps any engine and can fail operations the
//! injector does not cover, such as `unlink` or `root`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{StorageError, StorageResult};
use crate::storage::{Fd, ItemRef, StorageEngine};
use crate::types::{AttrSet, DirEntry, OpenFlags, Stat};

/// Configurable failure behaviour.
#[derive(Default)]
pub enum FailureBehavior {
    #[default]
    AlwaysSucceed,
    /// Fail the first `count` calls of `op`.
    FailFor {
        op: &'static str,
        count: u64,
        error: StorageError,
    },
    AlwaysFail {
        op: &'static str,
        error: StorageError,
    },
}

pub struct FaultyStorage {
    inner: Arc<dyn StorageEngine>,
    behavior: Mutex<FailureBehavior>,
    call_counts: Mutex<HashMap<&'static str, u64>>,
}

impl FaultyStorage {
    pub fn new(inner: Arc<dyn StorageEngine>) -> Self {
        Self::with_behavior(inner, FailureBehavior::AlwaysSucceed)
    }

    pub fn with_behavior(inner: Arc<dyn StorageEngine>, behavior: FailureBehavior) -> Self {
        Self {
            inner,
            behavior: Mutex::new(behavior),
            call_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the behaviour and restart call counting.
    pub fn set_behavior(&self, behavior: FailureBehavior) {
        *self.behavior.lock() = behavior;
        self.call_counts.lock().clear();
    }

    pub fn call_count(&self, op: &str) -> u64 {
        self.call_counts.lock().get(op).copied().unwrap_or(0)
    }

    fn check_fault(&self, op: &'static str) -> StorageResult<()> {
        let index = {
            let mut counts = self.call_counts.lock();
            let counter = counts.entry(op).or_insert(0);
            let index = *counter;
            *counter += 1;
            index
        };

        let failure = match &*self.behavior.lock() {
            FailureBehavior::AlwaysSucceed => None,
            FailureBehavior::FailFor {
                op: target,
                count,
                error,
            } => (op == *target && index < *count).then(|| error.clone()),
            FailureBehavior::AlwaysFail { op: target, error } => {
                (op == *target).then(|| error.clone())
            }
        };
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl StorageEngine for FaultyStorage {
    fn fsid(&self) -> u64 {
        self.inner.fsid()
    }

    fn root(&self) -> StorageResult<(ItemRef, Stat)> {
        self.check_fault("root")?;
        self.inner.root()
    }

    fn lookup_child(&self, parent: &ItemRef, name: &str) -> StorageResult<(ItemRef, Stat)> {
        self.check_fault("lookup_child")?;
        self.inner.lookup_child(parent, name)
    }

    fn lookup_fileid(&self, fileid: u64) -> StorageResult<(ItemRef, Stat)> {
        self.check_fault("lookup_fileid")?;
        self.inner.lookup_fileid(fileid)
    }

    fn create_child(
        &self,
        parent: &ItemRef,
        name: &str,
        attrs: &AttrSet,
        flags: OpenFlags,
        exclusive: bool,
    ) -> StorageResult<(ItemRef, Fd, Stat)> {
        self.check_fault("create_child")?;
        self.inner.create_child(parent, name, attrs, flags, exclusive)
    }

    fn mkdir(
        &self,
        parent: &ItemRef,
        name: &str,
        attrs: &AttrSet,
    ) -> StorageResult<(ItemRef, Stat)> {
        self.check_fault("mkdir")?;
        self.inner.mkdir(parent, name, attrs)
    }

    fn unlink(&self, parent: &ItemRef, name: &str) -> StorageResult<()> {
        self.check_fault("unlink")?;
        self.inner.unlink(parent, name)
    }

    fn read_dir(&self, dir: &ItemRef, start: u64) -> StorageResult<Vec<DirEntry>> {
        self.check_fault("read_dir")?;
        self.inner.read_dir(dir, start)
    }

    fn get_attributes(&self, item: &ItemRef) -> StorageResult<Stat> {
        self.check_fault("get_attributes")?;
        self.inner.get_attributes(item)
    }

    fn set_attributes(&self, item: &ItemRef, attrs: &AttrSet) -> StorageResult<Stat> {
        self.check_fault("set_attributes")?;
        self.inner.set_attributes(item, attrs)
    }

    fn release_item(&self, item: &ItemRef) {
        self.inner.release_item(item)
    }

    fn open(&self, item: &ItemRef, flags: OpenFlags) -> StorageResult<Fd> {
        self.check_fault("open")?;
        self.inner.open(item, flags)
    }

    fn close(&self, fd: Fd) -> StorageResult<()> {
        if let Err(err) = self.check_fault("close") {
            // The descriptor is consumed either way.
            let _ = self.inner.close(fd);
            return Err(err);
        }
        self.inner.close(fd)
    }

    fn read(&self, fd: &Fd, offset: u64, buf: &mut [u8]) -> StorageResult<usize> {
        self.check_fault("read")?;
        self.inner.read(fd, offset, buf)
    }

    fn write(&self, fd: &Fd, offset: u64, data: &[u8]) -> StorageResult<usize> {
        self.check_fault("write")?;
        self.inner.write(fd, offset, data)
    }

    fn flush(&self, fd: &Fd, data_only: bool) -> StorageResult<()> {
        self.check_fault("flush")?;
        self.inner.flush(fd, data_only)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryEngine;

    fn wrapped(behavior: FailureBehavior) -> (Arc<InMemoryEngine>, FaultyStorage) {
        let base = Arc::new(InMemoryEngine::new());
        let faulty = FaultyStorage::with_behavior(Arc::clone(&base) as Arc<dyn StorageEngine>, behavior);
        (base, faulty)
    }

    fn file(engine: &dyn StorageEngine) -> (ItemRef, Fd) {
        let (root, _) = engine.root().unwrap();
        let (item, fd, _) = engine
            .create_child(&root, "f", &AttrSet::with_mode(0o644), OpenFlags::RDWR, true)
            .unwrap();
        (item, fd)
    }

    #[test]
    fn fail_for_count_then_recover() {
        let (_base, faulty) = wrapped(FailureBehavior::FailFor {
            op: "root",
            count: 1,
            error: StorageError::Errno(libc::EACCES),
        });
        assert!(faulty.root().is_err());
        assert!(faulty.root().is_ok());
    }

    #[test]
    fn failed_close_still_consumes_descriptor() {
        let (base, faulty) = wrapped(FailureBehavior::AlwaysFail {
            op: "close",
            error: StorageError::Errno(libc::EIO),
        });
        let (_item, fd) = file(&faulty);
        assert!(faulty.close(fd).is_err());
        assert_eq!(base.open_descriptors(), 0);
    }

    #[test]
    fn behaviour_can_be_swapped_at_runtime() {
        let base = Arc::new(InMemoryEngine::new());
        let faulty = FaultyStorage::new(Arc::clone(&base) as Arc<dyn StorageEngine>);
        let (_item, fd) = file(&faulty);
        assert!(faulty.flush(&fd, true).is_ok());
        faulty.set_behavior(FailureBehavior::AlwaysFail {
            op: "flush",
            error: StorageError::Errno(libc::EIO),
        });
        assert!(faulty.flush(&fd, true).is_err());
        assert_eq!(faulty.call_count("flush"), 1);
        faulty.set_behavior(FailureBehavior::AlwaysSucceed);
        assert!(faulty.flush(&fd, true).is_ok());
        assert_eq!(faulty.call_count("flush"), 1);
        faulty.close(fd).unwrap();
    }
}
