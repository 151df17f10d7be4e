// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Storage engine contract and the in-memory engine
//!
//! The engine owns persistent items and performs the actual lookups, creates
//! and descriptor I/O. This crate only arbitrates access to it; the engine
//! carries no locking responsibility beyond being `Send + Sync`.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::error::{StorageError, StorageResult};
use crate::fault::{FaultInjector, FaultOp, FaultPolicy};
use crate::types::{AttrSet, DirEntry, FileTime, ObjectType, OpenFlags, Stat};

/// Reference to an engine item. Each lookup hands out a fresh reference that
/// the receiver owns until it passes it to [`StorageEngine::release_item`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ItemRef(u64);

impl ItemRef {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Open engine descriptor. Consumed by [`StorageEngine::close`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Fd(u64);

impl Fd {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Storage engine contract consumed by the core.
#[cfg_attr(test, mockall::automock)]
pub trait StorageEngine: Send + Sync {
    /// Filesystem id reported in every [`Stat`].
    fn fsid(&self) -> u64;

    fn root(&self) -> StorageResult<(ItemRef, Stat)>;
    fn lookup_child(&self, parent: &ItemRef, name: &str) -> StorageResult<(ItemRef, Stat)>;
    /// Resolve a file id from a wire handle.
    fn lookup_fileid(&self, fileid: u64) -> StorageResult<(ItemRef, Stat)>;
    /// Create a regular file and open it. Without `exclusive` an existing
    /// regular file is opened instead.
    fn create_child(
        &self,
        parent: &ItemRef,
        name: &str,
        attrs: &AttrSet,
        flags: OpenFlags,
        exclusive: bool,
    ) -> StorageResult<(ItemRef, Fd, Stat)>;
    fn mkdir(&self, parent: &ItemRef, name: &str, attrs: &AttrSet)
        -> StorageResult<(ItemRef, Stat)>;
    fn unlink(&self, parent: &ItemRef, name: &str) -> StorageResult<()>;
    /// Entries whose cookie is greater than `start`, in cookie order.
    fn read_dir(&self, dir: &ItemRef, start: u64) -> StorageResult<Vec<DirEntry>>;
    fn get_attributes(&self, item: &ItemRef) -> StorageResult<Stat>;
    fn set_attributes(&self, item: &ItemRef, attrs: &AttrSet) -> StorageResult<Stat>;
    fn release_item(&self, item: &ItemRef);

    fn open(&self, item: &ItemRef, flags: OpenFlags) -> StorageResult<Fd>;
    fn close(&self, fd: Fd) -> StorageResult<()>;
    /// Returns 0 at end of file.
    fn read(&self, fd: &Fd, offset: u64, buf: &mut [u8]) -> StorageResult<usize>;
    fn write(&self, fd: &Fd, offset: u64, data: &[u8]) -> StorageResult<usize>;
    fn flush(&self, fd: &Fd, data_only: bool) -> StorageResult<()>;
}

const ROOT_FILEID: u64 = 1;

#[derive(Debug)]
struct MemItem {
    stat: Stat,
    data: Vec<u8>,
    children: BTreeMap<String, u64>,
}

#[derive(Debug)]
struct OpenFile {
    fileid: u64,
    flags: OpenFlags,
}

#[derive(Debug, Default)]
struct MemState {
    items: HashMap<u64, MemItem>,
    refs: HashMap<u64, u64>,
    fds: HashMap<u64, OpenFile>,
    next_fileid: u64,
    next_ref: u64,
    next_fd: u64,
    flushes: u64,
}

impl MemState {
    fn fileid(&self, item: &ItemRef) -> StorageResult<u64> {
        self.refs.get(&item.raw()).copied().ok_or(StorageError::Errno(libc::ESTALE))
    }

    fn item(&self, item: &ItemRef) -> StorageResult<&MemItem> {
        let fileid = self.fileid(item)?;
        self.items.get(&fileid).ok_or(StorageError::Errno(libc::ESTALE))
    }

    fn new_ref(&mut self, fileid: u64) -> ItemRef {
        self.next_ref += 1;
        self.refs.insert(self.next_ref, fileid);
        ItemRef::new(self.next_ref)
    }

    fn new_fd(&mut self, fileid: u64, flags: OpenFlags) -> Fd {
        self.next_fd += 1;
        self.fds.insert(
            self.next_fd,
            OpenFile {
                fileid,
                flags: flags.persistent(),
            },
        );
        Fd::new(self.next_fd)
    }

    fn open_file(&self, fd: &Fd) -> StorageResult<&OpenFile> {
        self.fds.get(&fd.raw()).ok_or(StorageError::Errno(libc::EBADF))
    }

    fn directory(&self, item: &ItemRef) -> StorageResult<(u64, &MemItem)> {
        let fileid = self.fileid(item)?;
        let dir = self.items.get(&fileid).ok_or(StorageError::Errno(libc::ESTALE))?;
        if dir.stat.kind() != ObjectType::Directory {
            return Err(StorageError::NotADirectory);
        }
        Ok((fileid, dir))
    }

    fn insert_child(&mut self, parent: u64, name: &str, stat: Stat) -> u64 {
        let fileid = stat.fileid;
        if stat.kind() == ObjectType::Directory {
            if let Some(dir) = self.items.get_mut(&parent) {
                dir.stat.nlink += 1;
            }
        }
        self.items.insert(
            fileid,
            MemItem {
                stat,
                data: Vec::new(),
                children: BTreeMap::new(),
            },
        );
        if let Some(dir) = self.items.get_mut(&parent) {
            dir.children.insert(name.to_string(), fileid);
            let now = FileTime::now();
            dir.stat.mtime = now;
            dir.stat.ctime = now;
        }
        fileid
    }
}

/// In-memory storage engine.
///
/// Items live in a map keyed by file id. Every lookup hands out a new item
/// reference, so two lookups of one name yield two independent handles.
pub struct InMemoryEngine {
    fsid: u64,
    state: Mutex<MemState>,
    faults: FaultInjector,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::with_fsid(1)
    }

    pub fn with_fsid(fsid: u64) -> Self {
        let now = FileTime::now();
        let mut state = MemState {
            next_fileid: ROOT_FILEID,
            ..Default::default()
        };
        state.items.insert(
            ROOT_FILEID,
            MemItem {
                stat: Stat {
                    fsid,
                    fileid: ROOT_FILEID,
                    size: 0,
                    nlink: 2,
                    uid: 0,
                    gid: 0,
                    mode: libc::S_IFDIR as u32 | 0o755,
                    atime: now,
                    mtime: now,
                    ctime: now,
                },
                data: Vec::new(),
                children: BTreeMap::new(),
            },
        );
        Self {
            fsid,
            state: Mutex::new(state),
            faults: FaultInjector::new(),
        }
    }

    pub fn with_fault_policy(policy: FaultPolicy) -> Self {
        let engine = Self::new();
        engine.faults.set_policy(policy);
        engine
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Number of descriptors currently open.
    pub fn open_descriptors(&self) -> usize {
        self.state.lock().fds.len()
    }

    /// Number of item references not yet released.
    pub fn live_item_refs(&self) -> usize {
        self.state.lock().refs.len()
    }

    /// Number of successful flushes.
    pub fn flush_count(&self) -> u64 {
        self.state.lock().flushes
    }

    fn check(&self, op: FaultOp) -> StorageResult<()> {
        match self.faults.should_fault(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn new_stat(&self, fileid: u64, type_bits: u32, attrs: &AttrSet) -> Stat {
        let now = FileTime::now();
        Stat {
            fsid: self.fsid,
            fileid,
            size: 0,
            nlink: if type_bits == libc::S_IFDIR as u32 { 2 } else { 1 },
            uid: attrs.uid.unwrap_or(0),
            gid: attrs.gid.unwrap_or(0),
            mode: type_bits | (attrs.mode.unwrap_or(0o644) & 0o7777),
            atime: attrs.atime.unwrap_or(now),
            mtime: attrs.mtime.unwrap_or(now),
            ctime: now,
        }
    }
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate_item(item: &mut MemItem, len: u64) {
    item.data.resize(len as usize, 0);
    item.stat.size = len;
    let now = FileTime::now();
    item.stat.mtime = now;
    item.stat.ctime = now;
}

impl StorageEngine for InMemoryEngine {
    fn fsid(&self) -> u64 {
        self.fsid
    }

    fn root(&self) -> StorageResult<(ItemRef, Stat)> {
        let mut state = self.state.lock();
        let stat = state
            .items
            .get(&ROOT_FILEID)
            .map(|root| root.stat.clone())
            .ok_or(StorageError::NotFound)?;
        Ok((state.new_ref(ROOT_FILEID), stat))
    }

    fn lookup_child(&self, parent: &ItemRef, name: &str) -> StorageResult<(ItemRef, Stat)> {
        self.check(FaultOp::Lookup)?;
        let mut state = self.state.lock();
        let (_, dir) = state.directory(parent)?;
        let fileid = *dir.children.get(name).ok_or(StorageError::NotFound)?;
        let stat = state
            .items
            .get(&fileid)
            .map(|item| item.stat.clone())
            .ok_or(StorageError::NotFound)?;
        Ok((state.new_ref(fileid), stat))
    }

    fn lookup_fileid(&self, fileid: u64) -> StorageResult<(ItemRef, Stat)> {
        self.check(FaultOp::Lookup)?;
        let mut state = self.state.lock();
        let stat = state
            .items
            .get(&fileid)
            .map(|item| item.stat.clone())
            .ok_or(StorageError::NotFound)?;
        Ok((state.new_ref(fileid), stat))
    }

    fn create_child(
        &self,
        parent: &ItemRef,
        name: &str,
        attrs: &AttrSet,
        flags: OpenFlags,
        exclusive: bool,
    ) -> StorageResult<(ItemRef, Fd, Stat)> {
        self.check(FaultOp::Create)?;
        let mut state = self.state.lock();
        let (parent_id, dir) = state.directory(parent)?;

        if let Some(&existing) = dir.children.get(name) {
            if exclusive {
                return Err(StorageError::AlreadyExists);
            }
            let item = state.items.get_mut(&existing).ok_or(StorageError::NotFound)?;
            if item.stat.kind() != ObjectType::RegularFile {
                return Err(StorageError::Errno(libc::EISDIR));
            }
            if flags.contains(OpenFlags::TRUNC) && flags.contains(OpenFlags::WRITE) {
                truncate_item(item, 0);
            }
            let stat = item.stat.clone();
            let item_ref = state.new_ref(existing);
            let fd = state.new_fd(existing, flags);
            return Ok((item_ref, fd, stat));
        }

        state.next_fileid += 1;
        let fileid = state.next_fileid;
        let stat = self.new_stat(fileid, libc::S_IFREG as u32, attrs);
        state.insert_child(parent_id, name, stat.clone());
        let item_ref = state.new_ref(fileid);
        let fd = state.new_fd(fileid, flags);
        Ok((item_ref, fd, stat))
    }

    fn mkdir(
        &self,
        parent: &ItemRef,
        name: &str,
        attrs: &AttrSet,
    ) -> StorageResult<(ItemRef, Stat)> {
        self.check(FaultOp::Create)?;
        let mut state = self.state.lock();
        let (parent_id, dir) = state.directory(parent)?;
        if dir.children.contains_key(name) {
            return Err(StorageError::AlreadyExists);
        }
        state.next_fileid += 1;
        let fileid = state.next_fileid;
        let stat = self.new_stat(fileid, libc::S_IFDIR as u32, attrs);
        state.insert_child(parent_id, name, stat.clone());
        Ok((state.new_ref(fileid), stat))
    }

    fn unlink(&self, parent: &ItemRef, name: &str) -> StorageResult<()> {
        self.check(FaultOp::Unlink)?;
        let mut state = self.state.lock();
        let (parent_id, dir) = state.directory(parent)?;
        let fileid = *dir.children.get(name).ok_or(StorageError::NotFound)?;
        let victim = state.items.get(&fileid).ok_or(StorageError::NotFound)?;
        if !victim.children.is_empty() {
            return Err(StorageError::Errno(libc::ENOTEMPTY));
        }
        let was_dir = victim.stat.kind() == ObjectType::Directory;
        state.items.remove(&fileid);
        if let Some(dir) = state.items.get_mut(&parent_id) {
            dir.children.remove(name);
            if was_dir {
                dir.stat.nlink = dir.stat.nlink.saturating_sub(1);
            }
        }
        Ok(())
    }

    fn read_dir(&self, dir: &ItemRef, start: u64) -> StorageResult<Vec<DirEntry>> {
        let state = self.state.lock();
        let (_, dir) = state.directory(dir)?;
        let entries = dir
            .children
            .iter()
            .enumerate()
            .map(|(index, (name, fileid))| DirEntry {
                name: name.clone(),
                fileid: *fileid,
                kind: state
                    .items
                    .get(fileid)
                    .map(|item| item.stat.kind())
                    .unwrap_or(ObjectType::Other),
                cookie: index as u64 + 1,
            })
            .filter(|entry| entry.cookie > start)
            .collect();
        Ok(entries)
    }

    fn get_attributes(&self, item: &ItemRef) -> StorageResult<Stat> {
        self.check(FaultOp::GetAttr)?;
        let state = self.state.lock();
        Ok(state.item(item)?.stat.clone())
    }

    fn set_attributes(&self, item: &ItemRef, attrs: &AttrSet) -> StorageResult<Stat> {
        self.check(FaultOp::SetAttr)?;
        let mut state = self.state.lock();
        let fileid = state.fileid(item)?;
        let item = state.items.get_mut(&fileid).ok_or(StorageError::Errno(libc::ESTALE))?;
        if let Some(size) = attrs.size {
            if item.stat.kind() != ObjectType::RegularFile {
                return Err(StorageError::Errno(libc::EINVAL));
            }
            truncate_item(item, size);
        }
        if let Some(mode) = attrs.mode {
            item.stat.mode = (item.stat.mode & libc::S_IFMT as u32) | (mode & 0o7777);
        }
        if let Some(uid) = attrs.uid {
            item.stat.uid = uid;
        }
        if let Some(gid) = attrs.gid {
            item.stat.gid = gid;
        }
        if let Some(atime) = attrs.atime {
            item.stat.atime = atime;
        }
        if let Some(mtime) = attrs.mtime {
            item.stat.mtime = mtime;
        }
        item.stat.ctime = FileTime::now();
        Ok(item.stat.clone())
    }

    fn release_item(&self, item: &ItemRef) {
        self.state.lock().refs.remove(&item.raw());
    }

    fn open(&self, item: &ItemRef, flags: OpenFlags) -> StorageResult<Fd> {
        self.check(FaultOp::Open)?;
        let mut state = self.state.lock();
        let fileid = state.fileid(item)?;
        let target = state.items.get_mut(&fileid).ok_or(StorageError::Errno(libc::ESTALE))?;
        if target.stat.kind() == ObjectType::Directory && flags.contains(OpenFlags::WRITE) {
            return Err(StorageError::Errno(libc::EISDIR));
        }
        if flags.contains(OpenFlags::TRUNC) && flags.contains(OpenFlags::WRITE) {
            truncate_item(target, 0);
        }
        Ok(state.new_fd(fileid, flags))
    }

    fn close(&self, fd: Fd) -> StorageResult<()> {
        let closed = self.state.lock().fds.remove(&fd.raw());
        self.check(FaultOp::Close)?;
        closed.map(|_| ()).ok_or(StorageError::Errno(libc::EBADF))
    }

    fn read(&self, fd: &Fd, offset: u64, buf: &mut [u8]) -> StorageResult<usize> {
        self.check(FaultOp::Read)?;
        let state = self.state.lock();
        let file = state.open_file(fd)?;
        if !file.flags.contains(OpenFlags::READ) {
            return Err(StorageError::Errno(libc::EBADF));
        }
        let item = state.items.get(&file.fileid).ok_or(StorageError::Errno(libc::ESTALE))?;
        let start = offset as usize;
        if start >= item.data.len() {
            return Ok(0);
        }
        let end = std::cmp::min(start + buf.len(), item.data.len());
        buf[..end - start].copy_from_slice(&item.data[start..end]);
        Ok(end - start)
    }

    fn write(&self, fd: &Fd, offset: u64, data: &[u8]) -> StorageResult<usize> {
        self.check(FaultOp::Write)?;
        let mut state = self.state.lock();
        let file = state.open_file(fd)?;
        if !file.flags.contains(OpenFlags::WRITE) {
            return Err(StorageError::Errno(libc::EBADF));
        }
        let fileid = file.fileid;
        let item = state.items.get_mut(&fileid).ok_or(StorageError::Errno(libc::ESTALE))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > item.data.len() {
            item.data.resize(end, 0);
            item.stat.size = end as u64;
        }
        item.data[start..end].copy_from_slice(data);
        let now = FileTime::now();
        item.stat.mtime = now;
        item.stat.ctime = now;
        Ok(data.len())
    }

    fn flush(&self, fd: &Fd, _data_only: bool) -> StorageResult<()> {
        self.check(FaultOp::Flush)?;
        let mut state = self.state.lock();
        state.open_file(fd)?;
        state.flushes += 1;
        Ok(())
    }
}
