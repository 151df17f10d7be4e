// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Data path: descriptor leases and the read/write/commit/setattr operations
//!
//! Every I/O runs under an [`IoLease`]. A lease pins the descriptor it hands
//! out and releases, in this order: the slot's fd lock, then the ephemeral
//! descriptor if one was opened, then the object lock.

use parking_lot::RwLockReadGuard;
use tracing::{debug, warn};

use crate::error::{FsError, FsResult};
use crate::export::Export;
use crate::handle::ObjectHandle;
use crate::share::ShareReservation;
use crate::slot::SlotState;
use crate::state::ClientState;
use crate::storage::{Fd, StorageEngine};
use crate::types::{AttrSet, OpenFlags, Stat};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ShareCheck {
    Full,
    /// Advisory deny bits waived; mandatory deny-write still enforced.
    Bypass,
}

enum LeaseFd<'a> {
    Slot(RwLockReadGuard<'a, SlotState>),
    Ephemeral(Fd),
}

/// A descriptor usable for one I/O, plus the locks that keep it valid.
pub struct IoLease<'a> {
    engine: &'a dyn StorageEngine,
    fd: Option<LeaseFd<'a>>,
    object: Option<RwLockReadGuard<'a, ShareReservation>>,
}

impl<'a> IoLease<'a> {
    pub fn fd(&self) -> FsResult<&Fd> {
        match &self.fd {
            Some(LeaseFd::Slot(guard)) => guard.fd().ok_or(FsError::NotOpen),
            Some(LeaseFd::Ephemeral(fd)) => Ok(fd),
            None => Err(FsError::NotOpen),
        }
    }

    /// Whether the descriptor is closed when the lease ends.
    pub fn must_close(&self) -> bool {
        matches!(self.fd, Some(LeaseFd::Ephemeral(_)))
    }

    pub fn holds_object_lock(&self) -> bool {
        self.object.is_some()
    }

    /// End the lease. Dropping it does the same.
    pub fn finish(mut self) {
        self.release();
    }

    fn release(&mut self) {
        match self.fd.take() {
            Some(LeaseFd::Slot(guard)) => drop(guard),
            Some(LeaseFd::Ephemeral(fd)) => {
                if let Err(err) = self.engine.close(fd) {
                    warn!(%err, "closing ephemeral descriptor failed");
                }
            }
            None => {}
        }
        self.object.take();
    }
}

impl Drop for IoLease<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Bytes read and whether the end of file was hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadOutcome {
    pub bytes: usize,
    pub eof: bool,
}

/// Bytes written and whether they reached stable storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteOutcome {
    pub bytes: usize,
    pub stable: bool,
}

impl Export {
    /// Find a descriptor able to serve `access` on `handle`.
    ///
    /// A state whose own descriptor is compatible is used under its fd lock
    /// alone. Anything else goes through the object lock (held shared for the
    /// lease's lifetime): the share table is checked, then the global
    /// descriptor is reused if compatible, or an ephemeral one is opened.
    pub fn acquire_for_io<'a>(
        &self,
        handle: &'a ObjectHandle,
        bypass: bool,
        state: Option<&'a ClientState>,
        access: OpenFlags,
    ) -> FsResult<IoLease<'a>> {
        let check = if bypass {
            ShareCheck::Bypass
        } else {
            ShareCheck::Full
        };
        lease(handle, check, state, access)
    }

    pub fn read2(
        &self,
        handle: &ObjectHandle,
        bypass: bool,
        state: Option<&ClientState>,
        offset: u64,
        bufs: &mut [&mut [u8]],
    ) -> FsResult<ReadOutcome> {
        debug!(key = %handle.key(), offset, bufs = bufs.len(), bypass, "read2");
        let lease = self.acquire_for_io(handle, bypass, state, OpenFlags::READ)?;
        let max_read = chunk_limit(self.module().max_read);
        let result = lease
            .fd()
            .and_then(|fd| read_chunks(handle.engine(), fd, offset, bufs, max_read));
        lease.finish();
        result
    }

    pub fn write2(
        &self,
        handle: &ObjectHandle,
        bypass: bool,
        state: Option<&ClientState>,
        offset: u64,
        bufs: &[&[u8]],
        stable: bool,
    ) -> FsResult<WriteOutcome> {
        let total: u64 = bufs.iter().map(|buf| buf.len() as u64).sum();
        debug!(key = %handle.key(), offset, total, stable, bypass, "write2");
        match offset.checked_add(total) {
            Some(end) if end <= self.module().max_file_size => {}
            _ => return Err(FsError::FileTooBig),
        }

        let lease = self.acquire_for_io(handle, bypass, state, OpenFlags::WRITE)?;
        let max_write = chunk_limit(self.module().max_write);
        let engine = handle.engine();
        let result = lease.fd().and_then(|fd| {
            let bytes = write_chunks(engine, fd, offset, bufs, max_write)?;
            if !stable {
                return Ok(WriteOutcome {
                    bytes,
                    stable: false,
                });
            }
            match engine.flush(fd, true) {
                Ok(()) => Ok(WriteOutcome { bytes, stable: true }),
                Err(err) if bytes > 0 => {
                    warn!(key = %handle.key(), %err, "stable write downgraded after flush failure");
                    Ok(WriteOutcome {
                        bytes,
                        stable: false,
                    })
                }
                Err(err) => Err(err.into()),
            }
        });
        lease.finish();
        result
    }

    /// Flush the object's data and metadata.
    ///
    /// The flush goes through a read descriptor, so no reservation can
    /// refuse it.
    pub fn commit2(&self, handle: &ObjectHandle, offset: u64, len: u64) -> FsResult<()> {
        debug!(key = %handle.key(), offset, len, "commit2");
        let lease = lease(handle, ShareCheck::Bypass, None, OpenFlags::READ)?;
        let result = lease
            .fd()
            .and_then(|fd| handle.engine().flush(fd, false).map_err(FsError::from));
        lease.finish();
        result
    }

    /// Apply attribute changes. A size change holds a write lease for its
    /// duration so it is arbitrated like any other write.
    pub fn setattr2(
        &self,
        handle: &ObjectHandle,
        bypass: bool,
        state: Option<&ClientState>,
        attrs: &AttrSet,
    ) -> FsResult<Stat> {
        debug!(key = %handle.key(), ?attrs, bypass, "setattr2");
        let engine = handle.engine();
        if attrs.is_empty() {
            return Ok(engine.get_attributes(handle.item())?);
        }
        if attrs.size.is_none() {
            return Ok(engine.set_attributes(handle.item(), attrs)?);
        }
        if attrs.size.is_some_and(|size| size > self.module().max_file_size) {
            return Err(FsError::FileTooBig);
        }

        let lease = self.acquire_for_io(handle, bypass, state, OpenFlags::WRITE)?;
        let result = engine.set_attributes(handle.item(), attrs).map_err(FsError::from);
        lease.finish();
        result
    }

    /// Sparse-aware reads are not provided by this core.
    pub fn read_plus(
        &self,
        handle: &ObjectHandle,
        _state: Option<&ClientState>,
        _offset: u64,
        _len: u64,
    ) -> FsResult<ReadOutcome> {
        debug!(key = %handle.key(), "read_plus");
        Err(FsError::NotSupported)
    }
}

fn chunk_limit(limit: u64) -> usize {
    usize::try_from(limit).unwrap_or(usize::MAX).max(1)
}

fn lease<'a>(
    handle: &'a ObjectHandle,
    check: ShareCheck,
    state: Option<&'a ClientState>,
    access: OpenFlags,
) -> FsResult<IoLease<'a>> {
    handle.require_regular()?;
    let engine = handle.engine();
    let access = access.access();

    if let Some(state) = state {
        let guard = state.slot.read();
        if guard.mode().satisfies(access) {
            return Ok(IoLease {
                engine,
                fd: Some(LeaseFd::Slot(guard)),
                object: None,
            });
        }
    }

    let share = handle.share.read();
    match check {
        ShareCheck::Full => share.check_conflict(access, false)?,
        ShareCheck::Bypass => share.check_conflict(access, true)?,
    }

    let global = handle.global.read();
    if global.mode().satisfies(access) {
        return Ok(IoLease {
            engine,
            fd: Some(LeaseFd::Slot(global)),
            object: Some(share),
        });
    }
    drop(global);

    let fd = engine.open(handle.item(), access)?;
    Ok(IoLease {
        engine,
        fd: Some(LeaseFd::Ephemeral(fd)),
        object: Some(share),
    })
}

fn read_chunks(
    engine: &dyn StorageEngine,
    fd: &Fd,
    offset: u64,
    bufs: &mut [&mut [u8]],
    max_read: usize,
) -> FsResult<ReadOutcome> {
    let mut total = 0usize;
    let mut position = offset;
    for buf in bufs.iter_mut() {
        let mut done = 0usize;
        while done < buf.len() {
            let end = buf.len().min(done + max_read);
            let wanted = end - done;
            let got = engine.read(fd, position, &mut buf[done..end])?;
            done += got;
            total += got;
            position += got as u64;
            if got < wanted {
                return Ok(ReadOutcome {
                    bytes: total,
                    eof: true,
                });
            }
        }
    }
    Ok(ReadOutcome {
        bytes: total,
        eof: false,
    })
}

fn write_chunks(
    engine: &dyn StorageEngine,
    fd: &Fd,
    offset: u64,
    bufs: &[&[u8]],
    max_write: usize,
) -> FsResult<usize> {
    let mut total = 0usize;
    let mut position = offset;
    for buf in bufs {
        for chunk in buf.chunks(max_write) {
            let put = engine.write(fd, position, chunk)?;
            total += put;
            position += put as u64;
            if put < chunk.len() {
                return Ok(total);
            }
        }
    }
    Ok(total)
}
