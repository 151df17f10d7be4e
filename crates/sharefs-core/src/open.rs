// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Open, reopen and close state machine
//!
//! Share-managed transitions update the share table under the object lock
//! and release it before touching the engine; the descriptor swap itself
//! happens under the slot's fd lock. Stateless opens serialize on the object
//! lock for as long as they use the global slot, since that lock guards the
//! global descriptor's identity.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{FsError, FsResult, StorageError};
use crate::export::Export;
use crate::handle::ObjectHandle;
use crate::slot::DescriptorSlot;
use crate::state::ClientState;
use crate::storage::{Fd, StorageEngine};
use crate::types::{AttrSet, CreateMode, OpenFlags, Stat, Verifier};

/// Create instructions accompanying an open.
#[derive(Clone, Debug)]
pub struct CreateRequest<'a> {
    pub mode: CreateMode,
    /// `None` opens the handle itself; `Some` opens or creates a child.
    pub name: Option<&'a str>,
    /// Creation attributes; `mode` is required for every create.
    pub attrs: AttrSet,
    /// Required by the exclusive create modes.
    pub verifier: Option<Verifier>,
}

impl<'a> CreateRequest<'a> {
    pub fn by_handle() -> Self {
        Self {
            mode: CreateMode::NoCreate,
            name: None,
            attrs: AttrSet::default(),
            verifier: None,
        }
    }

    pub fn by_name(name: &'a str) -> Self {
        Self {
            name: Some(name),
            ..Self::by_handle()
        }
    }

    pub fn create(mode: CreateMode, name: &'a str, attrs: AttrSet) -> Self {
        Self {
            mode,
            name: Some(name),
            attrs,
            verifier: None,
        }
    }

    pub fn with_verifier(mut self, verifier: Verifier) -> Self {
        self.verifier = Some(verifier);
        self
    }
}

/// Result of a successful open2.
#[derive(Debug)]
pub struct OpenOutcome {
    pub handle: Arc<ObjectHandle>,
    pub attrs: Stat,
    /// Whether this call created the object.
    pub created: bool,
}

fn log_failure(op: &str, handle: &ObjectHandle, err: &FsError) {
    if err.is_expected() {
        debug!(op, key = %handle.key(), %err, "refused");
    } else {
        warn!(op, key = %handle.key(), %err, "failed");
    }
}

fn close_quietly(engine: &dyn StorageEngine, fd: Fd, context: &str) {
    if let Err(err) = engine.close(fd) {
        warn!(%err, context, "descriptor close failed");
    }
}

impl Export {
    /// Open `handle` (or a child of it, when `request.name` is set) for
    /// `flags`, optionally on behalf of `state`.
    pub fn open2(
        &self,
        handle: &Arc<ObjectHandle>,
        state: Option<&ClientState>,
        flags: OpenFlags,
        request: CreateRequest<'_>,
    ) -> FsResult<OpenOutcome> {
        debug!(
            key = %handle.key(),
            state = ?state.map(ClientState::id),
            ?flags,
            mode = ?request.mode,
            name = ?request.name,
            "open2"
        );
        let result = self.dispatch_open(handle, state, flags, request);
        if let Err(err) = &result {
            log_failure("open2", handle, err);
        }
        result
    }

    fn dispatch_open(
        &self,
        handle: &Arc<ObjectHandle>,
        state: Option<&ClientState>,
        flags: OpenFlags,
        request: CreateRequest<'_>,
    ) -> FsResult<OpenOutcome> {
        if flags.access().is_empty() {
            return Err(FsError::InvalidArgument);
        }
        if state.is_some_and(ClientState::is_open) {
            return Err(FsError::InvalidArgument);
        }

        match request.name {
            None if request.mode != CreateMode::NoCreate => Err(FsError::InvalidArgument),
            None => self.open_by_handle(handle, state, flags, None),
            Some(name) if request.mode == CreateMode::NoCreate => {
                let (child, _) = self.lookup(handle, name)?;
                self.open_by_handle(&child, state, flags, None)
            }
            Some(name) => self.create_by_name(handle, state, flags, name, request),
        }
    }

    fn open_by_handle(
        &self,
        handle: &Arc<ObjectHandle>,
        state: Option<&ClientState>,
        flags: OpenFlags,
        verifier: Option<Verifier>,
    ) -> FsResult<OpenOutcome> {
        handle.require_regular()?;
        let attrs = match state {
            Some(state) if state.kind().carries_share() => {
                self.open_share_managed(handle, state, flags, verifier)?
            }
            Some(state) => open_into_slot(handle, &state.slot, flags, verifier)?,
            None => self.open_global(handle, flags, verifier)?,
        };
        Ok(OpenOutcome {
            handle: Arc::clone(handle),
            attrs,
            created: false,
        })
    }

    fn open_share_managed(
        &self,
        handle: &ObjectHandle,
        state: &ClientState,
        flags: OpenFlags,
        verifier: Option<Verifier>,
    ) -> FsResult<Stat> {
        {
            let mut share = handle.share.write();
            share.check_conflict(flags, false)?;
            share.apply_delta(OpenFlags::CLOSED, flags);
        }

        match open_into_slot(handle, &state.slot, flags, verifier) {
            Ok(stat) => Ok(stat),
            Err(err) => {
                handle.share.write().apply_delta(flags, OpenFlags::CLOSED);
                Err(err)
            }
        }
    }

    fn open_global(
        &self,
        handle: &ObjectHandle,
        flags: OpenFlags,
        verifier: Option<Verifier>,
    ) -> FsResult<Stat> {
        let engine = handle.engine();
        let share = handle.share.write();
        share.check_conflict(flags, false)?;

        let mut slot = handle.global.write();
        let current = slot.mode();
        let opened_here =
            current.is_closed() || current != flags.persistent() || flags.contains(OpenFlags::TRUNC);
        if opened_here {
            if let Some((old, _)) = slot.take() {
                close_quietly(engine, old, "global reopen");
            }
            let fd = engine.open(handle.item(), flags)?;
            slot.install(fd, flags);
        }

        let stat = engine.get_attributes(handle.item())?;
        if verifier.is_some_and(|v| !v.matches(&stat)) {
            // A reused descriptor belongs to earlier stateless callers.
            if opened_here {
                if let Some((fd, _)) = slot.take() {
                    close_quietly(engine, fd, "verifier mismatch");
                }
            }
            return Err(FsError::AlreadyExists);
        }
        drop(slot);
        drop(share);
        Ok(stat)
    }

    fn create_by_name(
        &self,
        parent: &Arc<ObjectHandle>,
        state: Option<&ClientState>,
        flags: OpenFlags,
        name: &str,
        request: CreateRequest<'_>,
    ) -> FsResult<OpenOutcome> {
        parent.require_directory()?;
        let requested_mode = request.attrs.mode.ok_or(FsError::InvalidArgument)?;
        let initial = AttrSet::with_mode(requested_mode & !self.module().umask);

        let mut extras = request.attrs.without_mode();
        let verifier = if request.mode.uses_verifier() {
            let verifier = request.verifier.ok_or(FsError::InvalidArgument)?;
            verifier.apply_to(&mut extras);
            Some(verifier)
        } else {
            None
        };

        if request.mode == CreateMode::NoCreate {
            return Err(FsError::InvalidArgument);
        }

        // Existing objects are only ever opened through the share-checked path.
        let engine = self.engine();
        let created = engine.create_child(parent.item(), name, &initial, flags, true);
        let (item, fd, stat) = match created {
            Ok(created) => created,
            Err(StorageError::AlreadyExists) => {
                return match request.mode {
                    CreateMode::Unchecked | CreateMode::Exclusive | CreateMode::Exclusive41 => {
                        debug!(name, mode = ?request.mode, "create found existing object");
                        let (existing, _) = self.lookup(parent, name)?;
                        self.open_by_handle(&existing, state, flags, verifier)
                    }
                    _ => Err(FsError::AlreadyExists),
                };
            }
            Err(err) => return Err(err.into()),
        };

        let stat = if !extras.is_empty() {
            match engine.set_attributes(&item, &extras) {
                Ok(stat) => stat,
                Err(err) => {
                    close_quietly(engine, fd, "create rollback");
                    if let Err(unlink_err) = engine.unlink(parent.item(), name) {
                        warn!(name, %unlink_err, "removing half-created object failed");
                    }
                    engine.release_item(&item);
                    return Err(err.into());
                }
            }
        } else {
            stat
        };

        if verifier.is_some_and(|v| !v.matches(&stat)) {
            close_quietly(engine, fd, "verifier mismatch");
            engine.release_item(&item);
            return Err(FsError::AlreadyExists);
        }

        let handle = match self.intern(self.construct_handle(item, &stat)) {
            Ok(handle) => handle,
            Err(err) => {
                close_quietly(engine, fd, "intern failure");
                return Err(err);
            }
        };
        self.install_created(&handle, state, flags, fd)?;

        debug!(key = %handle.key(), name, "create_by_name created object");
        Ok(OpenOutcome {
            handle,
            attrs: stat,
            created: true,
        })
    }

    /// Bind a descriptor returned by a create to its owner.
    fn install_created(
        &self,
        handle: &ObjectHandle,
        state: Option<&ClientState>,
        flags: OpenFlags,
        fd: Fd,
    ) -> FsResult<()> {
        let engine = handle.engine();
        match state {
            Some(state) if state.kind().carries_share() => {
                {
                    let mut share = handle.share.write();
                    if let Err(err) = share.check_conflict(flags, false) {
                        drop(share);
                        close_quietly(engine, fd, "create share conflict");
                        return Err(err);
                    }
                    share.apply_delta(OpenFlags::CLOSED, flags);
                }
                if let Some(old) = state.slot.write().install(fd, flags) {
                    close_quietly(engine, old, "create replaced descriptor");
                }
            }
            Some(state) => {
                if let Some(old) = state.slot.write().install(fd, flags) {
                    close_quietly(engine, old, "create replaced descriptor");
                }
            }
            None => {
                let share = handle.share.write();
                if let Err(err) = share.check_conflict(flags, false) {
                    drop(share);
                    close_quietly(engine, fd, "create share conflict");
                    return Err(err);
                }
                if let Some(old) = handle.global.write().install(fd, flags) {
                    close_quietly(engine, old, "create replaced global descriptor");
                }
            }
        }
        Ok(())
    }

    /// Change the mode of `state`'s open descriptor.
    ///
    /// The state's own reservation is not counted against the new mode.
    pub fn reopen2(
        &self,
        handle: &ObjectHandle,
        state: &ClientState,
        flags: OpenFlags,
    ) -> FsResult<()> {
        debug!(key = %handle.key(), state = %state.id(), ?flags, "reopen2");
        let result = self.reopen_state(handle, state, flags);
        if let Err(err) = &result {
            log_failure("reopen2", handle, err);
        }
        result
    }

    fn reopen_state(&self, handle: &ObjectHandle, state: &ClientState, flags: OpenFlags) -> FsResult<()> {
        handle.require_regular()?;
        if flags.access().is_empty() {
            return Err(FsError::InvalidArgument);
        }
        let carries = state.kind().carries_share();

        let old = {
            let mut share = handle.share.write();
            let old = state.mode();
            if old.is_closed() {
                return Err(FsError::NotOpen);
            }
            if carries {
                share.check_conflict_excluding(old, flags)?;
                share.apply_delta(old, flags);
            }
            old
        };

        let engine = handle.engine();
        let fd = match engine.open(handle.item(), flags) {
            Ok(fd) => fd,
            Err(err) => {
                if carries {
                    handle.share.write().apply_delta(flags, old);
                }
                return Err(err.into());
            }
        };

        let mut slot = state.slot.write();
        if let Some(previous) = slot.install(fd, flags) {
            close_quietly(engine, previous, "reopen swap");
        }
        Ok(())
    }

    /// Close `state`'s descriptor and drop its reservation.
    pub fn close2(&self, handle: &ObjectHandle, state: &ClientState) -> FsResult<()> {
        debug!(key = %handle.key(), state = %state.id(), "close2");
        let engine = handle.engine();

        let mut share = handle.share.write();
        let mut slot = state.slot.write();
        let (fd, mode) = slot.take().ok_or(FsError::NotOpen)?;
        if state.kind().carries_share() {
            share.apply_delta(mode, OpenFlags::CLOSED);
        }
        drop(share);

        let result = engine.close(fd).map_err(FsError::from);
        drop(slot);
        if let Err(err) = &result {
            log_failure("close2", handle, err);
        }
        result
    }

    /// Close the global descriptor.
    pub fn close(&self, handle: &ObjectHandle) -> FsResult<()> {
        debug!(key = %handle.key(), "close");
        let _share = handle.share.write();
        let taken = handle.global.write().take();
        let (fd, _) = taken.ok_or(FsError::NotOpen)?;
        handle.engine().close(fd).map_err(FsError::from)
    }
}

/// Open a descriptor into `slot`, holding its fd lock for the open.
fn open_into_slot(
    handle: &ObjectHandle,
    slot: &DescriptorSlot,
    flags: OpenFlags,
    verifier: Option<Verifier>,
) -> FsResult<Stat> {
    let engine = handle.engine();
    let mut guard = slot.write();
    let fd = engine.open(handle.item(), flags)?;
    let stat = match engine.get_attributes(handle.item()) {
        Ok(stat) => stat,
        Err(err) => {
            close_quietly(engine, fd, "attribute fetch after open");
            return Err(err.into());
        }
    };
    if verifier.is_some_and(|v| !v.matches(&stat)) {
        close_quietly(engine, fd, "verifier mismatch");
        return Err(FsError::AlreadyExists);
    }
    if let Some(old) = guard.install(fd, flags) {
        close_quietly(engine, old, "slot replaced");
    }
    Ok(stat)
}
