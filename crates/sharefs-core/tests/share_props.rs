// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::sync::Arc;

use proptest::prelude::*;
use sharefs_core::{
    AttrSet, ClientState, CreateMode, CreateRequest, Export, ExportConfig, FsError, ModuleConfig,
    ObjectHandle, OpenFlags, StateKind,
};

const STATES: usize = 3;

#[derive(Clone, Debug)]
enum Op {
    Open(usize, OpenFlags),
    Reopen(usize, OpenFlags),
    Close(usize),
}

fn flags() -> impl Strategy<Value = OpenFlags> {
    (1u32..=3, 0u32..4).prop_map(|(access, deny)| OpenFlags::from_bits_truncate(access | deny << 3))
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..STATES, flags()).prop_map(|(i, f)| Op::Open(i, f)),
        (0..STATES, flags()).prop_map(|(i, f)| Op::Reopen(i, f)),
        (0..STATES).prop_map(Op::Close),
    ]
}

/// Whether `flags` collides with any open model state other than `skip`.
fn model_conflicts(model: &[Option<OpenFlags>], skip: usize, flags: OpenFlags) -> bool {
    model.iter().enumerate().filter(|(i, _)| *i != skip).filter_map(|(_, m)| *m).any(|other| {
        (flags.contains(OpenFlags::READ) && other.contains(OpenFlags::DENY_READ))
            || (flags.contains(OpenFlags::WRITE) && other.contains(OpenFlags::DENY_WRITE))
            || (flags.contains(OpenFlags::DENY_READ) && other.contains(OpenFlags::READ))
            || (flags.contains(OpenFlags::DENY_WRITE) && other.contains(OpenFlags::WRITE))
    })
}

fn model_counts(model: &[Option<OpenFlags>]) -> [u32; 5] {
    let mut counts = [0u32; 5];
    for flags in model.iter().flatten() {
        let bits = [
            OpenFlags::READ,
            OpenFlags::WRITE,
            OpenFlags::DENY_READ,
            OpenFlags::DENY_WRITE,
            OpenFlags::DENY_WRITE_MAND,
        ];
        for (count, bit) in counts.iter_mut().zip(bits) {
            *count += u32::from(flags.contains(bit));
        }
    }
    counts
}

fn setup() -> (Export, Arc<ObjectHandle>, Vec<ClientState>) {
    let (export, _engine) =
        Export::in_memory(ModuleConfig::default(), ExportConfig::named("props")).unwrap();
    let outcome = export
        .open2(
            &export.root(),
            None,
            OpenFlags::READ,
            CreateRequest::create(CreateMode::Guarded, "f", AttrSet::with_mode(0o644)),
        )
        .unwrap();
    export.close(&outcome.handle).unwrap();
    let states = (0..STATES).map(|_| export.alloc_state(StateKind::Share)).collect();
    (export, outcome.handle, states)
}

proptest! {
    #[test]
    fn share_table_tracks_open_states(ops in prop::collection::vec(op(), 1..40)) {
        let (export, file, states) = setup();
        let mut model: [Option<OpenFlags>; STATES] = [None; STATES];

        for op in ops {
            match op {
                Op::Open(i, flags) => {
                    let result = export.open2(&file, Some(&states[i]), flags, CreateRequest::by_handle());
                    if model[i].is_some() {
                        prop_assert_eq!(result.unwrap_err(), FsError::InvalidArgument);
                    } else if model_conflicts(&model, i, flags) {
                        prop_assert_eq!(result.unwrap_err(), FsError::ShareConflict);
                    } else {
                        prop_assert!(result.is_ok());
                        model[i] = Some(flags);
                    }
                }
                Op::Reopen(i, flags) => {
                    let result = export.reopen2(&file, &states[i], flags);
                    if model[i].is_none() {
                        prop_assert_eq!(result, Err(FsError::NotOpen));
                    } else if model_conflicts(&model, i, flags) {
                        prop_assert_eq!(result, Err(FsError::ShareConflict));
                    } else {
                        prop_assert_eq!(result, Ok(()));
                        model[i] = Some(flags);
                    }
                }
                Op::Close(i) => {
                    let result = export.close2(&file, &states[i]);
                    if model[i].take().is_some() {
                        prop_assert_eq!(result, Ok(()));
                    } else {
                        prop_assert_eq!(result, Err(FsError::NotOpen));
                    }
                }
            }
            prop_assert_eq!(file.share_snapshot().counts(), model_counts(&model));
            for (state, flags) in states.iter().zip(model.iter()) {
                prop_assert_eq!(state.mode(), flags.unwrap_or(OpenFlags::CLOSED));
            }
        }

        for (i, state) in states.iter().enumerate() {
            if model[i].is_some() {
                export.close2(&file, state).unwrap();
            }
        }
        prop_assert!(file.share_snapshot().is_empty());
    }
}
