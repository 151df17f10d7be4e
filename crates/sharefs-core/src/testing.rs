// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test-only utilities for sharefs core
//!
//! Engine decorators that simulate failure scenarios without a real
//! storage backend.

#[cfg(test)]
pub mod faulty_storage;
