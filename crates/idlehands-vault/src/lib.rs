// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Durable session memory: a key/value store with a full-text index over
//! notes and archived tool results, scoped per project.
//!
//! Lifecycle is `open → ops → close` (drop).  The store is single-writer:
//! all access serializes on an internal mutex; concurrent readers share it.

mod error;
mod store;
mod types;

pub use error::VaultError;
pub use store::{Vault, VaultOptions};
pub use types::{EntryKind, VaultEntry};
