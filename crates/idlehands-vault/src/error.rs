// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("vault open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("vault io error: {0}")]
    Io(#[from] std::io::Error),
}
