// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Database layer (MongoDB).

pub mod mongo;

pub use mongo::MongoDb;

/// Collection names as constants.
pub mod collections {
    pub const PREDICTIONS: &str = "predictions";
}
