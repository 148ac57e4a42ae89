// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Emotion Recognition API: classify the emotion in speech recordings
//!
//! This crate provides the backend API that decodes uploaded audio,
//! predicts its emotion with an SVM over mel-band embeddings, and keeps a
//! history of predictions in MongoDB.

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod time_utils;

use config::Config;
use db::MongoDb;
use services::{PredictionService, RateLimitService};

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub db: MongoDb,
    pub rate_limiter: RateLimitService,
    pub prediction_service: PredictionService,
}
