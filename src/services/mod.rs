// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - business logic layer.

pub mod audio;
pub mod features;
pub mod prediction;
pub mod rate_limit;

pub use audio::{AudioError, AudioSignal};
pub use features::{FeatureExtractor, MelBandExtractor};
pub use prediction::{EmotionClassifier, LinearSvm, PredictionError, PredictionService};
pub use rate_limit::{RateLimitDecision, RateLimitService};
