// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Data models for the application.

pub mod emotion;
pub mod prediction;
pub mod waveform;

pub use emotion::{Emotion, ModelType, EMOTION_LABELS};
pub use prediction::{
    EmotionGroup, EmotionProbabilities, PredictionRecord, PredictionResponse, PredictionStats,
};
pub use waveform::WaveformData;
