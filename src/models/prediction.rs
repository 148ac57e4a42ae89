// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Stored predictions and their aggregates.

use crate::models::{Emotion, ModelType};
use crate::time_utils::format_bson_rfc3339;
use mongodb::bson::{self, oid::ObjectId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Probability per emotion label, keyed by the lowercase label.
pub type EmotionProbabilities = BTreeMap<String, f64>;

/// Prediction document in the `predictions` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub filename: String,
    /// Primary (arg-max) emotion
    pub emotion: Emotion,
    /// Probability of the primary emotion
    pub confidence: f64,
    pub probabilities: EmotionProbabilities,
    #[serde(default)]
    pub model_type: ModelType,
    pub model_version: String,
    /// Seconds of audio after resampling
    pub audio_duration: f64,
    /// Seconds spent in feature extraction + inference
    pub processing_time: f64,
    pub feature_extraction_time: f64,
    pub model_inference_time: f64,
    pub created_at: bson::DateTime,
}

/// Prediction as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct PredictionResponse {
    /// Hex object id; `None` when the prediction could not be persisted.
    pub id: Option<String>,
    pub filename: String,
    pub emotion: Emotion,
    pub confidence: f64,
    pub probabilities: EmotionProbabilities,
    pub model_type: ModelType,
    pub model_version: String,
    pub audio_duration: f64,
    pub processing_time: f64,
    pub created_at: String,
}

impl From<&PredictionRecord> for PredictionResponse {
    fn from(record: &PredictionRecord) -> Self {
        Self {
            id: record.id.map(|oid| oid.to_hex()),
            filename: record.filename.clone(),
            emotion: record.emotion,
            confidence: record.confidence,
            probabilities: record.probabilities.clone(),
            model_type: record.model_type,
            model_version: record.model_version.clone(),
            audio_duration: record.audio_duration,
            processing_time: record.processing_time,
            created_at: format_bson_rfc3339(record.created_at),
        }
    }
}

/// Per-emotion partial aggregate as produced by the `$group` stage.
#[derive(Debug, Clone, Deserialize)]
pub struct EmotionGroup {
    #[serde(rename = "_id")]
    pub emotion: Emotion,
    pub count: i64,
    pub confidence_sum: f64,
    pub processing_time_sum: f64,
    pub last_prediction: bson::DateTime,
}

/// Aggregate statistics over all stored predictions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct PredictionStats {
    pub total_predictions: u64,
    pub average_confidence: f64,
    pub average_processing_time: f64,
    pub last_prediction: Option<String>,
    pub emotion_distribution: BTreeMap<String, u64>,
}

impl PredictionStats {
    /// Fold per-emotion groups into overall statistics.
    pub fn from_groups(groups: &[EmotionGroup]) -> Self {
        let mut stats = Self::default();
        let mut confidence_sum = 0.0;
        let mut processing_sum = 0.0;
        let mut last: Option<bson::DateTime> = None;

        for group in groups {
            let count = group.count.max(0) as u64;
            stats.total_predictions += count;
            *stats
                .emotion_distribution
                .entry(group.emotion.to_string())
                .or_insert(0) += count;
            confidence_sum += group.confidence_sum;
            processing_sum += group.processing_time_sum;
            last = match last {
                Some(current) if current >= group.last_prediction => Some(current),
                _ => Some(group.last_prediction),
            };
        }

        if stats.total_predictions > 0 {
            let total = stats.total_predictions as f64;
            stats.average_confidence = confidence_sum / total;
            stats.average_processing_time = processing_sum / total;
        }
        stats.last_prediction = last.map(format_bson_rfc3339);
        stats
    }
}
