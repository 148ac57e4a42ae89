// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Emotion prediction: embedding extraction followed by an SVM classifier.
//!
//! The extractor and classifier are independent pieces that must agree on
//! the embedding length. That agreement is checked when the service is
//! built and again for every vector, so a mismatched model is rejected
//! instead of silently reading the wrong features.

use crate::models::{Emotion, EmotionProbabilities, EMOTION_LABELS};
use crate::services::audio::AudioSignal;
use crate::services::features::{FeatureExtractor, MelBandExtractor};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Produces class probabilities from an embedding.
pub trait EmotionClassifier: Send + Sync {
    /// Embedding length the classifier was trained on.
    fn input_dim(&self) -> usize;

    /// Model identifier stored with each prediction.
    fn version(&self) -> &str;

    /// Probabilities in [`EMOTION_LABELS`] order. May be shorter than the
    /// label list; missing classes are treated as 0.
    fn predict_proba(&self, embedding: &[f32]) -> Result<Vec<f64>, PredictionError>;
}

/// One-vs-rest linear SVM with softmax-normalized decision values.
#[derive(Debug, Clone, Deserialize)]
pub struct LinearSvm {
    version: String,
    labels: Vec<Emotion>,
    /// One weight row per label
    weights: Vec<Vec<f32>>,
    intercepts: Vec<f32>,
}

impl LinearSvm {
    /// Load a model from its JSON export.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, PredictionError> {
        let json = fs::read_to_string(path.as_ref())
            .map_err(|e| PredictionError::ModelLoad(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::load_from_json(&json)
    }

    pub fn load_from_json(json: &str) -> Result<Self, PredictionError> {
        let model: LinearSvm =
            serde_json::from_str(json).map_err(|e| PredictionError::ModelLoad(e.to_string()))?;
        model.check_shape()?;
        Ok(model)
    }

    fn check_shape(&self) -> Result<(), PredictionError> {
        if self.labels.as_slice() != &EMOTION_LABELS[..self.labels.len().min(EMOTION_LABELS.len())]
            || self.labels.is_empty()
        {
            return Err(PredictionError::ModelLoad(
                "labels must be a prefix of angry, disgust, fear, happy, neutral, sad".to_string(),
            ));
        }
        if self.weights.len() != self.labels.len() || self.intercepts.len() != self.labels.len() {
            return Err(PredictionError::ModelLoad(format!(
                "expected {} weight rows and intercepts, got {} and {}",
                self.labels.len(),
                self.weights.len(),
                self.intercepts.len()
            )));
        }
        let dim = self.weights[0].len();
        if dim == 0 || self.weights.iter().any(|row| row.len() != dim) {
            return Err(PredictionError::ModelLoad(
                "weight rows must share one non-zero length".to_string(),
            ));
        }
        Ok(())
    }
}

impl EmotionClassifier for LinearSvm {
    fn input_dim(&self) -> usize {
        self.weights.first().map(Vec::len).unwrap_or(0)
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn predict_proba(&self, embedding: &[f32]) -> Result<Vec<f64>, PredictionError> {
        check_dimension(self.input_dim(), embedding.len())?;

        let scores: Vec<f64> = self
            .weights
            .iter()
            .zip(&self.intercepts)
            .map(|(row, b)| {
                row.iter()
                    .zip(embedding)
                    .map(|(w, x)| (*w as f64) * (*x as f64))
                    .sum::<f64>()
                    + *b as f64
            })
            .collect();

        Ok(softmax(&scores))
    }
}

fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

fn check_dimension(expected: usize, actual: usize) -> Result<(), PredictionError> {
    if expected != actual {
        return Err(PredictionError::DimensionMismatch { expected, actual });
    }
    Ok(())
}

/// Map classifier output onto every label; absent classes get 0.
pub fn label_probabilities(probabilities: &[f64]) -> EmotionProbabilities {
    EMOTION_LABELS
        .iter()
        .enumerate()
        .map(|(i, emotion)| {
            (
                emotion.to_string(),
                probabilities.get(i).copied().unwrap_or(0.0),
            )
        })
        .collect()
}

/// Highest-probability label; the earliest label wins ties.
pub fn primary_emotion(probabilities: &[f64]) -> (Emotion, f64) {
    EMOTION_LABELS
        .iter()
        .enumerate()
        .map(|(i, emotion)| (*emotion, probabilities.get(i).copied().unwrap_or(0.0)))
        .fold((EMOTION_LABELS[0], f64::NEG_INFINITY), |best, cur| {
            if cur.1 > best.1 {
                cur
            } else {
                best
            }
        })
}

/// Result of running the pipeline on one signal.
#[derive(Debug, Clone)]
pub struct PredictionOutcome {
    pub emotion: Emotion,
    pub confidence: f64,
    pub probabilities: EmotionProbabilities,
    pub model_version: String,
    pub feature_extraction_time: f64,
    pub model_inference_time: f64,
}

impl PredictionOutcome {
    pub fn processing_time(&self) -> f64 {
        self.feature_extraction_time + self.model_inference_time
    }
}

/// Runs extraction and classification.
#[derive(Clone)]
pub struct PredictionService {
    extractor: Arc<dyn FeatureExtractor>,
    classifier: Option<Arc<dyn EmotionClassifier>>,
}

impl PredictionService {
    /// Build a service, rejecting a classifier whose input length differs
    /// from the extractor's output.
    pub fn new(
        extractor: Arc<dyn FeatureExtractor>,
        classifier: Option<Arc<dyn EmotionClassifier>>,
    ) -> Result<Self, PredictionError> {
        if let Some(classifier) = &classifier {
            check_dimension(classifier.input_dim(), extractor.dimension())?;
        }
        Ok(Self {
            extractor,
            classifier,
        })
    }

    /// Service with the default extractor and no classifier.
    pub fn without_model() -> Self {
        Self {
            extractor: Arc::new(MelBandExtractor::default()),
            classifier: None,
        }
    }

    /// Load the default extractor plus the SVM at `path`.
    ///
    /// A missing or unusable model is logged and leaves the service
    /// without a classifier; predictions then report the model as unavailable.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!(path = %path.display(), "SVM model not found");
            return Self::without_model();
        }

        let extractor: Arc<dyn FeatureExtractor> = Arc::new(MelBandExtractor::default());
        let loaded = LinearSvm::load_from_file(path).and_then(|svm| {
            let version = svm.version().to_string();
            Self::new(extractor, Some(Arc::new(svm))).map(|service| (service, version))
        });

        match loaded {
            Ok((service, version)) => {
                tracing::info!(path = %path.display(), version = %version, "SVM model loaded");
                service
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to load SVM model");
                Self::without_model()
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.classifier.is_some()
    }

    /// Run the full pipeline on a decoded signal. CPU bound.
    pub fn predict(&self, signal: &AudioSignal) -> Result<PredictionOutcome, PredictionError> {
        let classifier = self.classifier.as_ref().ok_or(PredictionError::ModelNotLoaded)?;

        let started = Instant::now();
        let embedding = self.extractor.extract(signal);
        let feature_extraction_time = started.elapsed().as_secs_f64();
        check_dimension(classifier.input_dim(), embedding.len())?;

        let started = Instant::now();
        let raw = classifier.predict_proba(&embedding)?;
        let model_inference_time = started.elapsed().as_secs_f64();

        let (emotion, confidence) = primary_emotion(&raw);
        tracing::debug!(%emotion, confidence, "Emotion predicted");

        Ok(PredictionOutcome {
            emotion,
            confidence,
            probabilities: label_probabilities(&raw),
            model_version: classifier.version().to_string(),
            feature_extraction_time,
            model_inference_time,
        })
    }
}

/// Errors from the prediction pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PredictionError {
    #[error("SVM model not loaded")]
    ModelNotLoaded,

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Feature vector has {actual} values but the model expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}
