// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Audio upload, prediction and prediction history routes.

use crate::error::{AppError, Result};
use crate::models::{
    Emotion, ModelType, PredictionRecord, PredictionResponse, PredictionStats, WaveformData,
};
use crate::services::audio::{self, AudioError, AudioSignal, MAX_UPLOAD_BYTES, WAVEFORM_POINTS};
use crate::services::PredictionError;
use crate::AppState;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use mongodb::bson::{self, oid::ObjectId};
use serde::Deserialize;
use std::sync::Arc;
use validator::Validate;

/// Multipart field carrying the uploaded clip.
const AUDIO_FIELD: &str = "audio";
/// Room past the file cap so oversized files reach [`read_upload`] and get
/// a size error; the body limit stays as a backstop.
const MULTIPART_OVERHEAD: usize = 16 * 1024 * 1024;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 100;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/audio/predict", post(predict).put(predict))
        .route("/audio/waveform", post(waveform))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + MULTIPART_OVERHEAD))
        .route("/audio/predictions", get(list_predictions))
        .route("/audio/predictions/stats", get(prediction_stats))
        .route("/audio/predictions/{id}", get(get_prediction))
}

// ─── Uploads ─────────────────────────────────────────────────

/// Uploaded file taken from the multipart body.
struct Upload {
    filename: String,
    bytes: Vec<u8>,
}

/// Read the `audio` field and run the cheap checks on it.
///
/// The name is checked before any bytes are read, and reading stops as
/// soon as the file passes [`MAX_UPLOAD_BYTES`].
async fn read_upload(mut multipart: Multipart) -> Result<Upload> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Invalid multipart body: {}", e)))?
    {
        if field.name() != Some(AUDIO_FIELD) {
            continue;
        }

        let filename = field.file_name().map(str::to_string);
        audio::validate_filename(filename.as_deref()).map_err(audio_error)?;

        let mut bytes = Vec::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| AppError::BadRequest(format!("Failed to read upload: {}", e)))?
        {
            if bytes.len() + chunk.len() > MAX_UPLOAD_BYTES {
                return Err(audio_error(AudioError::TooLarge));
            }
            bytes.extend_from_slice(&chunk);
        }

        audio::validate_upload(filename.as_deref(), bytes.len()).map_err(audio_error)?;

        return Ok(Upload {
            filename: filename.unwrap_or_default(),
            bytes,
        });
    }

    Err(AppError::BadRequest(format!(
        "Missing '{}' file field",
        AUDIO_FIELD
    )))
}

/// Decode off the async runtime; rejects clips with no samples.
async fn decode_upload(upload: Upload) -> Result<(String, AudioSignal)> {
    let Upload { filename, bytes } = upload;
    let (filename, signal) = tokio::task::spawn_blocking(move || {
        let signal = audio::decode(bytes, &filename);
        (filename, signal)
    })
    .await
    .map_err(|e| AppError::Internal(e.into()))?;

    let signal = signal.map_err(audio_error)?;
    if signal.is_empty() {
        return Err(AppError::BadRequest(
            "Audio file appears to be empty or corrupted".to_string(),
        ));
    }
    Ok((filename, signal))
}

fn audio_error(err: AudioError) -> AppError {
    if err.is_client_error() {
        AppError::BadRequest(err.to_string())
    } else {
        AppError::AudioProcessing(err.to_string())
    }
}

fn prediction_error(err: PredictionError) -> AppError {
    match err {
        PredictionError::ModelNotLoaded => AppError::ModelUnavailable,
        PredictionError::DimensionMismatch { .. } => AppError::AudioProcessing(err.to_string()),
        PredictionError::ModelLoad(_) => AppError::Internal(err.into()),
    }
}

/// Predict the emotion of an uploaded clip and store the result.
async fn predict(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<PredictionResponse>> {
    if !state.prediction_service.is_ready() {
        return Err(AppError::ModelUnavailable);
    }

    let upload = read_upload(multipart).await?;
    tracing::info!(
        filename = %upload.filename,
        size = upload.bytes.len(),
        "Processing audio for prediction"
    );
    let (filename, signal) = decode_upload(upload).await?;

    let service = state.prediction_service.clone();
    let (signal, outcome) = tokio::task::spawn_blocking(move || {
        let outcome = service.predict(&signal);
        (signal, outcome)
    })
    .await
    .map_err(|e| AppError::Internal(e.into()))?;
    let outcome = outcome.map_err(prediction_error)?;

    let mut record = PredictionRecord {
        id: None,
        filename,
        emotion: outcome.emotion,
        confidence: outcome.confidence,
        probabilities: outcome.probabilities.clone(),
        model_type: ModelType::Hybrid,
        model_version: outcome.model_version.clone(),
        audio_duration: signal.duration_seconds(),
        processing_time: outcome.processing_time(),
        feature_extraction_time: outcome.feature_extraction_time,
        model_inference_time: outcome.model_inference_time,
        created_at: bson::DateTime::now(),
    };

    // Storage is best effort; the caller still gets the prediction
    match state.db.insert_prediction(&record).await {
        Ok(id) => record.id = Some(id),
        Err(e) => tracing::warn!(error = %e, "Failed to save prediction"),
    }

    tracing::info!(
        filename = %record.filename,
        emotion = %record.emotion,
        confidence = record.confidence,
        processing_time = record.processing_time,
        "Prediction completed"
    );

    Ok(Json(PredictionResponse::from(&record)))
}

/// Waveform of an uploaded clip for display.
async fn waveform(multipart: Multipart) -> Result<Json<WaveformData>> {
    let upload = read_upload(multipart).await?;
    let (filename, signal) = decode_upload(upload).await?;

    let data = audio::waveform(&signal, WAVEFORM_POINTS);
    tracing::debug!(
        filename = %filename,
        points = data.points,
        duration = data.duration,
        "Waveform generated"
    );
    Ok(Json(data))
}

// ─── History ─────────────────────────────────────────────────

#[derive(Debug, Deserialize, Validate)]
struct PredictionsQuery {
    /// Filter by primary emotion
    emotion: Option<String>,
    #[serde(default)]
    skip: u64,
    /// Page size, capped at [`MAX_LIMIT`]
    #[serde(default = "default_limit")]
    #[validate(range(min = 1))]
    limit: i64,
}

fn default_limit() -> i64 {
    DEFAULT_LIMIT
}

/// Stored predictions, newest first.
async fn list_predictions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PredictionsQuery>,
) -> Result<Json<Vec<PredictionResponse>>> {
    params
        .validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let emotion = params
        .emotion
        .as_deref()
        .map(str::parse::<Emotion>)
        .transpose()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    let limit = params.limit.min(MAX_LIMIT);

    tracing::debug!(emotion = ?emotion, skip = params.skip, limit, "Listing predictions");

    let records = state
        .db
        .list_predictions(emotion, params.skip, limit)
        .await?;
    Ok(Json(records.iter().map(PredictionResponse::from).collect()))
}

/// Aggregate statistics across stored predictions.
async fn prediction_stats(State(state): State<Arc<AppState>>) -> Result<Json<PredictionStats>> {
    Ok(Json(state.db.prediction_stats().await?))
}

/// One stored prediction.
async fn get_prediction(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<PredictionResponse>> {
    let oid = ObjectId::parse_str(&id)
        .map_err(|_| AppError::BadRequest(format!("Invalid prediction id: {}", id)))?;

    let record = state
        .db
        .get_prediction(&oid)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Prediction {}", id)))?;
    Ok(Json(PredictionResponse::from(&record)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prediction_error_mapping() {
        assert!(matches!(
            prediction_error(PredictionError::ModelNotLoaded),
            AppError::ModelUnavailable
        ));
        assert!(matches!(
            prediction_error(PredictionError::DimensionMismatch {
                expected: 128,
                actual: 64
            }),
            AppError::AudioProcessing(_)
        ));
    }

    #[test]
    fn test_audio_error_mapping() {
        assert!(matches!(audio_error(AudioError::Empty), AppError::BadRequest(_)));
        assert!(matches!(
            audio_error(AudioError::Resample("ratio".into())),
            AppError::AudioProcessing(_)
        ));
    }

    #[test]
    fn test_too_large_is_bad_request() {
        match audio_error(AudioError::TooLarge) {
            AppError::BadRequest(msg) => assert_eq!(msg, "File too large. Maximum size is 50MB"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_limit_must_be_positive() {
        let query = PredictionsQuery {
            emotion: None,
            skip: 0,
            limit: 0,
        };
        assert!(query.validate().is_err());
    }
}
