// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use axum::body::Body;
use axum::http::{header, Request};
use axum::response::Response;
use emotion_api::config::Config;
use emotion_api::db::MongoDb;
use emotion_api::routes::create_router;
use emotion_api::services::{LinearSvm, MelBandExtractor, PredictionService, RateLimitService};
use emotion_api::AppState;
use std::io::Cursor;
use std::sync::Arc;

pub const BOUNDARY: &str = "emotion-api-test-boundary";

/// Check if a Redis server is available via environment variable.
#[allow(dead_code)]
pub fn redis_available() -> bool {
    std::env::var("REDIS_URL").is_ok()
}

/// Skip test with message if Redis is not available.
#[macro_export]
macro_rules! require_redis {
    () => {
        if !crate::common::redis_available() {
            eprintln!("⚠️  Skipping: REDIS_URL not set");
            return;
        }
    };
}

/// Classifier over the default embedding that always favors `happy`.
#[allow(dead_code)]
pub fn test_classifier() -> LinearSvm {
    let json = serde_json::json!({
        "version": "svm-test",
        "labels": ["angry", "disgust", "fear", "happy", "neutral", "sad"],
        "weights": vec![vec![0.0f32; 128]; 6],
        "intercepts": [0.0, 0.0, 0.0, 5.0, 0.0, 0.0],
    });
    LinearSvm::load_from_json(&json.to_string()).expect("valid test model")
}

fn build_app(
    config: Config,
    prediction_service: PredictionService,
) -> (axum::Router, Arc<AppState>) {
    let state = Arc::new(AppState {
        config,
        db: MongoDb::new_offline(),
        rate_limiter: RateLimitService::in_memory(),
        prediction_service,
    });
    (create_router(state.clone()), state)
}

/// Create a test app with offline dependencies and no model loaded.
/// Returns the router and the shared state.
#[allow(dead_code)]
pub fn create_test_app() -> (axum::Router, Arc<AppState>) {
    build_app(Config::default(), PredictionService::without_model())
}

/// Create a test app with a custom config and no model loaded.
#[allow(dead_code)]
pub fn create_test_app_with_config(config: Config) -> (axum::Router, Arc<AppState>) {
    build_app(config, PredictionService::without_model())
}

/// Create a test app whose prediction service uses [`test_classifier`].
#[allow(dead_code)]
pub fn create_test_app_with_model() -> (axum::Router, Arc<AppState>) {
    let service = PredictionService::new(
        Arc::new(MelBandExtractor::default()),
        Some(Arc::new(test_classifier())),
    )
    .expect("test model matches extractor");
    build_app(Config::default(), service)
}

/// 16-bit mono WAV containing a 440 Hz tone.
#[allow(dead_code)]
pub fn wav_tone(sample_rate: u32, seconds: f32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        let frames = (sample_rate as f32 * seconds) as usize;
        for i in 0..frames {
            let t = i as f32 / sample_rate as f32;
            let v = (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.5 * i16::MAX as f32;
            writer.write_sample(v as i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// Multipart body with one file field.
#[allow(dead_code)]
pub fn multipart_body(field: &str, filename: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            field, filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    body
}

/// POST an uploaded file to `uri`.
#[allow(dead_code)]
pub fn upload_request(uri: &str, filename: &str, bytes: &[u8]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(multipart_body("audio", filename, bytes)))
        .unwrap()
}

/// Read a response body as JSON.
#[allow(dead_code)]
pub async fn json_body(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
