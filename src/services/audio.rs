// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Audio upload validation, decoding and waveform generation.
//!
//! Uploaded clips are decoded with symphonia, mixed down to mono and
//! resampled to [`TARGET_SAMPLE_RATE`] before any feature extraction.

use crate::models::WaveformData;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::io::Cursor;
#[cfg(feature = "opus")]
use std::sync::OnceLock;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecRegistry, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Sample rate every signal is converted to.
pub const TARGET_SAMPLE_RATE: u32 = 22_050;
/// Upload size cap.
pub const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;
/// Accepted file extensions (lowercase, with dot).
#[cfg(feature = "opus")]
pub const ALLOWED_EXTENSIONS: &[&str] = &[".wav", ".mp3", ".flac", ".ogg", ".m4a", ".aac", ".webm"];
/// Accepted file extensions (lowercase, with dot). Browser WebM
/// recordings are Opus, which needs the `opus` feature.
#[cfg(not(feature = "opus"))]
pub const ALLOWED_EXTENSIONS: &[&str] = &[".wav", ".mp3", ".flac", ".ogg", ".m4a", ".aac"];
/// Default number of points in a waveform response.
pub const WAVEFORM_POINTS: usize = 1000;

const RESAMPLE_CHUNK: usize = 1024;

/// Mono PCM signal.
#[derive(Debug, Clone)]
pub struct AudioSignal {
    /// Samples normalized to [-1.0, 1.0]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioSignal {
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Check the uploaded file name, before its contents are read.
pub fn validate_filename(filename: Option<&str>) -> Result<(), AudioError> {
    let filename = filename
        .filter(|f| !f.trim().is_empty())
        .ok_or(AudioError::MissingFilename)?;

    let ext = extension_of(filename)
        .map(|e| format!(".{}", e))
        .unwrap_or_default();
    if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        return Err(AudioError::UnsupportedFormat(ext));
    }
    Ok(())
}

/// Check an upload before any decoding work is done.
pub fn validate_upload(filename: Option<&str>, size: usize) -> Result<(), AudioError> {
    validate_filename(filename)?;

    if size > MAX_UPLOAD_BYTES {
        return Err(AudioError::TooLarge);
    }
    if size == 0 {
        return Err(AudioError::Empty);
    }
    Ok(())
}

/// Lowercase extension without the dot.
fn extension_of(filename: &str) -> Option<String> {
    std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Decode an uploaded file to a mono signal at [`TARGET_SAMPLE_RATE`].
///
/// CPU bound; callers on the async runtime should use `spawn_blocking`.
pub fn decode(bytes: Vec<u8>, filename: &str) -> Result<AudioSignal, AudioError> {
    let size = bytes.len();
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension_of(filename) {
        hint.with_extension(&ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| AudioError::decode(filename, size, e))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| AudioError::decode(filename, size, "no audio track found"))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let native_rate = codec_params
        .sample_rate
        .ok_or_else(|| AudioError::decode(filename, size, "sample rate not specified"))?;

    let mut decoder = codec_registry()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| AudioError::decode(filename, size, e))?;

    let mut mono = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(AudioError::decode(filename, size, e)),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let channels = spec.channels.count().max(1);
                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                mono.extend(
                    buf.samples()
                        .chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / channels as f32),
                );
            }
            // A corrupt packet is skipped, not fatal
            Err(SymphoniaError::DecodeError(msg)) => {
                tracing::debug!(filename, error = msg, "Skipping undecodable packet");
            }
            Err(e) => return Err(AudioError::decode(filename, size, e)),
        }
    }

    tracing::debug!(
        filename,
        samples = mono.len(),
        native_rate,
        "Decoded audio"
    );

    let samples = if native_rate != TARGET_SAMPLE_RATE {
        resample(mono, native_rate, TARGET_SAMPLE_RATE)?
    } else {
        mono
    };

    Ok(AudioSignal {
        samples,
        sample_rate: TARGET_SAMPLE_RATE,
    })
}

/// Symphonia's default codecs, plus libopus when built with `opus`.
#[cfg(feature = "opus")]
fn codec_registry() -> &'static CodecRegistry {
    static CODEC_REGISTRY: OnceLock<CodecRegistry> = OnceLock::new();
    CODEC_REGISTRY.get_or_init(|| {
        let mut registry = CodecRegistry::new();
        registry.register_all::<symphonia_adapter_libopus::OpusDecoder>();
        symphonia::default::register_enabled_codecs(&mut registry);
        registry
    })
}

#[cfg(not(feature = "opus"))]
fn codec_registry() -> &'static CodecRegistry {
    symphonia::default::get_codecs()
}

/// Resample a mono signal with a windowed-sinc interpolator.
///
/// The interpolator's delay is trimmed from the front and the tail is
/// flushed, so the output is aligned with the input and has
/// `len * to / from` samples.
fn resample(samples: Vec<f32>, from: u32, to: u32) -> Result<Vec<f32>, AudioError> {
    if samples.is_empty() {
        return Ok(samples);
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = to as f64 / from as f64;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLE_CHUNK, 1)
        .map_err(|e| AudioError::Resample(e.to_string()))?;

    let delay = resampler.output_delay();
    let expected = (samples.len() as f64 * ratio).round() as usize;
    let mut output = Vec::with_capacity(expected + delay);

    let mut chunks = samples.chunks_exact(RESAMPLE_CHUNK);
    for chunk in &mut chunks {
        let out = resampler
            .process(&[chunk], None)
            .map_err(|e| AudioError::Resample(e.to_string()))?;
        output.extend_from_slice(&out[0]);
    }

    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let out = resampler
            .process_partial(Some(&[remainder][..]), None)
            .map_err(|e| AudioError::Resample(e.to_string()))?;
        output.extend_from_slice(&out[0]);
    }

    // Flush samples still held in the filter
    while output.len() < expected + delay {
        let out = resampler
            .process_partial(None::<&[&[f32]]>, None)
            .map_err(|e| AudioError::Resample(e.to_string()))?;
        if out[0].is_empty() {
            break;
        }
        output.extend_from_slice(&out[0]);
    }

    output.drain(..delay.min(output.len()));
    output.truncate(expected);
    Ok(output)
}

/// Downsample a signal to at most `points` evenly spaced samples for plotting.
pub fn waveform(signal: &AudioSignal, points: usize) -> WaveformData {
    let n = signal.samples.len();

    let mut wave: Vec<f32> = if n > points && points > 0 {
        (0..points)
            .map(|i| signal.samples[evenly_spaced_index(i, points, n)])
            .collect()
    } else {
        signal.samples.clone()
    };

    let (min, max) = wave
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if max > min {
        let span = max - min;
        for v in wave.iter_mut() {
            *v = 2.0 * (*v - min) / span - 1.0;
        }
    }

    let duration = signal.duration_seconds();
    let m = wave.len();
    let time_points = (0..m)
        .map(|i| {
            if m > 1 {
                duration * i as f64 / (m - 1) as f64
            } else {
                0.0
            }
        })
        .collect();

    WaveformData {
        waveform: wave,
        time_points,
        duration,
        sample_rate: signal.sample_rate,
        points: m,
    }
}

/// Index `i` of `points` spread over `[0, n - 1]`, truncated like an integer linspace.
fn evenly_spaced_index(i: usize, points: usize, n: usize) -> usize {
    if points <= 1 {
        return 0;
    }
    ((i as f64) * ((n - 1) as f64) / ((points - 1) as f64)) as usize
}

/// Errors from audio handling.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("No file uploaded")]
    MissingFilename,

    #[error("Unsupported file format '{0}'. Supported formats: {formats}", formats = ALLOWED_EXTENSIONS.join(", "))]
    UnsupportedFormat(String),

    #[error("Empty file uploaded")]
    Empty,

    #[error("File too large. Maximum size is 50MB")]
    TooLarge,

    #[error("Failed to load audio file {filename} (size: {size} bytes): {reason}")]
    Decode {
        filename: String,
        size: usize,
        reason: String,
    },

    #[error("Failed to resample audio: {0}")]
    Resample(String),
}

impl AudioError {
    fn decode(filename: &str, size: usize, reason: impl std::fmt::Display) -> Self {
        AudioError::Decode {
            filename: filename.to_string(),
            size,
            reason: reason.to_string(),
        }
    }

    /// True for problems with the request itself rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AudioError::MissingFilename
                | AudioError::UnsupportedFormat(_)
                | AudioError::Empty
                | AudioError::TooLarge
        )
    }
}
