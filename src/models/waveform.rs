// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Downsampled waveform for client-side plotting.

use serde::{Deserialize, Serialize};
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct WaveformData {
    /// Amplitudes rescaled to [-1, 1]
    pub waveform: Vec<f32>,
    /// Seconds from clip start, one per amplitude
    pub time_points: Vec<f64>,
    /// Clip duration in seconds
    pub duration: f64,
    pub sample_rate: u32,
    pub points: usize,
}
