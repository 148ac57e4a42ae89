// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Emotion embedding extraction.

use crate::services::audio::AudioSignal;
use realfft::RealFftPlanner;
use std::f32::consts::PI;

/// Length of the emotion embedding fed to the classifier.
pub const EMBEDDING_DIM: usize = 128;

const FRAME_LEN: usize = 2048;
const HOP_LEN: usize = 512;
const F_MAX: f32 = 8000.0;
/// Floor below the loudest band, in dB.
const TOP_DB: f32 = 80.0;

/// Turns a signal into a fixed-length feature vector.
pub trait FeatureExtractor: Send + Sync {
    /// Length of every vector returned by [`FeatureExtractor::extract`].
    fn dimension(&self) -> usize;

    fn extract(&self, signal: &AudioSignal) -> Vec<f32>;
}

/// Time-averaged log-mel band energies.
///
/// Each Hann-windowed frame is transformed to a power spectrum and summed
/// under triangular mel filters (area normalized), so every spectrum bin
/// below `f_max` contributes to at least one band. Band powers are
/// converted to dB relative to the loudest band, averaged over frames and
/// scaled to [0, 1].
#[derive(Debug, Clone)]
pub struct MelBandExtractor {
    bands: usize,
    f_max: f32,
}

impl Default for MelBandExtractor {
    fn default() -> Self {
        Self::new(EMBEDDING_DIM)
    }
}

impl MelBandExtractor {
    pub fn new(bands: usize) -> Self {
        Self {
            bands,
            f_max: F_MAX,
        }
    }

    /// Mel-spaced filter edges in Hz: `bands + 2` points from 0 to `f_max`.
    fn edge_frequencies(&self, sample_rate: u32) -> Vec<f32> {
        let f_max = self.f_max.min(sample_rate as f32 / 2.0);
        let step = hz_to_mel(f_max) / (self.bands + 1) as f32;
        (0..self.bands + 2)
            .map(|i| mel_to_hz(step * i as f32))
            .collect()
    }

    /// Center frequencies (Hz) of the mel bands between 0 and `f_max`.
    pub fn center_frequencies(&self, sample_rate: u32) -> Vec<f32> {
        let edges = self.edge_frequencies(sample_rate);
        edges[1..=self.bands].to_vec()
    }

    /// Triangular filter weights, `bands × (FRAME_LEN / 2 + 1)`.
    fn filterbank(&self, sample_rate: u32) -> Vec<Vec<f32>> {
        let edges = self.edge_frequencies(sample_rate);
        let bin_hz = sample_rate as f32 / FRAME_LEN as f32;

        (0..self.bands)
            .map(|m| {
                let (lo, center, hi) = (edges[m], edges[m + 1], edges[m + 2]);
                let norm = 2.0 / (hi - lo);
                (0..=FRAME_LEN / 2)
                    .map(|k| {
                        let f = k as f32 * bin_hz;
                        let rising = (f - lo) / (center - lo);
                        let falling = (hi - f) / (hi - center);
                        rising.min(falling).max(0.0) * norm
                    })
                    .collect()
            })
            .collect()
    }

    /// Mel band power per frame, `frames × bands`.
    fn band_powers(&self, samples: &[f32], sample_rate: u32) -> Vec<Vec<f32>> {
        let filters = self.filterbank(sample_rate);
        let window: Vec<f32> = (0..FRAME_LEN)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / FRAME_LEN as f32).cos())
            .collect();

        let fft = RealFftPlanner::<f32>::new().plan_fft_forward(FRAME_LEN);
        let mut frame = fft.make_input_vec();
        let mut spectrum = fft.make_output_vec();
        let mut power = vec![0.0f32; spectrum.len()];

        let mut powers = Vec::new();
        let mut start = 0;
        loop {
            for (i, slot) in frame.iter_mut().enumerate() {
                *slot = samples.get(start + i).copied().unwrap_or(0.0) * window[i];
            }
            // Buffers come from the planner, so lengths always match
            if fft.process(&mut frame, &mut spectrum).is_ok() {
                for (p, c) in power.iter_mut().zip(&spectrum) {
                    *p = c.norm_sqr();
                }
                powers.push(
                    filters
                        .iter()
                        .map(|w| w.iter().zip(&power).map(|(w, p)| w * p).sum::<f32>())
                        .collect(),
                );
            }

            start += HOP_LEN;
            if start + FRAME_LEN > samples.len() {
                break;
            }
        }
        powers
    }
}

impl FeatureExtractor for MelBandExtractor {
    fn dimension(&self) -> usize {
        self.bands
    }

    fn extract(&self, signal: &AudioSignal) -> Vec<f32> {
        if signal.is_empty() || self.bands == 0 {
            return vec![0.0; self.bands];
        }

        let powers = self.band_powers(&signal.samples, signal.sample_rate);
        if powers.is_empty() {
            return vec![0.0; self.bands];
        }
        let reference = powers
            .iter()
            .flatten()
            .fold(0.0f32, |acc, &p| acc.max(p))
            .max(1e-10);
        let ref_db = 10.0 * reference.log10();

        let mut means = vec![0.0f32; self.bands];
        for frame in &powers {
            for (mean, &p) in means.iter_mut().zip(frame) {
                let db = (10.0 * p.max(1e-10).log10() - ref_db).max(-TOP_DB);
                *mean += db;
            }
        }
        let frames = powers.len() as f32;
        means.iter_mut().for_each(|m| *m /= frames);

        let (min, max) = means
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        if max > min {
            means.iter().map(|v| (v - min) / (max - min)).collect()
        } else {
            vec![0.0; self.bands]
        }
    }
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10f32.powf(mel / 2595.0) - 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::audio::TARGET_SAMPLE_RATE;

    fn tone(freq: f32, seconds: f32) -> AudioSignal {
        let n = (TARGET_SAMPLE_RATE as f32 * seconds) as usize;
        AudioSignal {
            samples: (0..n)
                .map(|i| (2.0 * PI * freq * i as f32 / TARGET_SAMPLE_RATE as f32).sin() * 0.5)
                .collect(),
            sample_rate: TARGET_SAMPLE_RATE,
        }
    }

    fn total_band_power(extractor: &MelBandExtractor, signal: &AudioSignal) -> f32 {
        extractor
            .band_powers(&signal.samples, signal.sample_rate)
            .iter()
            .flatten()
            .sum()
    }

    #[test]
    fn test_embedding_shape_and_range() {
        let extractor = MelBandExtractor::default();
        let embedding = extractor.extract(&tone(440.0, 0.5));

        assert_eq!(embedding.len(), EMBEDDING_DIM);
        assert!(embedding.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_tone_peaks_near_its_frequency() {
        let extractor = MelBandExtractor::default();
        let embedding = extractor.extract(&tone(1000.0, 0.5));
        let centers = extractor.center_frequencies(TARGET_SAMPLE_RATE);

        let peak = embedding
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
            .0;
        assert!(
            (centers[peak] - 1000.0).abs() < 60.0,
            "peak band at {} Hz",
            centers[peak]
        );
    }

    #[test]
    fn test_tone_between_band_centers_is_measured() {
        let extractor = MelBandExtractor::default();
        let centers = extractor.center_frequencies(TARGET_SAMPLE_RATE);
        let on_center = centers[120];
        let between = (centers[120] + centers[121]) / 2.0;

        let on = total_band_power(&extractor, &tone(on_center, 1.0));
        let off = total_band_power(&extractor, &tone(between, 1.0));

        let ratio_db = 10.0 * (on / off).log10();
        assert!(
            ratio_db.abs() < 3.0,
            "on-center {} vs between {} ({} dB)",
            on,
            off,
            ratio_db
        );
    }

    #[test]
    fn test_filters_cover_spectrum_below_fmax() {
        let extractor = MelBandExtractor::default();
        let filters = extractor.filterbank(TARGET_SAMPLE_RATE);
        let bin_hz = TARGET_SAMPLE_RATE as f32 / FRAME_LEN as f32;

        assert_eq!(filters.len(), EMBEDDING_DIM);
        for k in 1..(F_MAX / bin_hz) as usize - 1 {
            assert!(
                filters.iter().any(|w| w[k] > 0.0),
                "bin {} ({} Hz) not covered",
                k,
                k as f32 * bin_hz
            );
        }
        assert!(filters.iter().all(|w| w.iter().any(|&v| v > 0.0)));
    }

    #[test]
    fn test_silence_and_short_clips() {
        let extractor = MelBandExtractor::default();
        let silence = AudioSignal {
            samples: vec![0.0; 4096],
            sample_rate: TARGET_SAMPLE_RATE,
        };
        assert_eq!(extractor.extract(&silence), vec![0.0; EMBEDDING_DIM]);

        // Shorter than one frame is zero padded
        let short = tone(300.0, 0.01);
        assert_eq!(extractor.extract(&short).len(), EMBEDDING_DIM);
    }

    #[test]
    fn test_centers_increase_below_fmax() {
        let centers = MelBandExtractor::default().center_frequencies(TARGET_SAMPLE_RATE);
        assert_eq!(centers.len(), EMBEDDING_DIM);
        assert!(centers.windows(2).all(|w| w[0] < w[1]));
        assert!(*centers.last().unwrap() < F_MAX);
    }
}
