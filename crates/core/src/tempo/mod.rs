use std::cmp::Ordering;
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::fmt;
use std::sync::Arc;

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

/// FFT frame length used for the onset envelope.
const FRAME_SIZE: usize = 1024;
/// Hop between successive onset frames (50% overlap).
const HOP_SIZE: usize = 512;
/// Minimum number of envelope points before autocorrelation is attempted.
const MIN_ONSET_FRAMES: usize = 32;
/// The autocorrelation peak must exceed the in-range baseline by this factor.
const PEAK_BASELINE_RATIO: f32 = 1.5;
/// Peaks within this fraction of the maximum count as harmonically equivalent;
/// the shortest such lag wins, which resolves the half-tempo ambiguity of
/// periodic signals.
const HARMONIC_TOLERANCE: f32 = 0.85;

/// Fixed-capacity ring of accepted tempo estimates. The published BPM is
/// always the median of the current contents, which rides out single bad
/// estimates without lagging behind genuine tempo changes for long.
#[derive(Debug, Clone)]
pub struct TempoHistory {
    capacity: usize,
    entries: VecDeque<f32>,
}

impl TempoHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Records an accepted estimate, discarding the oldest entry when full.
    pub fn push(&mut self, bpm: f32) {
        self.entries.push_back(bpm);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Median of the recorded estimates, or `None` when empty.
    pub fn median(&self) -> Option<f32> {
        if self.entries.is_empty() {
            return None;
        }
        let mut sorted: Vec<f32> = self.entries.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        let mid = sorted.len() / 2;
        Some(if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) * 0.5
        } else {
            sorted[mid]
        })
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Batch tempo estimator: Hann-windowed FFT frames over the analysis window
/// produce a half-wave-rectified spectral-flux onset envelope, whose
/// autocorrelation peak inside the configured tempo range yields the BPM.
///
/// Returns `None` rather than an error for degenerate input (silence, too few
/// samples, no convincing periodicity); the caller simply keeps listening.
pub struct TempoEstimator {
    min_bpm: f32,
    max_bpm: f32,
    plan: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    input: Vec<f32>,
    spectrum: Vec<Complex32>,
    scratch: Vec<Complex32>,
    prev_magnitudes: Vec<f32>,
}

impl TempoEstimator {
    pub fn new(min_bpm: f32, max_bpm: f32) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(FRAME_SIZE);
        let input = plan.make_input_vec();
        let spectrum = plan.make_output_vec();
        let scratch = plan.make_scratch_vec();
        let prev_magnitudes = vec![0.0; spectrum.len()];
        let window = (0..FRAME_SIZE).map(|i| hann_value(i, FRAME_SIZE)).collect();
        Self {
            min_bpm,
            max_bpm,
            plan,
            window,
            input,
            spectrum,
            scratch,
            prev_magnitudes,
        }
    }

    /// Estimates the tempo of `samples` (mono, `sample_rate` Hz).
    pub fn estimate(&mut self, samples: &[f32], sample_rate: u32) -> Option<f32> {
        if sample_rate == 0 {
            return None;
        }
        let needed = FRAME_SIZE + HOP_SIZE * MIN_ONSET_FRAMES;
        if samples.len() < needed {
            return None;
        }
        let envelope = self.onset_envelope(samples)?;
        let hop_seconds = HOP_SIZE as f32 / sample_rate as f32;
        pick_tempo(&envelope, hop_seconds, self.min_bpm, self.max_bpm)
    }

    /// Spectral-flux onset envelope, one point per hop. The first frame only
    /// seeds the magnitude memory so the envelope has no warm-up spike.
    fn onset_envelope(&mut self, samples: &[f32]) -> Option<Vec<f32>> {
        let frames = (samples.len() - FRAME_SIZE) / HOP_SIZE + 1;
        let mut envelope = Vec::with_capacity(frames.saturating_sub(1));
        for (index, start) in (0..frames).map(|f| (f, f * HOP_SIZE)) {
            let frame = &samples[start..start + FRAME_SIZE];
            for (slot, (&sample, &weight)) in self
                .input
                .iter_mut()
                .zip(frame.iter().zip(self.window.iter()))
            {
                *slot = sample * weight;
            }
            self.plan
                .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)
                .ok()?;
            let mut flux = 0.0;
            for (bin, prev) in self.spectrum.iter().zip(self.prev_magnitudes.iter_mut()) {
                let magnitude = bin.norm();
                flux += (magnitude - *prev).max(0.0);
                *prev = magnitude;
            }
            if index > 0 {
                envelope.push(flux);
            }
        }
        Some(envelope)
    }
}

impl fmt::Debug for TempoEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TempoEstimator")
            .field("min_bpm", &self.min_bpm)
            .field("max_bpm", &self.max_bpm)
            .finish()
    }
}

/// Finds the dominant periodicity of the onset envelope inside the tempo
/// range and converts its lag to BPM.
fn pick_tempo(envelope: &[f32], hop_seconds: f32, min_bpm: f32, max_bpm: f32) -> Option<f32> {
    if envelope.len() < MIN_ONSET_FRAMES || hop_seconds <= 0.0 {
        return None;
    }

    let mean = envelope.iter().sum::<f32>() / envelope.len() as f32;
    let detrended: Vec<f32> = envelope.iter().map(|v| v - mean).collect();
    let acf = autocorrelation(&detrended);

    let min_lag = (60.0 / (max_bpm * hop_seconds)).round().max(1.0) as usize;
    let max_lag = ((60.0 / (min_bpm * hop_seconds)).round() as usize).min(acf.len() - 1);
    if min_lag >= max_lag {
        return None;
    }

    let peak = acf[min_lag..=max_lag]
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max);
    if !(peak > 0.0) {
        return None;
    }

    let mut in_range: Vec<f32> = acf[min_lag..=max_lag].to_vec();
    in_range.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let baseline = in_range[in_range.len() / 2];
    if peak < PEAK_BASELINE_RATIO * baseline {
        return None;
    }

    // The shortest lag that is harmonically equivalent to the maximum is the
    // beat period; the maximum itself often lands on a multiple of it.
    let threshold = HARMONIC_TOLERANCE * peak;
    let lag = (min_lag..=max_lag).find(|&lag| acf[lag] >= threshold)?;
    let refined = refine_peak(&acf, lag);
    Some(60.0 / (refined * hop_seconds))
}

/// Autocorrelation normalized by overlap length, as in classic onset-based
/// tempo induction.
fn autocorrelation(signal: &[f32]) -> Vec<f32> {
    let n = signal.len();
    let mut result = vec![0.0; n];
    for (lag, slot) in result.iter_mut().enumerate() {
        let mut sum = 0.0;
        for i in 0..(n - lag) {
            sum += signal[i] * signal[i + lag];
        }
        *slot = sum / (n - lag) as f32;
    }
    result
}

/// Quadratic interpolation of the peak position for sub-lag resolution.
fn refine_peak(acf: &[f32], lag: usize) -> f32 {
    if lag == 0 || lag + 1 >= acf.len() {
        return lag as f32;
    }
    let (left, mid, right) = (acf[lag - 1], acf[lag], acf[lag + 1]);
    let denominator = left - 2.0 * mid + right;
    if denominator.abs() < f32::EPSILON {
        return lag as f32;
    }
    let shift = 0.5 * (left - right) / denominator;
    lag as f32 + shift.clamp(-0.5, 0.5)
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }
    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}
