//! Time-of-flight from a captured tone.
//!
//! The listener records `N` samples over the listen window; the speaker plays
//! a pure tone for the (shorter) speak window. We synthesise the same tone at
//! the listener's sample rate, cross-correlate it against the capture, and
//! take the lag with the strongest (absolute) normalised correlation as the
//! sample at which the tone arrived. Subtracting the sample at which the
//! speaker started leaves the flight time, which the speed of sound turns
//! into a distance.

use crate::config::AcousticConfig;
use std::f64::consts::PI;
use std::fmt;

/// Why a capture could not be ranged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangingError {
    /// There were no samples at all.
    EmptyCapture,
    /// Every sample was zero, so nothing correlates with anything.
    SilentCapture,
}

impl fmt::Display for RangingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangingError::EmptyCapture => write!(f, "capture has no samples"),
            RangingError::SilentCapture => write!(f, "capture is silent"),
        }
    }
}

impl std::error::Error for RangingError {}

/// Result of ranging one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeEstimate {
    /// Sample index at which the tone best lines up with the capture.
    pub lag: i64,
    /// Normalised correlation at that lag, in `[-1, 1]`.
    pub peak: f64,
    /// Signed distance in centimeters. Negative means the tone seemingly
    /// arrived before it was played, which points at a clock problem.
    pub distance_cm: f64,
}

/// Converts captures into distances for one tone and capture geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct RangingKernel {
    tone_hz: f64,
    listen_s: f64,
    speak_s: f64,
    speed_of_sound: f64,
}

impl RangingKernel {
    #[allow(missing_docs)]
    pub fn new(acoustics: &AcousticConfig) -> Self {
        Self {
            tone_hz: acoustics.tone_hz,
            listen_s: acoustics.listen_ms as f64 / 1000.0,
            speak_s: acoustics.speak_ms as f64 / 1000.0,
            speed_of_sound: acoustics.speed_of_sound,
        }
    }

    /// The tone as a listener recording `capture_len` samples would see it:
    /// same sample rate, lasting the speak window, both ends included.
    /// Empty if there is no listen window to fit it in.
    pub fn reference_tone(&self, capture_len: usize) -> Vec<f64> {
        if capture_len == 0 || !(self.listen_s > 0.0) {
            return Vec::new();
        }
        let n = capture_len as f64;
        let tone_len = (self.speak_s * n / self.listen_s).floor() as usize + 1;
        let dt = self.listen_s / n;
        (0..tone_len)
            .map(|i| (2.0 * PI * self.tone_hz * i as f64 * dt).sin())
            .collect()
    }

    /// Centimeters of flight per sample, for a capture of `capture_len`.
    pub fn cm_per_sample(&self, capture_len: usize) -> f64 {
        self.listen_s * self.speed_of_sound * 100.0 / capture_len as f64
    }

    /// Ranges one channel. `speaker_offset` is the sample at which the
    /// speaker started playing, from the aligned clocks.
    pub fn range(
        &self,
        samples: &[f64],
        speaker_offset: i64,
    ) -> Result<RangeEstimate, RangingError> {
        let tone = self.reference_tone(samples.len());
        let (lag, peak) = peak_lag(samples, &tone)?;
        Ok(RangeEstimate {
            lag,
            peak,
            distance_cm: (lag - speaker_offset) as f64 * self.cm_per_sample(samples.len()),
        })
    }
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Normalised cross-correlation of `signal` against `template` at every lag
/// from `-(template.len() - 1)` to `signal.len() - 1`, as `(lag, value)`.
///
/// At lag `k` the template is slid so that its first sample sits on
/// `signal[k]`.
pub fn xcorr(signal: &[f64], template: &[f64]) -> Vec<(i64, f64)> {
    let scale = norm(signal) * norm(template);
    let n = signal.len() as i64;
    let m = template.len() as i64;
    (-(m - 1)..n)
        .map(|lag| {
            let first = (-lag).max(0);
            let last = m.min(n - lag);
            let sum: f64 = (first..last)
                .map(|j| template[j as usize] * signal[(j + lag) as usize])
                .sum();
            (lag, if scale > 0.0 { sum / scale } else { 0.0 })
        })
        .collect()
}

/// The lag of strongest absolute correlation. Ties go to the earliest lag.
pub fn peak_lag(signal: &[f64], template: &[f64]) -> Result<(i64, f64), RangingError> {
    if signal.is_empty() || template.is_empty() {
        return Err(RangingError::EmptyCapture);
    }
    if norm(signal) == 0.0 {
        return Err(RangingError::SilentCapture);
    }
    xcorr(signal, template)
        .into_iter()
        .fold(None, |best: Option<(i64, f64)>, (lag, value)| match best {
            Some((_, top)) if value.abs() <= top.abs() => best,
            _ => Some((lag, value)),
        })
        .ok_or(RangingError::EmptyCapture)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel() -> RangingKernel {
        RangingKernel::new(&AcousticConfig::default())
    }

    fn shifted_tone(kernel: &RangingKernel, len: usize, shift: usize) -> Vec<f64> {
        let tone = kernel.reference_tone(len);
        let mut samples = vec![0.0; len];
        samples[shift..shift + tone.len()].copy_from_slice(&tone);
        samples
    }

    #[test]
    fn reference_tone_spans_the_speak_window() {
        // 125 ms of a 500 ms window, both ends included
        assert_eq!(kernel().reference_tone(500).len(), 126);
        assert_eq!(kernel().reference_tone(1000).len(), 251);
        assert!(kernel().reference_tone(0).is_empty());
    }

    #[test]
    fn finds_a_ten_sample_shift() {
        let kernel = kernel();
        let samples = shifted_tone(&kernel, 500, 10);
        let estimate = kernel.range(&samples, 0).unwrap();

        assert!((estimate.lag - 10).abs() <= 1);
        // 500 ms window, 343 m/s, 500 samples: 34.3 cm per sample
        assert!((estimate.distance_cm - 343.0).abs() <= 34.3 + 1e-9);
        assert!(estimate.peak > 0.99);
    }

    #[test]
    fn speaker_offset_is_subtracted() {
        let kernel = kernel();
        let samples = shifted_tone(&kernel, 500, 30);
        let estimate = kernel.range(&samples, 20).unwrap();
        assert_eq!(estimate.lag, 30);
        assert!((estimate.distance_cm - 343.0).abs() < 1e-9);

        let early = kernel.range(&samples, 40).unwrap();
        assert!(early.distance_cm < 0.0);
    }

    #[test]
    fn tolerates_other_capture_lengths() {
        let kernel = kernel();
        let samples = shifted_tone(&kernel, 731, 57);
        assert_eq!(kernel.range(&samples, 0).unwrap().lag, 57);
    }

    #[test]
    fn inverted_capture_still_ranges() {
        let kernel = kernel();
        let samples: Vec<f64> = shifted_tone(&kernel, 500, 12)
            .into_iter()
            .map(|v| -v)
            .collect();
        let estimate = kernel.range(&samples, 0).unwrap();
        assert_eq!(estimate.lag, 12);
        assert!(estimate.peak < -0.99);
    }

    #[test]
    fn ties_go_to_the_earliest_lag() {
        // an impulse correlates equally at both of these lags
        let signal = [1.0, 0.0, 1.0];
        let template = [1.0];
        assert_eq!(peak_lag(&signal, &template).unwrap().0, 0);
    }

    #[test]
    fn nothing_to_range() {
        let kernel = kernel();
        assert_eq!(kernel.range(&[], 0), Err(RangingError::EmptyCapture));
        assert_eq!(
            kernel.range(&[0.0; 64], 0),
            Err(RangingError::SilentCapture)
        );
    }

    #[test]
    fn zero_listen_window_has_no_tone() {
        let kernel = RangingKernel::new(&AcousticConfig {
            listen_ms: 0,
            ..AcousticConfig::default()
        });
        assert!(kernel.reference_tone(500).is_empty());
        assert_eq!(
            kernel.range(&[0.5; 64], 0),
            Err(RangingError::EmptyCapture)
        );
    }
}
