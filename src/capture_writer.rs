//! Writes conditioned listener captures to disk as stereo WAV files, so a
//! handshake that ranged badly can be listened to or plotted afterwards.

use crate::{signal::Stereo, RobotId};
use hound::{Error as HoundError, SampleFormat, WavSpec, WavWriter};
use std::{
    fmt,
    path::{Path, PathBuf},
};

const BITS_PER_SAMPLE: u16 = 32;

/// Returned when a capture cannot be written.
#[derive(Debug)]
pub enum CaptureWriteError {
    /// The capture has no samples, so there is nothing to write.
    Empty,
    /// The sample rate the capture implies does not fit a WAV header.
    BadRate(u64),
    /// Returned when hound fails to create or write the file.
    HoundError(HoundError),
}

impl fmt::Display for CaptureWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureWriteError::Empty => write!(f, "capture is empty"),
            CaptureWriteError::BadRate(rate) => write!(f, "unusable sample rate {} Hz", rate),
            CaptureWriteError::HoundError(error) => write!(f, "wav error: {}", error),
        }
    }
}

impl std::error::Error for CaptureWriteError {}

/// Names and writes capture files in one directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureWriter {
    dir: PathBuf,
    listen_ms: u32,
}

impl CaptureWriter {
    /// A writer for captures recorded over a `listen_ms` window.
    pub fn new(dir: impl Into<PathBuf>, listen_ms: u32) -> Self {
        Self {
            dir: dir.into(),
            listen_ms,
        }
    }

    /// Where the capture of `follower` heard from vantage `vantage` goes.
    pub fn path_for(&self, follower: RobotId, vantage: usize) -> PathBuf {
        self.dir
            .join(format!("capture-r{}-v{}.wav", follower, vantage))
    }

    /// Writes one capture, returning the path written.
    pub fn write(
        &self,
        follower: RobotId,
        vantage: usize,
        capture: &Stereo,
    ) -> Result<PathBuf, CaptureWriteError> {
        let path = self.path_for(follower, vantage);
        write_stereo(&path, capture, self.listen_ms)?;
        Ok(path)
    }
}

/// Writes `capture` as interleaved 32-bit float stereo. The sample rate is
/// whatever packs the capture into `listen_ms`.
pub fn write_stereo(
    path: &Path,
    capture: &Stereo,
    listen_ms: u32,
) -> Result<(), CaptureWriteError> {
    if capture.is_empty() || listen_ms == 0 {
        return Err(CaptureWriteError::Empty);
    }
    let rate = capture.len() as u64 * 1000 / listen_ms as u64;
    let sample_rate = u32::try_from(rate)
        .ok()
        .filter(|r| *r > 0)
        .ok_or(CaptureWriteError::BadRate(rate))?;

    let spec = WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: BITS_PER_SAMPLE,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path, spec).map_err(CaptureWriteError::HoundError)?;

    // interleave the two channels
    for (left, right) in std::iter::zip(&capture.left, &capture.right) {
        writer
            .write_sample(*left as f32)
            .map_err(CaptureWriteError::HoundError)?;
        writer
            .write_sample(*right as f32)
            .map_err(CaptureWriteError::HoundError)?;
    }
    writer.finalize().map_err(CaptureWriteError::HoundError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::WavReader;

    #[test]
    fn writes_readable_stereo() {
        let dir = tempfile::tempdir().unwrap();
        let capture = Stereo {
            left: (0..500).map(|i| (i as f64 * 0.1).sin()).collect(),
            right: (0..500).map(|i| (i as f64 * 0.1).cos()).collect(),
        };
        let writer = CaptureWriter::new(dir.path(), 500);
        let path = writer.write(2, 1, &capture).unwrap();
        assert!(path.ends_with("capture-r2-v1.wav"));

        let mut reader = WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 1000);

        let all_samps = reader
            .samples::<f32>()
            .collect::<Result<Vec<f32>, hound::Error>>()
            .unwrap();
        let left_out: Vec<f32> = all_samps.iter().copied().step_by(2).collect();
        let right_out: Vec<f32> = all_samps.iter().copied().skip(1).step_by(2).collect();

        let left_in: Vec<f32> = capture.left.iter().map(|v| *v as f32).collect();
        let right_in: Vec<f32> = capture.right.iter().map(|v| *v as f32).collect();
        assert_eq!(left_out, left_in);
        assert_eq!(right_out, right_in);
    }

    #[test]
    fn refuses_empty_captures() {
        let dir = tempfile::tempdir().unwrap();
        let result = write_stereo(&dir.path().join("x.wav"), &Stereo::default(), 500);
        assert!(matches!(result, Err(CaptureWriteError::Empty)));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CaptureWriter::new(dir.path().join("nope"), 500);
        let capture = Stereo {
            left: vec![0.0; 4],
            right: vec![0.0; 4],
        };
        assert!(matches!(
            writer.write(1, 0, &capture),
            Err(CaptureWriteError::HoundError(_))
        ));
    }
}
