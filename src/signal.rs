//! Turns a listener's raw payload into two clean channels.
//!
//! The robot sends its microphone samples as comma-separated hex tokens,
//! alternating left and right. We decode them, then normalise each channel
//! on its own: remove the DC offset and scale to unit peak, so the ranging
//! kernel sees values in `[-1, 1]` no matter how loud the capture was.

use log::warn;
use nom::{
    bytes::complete::tag_no_case,
    character::complete::{char, hex_digit1, multispace0},
    combinator::{all_consuming, map_res, opt, recognize},
    sequence::{delimited, pair, preceded},
    IResult,
};

/// Left and right channels of one capture, always the same length.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Stereo {
    #[allow(missing_docs)]
    pub left: Vec<f64>,
    #[allow(missing_docs)]
    pub right: Vec<f64>,
}

impl Stereo {
    /// Samples per channel.
    pub fn len(&self) -> usize {
        self.left.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }
}

fn parse_sample(s: &str) -> IResult<&str, f64> {
    all_consuming(delimited(
        multispace0,
        map_res(
            pair(
                opt(char('-')),
                preceded(opt(tag_no_case("0x")), recognize(hex_digit1)),
            ),
            |(sign, digits): (Option<char>, &str)| {
                let magnitude = i64::from_str_radix(digits, 16)? as f64;
                Ok::<f64, std::num::ParseIntError>(match sign {
                    Some(_) => -magnitude,
                    None => magnitude,
                })
            },
        ),
        multispace0,
    ))(s)
}

/// Decodes an interleaved payload into left and right channels.
///
/// A token that does not parse is logged and its whole left/right frame is
/// dropped, so that the channels stay aligned. A trailing unpaired token is
/// dropped too.
pub fn decode(payload: &str) -> Stereo {
    let tokens: Vec<&str> = payload.split(',').collect();
    let mut stereo = Stereo {
        left: Vec::with_capacity(tokens.len() / 2),
        right: Vec::with_capacity(tokens.len() / 2),
    };

    let frames = tokens.chunks_exact(2);
    if !frames.remainder().is_empty() {
        warn!("dropping unpaired trailing sample {:?}", frames.remainder()[0]);
    }
    for (i, frame) in frames.enumerate() {
        match (parse_sample(frame[0]), parse_sample(frame[1])) {
            (Ok((_, left)), Ok((_, right))) => {
                stereo.left.push(left);
                stereo.right.push(right);
            }
            _ => warn!("dropping malformed sample frame {}: {:?}", i, frame),
        }
    }
    stereo
}

/// Removes DC and scales to unit peak, in place.
///
/// The midpoint of the extremes is subtracted from every sample, then every
/// sample is divided by the larger of the shifted extremes' magnitudes. A
/// flat channel has no peak to scale to and becomes all zeros.
pub fn normalize(samples: &mut [f64]) {
    if samples.is_empty() {
        return;
    }
    let (min, max) = samples
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });

    let mid = (max + min) / 2.0;
    let scale = (max - mid).abs().max((min - mid).abs());
    for sample in samples.iter_mut() {
        *sample = if scale > 0.0 {
            (*sample - mid) / scale
        } else {
            0.0
        };
    }
}

/// Decodes and normalises a capture payload. An empty payload belongs to the
/// robot that was speaking and yields `None`.
pub fn condition(payload: &str) -> Option<Stereo> {
    if payload.trim().is_empty() {
        return None;
    }
    let mut stereo = decode(payload);
    normalize(&mut stereo.left);
    normalize(&mut stereo.right);
    Some(stereo)
}

/// Inverse of [`decode`] for integer samples; what a robot would send.
pub fn encode(left: &[i64], right: &[i64]) -> String {
    left.iter()
        .zip(right)
        .flat_map(|(l, r)| [*l, *r])
        .map(|v| {
            if v < 0 {
                format!("-{:x}", -v)
            } else {
                format!("{:x}", v)
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_interleaved_hex() {
        let stereo = decode("a,0x10, ff ,1");
        assert_eq!(stereo.left, vec![10.0, 255.0]);
        assert_eq!(stereo.right, vec![16.0, 1.0]);
    }

    #[test]
    fn malformed_frame_is_dropped_not_fatal() {
        let stereo = decode("1,2,zz,4,5,6,7");
        assert_eq!(stereo.left, vec![1.0, 5.0]);
        assert_eq!(stereo.right, vec![2.0, 6.0]);
    }

    #[test]
    fn normalizes_to_unit_peak() {
        let mut samples = vec![2048.0, 3048.0, 1048.0, 2548.0];
        normalize(&mut samples);
        assert_eq!(samples, vec![0.0, 1.0, -1.0, 0.5]);
    }

    #[test]
    fn normalization_is_idempotent() {
        let mut once: Vec<f64> = (0..200)
            .map(|i| 1700.0 + 300.0 * (i as f64 * 0.37).sin() + (i % 7) as f64)
            .collect();
        normalize(&mut once);
        let mut twice = once.clone();
        normalize(&mut twice);
        for (a, b) in once.iter().zip(&twice) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn flat_channel_becomes_silence() {
        let mut samples = vec![7.0; 5];
        normalize(&mut samples);
        assert_eq!(samples, vec![0.0; 5]);
    }

    #[test]
    fn speaker_payload_passes_through() {
        assert_eq!(condition(""), None);
        let stereo = condition(&encode(&[0, 10, 20], &[5, 5, 6])).unwrap();
        assert_eq!(stereo.left, vec![-1.0, 0.0, 1.0]);
        assert_eq!(stereo.right, vec![-1.0, -1.0, 1.0]);
    }
}
