//! Upstream frame interface and an in-memory source.
//!
//! A [`SubbandSource`] hands out one complex subband frame per call, in
//! strict arrival order, until the stream ends. The short-time analysis that
//! produces the frames lives outside this crate; tests and offline runs can
//! use [`VectorComplexSource`] to replay a prepared frame sequence.
//!
//! # Example
//!
//! ```
//! use num_complex::Complex64;
//! use wpe_dereverb::stream::{SubbandSource, VectorComplexSource};
//!
//! let frames = vec![vec![Complex64::new(1.0, 0.0); 4]; 3];
//! let mut source = VectorComplexSource::new(frames).unwrap();
//! assert_eq!(source.size(), 4);
//! assert!(source.next().is_some());
//! source.reset();
//! assert_eq!(source.len(), 3);
//! ```

use crate::types::{DereverbError, DereverbResult, SubbandFrame};

/// A synchronous stream of complex subband frames.
pub trait SubbandSource {
    /// Frame width `K` in subbands.
    fn size(&self) -> usize;

    /// Pull the next frame, or `None` once the stream is exhausted.
    fn next(&mut self) -> Option<SubbandFrame>;

    /// Rewind the stream to its first frame.
    fn reset(&mut self);
}

/// Replays an owned sequence of frames.
#[derive(Debug, Clone)]
pub struct VectorComplexSource {
    frames: Vec<SubbandFrame>,
    size: usize,
    cursor: usize,
}

impl VectorComplexSource {
    /// Create a source over `frames`. All frames must share one width.
    pub fn new(frames: Vec<SubbandFrame>) -> DereverbResult<Self> {
        let size = match frames.first() {
            Some(frame) => frame.len(),
            None => {
                return Err(DereverbError::InvalidConfig(
                    "source needs at least one frame".into(),
                ))
            }
        };
        for frame in &frames {
            if frame.len() != size {
                return Err(DereverbError::SubbandCountMismatch {
                    expected: size,
                    got: frame.len(),
                });
            }
        }
        Ok(Self {
            frames,
            size,
            cursor: 0,
        })
    }

    /// Total number of frames held.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// True when the source holds no frames.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl SubbandSource for VectorComplexSource {
    fn size(&self) -> usize {
        self.size
    }

    fn next(&mut self) -> Option<SubbandFrame> {
        let frame = self.frames.get(self.cursor)?.clone();
        self.cursor += 1;
        Some(frame)
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex64;

    fn frame(value: f64, size: usize) -> SubbandFrame {
        vec![Complex64::new(value, 0.0); size]
    }

    #[test]
    fn test_pull_in_order_then_exhaust() {
        let mut source =
            VectorComplexSource::new(vec![frame(1.0, 4), frame(2.0, 4)]).unwrap();
        assert_eq!(source.next().unwrap()[0].re, 1.0);
        assert_eq!(source.next().unwrap()[0].re, 2.0);
        assert!(source.next().is_none());
        assert!(source.next().is_none());
    }

    #[test]
    fn test_reset_rewinds() {
        let mut source =
            VectorComplexSource::new(vec![frame(1.0, 4), frame(2.0, 4)]).unwrap();
        let _ = source.next();
        source.reset();
        assert_eq!(source.next().unwrap()[0].re, 1.0);
    }

    #[test]
    fn test_rejects_empty_sequence() {
        assert!(matches!(
            VectorComplexSource::new(Vec::new()),
            Err(DereverbError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_ragged_frames() {
        let result = VectorComplexSource::new(vec![frame(1.0, 4), frame(1.0, 6)]);
        assert!(matches!(
            result,
            Err(DereverbError::SubbandCountMismatch { expected: 4, got: 6 })
        ));
    }
}
