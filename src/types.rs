//! Core types for subband-domain dereverberation.
//!
//! Subband frames are vectors of `K` complex samples produced by an external
//! short-time analysis stage. Frames obey the half-spectrum convention for
//! real signals: index `0` is DC, index `K/2` is the Nyquist bin, and
//! `frame[K - k] == conj(frame[k])` for `0 < k < K/2`.

use num_complex::Complex64;

/// Type alias for complex subband samples using f64 precision.
pub type Complex = Complex64;

/// One frame of `K` complex subband samples.
pub type SubbandFrame = Vec<Complex64>;

/// Result type for dereverberation operations.
pub type DereverbResult<T> = Result<T, DereverbError>;

/// Errors that can occur while configuring or running a dereverberator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DereverbError {
    #[error("prediction filters not estimated yet; call estimate_filter() before next()")]
    FilterNotEstimated,

    #[error("frame index must advance by one: expected {expected}, got {got}")]
    FrameIndexMismatch { expected: usize, got: usize },

    #[error("end of samples")]
    EndOfSamples,

    #[error("channel capacity exceeded: {channels} sources already attached")]
    ChannelCapacityExceeded { channels: usize },

    #[error("expected {expected} input sources, {got} attached")]
    ChannelCountMismatch { expected: usize, got: usize },

    #[error("invalid channel index {channel}: only {channels} channels")]
    InvalidChannel { channel: usize, channels: usize },

    #[error("bandwidth {band_width} Hz is greater than the Nyquist rate {nyquist} Hz")]
    BandwidthAboveNyquist { band_width: f64, nyquist: f64 },

    #[error("subband count mismatch: expected {expected}, got {got}")]
    SubbandCountMismatch { expected: usize, got: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("normal-equation matrix is not positive definite in subband {subband}")]
    NotPositiveDefinite { subband: usize },

    #[error(
        "Cholesky decomposition failed in subband {subband}: channels may be too similar; \
         increase diagonal_bias or dereverberate each channel independently"
    )]
    ChannelsTooSimilar { subband: usize },
}
