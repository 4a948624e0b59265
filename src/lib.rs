//! # Subband WPE Dereverberation
//!
//! This crate removes late reverberation from speech and audio in the
//! subband (short-time Fourier) domain using weighted prediction error
//! (WPE) filtering. Per frequency subband it estimates a delayed linear
//! prediction filter over past frames and subtracts the predicted
//! reverberation tail from each new observation.
//!
//! Two variants are provided:
//!
//! - **Single-channel**: one filter of `P` taps per subband.
//! - **Multi-channel**: a joint filter of `P * C` taps per channel and
//!   subband, exploiting correlations across microphone channels, with
//!   per-channel streaming façades sharing one orchestrator.
//!
//! Estimation and filtering are two distinct phases:
//!
//! ```text
//! estimate_filter:  buffer frames -> [ theta sweep -> normal equations
//!                   -> diagonal load -> Cholesky solve ] x iterations
//! next:             pull frame -> subtract predicted tail -> mirror
//! ```
//!
//! Frames enter and leave as complex half-spectra of a real signal: the
//! filter runs over `k in [0, K/2]` and the upper half is reconstructed as
//! `out[K - k] = conj(out[k])`. The short-time analysis and synthesis that
//! produce and consume the frames live outside this crate, behind the
//! [`SubbandSource`](stream::SubbandSource) trait.
//!
//! ## Example
//!
//! ```rust
//! use num_complex::Complex64;
//! use wpe_dereverb::prelude::*;
//!
//! // One excitation frame followed by silence.
//! let mut frames = vec![vec![Complex64::new(1.0, 0.0); 8]];
//! frames.extend(std::iter::repeat(vec![Complex64::new(0.0, 0.0); 8]).take(15));
//! let source = VectorComplexSource::new(frames).unwrap();
//!
//! let config = WpeConfig {
//!     subbands: 8,
//!     lower_lag: 1,
//!     upper_lag: 2,
//!     iterations: 1,
//!     ..WpeConfig::default()
//! };
//! let mut wpe = SingleChannelDereverberator::new(config, Box::new(source)).unwrap();
//! let frames_used = wpe.estimate_filter(0, 0).unwrap();
//! assert_eq!(frames_used, 16);
//!
//! let out = wpe.next(0).unwrap();
//! assert_eq!(out.len(), 8);
//! ```

pub mod cholesky;
pub mod config;
pub mod multi_channel;
pub mod single_channel;
pub mod stream;
pub mod types;

pub use config::{MultiChannelWpeConfig, WpeConfig};
pub use multi_channel::{DereverberatedChannel, MultiChannelDereverberator};
pub use single_channel::SingleChannelDereverberator;
pub use stream::{SubbandSource, VectorComplexSource};
pub use types::{Complex, DereverbError, DereverbResult, SubbandFrame};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{MultiChannelWpeConfig, WpeConfig};
    pub use crate::multi_channel::{DereverberatedChannel, MultiChannelDereverberator};
    pub use crate::single_channel::SingleChannelDereverberator;
    pub use crate::stream::{SubbandSource, VectorComplexSource};
    pub use crate::types::{DereverbError, DereverbResult, SubbandFrame};
}
