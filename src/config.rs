//! Configuration for the subband prediction filters.
//!
//! Both dereverberator variants share [`WpeConfig`]; the multi-channel
//! orchestrator wraps it in [`MultiChannelWpeConfig`] together with the
//! channel count and an absolute diagonal regularizer.
//!
//! The prediction filter spans lags `lower_lag ..= upper_lag`, so the
//! prediction order is `upper_lag - lower_lag + 1` and `lower_lag` doubles as
//! the prediction delay: the newest regressor is always `lower_lag` frames
//! behind the target, which keeps early reflections out of the model.

use serde::{Deserialize, Serialize};

use crate::types::{DereverbError, DereverbResult};

/// Parameters for weighted-prediction-error filter estimation and filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WpeConfig {
    /// Frame width `K` in subbands. Must be even; `K/2` is the Nyquist bin.
    pub subbands: usize,
    /// First prediction lag, in frames. Also the prediction delay.
    pub lower_lag: usize,
    /// Last prediction lag, in frames.
    pub upper_lag: usize,
    /// Number of estimation passes over the buffered frames.
    pub iterations: usize,
    /// Relative diagonal load in dB, applied as `10^(load_db / 10)` times the
    /// largest diagonal element of the normal-equation matrix.
    pub load_db: f64,
    /// Analysis bandwidth in Hz. `0.0` filters the full half-band.
    pub band_width: f64,
    /// Sample rate in Hz.
    pub sample_rate: f64,
    /// When set, the estimator logs the objective value and white-noise gain
    /// for this subband on every pass.
    pub debug_subband: Option<usize>,
}

impl Default for WpeConfig {
    fn default() -> Self {
        Self {
            subbands: 512,
            lower_lag: 3,
            upper_lag: 12,
            iterations: 2,
            load_db: -20.0,
            band_width: 0.0,
            sample_rate: 16000.0,
            debug_subband: None,
        }
    }
}

impl WpeConfig {
    /// Number of prediction taps per channel.
    pub fn prediction_order(&self) -> usize {
        self.upper_lag - self.lower_lag + 1
    }

    /// Linear diagonal load factor derived from `load_db`.
    pub fn load_factor(&self) -> f64 {
        10.0f64.powf(self.load_db / 10.0)
    }

    /// Index of the highest filtered subband in the lower half-spectrum.
    ///
    /// Subbands `k <= edge` and `k >= subbands - edge` are filtered; the
    /// interior passes through unchanged. A zero bandwidth selects the whole
    /// half-spectrum.
    pub fn band_edge(&self) -> DereverbResult<usize> {
        if self.band_width == 0.0 {
            return Ok(self.subbands / 2);
        }
        let nyquist = self.sample_rate / 2.0;
        if self.band_width > nyquist {
            return Err(DereverbError::BandwidthAboveNyquist {
                band_width: self.band_width,
                nyquist,
            });
        }
        Ok(((self.band_width / nyquist) * (self.subbands / 2) as f64) as usize)
    }

    /// Check structural parameters, failing fast on the first violation.
    pub fn validate(&self) -> DereverbResult<()> {
        if self.subbands < 2 || self.subbands % 2 != 0 {
            return Err(DereverbError::InvalidConfig(format!(
                "subbands must be even and >= 2, got {}",
                self.subbands
            )));
        }
        if self.upper_lag < self.lower_lag {
            return Err(DereverbError::InvalidConfig(format!(
                "upper_lag {} is below lower_lag {}",
                self.upper_lag, self.lower_lag
            )));
        }
        if self.iterations == 0 {
            return Err(DereverbError::InvalidConfig(
                "iterations must be at least 1".into(),
            ));
        }
        if self.band_width < 0.0 {
            return Err(DereverbError::InvalidConfig(format!(
                "band_width must be non-negative, got {}",
                self.band_width
            )));
        }
        if self.band_width > 0.0 && self.sample_rate <= 0.0 {
            return Err(DereverbError::InvalidConfig(format!(
                "sample_rate must be positive when band_width is set, got {}",
                self.sample_rate
            )));
        }
        self.band_edge()?;
        Ok(())
    }
}

/// Parameters for the multi-channel orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiChannelWpeConfig {
    /// Shared estimation and filtering parameters.
    pub wpe: WpeConfig,
    /// Number of microphone channels filtered jointly.
    pub channels: usize,
    /// Absolute value added to every diagonal element of the joint
    /// normal-equation matrix. Guards against near-singular covariance when
    /// channels are strongly correlated.
    pub diagonal_bias: f64,
}

impl Default for MultiChannelWpeConfig {
    fn default() -> Self {
        Self {
            wpe: WpeConfig::default(),
            channels: 2,
            diagonal_bias: 1e-6,
        }
    }
}

impl MultiChannelWpeConfig {
    /// Check structural parameters, failing fast on the first violation.
    pub fn validate(&self) -> DereverbResult<()> {
        self.wpe.validate()?;
        if self.channels == 0 {
            return Err(DereverbError::InvalidConfig(
                "channels must be at least 1".into(),
            ));
        }
        if self.diagonal_bias < 0.0 {
            return Err(DereverbError::InvalidConfig(format!(
                "diagonal_bias must be non-negative, got {}",
                self.diagonal_bias
            )));
        }
        Ok(())
    }
}
