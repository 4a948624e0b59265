//! Single-channel WPE dereverberation in the subband domain.
//!
//! Estimates, per subband, a delayed linear prediction filter over past
//! frames and subtracts the predicted late reverberation from the current
//! observation. Estimation alternates between recomputing a per-sample power
//! weight from the currently dereverberated signal and re-solving the
//! weighted normal equations, for a fixed number of passes. Once estimated,
//! the frozen filters are applied frame by frame to the stream.
//!
//! # Example
//!
//! ```
//! use num_complex::Complex64;
//! use wpe_dereverb::{SingleChannelDereverberator, VectorComplexSource, WpeConfig};
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
//!     load_db: -40.0,
//!     band_width: 0.0,
//!     sample_rate: 16000.0,
//!     debug_subband: None,
//! };
//! let mut wpe = SingleChannelDereverberator::new(config, Box::new(source)).unwrap();
//! assert_eq!(wpe.estimate_filter(0, 0).unwrap(), 16);
//!
//! // Frames before the prediction delay pass through unchanged.
//! let out = wpe.next(0).unwrap();
//! assert_eq!(out[0], Complex64::new(1.0, 0.0));
//! ```

use num_complex::Complex64;
use tracing::{debug, info};

use crate::cholesky;
use crate::config::WpeConfig;
use crate::stream::SubbandSource;
use crate::types::{DereverbError, DereverbResult, SubbandFrame};

/// Floor applied to the dereverberated residual magnitude before squaring,
/// so the weighted normal equations stay finite over silence.
pub(crate) const RESIDUAL_FLOOR: f64 = 1.0e-3;

/// Fill `lags` with the delayed observations of `subband` ending at `sample`.
///
/// Element `i` is `history[sample - i][subband]`; indices before the start of
/// the signal read as zero, which is what makes the warm-up frames need no
/// special casing.
fn fill_lags(
    history: &[SubbandFrame],
    subband: usize,
    sample: isize,
    lags: &mut [Complex64],
) {
    for (lag, slot) in lags.iter_mut().enumerate() {
        let index = sample - lag as isize;
        *slot = if index < 0 {
            Complex64::new(0.0, 0.0)
        } else {
            history[index as usize][subband]
        };
    }
}

/// `gᴴ · lags`, the predicted late reverberation.
fn prediction_term(filter: &[Complex64], lags: &[Complex64]) -> Complex64 {
    let mut sum = Complex64::new(0.0, 0.0);
    for (g, lag) in filter.iter().zip(lags.iter()) {
        sum += g.conj() * lag;
    }
    sum
}

/// Replace every diagonal element with `|R[i,i]| + m * load_factor` where `m`
/// is the largest diagonal magnitude. Returns `m` so callers can detect a
/// matrix with no energy at all.
fn load_diagonal(matrix: &mut [Complex64], order: usize, load_factor: f64) -> f64 {
    let mut max_diagonal = 0.0f64;
    for i in 0..order {
        max_diagonal = max_diagonal.max(matrix[i * order + i].norm());
    }
    for i in 0..order {
        let loaded = matrix[i * order + i].norm() + max_diagonal * load_factor;
        matrix[i * order + i] = Complex64::new(loaded, 0.0);
    }
    max_diagonal
}

/// Single-channel weighted-prediction-error dereverberator.
pub struct SingleChannelDereverberator {
    config: WpeConfig,
    source: Box<dyn SubbandSource>,
    /// Prediction order P.
    prediction: usize,
    load_factor: f64,
    /// Highest filtered subband of the lower half-spectrum.
    lower_edge: usize,
    /// Lowest filtered subband of the upper half-spectrum.
    upper_edge: usize,
    /// Per-subband prediction coefficients, length P each.
    filters: Vec<Vec<Complex64>>,
    /// Per-sample, per-subband power weights, `frames_used x subbands`,
    /// live only during estimation.
    theta: Vec<f64>,
    /// Estimation-phase frame buffer.
    history: Vec<SubbandFrame>,
    /// Streaming-phase shift window, at most P frames.
    window: Vec<SubbandFrame>,
    /// Lower triangle of the weighted covariance, P x P.
    normal_matrix: Vec<Complex64>,
    normal_vector: Vec<Complex64>,
    lags: Vec<Complex64>,
    output: Vec<Complex64>,
    frames_used: usize,
    frames_streamed: usize,
    estimated: bool,
    ended: bool,
}

impl SingleChannelDereverberator {
    /// Create a dereverberator reading frames from `source`.
    pub fn new(
        config: WpeConfig,
        source: Box<dyn SubbandSource>,
    ) -> DereverbResult<Self> {
        config.validate()?;
        if source.size() != config.subbands {
            return Err(DereverbError::SubbandCountMismatch {
                expected: config.subbands,
                got: source.size(),
            });
        }
        let prediction = config.prediction_order();
        let lower_edge = config.band_edge()?;
        let upper_edge = config.subbands - lower_edge;
        let load_factor = config.load_factor();
        let subbands = config.subbands;
        let zero = Complex64::new(0.0, 0.0);
        Ok(Self {
            source,
            prediction,
            load_factor,
            lower_edge,
            upper_edge,
            filters: vec![vec![zero; prediction]; subbands],
            theta: Vec::new(),
            history: Vec::new(),
            window: Vec::new(),
            normal_matrix: vec![zero; prediction * prediction],
            normal_vector: vec![zero; prediction],
            lags: vec![zero; prediction],
            output: vec![zero; subbands],
            frames_used: 0,
            frames_streamed: 0,
            estimated: false,
            ended: false,
            config,
        })
    }

    /// Frame width `K` in subbands.
    pub fn size(&self) -> usize {
        self.config.subbands
    }

    /// True once `estimate_filter` has run.
    pub fn is_estimated(&self) -> bool {
        self.estimated
    }

    /// Number of frames consumed by the last `estimate_filter` call.
    pub fn frames_used(&self) -> usize {
        self.frames_used
    }

    /// Prediction coefficients for one subband.
    pub fn filter(&self, subband: usize) -> &[Complex64] {
        &self.filters[subband]
    }

    /// Estimate the prediction filters from buffered frames.
    ///
    /// Discards the first `start_frame` frames, then records frames until
    /// `end_frame` is reached; `end_frame == 0` records every frame the
    /// source yields. A source that ends mid-collection stops the collection
    /// without failing. The source is rewound and the frame buffer released
    /// before returning, so streaming starts from the first frame.
    ///
    /// Returns the number of frames used.
    pub fn estimate_filter(
        &mut self,
        start_frame: usize,
        end_frame: usize,
    ) -> DereverbResult<usize> {
        self.fill_buffer(start_frame, end_frame);
        self.estimate_filters()?;
        self.source.reset();
        self.history.clear();
        self.theta = Vec::new();
        self.estimated = true;
        debug!(frames = self.frames_used, "prediction filters estimated");
        Ok(self.frames_used)
    }

    /// Emit the dereverberated frame `frame_no`.
    ///
    /// `frame_no` must advance by exactly one per call; repeating the index
    /// of the frame just emitted returns the cached output without pulling
    /// upstream. Once the source ends, every further advance reports
    /// [`DereverbError::EndOfSamples`].
    pub fn next(&mut self, frame_no: usize) -> DereverbResult<&[Complex64]> {
        if !self.estimated {
            return Err(DereverbError::FilterNotEstimated);
        }
        if self.frames_streamed > 0 && frame_no + 1 == self.frames_streamed {
            return Ok(&self.output);
        }
        if frame_no != self.frames_streamed {
            return Err(DereverbError::FrameIndexMismatch {
                expected: self.frames_streamed,
                got: frame_no,
            });
        }
        if self.ended {
            return Err(DereverbError::EndOfSamples);
        }
        let Some(frame) = self.source.next() else {
            self.ended = true;
            return Err(DereverbError::EndOfSamples);
        };

        // Oldest frame leaves before the newest enters.
        if self.window.len() >= self.prediction {
            self.window.remove(0);
        }
        self.window.push(frame);

        let subbands = self.config.subbands;
        let half = subbands / 2;
        let delay = self.config.lower_lag;
        let newest = self.window.len() - 1;
        for subband in 0..=half {
            let mut current = self.window[newest][subband];
            if frame_no >= delay
                && (subband <= self.lower_edge || subband >= self.upper_edge)
            {
                fill_lags(
                    &self.window,
                    subband,
                    newest as isize - delay as isize,
                    &mut self.lags,
                );
                current -= prediction_term(&self.filters[subband], &self.lags);
            }
            self.output[subband] = current;
            if subband > 0 && subband < half {
                self.output[subbands - subband] = current.conj();
            }
        }
        self.frames_streamed = frame_no + 1;
        Ok(&self.output)
    }

    /// Rewind the source and drop all buffered frames. Coefficients and the
    /// estimated state are kept.
    pub fn reset(&mut self) {
        self.source.reset();
        self.history.clear();
        self.window.clear();
        self.frames_streamed = 0;
        self.ended = false;
    }

    /// Forget the estimation so `estimate_filter` can run again.
    /// Coefficients keep their current values.
    pub fn reset_filter(&mut self) {
        self.estimated = false;
        self.frames_used = 0;
        self.theta = Vec::new();
    }

    /// Rewind everything and zero all prediction coefficients.
    pub fn next_speaker(&mut self) {
        self.reset();
        for filter in &mut self.filters {
            filter.fill(Complex64::new(0.0, 0.0));
        }
    }

    fn fill_buffer(&mut self, start_frame: usize, end_frame: usize) {
        let mut frame_index = 0usize;
        loop {
            if end_frame > 0 && frame_index >= end_frame {
                break;
            }
            let Some(frame) = self.source.next() else { break };
            if frame_index >= start_frame {
                self.history.push(frame);
            }
            frame_index += 1;
        }
        self.frames_used = self.history.len();
        self.theta = vec![0.0; self.frames_used * self.config.subbands];
    }

    /// Recompute every power weight from the currently dereverberated signal.
    fn update_theta(&mut self) {
        let subbands = self.config.subbands;
        let delay = self.config.lower_lag;
        for sample in 0..self.frames_used {
            for subband in 0..subbands {
                let mut residual = self.history[sample][subband];
                if sample >= delay {
                    fill_lags(
                        &self.history,
                        subband,
                        (sample - delay) as isize,
                        &mut self.lags,
                    );
                    residual -= prediction_term(&self.filters[subband], &self.lags);
                }
                let magnitude = residual.norm().max(RESIDUAL_FLOOR);
                self.theta[sample * subbands + subband] = magnitude * magnitude;
            }
        }
    }

    /// Accumulate the weighted covariance (lower triangle) and
    /// cross-correlation for one subband.
    fn accumulate_normal_equations(&mut self, subband: usize) {
        let subbands = self.config.subbands;
        let delay = self.config.lower_lag;
        let order = self.prediction;
        let zero = Complex64::new(0.0, 0.0);
        self.normal_matrix.fill(zero);
        self.normal_vector.fill(zero);

        let mut objective = 0.0;
        for sample in delay..self.frames_used {
            let theta = self.theta[sample * subbands + subband];
            let weight = 1.0 / theta;
            fill_lags(
                &self.history,
                subband,
                (sample - delay) as isize,
                &mut self.lags,
            );
            let current = self.history[sample][subband];
            let residual = current - prediction_term(&self.filters[subband], &self.lags);
            objective += residual.norm_sqr() * weight + theta.ln();
            for row in 0..order {
                let row_sample = self.lags[row];
                for col in 0..=row {
                    self.normal_matrix[row * order + col] +=
                        row_sample * self.lags[col].conj() * weight;
                }
                self.normal_vector[row] += current.conj() * self.lags[row] * weight;
            }
        }

        if self.config.debug_subband == Some(subband) {
            info!(subband, objective, "weighted prediction objective");
        }
    }

    fn estimate_filters(&mut self) -> DereverbResult<()> {
        let subbands = self.config.subbands;
        for iteration in 0..self.config.iterations {
            self.update_theta();
            for subband in 0..subbands {
                if subband > self.lower_edge && subband < self.upper_edge {
                    continue;
                }
                self.accumulate_normal_equations(subband);
                let max_diagonal =
                    load_diagonal(&mut self.normal_matrix, self.prediction, self.load_factor);
                if max_diagonal == 0.0 {
                    // Silent subband; the relative load cannot regularize a
                    // zero matrix, so keep the previous coefficients.
                    continue;
                }
                cholesky::decompose(&mut self.normal_matrix, self.prediction)
                    .map_err(|_| DereverbError::NotPositiveDefinite { subband })?;
                cholesky::solve(
                    &self.normal_matrix,
                    &self.normal_vector,
                    &mut self.filters[subband],
                    self.prediction,
                );
                if self.config.debug_subband == Some(subband) {
                    let gain = self.filters[subband]
                        .iter()
                        .map(|g| g.norm_sqr())
                        .sum::<f64>()
                        .sqrt();
                    info!(
                        iteration,
                        subband,
                        wng_db = 20.0 * gain.log10(),
                        "white-noise gain"
                    );
                }
            }
        }
        Ok(())
    }
}
