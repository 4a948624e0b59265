//! Multi-channel WPE dereverberation with joint prediction across channels.
//!
//! The orchestrator owns every per-channel source, filter, and output buffer.
//! Each channel's predictor draws on the lagged observations of *all*
//! channels, so the regressor vector has length `P * C` and the joint
//! covariance can become near-singular when channels are strongly
//! correlated; an absolute `diagonal_bias` keeps it decomposable.
//!
//! Downstream consumers read through thin [`DereverberatedChannel`] façades
//! sharing one orchestrator. Exactly one façade is the primary: it triggers
//! the joint pull-and-filter step for the frame, and the others return the
//! output already computed for their channel. This keeps the source pull at
//! one per stream frame no matter how many consumers fan out.
//!
//! # Example
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use num_complex::Complex64;
//! use wpe_dereverb::{
//!     DereverberatedChannel, MultiChannelDereverberator, MultiChannelWpeConfig,
//!     VectorComplexSource, WpeConfig,
//! };
//!
//! let mut frames = vec![vec![Complex64::new(1.0, 0.0); 8]];
//! frames.extend(std::iter::repeat(vec![Complex64::new(0.0, 0.0); 8]).take(15));
//!
//! let config = MultiChannelWpeConfig {
//!     wpe: WpeConfig {
//!         subbands: 8,
//!         lower_lag: 1,
//!         upper_lag: 2,
//!         iterations: 1,
//!         load_db: -20.0,
//!         band_width: 0.0,
//!         sample_rate: 16000.0,
//!         debug_subband: None,
//!     },
//!     channels: 2,
//!     diagonal_bias: 1e-4,
//! };
//! let wpe = Rc::new(RefCell::new(MultiChannelDereverberator::new(config).unwrap()));
//! for _ in 0..2 {
//!     let source = VectorComplexSource::new(frames.clone()).unwrap();
//!     wpe.borrow_mut().set_input(Box::new(source)).unwrap();
//! }
//! wpe.borrow_mut().estimate_filter(0, 0).unwrap();
//!
//! let mut ch0 = DereverberatedChannel::new(Rc::clone(&wpe), 0, 0).unwrap();
//! let mut ch1 = DereverberatedChannel::new(Rc::clone(&wpe), 1, 0).unwrap();
//! let out0 = ch0.next(0).unwrap().to_vec();
//! let out1 = ch1.next(0).unwrap();
//! assert_eq!(out0[0], Complex64::new(1.0, 0.0));
//! assert_eq!(out0, out1);
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use num_complex::Complex64;
use tracing::{debug, info};

use crate::cholesky;
use crate::config::MultiChannelWpeConfig;
use crate::stream::SubbandSource;
use crate::types::{DereverbError, DereverbResult, SubbandFrame};

use crate::single_channel::RESIDUAL_FLOOR;

/// One frame of every channel, channel-major.
type FrameBrace = Vec<SubbandFrame>;

/// Fill `lags` with the joint delayed observations of `subband` ending at
/// `sample`, channel `c` occupying slots `c * order .. (c + 1) * order`.
/// Indices before the start of the signal read as zero.
fn fill_lags(
    history: &[FrameBrace],
    channels: usize,
    order: usize,
    subband: usize,
    sample: isize,
    lags: &mut [Complex64],
) {
    let mut slot = 0;
    for channel in 0..channels {
        for lag in 0..order {
            let index = sample - lag as isize;
            lags[slot] = if index < 0 {
                Complex64::new(0.0, 0.0)
            } else {
                history[index as usize][channel][subband]
            };
            slot += 1;
        }
    }
}

fn prediction_term(filter: &[Complex64], lags: &[Complex64]) -> Complex64 {
    let mut sum = Complex64::new(0.0, 0.0);
    for (g, lag) in filter.iter().zip(lags.iter()) {
        sum += g.conj() * lag;
    }
    sum
}

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

/// Multi-channel weighted-prediction-error dereverberator.
pub struct MultiChannelDereverberator {
    config: MultiChannelWpeConfig,
    sources: Vec<Box<dyn SubbandSource>>,
    /// Prediction order P per channel.
    prediction: usize,
    /// Joint regressor length, P * C.
    total_prediction: usize,
    load_factor: f64,
    lower_edge: usize,
    upper_edge: usize,
    /// `filters[channel][subband]` holds P * C joint coefficients.
    filters: Vec<Vec<Vec<Complex64>>>,
    /// Per-channel power weights, each `frames_used x subbands`.
    theta: Vec<Vec<f64>>,
    /// Estimation-phase frame buffer, one brace of C frames per step.
    history: Vec<FrameBrace>,
    /// Streaming-phase shift window, at most P braces.
    window: Vec<FrameBrace>,
    /// Per-channel lower triangles of the joint covariance.
    normal_matrices: Vec<Vec<Complex64>>,
    normal_vectors: Vec<Vec<Complex64>>,
    lags: Vec<Complex64>,
    outputs: Vec<Vec<Complex64>>,
    frames_used: usize,
    frames_streamed: usize,
    estimated: bool,
    ended: bool,
}

impl MultiChannelDereverberator {
    /// Create an orchestrator; sources are attached afterwards with
    /// [`set_input`](Self::set_input).
    pub fn new(config: MultiChannelWpeConfig) -> DereverbResult<Self> {
        config.validate()?;
        let prediction = config.wpe.prediction_order();
        let total_prediction = prediction * config.channels;
        let lower_edge = config.wpe.band_edge()?;
        let upper_edge = config.wpe.subbands - lower_edge;
        let load_factor = config.wpe.load_factor();
        let subbands = config.wpe.subbands;
        let channels = config.channels;
        let zero = Complex64::new(0.0, 0.0);
        Ok(Self {
            sources: Vec::new(),
            prediction,
            total_prediction,
            load_factor,
            lower_edge,
            upper_edge,
            filters: vec![vec![vec![zero; total_prediction]; subbands]; channels],
            theta: vec![Vec::new(); channels],
            history: Vec::new(),
            window: Vec::new(),
            normal_matrices: vec![vec![zero; total_prediction * total_prediction]; channels],
            normal_vectors: vec![vec![zero; total_prediction]; channels],
            lags: vec![zero; total_prediction],
            outputs: vec![vec![zero; subbands]; channels],
            frames_used: 0,
            frames_streamed: 0,
            estimated: false,
            ended: false,
            config,
        })
    }

    /// Frame width `K` in subbands.
    pub fn size(&self) -> usize {
        self.config.wpe.subbands
    }

    /// Number of channels filtered jointly.
    pub fn channels(&self) -> usize {
        self.config.channels
    }

    /// True once `estimate_filter` has run.
    pub fn is_estimated(&self) -> bool {
        self.estimated
    }

    /// Number of frames consumed by the last `estimate_filter` call.
    pub fn frames_used(&self) -> usize {
        self.frames_used
    }

    /// Joint prediction coefficients for one channel and subband.
    pub fn filter(&self, channel: usize, subband: usize) -> &[Complex64] {
        &self.filters[channel][subband]
    }

    /// Attach the next channel's source. Fails once all channels have one.
    pub fn set_input(&mut self, source: Box<dyn SubbandSource>) -> DereverbResult<()> {
        if self.sources.len() == self.config.channels {
            return Err(DereverbError::ChannelCapacityExceeded {
                channels: self.config.channels,
            });
        }
        if source.size() != self.config.wpe.subbands {
            return Err(DereverbError::SubbandCountMismatch {
                expected: self.config.wpe.subbands,
                got: source.size(),
            });
        }
        self.sources.push(source);
        Ok(())
    }

    /// Estimate the joint prediction filters from buffered frames.
    ///
    /// Frame collection follows the single-channel contract; a brace is
    /// recorded only when every source yields a frame, and collection stops
    /// at the first source that ends. Returns the number of frames used.
    pub fn estimate_filter(
        &mut self,
        start_frame: usize,
        end_frame: usize,
    ) -> DereverbResult<usize> {
        if self.sources.len() != self.config.channels {
            return Err(DereverbError::ChannelCountMismatch {
                expected: self.config.channels,
                got: self.sources.len(),
            });
        }
        self.fill_buffer(start_frame, end_frame);
        self.estimate_filters()?;
        for source in &mut self.sources {
            source.reset();
        }
        self.history.clear();
        for theta in &mut self.theta {
            *theta = Vec::new();
        }
        self.estimated = true;
        debug!(frames = self.frames_used, "joint prediction filters estimated");
        Ok(self.frames_used)
    }

    /// Pull one frame from every source and produce all channel outputs.
    ///
    /// `frame_no` must advance by exactly one per call. Once any source ends,
    /// every further call reports [`DereverbError::EndOfSamples`].
    pub fn calc_every_channel_output(&mut self, frame_no: usize) -> DereverbResult<()> {
        if !self.estimated {
            return Err(DereverbError::FilterNotEstimated);
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
        let mut brace: FrameBrace = Vec::with_capacity(self.config.channels);
        for source in &mut self.sources {
            match source.next() {
                Some(frame) => brace.push(frame),
                None => {
                    self.ended = true;
                    return Err(DereverbError::EndOfSamples);
                }
            }
        }

        if self.window.len() >= self.prediction {
            self.window.remove(0);
        }
        self.window.push(brace);

        let subbands = self.config.wpe.subbands;
        let half = subbands / 2;
        let delay = self.config.wpe.lower_lag;
        let channels = self.config.channels;
        let newest = self.window.len() - 1;
        for channel in 0..channels {
            for subband in 0..=half {
                let mut current = self.window[newest][channel][subband];
                if frame_no >= delay
                    && (subband <= self.lower_edge || subband >= self.upper_edge)
                {
                    fill_lags(
                        &self.window,
                        channels,
                        self.prediction,
                        subband,
                        newest as isize - delay as isize,
                        &mut self.lags,
                    );
                    current -= prediction_term(&self.filters[channel][subband], &self.lags);
                }
                self.outputs[channel][subband] = current;
                if subband > 0 && subband < half {
                    self.outputs[channel][subbands - subband] = current.conj();
                }
            }
        }
        self.frames_streamed = frame_no + 1;
        Ok(())
    }

    /// Dereverberated output of `channel` for the frame computed last.
    pub fn output(&self, channel: usize) -> DereverbResult<&[Complex64]> {
        if channel >= self.config.channels {
            return Err(DereverbError::InvalidChannel {
                channel,
                channels: self.config.channels,
            });
        }
        Ok(&self.outputs[channel])
    }

    /// Rewind every source and drop all buffered frames. Coefficients and
    /// the estimated state are kept.
    pub fn reset(&mut self) {
        for source in &mut self.sources {
            source.reset();
        }
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
        self.history.clear();
        for theta in &mut self.theta {
            *theta = Vec::new();
        }
    }

    /// Rewind everything and zero all prediction coefficients.
    pub fn next_speaker(&mut self) {
        self.reset();
        for channel in &mut self.filters {
            for filter in channel {
                filter.fill(Complex64::new(0.0, 0.0));
            }
        }
    }

    fn fill_buffer(&mut self, start_frame: usize, end_frame: usize) {
        let mut frame_index = 0usize;
        'collect: loop {
            if end_frame > 0 && frame_index >= end_frame {
                break;
            }
            let mut brace: FrameBrace = Vec::with_capacity(self.config.channels);
            for source in &mut self.sources {
                match source.next() {
                    Some(frame) => brace.push(frame),
                    // A source ended mid-brace; estimate from what we have.
                    None => break 'collect,
                }
            }
            if frame_index >= start_frame {
                self.history.push(brace);
            }
            frame_index += 1;
        }
        self.frames_used = self.history.len();
        let subbands = self.config.wpe.subbands;
        for theta in &mut self.theta {
            *theta = vec![0.0; self.frames_used * subbands];
        }
    }

    /// Recompute every channel's power weights from the currently
    /// dereverberated signal.
    fn update_theta(&mut self) {
        let subbands = self.config.wpe.subbands;
        let delay = self.config.wpe.lower_lag;
        let channels = self.config.channels;
        for sample in 0..self.frames_used {
            for channel in 0..channels {
                for subband in 0..subbands {
                    let mut residual = self.history[sample][channel][subband];
                    if sample >= delay {
                        fill_lags(
                            &self.history,
                            channels,
                            self.prediction,
                            subband,
                            (sample - delay) as isize,
                            &mut self.lags,
                        );
                        residual -=
                            prediction_term(&self.filters[channel][subband], &self.lags);
                    }
                    let magnitude = residual.norm().max(RESIDUAL_FLOOR);
                    self.theta[channel][sample * subbands + subband] =
                        magnitude * magnitude;
                }
            }
        }
    }

    /// Accumulate every channel's weighted covariance (lower triangle) and
    /// cross-correlation for one subband, then apply the absolute diagonal
    /// bias.
    fn accumulate_normal_equations(&mut self, subband: usize) {
        let subbands = self.config.wpe.subbands;
        let delay = self.config.wpe.lower_lag;
        let channels = self.config.channels;
        let total = self.total_prediction;
        let zero = Complex64::new(0.0, 0.0);

        for channel in 0..channels {
            self.normal_matrices[channel].fill(zero);
            self.normal_vectors[channel].fill(zero);

            let mut objective = 0.0;
            for sample in delay..self.frames_used {
                let theta = self.theta[channel][sample * subbands + subband];
                let weight = 1.0 / theta;
                fill_lags(
                    &self.history,
                    channels,
                    self.prediction,
                    subband,
                    (sample - delay) as isize,
                    &mut self.lags,
                );
                let current = self.history[sample][channel][subband];
                let residual =
                    current - prediction_term(&self.filters[channel][subband], &self.lags);
                objective += residual.norm_sqr() * weight + theta.ln();
                for row in 0..total {
                    let row_sample = self.lags[row];
                    for col in 0..=row {
                        self.normal_matrices[channel][row * total + col] +=
                            row_sample * self.lags[col].conj() * weight;
                    }
                    self.normal_vectors[channel][row] +=
                        current.conj() * self.lags[row] * weight;
                }
            }

            for i in 0..total {
                self.normal_matrices[channel][i * total + i] +=
                    Complex64::new(self.config.diagonal_bias, 0.0);
            }

            if self.config.wpe.debug_subband == Some(subband) {
                info!(channel, subband, objective, "weighted prediction objective");
            }
        }
    }

    fn estimate_filters(&mut self) -> DereverbResult<()> {
        let subbands = self.config.wpe.subbands;
        for iteration in 0..self.config.wpe.iterations {
            self.update_theta();
            for subband in 0..subbands {
                if subband > self.lower_edge && subband < self.upper_edge {
                    continue;
                }
                self.accumulate_normal_equations(subband);
                for channel in 0..self.config.channels {
                    let max_diagonal = load_diagonal(
                        &mut self.normal_matrices[channel],
                        self.total_prediction,
                        self.load_factor,
                    );
                    if max_diagonal == 0.0 {
                        continue;
                    }
                    cholesky::decompose(
                        &mut self.normal_matrices[channel],
                        self.total_prediction,
                    )
                    .map_err(|_| DereverbError::ChannelsTooSimilar { subband })?;
                    cholesky::solve(
                        &self.normal_matrices[channel],
                        &self.normal_vectors[channel],
                        &mut self.filters[channel][subband],
                        self.total_prediction,
                    );
                    if self.config.wpe.debug_subband == Some(subband) {
                        let gain = self.filters[channel][subband]
                            .iter()
                            .map(|g| g.norm_sqr())
                            .sum::<f64>()
                            .sqrt();
                        info!(
                            channel,
                            iteration,
                            subband,
                            wng_db = 20.0 * gain.log10(),
                            "white-noise gain"
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

/// Per-channel streaming view of a shared [`MultiChannelDereverberator`].
///
/// Exactly one façade per orchestrator must be constructed as the primary
/// (`channel == primary_channel`); its `next` drives the joint computation.
/// All façades must be advanced in lockstep.
pub struct DereverberatedChannel {
    source: Rc<RefCell<MultiChannelDereverberator>>,
    channel: usize,
    primary_channel: usize,
    output: Vec<Complex64>,
    frames_streamed: usize,
}

impl DereverberatedChannel {
    /// Create a façade for `channel`.
    pub fn new(
        source: Rc<RefCell<MultiChannelDereverberator>>,
        channel: usize,
        primary_channel: usize,
    ) -> DereverbResult<Self> {
        let (channels, subbands) = {
            let shared = source.borrow();
            (shared.config.channels, shared.config.wpe.subbands)
        };
        if channel >= channels {
            return Err(DereverbError::InvalidChannel { channel, channels });
        }
        if primary_channel >= channels {
            return Err(DereverbError::InvalidChannel {
                channel: primary_channel,
                channels,
            });
        }
        Ok(Self {
            source,
            channel,
            primary_channel,
            output: vec![Complex64::new(0.0, 0.0); subbands],
            frames_streamed: 0,
        })
    }

    /// Frame width `K` in subbands.
    pub fn size(&self) -> usize {
        self.output.len()
    }

    /// Channel this façade reads.
    pub fn channel(&self) -> usize {
        self.channel
    }

    /// Emit the dereverberated frame `frame_no` for this channel.
    pub fn next(&mut self, frame_no: usize) -> DereverbResult<&[Complex64]> {
        if self.channel == self.primary_channel {
            self.source.borrow_mut().calc_every_channel_output(frame_no)?;
        }
        if frame_no != self.frames_streamed {
            return Err(DereverbError::FrameIndexMismatch {
                expected: self.frames_streamed,
                got: frame_no,
            });
        }
        {
            let shared = self.source.borrow();
            let row = shared.output(self.channel)?;
            self.output.copy_from_slice(row);
        }
        self.frames_streamed += 1;
        Ok(&self.output)
    }

    /// Rewind the shared orchestrator and this façade's frame counter.
    pub fn reset(&mut self) {
        self.source.borrow_mut().reset();
        self.frames_streamed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WpeConfig;
    use crate::stream::VectorComplexSource;

    fn random_complex(seed: &mut u64) -> Complex64 {
        *seed ^= *seed << 13;
        *seed ^= *seed >> 7;
        *seed ^= *seed << 17;
        let re = (*seed as f64 / u64::MAX as f64) * 2.0 - 1.0;
        *seed ^= *seed << 13;
        *seed ^= *seed >> 7;
        *seed ^= *seed << 17;
        let im = (*seed as f64 / u64::MAX as f64) * 2.0 - 1.0;
        Complex64::new(re, im)
    }

    fn noise_frames(seed: &mut u64, subbands: usize, count: usize) -> Vec<SubbandFrame> {
        (0..count)
            .map(|_| (0..subbands).map(|_| random_complex(seed)).collect())
            .collect()
    }

    fn config(subbands: usize, channels: usize) -> MultiChannelWpeConfig {
        MultiChannelWpeConfig {
            wpe: WpeConfig {
                subbands,
                lower_lag: 2,
                upper_lag: 3,
                iterations: 1,
                load_db: -40.0,
                band_width: 0.0,
                sample_rate: 16000.0,
                debug_subband: None,
            },
            channels,
            diagonal_bias: 1e-6,
        }
    }

    fn source(frames: Vec<SubbandFrame>) -> Box<dyn SubbandSource> {
        Box::new(VectorComplexSource::new(frames).unwrap())
    }

    fn orchestrator_with_identical_channels(
        subbands: usize,
        channels: usize,
        count: usize,
        seed: u64,
    ) -> MultiChannelDereverberator {
        let mut seed = seed;
        let frames = noise_frames(&mut seed, subbands, count);
        let mut wpe = MultiChannelDereverberator::new(config(subbands, channels)).unwrap();
        for _ in 0..channels {
            wpe.set_input(source(frames.clone())).unwrap();
        }
        wpe
    }

    #[test]
    fn test_set_input_rejects_excess_sources() {
        let mut seed = 3u64;
        let frames = noise_frames(&mut seed, 8, 4);
        let mut wpe = MultiChannelDereverberator::new(config(8, 2)).unwrap();
        wpe.set_input(source(frames.clone())).unwrap();
        wpe.set_input(source(frames.clone())).unwrap();
        assert_eq!(
            wpe.set_input(source(frames)).map(|_| ()),
            Err(DereverbError::ChannelCapacityExceeded { channels: 2 })
        );
    }

    #[test]
    fn test_set_input_rejects_size_mismatch() {
        let mut seed = 5u64;
        let frames = noise_frames(&mut seed, 6, 4);
        let mut wpe = MultiChannelDereverberator::new(config(8, 2)).unwrap();
        assert_eq!(
            wpe.set_input(source(frames)).map(|_| ()),
            Err(DereverbError::SubbandCountMismatch { expected: 8, got: 6 })
        );
    }

    #[test]
    fn test_estimate_requires_all_sources() {
        let mut seed = 7u64;
        let frames = noise_frames(&mut seed, 8, 4);
        let mut wpe = MultiChannelDereverberator::new(config(8, 2)).unwrap();
        wpe.set_input(source(frames)).unwrap();
        assert_eq!(
            wpe.estimate_filter(0, 0),
            Err(DereverbError::ChannelCountMismatch { expected: 2, got: 1 })
        );
    }

    #[test]
    fn test_identical_channels_estimate_and_match() {
        // Two identical streams make the unbiased joint covariance rank
        // deficient; the diagonal bias must keep the solve alive and both
        // channels must produce the same output.
        let mut wpe = orchestrator_with_identical_channels(8, 2, 40, 11);
        assert_eq!(wpe.estimate_filter(0, 0).unwrap(), 40);

        for n in 0..10 {
            wpe.calc_every_channel_output(n).unwrap();
            let out0 = wpe.output(0).unwrap().to_vec();
            let out1 = wpe.output(1).unwrap();
            assert_eq!(out0, out1, "channel outputs diverged at frame {}", n);
        }
    }

    #[test]
    fn test_hermitian_mirror_on_every_channel() {
        let subbands = 8;
        let mut wpe = orchestrator_with_identical_channels(subbands, 2, 30, 13);
        wpe.estimate_filter(0, 0).unwrap();
        for n in 0..8 {
            wpe.calc_every_channel_output(n).unwrap();
            for channel in 0..2 {
                let out = wpe.output(channel).unwrap();
                for k in 1..subbands / 2 {
                    assert_eq!(out[subbands - k], out[k].conj());
                }
            }
        }
    }

    #[test]
    fn test_output_rejects_bad_channel() {
        let wpe = MultiChannelDereverberator::new(config(8, 2)).unwrap();
        assert_eq!(
            wpe.output(2).map(|_| ()),
            Err(DereverbError::InvalidChannel { channel: 2, channels: 2 })
        );
    }

    #[test]
    fn test_index_jump_fails_on_orchestrator() {
        let mut wpe = orchestrator_with_identical_channels(8, 2, 10, 17);
        wpe.estimate_filter(0, 0).unwrap();
        wpe.calc_every_channel_output(0).unwrap();
        assert_eq!(
            wpe.calc_every_channel_output(2),
            Err(DereverbError::FrameIndexMismatch { expected: 1, got: 2 })
        );
        assert!(wpe.calc_every_channel_output(1).is_ok());
    }

    #[test]
    fn test_end_of_stream_latches() {
        let mut wpe = orchestrator_with_identical_channels(8, 2, 3, 19);
        wpe.estimate_filter(0, 0).unwrap();
        for n in 0..3 {
            wpe.calc_every_channel_output(n).unwrap();
        }
        assert_eq!(
            wpe.calc_every_channel_output(3),
            Err(DereverbError::EndOfSamples)
        );
        assert_eq!(
            wpe.calc_every_channel_output(3),
            Err(DereverbError::EndOfSamples)
        );
    }

    #[test]
    fn test_fill_buffer_stops_at_shortest_source() {
        let mut seed = 23u64;
        let long = noise_frames(&mut seed, 8, 5);
        let short = noise_frames(&mut seed, 8, 3);
        let mut wpe = MultiChannelDereverberator::new(config(8, 2)).unwrap();
        wpe.set_input(source(long)).unwrap();
        wpe.set_input(source(short)).unwrap();
        assert_eq!(wpe.estimate_filter(0, 0).unwrap(), 3);
    }

    #[test]
    fn test_next_speaker_zeroes_filters() {
        let mut wpe = orchestrator_with_identical_channels(8, 2, 40, 29);
        wpe.estimate_filter(0, 0).unwrap();
        let had_energy = wpe
            .filters
            .iter()
            .any(|ch| ch.iter().any(|f| f.iter().any(|g| g.norm() > 0.0)));
        assert!(had_energy);

        wpe.next_speaker();
        for channel in &wpe.filters {
            for filter in channel {
                for g in filter {
                    assert_eq!(*g, Complex64::new(0.0, 0.0));
                }
            }
        }
    }

    #[test]
    fn test_facade_rejects_bad_channel() {
        let wpe = Rc::new(RefCell::new(
            MultiChannelDereverberator::new(config(8, 2)).unwrap(),
        ));
        assert!(matches!(
            DereverberatedChannel::new(Rc::clone(&wpe), 5, 0),
            Err(DereverbError::InvalidChannel { channel: 5, channels: 2 })
        ));
    }

    #[test]
    fn test_facade_primary_gate_and_lockstep() {
        let subbands = 8;
        let mut seed = 31u64;
        let frames = noise_frames(&mut seed, subbands, 20);
        let wpe = Rc::new(RefCell::new(
            MultiChannelDereverberator::new(config(subbands, 2)).unwrap(),
        ));
        for _ in 0..2 {
            wpe.borrow_mut().set_input(source(frames.clone())).unwrap();
        }
        wpe.borrow_mut().estimate_filter(0, 0).unwrap();

        let mut ch0 = DereverberatedChannel::new(Rc::clone(&wpe), 0, 0).unwrap();
        let mut ch1 = DereverberatedChannel::new(Rc::clone(&wpe), 1, 0).unwrap();

        for n in 0..5 {
            let out0 = ch0.next(n).unwrap().to_vec();
            let out1 = ch1.next(n).unwrap().to_vec();
            // One pull per frame: the orchestrator advanced exactly once.
            assert_eq!(wpe.borrow().frames_streamed, n + 1);
            let direct0 = wpe.borrow().output(0).unwrap().to_vec();
            let direct1 = wpe.borrow().output(1).unwrap().to_vec();
            assert_eq!(out0, direct0);
            assert_eq!(out1, direct1);
        }
    }

    #[test]
    fn test_facade_index_jump_fails() {
        let subbands = 8;
        let mut seed = 37u64;
        let frames = noise_frames(&mut seed, subbands, 10);
        let wpe = Rc::new(RefCell::new(
            MultiChannelDereverberator::new(config(subbands, 2)).unwrap(),
        ));
        for _ in 0..2 {
            wpe.borrow_mut().set_input(source(frames.clone())).unwrap();
        }
        wpe.borrow_mut().estimate_filter(0, 0).unwrap();

        let mut ch0 = DereverberatedChannel::new(Rc::clone(&wpe), 0, 0).unwrap();
        ch0.next(0).unwrap();
        assert_eq!(
            ch0.next(2).map(|_| ()),
            Err(DereverbError::FrameIndexMismatch { expected: 1, got: 2 })
        );
    }

    #[test]
    fn test_debug_subband_logging_smoke() {
        let mut seed = 41u64;
        let frames = noise_frames(&mut seed, 8, 30);
        let mut cfg = config(8, 2);
        cfg.wpe.iterations = 2;
        cfg.wpe.debug_subband = Some(3);
        let mut wpe = MultiChannelDereverberator::new(cfg).unwrap();
        for _ in 0..2 {
            wpe.set_input(source(frames.clone())).unwrap();
        }
        assert!(wpe.estimate_filter(0, 0).is_ok());
    }
}
