//! Weighted prediction error (WPE) dereverberation.
//!
//! [`WpeFilter`] estimates a multiple-input multiple-output linear prediction
//! filter from the input signal and the expected power of the desired signal,
//! then subtracts the predicted (late reverberant) component. Estimation of
//! statistics and processing is performed in batch mode on fixed-length
//! buffers. [`MaskBasedWpe`] wraps the filter in the conventional iterative
//! scheme with magnitude reweighting and an optional time-frequency mask for
//! the power estimate.
//!
//! References:
//! - Yoshioka and Nakatani, Generalization of Multi-Channel Linear Prediction
//!   Methods for Blind MIMO Impulse Response Shortening, 2012
//! - Jukić et al., Group sparsity for MIMO speech dereverberation, 2015
//! - Kinoshita et al., Neural network-based spectrum estimation for online
//!   WPE dereverberation, 2017

use nalgebra::DMatrix;
use ndarray::{Array3, Array4, Array5, Axis, s};
use num_complex::Complex64;
use tracing::debug;

use crate::error::{FrontendError, FrontendResult};
use crate::linalg;
use crate::math::{db_to_mag, mask_invalid_frames3, mask_invalid_frames4, threshold_mask};

/// Configuration for [`WpeFilter`].
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct WpeFilterConfig {
    /// Length of the prediction filter in frames, per channel.
    pub filter_length: usize,
    /// Prediction delay in frames.
    pub prediction_delay: usize,
    /// Diagonal regularization for the correlation matrix Q, applied as
    /// `diag_reg * trace(Q) + eps`. `None` disables the trace term.
    pub diag_reg: Option<f64>,
    /// Small positive constant for regularization.
    pub eps: f64,
}

impl WpeFilterConfig {
    /// Creates a configuration with the default regularization.
    pub fn new(filter_length: usize, prediction_delay: usize) -> Self {
        Self {
            filter_length,
            prediction_delay,
            diag_reg: Some(1e-6),
            eps: 1e-8,
        }
    }
}

/// A weighted prediction error filter.
///
/// Given an input signal and the expected power of the desired signal, this
/// estimates a MIMO prediction filter per subband and returns the filtered
/// signal.
#[derive(Debug, Clone)]
pub struct WpeFilter {
    filter_length: usize,
    prediction_delay: usize,
    diag_reg: Option<f64>,
    eps: f64,
}

impl WpeFilter {
    /// Builds a filter from a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FrontendError::Configuration`] for a zero filter length or a
    /// non-positive `eps`.
    pub fn new(config: WpeFilterConfig) -> FrontendResult<Self> {
        if config.filter_length == 0 {
            return Err(FrontendError::Configuration(
                "Filter length must be positive".to_string(),
            ));
        }
        if config.eps <= 0.0 {
            return Err(FrontendError::Configuration(format!(
                "eps must be positive, got {}",
                config.eps
            )));
        }

        debug!(
            filter_length = config.filter_length,
            prediction_delay = config.prediction_delay,
            diag_reg = config.diag_reg,
            eps = config.eps,
            "initialized WPE filter"
        );

        Ok(Self {
            filter_length: config.filter_length,
            prediction_delay: config.prediction_delay,
            diag_reg: config.diag_reg,
            eps: config.eps,
        })
    }

    /// Estimates the prediction filter from the input and the predicted power
    /// of the desired signal, and returns the dereverberated signal.
    ///
    /// `input` and `power` have shape (B, C, F, T); frames at or beyond the
    /// optional per-batch `lengths` are excluded from the statistics and
    /// zeroed in the output. The output has the same shape as the input.
    ///
    /// # Errors
    ///
    /// - [`FrontendError::Shape`] if `power` does not match the input shape or
    ///   the lengths do not match the batch size.
    /// - [`FrontendError::Numerical`] if the regularized correlation matrix
    ///   cannot be factorized.
    pub fn apply(
        &self,
        input: &Array4<Complex64>,
        power: &Array4<f64>,
        lengths: Option<&[usize]>,
    ) -> FrontendResult<Array4<Complex64>> {
        if power.dim() != input.dim() {
            return Err(FrontendError::Shape(format!(
                "Power shape {:?} does not match input shape {:?}",
                power.shape(),
                input.shape()
            )));
        }

        // Temporal weighting: inverse of the channel-averaged power
        let mut weight = power
            .mean_axis(Axis(1))
            .ok_or_else(|| FrontendError::Shape("Empty channel axis".to_string()))?;
        weight.mapv_inplace(|p| 1.0 / (p + self.eps));

        // Exclude padded frames from the statistics
        let weight = match lengths {
            Some(lengths) => mask_invalid_frames3(&weight, lengths)?,
            None => weight,
        };

        let tilde_input =
            Self::conv_tensor(input, self.filter_length, self.prediction_delay, None)?;

        let (q, r) = self.estimate_correlations(input, &weight, &tilde_input);
        let filter = self.estimate_filter(&q, &r)?;
        let undesired = self.apply_filter(&filter, None, Some(&tilde_input))?;

        let desired = input - &undesired;
        match lengths {
            Some(lengths) => mask_invalid_frames4(&desired, lengths),
            None => Ok(desired),
        }
    }

    /// Builds the multichannel convolution tensor for each example in the
    /// batch: a sliding window of `filter_length` consecutive samples of the
    /// input, delayed by `delay` frames and left-zero-padded, ending at each
    /// time step.
    ///
    /// The input has shape (B, C, F, T) and the output (B, C, F, n_steps, L),
    /// where `n_steps` defaults to the number of input frames.
    ///
    /// # Errors
    ///
    /// Returns [`FrontendError::Configuration`] for a zero filter length.
    pub fn conv_tensor(
        x: &Array4<Complex64>,
        filter_length: usize,
        delay: usize,
        n_steps: Option<usize>,
    ) -> FrontendResult<Array5<Complex64>> {
        if filter_length == 0 {
            return Err(FrontendError::Configuration(
                "Filter length must be positive".to_string(),
            ));
        }
        let (batch_size, num_channels, num_subbands, num_frames) = x.dim();
        let n_steps = n_steps.unwrap_or(num_frames);
        let pad = filter_length - 1 + delay;

        let mut tilde = Array5::zeros((batch_size, num_channels, num_subbands, n_steps, filter_length));
        for b in 0..batch_size {
            for c in 0..num_channels {
                for f in 0..num_subbands {
                    for t in 0..n_steps {
                        for l in 0..filter_length {
                            // tap l refers to input frame t + l - pad
                            if t + l >= pad {
                                let idx = t + l - pad;
                                if idx < num_frames {
                                    tilde[[b, c, f, t, l]] = x[[b, c, f, idx]];
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(tilde)
    }

    /// Estimates the weighted correlation statistics of the convolution
    /// tensor.
    ///
    /// For each (b, f) the outputs are `Q = tilde{X}^H diag(w) tilde{X}` with
    /// shape (C·L, C·L) and `R = tilde{X}^H diag(w) X` with shape (C·L, C),
    /// stacked into tensors of shape (B, F, C·L, C·L) and (B, F, C·L, C).
    /// Row index (c, l) is flattened as `c * L + l`.
    fn estimate_correlations(
        &self,
        input: &Array4<Complex64>,
        weight: &Array3<f64>,
        tilde_input: &Array5<Complex64>,
    ) -> (Array4<Complex64>, Array4<Complex64>) {
        let (batch_size, num_channels, num_subbands, num_frames, filter_length) = tilde_input.dim();
        let stacked = num_channels * filter_length;

        let mut q = Array4::zeros((batch_size, num_subbands, stacked, stacked));
        let mut r = Array4::zeros((batch_size, num_subbands, stacked, num_channels));

        for b in 0..batch_size {
            for f in 0..num_subbands {
                for t in 0..num_frames {
                    let w = weight[[b, f, t]];
                    if w == 0.0 {
                        continue;
                    }
                    for j in 0..num_channels {
                        for k in 0..filter_length {
                            let row = j * filter_length + k;
                            let a = tilde_input[[b, j, f, t, k]].conj() * w;
                            for m in 0..num_channels {
                                for n in 0..filter_length {
                                    q[[b, f, row, m * filter_length + n]] +=
                                        a * tilde_input[[b, m, f, t, n]];
                                }
                                r[[b, f, row, m]] += a * input[[b, m, f, t]];
                            }
                        }
                    }
                }
            }
        }

        (q, r)
    }

    /// Estimates the MIMO prediction filter by solving `Q(b,f) G = R(b,f)`
    /// per subband via Cholesky factorization and triangular substitution,
    /// after diagonal regularization of Q.
    ///
    /// Returns the filter with shape (B, C_out, F, C_in, L).
    fn estimate_filter(
        &self,
        q: &Array4<Complex64>,
        r: &Array4<Complex64>,
    ) -> FrontendResult<Array5<Complex64>> {
        let (batch_size, num_subbands, stacked, num_channels) = r.dim();
        let filter_length = stacked / num_channels;
        assert_eq!(
            filter_length, self.filter_length,
            "correlation statistics do not match the configured filter length"
        );

        let mut pairs = Vec::with_capacity(batch_size * num_subbands);
        for b in 0..batch_size {
            for f in 0..num_subbands {
                pairs.push((b, f));
            }
        }

        let diag_reg = self.diag_reg;
        let eps = self.eps;
        let solutions = linalg::batch_map(pairs.clone(), |(b, f)| {
            let mut q_bf = linalg::to_dmatrix(q.slice(s![b, f, .., ..]));
            let r_bf = linalg::to_dmatrix(r.slice(s![b, f, .., ..]));

            // Regularization: diag_reg * trace(Q) + eps on the diagonal
            let reg = match diag_reg {
                Some(diag_reg) => diag_reg * q_bf.trace().re + eps,
                None => eps,
            };
            for d in 0..stacked {
                q_bf[(d, d)] += Complex64::new(reg, 0.0);
            }

            linalg::solve_hermitian(q_bf, &r_bf)
        })?;

        let mut filter = Array5::zeros((
            batch_size,
            num_channels,
            num_subbands,
            num_channels,
            filter_length,
        ));
        for (&(b, f), g_bf) in pairs.iter().zip(solutions) {
            for c_out in 0..num_channels {
                for c_in in 0..num_channels {
                    for l in 0..filter_length {
                        filter[[b, c_out, f, c_in, l]] = g_bf[(c_in * filter_length + l, c_out)];
                    }
                }
            }
        }

        Ok(filter)
    }

    /// Applies a prediction filter on the input signal, producing the
    /// predicted (undesired) component.
    ///
    /// Exactly one of `input` and `tilde_input` must be provided; the
    /// convolution tensor is built from `input` when it is not supplied.
    ///
    /// # Errors
    ///
    /// Returns [`FrontendError::InvalidInput`] if both or neither of the two
    /// inputs are provided.
    pub fn apply_filter(
        &self,
        filter: &Array5<Complex64>,
        input: Option<&Array4<Complex64>>,
        tilde_input: Option<&Array5<Complex64>>,
    ) -> FrontendResult<Array4<Complex64>> {
        let owned;
        let tilde = match (input, tilde_input) {
            (Some(_), Some(_)) => {
                return Err(FrontendError::InvalidInput(
                    "Both input and tilde_input cannot be provided simultaneously".to_string(),
                ));
            }
            (None, None) => {
                return Err(FrontendError::InvalidInput(
                    "Both input and tilde_input cannot be None simultaneously".to_string(),
                ));
            }
            (Some(input), None) => {
                owned = Self::conv_tensor(input, self.filter_length, self.prediction_delay, None)?;
                &owned
            }
            (None, Some(tilde_input)) => tilde_input,
        };

        let (batch_size, num_channels, num_subbands, num_frames, filter_length) = tilde.dim();
        let mut output = Array4::zeros((batch_size, num_channels, num_subbands, num_frames));
        for b in 0..batch_size {
            for m in 0..num_channels {
                for f in 0..num_subbands {
                    for t in 0..num_frames {
                        let mut acc = Complex64::new(0.0, 0.0);
                        for j in 0..num_channels {
                            for k in 0..filter_length {
                                acc += tilde[[b, j, f, t, k]] * filter[[b, m, f, j, k]];
                            }
                        }
                        output[[b, m, f, t]] = acc;
                    }
                }
            }
        }

        Ok(output)
    }
}

/// Configuration for [`MaskBasedWpe`].
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct MaskBasedWpeConfig {
    /// Length of the convolutional filter for each channel in frames.
    pub filter_length: usize,
    /// Delay of the input signal for multichannel linear prediction in
    /// frames.
    pub prediction_delay: usize,
    /// Number of reweighting iterations.
    pub num_iterations: usize,
    /// Lower mask threshold in dB, applied before using the mask.
    pub mask_min_db: f64,
    /// Upper mask threshold in dB, applied before using the mask.
    pub mask_max_db: f64,
    /// Diagonal regularization for the filter estimation.
    pub diag_reg: Option<f64>,
    /// Small positive constant for regularization.
    pub eps: f64,
}

impl MaskBasedWpeConfig {
    /// Creates a configuration with the default thresholds and a single
    /// reweighting iteration.
    pub fn new(filter_length: usize, prediction_delay: usize) -> Self {
        Self {
            filter_length,
            prediction_delay,
            num_iterations: 1,
            mask_min_db: -200.0,
            mask_max_db: 0.0,
            diag_reg: Some(1e-6),
            eps: 1e-8,
        }
    }
}

/// Multichannel linear-prediction dereverberation with weighted prediction
/// error filter estimation.
///
/// An optional time-frequency mask refines the desired-signal power estimate
/// on the first iteration; without a mask this is the conventional iterative
/// WPE algorithm.
#[derive(Debug, Clone)]
pub struct MaskBasedWpe {
    filter: WpeFilter,
    num_iterations: usize,
    mask_min: f64,
    mask_max: f64,
}

impl MaskBasedWpe {
    /// Builds the dereverberation component from a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FrontendError::Configuration`] for an invalid filter
    /// configuration, a zero iteration count, or a decreasing mask threshold
    /// pair.
    pub fn new(config: MaskBasedWpeConfig) -> FrontendResult<Self> {
        if config.num_iterations == 0 {
            return Err(FrontendError::Configuration(
                "Number of iterations must be positive".to_string(),
            ));
        }
        if config.mask_min_db > config.mask_max_db {
            return Err(FrontendError::Configuration(format!(
                "Mask thresholds must be non-decreasing, got ({}, {}) dB",
                config.mask_min_db, config.mask_max_db
            )));
        }

        let filter = WpeFilter::new(WpeFilterConfig {
            filter_length: config.filter_length,
            prediction_delay: config.prediction_delay,
            diag_reg: config.diag_reg,
            eps: config.eps,
        })?;

        let mask_min = db_to_mag(config.mask_min_db);
        let mask_max = db_to_mag(config.mask_max_db);

        debug!(
            num_iterations = config.num_iterations,
            mask_min,
            mask_max,
            "initialized mask-based WPE dereverberation"
        );

        Ok(Self {
            filter,
            num_iterations: config.num_iterations,
            mask_min,
            mask_max,
        })
    }

    /// Applies the WPE dereverberation algorithm to the input spectrogram.
    ///
    /// `input` has shape (B, C, F, T); the optional `mask` has shape
    /// (B, 1, F, T) or (B, C, F, T) and scales the magnitude estimate on the
    /// first iteration after thresholding. The output has the same shape and
    /// channel count as the input.
    ///
    /// # Errors
    ///
    /// Returns [`FrontendError::Shape`] for a mask that matches neither
    /// accepted shape, and propagates errors from the filter estimation.
    pub fn dereverb(
        &self,
        input: &Array4<Complex64>,
        lengths: Option<&[usize]>,
        mask: Option<&Array4<f64>>,
    ) -> FrontendResult<Array4<Complex64>> {
        let (batch_size, num_channels, num_subbands, num_frames) = input.dim();
        if let Some(mask) = mask {
            let (mb, mc, mf, mt) = mask.dim();
            if mb != batch_size || mf != num_subbands || mt != num_frames || (mc != 1 && mc != num_channels) {
                return Err(FrontendError::Shape(format!(
                    "Expected mask of shape ({batch_size}, 1 or {num_channels}, {num_subbands}, \
                     {num_frames}), got {:?}",
                    mask.shape()
                )));
            }
        }

        let mut output = input.clone();
        for i in 0..self.num_iterations {
            let mut magnitude = output.mapv(|v| v.norm());
            if i == 0 {
                if let Some(mask) = mask {
                    let mask = threshold_mask(mask, self.mask_min, self.mask_max);
                    let mask_channels = mask.dim().1;
                    for b in 0..batch_size {
                        for c in 0..num_channels {
                            let mc = if mask_channels == 1 { 0 } else { c };
                            for f in 0..num_subbands {
                                for t in 0..num_frames {
                                    magnitude[[b, c, f, t]] *= mask[[b, mc, f, t]];
                                }
                            }
                        }
                    }
                }
            }
            let power = magnitude.mapv(|v| v * v);
            output = self.filter.apply(&output, &power, lengths)?;
        }

        Ok(output)
    }
}
