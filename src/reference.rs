//! Single-channel masking of a reference channel.
//!
//! The simplest mask-based enhancement: pick one input channel and scale its
//! time-frequency bins with the estimated masks. No spatial statistics are
//! involved, so this doubles as a cheap baseline for the beamforming path.

use ndarray::{Array4, Axis};
use num_complex::Complex64;
use tracing::debug;

use crate::error::{FrontendError, FrontendResult};
use crate::math::db_to_mag;

/// Configuration for [`MaskReferenceChannel`].
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct MaskReferenceChannelConfig {
    /// Input channel the masks are applied to.
    pub ref_channel: usize,
    /// Lower mask threshold in dB.
    pub mask_min_db: f64,
    /// Upper mask threshold in dB.
    pub mask_max_db: f64,
}

impl Default for MaskReferenceChannelConfig {
    fn default() -> Self {
        Self {
            ref_channel: 0,
            mask_min_db: -200.0,
            mask_max_db: 0.0,
        }
    }
}

/// Applies estimated masks onto the reference channel of a multichannel
/// spectrogram, producing one output channel per mask.
#[derive(Debug, Clone)]
pub struct MaskReferenceChannel {
    ref_channel: usize,
    mask_min: f64,
    mask_max: f64,
}

impl MaskReferenceChannel {
    /// Builds a reference-channel masker from a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FrontendError::Configuration`] for a decreasing threshold
    /// pair.
    pub fn new(config: MaskReferenceChannelConfig) -> FrontendResult<Self> {
        if config.mask_min_db > config.mask_max_db {
            return Err(FrontendError::Configuration(format!(
                "Mask thresholds must be non-decreasing, got ({}, {}) dB",
                config.mask_min_db, config.mask_max_db
            )));
        }

        let mask_min = db_to_mag(config.mask_min_db);
        let mask_max = db_to_mag(config.mask_max_db);
        debug!(
            ref_channel = config.ref_channel,
            mask_min, mask_max, "initialized reference-channel masking"
        );

        Ok(Self {
            ref_channel: config.ref_channel,
            mask_min,
            mask_max,
        })
    }

    /// Multiplies the clamped masks onto the reference channel.
    ///
    /// `input` has shape (B, C, F, T) and `mask` holds M masks with shape
    /// (B, M, F, T). The output has shape (B, M, F, T): output `m` is the
    /// reference channel scaled by mask `m`. Valid lengths are accepted for
    /// interface symmetry with the other components; masking is pointwise, so
    /// padded frames pass through unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`FrontendError::Shape`] for an out-of-range reference
    /// channel, mismatched mask dimensions, or a length slice that does not
    /// match the batch size.
    pub fn apply(
        &self,
        input: &Array4<Complex64>,
        lengths: Option<&[usize]>,
        mask: &Array4<f64>,
    ) -> FrontendResult<Array4<Complex64>> {
        let (batch_size, num_channels, num_subbands, num_frames) = input.dim();
        if self.ref_channel >= num_channels {
            return Err(FrontendError::Shape(format!(
                "Reference channel {} is out of range for {} channels",
                self.ref_channel, num_channels
            )));
        }
        let (mb, num_masks, mf, mt) = mask.dim();
        if mb != batch_size || mf != num_subbands || mt != num_frames {
            return Err(FrontendError::Shape(format!(
                "Expected mask of shape ({batch_size}, num_masks, {num_subbands}, {num_frames}), \
                 got {:?}",
                mask.shape()
            )));
        }
        if let Some(lengths) = lengths {
            if lengths.len() != batch_size {
                return Err(FrontendError::Shape(format!(
                    "Expected {} length entries to match the batch size, got {}",
                    batch_size,
                    lengths.len()
                )));
            }
        }

        let reference = input.index_axis(Axis(1), self.ref_channel);
        let mut output = Array4::zeros((batch_size, num_masks, num_subbands, num_frames));
        for b in 0..batch_size {
            for m in 0..num_masks {
                for f in 0..num_subbands {
                    for t in 0..num_frames {
                        let gain = mask[[b, m, f, t]].clamp(self.mask_min, self.mask_max);
                        output[[b, m, f, t]] = reference[[b, f, t]] * gain;
                    }
                }
            }
        }
        Ok(output)
    }
}
