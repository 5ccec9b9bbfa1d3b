//! Conversion of complex multichannel spectrograms into magnitude and
//! inter-channel phase difference (IPD) features.
//!
//! The extractor reduces the channel axis of the magnitude spectrum according
//! to a configured [`MagReduction`] mode and optionally appends the IPD of
//! each channel relative to the channel mean, wrapped to (−π, π]. The output
//! channel count is fixed by the configuration and verified against the
//! computed features on every call.

use ndarray::{Array4, Axis, concatenate};
use num_complex::Complex64;
use tracing::debug;

use crate::error::{FrontendError, FrontendResult};
use crate::math::wrap_to_pi;
use crate::types::MagReduction;

/// Configuration for [`SpectrogramFeatures`].
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct FeatureExtractorConfig {
    /// Expected number of subbands in the input spectrogram.
    pub num_subbands: usize,
    /// Optional number of input channels, used to fix the number of output
    /// channels. When set, the computed channel count is verified per call.
    pub num_input_channels: Option<usize>,
    /// Reduction across channels for the magnitude features.
    pub mag_reduction: MagReduction,
    /// Append inter-channel phase difference features.
    pub use_ipd: bool,
    /// Normalization for magnitude features. Only `None` is supported; any
    /// named strategy is rejected at construction.
    pub mag_normalization: Option<String>,
    /// Normalization for IPD features. Only `None` is supported; any named
    /// strategy is rejected at construction.
    pub ipd_normalization: Option<String>,
}

impl FeatureExtractorConfig {
    /// Creates a configuration with the default reduction (`rms`), no IPD and
    /// no normalization.
    pub fn new(num_subbands: usize) -> Self {
        Self {
            num_subbands,
            num_input_channels: None,
            mag_reduction: MagReduction::default(),
            use_ipd: false,
            mag_normalization: None,
            ipd_normalization: None,
        }
    }
}

/// Converts a complex multichannel spectrogram into multichannel features.
///
/// Stateless after construction; the configuration fixes the number of
/// output features and channels.
#[derive(Debug, Clone)]
pub struct SpectrogramFeatures {
    num_subbands: usize,
    mag_reduction: MagReduction,
    use_ipd: bool,
    num_features: usize,
    num_channels: Option<usize>,
}

impl SpectrogramFeatures {
    /// Builds a feature extractor from a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FrontendError::Configuration`] if the number of subbands is
    /// zero or a normalization strategy is requested (none is implemented).
    pub fn new(config: FeatureExtractorConfig) -> FrontendResult<Self> {
        if config.num_subbands == 0 {
            return Err(FrontendError::Configuration(
                "Number of subbands must be positive".to_string(),
            ));
        }
        if let Some(name) = &config.mag_normalization {
            return Err(FrontendError::Configuration(format!(
                "Magnitude normalization '{name}' is not implemented"
            )));
        }
        if let Some(name) = &config.ipd_normalization {
            return Err(FrontendError::Configuration(format!(
                "IPD normalization '{name}' is not implemented"
            )));
        }

        let (num_features, num_channels) = if config.use_ipd {
            (2 * config.num_subbands, config.num_input_channels)
        } else if config.mag_reduction == MagReduction::None {
            (config.num_subbands, config.num_input_channels)
        } else {
            (config.num_subbands, Some(1))
        };

        debug!(
            num_subbands = config.num_subbands,
            mag_reduction = %config.mag_reduction,
            use_ipd = config.use_ipd,
            num_features,
            "initialized spectrogram feature extractor"
        );

        Ok(Self {
            num_subbands: config.num_subbands,
            mag_reduction: config.mag_reduction,
            use_ipd: config.use_ipd,
            num_features,
            num_channels,
        })
    }

    /// Configured number of features per channel.
    pub fn num_features(&self) -> usize {
        self.num_features
    }

    /// Configured number of output channels.
    ///
    /// # Errors
    ///
    /// Returns [`FrontendError::Configuration`] if the channel count is not
    /// fixed by the configuration, i.e. `num_input_channels` was not provided.
    pub fn num_channels(&self) -> FrontendResult<usize> {
        self.num_channels.ok_or_else(|| {
            FrontendError::Configuration(
                "Number of channels is not configured. Provide num_input_channels \
                 when constructing the extractor."
                    .to_string(),
            )
        })
    }

    /// Converts a batch of C-channel spectrograms into time-frequency
    /// features.
    ///
    /// The input has shape (B, C, F, T) with `lengths` holding the number of
    /// valid frames per batch item; lengths are passed through unchanged. The
    /// output is real-valued with shape (B, C', F'', T), where C' and F'' are
    /// fixed by the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FrontendError::Shape`] if the subband count does not match
    /// the configuration, the input has no channels, the lengths do not match
    /// the batch size, or the computed channel count differs from the
    /// configured one.
    pub fn compute(
        &self,
        input: &Array4<Complex64>,
        lengths: &[usize],
    ) -> FrontendResult<Array4<f64>> {
        let (batch_size, num_channels, num_subbands, _) = input.dim();
        if num_channels == 0 {
            return Err(FrontendError::Shape(
                "Expected at least one input channel".to_string(),
            ));
        }
        if num_subbands != self.num_subbands {
            return Err(FrontendError::Shape(format!(
                "Expected {} subbands, got {}",
                self.num_subbands, num_subbands
            )));
        }
        if lengths.len() != batch_size {
            return Err(FrontendError::Shape(format!(
                "Expected {} length entries to match the batch size, got {}",
                batch_size,
                lengths.len()
            )));
        }

        let magnitude = self.magnitude_features(input)?;

        let features = if self.use_ipd {
            let ipd = ipd_features(input)?;
            // Broadcast the (possibly reduced) magnitude to the IPD channel
            // count and concatenate along the feature axis
            let mag_full = magnitude
                .broadcast(ipd.raw_dim())
                .ok_or_else(|| {
                    FrontendError::Shape(format!(
                        "Cannot broadcast magnitude features {:?} to IPD shape {:?}",
                        magnitude.shape(),
                        ipd.shape()
                    ))
                })?
                .to_owned();
            concatenate(Axis(2), &[mag_full.view(), ipd.view()])
                .map_err(|e| FrontendError::Shape(e.to_string()))?
        } else {
            magnitude
        };

        if let Some(expected) = self.num_channels {
            let computed = features.shape()[1];
            if computed != expected {
                return Err(FrontendError::Shape(format!(
                    "Number of channels in features {computed} is different than the configured \
                     number of channels {expected}"
                )));
            }
        }

        Ok(features)
    }

    fn magnitude_features(&self, input: &Array4<Complex64>) -> FrontendResult<Array4<f64>> {
        let mag = match self.mag_reduction {
            MagReduction::None => input.mapv(|v| v.norm()),
            MagReduction::AbsMean => channel_mean(input)?.mapv(|v| v.norm()),
            MagReduction::MeanAbs => {
                let abs = input.mapv(|v| v.norm());
                abs.mean_axis(Axis(1))
                    .ok_or_else(|| FrontendError::Shape("Empty channel axis".to_string()))?
                    .insert_axis(Axis(1))
            }
            MagReduction::Rms => {
                let sq = input.mapv(|v| v.norm_sqr());
                sq.mean_axis(Axis(1))
                    .ok_or_else(|| FrontendError::Shape("Empty channel axis".to_string()))?
                    .insert_axis(Axis(1))
                    .mapv(f64::sqrt)
            }
        };
        Ok(mag)
    }
}

/// IPD of each channel relative to the channel-mean spectrum, wrapped to
/// (−π, π].
fn ipd_features(input: &Array4<Complex64>) -> FrontendResult<Array4<f64>> {
    let (batch_size, num_channels, num_subbands, num_frames) = input.dim();
    let spec_mean = channel_mean(input)?;

    let mut ipd = Array4::<f64>::zeros(input.raw_dim());
    for b in 0..batch_size {
        for c in 0..num_channels {
            for f in 0..num_subbands {
                for t in 0..num_frames {
                    let phase = input[[b, c, f, t]].arg() - spec_mean[[b, 0, f, t]].arg();
                    ipd[[b, c, f, t]] = wrap_to_pi(phase);
                }
            }
        }
    }
    Ok(ipd)
}

fn channel_mean(input: &Array4<Complex64>) -> FrontendResult<Array4<Complex64>> {
    Ok(input
        .mean_axis(Axis(1))
        .ok_or_else(|| FrontendError::Shape("Empty channel axis".to_string()))?
        .insert_axis(Axis(1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    fn two_channel_input() -> Array4<Complex64> {
        // channel 0 holds 1, channel 1 holds i, one subband, one frame
        let mut input = Array4::zeros((1, 2, 1, 1));
        input[[0, 0, 0, 0]] = Complex64::new(1.0, 0.0);
        input[[0, 1, 0, 0]] = Complex64::new(0.0, 1.0);
        input
    }

    #[test]
    fn test_magnitude_reduction_modes() {
        let input = two_channel_input();
        let lengths = [1];

        let rms = SpectrogramFeatures::new(FeatureExtractorConfig::new(1)).unwrap();
        let out = rms.compute(&input, &lengths).unwrap();
        assert_eq!(out.dim(), (1, 1, 1, 1));
        assert_approx_eq!(out[[0, 0, 0, 0]], 1.0, 1e-12);

        let mut config = FeatureExtractorConfig::new(1);
        config.mag_reduction = MagReduction::MeanAbs;
        let mean_abs = SpectrogramFeatures::new(config).unwrap();
        let out = mean_abs.compute(&input, &lengths).unwrap();
        assert_approx_eq!(out[[0, 0, 0, 0]], 1.0, 1e-12);

        let mut config = FeatureExtractorConfig::new(1);
        config.mag_reduction = MagReduction::AbsMean;
        let abs_mean = SpectrogramFeatures::new(config).unwrap();
        let out = abs_mean.compute(&input, &lengths).unwrap();
        // |(1 + i) / 2| = sqrt(2) / 2
        assert_approx_eq!(out[[0, 0, 0, 0]], 2f64.sqrt() / 2.0, 1e-12);

        let mut config = FeatureExtractorConfig::new(1);
        config.mag_reduction = MagReduction::None;
        let none = SpectrogramFeatures::new(config).unwrap();
        let out = none.compute(&input, &lengths).unwrap();
        assert_eq!(out.dim(), (1, 2, 1, 1));
        assert_approx_eq!(out[[0, 0, 0, 0]], 1.0, 1e-12);
        assert_approx_eq!(out[[0, 1, 0, 0]], 1.0, 1e-12);
    }

    #[test]
    fn test_ipd_relative_to_channel_mean() {
        let input = two_channel_input();

        let mut config = FeatureExtractorConfig::new(1);
        config.use_ipd = true;
        config.num_input_channels = Some(2);
        let extractor = SpectrogramFeatures::new(config).unwrap();
        assert_eq!(extractor.num_features(), 2);
        assert_eq!(extractor.num_channels().unwrap(), 2);

        let out = extractor.compute(&input, &[1]).unwrap();
        // (B, C, 2F, T): magnitude in the first subband slot, IPD in the second
        assert_eq!(out.dim(), (1, 2, 2, 1));
        // channel mean is (1 + i) / 2 with phase pi/4
        assert_approx_eq!(out[[0, 0, 1, 0]], -PI / 4.0, 1e-12);
        assert_approx_eq!(out[[0, 1, 1, 0]], PI / 4.0, 1e-12);
        // broadcast rms magnitude is identical for both channels
        assert_approx_eq!(out[[0, 0, 0, 0]], out[[0, 1, 0, 0]], 1e-12);
    }

    #[test]
    fn test_channel_count_mismatch_is_shape_error() {
        let input = two_channel_input();
        let mut config = FeatureExtractorConfig::new(1);
        config.mag_reduction = MagReduction::None;
        config.num_input_channels = Some(3);
        let extractor = SpectrogramFeatures::new(config).unwrap();
        assert!(matches!(
            extractor.compute(&input, &[1]),
            Err(FrontendError::Shape(_))
        ));
    }

    #[test]
    fn test_normalization_is_rejected_at_construction() {
        let mut config = FeatureExtractorConfig::new(4);
        config.mag_normalization = Some("mean_var".to_string());
        assert!(matches!(
            SpectrogramFeatures::new(config),
            Err(FrontendError::Configuration(_))
        ));

        let mut config = FeatureExtractorConfig::new(4);
        config.ipd_normalization = Some("mean".to_string());
        assert!(matches!(
            SpectrogramFeatures::new(config),
            Err(FrontendError::Configuration(_))
        ));
    }

    #[test]
    fn test_unconfigured_channel_count_errors() {
        let extractor = SpectrogramFeatures::new(FeatureExtractorConfig::new(4)).unwrap();
        // rms reduction fixes the channel count to one
        assert_eq!(extractor.num_channels().unwrap(), 1);

        let mut config = FeatureExtractorConfig::new(4);
        config.use_ipd = true;
        let extractor = SpectrogramFeatures::new(config).unwrap();
        assert!(matches!(
            extractor.num_channels(),
            Err(FrontendError::Configuration(_))
        ));
    }
}
