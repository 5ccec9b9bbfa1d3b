//! Supporting types and enums for the front-end components.
//!
//! The option sets are closed enums resolved at construction time: an
//! unsupported variant name fails with a configuration error instead of a
//! deferred runtime surprise.

use std::fmt;
use std::str::FromStr;

use crate::error::FrontendError;

/// Reduction applied across channels when computing magnitude features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum MagReduction {
    /// No reduction, keep the magnitude of each channel.
    None,
    /// Magnitude of the channel-averaged complex spectrum.
    AbsMean,
    /// Channel-averaged magnitude.
    MeanAbs,
    /// Root-mean-square magnitude across channels.
    #[default]
    Rms,
}

impl FromStr for MagReduction {
    type Err = FrontendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(MagReduction::None),
            "abs_mean" => Ok(MagReduction::AbsMean),
            "mean_abs" => Ok(MagReduction::MeanAbs),
            "rms" => Ok(MagReduction::Rms),
            other => Err(FrontendError::Configuration(format!(
                "Unexpected magnitude reduction '{other}', expected one of none, abs_mean, mean_abs, rms"
            ))),
        }
    }
}

impl fmt::Display for MagReduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MagReduction::None => "none",
            MagReduction::AbsMean => "abs_mean",
            MagReduction::MeanAbs => "mean_abs",
            MagReduction::Rms => "rms",
        };
        f.write_str(name)
    }
}

/// Type of the mask-based spatial filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum FilterType {
    /// Parametric multichannel Wiener filter with a configurable trade-off
    /// parameter `beta`.
    Pmwf,
    /// Minimum variance distortionless response filter in the formulation of
    /// Souden et al., mathematically equivalent to `Pmwf` with `beta = 0` and
    /// a rank-one desired-signal covariance.
    #[default]
    MvdrSouden,
}

impl FromStr for FilterType {
    type Err = FrontendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pmwf" => Ok(FilterType::Pmwf),
            "mvdr_souden" => Ok(FilterType::MvdrSouden),
            other => Err(FrontendError::Configuration(format!(
                "Unknown filter type '{other}', expected one of pmwf, mvdr_souden"
            ))),
        }
    }
}

impl fmt::Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterType::Pmwf => "pmwf",
            FilterType::MvdrSouden => "mvdr_souden",
        };
        f.write_str(name)
    }
}

/// Assumed rank of the desired-signal spatial covariance in the parametric
/// multichannel Wiener filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum FilterRank {
    /// Rank-one approximation using the principal eigenpair of the estimated
    /// desired-signal covariance.
    #[default]
    One,
    /// Use the full estimated covariance.
    Full,
}

impl FromStr for FilterRank {
    type Err = FrontendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one" => Ok(FilterRank::One),
            "full" => Ok(FilterRank::Full),
            other => Err(FrontendError::Configuration(format!(
                "Unknown filter rank '{other}', expected one of one, full"
            ))),
        }
    }
}

impl fmt::Display for FilterRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterRank::One => "one",
            FilterRank::Full => "full",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mag_reduction_round_trip() {
        for name in ["none", "abs_mean", "mean_abs", "rms"] {
            let mode: MagReduction = name.parse().unwrap();
            assert_eq!(mode.to_string(), name);
        }
    }

    #[test]
    fn test_unknown_names_fail_with_configuration_error() {
        assert!(matches!(
            "mean".parse::<MagReduction>(),
            Err(FrontendError::Configuration(_))
        ));
        assert!(matches!(
            "mvdr".parse::<FilterType>(),
            Err(FrontendError::Configuration(_))
        ));
        assert!(matches!(
            "two".parse::<FilterRank>(),
            Err(FrontendError::Configuration(_))
        ));
    }
}
