// Correctness and logic
#![warn(clippy::unit_cmp)] // Detects comparing unit types
#![warn(clippy::match_same_arms)]
// Duplicate match arms

// Performance-focused
#![warn(clippy::inefficient_to_string)] // `format!("{}", x)` vs `x.to_string()`
#![warn(clippy::map_clone)] // Cloning inside `map()` unnecessarily
#![warn(clippy::unnecessary_to_owned)] // Detects redundant `.to_owned()` or `.clone()`
#![warn(clippy::large_stack_arrays)] // Helps avoid stack overflows
#![warn(clippy::needless_collect)] // Avoids `.collect().iter()` chains

// Style and idiomatic Rust
#![warn(clippy::redundant_clone)] // Detects unnecessary `.clone()`
#![warn(clippy::identity_op)] // e.g., `x + 0`, `x * 1`
#![warn(clippy::needless_return)] // Avoids `return` at the end of functions
#![warn(clippy::let_unit_value)] // Avoids binding `()` to variables
#![warn(clippy::manual_map)] // Use `.map()` instead of manual `match`
#![warn(clippy::unwrap_used)] // Avoids using `unwrap()`

// Maintainability
#![warn(clippy::missing_panics_doc)] // Docs for functions that might panic
#![warn(clippy::missing_safety_doc)] // Docs for `unsafe` functions
#![allow(clippy::too_many_arguments)]
// Allow functions with many parameters (very few and far between)
#![deny(missing_docs)] // Documentation is a must for release

//! # farfield
//!
//! Multichannel acoustic front-end processing for far-field speech: mask
//! estimation, dereverberation, beamforming and multichannel feature
//! extraction, all operating on batched complex spectrograms of shape
//! (batch, channel, subband, frame).
//!
//! ## Overview
//!
//! The crate provides the mask-based enhancement chain that typically sits
//! between an STFT front end and a speech recognizer:
//!
//! - [`SpectrogramFeatures`]: per-frame magnitude and inter-channel phase
//!   difference features from a multichannel spectrogram
//! - [`GssMaskEstimator`]: guided source separation masks from a complex
//!   angular central Gaussian mixture model fitted with EM iterations
//! - [`WpeFilter`] and [`MaskBasedWpe`]: weighted prediction error
//!   dereverberation, with optional mask-driven power estimates
//! - [`MaskBasedBeamformer`]: parametric multichannel Wiener filtering and
//!   MVDR beamforming driven by time-frequency masks
//! - [`MaskReferenceChannel`]: single-channel masking of a reference channel
//!
//! STFT analysis and synthesis are out of scope; inputs and outputs are
//! complex subband spectrograms.
//!
//! ## Installation
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! farfield = "0.1.0"
//! ```
//!
//! ## Features
//!
//! - `parallel`: fan independent per-subband subproblems out across a
//!   `rayon` pool
//! - `serialization`: `serde` support for the configuration types
//!
//! ## Error Handling
//!
//! All fallible operations return [`FrontendResult`]; the error cases are
//! closed over configuration, shape, input and numerical failures:
//!
//! ```rust
//! use farfield::{FrontendError, FrontendResult};
//!
//! let result: FrontendResult<()> = Err(FrontendError::Configuration(
//!     "eps must be positive".to_string(),
//! ));
//!
//! match result {
//!     Ok(()) => {}
//!     Err(FrontendError::Configuration(msg)) => eprintln!("Bad configuration: {msg}"),
//!     Err(FrontendError::Shape(msg)) => eprintln!("Shape mismatch: {msg}"),
//!     Err(other_err) => eprintln!("Other error: {other_err}"),
//! }
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use farfield::{MaskReferenceChannel, MaskReferenceChannelConfig};
//! use ndarray::Array4;
//! use num_complex::Complex64;
//!
//! // One batch item, two channels, four subbands, eight frames
//! let input = Array4::from_elem((1, 2, 4, 8), Complex64::new(1.0, 0.0));
//! let mask = Array4::from_elem((1, 1, 4, 8), 0.5);
//!
//! let masking = MaskReferenceChannel::new(MaskReferenceChannelConfig::default())?;
//! let enhanced = masking.apply(&input, None, &mask)?;
//! assert_eq!(enhanced.dim(), (1, 1, 4, 8));
//! # Ok::<(), farfield::FrontendError>(())
//! ```

pub mod beamform;
pub mod error;
pub mod features;
pub mod gss;
mod linalg;
pub mod math;
pub mod reference;
pub mod types;
pub mod wpe;

pub use beamform::{
    BeamformerConfig, MaskBasedBeamformer, ParametricMultichannelWienerFilter, PmwfConfig,
};
pub use error::{FrontendError, FrontendResult};
pub use features::{FeatureExtractorConfig, SpectrogramFeatures};
pub use gss::{GssConfig, GssMaskEstimator};
pub use math::{db_to_mag, mask_invalid_frames3, mask_invalid_frames4, threshold_mask, wrap_to_pi};
pub use reference::{MaskReferenceChannel, MaskReferenceChannelConfig};
pub use types::{FilterRank, FilterType, MagReduction};
pub use wpe::{MaskBasedWpe, MaskBasedWpeConfig, WpeFilter, WpeFilterConfig};
