//! # Tempose-Core
//!
//! Core types and utilities for temporal multi-frame human pose
//! estimation: the COCO keypoint vocabulary, model configuration with
//! fail-fast validation, error types, and the pure evaluation
//! functions (heatmap decoding and PCK accuracy) consumed at the
//! metric boundary.

pub mod config;
pub mod error;
pub mod metric;
pub mod types;

pub use config::{FreezePolicy, ModelConfig, StageToggles, PYRAMID_POOL_SIZES};
pub use error::{Error, Result};
pub use metric::{decode_heatmaps, pck_accuracy, DecodedJoint, PckResult};
pub use types::Keypoint;
