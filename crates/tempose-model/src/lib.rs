//! # Tempose-Model
//!
//! Temporal multi-frame fusion head for 2D human pose estimation in
//! video. Per-frame feature maps from an external backbone are
//! combined across a short temporal window into a refined heatmap
//! prediction for the center frame.
//!
//! ## Pipeline
//!
//! 1. **Multi-Scale Fusion** (optional): pyramid pooling over several
//!    backbone depths plus lightweight token mixing.
//! 2. **Adaptive Frame Weighting** (optional): each frame is rescaled
//!    by a learned, softmax-normalized quality weight.
//! 3. **Temporal Convolution** (optional): depthwise-separable
//!    convolution along the frame axis.
//! 4. **Temporal Mixer**: self-attention over the context frames
//!    followed by cross-attention from the center frame, with an
//!    identity residual onto the center map.
//! 5. **Decoder Head**: deconvolution stack producing per-joint
//!    heatmaps.
//!
//! Training uses a joint-wise weighted MSE loss; PCK evaluation lives
//! in `tempose-core` as a pure function over decoded coordinates.

pub mod attention;
pub mod decoder;
pub mod engine;
pub mod freeze;
pub mod fusion;
pub mod loss;
pub mod model;
pub mod temporal;
pub mod weighting;

pub use attention::*;
pub use decoder::*;
pub use engine::*;
pub use freeze::*;
pub use fusion::*;
pub use loss::*;
pub use model::*;
pub use temporal::*;
pub use weighting::*;
