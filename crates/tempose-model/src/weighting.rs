//! Adaptive frame weighting.
//!
//! Not every frame in a temporal window is equally informative: motion
//! blur, occlusion or poor lighting degrade individual frames. A small
//! shared scoring network reduces each frame's feature map to a scalar
//! quality estimate; the softmax-normalized scores rescale the frames
//! before temporal mixing.

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Dropout, Linear, VarBuilder};

/// Channel width of the quality scoring stack.
const SCORE_CHANNELS: usize = 64;

/// Scores each frame of a feature window and rescales it by its
/// softmax-normalized weight. The scoring parameters are shared across
/// frames: the same function is evaluated per frame.
pub struct FrameWeighter {
    score_conv: Conv2d,
    score_proj: Linear,
    dropout: Dropout,
}

impl FrameWeighter {
    pub fn new(embed_dim: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        let conv_config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let score_conv = conv2d(embed_dim, SCORE_CHANNELS, 3, conv_config, vb.pp("score_conv"))?;
        let score_proj = linear(SCORE_CHANNELS, 1, vb.pp("score_proj"))?;

        Ok(Self {
            score_conv,
            score_proj,
            dropout: Dropout::new(dropout),
        })
    }

    /// Reweight a feature window by per-frame quality.
    ///
    /// # Arguments
    /// * `x` - Feature window [batch, frames, channels, height, width]
    ///
    /// # Returns
    /// Tuple of (reweighted window of identical shape, frame weights
    /// [batch, frames]). Weights are non-negative and sum to 1 per
    /// sample.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let (batch, frames, channels, height, width) = x.dims5()?;

        // Shared scorer evaluated on every frame independently
        let flat = x.reshape((batch * frames, channels, height, width))?;
        let s = self.score_conv.forward(&flat)?.relu()?;
        let s = s.mean(D::Minus1)?.mean(D::Minus1)?;
        let scores = self.score_proj.forward(&s)?.reshape((batch, frames))?;
        let scores = self.dropout.forward(&scores, train)?;

        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;

        let weighted = x.broadcast_mul(&weights.reshape((batch, frames, 1, 1, 1))?)?;
        Ok((weighted, weights))
    }
}
