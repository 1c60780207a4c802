//! Depthwise-separable temporal convolution.
//!
//! A factored 3D convolution mixes adjacent-frame information with a
//! fixed, cheap receptive field, complementing the content-adaptive
//! attention stages: a temporal convolution along the frame axis into
//! a channel bottleneck, a depthwise spatial convolution per
//! bottleneck channel, and a pointwise convolution restoring the full
//! channel depth. Shape-preserving.

use candle_core::{bail, Module, Result, Tensor};
use candle_nn::{
    conv1d_no_bias, conv2d_no_bias, Conv1d, Conv1dConfig, Conv2d, Conv2dConfig, Dropout,
    VarBuilder,
};

pub struct TemporalConvNet {
    temporal: Conv1d,
    spatial: Conv2d,
    pointwise: Conv2d,
    dropout: Dropout,
    embed_dim: usize,
    bottleneck_dim: usize,
}

impl TemporalConvNet {
    pub fn new(embed_dim: usize, kernel_size: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        if embed_dim % 4 != 0 {
            bail!("embed dim {embed_dim} must be divisible by 4 for the bottleneck");
        }
        let bottleneck_dim = embed_dim / 4;

        let temporal_config = Conv1dConfig {
            padding: kernel_size / 2,
            ..Default::default()
        };
        let temporal = conv1d_no_bias(
            embed_dim,
            bottleneck_dim,
            kernel_size,
            temporal_config,
            vb.pp("temporal"),
        )?;

        let spatial_config = Conv2dConfig {
            padding: kernel_size / 2,
            groups: bottleneck_dim,
            ..Default::default()
        };
        let spatial = conv2d_no_bias(
            bottleneck_dim,
            bottleneck_dim,
            kernel_size,
            spatial_config,
            vb.pp("spatial"),
        )?;

        let pointwise = conv2d_no_bias(
            bottleneck_dim,
            embed_dim,
            1,
            Conv2dConfig::default(),
            vb.pp("pointwise"),
        )?;

        Ok(Self {
            temporal,
            spatial,
            pointwise,
            dropout: Dropout::new(dropout),
            embed_dim,
            bottleneck_dim,
        })
    }

    /// # Arguments
    /// * `x` - Feature window [batch, frames, embed_dim, height, width]
    ///
    /// # Returns
    /// Refined window of identical shape
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (batch, frames, channels, height, width) = x.dims5()?;
        if channels != self.embed_dim {
            bail!("expected {} channels, got {channels}", self.embed_dim);
        }

        // Frame axis as the 1D convolution length, one sequence per
        // spatial position
        let y = x
            .permute((0, 3, 4, 2, 1))?
            .contiguous()?
            .reshape((batch * height * width, channels, frames))?;
        let y = self.temporal.forward(&y)?.relu()?;
        let y = self.dropout.forward(&y, train)?;

        // Frames back into the batch for the spatial convolutions
        let y = y
            .reshape((batch, height, width, self.bottleneck_dim, frames))?
            .permute((0, 4, 3, 1, 2))?
            .contiguous()?
            .reshape((batch * frames, self.bottleneck_dim, height, width))?;
        let y = self.spatial.forward(&y)?.relu()?;
        let y = self.dropout.forward(&y, train)?;

        let y = self.pointwise.forward(&y)?.relu()?;
        let y = self.dropout.forward(&y, train)?;

        y.reshape((batch, frames, channels, height, width))
    }
}
