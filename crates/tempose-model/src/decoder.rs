//! Decoder head mapping refined features to per-joint heatmaps.
//!
//! Two transposed-convolution stages each double the spatial
//! resolution while reducing channel depth, followed by a bias-free
//! 1x1 projection to `num_joints` channels. The output is an
//! unnormalized regression target: no final activation.

use candle_core::{Module, Result, Tensor};
use candle_nn::{
    batch_norm, conv2d_no_bias, conv_transpose2d_no_bias, BatchNorm, Conv2d, Conv2dConfig,
    ConvTranspose2d, ConvTranspose2dConfig, ModuleT, VarBuilder,
};

pub struct DecoderHead {
    deconv1: ConvTranspose2d,
    bn1: BatchNorm,
    deconv2: ConvTranspose2d,
    bn2: BatchNorm,
    final_conv: Conv2d,
}

impl DecoderHead {
    pub fn new(
        embed_dim: usize,
        hidden_channels: usize,
        num_joints: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        // Kernel 4, stride 2, padding 1: exact x2 upsampling
        let deconv_config = ConvTranspose2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };

        let deconv1 = conv_transpose2d_no_bias(
            embed_dim,
            hidden_channels,
            4,
            deconv_config,
            vb.pp("deconv1"),
        )?;
        let bn1 = batch_norm(hidden_channels, 1e-5, vb.pp("bn1"))?;

        let deconv2 = conv_transpose2d_no_bias(
            hidden_channels,
            hidden_channels,
            4,
            deconv_config,
            vb.pp("deconv2"),
        )?;
        let bn2 = batch_norm(hidden_channels, 1e-5, vb.pp("bn2"))?;

        let final_conv = conv2d_no_bias(
            hidden_channels,
            num_joints,
            1,
            Conv2dConfig::default(),
            vb.pp("final"),
        )?;

        Ok(Self {
            deconv1,
            bn1,
            deconv2,
            bn2,
            final_conv,
        })
    }

    /// # Arguments
    /// * `x` - Refined center features [batch, embed_dim, h, w]
    ///
    /// # Returns
    /// Heatmaps [batch, num_joints, 4 * h, 4 * w]
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.deconv1.forward(x)?;
        let x = self.bn1.forward_t(&x, train)?.relu()?;

        let x = self.deconv2.forward(&x)?;
        let x = self.bn2.forward_t(&x, train)?.relu()?;

        self.final_conv.forward(&x)
    }
}
