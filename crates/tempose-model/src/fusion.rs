//! Multi-scale feature fusion.
//!
//! Feature maps sampled at several backbone depths are each enriched
//! with pyramid-pooled context, then fused across sources through a
//! lightweight token-mixing step: spatial positions are flattened into
//! tokens, tokens from all sources are concatenated, and one linear
//! transform with a residual stands in for full attention fusion. The
//! downstream temporal mixer supplies the dominant modeling capacity,
//! so this stage trades expressiveness for throughput.

use candle_core::{bail, Module, Result, Tensor};
use candle_nn::{
    batch_norm, conv2d_no_bias, layer_norm, linear, BatchNorm, Conv2d, Conv2dConfig, Dropout,
    LayerNorm, Linear, ModuleT, VarBuilder,
};

use tempose_core::PYRAMID_POOL_SIZES;

/// Bilinear interpolation matrix mapping `inp` source positions onto
/// `out` target positions (align-corners convention).
fn interp_matrix(out: usize, inp: usize, device: &candle_core::Device) -> Result<Tensor> {
    let mut data = vec![0f32; out * inp];
    for i in 0..out {
        let src = if out == 1 {
            0.0
        } else {
            i as f32 * (inp - 1) as f32 / (out - 1) as f32
        };
        let lo = src.floor() as usize;
        let hi = (lo + 1).min(inp - 1);
        let frac = src - lo as f32;
        data[i * inp + lo] += 1.0 - frac;
        data[i * inp + hi] += frac;
    }
    Tensor::from_vec(data, (out, inp), device)
}

/// Bilinear upsampling of a [batch, channels, h, w] map to
/// (target_h, target_w), expressed as two interpolation matmuls.
fn upsample_bilinear(x: &Tensor, target_h: usize, target_w: usize) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    let mh = interp_matrix(target_h, h, x.device())?;
    let mw = interp_matrix(target_w, w, x.device())?;
    let x = mh.broadcast_matmul(x)?;
    x.broadcast_matmul(&mw.t()?)
}

/// Pyramid pooling over fixed output resolutions. Each path pools the
/// map, projects it with a 1x1 convolution, upsamples back and the
/// results are concatenated with the original map along channels.
pub struct PyramidPooling {
    paths: Vec<(usize, Conv2d, BatchNorm)>,
}

impl PyramidPooling {
    pub fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let mut paths = Vec::with_capacity(PYRAMID_POOL_SIZES.len());
        for pool_size in PYRAMID_POOL_SIZES {
            let vb = vb.pp(format!("path_{}", pool_size));
            let conv = conv2d_no_bias(
                in_channels,
                out_channels,
                1,
                Conv2dConfig::default(),
                vb.pp("conv"),
            )?;
            let bn = batch_norm(out_channels, 1e-5, vb.pp("bn"))?;
            paths.push((pool_size, conv, bn));
        }
        Ok(Self { paths })
    }

    /// # Arguments
    /// * `x` - Feature map [batch, in_channels, h, w]; h and w must be
    ///   divisible by every pool size
    ///
    /// # Returns
    /// Multi-scale map [batch, in_channels + paths * out_channels, h, w]
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (_, _, h, w) = x.dims4()?;

        let mut features = vec![x.clone()];
        for (pool_size, conv, bn) in &self.paths {
            if h % pool_size != 0 || w % pool_size != 0 {
                bail!("pool size {pool_size} does not divide feature map {h}x{w}");
            }
            let (kh, kw) = (h / pool_size, w / pool_size);
            let pooled = x.avg_pool2d_with_stride((kh, kw), (kh, kw))?;
            let projected = bn.forward_t(&conv.forward(&pooled)?, train)?.relu()?;
            features.push(upsample_bilinear(&projected, h, w)?);
        }

        let refs: Vec<&Tensor> = features.iter().collect();
        Tensor::cat(&refs, 1)
    }
}

/// Fuses feature windows from multiple named backbone depths into a
/// single window at the canonical channel depth.
pub struct MultiScaleFusion {
    ppm: PyramidPooling,
    fusion_conv: Conv2d,
    fusion_norm: BatchNorm,
    token_mixer: Linear,
    token_norm: LayerNorm,
    dropout: Dropout,
    embed_dim: usize,
}

impl MultiScaleFusion {
    pub fn new(embed_dim: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        if embed_dim % 4 != 0 {
            bail!("embed dim {embed_dim} must be divisible by 4 for pyramid projection");
        }

        // Original map + four pooled paths at embed_dim / 4 each
        let ppm = PyramidPooling::new(embed_dim, embed_dim / 4, vb.pp("ppm"))?;
        let conv_config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let fusion_conv = conv2d_no_bias(
            embed_dim * 2,
            embed_dim,
            3,
            conv_config,
            vb.pp("fusion_conv"),
        )?;
        let fusion_norm = batch_norm(embed_dim, 1e-5, vb.pp("fusion_norm"))?;
        let token_mixer = linear(embed_dim, embed_dim, vb.pp("token_mixer"))?;
        let token_norm = layer_norm(embed_dim, 1e-5, vb.pp("token_norm"))?;

        Ok(Self {
            ppm,
            fusion_conv,
            fusion_norm,
            token_mixer,
            token_norm,
            dropout: Dropout::new(dropout),
            embed_dim,
        })
    }

    /// Fuse feature windows from several backbone depths.
    ///
    /// # Arguments
    /// * `sources` - Named feature windows, each
    ///   [batch, frames, embed_dim, h, w] with matching shapes
    ///
    /// # Returns
    /// Fused window [batch, frames, embed_dim, h, w]
    pub fn forward(&self, sources: &[(String, Tensor)], train: bool) -> Result<Tensor> {
        let Some((_, first)) = sources.first() else {
            bail!("multi-scale fusion requires at least one feature source");
        };
        let (batch, frames, channels, height, width) = first.dims5()?;
        if channels != self.embed_dim {
            bail!(
                "feature source has {channels} channels, expected {}",
                self.embed_dim
            );
        }
        let plane = height * width;

        // Per-source pyramid enrichment, then flatten to tokens
        let mut token_sets = Vec::with_capacity(sources.len());
        for (name, source) in sources {
            if source.dims() != first.dims() {
                bail!(
                    "feature source {name} shape {:?} does not match {:?}",
                    source.dims(),
                    first.dims()
                );
            }
            let flat = source.reshape((batch * frames, channels, height, width))?;
            let y = self.ppm.forward(&flat, train)?;
            let y = self.fusion_conv.forward(&y)?;
            let y = self.fusion_norm.forward_t(&y, train)?.relu()?;
            let y = self.dropout.forward(&y, train)?;
            let tokens = y
                .reshape((batch * frames, channels, plane))?
                .transpose(1, 2)?
                .contiguous()?;
            token_sets.push(tokens);
        }

        // Cross-source token mixing: concatenate along the token axis,
        // one linear transform, residual + norm, then average the
        // per-source contributions back down.
        let refs: Vec<&Tensor> = token_sets.iter().collect();
        let tokens = Tensor::cat(&refs, 1)?;
        let mixed = self.token_mixer.forward(&tokens)?;
        let fused = self.token_norm.forward(&(tokens + mixed)?)?;
        let fused = self.dropout.forward(&fused, train)?;

        let fused = fused
            .reshape((batch * frames, sources.len(), plane, channels))?
            .mean(1)?;
        fused
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, frames, channels, height, width))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_interp_matrix_rows_sum_to_one() -> Result<()> {
        let device = Device::Cpu;
        let m = interp_matrix(12, 3, &device)?;
        assert_eq!(m.dims(), &[12, 3]);
        let sums: Vec<f32> = m.sum(1)?.to_vec1()?;
        for s in sums {
            assert!((s - 1.0).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_pyramid_pooling_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let ppm = PyramidPooling::new(8, 2, vb)?;
        let x = Tensor::randn(0f32, 1.0, (2, 8, 12, 6), &device)?;

        let out = ppm.forward(&x, false)?;
        // 8 original + 4 paths x 2 channels
        assert_eq!(out.dims(), &[2, 16, 12, 6]);
        Ok(())
    }

    #[test]
    fn test_pyramid_pooling_rejects_bad_resolution() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let ppm = PyramidPooling::new(8, 2, vb)?;
        let x = Tensor::randn(0f32, 1.0, (1, 8, 10, 6), &device)?;
        // 3 does not divide 10
        assert!(ppm.forward(&x, false).is_err());
        Ok(())
    }

    #[test]
    fn test_fusion_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let fusion = MultiScaleFusion::new(8, 0.1, vb)?;
        let a = Tensor::randn(0f32, 1.0, (2, 3, 8, 12, 6), &device)?;
        let b = Tensor::randn(0f32, 1.0, (2, 3, 8, 12, 6), &device)?;

        let sources = vec![("layer_3".to_string(), a), ("final".to_string(), b)];
        let fused = fusion.forward(&sources, false)?;
        assert_eq!(fused.dims(), &[2, 3, 8, 12, 6]);
        Ok(())
    }

    #[test]
    fn test_fusion_rejects_mismatched_sources() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let fusion = MultiScaleFusion::new(8, 0.1, vb)?;
        let a = Tensor::randn(0f32, 1.0, (2, 3, 8, 12, 6), &device)?;
        let b = Tensor::randn(0f32, 1.0, (2, 5, 8, 12, 6), &device)?;

        let sources = vec![("layer_3".to_string(), a), ("final".to_string(), b)];
        assert!(fusion.forward(&sources, false).is_err());
        Ok(())
    }
}
