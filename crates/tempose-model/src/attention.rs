//! Temporal mixer: self-attention over context frames and
//! cross-attention from the center frame.
//!
//! Every (frame, spatial-position) pair of the context window is one
//! attention token, so context positions attend to each other across
//! all context frames jointly rather than frame-by-frame. The center
//! frame's positions then query the mixed context, and the attended
//! output is layer-normalized and added residually onto the original
//! center map. With the residual in place the mixer degrades to the
//! identity when attention contributes nothing.

use candle_core::{bail, Module, Result, Tensor};
use candle_nn::{layer_norm, linear, LayerNorm, Linear, VarBuilder};

/// Scaled dot-product multi-head attention with separate query and
/// key/value inputs. Softmax is taken over the key axis per query,
/// per head, per batch element.
pub struct MultiHeadAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    n_heads: usize,
    head_dim: usize,
}

impl MultiHeadAttention {
    pub fn new(dim: usize, n_heads: usize, vb: VarBuilder) -> Result<Self> {
        if n_heads == 0 || dim % n_heads != 0 {
            bail!("embed dim {dim} not divisible by {n_heads} heads");
        }
        let head_dim = dim / n_heads;

        let query = linear(dim, dim, vb.pp("query"))?;
        let key = linear(dim, dim, vb.pp("key"))?;
        let value = linear(dim, dim, vb.pp("value"))?;
        let output = linear(dim, dim, vb.pp("output"))?;

        Ok(Self {
            query,
            key,
            value,
            output,
            n_heads,
            head_dim,
        })
    }

    /// # Arguments
    /// * `q_in` - Query tokens [batch, q_len, dim]
    /// * `kv_in` - Key/value tokens [batch, kv_len, dim]
    ///
    /// # Returns
    /// Attended tokens [batch, q_len, dim]
    pub fn forward(&self, q_in: &Tensor, kv_in: &Tensor) -> Result<Tensor> {
        let (batch, q_len, dim) = q_in.dims3()?;
        let (_, kv_len, _) = kv_in.dims3()?;

        let q = self.query.forward(q_in)?;
        let k = self.key.forward(kv_in)?;
        let v = self.value.forward(kv_in)?;

        // [batch, heads, len, head_dim]
        let q = q
            .reshape((batch, q_len, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((batch, kv_len, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((batch, kv_len, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let scale = (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?)? / scale)?;
        let attn = candle_nn::ops::softmax(&scores, 3)?;

        let out = attn.matmul(&v)?;
        let out = out.transpose(1, 2)?.contiguous()?.reshape((batch, q_len, dim))?;

        self.output.forward(&out)
    }
}

/// One self/cross attention stage of the temporal mixer.
struct MixerLayer {
    self_attn: MultiHeadAttention,
    cross_attn: MultiHeadAttention,
    norm: LayerNorm,
}

impl MixerLayer {
    fn new(dim: usize, n_heads: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: MultiHeadAttention::new(dim, n_heads, vb.pp("self_attn"))?,
            cross_attn: MultiHeadAttention::new(dim, n_heads, vb.pp("cross_attn"))?,
            norm: layer_norm(dim, 1e-5, vb.pp("norm"))?,
        })
    }
}

/// Stack of temporal mixing layers refining the center frame against
/// its context. State-free per call.
pub struct TemporalMixer {
    layers: Vec<MixerLayer>,
}

impl TemporalMixer {
    pub fn new(dim: usize, n_heads: usize, n_layers: usize, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(n_layers);
        for i in 0..n_layers {
            layers.push(MixerLayer::new(dim, n_heads, vb.pp(format!("layer_{}", i)))?);
        }
        Ok(Self { layers })
    }

    /// Refine the center frame against its temporal context.
    ///
    /// Each layer re-mixes the original context tokens with its own
    /// self-attention, then the current center map cross-attends to
    /// them; the layer-normalized result is added residually, so every
    /// layer's queries come from the previously refined center while
    /// the context stays fixed to the input window.
    ///
    /// # Arguments
    /// * `center` - Center feature map [batch, channels, height, width]
    /// * `context` - Context window [batch, frames - 1, channels, height, width]
    ///
    /// # Returns
    /// Refined center map of identical shape to `center`
    pub fn forward(&self, center: &Tensor, context: &Tensor) -> Result<Tensor> {
        let (batch, n_ctx, channels, height, width) = context.dims5()?;
        let plane = height * width;

        // Joint token set over all (context frame, position) pairs
        let ctx_tokens = context
            .reshape((batch, n_ctx, channels, plane))?
            .transpose(2, 3)?
            .contiguous()?
            .reshape((batch, n_ctx * plane, channels))?;

        let mut center = center.clone();
        for layer in &self.layers {
            let mixed = layer.self_attn.forward(&ctx_tokens, &ctx_tokens)?;

            let queries = center
                .reshape((batch, channels, plane))?
                .transpose(1, 2)?
                .contiguous()?;
            let attended = layer.cross_attn.forward(&queries, &mixed)?;
            let attended = layer.norm.forward(&attended)?;
            let attended = attended
                .transpose(1, 2)?
                .contiguous()?
                .reshape((batch, channels, height, width))?;

            center = (center + attended)?;
        }

        Ok(center)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_attention_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let attn = MultiHeadAttention::new(32, 4, vb)?;
        let q = Tensor::randn(0f32, 1.0, (2, 12, 32), &device)?;
        let kv = Tensor::randn(0f32, 1.0, (2, 48, 32), &device)?;

        let out = attn.forward(&q, &kv)?;
        assert_eq!(out.dims(), &[2, 12, 32]);
        Ok(())
    }

    #[test]
    fn test_rejects_indivisible_heads() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        assert!(MultiHeadAttention::new(30, 4, vb).is_err());
    }

    #[test]
    fn test_mixer_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let mixer = TemporalMixer::new(16, 4, 2, vb)?;
        let center = Tensor::randn(0f32, 1.0, (2, 16, 6, 4), &device)?;
        let context = Tensor::randn(0f32, 1.0, (2, 4, 16, 6, 4), &device)?;

        let refined = mixer.forward(&center, &context)?;
        assert_eq!(refined.dims(), center.dims());
        Ok(())
    }

    #[test]
    fn test_mixer_identity_with_zeroed_params() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let mixer = TemporalMixer::new(8, 2, 3, vb)?;

        // Zero every parameter: attention output and the norm's affine
        // both vanish, leaving only the residual path.
        for var in varmap.all_vars() {
            var.set(&Tensor::zeros(var.shape(), DType::F32, &device)?)?;
        }

        let center = Tensor::randn(0f32, 1.0, (1, 8, 4, 3), &device)?;
        let context = Tensor::randn(0f32, 1.0, (1, 2, 8, 4, 3), &device)?;

        let refined = mixer.forward(&center, &context)?;
        let a: Vec<f32> = refined.flatten_all()?.to_vec1()?;
        let b: Vec<f32> = center.flatten_all()?.to_vec1()?;
        assert_eq!(a, b);
        Ok(())
    }
}
