//! Complete temporal fusion pipeline.
//!
//! One configurable head covers the architecture space: multi-scale
//! fusion, adaptive frame weighting and temporal convolution are
//! optional stages around the always-present temporal mixer and
//! decoder. The backbone lives behind the [`FeatureExtractor`] trait;
//! the pipeline never manages its weights.

use candle_core::{bail, Result, Tensor};
use candle_nn::{Dropout, VarBuilder};

use tempose_core::ModelConfig;

use crate::attention::TemporalMixer;
use crate::decoder::DecoderHead;
use crate::fusion::MultiScaleFusion;
use crate::temporal::TemporalConvNet;
use crate::weighting::FrameWeighter;

/// Execution mode for a single forward pass. Passed explicitly per
/// call; there is no hidden train/eval flag to desynchronize across
/// components. Dropout and batch-norm statistics honor it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

impl Mode {
    pub fn is_train(self) -> bool {
        matches!(self, Mode::Train)
    }
}

/// Backbone output for one batch of frames.
pub struct FeatureMaps {
    /// Final feature map [batch, embed_dim, feature_h, feature_w]
    pub output: Tensor,
    /// Named intermediate depths with the same shape as `output`,
    /// consumed only when multi-scale fusion is enabled
    pub intermediates: Vec<(String, Tensor)>,
}

/// Boundary to the external per-frame feature extractor.
pub trait FeatureExtractor {
    /// Map an image batch [n, channels, image_h, image_w] to spatial
    /// feature maps.
    fn extract(&self, images: &Tensor) -> Result<FeatureMaps>;
}

/// Output of one fusion-head forward pass.
pub struct HeadOutput {
    /// Center-frame heatmaps [batch, num_joints, heatmap_h, heatmap_w]
    pub heatmap: Tensor,
    /// Frame weights [batch, frames], present when adaptive weighting
    /// is enabled
    pub frame_weights: Option<Tensor>,
}

/// Temporal multi-frame fusion head.
pub struct FusionHead {
    fusion: Option<MultiScaleFusion>,
    weighter: Option<FrameWeighter>,
    temporal: Option<TemporalConvNet>,
    mixer: TemporalMixer,
    decoder: DecoderHead,
    dropout: Dropout,
    config: ModelConfig,
}

impl FusionHead {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate().map_err(candle_core::Error::wrap)?;

        let fusion = if config.stages.multi_scale_fusion {
            Some(MultiScaleFusion::new(
                config.embed_dim,
                config.dropout,
                vb.pp("fusion"),
            )?)
        } else {
            None
        };

        let weighter = if config.stages.adaptive_weighting {
            Some(FrameWeighter::new(
                config.embed_dim,
                config.dropout,
                vb.pp("weighter"),
            )?)
        } else {
            None
        };

        let temporal = if config.stages.temporal_conv {
            Some(TemporalConvNet::new(
                config.embed_dim,
                3,
                config.dropout,
                vb.pp("temporal"),
            )?)
        } else {
            None
        };

        let mixer = TemporalMixer::new(
            config.embed_dim,
            config.num_heads,
            config.num_mixer_layers,
            vb.pp("mixer"),
        )?;

        let decoder = DecoderHead::new(
            config.embed_dim,
            config.decoder_channels,
            config.num_joints,
            vb.pp("decoder"),
        )?;

        tracing::debug!(
            multi_scale_fusion = config.stages.multi_scale_fusion,
            adaptive_weighting = config.stages.adaptive_weighting,
            temporal_conv = config.stages.temporal_conv,
            mixer_layers = config.num_mixer_layers,
            "fusion head constructed"
        );

        Ok(Self {
            fusion,
            weighter,
            temporal,
            mixer,
            decoder,
            dropout: Dropout::new(config.dropout),
            config: config.clone(),
        })
    }

    /// Refine a feature window into center-frame heatmaps.
    ///
    /// # Arguments
    /// * `window` - Backbone feature window
    ///   [batch, frames, embed_dim, feature_h, feature_w]
    /// * `intermediates` - Named intermediate-depth windows of the
    ///   same shape; fused together with `window` when multi-scale
    ///   fusion is enabled, ignored otherwise
    pub fn forward(
        &self,
        window: &Tensor,
        intermediates: &[(String, Tensor)],
        mode: Mode,
    ) -> Result<HeadOutput> {
        let train = mode.is_train();
        let (_, frames, channels, height, width) = window.dims5()?;

        if frames != self.config.window_size {
            bail!(
                "window has {frames} frames, configured for {}",
                self.config.window_size
            );
        }
        if channels != self.config.embed_dim
            || (height, width) != self.config.feature_size
        {
            bail!(
                "feature window [{channels}, {height}, {width}] does not match configured [{}, {}, {}]",
                self.config.embed_dim,
                self.config.feature_size.0,
                self.config.feature_size.1
            );
        }

        let mut x = match &self.fusion {
            Some(fusion) => {
                let mut sources: Vec<(String, Tensor)> = intermediates.to_vec();
                sources.push(("backbone_out".to_string(), window.clone()));
                fusion.forward(&sources, train)?
            }
            None => window.clone(),
        };

        let mut frame_weights = None;
        if let Some(weighter) = &self.weighter {
            let (weighted, weights) = weighter.forward(&x, train)?;
            x = weighted;
            frame_weights = Some(weights);
        }

        if let Some(temporal) = &self.temporal {
            x = temporal.forward(&x, train)?;
        }

        x = self.dropout.forward(&x, train)?;

        // Split the window into the center frame and its context
        let center_idx = self.config.center_frame();
        let center = x.narrow(1, center_idx, 1)?.squeeze(1)?;
        let before = x.narrow(1, 0, center_idx)?;
        let after = x.narrow(1, center_idx + 1, frames - center_idx - 1)?;
        let context = Tensor::cat(&[&before, &after], 1)?;

        let refined = self.mixer.forward(&center, &context)?;
        let heatmap = self.decoder.forward(&refined, train)?;

        Ok(HeadOutput {
            heatmap,
            frame_weights,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }
}

/// End-to-end model: external feature extractor plus fusion head.
pub struct TemporalPoseModel<B: FeatureExtractor> {
    backbone: B,
    head: FusionHead,
    config: ModelConfig,
}

impl<B: FeatureExtractor> TemporalPoseModel<B> {
    pub fn new(backbone: B, config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let head = FusionHead::new(config, vb.pp("head"))?;
        Ok(Self {
            backbone,
            head,
            config: config.clone(),
        })
    }

    /// Forward pass from an image window to center-frame heatmaps.
    ///
    /// # Arguments
    /// * `images` - Image window [batch, frames, channels, image_h, image_w]
    pub fn forward(&self, images: &Tensor, mode: Mode) -> Result<HeadOutput> {
        let (batch, frames, channels, height, width) = images.dims5()?;
        let flat = images.reshape((batch * frames, channels, height, width))?;

        let maps = self.backbone.extract(&flat)?;

        let (fh, fw) = self.config.feature_size;
        let expected = [batch * frames, self.config.embed_dim, fh, fw];
        if maps.output.dims() != expected {
            bail!(
                "backbone produced {:?}, expected {:?}",
                maps.output.dims(),
                expected
            );
        }

        let window = maps
            .output
            .reshape((batch, frames, self.config.embed_dim, fh, fw))?;
        let intermediates = maps
            .intermediates
            .into_iter()
            .map(|(name, t)| {
                let t = t.reshape((batch, frames, self.config.embed_dim, fh, fw))?;
                Ok((name, t))
            })
            .collect::<Result<Vec<_>>>()?;

        self.head.forward(&window, &intermediates, mode)
    }

    pub fn head(&self) -> &FusionHead {
        &self.head
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Module};
    use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarMap};
    use tempose_core::StageToggles;

    /// Patch-embedding stand-in for the external backbone: one strided
    /// convolution from image space to the feature resolution.
    struct PatchEmbed {
        proj: Conv2d,
        intermediates: usize,
    }

    impl PatchEmbed {
        fn new(embed_dim: usize, patch: usize, intermediates: usize, vb: VarBuilder) -> Result<Self> {
            let config = Conv2dConfig {
                stride: patch,
                ..Default::default()
            };
            let proj = conv2d(3, embed_dim, patch, config, vb.pp("proj"))?;
            Ok(Self {
                proj,
                intermediates,
            })
        }
    }

    impl FeatureExtractor for PatchEmbed {
        fn extract(&self, images: &Tensor) -> Result<FeatureMaps> {
            let output = self.proj.forward(images)?;
            let intermediates = (0..self.intermediates)
                .map(|i| Ok((format!("layer_{}", i), output.clone())))
                .collect::<Result<Vec<_>>>()?;
            Ok(FeatureMaps {
                output,
                intermediates,
            })
        }
    }

    fn test_config(stages: StageToggles) -> ModelConfig {
        ModelConfig {
            embed_dim: 32,
            num_heads: 4,
            num_mixer_layers: 1,
            decoder_channels: 16,
            stages,
            ..Default::default()
        }
    }

    fn build_model(
        config: &ModelConfig,
        intermediates: usize,
    ) -> Result<TemporalPoseModel<PatchEmbed>> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let backbone = PatchEmbed::new(config.embed_dim, 16, intermediates, vb.pp("backbone"))?;
        TemporalPoseModel::new(backbone, config, vb)
    }

    #[test]
    fn test_end_to_end_shapes() -> Result<()> {
        let config = test_config(StageToggles::default());
        let model = build_model(&config, 0)?;

        let images = Tensor::randn(0f32, 1.0, (2, 5, 3, 384, 288), &Device::Cpu)?;
        let output = model.forward(&images, Mode::Eval)?;

        assert_eq!(output.heatmap.dims(), &[2, 17, 96, 72]);
        let weights = output.frame_weights.expect("weighting enabled");
        assert_eq!(weights.dims(), &[2, 5]);
        Ok(())
    }

    #[test]
    fn test_all_stages_enabled() -> Result<()> {
        let config = test_config(StageToggles {
            adaptive_weighting: true,
            multi_scale_fusion: true,
            temporal_conv: true,
        });
        let model = build_model(&config, 2)?;

        let images = Tensor::randn(0f32, 1.0, (1, 5, 3, 384, 288), &Device::Cpu)?;
        let output = model.forward(&images, Mode::Eval)?;

        assert_eq!(output.heatmap.dims(), &[1, 17, 96, 72]);
        Ok(())
    }

    #[test]
    fn test_eval_determinism() -> Result<()> {
        let config = test_config(StageToggles::default());
        let model = build_model(&config, 0)?;

        let images = Tensor::randn(0f32, 1.0, (1, 5, 3, 384, 288), &Device::Cpu)?;
        let a = model.forward(&images, Mode::Eval)?;
        let b = model.forward(&images, Mode::Eval)?;

        let a: Vec<f32> = a.heatmap.flatten_all()?.to_vec1()?;
        let b: Vec<f32> = b.heatmap.flatten_all()?.to_vec1()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_rejects_wrong_window_length() -> Result<()> {
        let config = test_config(StageToggles::default());
        let model = build_model(&config, 0)?;

        let images = Tensor::randn(0f32, 1.0, (1, 3, 3, 384, 288), &Device::Cpu)?;
        assert!(model.forward(&images, Mode::Eval).is_err());
        Ok(())
    }

    #[test]
    fn test_construction_rejects_invalid_config() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let config = ModelConfig {
            embed_dim: 30,
            num_heads: 4,
            ..Default::default()
        };
        assert!(FusionHead::new(&config, vb).is_err());
    }
}
