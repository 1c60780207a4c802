//! Inference engine for streaming video frames.
//!
//! Frames are buffered until a full temporal window is available, then
//! the center frame of the window is predicted and the window slides
//! forward by one frame.

use std::collections::VecDeque;
use std::path::Path;

use candle_core::{bail, DType, Device, IndexOp, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use parking_lot::RwLock;

use tempose_core::{decode_heatmaps, DecodedJoint, ModelConfig};

use crate::model::{FeatureExtractor, Mode, TemporalPoseModel};

/// Device selection for inference.
#[derive(Debug, Clone, Copy)]
pub enum DeviceKind {
    Cpu,
    Cuda(usize),
    Metal,
}

impl DeviceKind {
    fn device(self) -> Result<Device> {
        match self {
            DeviceKind::Cpu => Ok(Device::Cpu),
            DeviceKind::Cuda(ordinal) => Device::new_cuda(ordinal),
            DeviceKind::Metal => Device::new_metal(0),
        }
    }
}

/// Center-frame prediction for one emitted window.
#[derive(Debug)]
pub struct PosePrediction {
    /// Raw heatmaps [num_joints, heatmap_h, heatmap_w]
    pub heatmap: Tensor,
    /// Decoded peak coordinates per joint
    pub joints: Vec<DecodedJoint>,
    /// Frame weights for the window, when adaptive weighting is on
    pub frame_weights: Option<Vec<f32>>,
}

/// Streaming inference over a sliding temporal window.
pub struct InferenceEngine<B: FeatureExtractor> {
    model: TemporalPoseModel<B>,
    device: Device,
    frames: RwLock<VecDeque<Tensor>>,
}

impl<B: FeatureExtractor> InferenceEngine<B> {
    /// Create an engine with randomly initialized head weights.
    pub fn new_random<F>(build_backbone: F, config: &ModelConfig, kind: DeviceKind) -> Result<Self>
    where
        F: FnOnce(VarBuilder) -> Result<B>,
    {
        let device = kind.device()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        Self::build(build_backbone, config, device, vb)
    }

    /// Load engine weights from a safetensors checkpoint.
    pub fn load<F, P>(
        build_backbone: F,
        config: &ModelConfig,
        kind: DeviceKind,
        path: P,
    ) -> Result<Self>
    where
        F: FnOnce(VarBuilder) -> Result<B>,
        P: AsRef<Path>,
    {
        let device = kind.device()?;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[path.as_ref()], DType::F32, &device)?
        };
        tracing::info!(path = %path.as_ref().display(), "loaded model checkpoint");
        Self::build(build_backbone, config, device, vb)
    }

    fn build<F>(
        build_backbone: F,
        config: &ModelConfig,
        device: Device,
        vb: VarBuilder,
    ) -> Result<Self>
    where
        F: FnOnce(VarBuilder) -> Result<B>,
    {
        let backbone = build_backbone(vb.pp("backbone"))?;
        let model = TemporalPoseModel::new(backbone, config, vb)?;

        Ok(Self {
            model,
            device,
            frames: RwLock::new(VecDeque::new()),
        })
    }

    /// Number of frames currently buffered.
    pub fn buffered_frames(&self) -> usize {
        self.frames.read().len()
    }

    /// Discard all buffered frames.
    pub fn clear(&self) {
        self.frames.write().clear();
    }

    /// Push one video frame [channels, image_h, image_w]; returns a
    /// prediction once a full window has accumulated, then slides the
    /// window forward by one frame.
    pub fn push_frame(&self, frame: Tensor) -> Result<Option<PosePrediction>> {
        if frame.dims().len() != 3 {
            bail!("expected a [channels, h, w] frame, got {:?}", frame.dims());
        }
        let frame = frame.to_device(&self.device)?;

        let window = {
            let mut frames = self.frames.write();
            frames.push_back(frame);
            if frames.len() < self.model.config().window_size {
                return Ok(None);
            }
            let refs: Vec<&Tensor> = frames.iter().collect();
            let window = Tensor::stack(&refs, 0)?.unsqueeze(0)?;
            frames.pop_front();
            window
        };

        self.predict_window(&window).map(Some)
    }

    /// Run inference on a prepared window [1, frames, channels, h, w].
    fn predict_window(&self, window: &Tensor) -> Result<PosePrediction> {
        let output = self.model.forward(window, Mode::Eval)?;

        let heatmap = output.heatmap.i(0)?;
        let (joints, height, width) = heatmap.dims3()?;
        let data: Vec<f32> = heatmap.flatten_all()?.to_vec1()?;
        let decoded = decode_heatmaps(&data, joints, height, width)
            .map_err(candle_core::Error::wrap)?;

        let frame_weights = match output.frame_weights {
            Some(w) => Some(w.i(0)?.to_vec1::<f32>()?),
            None => None,
        };

        Ok(PosePrediction {
            heatmap,
            joints: decoded,
            frame_weights,
        })
    }

    pub fn model(&self) -> &TemporalPoseModel<B> {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Module;
    use candle_nn::{conv2d, Conv2d, Conv2dConfig};
    use tempose_core::StageToggles;

    use crate::model::FeatureMaps;

    struct PatchEmbed {
        proj: Conv2d,
    }

    impl FeatureExtractor for PatchEmbed {
        fn extract(&self, images: &Tensor) -> Result<FeatureMaps> {
            Ok(FeatureMaps {
                output: self.proj.forward(images)?,
                intermediates: Vec::new(),
            })
        }
    }

    fn test_engine() -> Result<InferenceEngine<PatchEmbed>> {
        let config = ModelConfig {
            embed_dim: 16,
            num_heads: 4,
            num_mixer_layers: 1,
            decoder_channels: 8,
            feature_size: (6, 4),
            heatmap_size: (24, 16),
            stages: StageToggles::default(),
            ..Default::default()
        };

        InferenceEngine::new_random(
            |vb| {
                let conv_config = Conv2dConfig {
                    stride: 16,
                    ..Default::default()
                };
                let proj = conv2d(3, 16, 16, conv_config, vb.pp("proj"))?;
                Ok(PatchEmbed { proj })
            },
            &config,
            DeviceKind::Cpu,
        )
    }

    #[test]
    fn test_sliding_window_emission() -> Result<()> {
        let engine = test_engine()?;
        let device = Device::Cpu;

        // 96x64 images patchify to the configured 6x4 feature maps
        for i in 0..4 {
            let frame = Tensor::randn(0f32, 1.0, (3, 96, 64), &device)?;
            assert!(engine.push_frame(frame)?.is_none(), "frame {}", i);
        }
        assert_eq!(engine.buffered_frames(), 4);

        let frame = Tensor::randn(0f32, 1.0, (3, 96, 64), &device)?;
        let prediction = engine.push_frame(frame)?.expect("window complete");

        assert_eq!(prediction.heatmap.dims(), &[17, 24, 16]);
        assert_eq!(prediction.joints.len(), 17);
        assert_eq!(prediction.frame_weights.as_ref().map(Vec::len), Some(5));

        // Window slides: the next frame completes another window
        assert_eq!(engine.buffered_frames(), 4);
        let frame = Tensor::randn(0f32, 1.0, (3, 96, 64), &device)?;
        assert!(engine.push_frame(frame)?.is_some());
        Ok(())
    }

    #[test]
    fn test_rejects_wrong_frame_rank() -> Result<()> {
        let engine = test_engine()?;
        let frame = Tensor::randn(0f32, 1.0, (1, 3, 96, 64), &Device::Cpu)?;
        assert!(engine.push_frame(frame).is_err());
        Ok(())
    }
}
