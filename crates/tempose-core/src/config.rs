//! Model configuration with fail-fast validation.
//!
//! A single configurable pipeline with per-stage enable flags covers
//! the architecture space: adaptive frame weighting, multi-scale
//! feature fusion and temporal convolution can each be toggled
//! independently around the always-present temporal attention mixer
//! and decoder head.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Keypoint;

/// Output resolutions of the pyramid pooling paths used by the
/// multi-scale fuser. Each must divide the feature-map resolution.
pub const PYRAMID_POOL_SIZES: [usize; 4] = [1, 2, 3, 6];

/// Optional-stage toggles for the fusion head.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageToggles {
    /// Rescale each frame by a learned quality weight.
    pub adaptive_weighting: bool,
    /// Fuse intermediate backbone depths via pyramid pooling.
    pub multi_scale_fusion: bool,
    /// Depthwise-separable temporal convolution refinement.
    pub temporal_conv: bool,
}

impl Default for StageToggles {
    fn default() -> Self {
        Self {
            adaptive_weighting: true,
            multi_scale_fusion: false,
            temporal_conv: false,
        }
    }
}

/// Declarative backbone freezing policy, resolved once at
/// construction into a trainable/frozen parameter partition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FreezePolicy {
    /// Freeze backbone parameters except the trainable tail.
    pub freeze_backbone: bool,
    /// Number of trailing backbone blocks left trainable.
    pub trainable_tail_blocks: usize,
}

impl Default for FreezePolicy {
    fn default() -> Self {
        Self {
            freeze_backbone: true,
            trainable_tail_blocks: 4,
        }
    }
}

/// Complete fusion-head configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of predicted joints (17 for COCO format)
    pub num_joints: usize,
    /// Output heatmap resolution (height, width)
    pub heatmap_size: (usize, usize),
    /// Backbone feature-map resolution (height, width)
    pub feature_size: (usize, usize),
    /// Backbone feature channel depth
    pub embed_dim: usize,
    /// Temporal window length (odd; center frame at window_size / 2)
    pub window_size: usize,
    /// Number of attention heads
    pub num_heads: usize,
    /// Number of stacked self/cross attention mixer layers
    pub num_mixer_layers: usize,
    /// Channel width of the decoder deconvolution stages
    pub decoder_channels: usize,
    /// Dropout rate (active in train mode only)
    pub dropout: f32,
    /// Optional-stage toggles
    pub stages: StageToggles,
    /// Backbone freezing policy
    pub freeze: FreezePolicy,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_joints: Keypoint::COUNT,
            heatmap_size: (96, 72),
            feature_size: (24, 18),
            embed_dim: 384,
            window_size: 5,
            num_heads: 4,
            num_mixer_layers: 3,
            decoder_channels: 256,
            dropout: 0.1,
            stages: StageToggles::default(),
            freeze: FreezePolicy::default(),
        }
    }
}

impl ModelConfig {
    /// Number of deconvolution stages in the decoder head; each
    /// doubles the spatial resolution.
    pub const DECONV_STAGES: usize = 2;

    /// Index of the center frame within the window.
    pub fn center_frame(&self) -> usize {
        self.window_size / 2
    }

    /// Validate the configuration. Every shape-level inconsistency is
    /// rejected here so that construction, not the forward pass, is
    /// the failure point.
    pub fn validate(&self) -> Result<()> {
        if self.num_joints == 0 {
            return Err(Error::Config("num_joints must be positive".into()));
        }
        if self.window_size < 3 || self.window_size % 2 == 0 {
            return Err(Error::Config(format!(
                "window_size must be odd and >= 3, got {}",
                self.window_size
            )));
        }
        if self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
            return Err(Error::Config(format!(
                "embed_dim {} must be divisible by num_heads {}",
                self.embed_dim, self.num_heads
            )));
        }
        if self.num_mixer_layers == 0 {
            return Err(Error::Config("num_mixer_layers must be positive".into()));
        }
        if (self.stages.multi_scale_fusion || self.stages.temporal_conv)
            && self.embed_dim % 4 != 0
        {
            return Err(Error::Config(format!(
                "embed_dim {} must be divisible by 4 for the bottlenecked stages",
                self.embed_dim
            )));
        }
        let (fh, fw) = self.feature_size;
        if self.stages.multi_scale_fusion {
            for p in PYRAMID_POOL_SIZES {
                if fh % p != 0 || fw % p != 0 {
                    return Err(Error::Config(format!(
                        "pyramid pool size {} does not divide feature size {}x{}",
                        p, fh, fw
                    )));
                }
            }
        }
        let scale = 1 << Self::DECONV_STAGES;
        if self.heatmap_size != (fh * scale, fw * scale) {
            return Err(Error::ShapeMismatch {
                expected: format!("heatmap size ({}, {})", fh * scale, fw * scale),
                actual: format!("({}, {})", self.heatmap_size.0, self.heatmap_size.1),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(ModelConfig::default().validate().is_ok());
        assert_eq!(ModelConfig::default().center_frame(), 2);
    }

    #[test]
    fn test_rejects_even_window() {
        let config = ModelConfig {
            window_size: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_indivisible_heads() {
        let config = ModelConfig {
            embed_dim: 384,
            num_heads: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inconsistent_heatmap() {
        let config = ModelConfig {
            heatmap_size: (64, 48),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_pool_divisor() {
        let config = ModelConfig {
            feature_size: (20, 16),
            heatmap_size: (80, 64),
            stages: StageToggles {
                multi_scale_fusion: true,
                ..Default::default()
            },
            ..Default::default()
        };
        // 3 does not divide 20x16
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = ModelConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.embed_dim, config.embed_dim);
        assert_eq!(parsed.heatmap_size, config.heatmap_size);
    }
}
