//! Joint-wise weighted mean-squared-error heatmap loss.

use candle_core::{bail, DType, Result, Tensor};

/// MSE over heatmaps computed per joint, optionally gated by a
/// per-joint validity weight, then averaged uniformly over all joints.
///
/// The average divides by the full joint count even when some joints
/// are masked out, so samples with many invalid joints contribute a
/// proportionally smaller gradient. This matches the reference
/// training recipe and is relied upon for checkpoint parity.
pub struct JointsMseLoss {
    use_target_weight: bool,
}

impl JointsMseLoss {
    pub fn new(use_target_weight: bool) -> Self {
        Self { use_target_weight }
    }

    /// # Arguments
    /// * `output` - Predicted heatmaps [batch, joints, h, w]
    /// * `target` - Ground-truth heatmaps [batch, joints, h, w]
    /// * `target_weight` - Per-joint validity [batch, joints]
    ///
    /// # Returns
    /// Scalar loss tensor
    pub fn forward(
        &self,
        output: &Tensor,
        target: &Tensor,
        target_weight: &Tensor,
    ) -> Result<Tensor> {
        let (batch, joints, height, width) = output.dims4()?;
        if target.dims() != output.dims() {
            bail!(
                "target shape {:?} does not match output {:?}",
                target.dims(),
                output.dims()
            );
        }
        if self.use_target_weight && target_weight.dims() != [batch, joints] {
            bail!(
                "target_weight shape {:?}, expected [{batch}, {joints}]",
                target_weight.dims()
            );
        }

        let pred = output.reshape((batch, joints, height * width))?;
        let gt = target.reshape((batch, joints, height * width))?;

        let mut loss = Tensor::zeros((), DType::F32, output.device())?;
        for j in 0..joints {
            let p = pred.narrow(1, j, 1)?.squeeze(1)?;
            let g = gt.narrow(1, j, 1)?.squeeze(1)?;

            let (p, g) = if self.use_target_weight {
                let w = target_weight.narrow(1, j, 1)?;
                (p.broadcast_mul(&w)?, g.broadcast_mul(&w)?)
            } else {
                (p, g)
            };

            let mse = (p - g)?.sqr()?.mean_all()?;
            loss = (loss + mse)?;
        }

        loss / joints as f64
    }
}
