//! Evaluation utilities: heatmap decoding and PCK accuracy.
//!
//! Both are pure functions over flat slices; they never participate in
//! gradient computation. Layouts follow the heatmap/coordinate
//! conventions of the model crate: heatmaps are row-major
//! `[joint, height, width]`, coordinate arrays are `[sample, joint, 2]`
//! with `(x, y)` pairs.

use crate::error::{Error, Result};

/// Peak location decoded from one joint's heatmap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedJoint {
    /// Joint index within the configured joint set
    pub joint: usize,
    /// Normalized horizontal position [0, 1)
    pub x: f32,
    /// Normalized vertical position [0, 1)
    pub y: f32,
    /// Raw heatmap response at the peak
    pub score: f32,
}

/// Decode per-joint heatmaps for a single sample into normalized peak
/// coordinates via spatial argmax.
///
/// # Arguments
/// * `heatmaps` - Flat heatmap data of length `n_joints * height * width`
pub fn decode_heatmaps(
    heatmaps: &[f32],
    n_joints: usize,
    height: usize,
    width: usize,
) -> Result<Vec<DecodedJoint>> {
    let plane = height * width;
    if heatmaps.len() != n_joints * plane || plane == 0 {
        return Err(Error::ShapeMismatch {
            expected: format!("{} values ({}x{}x{})", n_joints * plane, n_joints, height, width),
            actual: format!("{} values", heatmaps.len()),
        });
    }

    let mut joints = Vec::with_capacity(n_joints);
    for j in 0..n_joints {
        let map = &heatmaps[j * plane..(j + 1) * plane];

        let mut max_idx = 0;
        let mut max_val = f32::NEG_INFINITY;
        for (idx, &v) in map.iter().enumerate() {
            if v > max_val {
                max_val = v;
                max_idx = idx;
            }
        }

        joints.push(DecodedJoint {
            joint: j,
            x: (max_idx % width) as f32 / width as f32,
            y: (max_idx / width) as f32 / height as f32,
            score: max_val,
        });
    }

    Ok(joints)
}

/// PCK accuracy result.
#[derive(Debug, Clone)]
pub struct PckResult {
    /// Accuracy per joint; `None` where no sample has the joint valid
    pub per_joint: Vec<Option<f32>>,
    /// Mean accuracy over joints with at least one valid sample
    pub avg: f32,
    /// Number of joints contributing to the average
    pub valid_joints: usize,
}

/// Percentage of correct keypoints under a normalized distance
/// threshold.
///
/// A prediction is correct when its distance to the ground truth,
/// after dividing each axis by the per-sample normalization factor,
/// falls below `threshold`. Joints with a false validity mask or a
/// non-positive normalization factor are excluded.
///
/// # Arguments
/// * `pred` - Predicted coordinates, `n_samples * n_joints * 2` values
/// * `gt` - Ground-truth coordinates, same layout
/// * `mask` - Joint validity, `n_samples * n_joints` values
/// * `norm` - Per-sample normalization factors, `n_samples * 2` values
pub fn pck_accuracy(
    pred: &[f32],
    gt: &[f32],
    mask: &[bool],
    norm: &[f32],
    n_samples: usize,
    n_joints: usize,
    threshold: f32,
) -> Result<PckResult> {
    let coords = n_samples * n_joints * 2;
    if pred.len() != coords || gt.len() != coords {
        return Err(Error::ShapeMismatch {
            expected: format!("{} coordinate values", coords),
            actual: format!("{} / {}", pred.len(), gt.len()),
        });
    }
    if mask.len() != n_samples * n_joints || norm.len() != n_samples * 2 {
        return Err(Error::ShapeMismatch {
            expected: format!("mask {} / norm {}", n_samples * n_joints, n_samples * 2),
            actual: format!("mask {} / norm {}", mask.len(), norm.len()),
        });
    }

    let mut per_joint = Vec::with_capacity(n_joints);
    let mut acc_sum = 0.0f32;
    let mut valid_joints = 0usize;

    for j in 0..n_joints {
        let mut correct = 0usize;
        let mut valid = 0usize;

        for s in 0..n_samples {
            if !mask[s * n_joints + j] {
                continue;
            }
            let (nx, ny) = (norm[s * 2], norm[s * 2 + 1]);
            if nx <= 0.0 || ny <= 0.0 {
                continue;
            }

            let base = (s * n_joints + j) * 2;
            let dx = (pred[base] - gt[base]) / nx;
            let dy = (pred[base + 1] - gt[base + 1]) / ny;

            valid += 1;
            if (dx * dx + dy * dy).sqrt() < threshold {
                correct += 1;
            }
        }

        if valid > 0 {
            let acc = correct as f32 / valid as f32;
            acc_sum += acc;
            valid_joints += 1;
            per_joint.push(Some(acc));
        } else {
            per_joint.push(None);
        }
    }

    let avg = if valid_joints > 0 {
        acc_sum / valid_joints as f32
    } else {
        0.0
    };

    Ok(PckResult {
        per_joint,
        avg,
        valid_joints,
    })
}
