//! Declarative backbone-freezing partition.
//!
//! Instead of imperatively toggling trainability layer by layer, the
//! parameter set is partitioned once at construction time from a
//! static policy: freeze everything under the backbone prefix except
//! its last N blocks and final normalization. The optimizer receives
//! only the trainable side; the frozen side is never mutated.

use candle_core::Var;
use candle_nn::VarMap;

use tempose_core::FreezePolicy;

/// Variable-name prefix under which backbone parameters live.
pub const BACKBONE_PREFIX: &str = "backbone";

/// Trainable/frozen split of a model's parameters.
pub struct ParamPartition {
    pub trainable: Vec<Var>,
    pub frozen: Vec<Var>,
}

impl ParamPartition {
    pub fn trainable_count(&self) -> usize {
        self.trainable.iter().map(|v| v.elem_count()).sum()
    }

    pub fn frozen_count(&self) -> usize {
        self.frozen.iter().map(|v| v.elem_count()).sum()
    }
}

/// Block index of a backbone variable named like
/// `backbone.blocks.{i}.rest`, if any.
fn block_index(name: &str) -> Option<usize> {
    let rest = name.strip_prefix(BACKBONE_PREFIX)?.strip_prefix('.')?;
    let rest = rest.strip_prefix("blocks.")?;
    rest.split('.').next()?.parse().ok()
}

/// Pure function from the variable set and a policy to a parameter
/// partition.
///
/// With `freeze_backbone` set, a backbone variable stays trainable
/// only if it belongs to one of the last `trainable_tail_blocks`
/// blocks or to the backbone's final norm; all head parameters are
/// always trainable.
pub fn partition_params(varmap: &VarMap, policy: &FreezePolicy) -> ParamPartition {
    let data = varmap.data().lock().unwrap();

    let max_block = data.keys().filter_map(|name| block_index(name)).max();

    let mut trainable = Vec::new();
    let mut frozen = Vec::new();

    for (name, var) in data.iter() {
        let freeze = policy.freeze_backbone
            && name.starts_with(BACKBONE_PREFIX)
            && !is_trainable_backbone_var(name, max_block, policy.trainable_tail_blocks);

        if freeze {
            frozen.push(var.clone());
        } else {
            trainable.push(var.clone());
        }
    }

    tracing::debug!(
        trainable = trainable.len(),
        frozen = frozen.len(),
        "parameter partition computed"
    );

    ParamPartition { trainable, frozen }
}

fn is_trainable_backbone_var(name: &str, max_block: Option<usize>, tail: usize) -> bool {
    if name.starts_with("backbone.norm") {
        return true;
    }
    match (block_index(name), max_block) {
        (Some(idx), Some(max)) => idx + tail > max,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    fn varmap_with(names: &[&str]) -> VarMap {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        for name in names {
            vb.get_with_hints(4, name, Init::Const(0.0)).unwrap();
        }
        varmap
    }

    #[test]
    fn test_tail_blocks_stay_trainable() {
        let varmap = varmap_with(&[
            "backbone.blocks.0.weight",
            "backbone.blocks.5.weight",
            "backbone.blocks.11.weight",
            "backbone.norm.weight",
            "backbone.patch_embed.weight",
            "head.mixer.layer_0.norm.weight",
        ]);

        let policy = FreezePolicy {
            freeze_backbone: true,
            trainable_tail_blocks: 4,
        };
        let partition = partition_params(&varmap, &policy);

        // Blocks 8..=11 trainable: here only block 11 exists in that
        // range, plus the final norm and the head.
        assert_eq!(partition.trainable.len(), 3);
        assert_eq!(partition.frozen.len(), 3);
    }

    #[test]
    fn test_no_freezing_when_disabled() {
        let varmap = varmap_with(&["backbone.blocks.0.weight", "head.decoder.final.weight"]);

        let policy = FreezePolicy {
            freeze_backbone: false,
            trainable_tail_blocks: 0,
        };
        let partition = partition_params(&varmap, &policy);

        assert_eq!(partition.frozen.len(), 0);
        assert_eq!(partition.trainable.len(), 2);
    }

    #[test]
    fn test_block_index_parsing() {
        assert_eq!(block_index("backbone.blocks.7.attn.weight"), Some(7));
        assert_eq!(block_index("backbone.patch_embed.weight"), None);
        assert_eq!(block_index("head.blocks.7.weight"), None);
    }
}
