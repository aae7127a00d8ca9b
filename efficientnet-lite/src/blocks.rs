//! MBConv stage layout and compound scaling rules.

use crate::variant::Variant;

pub const DEPTH_DIVISOR: usize = 8;
/// Stem and head widths are not scaled in the Lite family.
pub const STEM_FILTERS: usize = 32;
pub const HEAD_FILTERS: usize = 1280;
pub const BN_EPSILON: f32 = 1e-3;

/// One stage of the base (B0) network, before scaling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageArgs {
    pub repeats: usize,
    pub kernel: usize,
    pub stride: usize,
    pub expand_ratio: usize,
    pub filters_in: usize,
    pub filters_out: usize,
}

const fn stage(
    repeats: usize,
    kernel: usize,
    stride: usize,
    expand_ratio: usize,
    filters_in: usize,
    filters_out: usize,
) -> StageArgs {
    StageArgs { repeats, kernel, stride, expand_ratio, filters_in, filters_out }
}

pub const STAGES: [StageArgs; 7] = [
    stage(1, 3, 1, 1, 32, 16),
    stage(2, 3, 2, 6, 16, 24),
    stage(2, 5, 2, 6, 24, 40),
    stage(3, 3, 2, 6, 40, 80),
    stage(3, 5, 1, 6, 80, 112),
    stage(4, 5, 2, 6, 112, 192),
    stage(1, 3, 1, 6, 192, 320),
];

pub fn round_filters(filters: usize, width: f64) -> usize {
    let scaled = filters as f64 * width;
    let divisor = DEPTH_DIVISOR as f64;
    let mut rounded =
        (((scaled + divisor / 2.0) as usize) / DEPTH_DIVISOR * DEPTH_DIVISOR).max(DEPTH_DIVISOR);
    if (rounded as f64) < 0.9 * scaled {
        rounded += DEPTH_DIVISOR;
    }
    rounded
}

pub fn round_repeats(repeats: usize, depth: f64) -> usize {
    (depth * repeats as f64).ceil() as usize
}

/// A single MBConv block, after scaling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockSpec {
    /// Layer name prefix, `block1a_` style.
    pub prefix: String,
    pub kernel: usize,
    pub stride: usize,
    pub expand_ratio: usize,
    pub filters_in: usize,
    pub filters_out: usize,
}

impl BlockSpec {
    pub fn has_expansion(&self) -> bool {
        self.expand_ratio != 1
    }

    pub fn expanded_filters(&self) -> usize {
        self.filters_in * self.expand_ratio
    }

    pub fn has_residual(&self) -> bool {
        self.stride == 1 && self.filters_in == self.filters_out
    }
}

/// Expands the stage table for a variant. First and last stage keep their
/// repeat count, channel counts track the actual tensor widths.
pub fn blocks(variant: Variant) -> Vec<BlockSpec> {
    let params = variant.params();
    let mut blocks = vec![];
    let mut channels = STEM_FILTERS;
    for (ix, stage) in STAGES.iter().enumerate() {
        let filters_out = round_filters(stage.filters_out, params.width);
        let repeats = if ix == 0 || ix == STAGES.len() - 1 {
            stage.repeats
        } else {
            round_repeats(stage.repeats, params.depth)
        };
        for rep in 0..repeats {
            blocks.push(BlockSpec {
                prefix: format!("block{}{}_", ix + 1, (b'a' + rep as u8) as char),
                kernel: stage.kernel,
                stride: if rep == 0 { stage.stride } else { 1 },
                expand_ratio: stage.expand_ratio,
                filters_in: channels,
                filters_out,
            });
            channels = filters_out;
        }
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    fn stage_summary(variant: Variant) -> Vec<(usize, usize)> {
        blocks(variant)
            .iter()
            .group_by(|b| b.prefix.chars().nth(5).unwrap())
            .into_iter()
            .map(|(_, group)| {
                let group: Vec<_> = group.collect();
                (group.len(), group[0].filters_out)
            })
            .collect()
    }

    #[test]
    fn filter_rounding() {
        assert_eq!(round_filters(32, 1.0), 32);
        assert_eq!(round_filters(16, 1.1), 16);
        assert_eq!(round_filters(40, 1.1), 48);
        assert_eq!(round_filters(320, 1.2), 384);
        assert_eq!(round_filters(192, 1.4), 272);
        assert_eq!(round_filters(1, 1.0), 8);
    }

    #[test]
    fn repeat_rounding() {
        assert_eq!(round_repeats(2, 1.1), 3);
        assert_eq!(round_repeats(3, 1.2), 4);
        assert_eq!(round_repeats(4, 1.8), 8);
        assert_eq!(round_repeats(3, 1.0), 3);
    }

    #[test]
    fn b0_layout() {
        assert_eq!(
            stage_summary(Variant::B0),
            vec![(1, 16), (2, 24), (2, 40), (3, 80), (3, 112), (4, 192), (1, 320)]
        );
        assert_eq!(blocks(Variant::B0).len(), 16);
    }

    #[test]
    fn b4_layout() {
        assert_eq!(
            stage_summary(Variant::B4),
            vec![(1, 24), (4, 32), (4, 56), (6, 112), (6, 160), (8, 272), (1, 448)]
        );
    }

    #[test]
    fn block_naming_and_strides() {
        let blocks = blocks(Variant::B0);
        assert_eq!(blocks[0].prefix, "block1a_");
        assert_eq!(blocks[1].prefix, "block2a_");
        assert_eq!(blocks[2].prefix, "block2b_");
        assert_eq!(blocks[1].stride, 2);
        assert_eq!(blocks[2].stride, 1);
        assert!(!blocks[0].has_expansion());
        assert!(!blocks[1].has_residual());
        assert!(blocks[2].has_residual());
        assert_eq!(blocks[2].expanded_filters(), 144);
    }

    #[test]
    fn channels_chain() {
        for variant in Variant::ALL {
            let blocks = blocks(variant);
            assert_eq!(blocks[0].filters_in, STEM_FILTERS);
            for pair in blocks.windows(2) {
                assert_eq!(pair[0].filters_out, pair[1].filters_in);
            }
        }
    }
}
