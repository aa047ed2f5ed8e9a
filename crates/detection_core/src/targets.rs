//! Positive/negative/ignore labeling of candidates against ground truth.
//!
//! The same assignment algorithm supervises both stages: anchors for the RPN
//! and proposals for the classifier head, differing only in thresholds and
//! sampling caps.

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::bbox::{BoundingBox, GtBox};
use crate::coder::{encode, BoxDelta};
use crate::error::ConfigError;

/// Supervision state of a candidate box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Positive,
    Negative,
    /// Excluded from the loss entirely.
    Ignore,
}

/// Assignment result for one candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssignedTarget {
    pub label: Label,
    /// Index into the ground-truth set; present exactly for positives.
    pub matched_gt: Option<usize>,
    /// Regression target toward the matched ground truth; present exactly
    /// for positives.
    pub delta: Option<BoxDelta>,
}

impl AssignedTarget {
    fn negative() -> Self {
        Self {
            label: Label::Negative,
            matched_gt: None,
            delta: None,
        }
    }
}

/// IoU thresholds and sampling caps for target assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignerConfig {
    /// Candidates whose best IoU reaches this are positive.
    pub positive_iou: f32,
    /// Candidates whose best IoU stays below this are negative.
    pub negative_iou: f32,
    /// Cap on positives; surplus positives are demoted to ignore by uniform
    /// sampling. `None` keeps all of them.
    pub max_positives: Option<usize>,
    /// Cap on negatives as a multiple of the positive count; surplus
    /// negatives are demoted to ignore. `None` keeps all of them.
    pub negative_ratio: Option<f32>,
}

impl Default for AssignerConfig {
    fn default() -> Self {
        Self {
            positive_iou: 0.7,
            negative_iou: 0.3,
            max_positives: None,
            negative_ratio: None,
        }
    }
}

impl AssignerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for &t in [&self.positive_iou, &self.negative_iou] {
            if !(0.0..=1.0).contains(&t) || t.is_nan() {
                return Err(ConfigError::InvalidIouThreshold(t));
            }
        }
        if self.negative_iou > self.positive_iou {
            return Err(ConfigError::InvertedIouThresholds {
                positive: self.positive_iou,
                negative: self.negative_iou,
            });
        }
        if let Some(r) = self.negative_ratio {
            if !(r.is_finite() && r > 0.0) {
                return Err(ConfigError::InvalidNegativeRatio(r));
            }
        }
        Ok(())
    }
}

/// Labels candidate boxes against ground truth and computes regression
/// targets for the positives.
#[derive(Debug, Clone)]
pub struct TargetAssigner {
    config: AssignerConfig,
}

impl TargetAssigner {
    pub fn new(config: AssignerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AssignerConfig {
        &self.config
    }

    /// Assigns a label to every candidate.
    ///
    /// Every ground-truth box forces its best-IoU candidate positive, so each
    /// gt has at least one supervising candidate even when no candidate
    /// reaches `positive_iou`. With an empty ground-truth set all candidates
    /// come back negative. Subsampling draws from the injected RNG only, so a
    /// fixed seed reproduces the exact assignment.
    pub fn assign(
        &self,
        candidates: &[BoundingBox],
        gt: &[GtBox],
        rng: &mut StdRng,
    ) -> Vec<AssignedTarget> {
        if gt.is_empty() {
            log::warn!(
                "assigning {} candidates with no ground truth; all negative",
                candidates.len()
            );
            return vec![AssignedTarget::negative(); candidates.len()];
        }
        if candidates.is_empty() {
            return Vec::new();
        }

        // Best match per candidate across the full IoU matrix.
        let mut best_iou = vec![0.0f32; candidates.len()];
        let mut best_gt = vec![0usize; candidates.len()];
        // Best candidate per ground-truth box.
        let mut gt_best_iou = vec![-1.0f32; gt.len()];
        let mut gt_best_candidate = vec![0usize; gt.len()];

        for (c, candidate) in candidates.iter().enumerate() {
            for (g, gt_box) in gt.iter().enumerate() {
                let iou = candidate.iou(&gt_box.rect);
                if iou > best_iou[c] {
                    best_iou[c] = iou;
                    best_gt[c] = g;
                }
                if iou > gt_best_iou[g] {
                    gt_best_iou[g] = iou;
                    gt_best_candidate[g] = c;
                }
            }
        }

        let mut targets: Vec<AssignedTarget> = (0..candidates.len())
            .map(|c| {
                if best_iou[c] >= self.config.positive_iou {
                    AssignedTarget {
                        label: Label::Positive,
                        matched_gt: Some(best_gt[c]),
                        delta: None,
                    }
                } else if best_iou[c] < self.config.negative_iou {
                    AssignedTarget::negative()
                } else {
                    AssignedTarget {
                        label: Label::Ignore,
                        matched_gt: None,
                        delta: None,
                    }
                }
            })
            .collect();

        // Force the best candidate of each gt positive, matched to the gt
        // that claimed it.
        for (g, &c) in gt_best_candidate.iter().enumerate() {
            let replace = match targets[c].matched_gt {
                Some(current) => gt[g].rect.iou(&candidates[c]) >= candidates[c].iou(&gt[current].rect),
                None => true,
            };
            if replace {
                targets[c] = AssignedTarget {
                    label: Label::Positive,
                    matched_gt: Some(g),
                    delta: None,
                };
            }
        }

        self.subsample(&mut targets, rng);

        for (c, target) in targets.iter_mut().enumerate() {
            if let (Label::Positive, Some(g)) = (target.label, target.matched_gt) {
                target.delta = Some(encode(&candidates[c], &gt[g].rect));
            }
        }
        targets
    }

    /// Demotes surplus positives/negatives to ignore, keeping the loss from
    /// being dominated by the majority class. A sampling policy only;
    /// correctness of the labels above does not depend on it.
    fn subsample(&self, targets: &mut [AssignedTarget], rng: &mut StdRng) {
        if let Some(cap) = self.config.max_positives {
            let positives: Vec<usize> = indices_with_label(targets, Label::Positive);
            demote_surplus(targets, &positives, cap, rng);
        }
        if let Some(ratio) = self.config.negative_ratio {
            let positive_count = indices_with_label(targets, Label::Positive).len();
            let allowed = ((positive_count as f32 * ratio).ceil() as usize).max(1);
            let negatives: Vec<usize> = indices_with_label(targets, Label::Negative);
            demote_surplus(targets, &negatives, allowed, rng);
        }
    }
}

fn indices_with_label(targets: &[AssignedTarget], label: Label) -> Vec<usize> {
    targets
        .iter()
        .enumerate()
        .filter(|(_, t)| t.label == label)
        .map(|(i, _)| i)
        .collect()
}

/// Keeps `cap` uniformly sampled entries of `pool` and flips the rest to
/// ignore.
fn demote_surplus(
    targets: &mut [AssignedTarget],
    pool: &[usize],
    cap: usize,
    rng: &mut StdRng,
) {
    if pool.len() <= cap {
        return;
    }
    let mut keep = vec![false; pool.len()];
    for k in rand::seq::index::sample(rng, pool.len(), cap) {
        keep[k] = true;
    }
    for (k, &idx) in pool.iter().enumerate() {
        if !keep[k] {
            targets[idx] = AssignedTarget {
                label: Label::Ignore,
                matched_gt: None,
                delta: None,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn assigner(config: AssignerConfig) -> TargetAssigner {
        TargetAssigner::new(config).unwrap()
    }

    fn gt_at(x: f32, y: f32, size: f32) -> GtBox {
        GtBox {
            rect: BoundingBox::new(x, y, x + size, y + size),
            class: 1,
        }
    }

    #[test]
    fn high_overlap_is_positive_low_is_negative() {
        let a = assigner(AssignerConfig::default());
        let candidates = vec![
            BoundingBox::new(0.0, 0.0, 10.0, 10.0),   // IoU 1.0
            BoundingBox::new(100.0, 100.0, 110.0, 110.0), // IoU 0.0
        ];
        let gt = vec![gt_at(0.0, 0.0, 10.0)];
        let targets = a.assign(&candidates, &gt, &mut rng());
        assert_eq!(targets[0].label, Label::Positive);
        assert_eq!(targets[0].matched_gt, Some(0));
        assert!(targets[0].delta.is_some());
        assert_eq!(targets[1].label, Label::Negative);
        assert!(targets[1].delta.is_none());
    }

    #[test]
    fn intermediate_overlap_is_ignored() {
        let a = assigner(AssignerConfig::default());
        // IoU against the gt is ~0.39: between the 0.3/0.7 thresholds.
        let candidates = vec![
            BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            BoundingBox::new(4.0, 0.0, 14.0, 10.0),
        ];
        let gt = vec![gt_at(0.0, 0.0, 10.0)];
        let targets = a.assign(&candidates, &gt, &mut rng());
        assert_eq!(targets[1].label, Label::Ignore);
    }

    #[test]
    fn best_candidate_is_forced_positive_below_threshold() {
        let a = assigner(AssignerConfig::default());
        // Nobody reaches positive_iou, but the closest candidate must still
        // supervise the gt box.
        let candidates = vec![
            BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            BoundingBox::new(30.0, 30.0, 40.0, 40.0),
        ];
        let gt = vec![gt_at(8.0, 8.0, 10.0)];
        let targets = a.assign(&candidates, &gt, &mut rng());
        assert_eq!(targets[0].label, Label::Positive);
        assert_eq!(targets[0].matched_gt, Some(0));
    }

    #[test]
    fn empty_ground_truth_labels_everything_negative() {
        let a = assigner(AssignerConfig::default());
        let candidates = vec![
            BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            BoundingBox::new(5.0, 5.0, 15.0, 15.0),
        ];
        let targets = a.assign(&candidates, &[], &mut rng());
        assert!(targets.iter().all(|t| t.label == Label::Negative));
    }

    #[test]
    fn positive_delta_decodes_back_to_gt() {
        let a = assigner(AssignerConfig::default());
        let candidates = vec![BoundingBox::new(0.0, 0.0, 10.0, 10.0)];
        let gt = vec![gt_at(1.0, 1.0, 10.0)];
        let targets = a.assign(&candidates, &gt, &mut rng());
        let delta = targets[0].delta.unwrap();
        let decoded = crate::coder::decode(&candidates[0], &delta);
        assert!((decoded.x1 - 1.0).abs() < 1e-4);
        assert!((decoded.y2 - 11.0).abs() < 1e-4);
    }

    #[test]
    fn positive_cap_demotes_surplus_to_ignore() {
        let config = AssignerConfig {
            max_positives: Some(1),
            ..AssignerConfig::default()
        };
        let a = assigner(config);
        let candidates = vec![
            BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            BoundingBox::new(0.5, 0.0, 10.5, 10.0),
        ];
        let gt = vec![gt_at(0.0, 0.0, 10.0)];
        let targets = a.assign(&candidates, &gt, &mut rng());
        let positives = targets.iter().filter(|t| t.label == Label::Positive).count();
        assert_eq!(positives, 1);
    }

    #[test]
    fn negative_ratio_caps_negatives() {
        let config = AssignerConfig {
            negative_ratio: Some(2.0),
            ..AssignerConfig::default()
        };
        let a = assigner(config);
        let mut candidates = vec![BoundingBox::new(0.0, 0.0, 10.0, 10.0)];
        for i in 0..10 {
            let off = 100.0 + 20.0 * i as f32;
            candidates.push(BoundingBox::new(off, off, off + 10.0, off + 10.0));
        }
        let gt = vec![gt_at(0.0, 0.0, 10.0)];
        let targets = a.assign(&candidates, &gt, &mut rng());
        let negatives = targets.iter().filter(|t| t.label == Label::Negative).count();
        assert_eq!(negatives, 2);
    }

    #[test]
    fn subsampling_is_deterministic_under_a_fixed_seed() {
        let config = AssignerConfig {
            negative_ratio: Some(1.0),
            ..AssignerConfig::default()
        };
        let a = assigner(config);
        let candidates: Vec<BoundingBox> = (0..20)
            .map(|i| {
                let off = 100.0 + 15.0 * i as f32;
                BoundingBox::new(off, off, off + 10.0, off + 10.0)
            })
            .chain(std::iter::once(BoundingBox::new(0.0, 0.0, 10.0, 10.0)))
            .collect();
        let gt = vec![gt_at(0.0, 0.0, 10.0)];

        let first = a.assign(&candidates, &gt, &mut StdRng::seed_from_u64(99));
        let second = a.assign(&candidates, &gt, &mut StdRng::seed_from_u64(99));
        assert_eq!(first, second);
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let config = AssignerConfig {
            positive_iou: 0.3,
            negative_iou: 0.7,
            ..AssignerConfig::default()
        };
        assert!(matches!(
            TargetAssigner::new(config),
            Err(ConfigError::InvertedIouThresholds { .. })
        ));
    }
}
