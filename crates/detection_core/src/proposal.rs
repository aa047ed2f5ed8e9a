//! Decoding dense RPN outputs into a sparse, bounded set of proposals.

use serde::{Deserialize, Serialize};

use crate::bbox::{BoundingBox, ImageShape};
use crate::coder::{decode, BoxDelta};
use crate::error::{ConfigError, ShapeError};
use crate::nms::nms;

/// Thresholds and caps for the proposal stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalConfig {
    /// Score-ranked candidates kept before NMS; a performance cap.
    pub pre_nms_top_n: usize,
    /// Proposals emitted after NMS.
    pub post_nms_top_n: usize,
    pub nms_iou_threshold: f32,
    /// Minimum width/height of a proposal in image pixels.
    pub min_size: f32,
}

impl Default for ProposalConfig {
    fn default() -> Self {
        Self {
            pre_nms_top_n: 12_000,
            post_nms_top_n: 2_000,
            nms_iou_threshold: 0.7,
            min_size: 0.0,
        }
    }
}

impl ProposalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.nms_iou_threshold) || self.nms_iou_threshold.is_nan() {
            return Err(ConfigError::InvalidIouThreshold(self.nms_iou_threshold));
        }
        if !(self.min_size.is_finite() && self.min_size >= 0.0) {
            return Err(ConfigError::InvalidMinSize(self.min_size));
        }
        Ok(())
    }
}

/// A candidate object box with its foreground score. Always clipped to the
/// image and strictly positive in extent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Proposal {
    pub rect: BoundingBox,
    pub score: f32,
}

/// Converts per-anchor scores and regression deltas into proposals:
/// decode, clip, filter degenerates, rank, suppress.
#[derive(Debug, Clone)]
pub struct ProposalDecoder {
    config: ProposalConfig,
}

impl ProposalDecoder {
    pub fn new(config: ProposalConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ProposalConfig {
        &self.config
    }

    /// Runs the full decode pipeline. `scores`, `deltas` and `anchors` must
    /// be index-aligned; a length mismatch is a `ShapeError` at entry.
    ///
    /// An empty result is a valid outcome (all candidates degenerate, or the
    /// post-NMS cap is zero) and is propagated, not raised.
    pub fn decode(
        &self,
        scores: &[f32],
        deltas: &[BoxDelta],
        anchors: &[BoundingBox],
        image: ImageShape,
    ) -> Result<Vec<Proposal>, ShapeError> {
        if deltas.len() != anchors.len() {
            return Err(ShapeError::LengthMismatch {
                what: "regression deltas",
                expected: anchors.len(),
                actual: deltas.len(),
            });
        }
        if scores.len() != anchors.len() {
            return Err(ShapeError::LengthMismatch {
                what: "anchor scores",
                expected: anchors.len(),
                actual: scores.len(),
            });
        }

        let mut candidates: Vec<Proposal> = Vec::new();
        for ((anchor, delta), &score) in anchors.iter().zip(deltas).zip(scores) {
            let rect = decode(anchor, delta).clip(image);
            if rect.width() < self.config.min_size || rect.height() < self.config.min_size {
                continue;
            }
            if !rect.is_valid() {
                continue;
            }
            candidates.push(Proposal { rect, score });
        }

        if candidates.is_empty() {
            log::debug!("no proposal candidates survived decoding/filtering");
            return Ok(Vec::new());
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(self.config.pre_nms_top_n);

        let boxes: Vec<BoundingBox> = candidates.iter().map(|p| p.rect).collect();
        let box_scores: Vec<f32> = candidates.iter().map(|p| p.score).collect();
        let keep = nms(
            &boxes,
            &box_scores,
            self.config.nms_iou_threshold,
            Some(self.config.post_nms_top_n),
        );

        if keep.is_empty() {
            log::debug!("nms emitted no proposals (post_nms_top_n = {})", self.config.post_nms_top_n);
        }
        Ok(keep.into_iter().map(|i| candidates[i]).collect())
    }
}
