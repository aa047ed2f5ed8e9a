//! The two-stage orchestrator: backbone -> anchors -> RPN -> proposals ->
//! ROI pooling -> classifier head, with a weighted joint loss.
//!
//! The orchestrator owns no learned parameters of its own; it composes the
//! heads (which own theirs) with the geometry pipeline from
//! `detection_core`. Anchors are regenerated from the feature-map shape on
//! every pass, so independent forward passes share no state.

use burn::tensor::{backend::Backend, Tensor};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use detection_core::targets::{AssignedTarget, Label};
use detection_core::{
    decode, nms, AnchorConfig, AnchorGenerator, AssignerConfig, BoundingBox, ConfigError, GtBox,
    ImageShape, Proposal, ProposalConfig, ProposalDecoder, ShapeError, TargetAssigner,
};

use crate::backbone::Backbone;
use crate::rcnn::{rcnn_loss, RcnnHead, RcnnHeadConfig, RcnnOutput, RcnnTarget};
use crate::roi_pool::{RoiPool, RoiPoolConfig};
use crate::rpn::{rpn_loss, RpnHead, RpnHeadConfig, RpnOutput};

/// Multipliers combining the four component losses into one scalar.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LossWeights {
    pub rpn_cls: f32,
    pub rpn_reg: f32,
    pub rcnn_cls: f32,
    pub rcnn_reg: f32,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            rpn_cls: 1.0,
            rpn_reg: 2.0,
            rcnn_cls: 1.0,
            rcnn_reg: 2.0,
        }
    }
}

impl LossWeights {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for &w in [&self.rpn_cls, &self.rpn_reg, &self.rcnn_cls, &self.rcnn_reg] {
            if !(w.is_finite() && w >= 0.0) {
                return Err(ConfigError::InvalidLossWeight(w));
            }
        }
        Ok(())
    }
}

/// Full configuration surface of the detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FasterRcnnConfig {
    /// Foreground classes; background is added by the classifier head.
    pub num_classes: usize,
    /// Channel count of the backbone feature map.
    pub feature_channels: usize,
    pub anchors: AnchorConfig,
    pub proposals: ProposalConfig,
    pub rpn_mid_channels: usize,
    pub rpn_assigner: AssignerConfig,
    pub rcnn_assigner: AssignerConfig,
    pub pooled_size: [usize; 2],
    pub rcnn_hidden: usize,
    pub loss_weights: LossWeights,
    /// Minimum class probability for a final detection.
    pub score_threshold: f32,
    /// IoU threshold for the per-class NMS over final detections.
    pub detection_nms_iou: f32,
    pub max_detections: usize,
}

impl Default for FasterRcnnConfig {
    fn default() -> Self {
        Self {
            num_classes: 20,
            feature_channels: 512,
            anchors: AnchorConfig::default(),
            proposals: ProposalConfig::default(),
            rpn_mid_channels: 512,
            rpn_assigner: AssignerConfig {
                max_positives: Some(128),
                negative_ratio: Some(1.0),
                ..AssignerConfig::default()
            },
            rcnn_assigner: AssignerConfig {
                positive_iou: 0.5,
                negative_iou: 0.1,
                max_positives: Some(64),
                negative_ratio: Some(3.0),
            },
            pooled_size: [7, 7],
            rcnn_hidden: 1024,
            loss_weights: LossWeights::default(),
            score_threshold: 0.05,
            detection_nms_iou: 0.5,
            max_detections: 100,
        }
    }
}

impl FasterRcnnConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_classes == 0 {
            return Err(ConfigError::NoClasses);
        }
        if self.feature_channels == 0 {
            return Err(ConfigError::NoFeatureChannels);
        }
        self.anchors.validate()?;
        self.proposals.validate()?;
        self.rpn_assigner.validate()?;
        self.rcnn_assigner.validate()?;
        self.loss_weights.validate()?;
        if self.pooled_size[0] == 0 || self.pooled_size[1] == 0 {
            return Err(ConfigError::InvalidPooledSize);
        }
        if !(0.0..=1.0).contains(&self.score_threshold) || self.score_threshold.is_nan() {
            return Err(ConfigError::InvalidScoreThreshold(self.score_threshold));
        }
        if !(0.0..=1.0).contains(&self.detection_nms_iou) || self.detection_nms_iou.is_nan() {
            return Err(ConfigError::InvalidIouThreshold(self.detection_nms_iou));
        }
        Ok(())
    }
}

/// Everything one forward pass produced. Rebuilt per pass, never persisted.
#[derive(Debug, Clone)]
pub struct PredictionBundle<B: Backend> {
    pub feature_shape: [usize; 4],
    pub image: ImageShape,
    pub anchors: Vec<BoundingBox>,
    pub rpn: RpnOutput<B>,
    pub rpn_targets: Vec<AssignedTarget>,
    pub proposals: Vec<Proposal>,
    /// `None` when no proposals survived the proposal stage.
    pub pooled: Option<Tensor<B, 4>>,
    pub rcnn: Option<RcnnOutput<B>>,
    pub rcnn_targets: Vec<RcnnTarget>,
    pub gt: Vec<GtBox>,
}

/// A final detection after per-class refinement and NMS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub rect: BoundingBox,
    /// 1-based foreground class id.
    pub class: u32,
    pub score: f32,
}

pub struct FasterRcnn<B: Backend> {
    backbone: Box<dyn Backbone<B>>,
    rpn: RpnHead<B>,
    roi_pool: RoiPool,
    rcnn: RcnnHead<B>,
    anchor_gen: AnchorGenerator,
    proposal_decoder: ProposalDecoder,
    rpn_assigner: TargetAssigner,
    rcnn_assigner: TargetAssigner,
    weights: LossWeights,
    score_threshold: f32,
    detection_nms_iou: f32,
    max_detections: usize,
}

impl<B: Backend> FasterRcnn<B> {
    pub fn new(
        config: FasterRcnnConfig,
        backbone: Box<dyn Backbone<B>>,
        device: &B::Device,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if backbone.out_channels() != config.feature_channels {
            return Err(ConfigError::BackboneChannelMismatch {
                expected: config.feature_channels,
                actual: backbone.out_channels(),
            });
        }
        if backbone.stride() != config.anchors.stride {
            return Err(ConfigError::BackboneStrideMismatch {
                expected: config.anchors.stride,
                actual: backbone.stride(),
            });
        }

        let anchor_gen = AnchorGenerator::new(&config.anchors)?;
        let rpn = RpnHead::new(
            &RpnHeadConfig {
                in_channels: config.feature_channels,
                mid_channels: config.rpn_mid_channels,
                num_anchors: anchor_gen.num_reference(),
            },
            device,
        );
        let roi_pool = RoiPool::new(&RoiPoolConfig {
            output_size: config.pooled_size,
        })?;
        let in_features =
            config.feature_channels * config.pooled_size[0] * config.pooled_size[1];
        let rcnn = RcnnHead::new(
            &RcnnHeadConfig {
                in_features,
                hidden: config.rcnn_hidden,
                num_classes: config.num_classes,
            },
            device,
        )?;

        Ok(Self {
            backbone,
            rpn,
            roi_pool,
            rcnn,
            anchor_gen,
            proposal_decoder: ProposalDecoder::new(config.proposals)?,
            rpn_assigner: TargetAssigner::new(config.rpn_assigner)?,
            rcnn_assigner: TargetAssigner::new(config.rcnn_assigner)?,
            weights: config.loss_weights,
            score_threshold: config.score_threshold,
            detection_nms_iou: config.detection_nms_iou,
            max_detections: config.max_detections,
        })
    }

    /// The learned heads, exposed so the external training loop can apply
    /// gradients; the orchestrator never mutates them itself.
    pub fn rpn_head(&self) -> &RpnHead<B> {
        &self.rpn
    }

    pub fn rcnn_head(&self) -> &RcnnHead<B> {
        &self.rcnn
    }

    /// One training forward pass over a batch-of-one image.
    ///
    /// Empty intermediate sets (no surviving proposals, no ground truth) are
    /// propagated as empty outputs, never as errors. The RNG drives target
    /// subsampling only; a fixed seed makes the pass deterministic.
    pub fn forward(
        &self,
        image: Tensor<B, 4>,
        gt: &[GtBox],
        rng: &mut StdRng,
    ) -> Result<PredictionBundle<B>, ShapeError> {
        let [batch, _, img_h, img_w] = image.dims();
        if batch != 1 {
            return Err(ShapeError::BatchSize(batch));
        }
        // Class ids index one-hot rows and per-class delta slices downstream,
        // so an out-of-range id is rejected here rather than deep in the loss.
        let num_classes = self.rcnn.num_classes();
        for g in gt {
            if g.class == 0 || g.class as usize > num_classes {
                return Err(ShapeError::ClassOutOfRange {
                    class: g.class,
                    num_classes,
                });
            }
        }
        let image_shape = ImageShape::new(img_w as f32, img_h as f32);

        let features = self.backbone.features(image);
        let feature_shape = features.dims();
        let [_, _, grid_h, grid_w] = feature_shape;

        let anchors = self.anchor_gen.tile(grid_w, grid_h);
        let rpn_out = self.rpn.forward(features.clone())?;
        let proposals = self.proposal_decoder.decode(
            &rpn_out.scores(),
            &rpn_out.deltas_host(),
            &anchors,
            image_shape,
        )?;
        let rpn_targets = self.rpn_assigner.assign(&anchors, gt, rng);

        let pooled = self
            .roi_pool
            .forward(&features, &proposals, self.anchor_gen.stride())?;
        let (rcnn_out, rcnn_targets) = match &pooled {
            Some(blocks) => {
                let out = self.rcnn.forward(blocks.clone())?;
                let rects: Vec<BoundingBox> = proposals.iter().map(|p| p.rect).collect();
                let assigned = self.rcnn_assigner.assign(&rects, gt, rng);
                let targets = assigned
                    .iter()
                    .map(|t| match t.label {
                        Label::Positive => RcnnTarget {
                            class: t.matched_gt.map(|g| gt[g].class as usize).unwrap_or(0),
                            ignore: false,
                            delta: t.delta,
                        },
                        Label::Negative => RcnnTarget {
                            class: 0,
                            ignore: false,
                            delta: None,
                        },
                        Label::Ignore => RcnnTarget {
                            class: 0,
                            ignore: true,
                            delta: None,
                        },
                    })
                    .collect();
                (Some(out), targets)
            }
            None => (None, Vec::new()),
        };

        Ok(PredictionBundle {
            feature_shape,
            image: image_shape,
            anchors,
            rpn: rpn_out,
            rpn_targets,
            proposals,
            pooled,
            rcnn: rcnn_out,
            rcnn_targets,
            gt: gt.to_vec(),
        })
    }

    /// Weighted joint loss over one bundle. Stages with empty inputs
    /// contribute zero rather than failing.
    pub fn loss(&self, bundle: &PredictionBundle<B>) -> Result<Tensor<B, 1>, ShapeError> {
        let rpn = rpn_loss(&bundle.rpn, &bundle.rpn_targets)?;
        let device = rpn.cls.device();
        let (rcnn_cls, rcnn_reg) = match &bundle.rcnn {
            Some(out) => {
                let l = rcnn_loss(out, &bundle.rcnn_targets)?;
                (l.cls, l.reg)
            }
            None => (
                Tensor::zeros([1], &device),
                Tensor::zeros([1], &device),
            ),
        };

        Ok(rpn.cls * self.weights.rpn_cls
            + rpn.reg * self.weights.rpn_reg
            + rcnn_cls * self.weights.rcnn_cls
            + rcnn_reg * self.weights.rcnn_reg)
    }

    /// Inference path: proposal stage, classifier stage, then the final
    /// refinement — decode the winning class's delta against each proposal,
    /// clip, drop background/low scores, and run per-class NMS.
    pub fn detect(&self, image: Tensor<B, 4>) -> Result<Vec<Detection>, ShapeError> {
        let [batch, _, img_h, img_w] = image.dims();
        if batch != 1 {
            return Err(ShapeError::BatchSize(batch));
        }
        let image_shape = ImageShape::new(img_w as f32, img_h as f32);

        let features = self.backbone.features(image);
        let [_, _, grid_h, grid_w] = features.dims();
        let anchors = self.anchor_gen.tile(grid_w, grid_h);
        let rpn_out = self.rpn.forward(features.clone())?;
        let proposals = self.proposal_decoder.decode(
            &rpn_out.scores(),
            &rpn_out.deltas_host(),
            &anchors,
            image_shape,
        )?;

        let pooled = match self
            .roi_pool
            .forward(&features, &proposals, self.anchor_gen.stride())?
        {
            Some(blocks) => blocks,
            None => return Ok(Vec::new()),
        };
        let out = self.rcnn.forward(pooled)?;

        let probs = out.probs_host();
        let deltas = out.deltas_host();
        let classes = out.num_classes() + 1;

        let mut picked: Vec<Detection> = Vec::new();
        for (i, proposal) in proposals.iter().enumerate() {
            let row = &probs[i * classes..(i + 1) * classes];
            let mut best_class = 0usize;
            let mut best_score = 0.0f32;
            for (c, &p) in row.iter().enumerate().skip(1) {
                if p > best_score {
                    best_score = p;
                    best_class = c;
                }
            }
            if best_class == 0 || best_score < self.score_threshold {
                continue;
            }
            let rect = decode(&proposal.rect, &deltas[i * classes + best_class]).clip(image_shape);
            if !rect.is_valid() {
                continue;
            }
            picked.push(Detection {
                rect,
                class: best_class as u32,
                score: best_score,
            });
        }

        let mut kept: Vec<Detection> = Vec::new();
        for class in 1..classes {
            let class_dets: Vec<&Detection> = picked
                .iter()
                .filter(|d| d.class as usize == class)
                .collect();
            if class_dets.is_empty() {
                continue;
            }
            let boxes: Vec<BoundingBox> = class_dets.iter().map(|d| d.rect).collect();
            let scores: Vec<f32> = class_dets.iter().map(|d| d.score).collect();
            for k in nms(&boxes, &scores, self.detection_nms_iou, None) {
                kept.push(*class_dets[k]);
            }
        }
        kept.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        kept.truncate(self.max_detections);
        Ok(kept)
    }
}
