//! Region Proposal Network head.
//!
//! A 3x3 convolutional trunk over the backbone feature map feeding two 1x1
//! heads: per-anchor objectness logits and per-anchor box regression deltas.
//! Outputs are flattened cell-major (rows top to bottom, x fastest, anchor
//! index within the cell) so that position `i` lines up with anchor `i` from
//! [`detection_core::AnchorGenerator::tile`].

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::tensor::activation::{relu, sigmoid};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use serde::{Deserialize, Serialize};

use detection_core::targets::{AssignedTarget, Label};
use detection_core::{BoxDelta, ShapeError};

use crate::loss::{smooth_l1, weighted_bce_with_logits};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpnHeadConfig {
    pub in_channels: usize,
    pub mid_channels: usize,
    pub num_anchors: usize,
}

impl Default for RpnHeadConfig {
    fn default() -> Self {
        Self {
            in_channels: 512,
            mid_channels: 512,
            num_anchors: 9,
        }
    }
}

#[derive(Module, Debug)]
pub struct RpnHead<B: Backend> {
    trunk: Conv2d<B>,
    objectness: Conv2d<B>,
    regression: Conv2d<B>,
    in_channels: usize,
    num_anchors: usize,
}

impl<B: Backend> RpnHead<B> {
    pub fn new(config: &RpnHeadConfig, device: &B::Device) -> Self {
        let trunk = Conv2dConfig::new([config.in_channels, config.mid_channels], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);
        let objectness =
            Conv2dConfig::new([config.mid_channels, config.num_anchors], [1, 1]).init(device);
        // Regression channels are grouped per anchor: channel a*4 + d holds
        // component d of anchor a's delta.
        let regression =
            Conv2dConfig::new([config.mid_channels, 4 * config.num_anchors], [1, 1]).init(device);
        Self {
            trunk,
            objectness,
            regression,
            in_channels: config.in_channels,
            num_anchors: config.num_anchors,
        }
    }

    /// Runs the head over a batch-of-one feature map and flattens the dense
    /// outputs into anchor order.
    pub fn forward(&self, features: Tensor<B, 4>) -> Result<RpnOutput<B>, ShapeError> {
        let [batch, channels, height, width] = features.dims();
        if batch != 1 {
            return Err(ShapeError::BatchSize(batch));
        }
        if channels != self.in_channels {
            return Err(ShapeError::ChannelMismatch {
                what: "rpn feature map",
                expected: self.in_channels,
                actual: channels,
            });
        }
        if height == 0 || width == 0 {
            return Err(ShapeError::EmptySpatialExtent { height, width });
        }

        let x = relu(self.trunk.forward(features));
        let logits = self.objectness.forward(x.clone());
        let deltas = self.regression.forward(x);

        let total = height * width * self.num_anchors;
        // NCHW -> NHWC before flattening puts cells first, anchors within
        // cell, matching the tiled anchor ordering.
        let logits = logits.permute([0, 2, 3, 1]).reshape([total]);
        let deltas = deltas.permute([0, 2, 3, 1]).reshape([total, 4]);

        Ok(RpnOutput {
            logits,
            deltas,
            grid_width: width,
            grid_height: height,
        })
    }
}

/// Dense RPN predictions in anchor order.
#[derive(Debug, Clone)]
pub struct RpnOutput<B: Backend> {
    /// Objectness logits, one per anchor.
    pub logits: Tensor<B, 1>,
    /// Regression deltas, `[num_anchors_total, 4]`.
    pub deltas: Tensor<B, 2>,
    pub grid_width: usize,
    pub grid_height: usize,
}

impl<B: Backend> RpnOutput<B> {
    pub fn num_anchors(&self) -> usize {
        self.logits.dims()[0]
    }

    /// Foreground scores on the host, for the proposal decoder.
    pub fn scores(&self) -> Vec<f32> {
        sigmoid(self.logits.clone())
            .into_data()
            .to_vec::<f32>()
            .expect("objectness logits hold f32 elements")
    }

    /// Regression deltas on the host, index-aligned with [`Self::scores`].
    pub fn deltas_host(&self) -> Vec<BoxDelta> {
        self.deltas
            .clone()
            .into_data()
            .to_vec::<f32>()
            .expect("regression deltas hold f32 elements")
            .chunks_exact(4)
            .map(|c| BoxDelta {
                dx: c[0],
                dy: c[1],
                dw: c[2],
                dh: c[3],
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct RpnLoss<B: Backend> {
    pub cls: Tensor<B, 1>,
    pub reg: Tensor<B, 1>,
}

/// Supervises the dense outputs against assigned anchor targets: binary
/// cross-entropy over non-ignored anchors, smooth-L1 over positive anchors
/// normalized by the positive count. With no positives the regression term
/// is exactly zero.
pub fn rpn_loss<B: Backend>(
    output: &RpnOutput<B>,
    targets: &[AssignedTarget],
) -> Result<RpnLoss<B>, ShapeError> {
    let n = output.num_anchors();
    if targets.len() != n {
        return Err(ShapeError::LengthMismatch {
            what: "anchor targets",
            expected: n,
            actual: targets.len(),
        });
    }
    let device = output.logits.device();

    let mut cls_target = vec![0.0f32; n];
    let mut cls_weight = vec![0.0f32; n];
    let mut reg_target = vec![0.0f32; n * 4];
    let mut reg_weight = vec![0.0f32; n * 4];
    for (i, t) in targets.iter().enumerate() {
        match t.label {
            Label::Positive => {
                cls_target[i] = 1.0;
                cls_weight[i] = 1.0;
                if let Some(d) = t.delta {
                    reg_target[i * 4..i * 4 + 4].copy_from_slice(&[d.dx, d.dy, d.dw, d.dh]);
                    reg_weight[i * 4..i * 4 + 4].copy_from_slice(&[1.0; 4]);
                }
            }
            Label::Negative => cls_weight[i] = 1.0,
            Label::Ignore => {}
        }
    }

    let cls_target = Tensor::<B, 1>::from_data(TensorData::new(cls_target, [n]), &device);
    let cls_weight = Tensor::<B, 1>::from_data(TensorData::new(cls_weight, [n]), &device);
    let reg_target = Tensor::<B, 2>::from_data(TensorData::new(reg_target, [n, 4]), &device);
    let reg_weight = Tensor::<B, 2>::from_data(TensorData::new(reg_weight, [n, 4]), &device);

    let cls = weighted_bce_with_logits(output.logits.clone(), cls_target, cls_weight);

    let per_elem = smooth_l1(output.deltas.clone(), reg_target) * reg_weight.clone();
    let positives = reg_weight.sum().div_scalar(4.0).clamp_min(1.0);
    let reg = per_elem.sum() / positives;

    Ok(RpnLoss { cls, reg })
}
