//! Classification head over pooled proposal features.
//!
//! Flattens each pooled block through two fully connected layers into a
//! class distribution over `num_classes + 1` (class 0 is background) and a
//! per-class box refinement.

use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation::{relu, softmax};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use serde::{Deserialize, Serialize};

use detection_core::{BoxDelta, ConfigError, ShapeError};

use crate::loss::{smooth_l1, weighted_cross_entropy};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RcnnHeadConfig {
    /// Flattened pooled-block size: `channels * out_h * out_w`.
    pub in_features: usize,
    pub hidden: usize,
    /// Foreground classes; the head adds one background class on top.
    pub num_classes: usize,
}

impl Default for RcnnHeadConfig {
    fn default() -> Self {
        Self {
            in_features: 512 * 7 * 7,
            hidden: 1024,
            num_classes: 20,
        }
    }
}

impl RcnnHeadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_classes == 0 {
            return Err(ConfigError::NoClasses);
        }
        if self.in_features == 0 || self.hidden == 0 {
            return Err(ConfigError::InvalidPooledSize);
        }
        Ok(())
    }
}

#[derive(Module, Debug)]
pub struct RcnnHead<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    class_head: Linear<B>,
    bbox_head: Linear<B>,
    in_features: usize,
    num_classes: usize,
}

impl<B: Backend> RcnnHead<B> {
    pub fn new(config: &RcnnHeadConfig, device: &B::Device) -> Result<Self, ConfigError> {
        config.validate()?;
        let classes = config.num_classes + 1;
        let fc1 = LinearConfig::new(config.in_features, config.hidden).init(device);
        let fc2 = LinearConfig::new(config.hidden, config.hidden).init(device);
        let class_head = LinearConfig::new(config.hidden, classes).init(device);
        // Regression outputs are grouped per class: column c*4 + d holds
        // component d of class c's delta.
        let bbox_head = LinearConfig::new(config.hidden, 4 * classes).init(device);
        Ok(Self {
            fc1,
            fc2,
            class_head,
            bbox_head,
            in_features: config.in_features,
            num_classes: config.num_classes,
        })
    }

    /// Foreground classes, excluding the implicit background class.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn forward(&self, pooled: Tensor<B, 4>) -> Result<RcnnOutput<B>, ShapeError> {
        let [rows, channels, out_h, out_w] = pooled.dims();
        let flat = channels * out_h * out_w;
        if flat != self.in_features {
            return Err(ShapeError::ChannelMismatch {
                what: "pooled features",
                expected: self.in_features,
                actual: flat,
            });
        }

        let x = pooled.reshape([rows, self.in_features]);
        let x = relu(self.fc1.forward(x));
        let x = relu(self.fc2.forward(x));
        let logits = self.class_head.forward(x.clone());
        let deltas = self.bbox_head.forward(x);
        let probs = softmax(logits.clone(), 1);

        Ok(RcnnOutput {
            logits,
            probs,
            deltas,
            num_classes: self.num_classes,
        })
    }
}

/// Per-proposal classifier predictions.
#[derive(Debug, Clone)]
pub struct RcnnOutput<B: Backend> {
    /// `[num_proposals, num_classes + 1]`.
    pub logits: Tensor<B, 2>,
    /// Softmax of `logits`.
    pub probs: Tensor<B, 2>,
    /// `[num_proposals, 4 * (num_classes + 1)]`, class-major groups of four.
    pub deltas: Tensor<B, 2>,
    num_classes: usize,
}

impl<B: Backend> RcnnOutput<B> {
    pub fn num_rows(&self) -> usize {
        self.logits.dims()[0]
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Class probabilities on the host, row-major.
    pub fn probs_host(&self) -> Vec<f32> {
        self.probs
            .clone()
            .into_data()
            .to_vec::<f32>()
            .expect("class probabilities hold f32 elements")
    }

    /// Per-class deltas on the host: entry `row * (num_classes + 1) + class`.
    pub fn deltas_host(&self) -> Vec<BoxDelta> {
        self.deltas
            .clone()
            .into_data()
            .to_vec::<f32>()
            .expect("refinement deltas hold f32 elements")
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

/// Supervision for one proposal row. `class` 0 is background; ignored rows
/// are excluded from the classification term entirely.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RcnnTarget {
    pub class: usize,
    pub ignore: bool,
    pub delta: Option<BoxDelta>,
}

#[derive(Debug, Clone)]
pub struct RcnnLoss<B: Backend> {
    pub cls: Tensor<B, 1>,
    pub reg: Tensor<B, 1>,
}

/// Cross-entropy over all non-ignored rows plus smooth-L1 on the matched
/// class's delta slice for foreground rows only. Background and ignored rows
/// contribute nothing to the regression term.
pub fn rcnn_loss<B: Backend>(
    output: &RcnnOutput<B>,
    targets: &[RcnnTarget],
) -> Result<RcnnLoss<B>, ShapeError> {
    let rows = output.num_rows();
    if targets.len() != rows {
        return Err(ShapeError::LengthMismatch {
            what: "proposal targets",
            expected: rows,
            actual: targets.len(),
        });
    }
    let classes = output.num_classes + 1;
    let device = output.logits.device();

    let mut one_hot = vec![0.0f32; rows * classes];
    let mut row_weight = vec![0.0f32; rows];
    let mut reg_target = vec![0.0f32; rows * classes * 4];
    let mut reg_weight = vec![0.0f32; rows * classes * 4];
    for (i, t) in targets.iter().enumerate() {
        if t.ignore {
            continue;
        }
        if t.class >= classes {
            return Err(ShapeError::ClassOutOfRange {
                class: t.class as u32,
                num_classes: output.num_classes,
            });
        }
        one_hot[i * classes + t.class] = 1.0;
        row_weight[i] = 1.0;
        if t.class > 0 {
            if let Some(d) = t.delta {
                let base = (i * classes + t.class) * 4;
                reg_target[base..base + 4].copy_from_slice(&[d.dx, d.dy, d.dw, d.dh]);
                reg_weight[base..base + 4].copy_from_slice(&[1.0; 4]);
            }
        }
    }

    let one_hot = Tensor::<B, 2>::from_data(TensorData::new(one_hot, [rows, classes]), &device);
    let row_weight = Tensor::<B, 1>::from_data(TensorData::new(row_weight, [rows]), &device);
    let reg_target =
        Tensor::<B, 2>::from_data(TensorData::new(reg_target, [rows, classes * 4]), &device);
    let reg_weight =
        Tensor::<B, 2>::from_data(TensorData::new(reg_weight, [rows, classes * 4]), &device);

    let cls = weighted_cross_entropy(output.logits.clone(), one_hot, row_weight);

    let per_elem = smooth_l1(output.deltas.clone(), reg_target) * reg_weight.clone();
    let positives = reg_weight.sum().div_scalar(4.0).clamp_min(1.0);
    let reg = per_elem.sum() / positives;

    Ok(RcnnLoss { cls, reg })
}
