//! Fixed-size feature extraction for variable-sized proposals.

use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

use detection_core::{ConfigError, Proposal, ShapeError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoiPoolConfig {
    pub output_size: [usize; 2],
}

impl Default for RoiPoolConfig {
    fn default() -> Self {
        Self { output_size: [7, 7] }
    }
}

impl RoiPoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_size[0] == 0 || self.output_size[1] == 0 {
            return Err(ConfigError::InvalidPooledSize);
        }
        Ok(())
    }
}

/// Maps each proposal onto the feature map and pools the covered region to a
/// fixed spatial size. Owns no learned parameters.
#[derive(Debug)]
pub struct RoiPool {
    pool: AdaptiveAvgPool2d,
    output_size: [usize; 2],
}

impl RoiPool {
    pub fn new(config: &RoiPoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            pool: AdaptiveAvgPool2dConfig::new(config.output_size).init(),
            output_size: config.output_size,
        })
    }

    pub fn output_size(&self) -> [usize; 2] {
        self.output_size
    }

    /// Extracts one `[channels, out_h, out_w]` block per proposal,
    /// concatenated along the batch axis in proposal order. Proposals smaller
    /// than a feature cell are clamped to cover at least one cell. An empty
    /// proposal set yields `None`.
    pub fn forward<B: Backend>(
        &self,
        features: &Tensor<B, 4>,
        proposals: &[Proposal],
        stride: usize,
    ) -> Result<Option<Tensor<B, 4>>, ShapeError> {
        let [batch, channels, height, width] = features.dims();
        if batch != 1 {
            return Err(ShapeError::BatchSize(batch));
        }
        if height == 0 || width == 0 {
            return Err(ShapeError::EmptySpatialExtent { height, width });
        }
        if proposals.is_empty() {
            log::debug!("roi pooling skipped: empty proposal set");
            return Ok(None);
        }

        let stride = stride as f32;
        let mut blocks = Vec::with_capacity(proposals.len());
        for p in proposals {
            let x1 = ((p.rect.x1 / stride).floor().max(0.0) as usize).min(width - 1);
            let y1 = ((p.rect.y1 / stride).floor().max(0.0) as usize).min(height - 1);
            let x2 = ((p.rect.x2 / stride).ceil().max(0.0) as usize).clamp(x1 + 1, width);
            let y2 = ((p.rect.y2 / stride).ceil().max(0.0) as usize).clamp(y1 + 1, height);

            let region = features.clone().slice([0..1, 0..channels, y1..y2, x1..x2]);
            blocks.push(self.pool.forward(region));
        }
        Ok(Some(Tensor::cat(blocks, 0)))
    }
}
