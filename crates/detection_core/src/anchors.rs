//! Reference anchor generation and tiling across the feature-map grid.

use serde::{Deserialize, Serialize};

use crate::bbox::BoundingBox;
use crate::error::ConfigError;

/// Geometry of the anchor set tiled over the backbone feature map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorConfig {
    /// Side length of the square base anchor at scale 1.0, in image pixels.
    pub base_size: f32,
    pub scales: Vec<f32>,
    /// Aspect ratios as height / width.
    pub ratios: Vec<f32>,
    /// Feature-map cell size in image pixels.
    pub stride: usize,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            base_size: 256.0,
            scales: vec![0.5, 1.0, 2.0],
            ratios: vec![0.5, 1.0, 2.0],
            stride: 16,
        }
    }
}

impl AnchorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_size.is_finite() && self.base_size > 0.0) {
            return Err(ConfigError::InvalidBaseSize(self.base_size));
        }
        if self.scales.is_empty() || self.ratios.is_empty() {
            return Err(ConfigError::EmptyAnchorSet);
        }
        for &s in &self.scales {
            if !(s.is_finite() && s > 0.0) {
                return Err(ConfigError::InvalidScale(s));
            }
        }
        for &r in &self.ratios {
            if !(r.is_finite() && r > 0.0) {
                return Err(ConfigError::InvalidRatio(r));
            }
        }
        if self.stride == 0 {
            return Err(ConfigError::InvalidStride);
        }
        Ok(())
    }
}

/// Produces the origin-centered reference anchors and tiles them over a grid.
///
/// Anchors are a pure function of the configuration and the grid shape; they
/// carry no state and are regenerated from the feature-map dimensions on
/// every forward pass.
#[derive(Debug, Clone)]
pub struct AnchorGenerator {
    reference: Vec<BoundingBox>,
    stride: usize,
}

impl AnchorGenerator {
    pub fn new(config: &AnchorConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        // One reference box per (ratio, scale) pair, ratio-major. Each box
        // preserves area = (base * scale)^2 with aspect h/w = ratio and is
        // centered at the origin.
        let mut reference = Vec::with_capacity(config.ratios.len() * config.scales.len());
        for &ratio in &config.ratios {
            for &scale in &config.scales {
                let size = config.base_size * scale;
                let width = size / ratio.sqrt();
                let height = size * ratio.sqrt();
                reference.push(BoundingBox::from_center(0.0, 0.0, width, height));
            }
        }

        Ok(Self {
            reference,
            stride: config.stride,
        })
    }

    pub fn reference(&self) -> &[BoundingBox] {
        &self.reference
    }

    pub fn num_reference(&self) -> usize {
        self.reference.len()
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Tiles the reference set across a `grid_width x grid_height` feature
    /// map. Ordering is cell-major (rows top to bottom, x fastest within a
    /// row) with the reference index varying fastest inside each cell, so
    /// anchor `i` is addressable as `(cell_y * grid_width + cell_x) * k + i`.
    pub fn tile(&self, grid_width: usize, grid_height: usize) -> Vec<BoundingBox> {
        let mut anchors = Vec::with_capacity(grid_width * grid_height * self.reference.len());
        for y in 0..grid_height {
            let shift_y = (y * self.stride) as f32;
            for x in 0..grid_width {
                let shift_x = (x * self.stride) as f32;
                for r in &self.reference {
                    anchors.push(BoundingBox::new(
                        r.x1 + shift_x,
                        r.y1 + shift_y,
                        r.x2 + shift_x,
                        r.y2 + shift_y,
                    ));
                }
            }
        }
        anchors
    }
}
