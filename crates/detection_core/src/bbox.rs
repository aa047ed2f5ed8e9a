use serde::{Deserialize, Serialize};

/// Axis-aligned box in image coordinates, corner form `(x1, y1, x2, y2)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Builds a box from its center point and extents.
    pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
        Self {
            x1: cx - width * 0.5,
            y1: cy - height * 0.5,
            x2: cx + width * 0.5,
            y2: cy + height * 0.5,
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) * 0.5, (self.y1 + self.y2) * 0.5)
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Strictly positive extent in both dimensions and finite coordinates.
    pub fn is_valid(&self) -> bool {
        self.x1.is_finite()
            && self.y1.is_finite()
            && self.x2.is_finite()
            && self.y2.is_finite()
            && self.width() > 0.0
            && self.height() > 0.0
    }

    /// Clamps the box to `[0, width] x [0, height]`.
    pub fn clip(&self, image: ImageShape) -> Self {
        Self {
            x1: self.x1.clamp(0.0, image.width),
            y1: self.y1.clamp(0.0, image.height),
            x2: self.x2.clamp(0.0, image.width),
            y2: self.y2.clamp(0.0, image.height),
        }
    }

    /// Intersection over union with `other`; 0 for disjoint or degenerate boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter_x1 = self.x1.max(other.x1);
        let inter_y1 = self.y1.max(other.y1);
        let inter_x2 = self.x2.min(other.x2);
        let inter_y2 = self.y2.min(other.y2);

        let inter = (inter_x2 - inter_x1).max(0.0) * (inter_y2 - inter_y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Image extent in pixels, used for clipping decoded boxes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageShape {
    pub width: f32,
    pub height: f32,
}

impl ImageShape {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

/// A ground-truth box with its foreground class label.
///
/// `class` is 1-based; 0 is reserved for background in the classifier head.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GtBox {
    pub rect: BoundingBox,
    pub class: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn iou_of_box_with_itself_is_one() {
        let b = BoundingBox::new(10.0, 20.0, 50.0, 80.0);
        assert_relative_eq!(b.iou(&b), 1.0);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_is_symmetric() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 5.0, 15.0, 15.0);
        assert_relative_eq!(a.iou(&b), b.iou(&a));
    }

    #[test]
    fn iou_of_degenerate_box_is_zero() {
        let a = BoundingBox::new(5.0, 5.0, 5.0, 5.0);
        assert_eq!(a.iou(&a), 0.0);
    }

    #[test]
    fn clip_clamps_to_image_bounds() {
        let b = BoundingBox::new(-10.0, -5.0, 120.0, 90.0);
        let clipped = b.clip(ImageShape::new(100.0, 80.0));
        assert_eq!(clipped, BoundingBox::new(0.0, 0.0, 100.0, 80.0));
    }

    #[test]
    fn validity_requires_positive_extent() {
        assert!(BoundingBox::new(0.0, 0.0, 1.0, 1.0).is_valid());
        assert!(!BoundingBox::new(0.0, 0.0, 0.0, 1.0).is_valid());
        assert!(!BoundingBox::new(3.0, 0.0, 1.0, 1.0).is_valid());
    }
}
