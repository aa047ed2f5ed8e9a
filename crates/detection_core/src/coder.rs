//! Center-form box delta encoding and decoding.
//!
//! The regression heads predict offsets relative to an anchor (or proposal)
//! rather than absolute coordinates: fractional center shifts scaled by the
//! anchor extent, and log-space width/height scalings. `encode` and `decode`
//! are exact inverses of each other up to floating-point rounding.

use serde::{Deserialize, Serialize};

use crate::bbox::BoundingBox;

/// Regression offsets `(dx, dy, dw, dh)` relative to a reference box.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoxDelta {
    pub dx: f32,
    pub dy: f32,
    pub dw: f32,
    pub dh: f32,
}

/// Computes the delta that maps `anchor` onto `target`.
pub fn encode(anchor: &BoundingBox, target: &BoundingBox) -> BoxDelta {
    let (acx, acy) = anchor.center();
    let (tcx, tcy) = target.center();
    let aw = anchor.width();
    let ah = anchor.height();

    BoxDelta {
        dx: (tcx - acx) / aw,
        dy: (tcy - acy) / ah,
        dw: (target.width() / aw).ln(),
        dh: (target.height() / ah).ln(),
    }
}

/// Applies `delta` to `anchor`, producing an absolute box.
///
/// The log-space extents are clamped before exponentiation so that a wild
/// regression output cannot overflow to infinity.
pub fn decode(anchor: &BoundingBox, delta: &BoxDelta) -> BoundingBox {
    let extent_clip = (1000.0f32 / 16.0).ln();

    let (acx, acy) = anchor.center();
    let aw = anchor.width();
    let ah = anchor.height();

    let cx = acx + delta.dx * aw;
    let cy = acy + delta.dy * ah;
    let w = aw * delta.dw.min(extent_clip).exp();
    let h = ah * delta.dh.min(extent_clip).exp();

    BoundingBox::from_center(cx, cy, w, h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn encode_then_decode_round_trips() {
        let anchor = BoundingBox::new(100.0, 50.0, 200.0, 150.0);
        let target = BoundingBox::new(120.0, 40.0, 260.0, 170.0);
        let recovered = decode(&anchor, &encode(&anchor, &target));
        assert_relative_eq!(recovered.x1, target.x1, max_relative = 1e-4);
        assert_relative_eq!(recovered.y1, target.y1, max_relative = 1e-4);
        assert_relative_eq!(recovered.x2, target.x2, max_relative = 1e-4);
        assert_relative_eq!(recovered.y2, target.y2, max_relative = 1e-4);
    }

    #[test]
    fn zero_delta_is_identity() {
        let anchor = BoundingBox::new(10.0, 10.0, 30.0, 50.0);
        let decoded = decode(&anchor, &BoxDelta::default());
        assert_relative_eq!(decoded.x1, anchor.x1, max_relative = 1e-5);
        assert_relative_eq!(decoded.y2, anchor.y2, max_relative = 1e-5);
    }

    #[test]
    fn huge_extent_delta_stays_finite() {
        let anchor = BoundingBox::new(0.0, 0.0, 16.0, 16.0);
        let delta = BoxDelta {
            dw: 100.0,
            dh: 100.0,
            ..BoxDelta::default()
        };
        let decoded = decode(&anchor, &delta);
        assert!(decoded.width().is_finite());
        assert!(decoded.height().is_finite());
    }
}
