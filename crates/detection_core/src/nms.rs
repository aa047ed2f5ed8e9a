//! Greedy non-maximum suppression.

use crate::bbox::BoundingBox;

/// Suppresses boxes that overlap a higher-scoring kept box by more than
/// `iou_threshold`. Returns the kept indices into `boxes`, score-descending,
/// at most `max_keep` of them when a cap is given.
///
/// Selection is inherently sequential: each kept box prunes the remaining
/// candidate pool before the next one is chosen.
pub fn nms(
    boxes: &[BoundingBox],
    scores: &[f32],
    iou_threshold: f32,
    max_keep: Option<usize>,
) -> Vec<usize> {
    debug_assert_eq!(boxes.len(), scores.len());

    // Sort ascending and pop from the back so the highest score seeds each
    // round.
    let mut order: Vec<usize> = (0..boxes.len()).collect();
    order.sort_by(|a, b| {
        scores[*a]
            .partial_cmp(&scores[*b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    while let Some(i) = order.pop() {
        if let Some(cap) = max_keep {
            if keep.len() >= cap {
                break;
            }
        }
        keep.push(i);
        order.retain(|&j| boxes[i].iou(&boxes[j]) <= iou_threshold);
    }
    if let Some(cap) = max_keep {
        keep.truncate(cap);
    }
    keep
}
