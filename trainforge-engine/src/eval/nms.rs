//! Greedy non-maximum suppression.

/// Axis-aligned box as `[x1, y1, x2, y2]`.
pub type BBox = [f32; 4];

/// Intersection over union of two boxes; 0 when either is degenerate.
pub fn iou(a: &BBox, b: &BBox) -> f32 {
    let iw = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let ih = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = iw * ih;
    let area = |r: &BBox| (r[2] - r[0]).max(0.0) * (r[3] - r[1]).max(0.0);
    let union = area(a) + area(b) - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

/// Indices of the boxes to keep, highest score first.
///
/// Boxes are visited by descending score, equal scores in index order. A box
/// is suppressed once its overlap with an already kept box exceeds
/// `threshold`.
pub fn non_max_suppression<B, F>(boxes: &[B], scores: &[f32], overlap: F, threshold: f32) -> Vec<usize>
where
    F: Fn(&B, &B) -> f32,
{
    let mut order: Vec<usize> = (0..boxes.len().min(scores.len())).collect();
    // stable: ties keep index order
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut keep: Vec<usize> = Vec::new();
    for i in order {
        if keep.iter().all(|&k| overlap(&boxes[k], &boxes[i]) <= threshold) {
            keep.push(i);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou() {
        let a = [0.0, 0.0, 2.0, 2.0];
        let b = [1.0, 1.0, 3.0, 3.0];
        assert!((iou(&a, &b) - 1.0 / 7.0).abs() < 1e-6);
        assert_eq!(iou(&a, &[5.0, 5.0, 6.0, 6.0]), 0.0);
        assert_eq!(iou(&a, &a), 1.0);
    }

    #[test]
    fn test_suppresses_overlapping_lower_scores() {
        let boxes = [
            [0.0, 0.0, 10.0, 10.0],
            [1.0, 1.0, 11.0, 11.0],
            [20.0, 20.0, 30.0, 30.0],
        ];
        let keep = non_max_suppression(&boxes, &[0.8, 0.9, 0.5], iou, 0.5);
        assert_eq!(keep, vec![1, 2]);
    }

    #[test]
    fn test_ties_prefer_earlier_index() {
        let boxes = [[0.0, 0.0, 1.0, 1.0], [0.0, 0.0, 1.0, 1.0]];
        assert_eq!(non_max_suppression(&boxes, &[0.7, 0.7], iou, 0.5), vec![0]);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let boxes = [[0.0, 0.0, 2.0, 1.0], [1.0, 0.0, 3.0, 1.0]];
        // iou = 1/3
        let keep = non_max_suppression(&boxes, &[0.9, 0.8], iou, 1.0 / 3.0);
        assert_eq!(keep, vec![0, 1]);
    }
}
