use smallvec::SmallVec;
use std::fmt::Debug;

/// Pixel coordinates of a detection, `x2`/`y2` exclusive.
///
/// Detector output may fall outside the image; `select_best_candidate`
/// clamps it before anything is cropped.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> i64 {
        self.width().max(0) as i64 * self.height().max(0) as i64
    }

    pub fn clamp(&self, width: usize, height: usize) -> Self {
        let width = i32::try_from(width).unwrap_or(i32::MAX);
        let height = i32::try_from(height).unwrap_or(i32::MAX);
        Self {
            x1: self.x1.max(0),
            y1: self.y1.max(0),
            x2: self.x2.min(width),
            y2: self.y2.min(height),
        }
    }

    pub fn is_degenerate(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }
}

impl From<[i32; 4]> for BoundingBox {
    fn from([x1, y1, x2, y2]: [i32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<BoundingBox> for [i32; 4] {
    fn from(bbox: BoundingBox) -> Self {
        [bbox.x1, bbox.y1, bbox.x2, bbox.y2]
    }
}

#[derive(Clone, Copy, PartialEq)]
pub struct Candidate {
    pub bounding_box: BoundingBox,
    pub confidence: f32,
}

impl Debug for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = &self.bounding_box;
        write!(
            f,
            "Candidate([{}, {}, {}, {}] @ {:.3})",
            b.x1, b.y1, b.x2, b.y2, self.confidence
        )
    }
}

pub type Candidates = SmallVec<[Candidate; 10]>;

/// Picks the most confident candidate and clamps it to the image.
///
/// Ties go to the candidate seen first. Returns `None` for an empty set and
/// when the clamped winner has no area; lower ranked candidates are not
/// considered in that case.
pub fn select_best_candidate(
    candidates: &[Candidate],
    width: usize,
    height: usize,
) -> Option<Candidate> {
    let mut best: Option<&Candidate> = None;
    for candidate in candidates {
        if candidate.confidence.is_nan() {
            continue;
        }
        if best.is_none_or(|b| candidate.confidence > b.confidence) {
            best = Some(candidate);
        }
    }

    let best = best?;
    let bounding_box = best.bounding_box.clamp(width, height);
    if bounding_box.is_degenerate() {
        return None;
    }
    Some(Candidate {
        bounding_box,
        confidence: best.confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(bbox: [i32; 4], confidence: f32) -> Candidate {
        Candidate {
            bounding_box: bbox.into(),
            confidence,
        }
    }

    #[test]
    fn empty_set_selects_nothing() {
        assert_eq!(select_best_candidate(&[], 100, 100), None);
    }

    #[test]
    fn selects_highest_confidence() {
        let candidates = [
            candidate([0, 0, 10, 10], 0.3),
            candidate([20, 20, 40, 30], 0.9),
            candidate([5, 5, 15, 15], 0.6),
        ];
        assert_eq!(
            select_best_candidate(&candidates, 100, 100),
            Some(candidate([20, 20, 40, 30], 0.9))
        );
    }

    #[test]
    fn ties_keep_first_seen() {
        let candidates = [
            candidate([0, 0, 10, 10], 0.5),
            candidate([1, 1, 11, 11], 0.8),
            candidate([2, 2, 12, 12], 0.8),
        ];
        let selected = select_best_candidate(&candidates, 100, 100).unwrap();
        assert_eq!(selected.bounding_box, [1, 1, 11, 11].into());
    }

    #[test]
    fn clamps_to_image_bounds() {
        let candidates = [candidate([-15, -2, 320, 140], 0.7)];
        let selected = select_best_candidate(&candidates, 300, 100).unwrap();
        assert_eq!(selected.bounding_box, [0, 0, 300, 100].into());
        assert_eq!(selected.confidence, 0.7);
    }

    #[test]
    fn degenerate_winner_selects_nothing() {
        // Entirely right of the image, clamps to x1=310 > x2=300.
        let outside = [
            candidate([310, 10, 350, 40], 0.99),
            candidate([10, 10, 50, 40], 0.4),
        ];
        assert_eq!(select_best_candidate(&outside, 300, 100), None);

        let inverted = [candidate([50, 40, 20, 60], 0.9)];
        assert_eq!(select_best_candidate(&inverted, 300, 100), None);

        let flat = [candidate([10, 20, 60, 20], 0.9)];
        assert_eq!(select_best_candidate(&flat, 300, 100), None);
    }

    #[test]
    fn nan_confidence_never_wins() {
        let candidates = [
            candidate([0, 0, 10, 10], f32::NAN),
            candidate([5, 5, 20, 20], 0.1),
        ];
        let selected = select_best_candidate(&candidates, 100, 100).unwrap();
        assert_eq!(selected.bounding_box, [5, 5, 20, 20].into());
    }

    #[test]
    fn converts_to_wire_array() {
        let wire: [i32; 4] = BoundingBox::from([1, 2, 3, 4]).into();
        assert_eq!(wire, [1, 2, 3, 4]);
    }
}
