use crate::labels::ClassNames;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.) * (self.y2 - self.y1).max(0.)
    }

    pub fn intersection(&self, other: &BoundingBox) -> f32 {
        let w = self.x2.min(other.x2) - self.x1.max(other.x1);
        let h = self.y2.min(other.y2) - self.y1.max(other.y1);
        w.max(0.) * h.max(0.)
    }

    pub fn union(&self, other: &BoundingBox) -> f32 {
        self.area() + other.area() - self.intersection(other)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let union = self.union(other);
        if union <= 0. {
            return 0.;
        }
        self.intersection(other) / union
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub class_id: usize,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Everything the detector reports for one image.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub names: Arc<ClassNames>,
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    /// One class-id per detected instance, in detector order.
    pub fn class_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.detections.iter().map(|d| d.class_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x1: f32, y1: f32, x2: f32, y2: f32) -> BoundingBox {
        BoundingBox { x1, y1, x2, y2 }
    }

    #[test]
    fn test_iou_of_identical_boxes() {
        let b = bbox(0., 0., 10., 10.);
        assert_eq!(b.iou(&b), 1.0);
    }

    #[test]
    fn test_iou_of_disjoint_boxes() {
        let a = bbox(0., 0., 10., 10.);
        let b = bbox(20., 20., 30., 30.);
        assert_eq!(a.intersection(&b), 0.);
        assert_eq!(a.iou(&b), 0.);
    }

    #[test]
    fn test_iou_of_half_overlap() {
        let a = bbox(0., 0., 10., 10.);
        let b = bbox(5., 0., 15., 10.);
        assert_eq!(a.intersection(&b), 50.);
        assert_eq!(a.union(&b), 150.);
        assert!((a.iou(&b) - 1. / 3.).abs() < 1e-6);
    }

    #[test]
    fn test_class_ids_keep_detector_order() {
        let result = DetectionResult {
            names: Arc::new(ClassNames::default()),
            detections: [2, 0, 2]
                .into_iter()
                .map(|class_id| Detection {
                    class_id,
                    confidence: 0.9,
                    bbox: bbox(0., 0., 1., 1.),
                })
                .collect(),
        };
        assert_eq!(result.class_ids().collect::<Vec<_>>(), vec![2, 0, 2]);
    }
}
