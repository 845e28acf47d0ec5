// roi.rs -- Regions of interest.
//
// A ROI bounds the area that gets subdivided into facets. Coordinates are
// pixel coordinates; rectangle corners are inclusive on both ends.

use serde::{Deserialize, Serialize};

/// Region of interest inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Roi {
    Rectangle { x1: i64, y1: i64, x2: i64, y2: i64 },
    Circle { cx: f64, cy: f64, radius: f64 },
}

impl Roi {
    /// Rectangle covering a whole `width x height` image.
    pub fn full_image(width: usize, height: usize) -> Self {
        Roi::Rectangle {
            x1: 0,
            y1: 0,
            x2: width as i64 - 1,
            y2: height as i64 - 1,
        }
    }

    /// Inclusive integer bounding box `(x1, y1, x2, y2)`.
    pub fn bounds(&self) -> (i64, i64, i64, i64) {
        match *self {
            Roi::Rectangle { x1, y1, x2, y2 } => (x1.min(x2), y1.min(y2), x1.max(x2), y1.max(y2)),
            Roi::Circle { cx, cy, radius } => (
                (cx - radius).ceil() as i64,
                (cy - radius).ceil() as i64,
                (cx + radius).floor() as i64,
                (cy + radius).floor() as i64,
            ),
        }
    }

    /// Whether pixel (x, y) lies inside the region.
    pub fn contains(&self, x: i64, y: i64) -> bool {
        match *self {
            Roi::Rectangle { .. } => {
                let (x1, y1, x2, y2) = self.bounds();
                x >= x1 && x <= x2 && y >= y1 && y <= y2
            }
            Roi::Circle { cx, cy, radius } => {
                let dx = x as f64 - cx;
                let dy = y as f64 - cy;
                dx * dx + dy * dy <= radius * radius
            }
        }
    }

    /// Whether the square with top-left corner (x, y) and side `size`
    /// lies fully inside the region.
    pub fn contains_square(&self, x: i64, y: i64, size: usize) -> bool {
        let s = size as i64 - 1;
        // Both shapes are convex: the four corners decide containment.
        self.contains(x, y)
            && self.contains(x + s, y)
            && self.contains(x, y + s)
            && self.contains(x + s, y + s)
    }

    /// Whether the region fits inside a `width x height` image.
    pub fn fits_in(&self, width: usize, height: usize) -> bool {
        let (x1, y1, x2, y2) = self.bounds();
        x1 >= 0 && y1 >= 0 && x2 < width as i64 && y2 < height as i64 && x1 <= x2 && y1 <= y2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rectangle_contains_is_inclusive() {
        let r = Roi::Rectangle { x1: 2, y1: 3, x2: 10, y2: 8 };
        assert!(r.contains(2, 3));
        assert!(r.contains(10, 8));
        assert!(!r.contains(11, 8));
        assert!(!r.contains(1, 5));
    }

    #[test]
    fn rectangle_bounds_normalizes_corners() {
        let r = Roi::Rectangle { x1: 10, y1: 8, x2: 2, y2: 3 };
        assert_eq!(r.bounds(), (2, 3, 10, 8));
    }

    #[test]
    fn circle_contains_and_bounds() {
        let c = Roi::Circle { cx: 10.0, cy: 10.0, radius: 5.0 };
        assert!(c.contains(10, 15));
        assert!(!c.contains(14, 14));
        assert_eq!(c.bounds(), (5, 5, 15, 15));
    }

    #[test]
    fn square_inside_circle() {
        let c = Roi::Circle { cx: 20.0, cy: 20.0, radius: 10.0 };
        assert!(c.contains_square(16, 16, 9));
        assert!(!c.contains_square(10, 10, 5));
    }

    #[test]
    fn full_image_fits() {
        let r = Roi::full_image(64, 48);
        assert!(r.fits_in(64, 48));
        assert!(!r.fits_in(63, 48));
    }
}
