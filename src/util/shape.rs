//! Planar collision shapes used by the spatial index and area-of-interest
//! queries. All tests are closed: touching edges count as intersecting.

use serde::{Deserialize, Serialize};

use super::vec3::Vec3;

/// Axis-aligned rectangle on the x/y plane
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl Rect {
    /// Build from two corners in any order
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self {
            min_x: x0.min(x1),
            min_y: y0.min(y1),
            max_x: x0.max(x1),
            max_y: y0.max(y1),
        }
    }

    #[inline]
    pub fn centered(center: Vec3, half_width: f32, half_height: f32) -> Self {
        Self::new(
            center.x - half_width,
            center.y - half_height,
            center.x + half_width,
            center.y + half_height,
        )
    }

    #[inline]
    pub fn width(&self) -> f32 {
        self.max_x - self.min_x
    }

    #[inline]
    pub fn height(&self) -> f32 {
        self.max_y - self.min_y
    }

    #[inline]
    pub fn overlaps(&self, other: &Rect) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    #[inline]
    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }
}

/// Shape stored per entity in the spatial index
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Shape {
    Rect(Rect),
    Circle { center_x: f32, center_y: f32, radius: f32 },
}

impl Shape {
    pub fn rect(center: Vec3, half_width: f32, half_height: f32) -> Self {
        Shape::Rect(Rect::centered(center, half_width, half_height))
    }

    pub fn circle(center: Vec3, radius: f32) -> Self {
        Shape::Circle {
            center_x: center.x,
            center_y: center.y,
            radius: radius.abs(),
        }
    }

    /// Smallest rectangle enclosing the shape
    pub fn bounds(&self) -> Rect {
        match *self {
            Shape::Rect(rect) => rect,
            Shape::Circle { center_x, center_y, radius } => Rect {
                min_x: center_x - radius,
                min_y: center_y - radius,
                max_x: center_x + radius,
                max_y: center_y + radius,
            },
        }
    }

    /// Exact intersection test
    pub fn intersects(&self, other: &Shape) -> bool {
        match (self, other) {
            (Shape::Rect(a), Shape::Rect(b)) => a.overlaps(b),
            (Shape::Rect(rect), Shape::Circle { center_x, center_y, radius })
            | (Shape::Circle { center_x, center_y, radius }, Shape::Rect(rect)) => {
                rect_circle(rect, *center_x, *center_y, *radius)
            }
            (
                Shape::Circle { center_x: ax, center_y: ay, radius: ar },
                Shape::Circle { center_x: bx, center_y: by, radius: br },
            ) => {
                let dx = ax - bx;
                let dy = ay - by;
                let reach = ar + br;
                dx * dx + dy * dy <= reach * reach
            }
        }
    }
}

#[inline]
fn rect_circle(rect: &Rect, cx: f32, cy: f32, radius: f32) -> bool {
    let nearest_x = cx.clamp(rect.min_x, rect.max_x);
    let nearest_y = cy.clamp(rect.min_y, rect.max_y);
    let dx = cx - nearest_x;
    let dy = cy - nearest_y;
    dx * dx + dy * dy <= radius * radius
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_corners_normalized() {
        let r = Rect::new(5.0, 5.0, -1.0, 2.0);
        assert_eq!(r.min_x, -1.0);
        assert_eq!(r.max_y, 5.0);
        assert_eq!(r.width(), 6.0);
        assert_eq!(r.height(), 3.0);
    }

    #[test]
    fn test_rect_touching_edges_intersect() {
        let a = Shape::Rect(Rect::new(0.0, 0.0, 1.0, 1.0));
        let b = Shape::Rect(Rect::new(1.0, 0.0, 2.0, 1.0));
        let c = Shape::Rect(Rect::new(1.01, 0.0, 2.0, 1.0));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_circle_rect_corner_gap() {
        // Circle sits diagonally off the corner: bounds overlap, shapes don't
        let rect = Shape::Rect(Rect::new(0.0, 0.0, 10.0, 10.0));
        let circle = Shape::circle(Vec3::planar(12.0, 12.0), 2.5);
        assert!(rect.bounds().overlaps(&circle.bounds()));
        assert!(!rect.intersects(&circle));
        assert!(!circle.intersects(&rect));

        let closer = Shape::circle(Vec3::planar(11.0, 11.0), 2.5);
        assert!(rect.intersects(&closer));
    }

    #[test]
    fn test_circle_circle() {
        let a = Shape::circle(Vec3::planar(0.0, 0.0), 1.0);
        let b = Shape::circle(Vec3::planar(2.0, 0.0), 1.0);
        let c = Shape::circle(Vec3::planar(2.5, 0.0), 1.0);
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_circle_bounds() {
        let b = Shape::circle(Vec3::planar(4.0, -2.0), 3.0).bounds();
        assert_eq!(b, Rect::new(1.0, -5.0, 7.0, 1.0));
        assert!(b.contains_point(4.0, -2.0));
    }
}
