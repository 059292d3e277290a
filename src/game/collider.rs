//! Collision shapes for static definitions and their posed instances

use serde::{Deserialize, Serialize};

use crate::util::vec2::Vec2;

/// A 2D collision shape in definition (local) or world space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Collider {
    Circle { pos: Vec2, rad: f32 },
    Aabb { min: Vec2, max: Vec2 },
}

impl Collider {
    pub fn circle(pos: Vec2, rad: f32) -> Self {
        Collider::Circle { pos, rad }
    }

    pub fn aabb(min: Vec2, max: Vec2) -> Self {
        Collider::Aabb {
            min: min.min(max),
            max: min.max(max),
        }
    }

    /// AABB centered on `pos` with half extents `extent`
    pub fn aabb_from_extent(pos: Vec2, extent: Vec2) -> Self {
        let extent = extent.abs();
        Collider::Aabb {
            min: pos - extent,
            max: pos + extent,
        }
    }

    /// Place a local shape in the world: scale, then rotate, then translate.
    ///
    /// Boxes stay axis aligned, so a rotated box becomes the bounds of its
    /// rotated corners.
    pub fn transform(&self, pos: Vec2, rot: f32, scale: f32) -> Collider {
        match *self {
            Collider::Circle { pos: center, rad } => Collider::Circle {
                pos: pos + (center * scale).rotate(rot),
                rad: rad * scale,
            },
            Collider::Aabb { min, max } => {
                let corners = [
                    Vec2::new(min.x, min.y),
                    Vec2::new(max.x, min.y),
                    Vec2::new(max.x, max.y),
                    Vec2::new(min.x, max.y),
                ];
                let mut out_min = Vec2::new(f32::MAX, f32::MAX);
                let mut out_max = Vec2::new(f32::MIN, f32::MIN);
                for corner in corners {
                    let world = pos + (corner * scale).rotate(rot);
                    out_min = out_min.min(world);
                    out_max = out_max.max(world);
                }
                Collider::Aabb {
                    min: out_min,
                    max: out_max,
                }
            }
        }
    }

    /// Axis-aligned bounds of this shape, for broad-phase use
    pub fn bounds(&self) -> Collider {
        match *self {
            Collider::Circle { pos, rad } => Collider::aabb_from_extent(pos, Vec2::new(rad, rad)),
            aabb @ Collider::Aabb { .. } => aabb,
        }
    }

    pub fn center(&self) -> Vec2 {
        match *self {
            Collider::Circle { pos, .. } => pos,
            Collider::Aabb { min, max } => (min + max) * 0.5,
        }
    }

    /// Bounds overlap test
    pub fn overlaps_bounds(&self, other: &Collider) -> bool {
        match (self.bounds(), other.bounds()) {
            (Collider::Aabb { min: a0, max: a1 }, Collider::Aabb { min: b0, max: b1 }) => {
                a0.x <= b1.x && a1.x >= b0.x && a0.y <= b1.y && a1.y >= b0.y
            }
            _ => false,
        }
    }
}
