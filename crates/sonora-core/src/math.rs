//! Math utilities
//!
//! Block positions and the distance helpers used for range checks.

use std::fmt;

use serde::{Deserialize, Serialize};

pub use glam::{IVec3, Vec3};

/// Integer position of a placed object, used as a spatial key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    /// Position at the origin
    pub const ORIGIN: Self = Self { x: 0, y: 0, z: 0 };

    /// Create a new block position
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Centre of the block in world space
    pub fn center(&self) -> Vec3 {
        Vec3::new(self.x as f32 + 0.5, self.y as f32 + 0.5, self.z as f32 + 0.5)
    }

    /// Squared distance from the block centre to a point
    pub fn distance_squared_to(&self, point: Vec3) -> f32 {
        self.center().distance_squared(point)
    }

    /// Distance from the block centre to a point
    pub fn distance_to(&self, point: Vec3) -> f32 {
        self.center().distance(point)
    }

    /// Inclusive range test on squared distances
    pub fn is_within(&self, point: Vec3, range: f32) -> bool {
        self.distance_squared_to(point) <= range * range
    }

    /// Offset the position
    pub fn offset(&self, dx: i32, dy: i32, dz: i32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.z + dz)
    }
}

impl From<IVec3> for BlockPos {
    fn from(v: IVec3) -> Self {
        Self::new(v.x, v.y, v.z)
    }
}

impl From<BlockPos> for IVec3 {
    fn from(pos: BlockPos) -> Self {
        IVec3::new(pos.x, pos.y, pos.z)
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}
