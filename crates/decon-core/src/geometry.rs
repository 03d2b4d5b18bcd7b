//! Volume shapes and axis-aligned regions
//!
//! Voxels are stored x-fastest, then y, then z. Axis arrays are always ordered
//! `[x, y, z]`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Extent of a dense voxel volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape3 {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
}

impl Shape3 {
    pub const fn new(nx: usize, ny: usize, nz: usize) -> Self {
        Self { nx, ny, nz }
    }

    pub const fn from_dims(dims: [usize; 3]) -> Self {
        Self::new(dims[0], dims[1], dims[2])
    }

    pub const fn dims(&self) -> [usize; 3] {
        [self.nx, self.ny, self.nz]
    }

    pub const fn voxels(&self) -> usize {
        self.nx * self.ny * self.nz
    }

    /// Voxel count, `None` when it does not fit a `usize`
    pub fn checked_voxels(&self) -> Option<usize> {
        self.nx.checked_mul(self.ny)?.checked_mul(self.nz)
    }

    /// Voxels in one z-plane
    pub const fn plane_len(&self) -> usize {
        self.nx * self.ny
    }

    /// Linear offset of `(x, y, z)`
    #[inline]
    pub const fn offset(&self, x: usize, y: usize, z: usize) -> usize {
        (z * self.ny + y) * self.nx + x
    }

    pub const fn is_empty(&self) -> bool {
        self.voxels() == 0
    }
}

impl fmt::Display for Shape3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.nx, self.ny, self.nz)
    }
}

/// Axis-aligned box inside a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    pub origin: [usize; 3],
    pub extent: [usize; 3],
}

impl Region {
    pub const fn new(origin: [usize; 3], extent: [usize; 3]) -> Self {
        Self { origin, extent }
    }

    /// Region covering the whole of `shape`
    pub const fn full(shape: Shape3) -> Self {
        Self::new([0, 0, 0], shape.dims())
    }

    pub const fn shape(&self) -> Shape3 {
        Shape3::from_dims(self.extent)
    }

    pub const fn voxels(&self) -> usize {
        self.extent[0] * self.extent[1] * self.extent[2]
    }

    /// One past the last coordinate on `axis`
    pub const fn end(&self, axis: usize) -> usize {
        self.origin[axis] + self.extent[axis]
    }

    pub fn contains(&self, point: [usize; 3]) -> bool {
        (0..3).all(|axis| point[axis] >= self.origin[axis] && point[axis] < self.end(axis))
    }

    /// Whether `other` lies entirely inside this region
    pub fn encloses(&self, other: &Region) -> bool {
        (0..3).all(|axis| other.origin[axis] >= self.origin[axis] && other.end(axis) <= self.end(axis))
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}..{}, {}..{}, {}..{}]",
            self.origin[0],
            self.end(0),
            self.origin[1],
            self.end(1),
            self.origin[2],
            self.end(2)
        )
    }
}
