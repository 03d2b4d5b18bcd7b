//! Tiling planner
//!
//! Splits the image into a grid of subvolumes. Along each axis the extent is cut
//! into `count` segments of `n / count` voxels, the last segment taking the
//! remainder. Every segment is the *core* of a tile; the tile's *halo* is the
//! core grown by the padding on both sides and clamped to the volume. On the
//! device a tile occupies `core + 2 * padding` voxels per axis; sides where the
//! halo was clamped are filled by replicating the edge voxel.
//!
//! Tiles are numbered in raster order: z-major, then y, then x.

use crate::error::{Error, ErrorKind, Result};
use crate::geometry::{Region, Shape3};
use crate::validate::ValidatedParameters;

const VOXEL_BYTES: usize = std::mem::size_of::<f32>();

/// One unit of device work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    /// Position in raster order; reported as `subvolume` in callbacks
    pub index: usize,
    /// Grid coordinates `[x, y, z]`
    pub grid: [usize; 3],
    /// Voxels this tile is responsible for
    pub core: Region,
    /// Core grown by the padding, clamped to the volume
    pub halo: Region,
    /// Device-side extent: core plus padding on both sides
    pub staged: Shape3,
    /// Padding per axis, i.e. the core's offset inside the staged extent
    pub padding: [usize; 3],
}

impl Tile {
    /// Image coordinate of staged coordinate `s` on `axis`, replicating edges
    #[inline]
    pub fn source_coordinate(&self, axis: usize, s: usize, extent: usize) -> usize {
        let unclamped = self.core.origin[axis] as isize - self.padding[axis] as isize + s as isize;
        unclamped.clamp(0, extent as isize - 1) as usize
    }

    /// Core region expressed in staged coordinates
    pub fn core_in_staged(&self) -> Region {
        Region::new(self.padding, self.core.extent)
    }

    pub fn staged_voxels(&self) -> usize {
        self.staged.voxels()
    }
}

/// Ordered tiles for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePlan {
    pub image: Shape3,
    pub grid: [usize; 3],
    pub tiles: Vec<Tile>,
    /// Device buffers held per tile while it is processed
    pub working_buffers: usize,
    /// Device bytes needed by the largest tile
    pub peak_tile_bytes: usize,
}

impl TilePlan {
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tile> {
        self.tiles.iter()
    }

    /// Bytes of device memory a tile needs, `None` when that overflows a `usize`
    pub fn tile_bytes(&self, tile: &Tile) -> Option<usize> {
        tile.staged
            .checked_voxels()?
            .checked_mul(VOXEL_BYTES)?
            .checked_mul(self.working_buffers)
    }
}

/// Device buffers per tile: observed image, estimate and PSF, plus the PSF
/// estimate in blind mode.
pub fn working_buffers(blind: bool) -> usize {
    if blind {
        4
    } else {
        3
    }
}

/// `(start, length)` of each segment when `extent` is cut into `count` pieces
pub fn segments(extent: usize, count: usize) -> Vec<(usize, usize)> {
    let count = count.max(1);
    let segment = extent / count;
    (0..count)
        .map(|i| {
            let start = i * segment;
            let len = if i + 1 == count { extent - start } else { segment };
            (start, len)
        })
        .collect()
}

/// Plan the tiles of a validated run within `budget_bytes` of device memory per tile.
#[tracing::instrument(skip(params), fields(image = %params.image_shape(), tiles = ?params.tiles()))]
pub fn plan(params: &ValidatedParameters, budget_bytes: usize) -> Result<TilePlan> {
    let image = params.image_shape();
    let grid = params.tiles();
    let padding = params.padding();
    let dims = image.dims();
    let working_buffers = working_buffers(params.params().blind);

    let axis_segments: Vec<Vec<(usize, usize)>> = (0..3).map(|axis| segments(dims[axis], grid[axis])).collect();

    let mut tiles = Vec::with_capacity(grid.iter().product());
    for (gz, &(z0, zn)) in axis_segments[2].iter().enumerate() {
        for (gy, &(y0, yn)) in axis_segments[1].iter().enumerate() {
            for (gx, &(x0, xn)) in axis_segments[0].iter().enumerate() {
                let core = Region::new([x0, y0, z0], [xn, yn, zn]);
                let mut halo_origin = [0; 3];
                let mut halo_extent = [0; 3];
                let mut staged = [0; 3];
                for axis in 0..3 {
                    let lo = core.origin[axis].saturating_sub(padding[axis]);
                    let hi = core.end(axis).saturating_add(padding[axis]).min(dims[axis]);
                    halo_origin[axis] = lo;
                    halo_extent[axis] = hi - lo;
                    // saturated extents fail the byte count below
                    staged[axis] = padding[axis].saturating_mul(2).saturating_add(core.extent[axis]);
                }
                tiles.push(Tile {
                    index: tiles.len(),
                    grid: [gx, gy, gz],
                    core,
                    halo: Region::new(halo_origin, halo_extent),
                    staged: Shape3::from_dims(staged),
                    padding,
                });
            }
        }
    }

    let mut plan = TilePlan {
        image,
        grid,
        tiles,
        working_buffers,
        peak_tile_bytes: 0,
    };

    for tile in &plan.tiles {
        let Some(bytes) = plan.tile_bytes(tile).filter(|bytes| *bytes <= budget_bytes) else {
            let needed = match plan.tile_bytes(tile) {
                Some(bytes) => format!("{bytes} bytes"),
                None => "more bytes than the address space holds".to_string(),
            };
            tracing::warn!(subvolume = tile.index, needed = %needed, budget_bytes, "tile_exceeds_budget");
            return Err(Error::new(
                ErrorKind::BadAllocOom,
                format!(
                    "subvolume {} ({} staged, {} buffers) needs {}, device budget is {} bytes",
                    tile.index, tile.staged, working_buffers, needed, budget_bytes
                ),
            ));
        };
        plan.peak_tile_bytes = plan.peak_tile_bytes.max(bytes);
    }

    tracing::debug!(tiles = plan.len(), peak_tile_bytes = plan.peak_tile_bytes, "tiles_planned");
    Ok(plan)
}
