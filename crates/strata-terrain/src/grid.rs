//! Cell coordinates and dense row-major grids.

use serde::{Deserialize, Serialize};

use crate::error::StageError;

/// 8-neighbourhood offsets in the fixed order N, NE, E, SE, S, SW, W, NW.
///
/// `y` grows southward, so north is `-1`. Every tie-break in the pipeline that
/// scans neighbours relies on this order.
pub const NEIGHBOR_OFFSETS: [(i32, i32); 8] = [
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
];

/// Distance to the neighbour at `dir` (an index into [`NEIGHBOR_OFFSETS`]).
#[inline]
pub fn neighbor_distance(dir: usize) -> f64 {
    if dir % 2 == 0 { 1.0 } else { std::f64::consts::SQRT_2 }
}

/// Integer cell coordinate inside a region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridPos {
    pub x: u32,
    pub y: u32,
}

impl GridPos {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance in cells.
    pub fn distance(self, other: GridPos) -> f64 {
        self.distance_sq(other).sqrt()
    }

    /// Squared Euclidean distance in cells.
    pub fn distance_sq(self, other: GridPos) -> f64 {
        let dx = self.x as f64 - other.x as f64;
        let dy = self.y as f64 - other.y as f64;
        dx * dx + dy * dy
    }
}

/// Width and height of a region in cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Default for Extent {
    fn default() -> Self {
        Self {
            width: 256,
            height: 256,
        }
    }
}

impl Extent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total number of cells.
    pub fn cell_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Row-major index of `pos`.
    #[inline]
    pub fn index(&self, pos: GridPos) -> usize {
        pos.y as usize * self.width as usize + pos.x as usize
    }

    /// Inverse of [`Extent::index`].
    #[inline]
    pub fn pos(&self, index: usize) -> GridPos {
        let w = self.width as usize;
        GridPos::new((index % w) as u32, (index / w) as u32)
    }

    /// Whether signed coordinates fall inside the region.
    #[inline]
    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && x < self.width as i64 && y < self.height as i64
    }

    /// Cell lies on the outermost ring.
    pub fn is_boundary(&self, pos: GridPos) -> bool {
        pos.x == 0 || pos.y == 0 || pos.x + 1 == self.width || pos.y + 1 == self.height
    }

    /// Cell lies on the outermost ring or touches it.
    pub fn is_boundary_adjacent(&self, pos: GridPos) -> bool {
        pos.x <= 1 || pos.y <= 1 || pos.x + 2 >= self.width || pos.y + 2 >= self.height
    }

    /// Distance in cells to the nearest map edge (0 on the boundary ring).
    pub fn edge_distance(&self, pos: GridPos) -> u32 {
        let right = self.width.saturating_sub(1).saturating_sub(pos.x);
        let bottom = self.height.saturating_sub(1).saturating_sub(pos.y);
        pos.x.min(pos.y).min(right).min(bottom)
    }

    /// Neighbour at direction `dir`, if it is inside the region.
    #[inline]
    pub fn neighbor(&self, pos: GridPos, dir: usize) -> Option<GridPos> {
        let (dx, dy) = NEIGHBOR_OFFSETS[dir];
        let nx = pos.x as i64 + dx as i64;
        let ny = pos.y as i64 + dy as i64;
        self.contains(nx, ny)
            .then(|| GridPos::new(nx as u32, ny as u32))
    }

    /// In-bounds neighbours paired with their direction index, in fixed order.
    pub fn neighbors(&self, pos: GridPos) -> impl Iterator<Item = (usize, GridPos)> + '_ {
        (0..NEIGHBOR_OFFSETS.len()).filter_map(move |dir| self.neighbor(pos, dir).map(|n| (dir, n)))
    }
}

/// Allocate a vector of `len` elements, mapping allocation failure to
/// [`StageError::Exhausted`].
pub(crate) fn try_alloc<T: Clone>(len: usize, value: T, what: &str) -> Result<Vec<T>, StageError> {
    let mut cells = Vec::new();
    cells
        .try_reserve_exact(len)
        .map_err(|e| StageError::Exhausted(format!("{what}: {e}")))?;
    cells.resize(len, value);
    Ok(cells)
}

/// Dense row-major grid of `T`.
///
/// Grids handed out of a stage are never mutated again; only the crate can
/// write cells.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Grid<T> {
    extent: Extent,
    cells: Vec<T>,
}

impl<T: Clone> Grid<T> {
    /// Grid with every cell set to `value`.
    pub fn filled(extent: Extent, value: T) -> Result<Self, StageError> {
        let cells = try_alloc(extent.cell_count(), value, "grid allocation")?;
        Ok(Self { extent, cells })
    }

    /// Wrap an existing row-major vector. Returns `None` on a length mismatch.
    pub fn from_vec(extent: Extent, cells: Vec<T>) -> Option<Self> {
        (cells.len() == extent.cell_count()).then_some(Self { extent, cells })
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn width(&self) -> u32 {
        self.extent.width
    }

    pub fn height(&self) -> u32 {
        self.extent.height
    }

    #[inline]
    pub fn get(&self, pos: GridPos) -> &T {
        &self.cells[self.extent.index(pos)]
    }

    #[inline]
    pub fn get_index(&self, index: usize) -> &T {
        &self.cells[index]
    }

    pub fn as_slice(&self) -> &[T] {
        &self.cells
    }

    #[inline]
    pub(crate) fn set(&mut self, pos: GridPos, value: T) {
        let index = self.extent.index(pos);
        self.cells[index] = value;
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.cells
    }

    /// Copy the `min..min+size` rectangle (clipped to the grid) into a new vector.
    pub fn copy_rect(&self, min: GridPos, size: Extent) -> Vec<T> {
        let x_end = (min.x + size.width).min(self.extent.width);
        let y_end = (min.y + size.height).min(self.extent.height);
        let mut out = Vec::with_capacity(size.cell_count());
        for y in min.y..y_end {
            let row = y as usize * self.extent.width as usize;
            out.extend_from_slice(&self.cells[row + min.x as usize..row + x_end as usize]);
        }
        out
    }
}
