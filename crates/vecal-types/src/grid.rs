// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — RPM × kPa Grid Primitives
// ─────────────────────────────────────────────────────────────────────
//! Fixed two-dimensional grids indexed by engine speed (rows) and
//! manifold pressure (columns).
//!
//! Every grid carries its own [`BinAxes`]. Combining two grids always goes
//! through [`BinAxes::ensure_same`], which fails instead of reindexing.

use serde::{Deserialize, Serialize};

use crate::error::{VecalError, VecalResult};

/// Bin edges for both axes. Both arrays are strictly increasing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinAxes {
    pub rpm: Vec<f64>,
    pub kpa: Vec<f64>,
}

impl BinAxes {
    pub fn new(rpm: Vec<f64>, kpa: Vec<f64>) -> VecalResult<Self> {
        let axes = Self { rpm, kpa };
        axes.validate()?;
        Ok(axes)
    }

    pub fn validate(&self) -> VecalResult<()> {
        check_axis("rpm", &self.rpm)?;
        check_axis("kpa", &self.kpa)?;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rpm.len()
    }

    pub fn cols(&self) -> usize {
        self.kpa.len()
    }

    pub fn cell_count(&self) -> usize {
        self.rows() * self.cols()
    }

    /// Nearest row for an engine speed. Ties resolve to the lower bin.
    pub fn rpm_index(&self, rpm: f64) -> usize {
        nearest_index(&self.rpm, rpm)
    }

    /// Nearest column for a manifold pressure. Ties resolve to the lower bin.
    pub fn kpa_index(&self, kpa: f64) -> usize {
        nearest_index(&self.kpa, kpa)
    }

    pub fn locate(&self, rpm: f64, kpa: f64) -> CellIndex {
        CellIndex {
            row: self.rpm_index(rpm),
            col: self.kpa_index(kpa),
        }
    }

    /// Fail loudly when two grids disagree on either axis.
    pub fn ensure_same(&self, other: &BinAxes, context: &str) -> VecalResult<()> {
        if self.rpm != other.rpm {
            return Err(VecalError::GridMismatch(format!(
                "{context}: rpm bins differ ({:?} vs {:?})",
                self.rpm, other.rpm
            )));
        }
        if self.kpa != other.kpa {
            return Err(VecalError::GridMismatch(format!(
                "{context}: kpa bins differ ({:?} vs {:?})",
                self.kpa, other.kpa
            )));
        }
        Ok(())
    }
}

fn check_axis(name: &str, edges: &[f64]) -> VecalResult<()> {
    if edges.is_empty() {
        return Err(VecalError::Config(format!("{name} bins must not be empty")));
    }
    if edges.iter().any(|v| !v.is_finite()) {
        return Err(VecalError::Config(format!("{name} bins must be finite")));
    }
    if edges.windows(2).any(|w| w[1] <= w[0]) {
        return Err(VecalError::Config(format!(
            "{name} bins must be strictly increasing, got {edges:?}"
        )));
    }
    Ok(())
}

fn nearest_index(edges: &[f64], value: f64) -> usize {
    let mut best = 0usize;
    let mut best_dist = f64::INFINITY;
    for (i, edge) in edges.iter().enumerate() {
        let dist = (edge - value).abs();
        if dist < best_dist {
            best = i;
            best_dist = dist;
        }
    }
    best
}

/// Row/column position of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellIndex {
    pub row: usize,
    pub col: usize,
}

/// Row-major grid of `T` over a set of bin axes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid<T> {
    axes: BinAxes,
    cells: Vec<T>,
}

/// Grid of optional measurements. `None` means "no data", never zero.
pub type ValueGrid = Grid<Option<f64>>;

/// Per-cell accepted sample counts.
pub type CoverageGrid = Grid<u32>;

impl<T: Clone> Grid<T> {
    pub fn filled(axes: BinAxes, value: T) -> Self {
        let cells = vec![value; axes.cell_count()];
        Self { axes, cells }
    }
}

impl<T> Grid<T> {
    pub fn from_cells(axes: BinAxes, cells: Vec<T>) -> VecalResult<Self> {
        if cells.len() != axes.cell_count() {
            return Err(VecalError::GridMismatch(format!(
                "expected {}x{} = {} cells, got {}",
                axes.rows(),
                axes.cols(),
                axes.cell_count(),
                cells.len()
            )));
        }
        Ok(Self { axes, cells })
    }

    pub fn axes(&self) -> &BinAxes {
        &self.axes
    }

    pub fn rows(&self) -> usize {
        self.axes.rows()
    }

    pub fn cols(&self) -> usize {
        self.axes.cols()
    }

    pub fn get(&self, idx: CellIndex) -> &T {
        &self.cells[idx.row * self.cols() + idx.col]
    }

    pub fn get_mut(&mut self, idx: CellIndex) -> &mut T {
        let cols = self.cols();
        &mut self.cells[idx.row * cols + idx.col]
    }

    pub fn set(&mut self, idx: CellIndex, value: T) {
        *self.get_mut(idx) = value;
    }

    pub fn cells(&self) -> &[T] {
        &self.cells
    }

    /// All cell indices in row-major order.
    pub fn indices(&self) -> impl Iterator<Item = CellIndex> {
        let cols = self.cols();
        (0..self.rows()).flat_map(move |row| (0..cols).map(move |col| CellIndex { row, col }))
    }

    pub fn iter(&self) -> impl Iterator<Item = (CellIndex, &T)> {
        self.indices().zip(self.cells.iter())
    }

    pub fn map<U>(&self, mut f: impl FnMut(CellIndex, &T) -> U) -> Grid<U> {
        let cells = self.iter().map(|(idx, v)| f(idx, v)).collect();
        Grid {
            axes: self.axes.clone(),
            cells,
        }
    }

    /// Element-wise combination of two grids that must share bin edges.
    pub fn zip_with<U, V>(
        &self,
        other: &Grid<U>,
        context: &str,
        mut f: impl FnMut(&T, &U) -> V,
    ) -> VecalResult<Grid<V>> {
        self.axes.ensure_same(&other.axes, context)?;
        let cells = self
            .cells
            .iter()
            .zip(other.cells.iter())
            .map(|(a, b)| f(a, b))
            .collect();
        Ok(Grid {
            axes: self.axes.clone(),
            cells,
        })
    }

    /// Up/down/left/right neighbours inside the grid.
    pub fn orthogonal_neighbors(&self, idx: CellIndex) -> Vec<CellIndex> {
        let mut out = Vec::with_capacity(4);
        if idx.row > 0 {
            out.push(CellIndex { row: idx.row - 1, col: idx.col });
        }
        if idx.row + 1 < self.rows() {
            out.push(CellIndex { row: idx.row + 1, col: idx.col });
        }
        if idx.col > 0 {
            out.push(CellIndex { row: idx.row, col: idx.col - 1 });
        }
        if idx.col + 1 < self.cols() {
            out.push(CellIndex { row: idx.row, col: idx.col + 1 });
        }
        out
    }

    /// 8-neighbourhood with the Euclidean step distance of each neighbour.
    pub fn moore_neighbors(&self, idx: CellIndex) -> Vec<(CellIndex, f64)> {
        let mut out = Vec::with_capacity(8);
        for dr in -1i64..=1 {
            for dc in -1i64..=1 {
                if dr == 0 && dc == 0 {
                    continue;
                }
                let row = idx.row as i64 + dr;
                let col = idx.col as i64 + dc;
                if row < 0 || col < 0 || row >= self.rows() as i64 || col >= self.cols() as i64 {
                    continue;
                }
                let dist = if dr != 0 && dc != 0 { std::f64::consts::SQRT_2 } else { 1.0 };
                out.push((
                    CellIndex {
                        row: row as usize,
                        col: col as usize,
                    },
                    dist,
                ));
            }
        }
        out
    }
}

impl ValueGrid {
    pub fn empty(axes: BinAxes) -> Self {
        Self::filled(axes, None)
    }

    pub fn value(&self, idx: CellIndex) -> Option<f64> {
        *self.get(idx)
    }

    pub fn populated(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    /// Values of the orthogonal neighbours that hold data.
    pub fn valid_orthogonal_values(&self, idx: CellIndex) -> Vec<f64> {
        self.orthogonal_neighbors(idx)
            .into_iter()
            .filter_map(|n| self.value(n))
            .collect()
    }

    /// Largest |value| across populated cells, 0.0 for an empty grid.
    pub fn max_abs(&self) -> f64 {
        self.cells
            .iter()
            .flatten()
            .fold(0.0_f64, |acc, v| acc.max(v.abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axes() -> BinAxes {
        BinAxes::new(vec![1000.0, 2000.0, 3000.0], vec![20.0, 60.0, 100.0]).unwrap()
    }

    #[test]
    fn test_nearest_index() {
        let a = axes();
        assert_eq!(a.rpm_index(0.0), 0);
        assert_eq!(a.rpm_index(1400.0), 0);
        assert_eq!(a.rpm_index(1600.0), 1);
        assert_eq!(a.rpm_index(9000.0), 2);
        assert_eq!(a.kpa_index(81.0), 2);
    }

    #[test]
    fn test_tie_goes_to_lower_bin() {
        let a = axes();
        assert_eq!(a.rpm_index(1500.0), 0);
        assert_eq!(a.kpa_index(40.0), 0);
    }

    #[test]
    fn test_axes_reject_non_monotonic() {
        assert!(BinAxes::new(vec![1000.0, 1000.0], vec![20.0]).is_err());
        assert!(BinAxes::new(vec![], vec![20.0]).is_err());
        assert!(BinAxes::new(vec![1000.0], vec![f64::NAN]).is_err());
    }

    #[test]
    fn test_zip_with_mismatched_axes_fails() {
        let a: ValueGrid = Grid::empty(axes());
        let other = BinAxes::new(vec![1000.0, 2000.0, 3500.0], vec![20.0, 60.0, 100.0]).unwrap();
        let b: ValueGrid = Grid::empty(other);
        let err = a.zip_with(&b, "combine", |x, _| *x).unwrap_err();
        assert!(matches!(err, VecalError::GridMismatch(_)));
    }

    #[test]
    fn test_from_cells_wrong_len() {
        assert!(Grid::from_cells(axes(), vec![0u32; 8]).is_err());
    }

    #[test]
    fn test_neighbors_at_corner() {
        let g: ValueGrid = Grid::empty(axes());
        let n = g.orthogonal_neighbors(CellIndex { row: 0, col: 0 });
        assert_eq!(n.len(), 2);
        let m = g.moore_neighbors(CellIndex { row: 0, col: 0 });
        assert_eq!(m.len(), 3);
        let center = g.moore_neighbors(CellIndex { row: 1, col: 1 });
        assert_eq!(center.len(), 8);
    }

    #[test]
    fn test_valid_neighbors_skip_absent() {
        let mut g: ValueGrid = Grid::empty(axes());
        g.set(CellIndex { row: 0, col: 1 }, Some(2.0));
        let vals = g.valid_orthogonal_values(CellIndex { row: 1, col: 1 });
        assert_eq!(vals, vec![2.0]);
        assert_eq!(g.populated(), 1);
    }
}
