//! Geometry information

use crate::types::DfmmError;

/// An axis aligned bounding box in `dim` dimensions.
#[derive(Clone, Debug, PartialEq)]
pub struct BoundingBox {
    min: Vec<f64>,
    max: Vec<f64>,
}

impl BoundingBox {
    /// Create a new bounding box from its lower and upper corner.
    pub fn new(min: Vec<f64>, max: Vec<f64>) -> Self {
        assert_eq!(min.len(), max.len());
        Self { min, max }
    }

    /// Compute the bounding box of a slice of points.
    ///
    /// The points are given point-major, `[x0, y0, z0, x1, y1, z1, ...]` for `dim == 3`.
    pub fn from_points(points: &[f64], dim: usize) -> Result<Self, DfmmError> {
        if dim == 0 || points.len() % dim != 0 {
            return Err(DfmmError::Configuration(format!(
                "{} coordinates do not describe points in {} dimensions",
                points.len(),
                dim
            )));
        }

        let mut min = vec![f64::MAX; dim];
        let mut max = vec![f64::MIN; dim];

        for point in points.chunks_exact(dim) {
            for (coord, lower, upper) in itertools::izip!(point, min.iter_mut(), max.iter_mut()) {
                *lower = f64::min(*lower, *coord);
                *upper = f64::max(*upper, *coord);
            }
        }

        // We want the bounding box to be slightly bigger
        // than the actual point set so that points on the
        // upper boundary still map into the last cell.

        for (lower, upper) in min.iter_mut().zip(max.iter_mut()) {
            let diam = f64::max(*upper - *lower, f64::EPSILON);
            *lower -= diam * f64::EPSILON;
            *upper += diam * f64::EPSILON;
        }

        Ok(Self { min, max })
    }

    /// Spatial dimension.
    pub fn dim(&self) -> usize {
        self.min.len()
    }

    /// Lower corner.
    pub fn min(&self) -> &[f64] {
        &self.min
    }

    /// Upper corner.
    pub fn max(&self) -> &[f64] {
        &self.max
    }

    /// Map a point from the physical domain to the reference box `[0, 1]^dim`.
    pub fn physical_to_reference(&self, point: &[f64]) -> Vec<f64> {
        itertools::izip!(point, &self.min, &self.max)
            .map(|(x, lower, upper)| (x - lower) / (upper - lower))
            .collect()
    }

    /// Index of the cell containing `point` in a uniform grid with `cells_per_dim`
    /// cells along each axis. The first axis varies fastest.
    pub fn cell_index(&self, point: &[f64], cells_per_dim: usize) -> usize {
        let reference = self.physical_to_reference(point);

        let mut index = 0;
        let mut stride = 1;
        for x in reference {
            let cell = ((x * cells_per_dim as f64) as usize).min(cells_per_dim - 1);
            index += cell * stride;
            stride *= cells_per_dim;
        }
        index
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(min: {:?}, max: {:?})", self.min, self.max)
    }
}
