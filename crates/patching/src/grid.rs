//! Patch grid: the single traversal rule shared by decomposition and
//! reconstruction.
//!
//! Per spatial axis with extent `E`, window `W` and overlap `O`:
//!
//! ```text
//! stride = W - O
//! steps  = max(1, ceil(E / stride))
//! origin = i * stride, clamped to E - W when the window would run past the end
//! ```
//!
//! A window at least as large as the axis yields one patch spanning the whole
//! axis. Origins are combined row-major with the first axis outermost; the
//! clamp can produce repeated origins, which are kept so patch counts stay
//! predictable.

use contracts::{ContractError, Overlap, VolumeShape};
use ndarray::{ArrayD, ArrayViewD, AxisDescription, IxDyn, Slice};

/// Validated window and overlap in voxels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchGeometry {
    window: Vec<usize>,
    overlap: Vec<usize>,
}

impl PatchGeometry {
    /// Build a geometry from a window and a (possibly fractional) overlap.
    ///
    /// # Errors
    /// - empty window or a zero-sized window axis
    /// - overlap rank mismatch or out-of-range fraction
    /// - `InvalidOverlap` when overlap >= window on some axis
    pub fn new(window: &[usize], overlap: &Overlap) -> Result<Self, ContractError> {
        if window.is_empty() {
            return Err(ContractError::config_validation(
                "analysis.patch_shape",
                "patch shape must have at least one axis",
            ));
        }
        if let Some(axis) = window.iter().position(|&w| w == 0) {
            return Err(ContractError::config_validation(
                format!("analysis.patch_shape[{axis}]"),
                "patch extent must be positive",
            ));
        }

        let overlap = overlap.resolve(window)?;
        Ok(Self {
            window: window.to_vec(),
            overlap,
        })
    }

    /// Shorthand for an overlap given in voxels
    pub fn from_voxels(window: &[usize], overlap: &[usize]) -> Result<Self, ContractError> {
        Self::new(window, &Overlap::Voxels(overlap.to_vec()))
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.window.len()
    }

    pub fn window(&self) -> &[usize] {
        &self.window
    }

    pub fn overlap(&self) -> &[usize] {
        &self.overlap
    }

    /// Per-axis stride (always >= 1)
    pub fn stride(&self) -> Vec<usize> {
        self.window
            .iter()
            .zip(&self.overlap)
            .map(|(w, o)| w - o)
            .collect()
    }

    /// Grid over a volume of the given spatial shape
    pub fn grid(&self, shape: &VolumeShape) -> Result<PatchGrid, ContractError> {
        grid_origins(shape, self)
    }
}

/// Patch origins in traversal order plus the common patch extent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchGrid {
    origins: Vec<Vec<usize>>,
    extent: Vec<usize>,
}

impl PatchGrid {
    pub fn origins(&self) -> &[Vec<usize>] {
        &self.origins
    }

    /// Extent of every patch: `min(window, volume)` per axis
    pub fn extent(&self) -> &[usize] {
        &self.extent
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }
}

/// Compute the patch grid for a volume.
///
/// # Errors
/// `PatchShape` if the volume rank differs from the window rank or any
/// volume axis is empty.
pub fn grid_origins(shape: &VolumeShape, geometry: &PatchGeometry) -> Result<PatchGrid, ContractError> {
    if shape.rank() != geometry.rank() || shape.extents().contains(&0) {
        return Err(ContractError::patch_shape(
            "volume",
            geometry.window(),
            shape.extents(),
        ));
    }

    let per_axis: Vec<Vec<usize>> = shape
        .extents()
        .iter()
        .zip(geometry.window())
        .zip(geometry.stride())
        .map(|((&extent, &window), stride)| axis_origins(extent, window, stride))
        .collect();

    let mut origins: Vec<Vec<usize>> = vec![Vec::with_capacity(shape.rank())];
    for axis in &per_axis {
        origins = origins
            .into_iter()
            .flat_map(|prefix| {
                axis.iter().map(move |&origin| {
                    let mut next = prefix.clone();
                    next.push(origin);
                    next
                })
            })
            .collect();
    }

    let extent = shape
        .extents()
        .iter()
        .zip(geometry.window())
        .map(|(&e, &w)| e.min(w))
        .collect();

    Ok(PatchGrid { origins, extent })
}

fn axis_origins(extent: usize, window: usize, stride: usize) -> Vec<usize> {
    if window >= extent {
        return vec![0];
    }
    let steps = extent.div_ceil(stride).max(1);
    (0..steps)
        .map(|i| {
            let start = i * stride;
            if start + window > extent {
                extent - window
            } else {
                start
            }
        })
        .collect()
}

/// Slicing closure for `slice_each_axis`: selects `origin..origin + extent`
/// on the leading spatial axes and everything on trailing axes.
pub fn window_slice<'a>(
    origin: &'a [usize],
    extent: &'a [usize],
) -> impl Fn(AxisDescription) -> Slice + 'a {
    move |desc| {
        let axis = desc.axis.index();
        match origin.get(axis) {
            Some(&start) => Slice::from(start..start + extent[axis]),
            None => Slice::from(..),
        }
    }
}

/// Cut a channels-last image `[spatial..., channels]` into a patch stack
/// `[n, extent..., channels]` following the grid order.
pub fn decompose(image: ArrayViewD<'_, f32>, geometry: &PatchGeometry) -> Result<ArrayD<f32>, ContractError> {
    let ndim = image.ndim();
    if ndim != geometry.rank() + 1 {
        let mut expected = geometry.window().to_vec();
        expected.push(image.shape().last().copied().unwrap_or(1));
        return Err(ContractError::patch_shape("image", &expected, image.shape()));
    }

    let spatial = VolumeShape::from(&image.shape()[..ndim - 1]);
    let grid = geometry.grid(&spatial)?;
    let channels = image.shape()[ndim - 1];

    let mut dims = Vec::with_capacity(ndim + 1);
    dims.push(grid.len());
    dims.extend_from_slice(grid.extent());
    dims.push(channels);

    let mut patches = ArrayD::<f32>::zeros(IxDyn(&dims));
    for (origin, mut slot) in grid.origins().iter().zip(patches.outer_iter_mut()) {
        slot.assign(&image.slice_each_axis(window_slice(origin, grid.extent())));
    }

    Ok(patches)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(window: &[usize], overlap: &[usize]) -> PatchGeometry {
        PatchGeometry::from_voxels(window, overlap).unwrap()
    }

    #[test]
    fn overlapping_grid_clamps_last_origin() {
        let grid = grid_origins(&VolumeShape::new(vec![100, 100]), &geometry(&[40, 40], &[10, 10])).unwrap();

        assert_eq!(grid.len(), 16);
        assert_eq!(grid.extent(), &[40, 40]);

        let first_axis: Vec<usize> = grid.origins().iter().step_by(4).map(|o| o[0]).collect();
        assert_eq!(first_axis, vec![0, 30, 60, 60]);

        // Row-major: second axis varies fastest
        assert_eq!(grid.origins()[0], vec![0, 0]);
        assert_eq!(grid.origins()[1], vec![0, 30]);
        assert_eq!(grid.origins()[4], vec![30, 0]);
    }

    #[test]
    fn window_larger_than_volume_is_one_patch() {
        let grid = grid_origins(&VolumeShape::new(vec![50]), &geometry(&[64], &[0])).unwrap();
        assert_eq!(grid.origins(), &[vec![0]]);
        assert_eq!(grid.extent(), &[50]);
    }

    #[test]
    fn window_larger_with_overlap_is_still_one_patch() {
        let grid = grid_origins(&VolumeShape::new(vec![50]), &geometry(&[60], &[30])).unwrap();
        assert_eq!(grid.len(), 1);
    }

    #[test]
    fn exact_tiling_without_overlap() {
        let grid = grid_origins(&VolumeShape::new(vec![8, 6]), &geometry(&[4, 3], &[0, 0])).unwrap();
        assert_eq!(
            grid.origins(),
            &[vec![0, 0], vec![0, 3], vec![4, 0], vec![4, 3]]
        );
    }

    #[test]
    fn every_origin_stays_inside_the_volume() {
        let shape = VolumeShape::new(vec![37, 23, 11]);
        let geom = geometry(&[16, 16, 8], &[4, 5, 2]);
        let grid = grid_origins(&shape, &geom).unwrap();
        for origin in grid.origins() {
            for ((&o, &e), &v) in origin.iter().zip(grid.extent()).zip(shape.extents()) {
                assert!(o + e <= v);
            }
        }
    }

    #[test]
    fn overlap_equal_to_window_is_rejected() {
        let err = PatchGeometry::from_voxels(&[32, 32], &[8, 32]).unwrap_err();
        assert!(matches!(
            err,
            ContractError::InvalidOverlap { axis: 1, overlap: 32, window: 32 }
        ));
    }

    #[test]
    fn fractional_overlap_is_resolved() {
        let geom = PatchGeometry::new(&[40, 20], &Overlap::Fraction(vec![0.25, 0.5])).unwrap();
        assert_eq!(geom.overlap(), &[10, 10]);
        assert_eq!(geom.stride(), vec![30, 10]);
    }

    #[test]
    fn rank_mismatch_is_rejected() {
        let err = grid_origins(&VolumeShape::new(vec![10, 10, 10]), &geometry(&[4, 4], &[0, 0])).unwrap_err();
        assert!(matches!(err, ContractError::PatchShape { .. }));
    }

    #[test]
    fn zero_window_is_rejected() {
        assert!(PatchGeometry::from_voxels(&[0, 4], &[]).is_err());
        assert!(PatchGeometry::from_voxels(&[], &[]).is_err());
    }

    #[test]
    fn decompose_copies_windows_in_grid_order() {
        // 6x4 image, one channel, value = row * 10 + col
        let image = ArrayD::from_shape_fn(IxDyn(&[6, 4, 1]), |idx| (idx[0] * 10 + idx[1]) as f32);
        let geom = geometry(&[4, 4], &[2, 0]);

        let patches = decompose(image.view(), &geom).unwrap();
        // rows: origins 0, 2 and a clamped repeat of 2
        assert_eq!(patches.shape(), &[3, 4, 4, 1]);
        assert_eq!(patches[[0, 0, 0, 0]], 0.0);
        // second patch starts at row 2
        assert_eq!(patches[[1, 0, 0, 0]], 20.0);
        assert_eq!(patches[[1, 3, 3, 0]], 53.0);
        assert_eq!(patches.index_axis(ndarray::Axis(0), 1), patches.index_axis(ndarray::Axis(0), 2));
    }

    #[test]
    fn decompose_rejects_missing_channel_axis() {
        let image = ArrayD::<f32>::zeros(IxDyn(&[8, 8]));
        let err = decompose(image.view(), &geometry(&[4, 4], &[0, 0])).unwrap_err();
        assert!(matches!(err, ContractError::PatchShape { .. }));
    }
}
