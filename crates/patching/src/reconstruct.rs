//! Reassembly of per-patch score volumes into one volume.

use contracts::{ContractError, OverlapPolicy, ScoreVolume, VolumeShape};
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Zip};
use tracing::debug;

use crate::grid::{window_slice, PatchGeometry};

/// Place each patch of a `[n, extent..., classes]` stack back at its grid
/// origin and return a `[shape..., classes]` volume.
///
/// Patches are consumed in grid traversal order; the i-th patch belongs at
/// the i-th origin. Where patches overlap, `policy` decides the value:
/// `LastWriteWins` keeps the later patch, `Average` keeps the mean over every
/// contributing patch.
///
/// # Errors
/// - `PatchShape` if the stack's rank or patch extent disagrees with the grid
/// - `ReconstructionCoverage` if the patch count differs from the grid size or
///   some voxel received no patch
pub fn reconstruct(
    patches: ArrayViewD<'_, f32>,
    shape: &VolumeShape,
    geometry: &PatchGeometry,
    policy: OverlapPolicy,
) -> Result<ScoreVolume, ContractError> {
    let grid = geometry.grid(shape)?;
    let rank = shape.rank();

    if patches.ndim() != rank + 2 {
        let mut expected = vec![grid.len()];
        expected.extend_from_slice(grid.extent());
        expected.push(patches.shape().last().copied().unwrap_or(0));
        return Err(ContractError::patch_shape("patch stack", &expected, patches.shape()));
    }
    let spatial = &patches.shape()[1..=rank];
    if spatial != grid.extent() {
        return Err(ContractError::patch_shape("patch", grid.extent(), spatial));
    }

    let received = patches.len_of(Axis(0));
    let classes = patches.shape()[rank + 1];

    let mut dims = shape.extents().to_vec();
    dims.push(classes);
    let mut volume = ArrayD::<f32>::zeros(IxDyn(&dims));
    let mut counts = ArrayD::<u32>::zeros(IxDyn(shape.extents()));

    for (origin, patch) in grid.origins().iter().zip(patches.outer_iter()) {
        let mut region = volume.slice_each_axis_mut(window_slice(origin, grid.extent()));
        match policy {
            OverlapPolicy::LastWriteWins => region.assign(&patch),
            OverlapPolicy::Average => region += &patch,
        }
        counts
            .slice_each_axis_mut(window_slice(origin, grid.extent()))
            .mapv_inplace(|n| n + 1);
    }

    if policy == OverlapPolicy::Average {
        Zip::from(volume.lanes_mut(Axis(rank)))
            .and(&counts)
            .for_each(|mut lane, &n| {
                if n > 1 {
                    let n = n as f32;
                    lane.mapv_inplace(|v| v / n);
                }
            });
    }

    let unwritten = counts.iter().filter(|&&n| n == 0).count();
    if received != grid.len() || unwritten > 0 {
        return Err(ContractError::ReconstructionCoverage {
            expected_patches: grid.len(),
            received_patches: received,
            unwritten_voxels: unwritten,
        });
    }

    debug!(
        patches = received,
        shape = %shape,
        classes,
        ?policy,
        "volume reconstructed"
    );
    Ok(volume)
}
