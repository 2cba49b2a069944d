//! # Patching
//!
//! Patch geometry for volumes too large to segment whole.
//!
//! Responsibilities:
//! - One shared grid rule for decomposition and reconstruction
//! - Per-sample shape cache (written at decomposition, consumed at reconstruction)
//! - Patch reconstruction with an explicit overlap policy
//! - Class-score discretization (argmax)
//!
//! Everything here is synchronous and free of I/O.
//!
//! ## Usage Example
//!
//! ```ignore
//! use patching::{decompose, reconstruct, PatchGeometry, ShapeCache};
//!
//! let geometry = PatchGeometry::from_voxels(&[40, 40], &[10, 10])?;
//! cache.put(sample_id.clone(), sample.spatial_shape())?;
//! let patches = decompose(sample.image.view(), &geometry)?;
//! // ... model inference per patch ...
//! let shape = cache.pop(&sample_id)?;
//! let volume = reconstruct(scores.view(), &shape, &geometry, OverlapPolicy::LastWriteWins)?;
//! ```

mod cache;
mod discretize;
mod grid;
mod reconstruct;

pub use cache::ShapeCache;
pub use contracts::{OverlapPolicy, VolumeShape};
pub use discretize::discretize;
pub use grid::{decompose, grid_origins, window_slice, PatchGeometry, PatchGrid};
pub use reconstruct::reconstruct;
