//! Class-score to label conversion.

use contracts::{ContractError, LabelVolume};
use ndarray::{ArrayView1, ArrayViewD, Axis};

/// Reduce `[spatial..., classes]` scores to `[spatial...]` labels by argmax
/// over the last axis.
///
/// Ties resolve to the lowest class index. NaN scores never win; a voxel whose
/// scores are all NaN gets class 0.
pub fn discretize(scores: ArrayViewD<'_, f32>) -> Result<LabelVolume, ContractError> {
    let Some(&classes) = scores.shape().last() else {
        return Err(ContractError::patch_shape("scores", &[1], scores.shape()));
    };
    if classes == 0 || classes > usize::from(u16::MAX) + 1 {
        return Err(ContractError::Other(format!(
            "cannot discretize {classes} classes into 16-bit labels"
        )));
    }

    let class_axis = Axis(scores.ndim() - 1);
    Ok(scores.map_axis(class_axis, argmax))
}

fn argmax(lane: ArrayView1<'_, f32>) -> u16 {
    let mut best: Option<(usize, f32)> = None;
    for (class, &score) in lane.iter().enumerate() {
        if score.is_nan() {
            continue;
        }
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((class, score)),
        }
    }
    best.map_or(0, |(class, _)| class as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, ArrayD, IxDyn};

    #[test]
    fn picks_highest_score() {
        let scores = array![[[0.1f32, 0.7, 0.2], [0.9, 0.05, 0.05]]].into_dyn();
        let labels = discretize(scores.view()).unwrap();
        assert_eq!(labels.shape(), &[1, 2]);
        assert_eq!(labels[[0, 0]], 1);
        assert_eq!(labels[[0, 1]], 0);
    }

    #[test]
    fn ties_go_to_lowest_class() {
        let scores = array![[0.4f32, 0.4, 0.2], [0.0, 0.5, 0.5]].into_dyn();
        let labels = discretize(scores.view()).unwrap();
        assert_eq!(labels.as_slice().unwrap(), &[0, 1]);
    }

    #[test]
    fn nan_never_wins() {
        let scores = array![[f32::NAN, 0.1, 0.2], [f32::NAN, f32::NAN, f32::NAN]].into_dyn();
        let labels = discretize(scores.view()).unwrap();
        assert_eq!(labels.as_slice().unwrap(), &[2, 0]);
    }

    #[test]
    fn rejects_empty_class_axis() {
        let scores = ArrayD::<f32>::zeros(IxDyn(&[4, 0]));
        assert!(discretize(scores.view()).is_err());
    }

    #[test]
    fn keeps_spatial_shape() {
        let scores = ArrayD::<f32>::zeros(IxDyn(&[3, 5, 7, 2]));
        assert_eq!(discretize(scores.view()).unwrap().shape(), &[3, 5, 7]);
    }
}
