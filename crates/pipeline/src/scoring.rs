//! Built-in segmentation metrics and the registry resolving them by name.

use std::collections::BTreeMap;

use contracts::{ContractError, Metric, KNOWN_METRICS};
use ndarray::{ArrayView1, ArrayViewD, Axis, CowArray, Ix2, Zip};

const SMOOTH: f32 = 1e-5;

/// Ordered set of metrics reported per epoch
#[derive(Default)]
pub struct MetricRegistry {
    metrics: Vec<Box<dyn Metric>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve every identifier, keeping the given order.
    ///
    /// # Errors
    /// `ConfigValidation` for an unknown identifier.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, ContractError> {
        let mut registry = Self::new();
        for (idx, name) in names.iter().enumerate() {
            let name = name.as_ref();
            let metric = resolve(name).ok_or_else(|| {
                ContractError::config_validation(
                    format!("training.metrics[{idx}]"),
                    format!("unknown metric '{name}', expected one of {KNOWN_METRICS:?}"),
                )
            })?;
            registry.register(metric);
        }
        Ok(registry)
    }

    /// Append a metric; registration order is reporting order
    pub fn register(&mut self, metric: Box<dyn Metric>) {
        self.metrics.push(metric);
    }

    pub fn names(&self) -> Vec<&str> {
        self.metrics.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Score `predicted` against `truth` with every metric
    pub fn score_all(
        &self,
        predicted: ArrayViewD<'_, f32>,
        truth: ArrayViewD<'_, f32>,
    ) -> BTreeMap<String, f32> {
        self.metrics
            .iter()
            .map(|m| (m.name().to_string(), m.score(predicted.view(), truth.view())))
            .collect()
    }
}

/// Built-in metric for an identifier
pub fn resolve(name: &str) -> Option<Box<dyn Metric>> {
    match name {
        "dice_soft" => Some(Box::new(DiceSoft)),
        "dice_classwise" => Some(Box::new(DiceClasswise)),
        "categorical_accuracy" => Some(Box::new(CategoricalAccuracy)),
        _ => None,
    }
}

/// Soft Dice over the raw scores, averaged over all classes
#[derive(Debug, Clone, Copy, Default)]
pub struct DiceSoft;

impl Metric for DiceSoft {
    fn name(&self) -> &str {
        "dice_soft"
    }

    fn score(&self, predicted: ArrayViewD<'_, f32>, truth: ArrayViewD<'_, f32>) -> f32 {
        let Some((pred, truth)) = flatten_pair(predicted, truth) else {
            return f32::NAN;
        };

        let classes = pred.ncols();
        let total: f32 = (0..classes)
            .map(|c| {
                let (p, t) = (pred.column(c), truth.column(c));
                let intersection = (&p * &t).sum();
                (2.0 * intersection + SMOOTH) / (p.sum() + t.sum() + SMOOTH)
            })
            .sum();
        total / classes as f32
    }
}

/// Hard Dice per foreground class (argmax of both inputs), averaged.
///
/// Class 0 is treated as background and skipped unless it is the only class.
/// A class absent from both prediction and truth scores 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiceClasswise;

impl Metric for DiceClasswise {
    fn name(&self) -> &str {
        "dice_classwise"
    }

    fn score(&self, predicted: ArrayViewD<'_, f32>, truth: ArrayViewD<'_, f32>) -> f32 {
        let Some((pred, truth)) = flatten_pair(predicted, truth) else {
            return f32::NAN;
        };

        let classes = pred.ncols();
        let pred_labels = pred.map_axis(Axis(1), argmax);
        let true_labels = truth.map_axis(Axis(1), argmax);

        let first = usize::from(classes > 1);
        let mut total = 0.0;
        for class in first..classes {
            let (mut both, mut in_pred, mut in_truth) = (0usize, 0usize, 0usize);
            Zip::from(&pred_labels).and(&true_labels).for_each(|&p, &t| {
                let (p, t) = (p == class, t == class);
                both += usize::from(p && t);
                in_pred += usize::from(p);
                in_truth += usize::from(t);
            });
            total += if in_pred + in_truth == 0 {
                1.0
            } else {
                2.0 * both as f32 / (in_pred + in_truth) as f32
            };
        }
        total / (classes - first) as f32
    }
}

/// Share of voxels whose predicted class equals the true class
#[derive(Debug, Clone, Copy, Default)]
pub struct CategoricalAccuracy;

impl Metric for CategoricalAccuracy {
    fn name(&self) -> &str {
        "categorical_accuracy"
    }

    fn score(&self, predicted: ArrayViewD<'_, f32>, truth: ArrayViewD<'_, f32>) -> f32 {
        let Some((pred, truth)) = flatten_pair(predicted, truth) else {
            return f32::NAN;
        };

        let voxels = pred.nrows();
        if voxels == 0 {
            return f32::NAN;
        }
        let pred_labels = pred.map_axis(Axis(1), argmax);
        let true_labels = truth.map_axis(Axis(1), argmax);
        let correct = Zip::from(&pred_labels)
            .and(&true_labels)
            .fold(0usize, |acc, p, t| acc + usize::from(p == t));
        correct as f32 / voxels as f32
    }
}

/// Reshape two classes-last arrays of equal shape to `[voxels, classes]`
fn flatten_pair<'p, 't>(
    predicted: ArrayViewD<'p, f32>,
    truth: ArrayViewD<'t, f32>,
) -> Option<(CowArray<'p, f32, Ix2>, CowArray<'t, f32, Ix2>)> {
    if predicted.shape() != truth.shape() {
        return None;
    }
    let classes = *predicted.shape().last()?;
    if classes == 0 {
        return None;
    }
    let voxels = predicted.len() / classes;
    Some((flatten(predicted, voxels, classes)?, flatten(truth, voxels, classes)?))
}

/// Borrow when the layout allows it, copy otherwise
fn flatten<'a>(
    view: ArrayViewD<'a, f32>,
    voxels: usize,
    classes: usize,
) -> Option<CowArray<'a, f32, Ix2>> {
    match view.clone().into_shape_with_order((voxels, classes)) {
        Ok(flat) => Some(CowArray::from(flat)),
        Err(_) => view
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((voxels, classes))
            .ok()
            .map(CowArray::from),
    }
}

fn argmax(lane: ArrayView1<'_, f32>) -> usize {
    let mut best = (0, f32::NEG_INFINITY);
    for (class, &score) in lane.iter().enumerate() {
        if score > best.1 {
            best = (class, score);
        }
    }
    best.0
}
