// task/container.rs -- Images, ROIs and results of one DIC task.
//
// The container is shared (`Arc<TaskContainer>`) between the engine thread
// and the background strain/overlap jobs running on the worker pool, so
// every mutable part sits behind a lock:
//
//   resolved    RwLock   written once per run by `validate`, read by all
//   filtered    Mutex    per-image cache of pre-filtered images
//   results     Mutex    (from, to) -> RoundResult
//
// Results are keyed by the image pair they relate. Direct round results use
// consecutive pairs (r, r + 1); cumulative results use (first, to). A
// result stays until the next `compute_task` clears the map.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use log::debug;

use crate::config::{TaskParameters, TaskSettings};
use crate::correlation::CorrelationResult;
use crate::deformation::DeformationLimits;
use crate::displacement::DisplacementResult;
use crate::error::{DicError, Result};
use crate::facet::Facet;
use crate::image::Image;
use crate::roi::Roi;
use crate::strain::StrainResult;

/// A ROI as declared, with optional per-ROI overrides.
#[derive(Debug, Clone)]
pub struct RoiSpec {
    pub roi: Roi,
    pub facet_size: Option<usize>,
    pub limits: Option<Vec<f64>>,
}

/// A ROI with every setting resolved.
#[derive(Debug, Clone)]
pub struct RoiSettings {
    pub roi: Roi,
    pub facet_size: usize,
    pub limits: Arc<DeformationLimits>,
}

/// Correlation outcome of one ROI.
#[derive(Debug, Clone)]
pub struct RoiResult {
    pub roi: Roi,
    pub facets: Vec<Facet>,
    /// Aligned with `facets`; `None` where no result was produced.
    pub results: Vec<Option<CorrelationResult>>,
}

/// Everything computed for one image pair.
#[derive(Debug, Clone, Default)]
pub struct RoundResult {
    /// Per-ROI correlation results. Empty for cumulative results.
    pub rois: Vec<RoiResult>,
    pub displacement: Option<Arc<DisplacementResult>>,
    pub strain: Option<Arc<StrainResult>>,
    /// False when the round was cut short by a stop request.
    pub complete: bool,
}

#[derive(Debug, Default)]
struct Resolved {
    settings: Option<TaskSettings>,
    rois: BTreeMap<usize, Vec<RoiSettings>>,
}

/// Input data and results of a DIC task.
#[derive(Debug)]
pub struct TaskContainer {
    images: Vec<Arc<Image<f32>>>,
    params: TaskParameters,
    roi_specs: BTreeMap<usize, Vec<RoiSpec>>,
    resolved: RwLock<Resolved>,
    filtered: Mutex<HashMap<usize, Arc<Image<f32>>>>,
    results: Mutex<BTreeMap<(usize, usize), RoundResult>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TaskContainer {
    pub fn new(images: Vec<Image<f32>>, params: TaskParameters) -> Self {
        TaskContainer {
            images: images.into_iter().map(Arc::new).collect(),
            params,
            roi_specs: BTreeMap::new(),
            resolved: RwLock::new(Resolved::default()),
            filtered: Mutex::new(HashMap::new()),
            results: Mutex::new(BTreeMap::new()),
        }
    }

    /// Add a ROI to `round` (source image index) using task-level settings.
    pub fn add_roi(&mut self, round: usize, roi: Roi) {
        self.add_roi_spec(round, RoiSpec { roi, facet_size: None, limits: None });
    }

    pub fn add_roi_spec(&mut self, round: usize, spec: RoiSpec) {
        self.roi_specs.entry(round).or_default().push(spec);
    }

    pub fn params(&self) -> &TaskParameters {
        &self.params
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image(&self, index: usize) -> Option<&Arc<Image<f32>>> {
        self.images.get(index)
    }

    /// Resolve parameters and per-round ROIs.
    ///
    /// A round without declared ROIs gets a whole-image rectangle. ROI
    /// overrides fall back to the task-level facet size and limits.
    pub fn validate(&self) -> Result<TaskSettings> {
        let settings = self.params.resolve(self.images.len())?;
        let first = &self.images[0];
        if let Some((i, img)) = self
            .images
            .iter()
            .enumerate()
            .find(|(_, img)| (img.width(), img.height()) != (first.width(), first.height()))
        {
            return Err(DicError::InvalidConfiguration(format!(
                "image {i} is {}x{}, expected {}x{}",
                img.width(),
                img.height(),
                first.width(),
                first.height()
            )));
        }

        let mut rois = BTreeMap::new();
        for &(from, _) in &settings.rounds {
            let img = &self.images[from];
            let specs = self.roi_specs.get(&from).cloned().unwrap_or_default();
            let specs = if specs.is_empty() {
                vec![RoiSpec { roi: Roi::full_image(img.width(), img.height()), facet_size: None, limits: None }]
            } else {
                specs
            };

            let mut resolved = Vec::with_capacity(specs.len());
            for spec in specs {
                if !spec.roi.fits_in(img.width(), img.height()) {
                    return Err(DicError::InvalidConfiguration(format!(
                        "ROI {:?} of round {from} exceeds the {}x{} image",
                        spec.roi,
                        img.width(),
                        img.height()
                    )));
                }
                let facet_size = spec.facet_size.unwrap_or(settings.facet_size);
                if facet_size <= settings.facet_spacing {
                    return Err(DicError::InvalidConfiguration(format!(
                        "facet size {facet_size} of ROI {:?} not larger than spacing {}",
                        spec.roi, settings.facet_spacing
                    )));
                }
                let limits = match &spec.limits {
                    Some(flat) => Arc::new(DeformationLimits::new(flat)?),
                    None => settings.limits.clone(),
                };
                resolved.push(RoiSettings { roi: spec.roi, facet_size, limits });
            }
            rois.insert(from, resolved);
        }

        let mut guard = self.resolved.write().unwrap_or_else(PoisonError::into_inner);
        guard.settings = Some(settings.clone());
        guard.rois = rois;
        Ok(settings)
    }

    /// Settings of the last successful `validate`.
    pub fn settings(&self) -> Option<TaskSettings> {
        self.resolved.read().unwrap_or_else(PoisonError::into_inner).settings.clone()
    }

    /// Resolved ROIs of `round`; empty before `validate`.
    pub fn round_rois(&self, round: usize) -> Vec<RoiSettings> {
        self.resolved
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .rois
            .get(&round)
            .cloned()
            .unwrap_or_default()
    }

    /// Pre-filtered copy of image `index`, computed once and cached.
    pub fn filtered_image(&self, index: usize, kernel_size: usize) -> Result<Arc<Image<f32>>> {
        if let Some(img) = lock(&self.filtered).get(&index) {
            return Ok(img.clone());
        }
        let src = self.images.get(index).ok_or_else(|| {
            DicError::InvalidConfiguration(format!("no image with index {index}"))
        })?;
        let img = Arc::new(src.filtered(kernel_size));
        debug!("filtered image {index} with kernel {kernel_size}");
        Ok(lock(&self.filtered).entry(index).or_insert(img).clone())
    }

    pub fn store_result(&self, from: usize, to: usize, result: RoundResult) {
        lock(&self.results).insert((from, to), result);
    }

    /// Attach a strain field to the result of `(from, to)`. An incomplete
    /// field marks the whole result incomplete.
    pub fn store_strain(&self, from: usize, to: usize, strain: Arc<StrainResult>, complete: bool) {
        let mut results = lock(&self.results);
        let entry = results.entry((from, to)).or_default();
        entry.strain = Some(strain);
        entry.complete &= complete;
    }

    /// Flag a stored result as cut short.
    pub fn mark_incomplete(&self, from: usize, to: usize) {
        if let Some(entry) = lock(&self.results).get_mut(&(from, to)) {
            entry.complete = false;
        }
    }

    pub fn result(&self, from: usize, to: usize) -> Option<RoundResult> {
        lock(&self.results).get(&(from, to)).cloned()
    }

    /// All stored image pairs in ascending order.
    pub fn result_keys(&self) -> Vec<(usize, usize)> {
        lock(&self.results).keys().copied().collect()
    }

    /// Drop results and the filter cache.
    pub fn clear_results(&self) {
        lock(&self.results).clear();
        lock(&self.filtered).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn images(n: usize) -> Vec<Image<f32>> {
        (0..n).map(|i| Image::from_fn(40, 30, |x, y| (x + y + i) as f32)).collect()
    }

    #[test]
    fn missing_roi_defaults_to_full_image() {
        let tc = TaskContainer::new(images(3), TaskParameters::default());
        tc.validate().unwrap();
        let rois = tc.round_rois(1);
        assert_eq!(rois.len(), 1);
        assert_eq!(rois[0].roi, Roi::full_image(40, 30));
        assert_eq!(rois[0].facet_size, 10);
    }

    #[test]
    fn roi_overrides_are_resolved() {
        let mut tc = TaskContainer::new(images(2), TaskParameters::default());
        tc.add_roi_spec(
            0,
            RoiSpec {
                roi: Roi::Rectangle { x1: 2, y1: 2, x2: 30, y2: 20 },
                facet_size: Some(7),
                limits: Some(vec![-1.0, 1.0, 0.5, -1.0, 1.0, 0.5]),
            },
        );
        tc.validate().unwrap();
        let rois = tc.round_rois(0);
        assert_eq!(rois[0].facet_size, 7);
        assert_eq!(rois[0].limits.count(), 25);
    }

    #[test]
    fn roi_outside_image_is_rejected() {
        let mut tc = TaskContainer::new(images(2), TaskParameters::default());
        tc.add_roi(0, Roi::Rectangle { x1: 0, y1: 0, x2: 40, y2: 10 });
        assert!(matches!(tc.validate(), Err(DicError::InvalidConfiguration(_))));
    }

    #[test]
    fn image_size_mismatch_is_rejected() {
        let mut imgs = images(2);
        imgs.push(Image::new(10, 10));
        let tc = TaskContainer::new(imgs, TaskParameters::default());
        assert!(tc.validate().is_err());
    }

    #[test]
    fn filtered_image_is_cached() {
        let tc = TaskContainer::new(images(2), TaskParameters::default());
        let a = tc.filtered_image(1, 5).unwrap();
        let b = tc.filtered_image(1, 5).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(tc.filtered_image(7, 5).is_err());
    }

    #[test]
    fn results_store_and_clear() {
        let tc = TaskContainer::new(images(3), TaskParameters::default());
        tc.store_result(0, 1, RoundResult { complete: true, ..Default::default() });
        tc.store_result(1, 2, RoundResult::default());
        assert_eq!(tc.result_keys(), vec![(0, 1), (1, 2)]);
        assert!(tc.result(0, 1).unwrap().complete);
        tc.clear_results();
        assert!(tc.result(0, 1).is_none());
    }
}
