/*! Row-to-row correlation of chromatographic shapes and intensity profiles */
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::progress::StageProgress;
use crate::similarity::{CorrelationData, SimilarityMeasure};
use crate::table::{Feature, FeatureTable, Row, RowKey};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CorrelationError {
    #[error("Scan numbers of rows {row_a} and {row_b} diverge in sample {sample}: expected {expected}, found {found}")]
    ScanMismatch {
        row_a: u32,
        row_b: u32,
        sample: usize,
        expected: u32,
        found: u32,
    },
}

/// Reasons a row pair was not correlated although it co-eluted at least once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NegativeMarker {
    /// Each row is detected in samples where the other is absent
    AntiOverlap,
    /// Too few samples contain both rows
    MinFeaturesRequirementNotMet,
    /// Too few shared samples fall within the retention time tolerance
    OutOfRtRange,
}

impl Display for NegativeMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The result of testing two rows for shared detections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapResult {
    Overlap,
    AntiOverlap,
    BelowMinSamples,
    OutOfRtRange,
}

impl OverlapResult {
    pub fn negative_marker(&self) -> Option<NegativeMarker> {
        match self {
            OverlapResult::Overlap => None,
            OverlapResult::AntiOverlap => Some(NegativeMarker::AntiOverlap),
            OverlapResult::BelowMinSamples => Some(NegativeMarker::MinFeaturesRequirementNotMet),
            OverlapResult::OutOfRtRange => Some(NegativeMarker::OutOfRtRange),
        }
    }
}

/// Requires a row, or a row pair, to be detected above a minimum height in a
/// minimum number or fraction of samples
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MinimumFeatureFilter {
    pub min_samples: usize,
    /// Fraction of all samples, between 0 and 1
    pub min_fraction: f64,
    pub min_height: f64,
}

impl Default for MinimumFeatureFilter {
    fn default() -> Self {
        Self {
            min_samples: 1,
            min_fraction: 0.0,
            min_height: 1e5,
        }
    }
}

impl MinimumFeatureFilter {
    pub fn new(min_samples: usize, min_fraction: f64, min_height: f64) -> Self {
        Self {
            min_samples,
            min_fraction,
            min_height,
        }
    }

    /// The number of samples required out of `n_samples`
    pub fn required(&self, n_samples: usize) -> usize {
        let by_fraction = (self.min_fraction * n_samples as f64).ceil() as usize;
        self.min_samples.max(by_fraction).max(1)
    }

    pub fn filter_row(&self, row: &Row, n_samples: usize) -> bool {
        row.count_features_above(self.min_height) >= self.required(n_samples)
    }

    fn is_detected(&self, feature: Option<&Feature>) -> bool {
        feature.is_some_and(|f| f.height >= self.min_height)
    }

    /// Check whether `a` and `b` are detected together in enough samples, and co-elute in them
    pub fn filter_overlap(
        &self,
        a: &Row,
        b: &Row,
        n_samples: usize,
        rt_tolerance: f64,
    ) -> OverlapResult {
        let required = self.required(n_samples);
        let mut both = 0;
        let mut within_rt = 0;
        let mut only_a = 0;
        let mut only_b = 0;
        for sample in 0..n_samples {
            let fa = a.feature(sample);
            let fb = b.feature(sample);
            match (self.is_detected(fa), self.is_detected(fb)) {
                (true, true) => {
                    both += 1;
                    if let (Some(fa), Some(fb)) = (fa, fb) {
                        if (fa.rt - fb.rt).abs() <= rt_tolerance {
                            within_rt += 1;
                        }
                    }
                }
                (true, false) => only_a += 1,
                (false, true) => only_b += 1,
                (false, false) => {}
            }
        }
        if both < required {
            if only_a > 0 && only_b > 0 {
                OverlapResult::AntiOverlap
            } else {
                OverlapResult::BelowMinSamples
            }
        } else if within_rt < required {
            OverlapResult::OutOfRtRange
        } else {
            OverlapResult::Overlap
        }
    }
}

/// Parameters controlling which row pairs are correlated and which correlations are kept
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CorrelationParams {
    pub rt_tolerance: f64,
    pub noise_level: f64,
    pub min_height: f64,
    pub min_feature_filter: MinimumFeatureFilter,
    /// Group by feature shape correlation, or by retention time alone
    pub use_shape_correlation: bool,
    pub min_correlated_data_points: usize,
    pub min_correlation_r: f64,
    pub use_total_correlation_filter: bool,
    pub min_total_correlation_r: f64,
    pub shape_measure: SimilarityMeasure,
    pub use_height_correlation_filter: bool,
    pub min_height_correlation_data_points: usize,
    pub min_height_correlation: f64,
    pub height_measure: SimilarityMeasure,
}

impl Default for CorrelationParams {
    fn default() -> Self {
        Self {
            rt_tolerance: 0.2,
            noise_level: 1e4,
            min_height: 1e5,
            min_feature_filter: MinimumFeatureFilter::default(),
            use_shape_correlation: true,
            min_correlated_data_points: 5,
            min_correlation_r: 0.85,
            use_total_correlation_filter: false,
            min_total_correlation_r: 0.5,
            shape_measure: SimilarityMeasure::Pearson,
            use_height_correlation_filter: false,
            min_height_correlation_data_points: 5,
            min_height_correlation: 0.3,
            height_measure: SimilarityMeasure::Pearson,
        }
    }
}

impl CorrelationParams {
    /// Whether any sample holds both rows above the minimum height within the retention time tolerance
    pub fn check_rt_range(&self, a: &Row, b: &Row) -> bool {
        a.features.iter().any(|fa| {
            b.feature(fa.sample).is_some_and(|fb| {
                fa.height >= self.min_height
                    && fb.height >= self.min_height
                    && (fa.rt - fb.rt).abs() <= self.rt_tolerance
            })
        })
    }
}

/// The correlation of one unordered row pair.
///
/// The pair is always stored with the lower row id first so the record is identical
/// no matter which row was visited first.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct R2RCorrelationData {
    pub id_a: u32,
    pub id_b: u32,
    pub key_a: RowKey,
    pub key_b: RowKey,
    /// Feature shape correlation per sample
    pub shape: BTreeMap<usize, CorrelationData>,
    /// The shape correlation of all contributing points pooled together
    pub total: Option<CorrelationData>,
    /// The correlation of feature heights across samples
    pub height: Option<CorrelationData>,
    pub markers: Vec<NegativeMarker>,
}

impl R2RCorrelationData {
    fn new(key_a: RowKey, a: &Row, key_b: RowKey, b: &Row) -> Self {
        Self {
            id_a: a.id,
            id_b: b.id,
            key_a,
            key_b,
            shape: BTreeMap::new(),
            total: None,
            height: None,
            markers: Vec::new(),
        }
    }

    pub fn has_shape_correlation(&self) -> bool {
        !self.shape.is_empty()
    }

    /// The mean per-sample shape similarity
    pub fn avg_shape_r(&self) -> Option<f64> {
        if self.shape.is_empty() {
            None
        } else {
            let total: f64 = self.shape.values().map(|c| c.similarity).sum();
            Some(total / self.shape.len() as f64)
        }
    }

    pub fn min_shape_r(&self) -> Option<f64> {
        self.shape
            .values()
            .map(|c| c.similarity)
            .min_by(|a, b| a.total_cmp(b))
    }

    pub fn max_shape_r(&self) -> Option<f64> {
        self.shape
            .values()
            .map(|c| c.similarity)
            .max_by(|a, b| a.total_cmp(b))
    }

    pub fn total_r(&self) -> Option<f64> {
        self.total.as_ref().map(|c| c.similarity)
    }

    pub fn height_r(&self) -> Option<f64> {
        self.height.as_ref().map(|c| c.similarity)
    }

    /// A pair without negative markers is an edge for grouping
    pub fn is_edge(&self) -> bool {
        self.markers.is_empty()
    }

    /// The strength of this edge, the mean shape similarity, falling back to the height
    /// similarity and then to `1.0` for pairs grouped on retention time alone.
    ///
    /// Always oriented so that higher is more similar, whatever the measure.
    pub fn score(&self) -> f64 {
        if !self.shape.is_empty() {
            let total: f64 = self.shape.values().map(|c| c.strength()).sum();
            return total / self.shape.len() as f64;
        }
        self.height.as_ref().map(|c| c.strength()).unwrap_or(1.0)
    }

    pub fn other(&self, key: RowKey) -> RowKey {
        if key == self.key_a {
            self.key_b
        } else {
            self.key_a
        }
    }
}

fn pair_id(a: u32, b: u32) -> (u32, u32) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// A map of row pair correlations keyed by the unordered pair of row ids.
///
/// Insertion is safe from many threads at once.
#[derive(Debug, Default)]
pub struct CorrelationMap {
    entries: Mutex<BTreeMap<(u32, u32), R2RCorrelationData>>,
}

impl CorrelationMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(u32, u32), R2RCorrelationData>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, data: R2RCorrelationData) {
        let key = pair_id(data.id_a, data.id_b);
        self.lock().insert(key, data);
    }

    pub fn get(&self, a: u32, b: u32) -> Option<R2RCorrelationData> {
        self.lock().get(&pair_id(a, b)).cloned()
    }

    pub fn contains(&self, a: u32, b: u32) -> bool {
        self.lock().contains_key(&pair_id(a, b))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// All accepted edges in id order
    pub fn edges(&self) -> Vec<R2RCorrelationData> {
        self.lock().values().filter(|c| c.is_edge()).cloned().collect()
    }

    pub fn into_inner(self) -> BTreeMap<(u32, u32), R2RCorrelationData> {
        self.entries.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl FromIterator<R2RCorrelationData> for CorrelationMap {
    fn from_iter<T: IntoIterator<Item = R2RCorrelationData>>(iter: T) -> Self {
        let map = Self::new();
        for c in iter {
            map.add(c);
        }
        map
    }
}

/// Correlate the profiles of two features of the same sample over their shared scans
pub fn correlate_feature_shapes(
    a: &Feature,
    b: &Feature,
    ids: (u32, u32),
    params: &CorrelationParams,
) -> Result<Option<CorrelationData>, CorrelationError> {
    let (pa, pb) = (&a.profile, &b.profile);
    let (Some(first_a), Some(first_b)) = (pa.first(), pb.first()) else {
        return Ok(None);
    };

    // Offset of the later starting profile within the earlier one
    let (offset_a, offset_b) = if first_a.scan <= first_b.scan {
        match pa.binary_search_by_key(&first_b.scan, |p| p.scan) {
            Ok(i) => (i, 0),
            Err(_) => return Ok(None),
        }
    } else {
        match pb.binary_search_by_key(&first_a.scan, |p| p.scan) {
            Ok(i) => (0, i),
            Err(_) => return Ok(None),
        }
    };

    let mut xs = Vec::new();
    let mut ys = Vec::new();
    for (x, y) in pa[offset_a..].iter().zip(pb[offset_b..].iter()) {
        if x.scan != y.scan {
            return Err(CorrelationError::ScanMismatch {
                row_a: ids.0,
                row_b: ids.1,
                sample: a.sample,
                expected: x.scan,
                found: y.scan,
            });
        }
        if x.intensity >= params.noise_level && y.intensity >= params.noise_level {
            xs.push(x.intensity);
            ys.push(y.intensity);
        }
    }

    if xs.len() < params.min_correlated_data_points.max(2) {
        return Ok(None);
    }
    Ok(CorrelationData::new(xs, ys, params.shape_measure))
}

/// Correlate the heights of two rows across the samples both were detected in
pub fn correlate_heights(a: &Row, b: &Row, params: &CorrelationParams) -> Option<CorrelationData> {
    let (xs, ys): (Vec<f64>, Vec<f64>) = a
        .features
        .iter()
        .filter_map(|fa| b.feature(fa.sample).map(|fb| (fa.height, fb.height)))
        .unzip();
    if xs.len() < params.min_height_correlation_data_points.max(2) {
        return None;
    }
    CorrelationData::new(xs, ys, params.height_measure)
}

/// Correlate one row pair.
///
/// Returns `Ok(None)` when the rows never co-elute or when a correlation filter rejects
/// the pair. Pairs failing the minimum feature overlap are returned with their
/// [`NegativeMarker`] and no correlation.
pub fn correlate_rows(
    key_a: RowKey,
    a: &Row,
    key_b: RowKey,
    b: &Row,
    n_samples: usize,
    params: &CorrelationParams,
) -> Result<Option<R2RCorrelationData>, CorrelationError> {
    // Symmetric by construction
    if b.id < a.id {
        return correlate_rows(key_b, b, key_a, a, n_samples, params);
    }

    if !params.check_rt_range(a, b) {
        return Ok(None);
    }

    let mut data = R2RCorrelationData::new(key_a, a, key_b, b);
    let overlap = params
        .min_feature_filter
        .filter_overlap(a, b, n_samples, params.rt_tolerance);
    if let Some(marker) = overlap.negative_marker() {
        data.markers.push(marker);
        return Ok(Some(data));
    }

    if params.use_shape_correlation {
        for fa in a.features.iter() {
            if let Some(fb) = b.feature(fa.sample) {
                if let Some(corr) = correlate_feature_shapes(fa, fb, (a.id, b.id), params)? {
                    data.shape.insert(fa.sample, corr);
                }
            }
        }
        data.total = CorrelationData::merge(data.shape.values(), params.shape_measure);
    }

    data.height = correlate_heights(a, b, params);
    if params.use_height_correlation_filter {
        if let Some(r) = data.height_r() {
            if !params.height_measure.passes(r, params.min_height_correlation) {
                return Ok(None);
            }
        }
    }

    if params.use_shape_correlation && !check_shape_correlation(&data, params) {
        return Ok(None);
    }
    Ok(Some(data))
}

fn check_shape_correlation(data: &R2RCorrelationData, params: &CorrelationParams) -> bool {
    let Some(avg) = data.avg_shape_r() else {
        return false;
    };
    if params.use_total_correlation_filter {
        match data.total_r() {
            Some(total) if params.shape_measure.passes(total, params.min_total_correlation_r) => {}
            _ => return false,
        }
    }
    params.shape_measure.passes(avg, params.min_correlation_r)
}

/// Correlate all row pairs of `table` concurrently
pub(crate) fn build_correlation_map(
    table: &FeatureTable,
    params: &CorrelationParams,
    progress: &StageProgress<'_>,
) -> CorrelationMap {
    info!("Creating row to row correlation map for {} rows", table.len());
    let n_samples = table.sample_count();
    let map = CorrelationMap::new();
    let failures = AtomicUsize::new(0);

    let candidates: Vec<RowKey> = table
        .iter()
        .filter(|(_, row)| params.min_feature_filter.filter_row(row, n_samples))
        .map(|(k, _)| k)
        .collect();
    debug!(
        "{} of {} rows pass the minimum feature filter",
        candidates.len(),
        table.len()
    );

    (0..candidates.len()).into_par_iter().for_each(|i| {
        if progress.is_cancelled() {
            return;
        }
        let key_a = candidates[i];
        let a = &table[key_a];
        for key_b in candidates[i + 1..].iter().copied() {
            if progress.is_cancelled() {
                break;
            }
            let b = &table[key_b];
            match correlate_rows(key_a, a, key_b, b, n_samples, params) {
                Ok(Some(data)) => map.add(data),
                Ok(None) => {}
                Err(e) => {
                    warn!("Failed to correlate rows: {e}");
                    failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        progress.tick();
    });

    let (n_r2r, n_f2f) = map
        .lock()
        .values()
        .filter(|c| c.has_shape_correlation())
        .fold((0, 0), |(n, f), c| (n + 1, f + c.shape.len()));
    info!(
        "Correlations done with {} R2R correlations and {} F2F correlations",
        n_r2r, n_f2f
    );
    let failures = failures.load(Ordering::Relaxed);
    if failures > 0 {
        warn!("{failures} row pairs were excluded after correlation errors");
    }
    progress.finish();
    map
}
