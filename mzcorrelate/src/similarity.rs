/*! Similarity measures over paired observations and the correlation record built from them */
use std::fmt::Display;

use statrs::statistics::{Data, OrderStatistics, RankTieBreaker, Statistics};

/// The measure used to compare two paired series
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SimilarityMeasure {
    #[default]
    Pearson,
    Spearman,
    Cosine,
    /// Log ratio proportionality, `var(log(x/y)) / var(log x)`, where lower is more similar
    LogRatioVariance1,
    /// Log ratio concordance, `2 cov(log x, log y) / (var(log x) + var(log y))`, between -1 and 1
    LogRatioVariance2,
}

impl Display for SimilarityMeasure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    let cov = xs.iter().covariance(ys.iter());
    let sx = xs.iter().std_dev();
    let sy = ys.iter().std_dev();
    cov / (sx * sy)
}

fn ranks(values: &[f64]) -> Vec<f64> {
    let mut data = Data::new(values.to_vec());
    data.ranks(RankTieBreaker::Average)
}

fn log_all(values: &[f64]) -> Vec<f64> {
    values.iter().map(|v| v.ln()).collect()
}

impl SimilarityMeasure {
    /// Whether lower values of this measure mean more similar series
    pub fn is_distance(&self) -> bool {
        matches!(self, SimilarityMeasure::LogRatioVariance1)
    }

    /// Orient a value of this measure so that higher is always more similar.
    ///
    /// Distances map to `1 - value`, so a perfect match scores `1.0` under every measure.
    pub fn strength(&self, value: f64) -> f64 {
        if self.is_distance() {
            1.0 - value
        } else {
            value
        }
    }

    /// Whether `value` is at least as similar as `threshold`, read on the [`strength`](Self::strength) scale
    pub fn passes(&self, value: f64, threshold: f64) -> bool {
        self.strength(value) >= threshold
    }

    /// Compute the similarity of two equal length series.
    ///
    /// Returns [`None`] when fewer than two points are given or the measure is undefined,
    /// as when either series has no variance.
    pub fn calc(&self, xs: &[f64], ys: &[f64]) -> Option<f64> {
        if xs.len() != ys.len() || xs.len() < 2 {
            return None;
        }
        let value = match self {
            SimilarityMeasure::Pearson => pearson(xs, ys),
            SimilarityMeasure::Spearman => pearson(&ranks(xs), &ranks(ys)),
            SimilarityMeasure::Cosine => {
                let dot: f64 = xs.iter().zip(ys.iter()).map(|(x, y)| x * y).sum();
                let nx: f64 = xs.iter().map(|x| x * x).sum::<f64>().sqrt();
                let ny: f64 = ys.iter().map(|y| y * y).sum::<f64>().sqrt();
                dot / (nx * ny)
            }
            SimilarityMeasure::LogRatioVariance1 => {
                let ratios: Vec<f64> = xs.iter().zip(ys.iter()).map(|(x, y)| (x / y).ln()).collect();
                let lx = log_all(xs);
                ratios.variance() / lx.variance()
            }
            SimilarityMeasure::LogRatioVariance2 => {
                let lx = log_all(xs);
                let ly = log_all(ys);
                2.0 * lx.iter().covariance(ly.iter()) / (lx.iter().variance() + ly.iter().variance())
            }
        };
        value.is_finite().then_some(value)
    }
}

/// A set of paired data points and the similarity computed between them
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CorrelationData {
    pub xs: Vec<f64>,
    pub ys: Vec<f64>,
    pub measure: SimilarityMeasure,
    pub similarity: f64,
}

impl CorrelationData {
    /// Build a correlation record from paired points, returning [`None`] if the
    /// measure is undefined for them
    pub fn new(xs: Vec<f64>, ys: Vec<f64>, measure: SimilarityMeasure) -> Option<Self> {
        let similarity = measure.calc(&xs, &ys)?;
        Some(Self {
            xs,
            ys,
            measure,
            similarity,
        })
    }

    pub fn from_points(points: &[(f64, f64)], measure: SimilarityMeasure) -> Option<Self> {
        let (xs, ys) = points.iter().copied().unzip();
        Self::new(xs, ys, measure)
    }

    /// Pool the data points of several records and correlate them together
    pub fn merge<'a, I: IntoIterator<Item = &'a CorrelationData>>(
        parts: I,
        measure: SimilarityMeasure,
    ) -> Option<Self> {
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        for part in parts {
            xs.extend_from_slice(&part.xs);
            ys.extend_from_slice(&part.ys);
        }
        Self::new(xs, ys, measure)
    }

    pub fn len(&self) -> usize {
        self.xs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }

    /// Recompute the similarity of the stored points with another measure
    pub fn similarity_as(&self, measure: SimilarityMeasure) -> Option<f64> {
        if measure == self.measure {
            Some(self.similarity)
        } else {
            measure.calc(&self.xs, &self.ys)
        }
    }

    /// The similarity oriented so that higher is more similar
    pub fn strength(&self) -> f64 {
        self.measure.strength(self.similarity)
    }

    pub fn min_x(&self) -> f64 {
        self.xs.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn max_x(&self) -> f64 {
        self.xs.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }
}
