//! * High level APIs for running the whole correlation, grouping and annotation workflow
use mzpeaks::Tolerance;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::{
    correlation::{build_correlation_map, CorrelationMap, CorrelationParams, MinimumFeatureFilter},
    grouping::{assign_groups, group_rows, CorrelationEdge, GroupingParams, RowGroup},
    identity::NetworkKey,
    ion_type::IonPart,
    library::{IonLibraryParams, IonTypeLibrary, Polarity},
    msms::{
        check_msms_evidence, group_ms2_similarity, CosineMs2Scorer, Ms2Similarity,
        Ms2SimilarityParams, Ms2SimilarityScorer, MsmsParams, MsmsSummary, NeutralLossCheck,
    },
    network::{build_networks, IonNetwork, IonNetworks, NetworkParams},
    progress::{NoProgress, ProgressSink, StageProgress},
    ranking::rank_all,
    resolver::{
        find_network_adducts, resolve_by_retention_time, resolve_groups, AdductResolver, CheckMode,
    },
    similarity::SimilarityMeasure,
    table::{FeatureTable, RowKey},
};

/// The fraction of overall progress reached at the end of each stage
pub const CORRELATION_STAGE: f64 = 0.5;
pub const GROUPING_STAGE: f64 = 0.6;
pub const MS2_SIMILARITY_STAGE: f64 = 0.8;
pub const ANNOTATION_STAGE: f64 = 0.95;
pub const REFINEMENT_STAGE: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("The {name} tolerance must be positive, got {value}")]
    NonPositiveTolerance { name: &'static str, value: f64 },
    #[error("At least one adduct must be selected")]
    EmptyAdductSelection,
    #[error("The maximum charge must be at least 1, got {0}")]
    InvalidMaxCharge(i32),
    #[error("The maximum number of molecules must be at least 1, got {0}")]
    InvalidMaxMolecules(u32),
    #[error("The minimum sample fraction must be between 0 and 1, got {0}")]
    InvalidSampleFraction(f64),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetaCorrelateError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Row {row} has a feature from sample {sample} but the table only has {n_samples} samples")]
    UnknownSample {
        row: u32,
        sample: usize,
        n_samples: usize,
    },
}

/// A pluggable scorer of molecular formula or isotope pattern agreement for a network.
///
/// No scorer is installed by default, when one is given to [`MetaCorrelateEngine`] its
/// scores are reported for every network.
pub trait FormulaScorer: Send + Sync {
    fn score(&self, network: &IonNetwork, table: &FeatureTable) -> Option<f64>;
}

/// The flat configuration of the whole workflow
#[derive(Debug, Clone)]
pub struct MetaCorrelateParams {
    pub rt_tolerance: f64,
    pub mz_tolerance: Tolerance,
    pub noise_level: f64,
    pub min_height: f64,

    pub min_samples: usize,
    pub min_samples_fraction: f64,

    pub use_shape_correlation: bool,
    pub min_correlated_data_points: usize,
    pub min_correlation_r: f64,
    pub use_total_correlation_filter: bool,
    pub min_total_correlation_r: f64,
    pub similarity_measure: SimilarityMeasure,

    pub use_height_correlation_filter: bool,
    pub min_height_correlation_data_points: usize,
    pub min_height_correlation: f64,

    pub min_group_correlation: f64,

    pub polarity: Polarity,
    pub max_charge: i32,
    pub max_molecules: u32,
    pub selected_adducts: Vec<IonPart>,
    pub selected_modifications: Vec<IonPart>,
    pub check_mode: CheckMode,
    /// Resolve adducts only between members of a group instead of all co-eluting rows
    pub annotate_within_groups: bool,

    pub use_grouping_constraint: bool,
    pub min_network_size: usize,
    /// Try to place unannotated grouped rows into the best network of their group
    pub place_unannotated_rows: bool,

    pub msms_mass_list: String,
    pub msms_min_height: f64,
    pub check_multimers: bool,
    pub check_neutral_losses: bool,
    pub neutral_loss_check: NeutralLossCheck,
    pub ms2_similarity: bool,
    pub min_ms2_matched_signals: usize,
}

impl Default for MetaCorrelateParams {
    fn default() -> Self {
        let correlation = CorrelationParams::default();
        let library = IonLibraryParams::default();
        let msms = MsmsParams::default();
        let ms2 = Ms2SimilarityParams::default();
        let network = NetworkParams::default();
        Self {
            rt_tolerance: correlation.rt_tolerance,
            mz_tolerance: network.mz_tolerance,
            noise_level: correlation.noise_level,
            min_height: correlation.min_height,
            min_samples: correlation.min_feature_filter.min_samples,
            min_samples_fraction: correlation.min_feature_filter.min_fraction,
            use_shape_correlation: correlation.use_shape_correlation,
            min_correlated_data_points: correlation.min_correlated_data_points,
            min_correlation_r: correlation.min_correlation_r,
            use_total_correlation_filter: correlation.use_total_correlation_filter,
            min_total_correlation_r: correlation.min_total_correlation_r,
            similarity_measure: correlation.shape_measure,
            use_height_correlation_filter: correlation.use_height_correlation_filter,
            min_height_correlation_data_points: correlation.min_height_correlation_data_points,
            min_height_correlation: correlation.min_height_correlation,
            min_group_correlation: GroupingParams::default().min_group_correlation,
            polarity: library.polarity,
            max_charge: library.max_charge,
            max_molecules: library.max_molecules,
            selected_adducts: library.adducts,
            selected_modifications: library.modifications,
            check_mode: CheckMode::default(),
            annotate_within_groups: true,
            use_grouping_constraint: network.use_grouping_constraint,
            min_network_size: network.min_network_size,
            place_unannotated_rows: true,
            msms_mass_list: msms.mass_list,
            msms_min_height: msms.min_height,
            check_multimers: msms.check_multimers,
            check_neutral_losses: msms.check_neutral_losses,
            neutral_loss_check: msms.neutral_loss_check,
            ms2_similarity: true,
            min_ms2_matched_signals: ms2.min_matched_signals,
        }
    }
}

fn check_tolerance(name: &'static str, tolerance: Tolerance) -> Result<(), ConfigError> {
    match tolerance {
        Tolerance::PPM(value) | Tolerance::Da(value) => {
            if value > 0.0 {
                Ok(())
            } else {
                Err(ConfigError::NonPositiveTolerance { name, value })
            }
        }
    }
}

impl MetaCorrelateParams {
    /// Check the configuration before any work is done
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_tolerance("m/z", self.mz_tolerance)?;
        if self.rt_tolerance <= 0.0 {
            return Err(ConfigError::NonPositiveTolerance {
                name: "retention time",
                value: self.rt_tolerance,
            });
        }
        if self.selected_adducts.is_empty() {
            return Err(ConfigError::EmptyAdductSelection);
        }
        if self.max_charge < 1 {
            return Err(ConfigError::InvalidMaxCharge(self.max_charge));
        }
        if self.max_molecules < 1 {
            return Err(ConfigError::InvalidMaxMolecules(self.max_molecules));
        }
        if !(0.0..=1.0).contains(&self.min_samples_fraction) {
            return Err(ConfigError::InvalidSampleFraction(self.min_samples_fraction));
        }
        Ok(())
    }

    pub fn correlation_params(&self) -> CorrelationParams {
        CorrelationParams {
            rt_tolerance: self.rt_tolerance,
            noise_level: self.noise_level,
            min_height: self.min_height,
            min_feature_filter: MinimumFeatureFilter::new(
                self.min_samples,
                self.min_samples_fraction,
                self.min_height,
            ),
            use_shape_correlation: self.use_shape_correlation,
            min_correlated_data_points: self.min_correlated_data_points,
            min_correlation_r: self.min_correlation_r,
            use_total_correlation_filter: self.use_total_correlation_filter,
            min_total_correlation_r: self.min_total_correlation_r,
            shape_measure: self.similarity_measure,
            use_height_correlation_filter: self.use_height_correlation_filter,
            min_height_correlation_data_points: self.min_height_correlation_data_points,
            min_height_correlation: self.min_height_correlation,
            height_measure: self.similarity_measure,
        }
    }

    pub fn grouping_params(&self) -> GroupingParams {
        GroupingParams {
            min_group_correlation: self.min_group_correlation,
        }
    }

    pub fn library_params(&self) -> IonLibraryParams {
        IonLibraryParams::new(
            self.polarity,
            self.max_charge,
            self.max_molecules,
            self.selected_adducts.clone(),
            self.selected_modifications.clone(),
        )
    }

    pub fn network_params(&self) -> NetworkParams {
        NetworkParams {
            mz_tolerance: self.mz_tolerance,
            use_grouping_constraint: self.use_grouping_constraint,
            min_network_size: self.min_network_size,
        }
    }

    pub fn msms_params(&self) -> MsmsParams {
        MsmsParams {
            mass_list: self.msms_mass_list.clone(),
            mz_tolerance: self.mz_tolerance,
            min_height: self.msms_min_height,
            check_multimers: self.check_multimers,
            check_neutral_losses: self.check_neutral_losses,
            neutral_loss_check: self.neutral_loss_check,
        }
    }

    pub fn ms2_similarity_params(&self) -> Ms2SimilarityParams {
        Ms2SimilarityParams {
            mass_list: self.msms_mass_list.clone(),
            mz_tolerance: self.mz_tolerance,
            min_height: self.msms_min_height,
            min_matched_signals: self.min_ms2_matched_signals,
            ..Default::default()
        }
    }
}

/// Everything produced by [`MetaCorrelateEngine::run`].
///
/// When `cancelled` is set, the stages that completed before cancellation are kept
/// and the later ones are empty.
#[derive(Debug, Default)]
pub struct MetaCorrelateResult {
    pub table: FeatureTable,
    pub correlations: CorrelationMap,
    pub groups: Vec<RowGroup>,
    pub networks: IonNetworks,
    pub ms2_similarities: Vec<Ms2Similarity>,
    pub msms_summary: MsmsSummary,
    pub formula_scores: Vec<(NetworkKey, f64)>,
    pub cancelled: bool,
}

impl MetaCorrelateResult {
    fn new(table: FeatureTable) -> Self {
        Self {
            table,
            ..Default::default()
        }
    }

    fn cancel(mut self, stage: &str) -> Self {
        info!("Cancelled during {stage}, returning partial results");
        self.cancelled = true;
        self
    }
}

/// Drives the correlation, grouping, annotation and refinement stages over a [`FeatureTable`],
/// holding the generated [`IonTypeLibrary`] so it is reused across runs.
pub struct MetaCorrelateEngine {
    params: MetaCorrelateParams,
    library: IonTypeLibrary,
    ms2_scorer: Box<dyn Ms2SimilarityScorer>,
    formula_scorer: Option<Box<dyn FormulaScorer>>,
}

impl std::fmt::Debug for MetaCorrelateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaCorrelateEngine")
            .field("params", &self.params)
            .field("library", &self.library)
            .field("formula_scorer", &self.formula_scorer.is_some())
            .finish()
    }
}

impl MetaCorrelateEngine {
    /// Create a new engine after validating `params`
    pub fn new(params: MetaCorrelateParams) -> Result<Self, ConfigError> {
        params.validate()?;
        let library = IonTypeLibrary::new(params.library_params());
        Ok(Self {
            params,
            library,
            ms2_scorer: Box::new(CosineMs2Scorer),
            formula_scorer: None,
        })
    }

    pub fn with_ms2_scorer<S: Ms2SimilarityScorer + 'static>(mut self, scorer: S) -> Self {
        self.ms2_scorer = Box::new(scorer);
        self
    }

    pub fn with_formula_scorer<S: FormulaScorer + 'static>(mut self, scorer: S) -> Self {
        self.formula_scorer = Some(Box::new(scorer));
        self
    }

    pub fn params(&self) -> &MetaCorrelateParams {
        &self.params
    }

    pub fn library(&self) -> &IonTypeLibrary {
        &self.library
    }

    fn check_table(table: &FeatureTable) -> Result<(), MetaCorrelateError> {
        let n_samples = table.sample_count();
        for row in table.rows.iter() {
            if let Some(f) = row.features.iter().find(|f| f.sample >= n_samples) {
                return Err(MetaCorrelateError::UnknownSample {
                    row: row.id,
                    sample: f.sample,
                    n_samples,
                });
            }
        }
        Ok(())
    }

    fn place_unannotated_rows(
        &self,
        table: &mut FeatureTable,
        groups: &[RowGroup],
        networks: &mut IonNetworks,
    ) -> usize {
        let mut placed = 0;
        for group in groups {
            let Some(net_key) = networks.best_network_for_group(table, group) else {
                continue;
            };
            for key in group.iter().copied() {
                if table[key].has_ions() {
                    continue;
                }
                if find_network_adducts(
                    table,
                    networks,
                    key,
                    net_key,
                    &self.library,
                    self.params.mz_tolerance,
                )
                .is_some()
                {
                    placed += 1;
                }
            }
        }
        placed
    }

    /// Run every stage on `table`, reporting progress to and polling cancellation from `progress`.
    ///
    /// Any annotations already present on `table` are discarded first.
    #[instrument(skip_all, fields(n_rows = table.len()))]
    pub fn run(
        &self,
        mut table: FeatureTable,
        progress: &dyn ProgressSink,
    ) -> Result<MetaCorrelateResult, MetaCorrelateError> {
        Self::check_table(&table)?;
        table.normalize();
        table.clear_annotations();
        progress.set_progress(0.0);

        let stage = StageProgress::new(progress, 0.0, CORRELATION_STAGE, table.len());
        let correlations = build_correlation_map(&table, &self.params.correlation_params(), &stage);
        let mut result = MetaCorrelateResult::new(table);
        result.correlations = correlations;
        if progress.is_cancelled() {
            return Ok(result.cancel("correlation"));
        }

        let stage = StageProgress::new(progress, CORRELATION_STAGE, GROUPING_STAGE, 1);
        let edges: Vec<CorrelationEdge> = result
            .correlations
            .edges()
            .iter()
            .map(CorrelationEdge::from)
            .collect();
        result.groups = group_rows(&edges, &self.params.grouping_params());
        assign_groups(&mut result.table, &result.groups);
        info!(
            "Grouped {} rows into {} groups",
            result.groups.iter().map(|g| g.len()).sum::<usize>(),
            result.groups.len()
        );
        stage.finish();
        if progress.is_cancelled() {
            return Ok(result.cancel("grouping"));
        }

        let stage = StageProgress::new(
            progress,
            GROUPING_STAGE,
            MS2_SIMILARITY_STAGE,
            result.groups.len(),
        );
        if self.params.ms2_similarity {
            result.ms2_similarities = group_ms2_similarity(
                &result.table,
                &result.groups,
                self.ms2_scorer.as_ref(),
                &self.params.ms2_similarity_params(),
                &stage,
            );
        } else {
            stage.finish();
        }
        if progress.is_cancelled() {
            return Ok(result.cancel("MS2 similarity"));
        }

        let resolver = AdductResolver::new(
            &self.library,
            self.params.mz_tolerance,
            self.params.check_mode,
            self.params.min_height,
        );
        if self.params.annotate_within_groups {
            let stage = StageProgress::new(
                progress,
                MS2_SIMILARITY_STAGE,
                ANNOTATION_STAGE,
                result.groups.len(),
            );
            resolve_groups(&mut result.table, &result.groups, &resolver, &stage);
        } else {
            let stage = StageProgress::new(
                progress,
                MS2_SIMILARITY_STAGE,
                ANNOTATION_STAGE,
                result.table.len(),
            );
            resolve_by_retention_time(
                &mut result.table,
                self.params.rt_tolerance,
                &resolver,
                &stage,
            );
        }
        if progress.is_cancelled() {
            return Ok(result.cancel("annotation"));
        }

        let network_params = self.params.network_params();
        result.networks = build_networks(&mut result.table, &network_params);
        if self.params.place_unannotated_rows {
            let placed =
                self.place_unannotated_rows(&mut result.table, &result.groups, &mut result.networks);
            debug!("Placed {placed} unannotated rows into existing networks");
        }
        progress.set_progress(ANNOTATION_STAGE);

        let stage = StageProgress::new(
            progress,
            ANNOTATION_STAGE,
            REFINEMENT_STAGE,
            result.table.len(),
        );
        result.msms_summary = check_msms_evidence(
            &mut result.table,
            &result.groups,
            &self.params.msms_params(),
            &stage,
        );
        if progress.is_cancelled() {
            return Ok(result.cancel("refinement"));
        }

        result.networks.recalc_connections(&mut result.table);
        let removed = result
            .networks
            .remove_small_networks(&mut result.table, network_params.min_network_size);
        debug!("Removed {removed} networks below the minimum size");
        result.networks.recompute_all(&result.table);
        let n_relations = result
            .networks
            .find_relations(&result.table, &self.params.selected_modifications);
        debug!("Found {n_relations} relations between networks");

        if let Some(scorer) = self.formula_scorer.as_ref() {
            result.formula_scores = result
                .networks
                .iter()
                .filter_map(|net| scorer.score(net, &result.table).map(|s| (net.key, s)))
                .collect();
        }

        rank_all(
            &mut result.table,
            &result.networks,
            &result.groups,
            self.params.annotate_within_groups,
        );
        info!(
            "Finished with {} groups, {} ion identity networks and {} annotated rows",
            result.groups.len(),
            result.networks.len(),
            result.table.rows.iter().filter(|r| r.has_ions()).count()
        );
        progress.set_progress(REFINEMENT_STAGE);
        Ok(result)
    }
}

/// A single-shot run of the whole workflow on `table` without progress reporting.
///
/// # See also
/// [`MetaCorrelateEngine::run`]
pub fn meta_correlate(
    table: FeatureTable,
    params: MetaCorrelateParams,
) -> Result<MetaCorrelateResult, MetaCorrelateError> {
    let engine = MetaCorrelateEngine::new(params)?;
    engine.run(table, &NoProgress)
}

/// The identities of `key` in display form, best first
pub fn describe_row(result: &MetaCorrelateResult, key: RowKey) -> Vec<String> {
    result
        .table
        .get(key)
        .map(|row| row.ions.iter().map(|ion| ion.to_string()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::progress::AtomicProgress;

    #[test]
    fn test_validate() {
        let params = MetaCorrelateParams::default();
        assert!(params.validate().is_ok());

        let mut bad = params.clone();
        bad.mz_tolerance = Tolerance::Da(0.0);
        assert!(matches!(
            bad.validate(),
            Err(ConfigError::NonPositiveTolerance { .. })
        ));

        let mut bad = params.clone();
        bad.mz_tolerance = Tolerance::PPM(-5.0);
        assert!(bad.validate().is_err());

        let mut bad = params.clone();
        bad.selected_adducts.clear();
        assert_eq!(bad.validate(), Err(ConfigError::EmptyAdductSelection));

        let mut bad = params.clone();
        bad.max_charge = 0;
        assert_eq!(bad.validate(), Err(ConfigError::InvalidMaxCharge(0)));

        let mut bad = params.clone();
        bad.max_molecules = 0;
        assert_eq!(bad.validate(), Err(ConfigError::InvalidMaxMolecules(0)));

        let mut bad = params.clone();
        bad.min_samples_fraction = 1.5;
        assert!(MetaCorrelateEngine::new(bad).is_err());
    }

    #[test]
    fn test_params_round_trip() {
        let params = MetaCorrelateParams::default();
        assert_eq!(params.correlation_params(), CorrelationParams::default());
        assert_eq!(params.library_params(), IonLibraryParams::default());
        assert_eq!(params.grouping_params(), GroupingParams::default());
    }

    #[test_log::test]
    fn test_empty_and_cancelled() {
        let engine = MetaCorrelateEngine::new(MetaCorrelateParams::default()).unwrap();
        let result = engine.run(FeatureTable::default(), &NoProgress).unwrap();
        assert!(!result.cancelled);
        assert!(result.groups.is_empty());
        assert!(result.networks.is_empty());

        let progress = AtomicProgress::new();
        progress.cancel();
        let result = engine.run(FeatureTable::default(), &progress).unwrap();
        assert!(result.cancelled);
        assert!(result.groups.is_empty());
    }

    #[test]
    fn test_unknown_sample() {
        use crate::table::{Feature, Row};
        let table = FeatureTable::new(
            vec!["a".into()],
            vec![Row::new(1, 100.0, 1.0, 0, vec![Feature::new(3, 1.0, 100.0, 1e6)])],
        );
        let err = meta_correlate(table, MetaCorrelateParams::default()).unwrap_err();
        assert!(matches!(err, MetaCorrelateError::UnknownSample { sample: 3, .. }));
    }
}
