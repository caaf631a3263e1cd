use std::fs;
use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::Instant;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use mzcorrelate::{
    ion_type::IonPart, ConfigError, FeatureTable, MetaCorrelateEngine, MetaCorrelateError,
    MetaCorrelateParams, MetaCorrelateResult,
};

use crate::args::{
    ArgAdduct, ArgCheckMode, ArgModification, ArgPolarity, ArgSimilarityMeasure,
    ArgToleranceUnit, MsmsOptions,
};
use crate::progress::{report_progress, ChannelProgress, PROGRESS_BUFFER_SIZE};
use crate::write::write_output;

fn non_negative_float_f64(s: &str) -> Result<f64, String> {
    let value = s.parse::<f64>().map_err(|e| e.to_string())?;
    if value < 0.0 {
        Err(format!("`{s}` is less than zero"))
    } else {
        Ok(value)
    }
}

fn fraction_f64(s: &str) -> Result<f64, String> {
    let value = non_negative_float_f64(s)?;
    if value > 1.0 {
        Err(format!("`{s}` is greater than one"))
    } else {
        Ok(value)
    }
}

#[derive(Debug, Error)]
pub enum MZCorrelaterError {
    #[error("An IO error occurred: {0}")]
    IOError(
        #[source]
        #[from]
        io::Error,
    ),
    #[error("Failed to read the feature table: {0}")]
    JSONError(
        #[source]
        #[from]
        serde_json::Error,
    ),
    #[error("Failed to read the configuration: {0}")]
    ConfigurationError(
        #[source]
        #[from]
        figment::Error,
    ),
    #[error("Invalid parameters: {0}")]
    InvalidParameters(
        #[source]
        #[from]
        ConfigError,
    ),
    #[error("Failed to process the feature table: {0}")]
    ProcessingError(
        #[source]
        #[from]
        MetaCorrelateError,
    ),
    #[error("Failed to build the thread pool: {0}")]
    ThreadPoolError(
        #[source]
        #[from]
        rayon::ThreadPoolBuildError,
    ),
}

/// Correlation grouping and ion identity networking of LC-MS feature tables.
///
/// Read an aligned feature table as JSON from a file or stream, group co-eluting rows,
/// annotate them with ion identities and write out the groups, ion identity networks
/// and ranked identities of every row as JSON.
#[derive(Parser, Debug, Deserialize, Serialize)]
#[command(author, version)]
pub struct MZCorrelater {
    /// The path to read the input feature table from, or if '-' is passed, read from STDIN
    #[arg()]
    pub input_file: String,

    /// The path to write the output file to, or if '-' is passed, write to STDOUT
    #[arg(short = 'o', long = "output-file", default_value = "-")]
    pub output_file: PathBuf,

    /// The path to write a log file to, in addition to STDERR
    #[arg(short = 'l', long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// A TOML configuration file to read additional parameters from.
    ///
    /// Configurations are also read from `mzcorrelater.toml` in the working directory.
    /// Environment variables prefixed with `MZCORRELATER_` will be read too.
    #[arg(long = "config-file")]
    pub config_file: Option<PathBuf>,

    /// The number of threads to use, passing a value < 1 to use all available threads
    #[arg(
        short='t',
        long="threads",
        default_value_t=-1,
    )]
    pub threads: i32,

    /// The maximum retention time difference between co-eluting features
    #[arg(
        short = 'r',
        long = "rt-tolerance",
        default_value_t = 0.2,
        value_parser = non_negative_float_f64
    )]
    pub rt_tolerance: f64,

    /// The m/z tolerance for matching ion identities, in units of `--tolerance-unit`
    #[arg(
        short = 'm',
        long = "mz-tolerance",
        default_value_t = 0.005,
        value_parser = non_negative_float_f64
    )]
    pub mz_tolerance: f64,

    #[arg(
        short = 'u',
        long = "tolerance-unit",
        default_value = "da",
        help = "The unit of the m/z tolerance"
    )]
    pub tolerance_unit: ArgToleranceUnit,

    /// The intensity below which chromatogram points are ignored
    #[arg(
        short = 'n',
        long = "noise-level",
        default_value_t = 1e4,
        value_parser = non_negative_float_f64
    )]
    pub noise_level: f64,

    /// The minimum height of a feature to take part in correlation and annotation
    #[arg(
        short = 'H',
        long = "min-height",
        default_value_t = 1e5,
        value_parser = non_negative_float_f64
    )]
    pub min_height: f64,

    /// The minimum number of samples a row must be detected in
    #[arg(long = "min-samples", default_value_t = 1)]
    pub min_samples: usize,

    /// The minimum fraction of samples a row must be detected in
    #[arg(
        long = "min-samples-fraction",
        default_value_t = 0.0,
        value_parser = fraction_f64
    )]
    pub min_samples_fraction: f64,

    /// The minimum number of shared chromatogram points to correlate two features
    #[arg(short = 'd', long = "min-data-points", default_value_t = 5)]
    pub min_correlated_data_points: usize,

    /// The minimum feature shape correlation
    #[arg(short = 'c', long = "min-correlation", default_value_t = 0.85)]
    pub min_correlation_r: f64,

    /// Reject row pairs whose pooled shape correlation across samples is too low
    #[arg(long = "min-total-correlation")]
    pub min_total_correlation_r: Option<f64>,

    /// Reject row pairs whose feature heights do not correlate across samples
    #[arg(long = "min-height-correlation")]
    pub min_height_correlation: Option<f64>,

    /// The measure used to compare feature shapes and heights
    #[arg(short = 's', long = "similarity", default_value = "pearson")]
    pub similarity_measure: ArgSimilarityMeasure,

    /// The minimum correlation of the edges kept when splitting sparse groups
    #[arg(long = "min-group-correlation", default_value_t = 0.0)]
    pub min_group_correlation: f64,

    #[arg(
        short = 'p',
        long = "polarity",
        default_value = "positive",
        help = "The ionization polarity"
    )]
    pub polarity: ArgPolarity,

    /// The maximum absolute charge of an ion identity
    #[arg(short = 'z', long = "max-charge", default_value_t = 2)]
    pub max_charge: i32,

    /// The maximum number of molecules in a multimer
    #[arg(short = 'M', long = "max-molecules", default_value_t = 3)]
    pub max_molecules: u32,

    /// The adducts to consider, defaulting to the common adducts of the selected polarity
    #[arg(short = 'a', long = "adduct")]
    pub adducts: Vec<ArgAdduct>,

    /// The in-source modifications to consider, defaulting to the common losses and clusters
    #[arg(short = 'x', long = "modification")]
    pub modifications: Vec<ArgModification>,

    /// Do not consider any in-source modifications
    #[arg(long = "no-modifications")]
    pub no_modifications: bool,

    #[arg(
        short = 'k',
        long = "check-mode",
        default_value = "average",
        help = "How the m/z values of two rows are compared"
    )]
    pub check_mode: ArgCheckMode,

    /// Resolve ion identities between all co-eluting rows instead of only within groups
    #[arg(long = "annotate-by-rt")]
    pub annotate_by_rt: bool,

    /// Allow an ion identity network to span more than one group
    #[arg(long = "no-grouping-constraint")]
    pub no_grouping_constraint: bool,

    /// The smallest ion identity network kept
    #[arg(long = "min-network-size", default_value_t = 2)]
    pub min_network_size: usize,

    #[arg(
        skip,
        help = "Fragmentation spectrum options, read from configuration files or the environment"
    )]
    #[serde(default)]
    pub msms: MsmsOptions,
}

impl MZCorrelater {
    fn create_threadpool(&self) -> Result<rayon::ThreadPool, MZCorrelaterError> {
        let num_threads = if self.threads > 0 {
            self.threads as usize
        } else {
            thread::available_parallelism()?.into()
        };
        debug!("Using {} cores", num_threads);
        Ok(rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()?)
    }

    fn selected_adducts(&self) -> Vec<IonPart> {
        if self.adducts.is_empty() {
            match self.polarity {
                ArgPolarity::Positive => IonPart::default_positive_adducts(),
                ArgPolarity::Negative => IonPart::default_negative_adducts(),
            }
        } else {
            self.adducts.iter().copied().map(IonPart::from).collect()
        }
    }

    fn selected_modifications(&self) -> Vec<IonPart> {
        if self.no_modifications {
            Vec::new()
        } else if self.modifications.is_empty() {
            IonPart::default_modifications()
        } else {
            self.modifications.iter().copied().map(IonPart::from).collect()
        }
    }

    /// Translate the command line options into the engine's configuration
    pub fn params(&self) -> MetaCorrelateParams {
        let defaults = MetaCorrelateParams::default();
        MetaCorrelateParams {
            rt_tolerance: self.rt_tolerance,
            mz_tolerance: self.tolerance_unit.tolerance(self.mz_tolerance),
            noise_level: self.noise_level,
            min_height: self.min_height,
            min_samples: self.min_samples,
            min_samples_fraction: self.min_samples_fraction,
            min_correlated_data_points: self.min_correlated_data_points,
            min_correlation_r: self.min_correlation_r,
            use_total_correlation_filter: self.min_total_correlation_r.is_some(),
            min_total_correlation_r: self
                .min_total_correlation_r
                .unwrap_or(defaults.min_total_correlation_r),
            similarity_measure: self.similarity_measure.into(),
            use_height_correlation_filter: self.min_height_correlation.is_some(),
            min_height_correlation: self
                .min_height_correlation
                .unwrap_or(defaults.min_height_correlation),
            min_group_correlation: self.min_group_correlation,
            polarity: self.polarity.into(),
            max_charge: self.max_charge,
            max_molecules: self.max_molecules,
            selected_adducts: self.selected_adducts(),
            selected_modifications: self.selected_modifications(),
            check_mode: self.check_mode.into(),
            annotate_within_groups: !self.annotate_by_rt,
            use_grouping_constraint: !self.no_grouping_constraint,
            min_network_size: self.min_network_size,
            msms_mass_list: self.msms.mass_list.clone(),
            msms_min_height: self.msms.min_height,
            check_multimers: self.msms.check_multimers,
            check_neutral_losses: self.msms.check_neutral_losses,
            neutral_loss_check: self.msms.neutral_loss_check,
            ms2_similarity: self.msms.ms2_similarity,
            min_ms2_matched_signals: self.msms.min_matched_signals,
            ..defaults
        }
    }

    pub fn main(&self) -> Result<(), MZCorrelaterError> {
        info!(
            "mzcorrelater v{}",
            option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
        );
        info!("Input: {}", self.input_file);
        info!("Output: {}", self.output_file.display());
        let engine = MetaCorrelateEngine::new(self.params())?;
        debug!(
            "Generated {} candidate ion types",
            engine.library().len()
        );
        let table = self.read_table()?;
        let result = self.create_threadpool()?.install(|| self.run_workflow(&engine, table))?;
        write_output(&result, &self.output_file)?;
        Ok(())
    }

    fn read_table(&self) -> Result<FeatureTable, MZCorrelaterError> {
        let table = if self.input_file == "-" {
            load_table(io::BufReader::new(io::stdin().lock()))?
        } else {
            load_table(io::BufReader::new(fs::File::open(&self.input_file)?))?
        };
        info!(
            "Read {} rows from {} samples",
            table.len(),
            table.sample_count()
        );
        Ok(table)
    }

    fn run_workflow(
        &self,
        engine: &MetaCorrelateEngine,
        table: FeatureTable,
    ) -> Result<MetaCorrelateResult, MZCorrelaterError> {
        let (sender, receiver) = crossbeam_channel::bounded(PROGRESS_BUFFER_SIZE);
        let progress = ChannelProgress::new(sender);
        let report_task = thread::spawn(move || report_progress(receiver));

        let start = Instant::now();
        let result = engine.run(table, &progress);
        drop(progress);

        match report_task.join() {
            Ok(record) => {
                debug!("Received {} progress updates", record.updates);
            }
            Err(e) => {
                warn!("Failed to join progress reporter task: {e:?}");
            }
        }
        let result = result?;
        if result.cancelled {
            warn!("The workflow was cancelled, writing partial results");
        }
        info!("Groups: {}", result.groups.len());
        info!("Ion Identity Networks: {}", result.networks.len());
        info!(
            "Annotated Rows: {}",
            result.table.rows.iter().filter(|r| r.has_ions()).count()
        );
        info!(
            "Multimers Confirmed: {} | Neutral Losses Confirmed: {}",
            result.msms_summary.multimers, result.msms_summary.neutral_losses
        );
        info!("Elapsed Time: {:0.3?}", Instant::now() - start);
        Ok(result)
    }
}

/// Deserialize a [`FeatureTable`] and restore the feature and profile order it is searched by
pub fn load_table<R: io::Read>(reader: R) -> Result<FeatureTable, MZCorrelaterError> {
    let mut table: FeatureTable = serde_json::from_reader(reader)?;
    table.normalize();
    Ok(table)
}

#[cfg(test)]
mod test {
    use mzcorrelate::{library::Polarity, resolver::CheckMode};
    use mzpeaks::Tolerance;

    use super::*;

    #[test]
    fn test_params() {
        let args = MZCorrelater::parse_from([
            "mzcorrelater",
            "table.json",
            "-m",
            "10",
            "-u",
            "ppm",
            "-p",
            "negative",
            "--no-modifications",
            "--min-total-correlation",
            "0.6",
            "--annotate-by-rt",
        ]);
        let params = args.params();
        assert_eq!(params.mz_tolerance, Tolerance::PPM(10.0));
        assert_eq!(params.polarity, Polarity::Negative);
        assert_eq!(params.selected_adducts, IonPart::default_negative_adducts());
        assert!(params.selected_modifications.is_empty());
        assert!(params.use_total_correlation_filter);
        assert_eq!(params.min_total_correlation_r, 0.6);
        assert!(!params.use_height_correlation_filter);
        assert!(!params.annotate_within_groups);
        assert_eq!(params.check_mode, CheckMode::Average);
        assert!(params.validate().is_ok());

        let args = MZCorrelater::parse_from(["mzcorrelater", "-", "-a", "sodium", "-x", "water-loss"]);
        let params = args.params();
        assert_eq!(params.selected_adducts, vec![IonPart::sodium()]);
        assert_eq!(params.selected_modifications, vec![IonPart::water_loss()]);
        assert_eq!(params.mz_tolerance, Tolerance::Da(0.005));
    }

    #[test]
    fn test_load_unsorted() {
        let text = r#"{
            "sample_names": ["a", "b", "c"],
            "rows": [{
                "id": 1, "mz": 301.0, "rt": 5.0,
                "features": [
                    {"sample": 2, "rt": 5.0, "mz": 301.0, "height": 3e5},
                    {"sample": 1, "rt": 5.0, "mz": 301.0, "height": 2e5,
                     "profile": [{"scan": 9, "intensity": 1.0}, {"scan": 8, "intensity": 2.0}]},
                    {"sample": 0, "rt": 5.0, "mz": 301.0, "height": 1e5}
                ]
            }]
        }"#;
        let table = load_table(text.as_bytes()).unwrap();
        let row = &table.rows[0];
        for sample in 0..3 {
            assert_eq!(row.feature(sample).map(|f| f.sample), Some(sample));
        }
        let scans: Vec<u32> = row.features[1].profile.iter().map(|p| p.scan).collect();
        assert_eq!(scans, vec![8, 9]);
    }
}
