use std::fs;
use std::io;
use std::path::Path;

use clap::{parser::ValueSource, CommandFactory, FromArgMatches};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    value::{Dict, Value},
    Figment,
};
use tracing::{debug, error, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mzcorrelater::{MZCorrelater, MZCorrelaterError};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn default_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy()
}

fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>, MZCorrelaterError> {
    let (file_layer, guard) = match log_file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(fs::File::create(path)?);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(default_filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .compact()
                .with_writer(io::stderr)
                .with_filter(default_filter()),
        )
        .with(file_layer);
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("A global tracing subscriber was already installed");
    }
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("Failed to bridge `log` records: {e}");
    }
    Ok(guard)
}

/// Merge the configuration sources, with options given on the command line taking precedence
fn configure() -> Result<MZCorrelater, MZCorrelaterError> {
    let matches = MZCorrelater::command().get_matches();
    let args = MZCorrelater::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());

    let given: Vec<String> = MZCorrelater::command()
        .get_arguments()
        .map(|arg| arg.get_id().to_string())
        .filter(|id| matches!(matches.value_source(id), Some(ValueSource::CommandLine)))
        .collect();
    let explicit: Dict = Value::serialize(&args)?
        .into_dict()
        .unwrap_or_default()
        .into_iter()
        .filter(|(k, _)| given.contains(k))
        .collect();

    let mut config = Figment::from(Serialized::defaults(&args)).merge(Toml::file("mzcorrelater.toml"));
    if let Some(path) = args.config_file.as_ref() {
        config = config.merge(Toml::file_exact(path));
    }
    config = config
        .merge(Env::prefixed("MZCORRELATER_").split("__"))
        .merge(Serialized::defaults(explicit));
    Ok(config.extract()?)
}

fn main() -> Result<(), MZCorrelaterError> {
    let args = configure()?;
    let _guard = init_logging(args.log_file.as_deref())?;
    match toml::to_string_pretty(&args) {
        Ok(dump) => debug!("Configuration:\n{dump}"),
        Err(e) => warn!("Failed to render the configuration: {e}"),
    }
    if let Err(e) = args.main() {
        error!("{e}");
        return Err(e);
    }
    Ok(())
}
