//! Correlation grouping and ion identity networking of aligned LC-MS feature tables
pub mod correlation;
pub mod grouping;
pub mod identity;
pub mod ion_type;
pub mod library;
pub mod network;
pub mod progress;
pub mod ranking;
pub mod resolver;
pub mod similarity;
pub mod table;
pub mod msms;
pub mod api;

pub use api::{
    meta_correlate, ConfigError, MetaCorrelateEngine, MetaCorrelateError, MetaCorrelateParams,
    MetaCorrelateResult,
};
pub use table::{Feature, FeatureTable, Row, RowKey};
