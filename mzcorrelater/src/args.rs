use std::fmt::Display;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use mzcorrelate::{
    ion_type::IonPart, library::Polarity, msms::NeutralLossCheck, resolver::CheckMode,
    similarity::SimilarityMeasure,
};
use mzpeaks::Tolerance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArgToleranceUnit {
    #[default]
    Da,
    #[serde(rename = "ppm")]
    PPM,
}

impl ArgToleranceUnit {
    pub fn tolerance(&self, value: f64) -> Tolerance {
        match self {
            Self::Da => Tolerance::Da(value),
            Self::PPM => Tolerance::PPM(value),
        }
    }
}

impl Display for ArgToleranceUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArgPolarity {
    #[default]
    Positive,
    Negative,
}

impl From<ArgPolarity> for Polarity {
    fn from(value: ArgPolarity) -> Self {
        match value {
            ArgPolarity::Positive => Polarity::Positive,
            ArgPolarity::Negative => Polarity::Negative,
        }
    }
}

impl Display for ArgPolarity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArgCheckMode {
    /// Compare the neutral masses derived from each row's average m/z
    #[default]
    Average,
    /// Accept a pairing when a single sample agrees
    OneFeature,
    /// Require every sample with both features to agree
    AllFeatures,
}

impl From<ArgCheckMode> for CheckMode {
    fn from(value: ArgCheckMode) -> Self {
        match value {
            ArgCheckMode::Average => CheckMode::Average,
            ArgCheckMode::OneFeature => CheckMode::OneFeature,
            ArgCheckMode::AllFeatures => CheckMode::AllFeatures,
        }
    }
}

impl Display for ArgCheckMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArgSimilarityMeasure {
    #[default]
    Pearson,
    Spearman,
    Cosine,
    /// Log ratio proportionality, lower is more similar
    LogRatioVariance1,
    /// Log ratio concordance
    LogRatioVariance2,
}

impl From<ArgSimilarityMeasure> for SimilarityMeasure {
    fn from(value: ArgSimilarityMeasure) -> Self {
        match value {
            ArgSimilarityMeasure::Pearson => SimilarityMeasure::Pearson,
            ArgSimilarityMeasure::Spearman => SimilarityMeasure::Spearman,
            ArgSimilarityMeasure::Cosine => SimilarityMeasure::Cosine,
            ArgSimilarityMeasure::LogRatioVariance1 => SimilarityMeasure::LogRatioVariance1,
            ArgSimilarityMeasure::LogRatioVariance2 => SimilarityMeasure::LogRatioVariance2,
        }
    }
}

impl Display for ArgSimilarityMeasure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArgAdduct {
    /// [M+H]+
    Proton,
    /// [M+Na]+
    Sodium,
    /// [M+K]+
    Potassium,
    /// [M+NH4]+
    Ammonium,
    /// [M+2H]2+
    DoubleProton,
    /// [M-H]-
    Deprotonation,
    /// [M+Cl]-
    Chloride,
    /// [M+HCOO]-
    Formate,
    /// [M-2H]2-
    DoubleDeprotonation,
}

impl From<ArgAdduct> for IonPart {
    fn from(value: ArgAdduct) -> Self {
        match value {
            ArgAdduct::Proton => IonPart::proton(),
            ArgAdduct::Sodium => IonPart::sodium(),
            ArgAdduct::Potassium => IonPart::potassium(),
            ArgAdduct::Ammonium => IonPart::ammonium(),
            ArgAdduct::DoubleProton => IonPart::double_proton(),
            ArgAdduct::Deprotonation => IonPart::deprotonation(),
            ArgAdduct::Chloride => IonPart::chloride(),
            ArgAdduct::Formate => IonPart::formate(),
            ArgAdduct::DoubleDeprotonation => IonPart::double_deprotonation(),
        }
    }
}

impl Display for ArgAdduct {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", IonPart::from(*self))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArgModification {
    WaterLoss,
    AmmoniaLoss,
    CarbonDioxideLoss,
    Acetonitrile,
    Methanol,
    FormicAcid,
}

impl From<ArgModification> for IonPart {
    fn from(value: ArgModification) -> Self {
        match value {
            ArgModification::WaterLoss => IonPart::water_loss(),
            ArgModification::AmmoniaLoss => IonPart::ammonia_loss(),
            ArgModification::CarbonDioxideLoss => IonPart::carbon_dioxide_loss(),
            ArgModification::Acetonitrile => IonPart::acetonitrile_cluster(),
            ArgModification::Methanol => IonPart::methanol_cluster(),
            ArgModification::FormicAcid => IonPart::formic_acid_cluster(),
        }
    }
}

impl Display for ArgModification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", IonPart::from(*self))
    }
}

/// Fragmentation spectrum options that are only read from configuration files or the environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MsmsOptions {
    /// The name of the mass list to read from each fragmentation scan
    pub mass_list: String,
    pub min_height: f64,
    pub check_multimers: bool,
    pub check_neutral_losses: bool,
    pub neutral_loss_check: NeutralLossCheck,
    /// Compare the fragmentation spectra of every pair of rows in a group
    pub ms2_similarity: bool,
    pub min_matched_signals: usize,
}

impl Default for MsmsOptions {
    fn default() -> Self {
        Self {
            mass_list: "centroid".to_string(),
            min_height: 0.0,
            check_multimers: true,
            check_neutral_losses: true,
            neutral_loss_check: NeutralLossCheck::PrecursorOnly,
            ms2_similarity: true,
            min_matched_signals: 3,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_conversions() {
        assert_eq!(ArgToleranceUnit::PPM.tolerance(10.0), Tolerance::PPM(10.0));
        assert_eq!(Polarity::from(ArgPolarity::Negative), Polarity::Negative);
        assert_eq!(IonPart::from(ArgAdduct::Sodium), IonPart::sodium());
        assert_eq!(
            IonPart::from(ArgModification::WaterLoss),
            IonPart::water_loss()
        );
        assert_eq!(
            ArgCheckMode::from_str("one-feature", true),
            Ok(ArgCheckMode::OneFeature)
        );
    }
}
