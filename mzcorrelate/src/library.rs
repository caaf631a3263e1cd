/*! Enumeration of candidate [`IonType`]s from a library configuration */
use std::fmt::Display;
use std::sync::OnceLock;

use tracing::debug;

use crate::ion_type::{IonPart, IonParts, IonType};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Polarity {
    #[default]
    Positive,
    Negative,
}

impl Polarity {
    /// Whether `charge` has the sign this polarity produces
    pub fn matches(&self, charge: i32) -> bool {
        match self {
            Polarity::Positive => charge > 0,
            Polarity::Negative => charge < 0,
        }
    }

    pub fn sign(&self) -> i32 {
        match self {
            Polarity::Positive => 1,
            Polarity::Negative => -1,
        }
    }
}

impl Display for Polarity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The configuration of an [`IonTypeLibrary`]
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IonLibraryParams {
    pub polarity: Polarity,
    /// The maximum absolute charge of any candidate
    pub max_charge: i32,
    /// The maximum number of molecules in a multimer
    pub max_molecules: u32,
    pub adducts: Vec<IonPart>,
    pub modifications: Vec<IonPart>,
}

impl Default for IonLibraryParams {
    fn default() -> Self {
        Self {
            polarity: Polarity::Positive,
            max_charge: 2,
            max_molecules: 3,
            adducts: IonPart::default_positive_adducts(),
            modifications: IonPart::default_modifications(),
        }
    }
}

impl IonLibraryParams {
    pub fn new(
        polarity: Polarity,
        max_charge: i32,
        max_molecules: u32,
        adducts: Vec<IonPart>,
        modifications: Vec<IonPart>,
    ) -> Self {
        Self {
            polarity,
            max_charge,
            max_molecules,
            adducts,
            modifications,
        }
    }
}

/// A memoizing generator of every valid ionization hypothesis for a configuration.
///
/// The candidate list is built once, on first access, and reused for every row pair.
#[derive(Debug, Clone)]
pub struct IonTypeLibrary {
    params: IonLibraryParams,
    candidates: OnceLock<Vec<IonType>>,
}

impl IonTypeLibrary {
    pub fn new(params: IonLibraryParams) -> Self {
        Self {
            params,
            candidates: OnceLock::new(),
        }
    }

    pub fn params(&self) -> &IonLibraryParams {
        &self.params
    }

    /// All candidate ion types, generated on first call
    pub fn generate(&self) -> &[IonType] {
        self.candidates.get_or_init(|| {
            let candidates = create_all_ion_types(&self.params);
            debug!(
                "Generated {} candidate ion types for {} adducts and {} modifications",
                candidates.len(),
                self.params.adducts.len(),
                self.params.modifications.len()
            );
            candidates
        })
    }

    pub fn len(&self) -> usize {
        self.generate().len()
    }

    pub fn is_empty(&self) -> bool {
        self.generate().is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, IonType> {
        self.generate().iter()
    }
}

impl PartialEq for IonTypeLibrary {
    fn eq(&self, other: &Self) -> bool {
        self.params == other.params
    }
}

fn push_unique(candidates: &mut Vec<IonType>, ion: IonType) {
    if !candidates.contains(&ion) {
        candidates.push(ion);
    }
}

fn create_all_ion_types(params: &IonLibraryParams) -> Vec<IonType> {
    let mut base = Vec::new();
    // [M+?]z anchors for neutral loss-only hypotheses
    for z in 1..=params.max_charge {
        push_unique(&mut base, IonType::undefined(z * params.polarity.sign()));
    }

    for adduct in params.adducts.iter() {
        if params.polarity.matches(adduct.charge) && adduct.charge.abs() <= params.max_charge {
            for n in 1..=params.max_molecules {
                push_unique(
                    &mut base,
                    IonType::new(IonParts::single(adduct.clone()), IonParts::empty(), n),
                );
            }
        }
    }

    let mut candidates = base.clone();
    for ion in base.iter() {
        for modification in params.modifications.iter() {
            if is_valid_modification(ion, modification) {
                push_unique(
                    &mut candidates,
                    ion.create_modified(&IonParts::single(modification.clone())),
                );
            }
        }
    }
    candidates
}

/// Reject chemically impossible or over-modified combinations
fn is_valid_modification(ion: &IonType, modification: &IonPart) -> bool {
    if modification.is_ammonia_loss() && ion.adduct.iter().any(|a| a.is_ammonium()) {
        return false;
    }
    let total = ion.modification_count() + 1;
    if let Some(limit) = ion.mod_limit() {
        if total > limit {
            return false;
        }
    }
    if let Some(limit) = modification.mod_limit {
        if total > limit {
            return false;
        }
    }
    true
}
