/*! Ionization hypotheses: adducts, in-source modifications, multimers and charge states */
use std::cmp::Ordering;
use std::fmt::{self, Display};

use chemical_elements::{ChemicalComposition, ElementSpecification, PROTON as _PROTON};

/// The mass of H+, a hydrogen atom minus an electron
pub const PROTON: f64 = _PROTON;

const MASS_EQUALITY_DELTA: f64 = 1e-6;

/// Compute the monoisotopic mass of a small formula given as `(element, count)` pairs
pub fn formula_mass(elements: &[(&str, i32)]) -> f64 {
    let mut composition = ChemicalComposition::new();
    for (symbol, count) in elements {
        if let Ok(element) = symbol.parse::<ElementSpecification>() {
            composition.set(element, *count);
        }
    }
    composition.mass()
}

/// The mass of an electron, derived from the mass of hydrogen and [`PROTON`]
pub fn electron_mass() -> f64 {
    formula_mass(&[("H", 1)]) - PROTON
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IonPartKind {
    /// A charge carrying adduct like H+ or Na+
    Adduct,
    /// A charge anchor without a known adduct, used for neutral loss-only hypotheses
    UndefinedAdduct,
    /// A neutral loss, i.e. an in-source fragmentation event like -H2O
    NeutralLoss,
    /// A neutral gain, i.e. a solvent or salt cluster like +ACN
    Cluster,
}

/// A single component of an [`IonType`], either a charge carrier or a neutral modification.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IonPart {
    /// The formula-like name, without sign
    pub name: String,
    /// The signed mass this part contributes
    pub mass: f64,
    /// The signed charge this part contributes
    pub charge: i32,
    pub kind: IonPartKind,
    /// The maximum number of modifications an ion carrying this part may have
    pub mod_limit: Option<usize>,
}

impl PartialEq for IonPart {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.kind == other.kind
            && self.charge == other.charge
            && (self.mass - other.mass).abs() < MASS_EQUALITY_DELTA
    }
}

impl IonPart {
    pub fn new(name: impl Into<String>, mass: f64, charge: i32, kind: IonPartKind) -> Self {
        Self {
            name: name.into(),
            mass,
            charge,
            kind,
            mod_limit: None,
        }
    }

    /// Build a charge carrying adduct from a formula, removing (or adding) one electron per charge
    pub fn adduct_from_formula(name: &str, elements: &[(&str, i32)], charge: i32) -> Self {
        let mass = formula_mass(elements) - charge as f64 * electron_mass();
        Self::new(name, mass, charge, IonPartKind::Adduct)
    }

    /// Build a neutral loss from the formula of the lost fragment
    pub fn loss_from_formula(name: &str, elements: &[(&str, i32)]) -> Self {
        Self::new(name, -formula_mass(elements), 0, IonPartKind::NeutralLoss)
    }

    /// Build a neutral cluster gain from the formula of the added fragment
    pub fn cluster_from_formula(name: &str, elements: &[(&str, i32)]) -> Self {
        Self::new(name, formula_mass(elements), 0, IonPartKind::Cluster)
    }

    pub fn with_mod_limit(mut self, limit: usize) -> Self {
        self.mod_limit = Some(limit);
        self
    }

    /// The placeholder adduct for an unknown charge carrier with `charge`
    pub fn undefined(charge: i32) -> Self {
        Self::new("?", 0.0, charge, IonPartKind::UndefinedAdduct)
    }

    pub fn proton() -> Self {
        Self::new("H", PROTON, 1, IonPartKind::Adduct)
    }

    pub fn double_proton() -> Self {
        Self::new("2H", 2.0 * PROTON, 2, IonPartKind::Adduct)
    }

    pub fn sodium() -> Self {
        Self::adduct_from_formula("Na", &[("Na", 1)], 1)
    }

    pub fn potassium() -> Self {
        Self::adduct_from_formula("K", &[("K", 1)], 1)
    }

    pub fn ammonium() -> Self {
        Self::adduct_from_formula("NH4", &[("N", 1), ("H", 4)], 1)
    }

    pub fn deprotonation() -> Self {
        Self::new("H", -PROTON, -1, IonPartKind::Adduct)
    }

    pub fn double_deprotonation() -> Self {
        Self::new("2H", -2.0 * PROTON, -2, IonPartKind::Adduct)
    }

    pub fn chloride() -> Self {
        Self::adduct_from_formula("Cl", &[("Cl", 1)], -1)
    }

    pub fn formate() -> Self {
        Self::adduct_from_formula("CHO2", &[("C", 1), ("H", 1), ("O", 2)], -1)
    }

    pub fn water_loss() -> Self {
        Self::loss_from_formula("H2O", &[("H", 2), ("O", 1)])
    }

    pub fn ammonia_loss() -> Self {
        Self::loss_from_formula("NH3", &[("N", 1), ("H", 3)])
    }

    pub fn carbon_dioxide_loss() -> Self {
        Self::loss_from_formula("CO2", &[("C", 1), ("O", 2)])
    }

    pub fn acetonitrile_cluster() -> Self {
        Self::cluster_from_formula("ACN", &[("C", 2), ("H", 3), ("N", 1)])
    }

    pub fn methanol_cluster() -> Self {
        Self::cluster_from_formula("MeOH", &[("C", 1), ("H", 4), ("O", 1)])
    }

    pub fn formic_acid_cluster() -> Self {
        Self::cluster_from_formula("FA", &[("C", 1), ("H", 2), ("O", 2)])
    }

    /// The adducts most commonly selected for positive mode
    pub fn default_positive_adducts() -> Vec<Self> {
        vec![
            Self::proton(),
            Self::sodium(),
            Self::potassium(),
            Self::ammonium(),
            Self::double_proton(),
        ]
    }

    /// The adducts most commonly selected for negative mode
    pub fn default_negative_adducts() -> Vec<Self> {
        vec![
            Self::deprotonation(),
            Self::chloride(),
            Self::formate(),
            Self::double_deprotonation(),
        ]
    }

    pub fn default_modifications() -> Vec<Self> {
        vec![
            Self::water_loss(),
            Self::ammonia_loss(),
            Self::carbon_dioxide_loss(),
            Self::acetonitrile_cluster(),
            Self::methanol_cluster(),
            Self::formic_acid_cluster(),
        ]
    }

    pub fn is_undefined(&self) -> bool {
        self.kind == IonPartKind::UndefinedAdduct
    }

    pub fn is_ammonium(&self) -> bool {
        self.kind == IonPartKind::Adduct && self.name == "NH4"
    }

    pub fn is_ammonia_loss(&self) -> bool {
        self.kind == IonPartKind::NeutralLoss && self.name == "NH3"
    }

    /// The same part with its mass negated, turning a loss into a gain or vice versa
    pub fn opposite(&self) -> Self {
        let kind = match self.kind {
            IonPartKind::NeutralLoss => IonPartKind::Cluster,
            IonPartKind::Cluster => IonPartKind::NeutralLoss,
            k => k,
        };
        Self {
            name: self.name.clone(),
            mass: -self.mass,
            charge: -self.charge,
            kind,
            mod_limit: self.mod_limit,
        }
    }

    fn sort_key(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.kind.cmp(&other.kind))
            .then_with(|| self.mass.total_cmp(&other.mass))
    }
}

impl Display for IonPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mass < 0.0 {
            write!(f, "-{}", self.name)
        } else {
            write!(f, "+{}", self.name)
        }
    }
}

/// A canonical, sorted multiset of [`IonPart`]s, used both for combined adducts and
/// combined modifications.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IonParts(Vec<IonPart>);

impl IonParts {
    pub fn new(mut parts: Vec<IonPart>) -> Self {
        parts.sort_by(|a, b| a.sort_key(b));
        Self(parts)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn single(part: IonPart) -> Self {
        Self(vec![part])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, IonPart> {
        self.0.iter()
    }

    pub fn mass(&self) -> f64 {
        self.0.iter().map(|p| p.mass).sum()
    }

    pub fn charge(&self) -> i32 {
        self.0.iter().map(|p| p.charge).sum()
    }

    pub fn contains(&self, part: &IonPart) -> bool {
        self.0.iter().any(|p| p == part)
    }

    /// Whether any component of `self` also appears in `other`
    pub fn overlaps(&self, other: &IonParts) -> bool {
        self.0.iter().any(|p| other.contains(p))
    }

    /// Whether every component of `other` is accounted for in `self`, respecting multiplicity
    pub fn is_superset_of(&self, other: &IonParts) -> bool {
        let mut remaining: Vec<&IonPart> = self.0.iter().collect();
        for part in other.iter() {
            match remaining.iter().position(|p| *p == part) {
                Some(i) => {
                    remaining.swap_remove(i);
                }
                None => return false,
            }
        }
        true
    }

    pub fn merge(&self, other: &IonParts) -> IonParts {
        let mut parts = self.0.clone();
        parts.extend(other.0.iter().cloned());
        IonParts::new(parts)
    }

    /// Remove one occurrence of each component of `other`
    pub fn remove(&self, other: &IonParts) -> IonParts {
        let mut parts = self.0.clone();
        for part in other.iter() {
            if let Some(i) = parts.iter().position(|p| p == part) {
                parts.remove(i);
            }
        }
        IonParts(parts)
    }

    pub fn has_undefined(&self) -> bool {
        self.0.iter().any(|p| p.is_undefined())
    }

    pub fn opposite(&self) -> IonParts {
        IonParts::new(self.0.iter().map(|p| p.opposite()).collect())
    }
}

impl From<IonPart> for IonParts {
    fn from(value: IonPart) -> Self {
        Self::single(value)
    }
}

impl FromIterator<IonPart> for IonParts {
    fn from_iter<T: IntoIterator<Item = IonPart>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl Display for IonParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for part in self.0.iter() {
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

/// One ionization hypothesis: `molecules` copies of a neutral molecule carrying
/// `adduct` and an optional `modification`.
///
/// The neutral mass `M` of a molecule observed at `mz` is
///
/// ```math
/// M = \frac{mz \cdot |z| - \Delta}{n}
/// ```
///
/// where $`\Delta`$ is the combined [`IonType::mass`] and $`n`$ is [`IonType::molecules`].
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IonType {
    pub adduct: IonParts,
    pub modification: IonParts,
    pub molecules: u32,
    pub charge: i32,
    pub mass: f64,
}

impl PartialEq for IonType {
    fn eq(&self, other: &Self) -> bool {
        (self.mass - other.mass).abs() < MASS_EQUALITY_DELTA
            && self.charge == other.charge
            && self.molecules == other.molecules
            && self.adduct == other.adduct
            && self.modification == other.modification
    }
}

impl IonType {
    pub fn new(adduct: IonParts, modification: IonParts, molecules: u32) -> Self {
        let charge = adduct.charge() + modification.charge();
        let mass = adduct.mass() + modification.mass();
        Self {
            adduct,
            modification,
            molecules: molecules.max(1),
            charge,
            mass,
        }
    }

    pub fn from_adduct(adduct: IonPart) -> Self {
        Self::new(adduct.into(), IonParts::empty(), 1)
    }

    /// The unmodified undefined adduct anchoring charge `charge`
    pub fn undefined(charge: i32) -> Self {
        Self::from_adduct(IonPart::undefined(charge))
    }

    pub fn with_molecules(&self, molecules: u32) -> Self {
        Self::new(self.adduct.clone(), self.modification.clone(), molecules)
    }

    pub fn abs_charge(&self) -> i32 {
        self.charge.abs()
    }

    /// Convert an observed m/z into the neutral mass of a single molecule
    #[inline]
    pub fn neutral_mass(&self, mz: f64) -> f64 {
        (mz * self.abs_charge() as f64 - self.mass) / self.molecules as f64
    }

    /// Convert a neutral mass into the m/z this ion would be observed at
    #[inline]
    pub fn mz(&self, neutral_mass: f64) -> f64 {
        let z = self.abs_charge().max(1) as f64;
        (neutral_mass * self.molecules as f64 + self.mass) / z
    }

    pub fn has_modification(&self) -> bool {
        !self.modification.is_empty()
    }

    pub fn modification_count(&self) -> usize {
        self.modification.len()
    }

    pub fn is_undefined_adduct(&self) -> bool {
        self.adduct.has_undefined()
    }

    /// An undefined adduct carrying at least one modification, i.e. a neutral loss-only hypothesis
    pub fn is_modified_undefined_adduct(&self) -> bool {
        self.is_undefined_adduct() && self.has_modification()
    }

    /// An undefined adduct with no modification, the weakest possible hypothesis
    pub fn is_undefined_adduct_parent(&self) -> bool {
        self.is_undefined_adduct() && !self.has_modification()
    }

    pub fn adduct_overlap(&self, other: &IonType) -> bool {
        self.adduct.overlaps(&other.adduct)
    }

    pub fn modification_overlap(&self, other: &IonType) -> bool {
        self.modification.overlaps(&other.modification)
    }

    /// Add `modification` to the modifications already carried by this ion
    pub fn create_modified(&self, modification: &IonParts) -> Self {
        Self::new(
            self.adduct.clone(),
            self.modification.merge(modification),
            self.molecules,
        )
    }

    /// Remove the modifications of `other` from this ion's modifications
    pub fn subtract_mods(&self, other: &IonType) -> Self {
        Self::new(
            self.adduct.clone(),
            self.modification.remove(&other.modification),
            self.molecules,
        )
    }

    /// The undefined adduct of the same charge carrying only this ion's modifications
    pub fn modified_only(&self) -> Self {
        Self::new(
            IonPart::undefined(self.charge).into(),
            self.modification.clone(),
            1,
        )
    }

    /// Whether this ion is `other` plus one or more extra modifications
    pub fn is_modification_of(&self, other: &IonType) -> bool {
        self.has_modification()
            && other.modification_count() < self.modification_count()
            && (self.mass - other.mass).abs() >= MASS_EQUALITY_DELTA
            && self.adduct == other.adduct
            && self.molecules == other.molecules
            && self.charge == other.charge
            && (!other.has_modification() || self.modification.is_superset_of(&other.modification))
    }

    /// The largest modification count permitted by any adduct component
    pub fn mod_limit(&self) -> Option<usize> {
        self.adduct.iter().filter_map(|p| p.mod_limit).min()
    }
}

impl Display for IonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        if self.molecules > 1 {
            write!(f, "{}", self.molecules)?;
        }
        write!(f, "M{}{}]", self.modification, self.adduct)?;
        let z = self.abs_charge();
        if z > 1 {
            write!(f, "{z}")?;
        }
        match self.charge.cmp(&0) {
            Ordering::Greater => write!(f, "+"),
            Ordering::Less => write!(f, "-"),
            Ordering::Equal => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_masses() {
        let h = IonType::from_adduct(IonPart::proton());
        let na = IonType::from_adduct(IonPart::sodium());
        assert!((h.mass - 1.00728).abs() < 1e-4, "{}", h.mass);
        assert!((na.mass - 22.98922).abs() < 1e-4, "{}", na.mass);

        let m = h.neutral_mass(301.0);
        assert!((m - 299.99272).abs() < 1e-4);
        assert!((h.mz(m) - 301.0).abs() < 1e-9);

        let dimer = h.with_molecules(2);
        assert!((dimer.neutral_mass(dimer.mz(150.0)) - 150.0).abs() < 1e-9);
    }

    #[test]
    fn test_display() {
        let h = IonType::from_adduct(IonPart::proton());
        assert_eq!(h.to_string(), "[M+H]+");
        let t = h
            .with_molecules(2)
            .create_modified(&IonPart::water_loss().into());
        assert_eq!(t.to_string(), "[2M-H2O+H]+");
        let z = IonType::from_adduct(IonPart::double_deprotonation());
        assert_eq!(z.to_string(), "[M-2H]2-");
    }

    #[test]
    fn test_modification_relations() {
        let h = IonType::from_adduct(IonPart::proton());
        let loss = IonParts::from(IonPart::water_loss());
        let h_h2o = h.create_modified(&loss);
        assert!(h_h2o.is_modification_of(&h));
        assert!(!h.is_modification_of(&h_h2o));
        assert_eq!(h_h2o.subtract_mods(&h), h_h2o);

        let both = h_h2o.create_modified(&IonPart::ammonia_loss().into());
        assert!(both.is_modification_of(&h_h2o));
        let diff = both.subtract_mods(&h_h2o);
        assert_eq!(diff.modification, IonParts::from(IonPart::ammonia_loss()));

        let only = h_h2o.modified_only();
        assert!(only.is_modified_undefined_adduct());
        assert!(!only.is_undefined_adduct_parent());
        assert!(IonType::undefined(1).is_undefined_adduct_parent());
    }

    #[test]
    fn test_equality() {
        let a = IonType::from_adduct(IonPart::proton());
        let b = IonType::new(IonParts::single(IonPart::proton()), IonParts::empty(), 1);
        assert_eq!(a, b);
        assert_ne!(a, a.with_molecules(2));
        assert_ne!(a, IonType::from_adduct(IonPart::sodium()));
    }
}
