/*! The aligned feature table: rows of cross-sample features addressed by [`RowKey`] */
use std::collections::BTreeMap;
use std::hash::Hash;
use std::ops::{Index, IndexMut};

use identity_hash::IdentityHashable;
use mzpeaks::{CentroidPeak, MZPeakSetType};

use crate::identity::IonIdentity;
use crate::ion_type::IonType;

/// The arena index of a [`Row`] within a [`FeatureTable`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RowKey(pub usize);

impl Hash for RowKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_usize(self.0)
    }
}

impl IdentityHashable for RowKey {}

/// One point of a chromatographic profile
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProfilePoint {
    pub scan: u32,
    pub intensity: f64,
}

impl ProfilePoint {
    pub fn new(scan: u32, intensity: f64) -> Self {
        Self { scan, intensity }
    }
}

impl From<(u32, f64)> for ProfilePoint {
    fn from(value: (u32, f64)) -> Self {
        Self::new(value.0, value.1)
    }
}

/// A fragmentation scan attached to a feature, carrying one or more named
/// centroided mass lists
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FragmentScan {
    pub precursor_mz: f64,
    pub mass_lists: BTreeMap<String, Vec<CentroidPeak>>,
}

impl FragmentScan {
    pub fn new(precursor_mz: f64) -> Self {
        Self {
            precursor_mz,
            mass_lists: BTreeMap::new(),
        }
    }

    pub fn with_mass_list(mut self, name: impl Into<String>, peaks: Vec<CentroidPeak>) -> Self {
        self.mass_lists.insert(name.into(), peaks);
        self
    }

    /// Build a searchable peak set from the mass list called `name`
    pub fn peaks(&self, name: &str) -> Option<MZPeakSetType<CentroidPeak>> {
        self.mass_lists
            .get(name)
            .map(|peaks| MZPeakSetType::new(peaks.clone()))
    }
}

/// A single chromatographic peak detected in one sample
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Feature {
    pub sample: usize,
    pub rt: f64,
    pub mz: f64,
    pub height: f64,
    /// The chromatographic profile, sorted by scan
    #[cfg_attr(feature = "serde", serde(default))]
    pub profile: Vec<ProfilePoint>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub fragment_scan: Option<FragmentScan>,
}

impl Feature {
    pub fn new(sample: usize, rt: f64, mz: f64, height: f64) -> Self {
        Self {
            sample,
            rt,
            mz,
            height,
            profile: Vec::new(),
            fragment_scan: None,
        }
    }

    pub fn with_profile(mut self, profile: Vec<ProfilePoint>) -> Self {
        self.profile = profile;
        self.profile.sort_by_key(|p| p.scan);
        self
    }

    pub fn with_fragment_scan(mut self, scan: FragmentScan) -> Self {
        self.fragment_scan = Some(scan);
        self
    }

    /// Restore scan order on the profile after it was built or deserialized without [`Feature::with_profile`]
    pub fn normalize(&mut self) {
        self.profile.sort_by_key(|p| p.scan);
    }
}

/// A feature list row, the alignment of one analyte's features across samples
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Row {
    pub id: u32,
    pub mz: f64,
    pub rt: f64,
    /// The detected charge state, 0 when unknown
    #[cfg_attr(feature = "serde", serde(default))]
    pub charge: i32,
    /// At most one feature per sample, sorted by sample. [`Row::feature`] searches
    /// this order, so rows not built by [`Row::new`] must be [normalized](Row::normalize).
    pub features: Vec<Feature>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub ions: Vec<IonIdentity>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub group: Option<usize>,
}

impl Row {
    pub fn new(id: u32, mz: f64, rt: f64, charge: i32, mut features: Vec<Feature>) -> Self {
        features.sort_by_key(|f| f.sample);
        Self {
            id,
            mz,
            rt,
            charge,
            features,
            ions: Vec::new(),
            group: None,
        }
    }

    /// Sort the features by sample and each feature's profile by scan
    pub fn normalize(&mut self) {
        self.features.sort_by_key(|f| f.sample);
        for feature in self.features.iter_mut() {
            feature.normalize();
        }
    }

    pub fn feature(&self, sample: usize) -> Option<&Feature> {
        self.features
            .binary_search_by_key(&sample, |f| f.sample)
            .ok()
            .map(|i| &self.features[i])
    }

    pub fn samples(&self) -> impl Iterator<Item = usize> + '_ {
        self.features.iter().map(|f| f.sample)
    }

    /// The number of features at least `min_height` tall
    pub fn count_features_above(&self, min_height: f64) -> usize {
        self.features
            .iter()
            .filter(|f| f.height >= min_height)
            .count()
    }

    pub fn best_feature(&self) -> Option<&Feature> {
        self.features
            .iter()
            .max_by(|a, b| a.height.total_cmp(&b.height))
    }

    /// The highest feature that carries a fragmentation scan
    pub fn best_fragment_scan(&self) -> Option<&FragmentScan> {
        self.features
            .iter()
            .filter(|f| f.fragment_scan.is_some())
            .max_by(|a, b| a.height.total_cmp(&b.height))
            .and_then(|f| f.fragment_scan.as_ref())
    }

    pub fn max_height(&self) -> f64 {
        self.best_feature().map(|f| f.height).unwrap_or_default()
    }

    pub fn has_ions(&self) -> bool {
        !self.ions.is_empty()
    }

    pub fn ion(&self, ion_type: &IonType) -> Option<&IonIdentity> {
        self.ions.iter().find(|i| i.ion_type == *ion_type)
    }

    pub fn ion_mut(&mut self, ion_type: &IonType) -> Option<&mut IonIdentity> {
        self.ions.iter_mut().find(|i| i.ion_type == *ion_type)
    }

    /// Add `identity` to this row, merging its partner links into an existing identity
    /// of the same [`IonType`] instead of duplicating it.
    ///
    /// Returns `true` if a new identity was added.
    pub fn add_ion_identity(&mut self, identity: IonIdentity) -> bool {
        match self.ion_mut(&identity.ion_type) {
            Some(existing) => {
                existing.merge_links(&identity);
                false
            }
            None => {
                self.ions.push(identity);
                true
            }
        }
    }

    /// Remove the identity of `ion_type`, returning it if it was present
    pub fn remove_ion_identity(&mut self, ion_type: &IonType) -> Option<IonIdentity> {
        let i = self.ions.iter().position(|i| i.ion_type == *ion_type)?;
        Some(self.ions.remove(i))
    }

    /// The preferred identity after ranking, if any
    pub fn best_ion(&self) -> Option<&IonIdentity> {
        self.ions.first()
    }
}

/// An arena of [`Row`]s and the names of the samples their features came from
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FeatureTable {
    #[cfg_attr(feature = "serde", serde(default))]
    pub sample_names: Vec<String>,
    pub rows: Vec<Row>,
}

impl FeatureTable {
    pub fn new(sample_names: Vec<String>, rows: Vec<Row>) -> Self {
        Self { sample_names, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The number of samples, the larger of the named samples and the highest sample index seen
    pub fn sample_count(&self) -> usize {
        let seen = self
            .rows
            .iter()
            .flat_map(|r| r.features.iter().map(|f| f.sample + 1))
            .max()
            .unwrap_or_default();
        seen.max(self.sample_names.len())
    }

    /// Restore the sort order of every row's features and profiles, as required after
    /// deserialization
    pub fn normalize(&mut self) {
        for row in self.rows.iter_mut() {
            row.normalize();
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = RowKey> {
        (0..self.rows.len()).map(RowKey)
    }

    pub fn iter(&self) -> impl Iterator<Item = (RowKey, &Row)> {
        self.rows.iter().enumerate().map(|(i, r)| (RowKey(i), r))
    }

    pub fn get(&self, key: RowKey) -> Option<&Row> {
        self.rows.get(key.0)
    }

    pub fn get_mut(&mut self, key: RowKey) -> Option<&mut Row> {
        self.rows.get_mut(key.0)
    }

    pub fn find_by_id(&self, id: u32) -> Option<RowKey> {
        self.rows.iter().position(|r| r.id == id).map(RowKey)
    }

    /// Clear every ion identity and group assignment
    pub fn clear_annotations(&mut self) {
        for row in self.rows.iter_mut() {
            row.ions.clear();
            row.group = None;
        }
    }
}

impl Index<RowKey> for FeatureTable {
    type Output = Row;

    fn index(&self, index: RowKey) -> &Self::Output {
        &self.rows[index.0]
    }
}

impl IndexMut<RowKey> for FeatureTable {
    fn index_mut(&mut self, index: RowKey) -> &mut Self::Output {
        &mut self.rows[index.0]
    }
}
