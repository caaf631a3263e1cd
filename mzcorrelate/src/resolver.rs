/*! Pairwise resolution of rows into linked ion identities */
use std::fmt::Display;

use mzpeaks::Tolerance;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::grouping::RowGroup;
use crate::identity::{IonIdentity, NetworkKey};
use crate::ion_type::IonType;
use crate::library::IonTypeLibrary;
use crate::network::IonNetworks;
use crate::progress::StageProgress;
use crate::table::{FeatureTable, Row, RowKey};

/// How two rows' m/z values are compared for a candidate ion type pair
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CheckMode {
    /// Compare the neutral masses of the average row m/z
    #[default]
    Average,
    /// Accept on the first sample where both features agree
    OneFeature,
    /// Require every sample with both features to agree
    AllFeatures,
}

impl Display for CheckMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The ion types assigned to two rows by one accepted candidate pair
#[derive(Debug, Clone, PartialEq)]
pub struct IonPairing {
    pub row_a: RowKey,
    pub ion_a: IonType,
    pub row_b: RowKey,
    pub ion_b: IonType,
}

impl IonPairing {
    pub fn new(row_a: RowKey, ion_a: IonType, row_b: RowKey, ion_b: IonType) -> Self {
        Self {
            row_a,
            ion_a,
            row_b,
            ion_b,
        }
    }

    /// The same pairing seen from the other row
    pub fn mirrored(&self) -> Self {
        Self::new(self.row_b, self.ion_b.clone(), self.row_a, self.ion_a.clone())
    }
}

/// Different molecule counts, or both single molecules
pub fn check_mol_count(a: &IonType, b: &IonType) -> bool {
    a.molecules != b.molecules || (a.molecules == 1 && b.molecules == 1)
}

/// At most one of the pair may carry a modification
pub fn check_max_mod(a: &IonType, b: &IonType) -> bool {
    !(a.has_modification() && b.has_modification())
}

/// Detected charges, when known, must match the candidates
pub fn check_charge_states(a: &IonType, b: &IonType, z1: i32, z2: i32) -> bool {
    let (z1, z2) = (z1.abs(), z2.abs());
    (z1 == 0 || a.abs_charge() == z1) && (z2 == 0 || b.abs_charge() == z2)
}

/// Candidates of different charge may not share any adduct or modification component
pub fn check_multi_charge_difference(a: &IonType, b: &IonType) -> bool {
    a.charge == b.charge || (!a.modification_overlap(b) && !a.adduct_overlap(b))
}

/// No shared adduct component unless both are undefined
pub fn check_same_adducts(a: &IonType, b: &IonType) -> bool {
    let (ua, ub) = (a.is_undefined_adduct(), b.is_undefined_adduct());
    (!a.adduct_overlap(b) && !ua && !ub) || (ua && ub)
}

/// Tests row pairs against every candidate pair of an [`IonTypeLibrary`]
#[derive(Debug, Clone)]
pub struct AdductResolver<'a> {
    pub library: &'a IonTypeLibrary,
    pub mz_tolerance: Tolerance,
    pub check_mode: CheckMode,
    pub min_height: f64,
}

impl<'a> AdductResolver<'a> {
    pub fn new(
        library: &'a IonTypeLibrary,
        mz_tolerance: Tolerance,
        check_mode: CheckMode,
        min_height: f64,
    ) -> Self {
        Self {
            library,
            mz_tolerance,
            check_mode,
            min_height,
        }
    }

    fn check_rules(a: &IonType, b: &IonType, z1: i32, z2: i32) -> bool {
        check_mol_count(a, b)
            && check_max_mod(a, b)
            && check_charge_states(a, b, z1, z2)
            && check_multi_charge_difference(a, b)
            && check_same_adducts(a, b)
    }

    /// Whether `row_a` as `a` and `row_b` as `b` describe the same neutral mass
    pub fn check_masses(&self, row_a: &Row, row_b: &Row, a: &IonType, b: &IonType) -> bool {
        match self.check_mode {
            CheckMode::Average => self
                .mz_tolerance
                .test(a.neutral_mass(row_a.mz), b.neutral_mass(row_b.mz)),
            CheckMode::OneFeature | CheckMode::AllFeatures => {
                let mut has_common = false;
                for fa in row_a.features.iter() {
                    let Some(fb) = row_b.feature(fa.sample) else {
                        continue;
                    };
                    // Small peaks have a larger m/z error
                    if fa.height < self.min_height || fb.height < self.min_height {
                        continue;
                    }
                    has_common = true;
                    let same = self
                        .mz_tolerance
                        .test(a.neutral_mass(fa.mz), b.neutral_mass(fb.mz));
                    match self.check_mode {
                        CheckMode::OneFeature if same => return true,
                        CheckMode::AllFeatures if !same => return false,
                        _ => {}
                    }
                }
                self.check_mode == CheckMode::AllFeatures && has_common
            }
        }
    }

    /// Find every ion type pairing relating `row_a` and `row_b`
    pub fn find_adducts(
        &self,
        key_a: RowKey,
        row_a: &Row,
        key_b: RowKey,
        row_b: &Row,
    ) -> Vec<IonPairing> {
        let mut pairings: Vec<IonPairing> = Vec::new();
        if key_a == key_b {
            return pairings;
        }
        let candidates = self.library.generate();
        for a in candidates.iter() {
            for b in candidates.iter() {
                if a == b || !Self::check_rules(a, b, row_a.charge, row_b.charge) {
                    continue;
                }
                if !self.check_masses(row_a, row_b, a, b) {
                    continue;
                }
                let pairing = if b.is_modification_of(a) {
                    IonPairing::new(
                        key_a,
                        IonType::undefined(a.charge),
                        key_b,
                        b.subtract_mods(a).modified_only(),
                    )
                } else if a.is_modification_of(b) {
                    IonPairing::new(
                        key_a,
                        a.subtract_mods(b).modified_only(),
                        key_b,
                        IonType::undefined(b.charge),
                    )
                } else {
                    IonPairing::new(key_a, a.clone(), key_b, b.clone())
                };
                if !pairings.contains(&pairing) {
                    pairings.push(pairing);
                }
            }
        }
        pairings
    }
}

/// Apply pairings to the table, linking each pair of identities as partners.
///
/// Returns the number of identities that were new to their row.
pub fn apply_pairings(table: &mut FeatureTable, pairings: &[IonPairing]) -> usize {
    let mut added = 0;
    for pairing in pairings {
        let mut ion_a = IonIdentity::new(pairing.row_a, pairing.ion_a.clone());
        ion_a.add_partner(pairing.row_b, pairing.ion_b.clone());
        let mut ion_b = IonIdentity::new(pairing.row_b, pairing.ion_b.clone());
        ion_b.add_partner(pairing.row_a, pairing.ion_a.clone());
        if table[pairing.row_a].add_ion_identity(ion_a) {
            added += 1;
        }
        if table[pairing.row_b].add_ion_identity(ion_b) {
            added += 1;
        }
    }
    added
}

fn resolve_pairs_within(
    table: &FeatureTable,
    rows: &[RowKey],
    resolver: &AdductResolver<'_>,
) -> Vec<IonPairing> {
    let mut pairings = Vec::new();
    for (i, key_a) in rows.iter().copied().enumerate() {
        for key_b in rows[i + 1..].iter().copied() {
            pairings.extend(resolver.find_adducts(key_a, &table[key_a], key_b, &table[key_b]));
        }
    }
    pairings
}

/// Resolve all row pairs inside each group, in parallel over groups
pub(crate) fn resolve_groups(
    table: &mut FeatureTable,
    groups: &[RowGroup],
    resolver: &AdductResolver<'_>,
    progress: &StageProgress<'_>,
) -> usize {
    let per_group: Vec<Vec<IonPairing>> = {
        let table: &FeatureTable = table;
        groups
            .par_iter()
            .map(|group| {
                if progress.is_cancelled() {
                    return Vec::new();
                }
                let pairings = resolve_pairs_within(table, &group.rows, resolver);
                progress.tick();
                pairings
            })
            .collect()
    };
    let n_pairings: usize = per_group.iter().map(|p| p.len()).sum();
    let mut added = 0;
    for pairings in per_group {
        added += apply_pairings(table, &pairings);
    }
    info!(
        "Found {} ion pairings within {} groups, adding {} ion identities",
        n_pairings,
        groups.len(),
        added
    );
    added
}

/// Resolve all row pairs within `rt_tolerance` of each other, used when rows are not grouped
pub(crate) fn resolve_by_retention_time(
    table: &mut FeatureTable,
    rt_tolerance: f64,
    resolver: &AdductResolver<'_>,
    progress: &StageProgress<'_>,
) -> usize {
    let mut order: Vec<RowKey> = table.keys().collect();
    order.sort_by(|a, b| table[*a].rt.total_cmp(&table[*b].rt));
    let per_row: Vec<Vec<IonPairing>> = {
        let table: &FeatureTable = table;
        (0..order.len())
            .into_par_iter()
            .map(|i| {
                if progress.is_cancelled() {
                    return Vec::new();
                }
                let key_a = order[i];
                let row_a = &table[key_a];
                let mut pairings = Vec::new();
                for key_b in order[i + 1..].iter().copied() {
                    let row_b = &table[key_b];
                    if row_b.rt - row_a.rt > rt_tolerance {
                        break;
                    }
                    pairings.extend(resolver.find_adducts(key_a, row_a, key_b, row_b));
                }
                progress.tick();
                pairings
            })
            .collect()
    };
    let mut added = 0;
    for pairings in per_row {
        added += apply_pairings(table, &pairings);
    }
    info!("Added {} ion identities between co-eluting rows", added);
    added
}

/// Try to place an unannotated row into an existing network, testing every defined
/// candidate's neutral mass against the network's.
///
/// On success the new identity is linked to the network members it agrees with and
/// its ion type is returned.
pub fn find_network_adducts(
    table: &mut FeatureTable,
    networks: &mut IonNetworks,
    key: RowKey,
    net_key: NetworkKey,
    library: &IonTypeLibrary,
    mz_tolerance: Tolerance,
) -> Option<IonType> {
    let network = networks.get_mut(net_key)?;
    if network.contains(&key) {
        return None;
    }
    let neutral_mass = network.neutral_mass(table);
    let row = table.get(key)?;
    let z = row.charge.abs();
    let ion_type = library
        .iter()
        .filter(|c| !c.is_undefined_adduct())
        .filter(|c| z == 0 || c.abs_charge() == z)
        .find(|c| mz_tolerance.test(c.neutral_mass(row.mz), neutral_mass))?
        .clone();

    debug!(
        "Placing row {} as {} into network {}",
        row.id, ion_type, net_key.0
    );
    let mut identity = IonIdentity::new(key, ion_type.clone());
    identity.network = Some(net_key);
    network.add_all_links_to(table, key, &mut identity);
    table[key].add_ion_identity(identity);
    network.insert(key, ion_type.clone());
    Some(ion_type)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ion_type::IonPart;
    use crate::library::{IonLibraryParams, Polarity};
    use crate::ion_type::IonParts;
    use crate::table::Feature;

    fn h_na_library() -> IonTypeLibrary {
        IonTypeLibrary::new(IonLibraryParams::new(
            Polarity::Positive,
            1,
            1,
            vec![IonPart::proton(), IonPart::sodium()],
            vec![],
        ))
    }

    /// [M+H]+ at 301.0 and [M+Na]+ of the same molecule, with the sodium row's
    /// average m/z 0.002 off and its sample 1 feature 0.003 off
    fn h_na_rows() -> (Row, Row) {
        let h = IonType::from_adduct(IonPart::proton());
        let na = IonType::from_adduct(IonPart::sodium());
        let m = h.neutral_mass(301.0);
        let a = Row::new(
            1,
            301.0,
            5.0,
            0,
            vec![Feature::new(0, 5.0, 301.0, 1e6), Feature::new(1, 5.0, 301.0, 1e6)],
        );
        let b = Row::new(
            2,
            na.mz(m) + 0.002,
            5.0,
            0,
            vec![
                Feature::new(0, 5.0, na.mz(m), 1e6),
                Feature::new(1, 5.0, na.mz(m) + 0.003, 1e6),
            ],
        );
        (a, b)
    }

    #[test_log::test]
    fn test_proton_sodium() {
        let lib = h_na_library();
        let (a, b) = h_na_rows();
        let accepting = AdductResolver::new(&lib, Tolerance::Da(0.005), CheckMode::Average, 1e5);
        let pairings = accepting.find_adducts(RowKey(0), &a, RowKey(1), &b);
        assert_eq!(pairings.len(), 1);
        assert_eq!(pairings[0].ion_a, IonType::from_adduct(IonPart::proton()));
        assert_eq!(pairings[0].ion_b, IonType::from_adduct(IonPart::sodium()));

        let mirrored = accepting.find_adducts(RowKey(1), &b, RowKey(0), &a);
        assert_eq!(mirrored, vec![pairings[0].mirrored()]);

        let strict = AdductResolver::new(&lib, Tolerance::Da(0.0001), CheckMode::Average, 1e5);
        let pairings = strict.find_adducts(RowKey(0), &a, RowKey(1), &b);
        assert!(pairings.is_empty());
    }

    #[test_log::test]
    fn test_feature_modes() {
        let lib = h_na_library();
        let (a, b) = h_na_rows();
        let tol = Tolerance::Da(0.002);
        let one = AdductResolver::new(&lib, tol, CheckMode::OneFeature, 1e5);
        assert_eq!(one.find_adducts(RowKey(0), &a, RowKey(1), &b).len(), 1);
        // sample 1 is 0.003 off
        let all = AdductResolver::new(&lib, tol, CheckMode::AllFeatures, 1e5);
        assert!(all.find_adducts(RowKey(0), &a, RowKey(1), &b).is_empty());
        // no feature tall enough means no common sample
        let tall = AdductResolver::new(&lib, Tolerance::Da(0.005), CheckMode::AllFeatures, 1e7);
        assert!(tall.find_adducts(RowKey(0), &a, RowKey(1), &b).is_empty());
    }

    #[test]
    fn test_rules() {
        let h = IonType::from_adduct(IonPart::proton());
        let na = IonType::from_adduct(IonPart::sodium());
        let h2 = IonType::from_adduct(IonPart::double_proton());
        let water = IonParts::from(IonPart::water_loss());
        let h_h2o = h.create_modified(&water);
        let na_h2o = na.create_modified(&water);

        assert!(check_mol_count(&h, &na));
        assert!(!check_mol_count(&h.with_molecules(2), &na.with_molecules(2)));
        assert!(check_mol_count(&h.with_molecules(2), &na));

        assert!(!check_max_mod(&h_h2o, &na_h2o));
        assert!(check_max_mod(&h_h2o, &na));

        assert!(check_charge_states(&h, &h2, 0, 0));
        assert!(check_charge_states(&h, &h2, 1, 2));
        assert!(!check_charge_states(&h, &h2, 2, 2));

        assert!(!check_same_adducts(&h, &h_h2o));
        assert!(check_same_adducts(&h, &na));
        assert!(check_same_adducts(&IonType::undefined(1), &IonType::undefined(2)));
        assert!(!check_same_adducts(&IonType::undefined(1), &na));

        let na_h_h2o_2 = IonType::new(
            [IonPart::sodium(), IonPart::proton()].into_iter().collect(),
            water.clone(),
            1,
        );
        assert!(!check_multi_charge_difference(&h, &na_h_h2o_2));
        assert!(check_multi_charge_difference(&h, &h2));
    }

    #[test_log::test]
    fn test_modification_pairing() {
        let lib = IonTypeLibrary::new(IonLibraryParams::new(
            Polarity::Positive,
            1,
            1,
            vec![IonPart::proton()],
            vec![IonPart::water_loss()],
        ));
        let h = IonType::from_adduct(IonPart::proton());
        let water = IonParts::from(IonPart::water_loss());
        let h_h2o = h.create_modified(&water);
        let m = 180.06339;
        let a = Row::new(1, h.mz(m), 5.0, 0, vec![]);
        let b = Row::new(2, h_h2o.mz(m), 5.0, 0, vec![]);
        let resolver = AdductResolver::new(&lib, Tolerance::Da(0.005), CheckMode::Average, 1e5);
        let pairings = resolver.find_adducts(RowKey(0), &a, RowKey(1), &b);
        assert_eq!(pairings.len(), 1, "{pairings:?}");
        assert_eq!(pairings[0].ion_a, IonType::undefined(1));
        assert!(pairings[0].ion_b.is_modified_undefined_adduct());
        assert_eq!(pairings[0].ion_b.modification, water);

        let mut table = FeatureTable::new(vec![], vec![a, b]);
        assert_eq!(apply_pairings(&mut table, &pairings), 2);
        // applying again merges
        assert_eq!(apply_pairings(&mut table, &pairings), 0);
        let ion = &table[RowKey(1)].ions[0];
        assert_eq!(ion.partners.get(&RowKey(0)), Some(&IonType::undefined(1)));
    }
}
