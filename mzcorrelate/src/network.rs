/*! Ion identity networks: rows whose ion identities point to the same neutral molecule */
use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Index, IndexMut};

use mzpeaks::Tolerance;
use tracing::{debug, info};

use crate::grouping::RowGroup;
use crate::identity::{IonIdentity, NetworkKey};
use crate::ion_type::{IonPart, IonParts, IonType};
use crate::table::{FeatureTable, RowKey};

/// Summary statistics over the members of an [`IonNetwork`]
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NetworkStats {
    /// The mean neutral mass of all members
    pub neutral_mass: f64,
    /// The largest absolute deviation of a member's neutral mass from the mean
    pub max_dev: f64,
    pub avg_rt: f64,
    /// The sum of each member row's highest feature
    pub height_sum: f64,
    pub lowest_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RelationKind {
    /// `2 M(a) - H2O = M(b)`
    Condensation,
    /// `M(a) + modification = M(b)`
    Modification,
}

/// A link between two networks whose neutral masses are related by a known reaction.
///
/// `smaller` always has the lower neutral mass.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NetworkRelation {
    pub smaller: NetworkKey,
    pub larger: NetworkKey,
    pub kind: RelationKind,
    /// The modification leading from the smaller network to the larger one
    pub modification: IonParts,
}

impl NetworkRelation {
    pub fn other(&self, key: NetworkKey) -> NetworkKey {
        if key == self.smaller {
            self.larger
        } else {
            self.smaller
        }
    }

    /// The name of this relation as seen from `key`
    pub fn name_for(&self, key: NetworkKey) -> String {
        match self.kind {
            RelationKind::Condensation => {
                if key == self.smaller {
                    format!("M({}_condensed)", self.larger.0)
                } else {
                    format!("2Mcondensed({}){}", self.smaller.0, self.modification)
                }
            }
            RelationKind::Modification => {
                if key == self.smaller {
                    format!("M({}){}", self.larger.0, self.modification.opposite())
                } else {
                    format!("M({}){}", self.smaller.0, self.modification)
                }
            }
        }
    }
}

/// A set of rows, each with the [`IonType`] under which it describes the same neutral molecule
#[derive(Debug, Clone)]
pub struct IonNetwork {
    pub key: NetworkKey,
    pub mz_tolerance: Tolerance,
    members: BTreeMap<RowKey, IonType>,
    relations: BTreeMap<NetworkKey, NetworkRelation>,
    stats: Option<NetworkStats>,
}

impl IonNetwork {
    pub fn new(key: NetworkKey, mz_tolerance: Tolerance) -> Self {
        Self {
            key,
            mz_tolerance,
            members: BTreeMap::new(),
            relations: BTreeMap::new(),
            stats: None,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, row: &RowKey) -> bool {
        self.members.contains_key(row)
    }

    pub fn get(&self, row: &RowKey) -> Option<&IonType> {
        self.members.get(row)
    }

    pub fn iter(&self) -> std::collections::btree_map::Iter<'_, RowKey, IonType> {
        self.members.iter()
    }

    pub fn rows(&self) -> impl Iterator<Item = RowKey> + '_ {
        self.members.keys().copied()
    }

    /// Drop the cached statistics
    pub fn invalidate(&mut self) {
        self.stats = None;
    }

    pub fn insert(&mut self, row: RowKey, ion_type: IonType) -> Option<IonType> {
        self.invalidate();
        self.members.insert(row, ion_type)
    }

    pub fn remove(&mut self, row: &RowKey) -> Option<IonType> {
        self.invalidate();
        self.members.remove(row)
    }

    fn member_mass(&self, table: &FeatureTable, row: RowKey, ion_type: &IonType) -> f64 {
        ion_type.neutral_mass(table[row].mz)
    }

    /// Compute the statistics of the current members without caching them
    pub fn calc_stats(&self, table: &FeatureTable) -> NetworkStats {
        if self.members.is_empty() {
            return NetworkStats::default();
        }
        let n = self.members.len() as f64;
        let mut mass = 0.0;
        let mut rt = 0.0;
        let mut height_sum = 0.0;
        let mut lowest_id = u32::MAX;
        for (k, t) in self.members.iter() {
            let row = &table[*k];
            mass += t.neutral_mass(row.mz);
            rt += row.rt;
            height_sum += row.max_height();
            lowest_id = lowest_id.min(row.id);
        }
        let neutral_mass = mass / n;
        let max_dev = self
            .members
            .iter()
            .map(|(k, t)| (self.member_mass(table, *k, t) - neutral_mass).abs())
            .fold(0.0, f64::max);
        NetworkStats {
            neutral_mass,
            max_dev,
            avg_rt: rt / n,
            height_sum,
            lowest_id,
        }
    }

    /// Recompute and cache the statistics
    pub fn recompute(&mut self, table: &FeatureTable) -> NetworkStats {
        let stats = self.calc_stats(table);
        self.stats = Some(stats);
        stats
    }

    /// The cached statistics, if they are current
    pub fn stats(&self) -> Option<&NetworkStats> {
        self.stats.as_ref()
    }

    fn current_stats(&mut self, table: &FeatureTable) -> NetworkStats {
        match self.stats {
            Some(stats) => stats,
            None => self.recompute(table),
        }
    }

    pub fn neutral_mass(&mut self, table: &FeatureTable) -> f64 {
        self.current_stats(table).neutral_mass
    }

    pub fn max_dev(&mut self, table: &FeatureTable) -> f64 {
        self.current_stats(table).max_dev
    }

    /// Whether every member lies within `tolerance` of the network's neutral mass
    pub fn check_all_within_mz_tol(&mut self, table: &FeatureTable, tolerance: Tolerance) -> bool {
        let stats = self.current_stats(table);
        tolerance.test(stats.neutral_mass, stats.neutral_mass + stats.max_dev)
    }

    /// Whether `row` as `ion_type` agrees with the network's neutral mass
    pub fn check_for_annotation(
        &mut self,
        table: &FeatureTable,
        row: RowKey,
        ion_type: &IonType,
    ) -> bool {
        let mass = ion_type.neutral_mass(table[row].mz);
        let tol = self.mz_tolerance;
        tol.test(self.neutral_mass(table), mass)
    }

    /// Link `identity` on `row` with every member whose neutral mass agrees with it, both ways
    pub fn add_all_links_to(
        &self,
        table: &mut FeatureTable,
        row: RowKey,
        identity: &mut IonIdentity,
    ) {
        let mass = identity.ion_type.neutral_mass(table[row].mz);
        for (member, member_type) in self.members.iter() {
            if *member == row {
                continue;
            }
            let member_mass = self.member_mass(table, *member, member_type);
            if self.mz_tolerance.test(member_mass, mass) {
                identity.add_partner(*member, member_type.clone());
                if let Some(ion) = table[*member].ion_mut(member_type) {
                    ion.add_partner(row, identity.ion_type.clone());
                }
            }
        }
    }

    /// Link every charged member with every other member in tolerance
    pub fn recalc_connections(&self, table: &mut FeatureTable) {
        for (row, ion_type) in self.members.iter() {
            if ion_type.charge == 0 {
                continue;
            }
            let Some(mut identity) = table[*row].ion(ion_type).cloned() else {
                continue;
            };
            self.add_all_links_to(table, *row, &mut identity);
            if let Some(ion) = table[*row].ion_mut(ion_type) {
                ion.merge_links(&identity);
            }
        }
    }

    /// Point every member identity at this network
    pub fn set_network_to_all_rows(&self, table: &mut FeatureTable) {
        for (row, ion_type) in self.members.iter() {
            if let Some(ion) = table[*row].ion_mut(ion_type) {
                ion.network = Some(self.key);
            }
        }
    }

    /// Whether all member rows share the same group, or all have none
    pub fn all_same_group(&self, table: &FeatureTable) -> bool {
        let mut groups = self.members.keys().map(|k| table[*k].group);
        match groups.next() {
            Some(first) => groups.all(|g| g == first),
            None => true,
        }
    }

    pub fn relations(&self) -> impl Iterator<Item = &NetworkRelation> {
        self.relations.values()
    }

    pub fn add_relation(&mut self, relation: NetworkRelation) {
        self.relations.insert(relation.other(self.key), relation);
    }

    pub fn clear_relations(&mut self) {
        self.relations.clear();
    }
}

/// The arena of all [`IonNetwork`]s, addressed by [`NetworkKey`]
#[derive(Debug, Default, Clone)]
pub struct IonNetworks {
    networks: Vec<IonNetwork>,
}

impl IonNetworks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    pub fn get(&self, key: NetworkKey) -> Option<&IonNetwork> {
        self.networks.get(key.0)
    }

    pub fn get_mut(&mut self, key: NetworkKey) -> Option<&mut IonNetwork> {
        self.networks.get_mut(key.0)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, IonNetwork> {
        self.networks.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, IonNetwork> {
        self.networks.iter_mut()
    }

    /// Add a new empty network and return its key
    pub fn create(&mut self, mz_tolerance: Tolerance) -> NetworkKey {
        let key = NetworkKey(self.networks.len());
        self.networks.push(IonNetwork::new(key, mz_tolerance));
        key
    }

    /// Drop empty networks, assign dense keys `0..N` and point every member identity at
    /// its network. Identities outside any network are left with no network.
    pub fn reset_ids(&mut self, table: &mut FeatureTable) {
        self.networks.retain(|n| !n.is_empty());
        for row in table.rows.iter_mut() {
            for ion in row.ions.iter_mut() {
                ion.network = None;
            }
        }
        for (i, net) in self.networks.iter_mut().enumerate() {
            if net.key.0 != i {
                net.clear_relations();
            }
            net.key = NetworkKey(i);
            net.set_network_to_all_rows(table);
        }
    }

    /// Delete networks with fewer than `min_size` members, returning how many were removed
    pub fn remove_small_networks(&mut self, table: &mut FeatureTable, min_size: usize) -> usize {
        let before = self.networks.len();
        self.networks.retain(|n| n.len() >= min_size);
        let removed = before - self.networks.len();
        if removed > 0 {
            for net in self.networks.iter_mut() {
                net.clear_relations();
            }
        }
        self.reset_ids(table);
        debug!("Removed {removed} networks with fewer than {min_size} members");
        removed
    }

    pub fn recompute_all(&mut self, table: &FeatureTable) {
        for net in self.networks.iter_mut() {
            net.recompute(table);
        }
    }

    /// Link all charged members to all members within tolerance, in every network
    pub fn recalc_connections(&self, table: &mut FeatureTable) {
        for net in self.networks.iter() {
            net.recalc_connections(table);
        }
    }

    /// The distinct networks any identity of `row` belongs to
    pub fn networks_of(table: &FeatureTable, row: RowKey) -> Vec<NetworkKey> {
        let keys: BTreeSet<NetworkKey> = table[row].ions.iter().filter_map(|i| i.network).collect();
        keys.into_iter().collect()
    }

    /// The largest network touching any row of `group`
    pub fn best_network_for_group(&self, table: &FeatureTable, group: &RowGroup) -> Option<NetworkKey> {
        let keys: BTreeSet<NetworkKey> = group
            .iter()
            .flat_map(|k| Self::networks_of(table, *k))
            .collect();
        keys.into_iter()
            .filter_map(|k| self.get(k).map(|n| (k, n.len())))
            .max_by(|(ka, a), (kb, b)| a.cmp(b).then_with(|| kb.cmp(ka)))
            .map(|(k, _)| k)
    }

    /// Detect condensation and modification relations between all network pairs.
    ///
    /// Returns the number of relations found.
    pub fn find_relations(&mut self, table: &FeatureTable, modifications: &[IonPart]) -> usize {
        let water = IonPart::water_loss();
        let masses: Vec<f64> = self
            .networks
            .iter_mut()
            .map(|n| n.neutral_mass(table))
            .collect();
        let mut found = Vec::new();
        for i in 0..self.networks.len() {
            for j in 0..self.networks.len() {
                if i == j || masses[i] > masses[j] {
                    continue;
                }
                let tol = self.networks[i].mz_tolerance;
                let (a, b) = (NetworkKey(i), NetworkKey(j));
                if tol.test(2.0 * masses[i] + water.mass, masses[j]) {
                    found.push(NetworkRelation {
                        smaller: a,
                        larger: b,
                        kind: RelationKind::Condensation,
                        modification: water.clone().into(),
                    });
                }
                for m in modifications {
                    let gain = if m.mass < 0.0 { m.opposite() } else { m.clone() };
                    if tol.test(masses[i] + gain.mass, masses[j]) {
                        found.push(NetworkRelation {
                            smaller: a,
                            larger: b,
                            kind: RelationKind::Modification,
                            modification: gain.into(),
                        });
                    }
                }
            }
        }
        let n = found.len();
        for rel in found {
            let (a, b) = (rel.smaller, rel.larger);
            self.networks[b.0].add_relation(rel.clone());
            self.networks[a.0].add_relation(rel);
        }
        debug!("Found {n} relations between networks");
        n
    }
}

impl Index<NetworkKey> for IonNetworks {
    type Output = IonNetwork;

    fn index(&self, index: NetworkKey) -> &Self::Output {
        &self.networks[index.0]
    }
}

impl IndexMut<NetworkKey> for IonNetworks {
    fn index_mut(&mut self, index: NetworkKey) -> &mut Self::Output {
        &mut self.networks[index.0]
    }
}

/// Remove the identity `ion_type` from `row` along with the back links its partners hold
pub fn delete_identity(table: &mut FeatureTable, row: RowKey, ion_type: &IonType) {
    let Some(identity) = table[row].remove_ion_identity(ion_type) else {
        return;
    };
    for (partner, partner_type) in identity.partners.iter() {
        if let Some(ion) = table[*partner].ion_mut(partner_type) {
            ion.remove_partner(row);
        }
    }
}

/// Bin every charged identity by its neutral mass at 0.1 Da resolution.
///
/// A row can only appear once per network, so a second identity of the same row
/// falling into the same bin opens the next network for that bin.
fn bin_neutral_masses(table: &FeatureTable, mz_tolerance: Tolerance) -> IonNetworks {
    let mut networks = IonNetworks::new();
    let mut bins: BTreeMap<i64, Vec<NetworkKey>> = BTreeMap::new();
    for (key, row) in table.iter() {
        for ion in row.ions.iter() {
            if ion.ion_type.charge == 0 {
                continue;
            }
            let mass = ion.ion_type.neutral_mass(row.mz);
            let bin = (mass * 10.0).round() as i64;
            let slots = bins.entry(bin).or_default();
            let slot = slots
                .iter()
                .copied()
                .find(|k| !networks[*k].contains(&key));
            let net_key = match slot {
                Some(k) => k,
                None => {
                    let k = networks.create(mz_tolerance);
                    slots.push(k);
                    k
                }
            };
            networks[net_key].insert(key, ion.ion_type.clone());
        }
    }
    networks
}

/// Split networks whose members disagree on the neutral mass. Members are taken in
/// neutral mass order and a new network starts whenever a member falls outside the
/// tolerance of the lightest member of the current one.
fn split_by_mass_tolerance(table: &FeatureTable, networks: IonNetworks) -> IonNetworks {
    let before = networks.len();
    let mut result = IonNetworks::new();
    for net in networks.networks {
        let tolerance = net.mz_tolerance;
        let mut members: Vec<(f64, RowKey, IonType)> = net
            .members
            .into_iter()
            .map(|(row, t)| (t.neutral_mass(table[row].mz), row, t))
            .collect();
        members.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        let mut current: Option<(f64, NetworkKey)> = None;
        for (mass, row, t) in members {
            let key = match current {
                Some((lightest, key)) if tolerance.test(lightest, mass) => key,
                _ => {
                    let key = result.create(tolerance);
                    current = Some((mass, key));
                    key
                }
            };
            result[key].insert(row, t);
        }
    }
    if result.len() > before {
        debug!(
            "Split {before} networks into {} by neutral mass tolerance",
            result.len()
        );
    }
    result
}

/// Split networks spanning more than one group. Members without a group are deleted
/// together with their partner links.
fn split_by_groups(table: &mut FeatureTable, networks: IonNetworks) -> IonNetworks {
    let mut result = IonNetworks::new();
    let mut n_deleted = 0;
    for net in networks.networks {
        if net.all_same_group(table) {
            let key = result.create(net.mz_tolerance);
            for (row, t) in net.members {
                result[key].insert(row, t);
            }
            continue;
        }
        let mut by_group: BTreeMap<usize, NetworkKey> = BTreeMap::new();
        for (row, t) in net.members {
            match table[row].group {
                Some(g) => {
                    let key = *by_group
                        .entry(g)
                        .or_insert_with(|| result.create(net.mz_tolerance));
                    result[key].insert(row, t);
                }
                None => {
                    delete_identity(table, row, &t);
                    n_deleted += 1;
                }
            }
        }
    }
    if n_deleted > 0 {
        debug!("Deleted {n_deleted} ion identities of ungrouped rows");
    }
    result
}

/// Insert neutral loss identities into the networks of their partners, repeating until
/// no new identity is added. Returns the number of added identities.
fn fill_in_neutral_losses(
    table: &mut FeatureTable,
    networks: &mut IonNetworks,
    mz_tolerance: Tolerance,
) -> usize {
    let mut added = 0;
    loop {
        let mut changed = false;
        for key in table.keys().collect::<Vec<_>>() {
            let mut i = 0;
            while i < table[key].ions.len() {
                let neutral = table[key].ions[i].clone();
                i += 1;
                if !neutral.ion_type.is_modified_undefined_adduct() {
                    continue;
                }
                for (partner, partner_type) in neutral.partners.iter() {
                    let partner_nets = IonNetworks::networks_of(table, *partner);
                    if partner_nets.is_empty() {
                        // Move the loss out of its own bin into a network with its partner
                        if table[*partner].ion(partner_type).is_none() {
                            continue;
                        }
                        let current = table[key].ion(&neutral.ion_type).and_then(|i| i.network);
                        if let Some(old) = current {
                            networks[old].remove(&key);
                        }
                        let net_key = networks.create(mz_tolerance);
                        networks[net_key].insert(key, neutral.ion_type.clone());
                        networks[net_key].insert(*partner, partner_type.clone());
                        networks[net_key].set_network_to_all_rows(table);
                        changed = true;
                        continue;
                    }
                    for net_key in partner_nets {
                        let net = &mut networks[net_key];
                        if net.contains(&key) {
                            continue;
                        }
                        let Some(pid) = net.get(partner).cloned() else {
                            continue;
                        };
                        let pid = pid.create_modified(&neutral.ion_type.modification);
                        if table[key].ion(&pid).is_some() || !net.check_for_annotation(table, key, &pid) {
                            continue;
                        }
                        let mut identity = IonIdentity::new(key, pid.clone());
                        identity.neutral_loss_evidence = neutral.neutral_loss_evidence;
                        identity.network = Some(net_key);
                        net.add_all_links_to(table, key, &mut identity);
                        table[key].add_ion_identity(identity);
                        net.insert(key, pid);
                        added += 1;
                        changed = true;
                    }
                }
            }
        }
        if !changed {
            break;
        }
    }
    added
}

/// Parameters for building ion identity networks
#[derive(Debug, Clone, Copy)]
pub struct NetworkParams {
    pub mz_tolerance: Tolerance,
    /// Never let a network span more than one correlation group
    pub use_grouping_constraint: bool,
    pub min_network_size: usize,
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self {
            mz_tolerance: Tolerance::Da(0.005),
            use_grouping_constraint: true,
            min_network_size: 2,
        }
    }
}

/// Build ion identity networks from the identities on `table`, replacing any earlier
/// network assignment
pub fn build_networks(table: &mut FeatureTable, params: &NetworkParams) -> IonNetworks {
    for row in table.rows.iter_mut() {
        for ion in row.ions.iter_mut() {
            ion.network = None;
        }
    }
    let networks = bin_neutral_masses(table, params.mz_tolerance);
    debug!("Binned ion identities into {} networks", networks.len());
    let mut networks = split_by_mass_tolerance(table, networks);
    if params.use_grouping_constraint {
        networks = split_by_groups(table, networks);
        debug!("{} networks after splitting by group", networks.len());
        networks = split_by_mass_tolerance(table, networks);
    }
    networks.reset_ids(table);
    let n_losses = fill_in_neutral_losses(table, &mut networks, params.mz_tolerance);
    debug!("Added {n_losses} neutral loss identities to networks");
    networks.reset_ids(table);
    networks.recompute_all(table);
    info!(
        "Created {} ion identity networks from {} annotated rows",
        networks.len(),
        table.rows.iter().filter(|r| r.has_ions()).count()
    );
    networks
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resolver::{apply_pairings, IonPairing};
    use crate::table::{Feature, Row};

    fn h() -> IonType {
        IonType::from_adduct(IonPart::proton())
    }

    fn na() -> IonType {
        IonType::from_adduct(IonPart::sodium())
    }

    fn k() -> IonType {
        IonType::from_adduct(IonPart::potassium())
    }

    fn row(id: u32, mz: f64, group: Option<usize>) -> Row {
        let mut row = Row::new(id, mz, 5.0, 0, vec![Feature::new(0, 5.0, mz, 1e6 * id as f64)]);
        row.group = group;
        row
    }

    /// Three rows of one molecule as [M+H]+, [M+Na]+ and [M+K]+, plus an unrelated row
    fn table(m: f64, groups: [Option<usize>; 3]) -> FeatureTable {
        let mut table = FeatureTable::new(
            vec!["a".into()],
            vec![
                row(1, h().mz(m), groups[0]),
                row(2, na().mz(m), groups[1]),
                row(3, k().mz(m), groups[2]),
                row(4, 500.0, None),
            ],
        );
        let pairings = vec![
            IonPairing::new(RowKey(0), h(), RowKey(1), na()),
            IonPairing::new(RowKey(0), h(), RowKey(2), k()),
            IonPairing::new(RowKey(1), na(), RowKey(2), k()),
        ];
        apply_pairings(&mut table, &pairings);
        table
    }

    fn assert_partition(table: &FeatureTable, networks: &mut IonNetworks) {
        for (key, row) in table.iter() {
            for ion in row.ions.iter().filter(|i| i.is_charged()) {
                let containing: Vec<_> = networks
                    .iter()
                    .filter(|n| n.get(&key) == Some(&ion.ion_type))
                    .map(|n| n.key)
                    .collect();
                assert!(containing.len() <= 1, "{ion} in {containing:?}");
                assert_eq!(ion.network, containing.first().copied());
            }
        }
        for net in networks.iter_mut() {
            let max_dev = net.max_dev(table);
            let mass = net.neutral_mass(table);
            for (k, t) in net.iter() {
                assert!((t.neutral_mass(table[*k].mz) - mass).abs() <= max_dev + 1e-12);
            }
        }
    }

    #[test_log::test]
    fn test_build() {
        let m = 299.99272;
        let mut table = table(m, [Some(0), Some(0), Some(0)]);
        let mut networks = build_networks(&mut table, &NetworkParams::default());
        assert_eq!(networks.len(), 1);
        let net = &mut networks[NetworkKey(0)];
        assert_eq!(net.len(), 3);
        assert!((net.neutral_mass(&table) - m).abs() < 1e-6);
        assert!(net.check_all_within_mz_tol(&table, Tolerance::Da(0.005)));
        let stats = *net.stats().unwrap();
        assert_eq!(stats.lowest_id, 1);
        assert_eq!(stats.height_sum, 6e6);
        assert_partition(&table, &mut networks);

        // idempotent id reassignment
        let before: Vec<Vec<RowKey>> = networks.iter().map(|n| n.rows().collect()).collect();
        networks.reset_ids(&mut table);
        let after: Vec<Vec<RowKey>> = networks.iter().map(|n| n.rows().collect()).collect();
        assert_eq!(before, after);
        assert_partition(&table, &mut networks);
    }

    #[test_log::test]
    fn test_split_by_mass_tolerance() {
        // two molecules 0.04 Da apart share a 0.1 Da bin
        let (m1, m2) = (300.0, 300.04);
        let mut table = FeatureTable::new(
            vec!["a".into()],
            vec![
                row(1, h().mz(m1), Some(0)),
                row(2, na().mz(m1), Some(0)),
                row(3, h().mz(m2), Some(0)),
                row(4, na().mz(m2), Some(0)),
            ],
        );
        apply_pairings(
            &mut table,
            &[
                IonPairing::new(RowKey(0), h(), RowKey(1), na()),
                IonPairing::new(RowKey(2), h(), RowKey(3), na()),
            ],
        );
        let params = NetworkParams::default();
        let mut networks = build_networks(&mut table, &params);
        assert_eq!(networks.len(), 2);
        let mut members: Vec<Vec<RowKey>> = networks.iter().map(|n| n.rows().collect()).collect();
        members.sort();
        assert_eq!(
            members,
            vec![vec![RowKey(0), RowKey(1)], vec![RowKey(2), RowKey(3)]]
        );
        for net in networks.iter_mut() {
            assert!(net.max_dev(&table) <= 0.005, "{}", net.max_dev(&table));
            assert!(net.check_all_within_mz_tol(&table, params.mz_tolerance));
        }
        assert_partition(&table, &mut networks);

        // the same holds without the grouping constraint
        let mut networks = build_networks(
            &mut table,
            &NetworkParams {
                use_grouping_constraint: false,
                ..params
            },
        );
        assert_eq!(networks.len(), 2);
        for net in networks.iter_mut() {
            assert!(net.check_all_within_mz_tol(&table, params.mz_tolerance));
        }
    }

    #[test_log::test]
    fn test_split_by_group() {
        let m = 299.99272;
        let mut table = table(m, [Some(0), Some(0), None]);
        let mut networks = build_networks(&mut table, &NetworkParams::default());
        assert_eq!(networks.len(), 1);
        assert_eq!(networks[NetworkKey(0)].len(), 2);
        // the ungrouped [M+K]+ identity is gone, and so are the links to it
        assert!(!table[RowKey(2)].has_ions());
        assert!(table[RowKey(0)].ions[0].partners.get(&RowKey(2)).is_none());
        assert_partition(&table, &mut networks);

        let mut table = self::table(m, [Some(0), Some(1), Some(1)]);
        let networks = build_networks(&mut table, &NetworkParams::default());
        assert_eq!(networks.len(), 2);
    }

    #[test_log::test]
    fn test_small_network_cleanup() {
        let mut table = FeatureTable::new(vec![], vec![row(1, 301.0, None)]);
        let mut identity = IonIdentity::new(RowKey(0), h());
        identity.network = Some(NetworkKey(0));
        table[RowKey(0)].add_ion_identity(identity);

        let mut networks = IonNetworks::new();
        let key = networks.create(Tolerance::Da(0.005));
        networks[key].insert(RowKey(0), h());
        assert_eq!(networks.remove_small_networks(&mut table, 2), 1);
        assert!(networks.is_empty());
        assert_eq!(table[RowKey(0)].ions[0].network, None);
        assert_eq!(table[RowKey(0)].ions.len(), 1);
    }

    #[test_log::test]
    fn test_neutral_loss_backfill() {
        let m = 180.06339;
        let water = IonParts::from(IonPart::water_loss());
        let h_h2o = h().create_modified(&water);
        let mut table = FeatureTable::new(
            vec![],
            vec![
                row(1, h().mz(m), Some(0)),
                row(2, na().mz(m), Some(0)),
                row(3, h_h2o.mz(m), Some(0)),
            ],
        );
        let undefined = IonType::undefined(1);
        let loss = undefined.create_modified(&water);
        apply_pairings(
            &mut table,
            &[
                IonPairing::new(RowKey(0), h(), RowKey(1), na()),
                IonPairing::new(RowKey(0), undefined.clone(), RowKey(2), loss),
            ],
        );
        let mut networks = build_networks(&mut table, &NetworkParams::default());

        let backfilled = table[RowKey(2)].ion(&h_h2o).expect("backfilled identity");
        let net_key = backfilled.network.unwrap();
        assert!(backfilled.partners.contains_key(&RowKey(0)));
        assert!(backfilled.partners.contains_key(&RowKey(1)));
        let net = &networks[net_key];
        assert_eq!(net.len(), 3);
        assert_eq!(net.get(&RowKey(0)), Some(&h()));
        assert_eq!(net.get(&RowKey(2)), Some(&h_h2o));
        // back links
        let h_ion = table[RowKey(0)].ion(&h()).unwrap();
        assert_eq!(h_ion.partners.get(&RowKey(2)), Some(&h_h2o));
        assert_partition(&table, &mut networks);
    }

    #[test]
    fn test_relations() {
        let water = IonPart::water_loss();
        let m = 180.06339;
        let dimer = 2.0 * m + water.mass;
        let acn = IonPart::acetonitrile_cluster();
        let mut table = FeatureTable::new(
            vec![],
            vec![
                row(1, h().mz(m), None),
                row(2, na().mz(m), None),
                row(3, h().mz(dimer), None),
                row(4, na().mz(dimer), None),
                row(5, h().mz(m + acn.mass), None),
                row(6, na().mz(m + acn.mass), None),
            ],
        );
        apply_pairings(
            &mut table,
            &[
                IonPairing::new(RowKey(0), h(), RowKey(1), na()),
                IonPairing::new(RowKey(2), h(), RowKey(3), na()),
                IonPairing::new(RowKey(4), h(), RowKey(5), na()),
            ],
        );
        let mut networks = build_networks(&mut table, &NetworkParams::default());
        assert_eq!(networks.len(), 3);
        let n = networks.find_relations(&table, &[acn.clone()]);
        assert_eq!(n, 2);
        let base = NetworkKey(0);
        let names: Vec<String> = networks[base]
            .relations()
            .map(|r| r.name_for(base))
            .collect();
        assert!(names.contains(&"M(1_condensed)".to_string()), "{names:?}");
        assert!(names.contains(&"M(2)-ACN".to_string()), "{names:?}");
        let names: Vec<String> = networks[NetworkKey(1)]
            .relations()
            .map(|r| r.name_for(NetworkKey(1)))
            .collect();
        assert_eq!(names, vec!["2Mcondensed(0)-H2O".to_string()]);
    }

    #[test]
    fn test_best_network() {
        let mut table = table(299.99272, [Some(0), Some(0), Some(0)]);
        let networks = build_networks(&mut table, &NetworkParams::default());
        let group = RowGroup::new(0, vec![RowKey(0), RowKey(1), RowKey(2)], vec![]);
        assert_eq!(networks.best_network_for_group(&table, &group), Some(NetworkKey(0)));
    }
}
