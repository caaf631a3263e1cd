/*! Likelihood ordering of competing ion identities on a row */
use std::cmp::Ordering;

use tracing::debug;

use crate::grouping::RowGroup;
use crate::identity::IonIdentity;
use crate::network::IonNetworks;
use crate::table::{FeatureTable, Row};

fn network_size(ion: &IonIdentity, networks: &IonNetworks) -> usize {
    ion.network
        .and_then(|k| networks.get(k))
        .map(|n| n.len())
        .unwrap_or_default()
}

fn links(ion: &IonIdentity, group: Option<&RowGroup>) -> usize {
    match group {
        Some(group) => ion.partner_count_where(|k| group.contains(&k)),
        None => ion.partner_count(),
    }
}

fn compare_molecules(a: &IonIdentity, b: &IonIdentity) -> Ordering {
    let (ma, mb) = (a.ion_type.molecules, b.ion_type.molecules);
    let (ea, eb) = (a.multimer_evidence > 0, b.multimer_evidence > 0);
    match ma.cmp(&mb) {
        Ordering::Equal => ea.cmp(&eb),
        // a is the larger multimer
        Ordering::Greater => {
            if ea {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        Ordering::Less => {
            if eb {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
    }
}

fn compare_charge(a: &IonIdentity, b: &IonIdentity) -> Ordering {
    let (za, zb) = (a.ion_type.abs_charge(), b.ion_type.abs_charge());
    match (za == 0, zb == 0) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => zb.cmp(&za),
    }
}

/// Compare two identities by how likely they are. [`Ordering::Greater`] means `a` is
/// the better explanation.
///
/// The criteria are tried in order until one decides:
/// 1. an undefined adduct without modification is always worst
/// 2. membership in the larger network
/// 3. fewer molecules, unless the larger multimer was confirmed by MS/MS
/// 4. a neutral loss confirmed by MS/MS
/// 5. more partner links, counting only partners in `group` when given
/// 6. a lower absolute charge, with uncharged identities last
pub fn compare_identities(
    a: &IonIdentity,
    b: &IonIdentity,
    networks: &IonNetworks,
    group: Option<&RowGroup>,
) -> Ordering {
    match (
        a.ion_type.is_undefined_adduct_parent(),
        b.ion_type.is_undefined_adduct_parent(),
    ) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }
    network_size(a, networks)
        .cmp(&network_size(b, networks))
        .then_with(|| compare_molecules(a, b))
        .then_with(|| (a.neutral_loss_evidence > 0).cmp(&(b.neutral_loss_evidence > 0)))
        .then_with(|| links(a, group).cmp(&links(b, group)))
        .then_with(|| compare_charge(a, b))
}

/// Sort the identities of `row` best first
pub fn sort_ion_identities(row: &mut Row, networks: &IonNetworks, group: Option<&RowGroup>) {
    row.ions
        .sort_by(|a, b| compare_identities(b, a, networks, group));
}

/// Sort the identities of every row, scoping link counts to each row's group when `use_group` is set
pub fn rank_all(table: &mut FeatureTable, networks: &IonNetworks, groups: &[RowGroup], use_group: bool) {
    let mut n_ranked = 0;
    for row in table.rows.iter_mut() {
        if row.ions.len() < 2 {
            continue;
        }
        let group = if use_group {
            row.group.and_then(|g| groups.get(g))
        } else {
            None
        };
        sort_ion_identities(row, networks, group);
        n_ranked += 1;
    }
    debug!("Ranked competing ion identities on {n_ranked} rows");
}

/// The preferred identity among `row`'s identities, without reordering them
pub fn best_identity<'a>(
    row: &'a Row,
    networks: &IonNetworks,
    group: Option<&RowGroup>,
) -> Option<&'a IonIdentity> {
    row.ions
        .iter()
        .max_by(|a, b| compare_identities(a, b, networks, group))
}
