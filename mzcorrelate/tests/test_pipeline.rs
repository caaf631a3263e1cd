use std::collections::BTreeSet;

use mzcorrelate::api::{meta_correlate, MetaCorrelateEngine, MetaCorrelateParams};
use mzcorrelate::ion_type::{IonPart, IonParts, IonType};
use mzcorrelate::progress::{AtomicProgress, ProgressSink};
use mzcorrelate::table::{Feature, FeatureTable, ProfilePoint, Row, RowKey};
use mzcorrelate::MetaCorrelateResult;

const SHAPE: [f64; 9] = [0.1, 0.3, 0.6, 0.9, 1.0, 0.9, 0.6, 0.3, 0.1];

fn feature(sample: usize, rt: f64, mz: f64, height: f64) -> Feature {
    let profile = SHAPE
        .iter()
        .enumerate()
        .map(|(i, s)| ProfilePoint::new(100 + i as u32, s * height))
        .collect();
    Feature::new(sample, rt, mz, height).with_profile(profile)
}

fn row(id: u32, mz: f64, rt: f64, height: f64) -> Row {
    let features = [1.0, 0.6, 1.4]
        .iter()
        .enumerate()
        .map(|(sample, scale)| feature(sample, rt + 0.001 * sample as f64, mz, height * scale))
        .collect();
    Row::new(id, mz, rt, 0, features)
}

fn proton() -> IonType {
    IonType::from_adduct(IonPart::proton())
}

fn sodium() -> IonType {
    IonType::from_adduct(IonPart::sodium())
}

fn water_loss_proton() -> IonType {
    IonType::new(
        IonParts::single(IonPart::proton()),
        IonParts::single(IonPart::water_loss()),
        1,
    )
}

/// [M+H]+, [M+Na]+ and an in-source water loss of one molecule, plus an unrelated
/// compound eluting later
fn synthetic_table() -> FeatureTable {
    let m = proton().neutral_mass(301.0);
    FeatureTable::new(
        vec!["s1".into(), "s2".into(), "s3".into()],
        vec![
            row(1, 301.0, 5.0, 5e6),
            row(2, sodium().mz(m), 5.01, 2e6),
            row(3, 301.0 + IonPart::water_loss().mass, 5.0, 1e6),
            row(4, 455.2, 9.0, 3e6),
        ],
    )
}

fn assert_partition(result: &MetaCorrelateResult) {
    let mut seen = BTreeSet::new();
    for net in result.networks.iter() {
        for (key, ion_type) in net.iter() {
            assert!(seen.insert((key.0, ion_type.to_string())));
            let ion = result.table[*key].ion(ion_type).unwrap();
            assert_eq!(ion.network, Some(net.key));
        }
    }
    for (key, row) in result.table.iter() {
        for ion in row.ions.iter().filter(|i| i.network.is_some()) {
            assert!(seen.contains(&(key.0, ion.ion_type.to_string())));
        }
    }
}

#[test_log::test]
fn test_full_workflow() {
    let progress = AtomicProgress::new();
    let engine = MetaCorrelateEngine::new(MetaCorrelateParams::default()).unwrap();
    let result = engine.run(synthetic_table(), &progress).unwrap();
    assert!(!result.cancelled);
    assert_eq!(progress.progress(), 1.0);

    // correlation is stored once per unordered pair
    assert_eq!(result.correlations.get(1, 2), result.correlations.get(2, 1));
    assert!(result.correlations.get(1, 2).unwrap().avg_shape_r().unwrap() > 0.99);
    assert!(result.correlations.get(1, 4).is_none());

    assert_eq!(result.groups.len(), 1);
    assert_eq!(result.groups[0].rows, vec![RowKey(0), RowKey(1), RowKey(2)]);
    assert_eq!(result.table[RowKey(3)].group, None);
    assert!(!result.table[RowKey(3)].has_ions());

    let best_h = result.table[RowKey(0)].best_ion().unwrap();
    let best_na = result.table[RowKey(1)].best_ion().unwrap();
    let best_loss = result.table[RowKey(2)].best_ion().unwrap();
    assert_eq!(best_h.ion_type, proton());
    assert_eq!(best_na.ion_type, sodium());
    assert_eq!(best_loss.ion_type, water_loss_proton());
    assert!(best_h.partners.contains_key(&RowKey(1)));

    let net_key = best_h.network.unwrap();
    assert_eq!(best_na.network, Some(net_key));
    assert_eq!(best_loss.network, Some(net_key));
    let net = &result.networks[net_key];
    assert_eq!(net.len(), 3);
    let stats = net.stats().unwrap();
    assert!((stats.neutral_mass - proton().neutral_mass(301.0)).abs() < 0.005);

    // the undefined adduct explanation is kept but ranked last
    let undefined = result.table[RowKey(0)].ions.last().unwrap();
    assert!(undefined.ion_type.is_undefined_adduct_parent());

    assert_partition(&result);
}

#[test_log::test]
fn test_without_groups_and_strict_cleanup() {
    let params = MetaCorrelateParams {
        annotate_within_groups: false,
        min_network_size: 3,
        ..Default::default()
    };
    let result = meta_correlate(synthetic_table(), params).unwrap();
    assert_eq!(result.networks.len(), 1);
    assert_eq!(
        result.table[RowKey(1)].best_ion().unwrap().ion_type,
        sodium()
    );
    for row in result.table.rows.iter() {
        for ion in row.ions.iter() {
            if ion.ion_type.is_undefined_adduct() {
                assert_eq!(ion.network, None);
            }
        }
    }
    assert_partition(&result);
}

#[test_log::test]
fn test_rerun_is_stable() {
    let engine = MetaCorrelateEngine::new(MetaCorrelateParams::default()).unwrap();
    let first = engine.run(synthetic_table(), &AtomicProgress::new()).unwrap();
    let second = engine.run(first.table.clone(), &AtomicProgress::new()).unwrap();
    assert_eq!(first.groups, second.groups);
    assert_eq!(first.networks.len(), second.networks.len());
    for (a, b) in first.networks.iter().zip(second.networks.iter()) {
        assert_eq!(a.rows().collect::<Vec<_>>(), b.rows().collect::<Vec<_>>());
    }
}

#[test_log::test]
fn test_cancelled_keeps_partial_results() {
    struct CancelAfterCorrelation(AtomicProgress);

    impl ProgressSink for CancelAfterCorrelation {
        fn set_progress(&self, fraction: f64) {
            self.0.set_progress(fraction);
            if fraction >= mzcorrelate::api::CORRELATION_STAGE {
                self.0.cancel();
            }
        }

        fn is_cancelled(&self) -> bool {
            self.0.is_cancelled()
        }
    }

    let progress = CancelAfterCorrelation(AtomicProgress::new());
    let engine = MetaCorrelateEngine::new(MetaCorrelateParams::default()).unwrap();
    let result = engine.run(synthetic_table(), &progress).unwrap();
    assert!(result.cancelled);
    assert!(!result.correlations.is_empty());
    assert!(result.groups.is_empty());
    assert!(result.networks.is_empty());
}
