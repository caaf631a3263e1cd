/*! Fragmentation spectrum evidence for ion identities and spectral similarity between rows */
use std::sync::atomic::{AtomicUsize, Ordering};

use itertools::Itertools;
use mzpeaks::{CentroidPeak, MZPeakSetType, PeakCollection, Tolerance};
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::grouping::RowGroup;
use crate::ion_type::IonType;
use crate::progress::StageProgress;
use crate::similarity::SimilarityMeasure;
use crate::table::{FeatureTable, Row, RowKey};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MsmsError {
    #[error("The fragmentation scan of row {row} has no mass list named {name:?}")]
    MissingMassList { row: u32, name: String },
}

/// Which fragment signals confirm a neutral loss
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NeutralLossCheck {
    /// Only the modified row's m/z in the fragment spectrum of a related row
    #[default]
    PrecursorOnly,
    /// Also any pair of fragments separated by the lost mass
    AnySignal,
}

#[derive(Debug, Clone)]
pub struct MsmsParams {
    pub mass_list: String,
    pub mz_tolerance: Tolerance,
    pub min_height: f64,
    pub check_multimers: bool,
    pub check_neutral_losses: bool,
    pub neutral_loss_check: NeutralLossCheck,
}

impl Default for MsmsParams {
    fn default() -> Self {
        Self {
            mass_list: "centroid".to_string(),
            mz_tolerance: Tolerance::Da(0.005),
            min_height: 0.0,
            check_multimers: true,
            check_neutral_losses: true,
            neutral_loss_check: NeutralLossCheck::PrecursorOnly,
        }
    }
}

/// The most intense peak within `tolerance` of `mz` that reaches `min_height`
pub fn find_peak_at(
    peaks: &MZPeakSetType<CentroidPeak>,
    mz: f64,
    tolerance: Tolerance,
    min_height: f64,
) -> Option<&CentroidPeak> {
    peaks
        .all_peaks_for(mz, tolerance)
        .iter()
        .filter(|p| p.intensity as f64 >= min_height)
        .max_by(|a, b| a.intensity.total_cmp(&b.intensity))
}

/// The precursor m/z and the named mass list of the best fragmentation scan of `row`.
///
/// `Ok(None)` means the row was never fragmented.
pub fn fragment_peaks(
    row: &Row,
    mass_list: &str,
) -> Result<Option<(f64, MZPeakSetType<CentroidPeak>)>, MsmsError> {
    let Some(scan) = row.best_fragment_scan() else {
        return Ok(None);
    };
    match scan.peaks(mass_list) {
        Some(peaks) => Ok(Some((scan.precursor_mz, peaks))),
        None => Err(MsmsError::MissingMassList {
            row: row.id,
            name: mass_list.to_string(),
        }),
    }
}

/// Count the lower order clusters of a multimer identity present in the row's own
/// fragmentation spectrum, e.g. [M+H]+ within the spectrum of [2M+H]+
pub fn check_multimer(row: &Row, ion_type: &IonType, params: &MsmsParams) -> Result<u32, MsmsError> {
    if ion_type.molecules < 2 {
        return Ok(0);
    }
    let Some((precursor_mz, peaks)) = fragment_peaks(row, &params.mass_list)? else {
        return Ok(0);
    };
    let neutral_mass = ion_type.neutral_mass(precursor_mz);
    let found = (1..ion_type.molecules)
        .filter(|n| {
            let mz = ion_type.with_molecules(*n).mz(neutral_mass);
            find_peak_at(&peaks, mz, params.mz_tolerance, params.min_height).is_some()
        })
        .count();
    Ok(found as u32)
}

fn count_loss_pairs(peaks: &MZPeakSetType<CentroidPeak>, loss: f64, params: &MsmsParams) -> usize {
    peaks
        .iter()
        .filter(|p| {
            find_peak_at(peaks, p.mz + loss, params.mz_tolerance, params.min_height).is_some()
        })
        .count()
}

/// Count the fragmentation spectra of related rows that contain the neutral loss of a
/// modified identity on `key`.
///
/// The related rows are the other members of `group` when one is given, otherwise the
/// identity's partners. Related rows whose spectrum lacks the mass list are skipped.
pub fn check_neutral_loss(
    table: &FeatureTable,
    key: RowKey,
    ion_type: &IonType,
    group: Option<&RowGroup>,
    params: &MsmsParams,
) -> u32 {
    if !ion_type.is_modified_undefined_adduct() {
        return 0;
    }
    let Some(row) = table.get(key) else {
        return 0;
    };
    let related: Vec<RowKey> = match group {
        Some(group) if group.len() > 1 => group.iter().copied().filter(|k| *k != key).collect(),
        _ => row
            .ion(ion_type)
            .map(|ion| ion.partners.keys().copied().collect())
            .unwrap_or_default(),
    };
    let z = ion_type.abs_charge().max(1) as f64;
    let loss = ion_type.modification.mass() / z;

    let mut confirmed = 0;
    for parent in related {
        let Some(parent_row) = table.get(parent) else {
            continue;
        };
        let peaks = match fragment_peaks(parent_row, &params.mass_list) {
            Ok(Some((_, peaks))) => peaks,
            Ok(None) => continue,
            Err(e) => {
                warn!("Skipping neutral loss check against row {}: {e}", parent_row.id);
                continue;
            }
        };
        let mut hit =
            find_peak_at(&peaks, row.mz, params.mz_tolerance, params.min_height).is_some();
        if params.neutral_loss_check == NeutralLossCheck::AnySignal {
            hit |= count_loss_pairs(&peaks, loss, params) > 0;
        }
        if hit {
            confirmed += 1;
        }
    }
    confirmed
}

/// Summary counts from [`check_msms_evidence`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MsmsSummary {
    pub multimers: usize,
    pub neutral_losses: usize,
    pub skipped_rows: usize,
}

struct EvidenceUpdate {
    key: RowKey,
    ion_type: IonType,
    multimer: u32,
    neutral_loss: u32,
}

/// Check every annotated row's identities against fragmentation spectra and record the
/// evidence counters on the identities
pub(crate) fn check_msms_evidence(
    table: &mut FeatureTable,
    groups: &[RowGroup],
    params: &MsmsParams,
    progress: &StageProgress<'_>,
) -> MsmsSummary {
    let skipped = AtomicUsize::new(0);
    let updates: Vec<EvidenceUpdate> = {
        let table: &FeatureTable = table;
        let keys: Vec<RowKey> = table
            .iter()
            .filter(|(_, row)| row.has_ions())
            .map(|(k, _)| k)
            .collect();
        keys.par_iter()
            .flat_map_iter(|key| {
                let mut updates = Vec::new();
                if progress.is_cancelled() {
                    return updates;
                }
                let row = &table[*key];
                let group = row.group.and_then(|g| groups.get(g));
                let mut row_skipped = false;
                for ion in row.ions.iter() {
                    let multimer = if params.check_multimers && !row_skipped {
                        match check_multimer(row, &ion.ion_type, params) {
                            Ok(n) => n,
                            Err(e) => {
                                warn!("Skipping multimer check: {e}");
                                row_skipped = true;
                                0
                            }
                        }
                    } else {
                        0
                    };
                    let neutral_loss = if params.check_neutral_losses {
                        check_neutral_loss(table, *key, &ion.ion_type, group, params)
                    } else {
                        0
                    };
                    if multimer > 0 || neutral_loss > 0 {
                        updates.push(EvidenceUpdate {
                            key: *key,
                            ion_type: ion.ion_type.clone(),
                            multimer,
                            neutral_loss,
                        });
                    }
                }
                if row_skipped {
                    skipped.fetch_add(1, Ordering::Relaxed);
                }
                progress.tick();
                updates
            })
            .collect()
    };

    let mut summary = MsmsSummary {
        skipped_rows: skipped.load(Ordering::Relaxed),
        ..Default::default()
    };
    for update in updates {
        if let Some(ion) = table[update.key].ion_mut(&update.ion_type) {
            ion.multimer_evidence = update.multimer;
            ion.neutral_loss_evidence = update.neutral_loss;
            if update.multimer > 0 {
                summary.multimers += 1;
            }
            if update.neutral_loss > 0 {
                summary.neutral_losses += 1;
            }
        }
    }
    info!(
        "MS/MS verified {} multimers and {} neutral losses",
        summary.multimers, summary.neutral_losses
    );
    if summary.skipped_rows > 0 {
        debug!("{} rows were skipped for MS/MS evidence", summary.skipped_rows);
    }
    progress.finish();
    summary
}

#[derive(Debug, Clone)]
pub struct Ms2SimilarityParams {
    pub mass_list: String,
    pub mz_tolerance: Tolerance,
    pub min_height: f64,
    /// The minimum number of aligned signals for a similarity to be reported
    pub min_matched_signals: usize,
    /// Only the most intense signals of each spectrum are used to build fragment differences
    pub max_signals_for_differences: usize,
}

impl Default for Ms2SimilarityParams {
    fn default() -> Self {
        Self {
            mass_list: "centroid".to_string(),
            mz_tolerance: Tolerance::Da(0.005),
            min_height: 0.0,
            min_matched_signals: 3,
            max_signals_for_differences: 25,
        }
    }
}

/// The cosine of aligned signals and how many signals took part in it
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SpectralMatch {
    pub cosine: f64,
    pub matched: usize,
}

/// The similarity of the fragmentation spectra of two rows, identified by row id with
/// the lower id first
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Ms2Similarity {
    pub row_a: u32,
    pub row_b: u32,
    pub spectral: Option<SpectralMatch>,
    /// The similarity of the pairwise fragment m/z differences
    pub neutral_loss: Option<SpectralMatch>,
}

/// A source of pairwise fragmentation spectrum similarity.
///
/// `Ok(None)` means the rows could not be compared or did not match enough signals.
pub trait Ms2SimilarityScorer: Send + Sync {
    fn similarity(
        &self,
        a: &Row,
        b: &Row,
        params: &Ms2SimilarityParams,
    ) -> Result<Option<Ms2Similarity>, MsmsError>;
}

/// Cosine similarity over greedily aligned signals, for both fragments and their differences
#[derive(Debug, Default, Clone, Copy)]
pub struct CosineMs2Scorer;

fn filtered_peaks(peaks: &MZPeakSetType<CentroidPeak>, min_height: f64) -> Vec<CentroidPeak> {
    peaks
        .iter()
        .filter(|p| p.intensity as f64 >= min_height)
        .cloned()
        .collect()
}

/// Pair each signal of `a` with the most intense unused signal of `b` in tolerance,
/// keeping only aligned pairs
fn align(a: &[CentroidPeak], b: &[CentroidPeak], tolerance: Tolerance) -> Vec<(f64, f64)> {
    let mut used = vec![false; b.len()];
    let mut order: Vec<&CentroidPeak> = a.iter().collect();
    order.sort_by(|x, y| y.intensity.total_cmp(&x.intensity));
    let mut pairs = Vec::new();
    for pa in order {
        let best = b
            .iter()
            .enumerate()
            .filter(|(i, pb)| !used[*i] && tolerance.test(pb.mz, pa.mz))
            .max_by(|(_, x), (_, y)| x.intensity.total_cmp(&y.intensity));
        if let Some((i, pb)) = best {
            used[i] = true;
            pairs.push((pa.intensity as f64, pb.intensity as f64));
        }
    }
    pairs
}

/// All pairwise m/z differences among the `max_signals` most intense signals, weighted
/// by the product of the two intensities
fn mz_differences(peaks: &[CentroidPeak], max_signals: usize) -> Vec<CentroidPeak> {
    let mut top: Vec<&CentroidPeak> = peaks.iter().collect();
    top.sort_by(|x, y| y.intensity.total_cmp(&x.intensity));
    top.truncate(max_signals);
    top.sort_by(|x, y| x.mz.total_cmp(&y.mz));
    let mut diffs = Vec::new();
    for (i, lo) in top.iter().enumerate() {
        for hi in top[i + 1..].iter() {
            diffs.push(CentroidPeak::new(
                hi.mz - lo.mz,
                lo.intensity * hi.intensity,
                diffs.len() as u32,
            ));
        }
    }
    diffs
}

fn match_signals(
    a: &[CentroidPeak],
    b: &[CentroidPeak],
    params: &Ms2SimilarityParams,
) -> Option<SpectralMatch> {
    let pairs = align(a, b, params.mz_tolerance);
    if pairs.len() < params.min_matched_signals.max(1) {
        return None;
    }
    let (xs, ys): (Vec<f64>, Vec<f64>) = pairs.into_iter().unzip();
    let cosine = SimilarityMeasure::Cosine.calc(&xs, &ys)?;
    Some(SpectralMatch {
        cosine,
        matched: xs.len(),
    })
}

impl Ms2SimilarityScorer for CosineMs2Scorer {
    fn similarity(
        &self,
        a: &Row,
        b: &Row,
        params: &Ms2SimilarityParams,
    ) -> Result<Option<Ms2Similarity>, MsmsError> {
        let (Some((_, peaks_a)), Some((_, peaks_b))) = (
            fragment_peaks(a, &params.mass_list)?,
            fragment_peaks(b, &params.mass_list)?,
        ) else {
            return Ok(None);
        };
        let peaks_a = filtered_peaks(&peaks_a, params.min_height);
        let peaks_b = filtered_peaks(&peaks_b, params.min_height);

        let spectral = match_signals(&peaks_a, &peaks_b, params);
        let neutral_loss = match_signals(
            &mz_differences(&peaks_a, params.max_signals_for_differences),
            &mz_differences(&peaks_b, params.max_signals_for_differences),
            params,
        );
        if spectral.is_none() && neutral_loss.is_none() {
            return Ok(None);
        }
        let (row_a, row_b) = if a.id <= b.id { (a.id, b.id) } else { (b.id, a.id) };
        Ok(Some(Ms2Similarity {
            row_a,
            row_b,
            spectral,
            neutral_loss,
        }))
    }
}

/// Compare the fragmentation spectra of all member pairs of each group, in parallel over groups
pub(crate) fn group_ms2_similarity(
    table: &FeatureTable,
    groups: &[RowGroup],
    scorer: &dyn Ms2SimilarityScorer,
    params: &Ms2SimilarityParams,
    progress: &StageProgress<'_>,
) -> Vec<Ms2Similarity> {
    let similarities: Vec<Ms2Similarity> = groups
        .par_iter()
        .flat_map_iter(|group| {
            let mut found = Vec::new();
            if progress.is_cancelled() {
                return found;
            }
            for (a, b) in group.rows.iter().tuple_combinations() {
                match scorer.similarity(&table[*a], &table[*b], params) {
                    Ok(Some(sim)) => found.push(sim),
                    Ok(None) => {}
                    Err(e) => warn!("Skipping MS2 similarity in group {}: {e}", group.id),
                }
            }
            progress.tick();
            found
        })
        .collect();
    info!(
        "Found {} MS2 similarities within {} groups",
        similarities.len(),
        groups.len()
    );
    progress.finish();
    similarities
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ion_type::{IonPart, IonParts};
    use crate::progress::NoProgress;
    use crate::table::{Feature, FragmentScan};

    fn scan(precursor_mz: f64, peaks: &[(f64, f32)]) -> FragmentScan {
        let peaks = peaks
            .iter()
            .enumerate()
            .map(|(i, (mz, int))| CentroidPeak::new(*mz, *int, i as u32))
            .collect();
        FragmentScan::new(precursor_mz).with_mass_list("centroid", peaks)
    }

    fn row(id: u32, mz: f64, scan: Option<FragmentScan>) -> Row {
        let mut feature = Feature::new(0, 1.0, mz, 1e6);
        if let Some(scan) = scan {
            feature = feature.with_fragment_scan(scan);
        }
        Row::new(id, mz, 1.0, 1, vec![feature])
    }

    fn h() -> IonType {
        IonType::from_adduct(IonPart::proton())
    }

    #[test_log::test]
    fn test_multimer() {
        let dimer = h().with_molecules(2);
        let m = 300.0;
        let precursor = dimer.mz(m);
        let monomer_mz = h().mz(m);
        let params = MsmsParams::default();

        let r = row(1, precursor, Some(scan(precursor, &[(monomer_mz, 500.0), (150.0, 20.0)])));
        assert_eq!(check_multimer(&r, &dimer, &params).unwrap(), 1);
        assert_eq!(check_multimer(&r, &h(), &params).unwrap(), 0);

        let r = row(1, precursor, Some(scan(precursor, &[(150.0, 20.0)])));
        assert_eq!(check_multimer(&r, &dimer, &params).unwrap(), 0);

        let r = row(1, precursor, None);
        assert_eq!(check_multimer(&r, &dimer, &params).unwrap(), 0);

        let missing = MsmsParams {
            mass_list: "profile".into(),
            ..Default::default()
        };
        let r = row(1, precursor, Some(scan(precursor, &[(monomer_mz, 500.0)])));
        assert!(matches!(
            check_multimer(&r, &dimer, &missing),
            Err(MsmsError::MissingMassList { row: 1, .. })
        ));
    }

    #[test_log::test]
    fn test_neutral_loss() {
        let parent_type = IonType::undefined(1);
        let loss_type = IonType::new(
            IonParts::single(IonPart::undefined(1)),
            IonParts::single(IonPart::water_loss()),
            1,
        );
        let parent_mz = 301.0;
        let loss_mz = parent_mz + IonPart::water_loss().mass;

        let mut table = FeatureTable::new(
            vec!["a".into()],
            vec![
                row(1, parent_mz, Some(scan(parent_mz, &[(loss_mz, 100.0), (120.0, 10.0)]))),
                row(2, loss_mz, None),
            ],
        );
        let mut loss = crate::identity::IonIdentity::new(RowKey(1), loss_type.clone());
        loss.add_partner(RowKey(0), parent_type.clone());
        table[RowKey(1)].add_ion_identity(loss);

        let params = MsmsParams::default();
        assert_eq!(check_neutral_loss(&table, RowKey(1), &loss_type, None, &params), 1);
        assert_eq!(check_neutral_loss(&table, RowKey(1), &parent_type, None, &params), 0);

        let strict = MsmsParams {
            min_height: 1000.0,
            ..Default::default()
        };
        assert_eq!(check_neutral_loss(&table, RowKey(1), &loss_type, None, &strict), 0);

        // only a fragment pair carries the loss
        table[RowKey(0)].features[0].fragment_scan =
            Some(scan(parent_mz, &[(200.0, 50.0), (200.0 + IonPart::water_loss().mass, 40.0)]));
        assert_eq!(check_neutral_loss(&table, RowKey(1), &loss_type, None, &params), 0);
        let any = MsmsParams {
            neutral_loss_check: NeutralLossCheck::AnySignal,
            ..Default::default()
        };
        assert_eq!(check_neutral_loss(&table, RowKey(1), &loss_type, None, &any), 1);

        let sink = NoProgress;
        let progress = StageProgress::new(&sink, 0.0, 1.0, table.len());
        let summary = check_msms_evidence(&mut table, &[], &any, &progress);
        assert_eq!(summary.neutral_losses, 1);
        assert_eq!(table[RowKey(1)].ion(&loss_type).unwrap().neutral_loss_evidence, 1);
    }

    #[test_log::test]
    fn test_similarity() {
        let peaks = [(100.0, 10.0), (150.0, 50.0), (200.0, 100.0), (250.0, 30.0)];
        let a = row(1, 300.0, Some(scan(300.0, &peaks)));
        let b = row(2, 300.0, Some(scan(300.0, &peaks)));
        let params = Ms2SimilarityParams::default();
        let sim = CosineMs2Scorer.similarity(&b, &a, &params).unwrap().unwrap();
        assert_eq!((sim.row_a, sim.row_b), (1, 2));
        let spectral = sim.spectral.unwrap();
        assert_eq!(spectral.matched, 4);
        assert!((spectral.cosine - 1.0).abs() < 1e-9);
        assert!(sim.neutral_loss.is_some());

        let c = row(3, 300.0, Some(scan(300.0, &[(400.0, 1.0), (410.0, 2.0)])));
        assert_eq!(CosineMs2Scorer.similarity(&a, &c, &params).unwrap(), None);

        let d = row(4, 300.0, None);
        assert_eq!(CosineMs2Scorer.similarity(&a, &d, &params).unwrap(), None);

        let group = RowGroup::new(0, vec![RowKey(0), RowKey(1), RowKey(2)], vec![]);
        let table = FeatureTable::new(vec!["a".into()], vec![a, b, c]);
        let sink = NoProgress;
        let progress = StageProgress::new(&sink, 0.0, 1.0, 1);
        let found = group_ms2_similarity(&table, &[group], &CosineMs2Scorer, &params, &progress);
        assert_eq!(found.len(), 1);
    }
}
