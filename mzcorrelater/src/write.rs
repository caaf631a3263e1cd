use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use mzcorrelate::{
    grouping::RowGroup,
    identity::IonIdentity,
    msms::{Ms2Similarity, MsmsSummary},
    network::{IonNetwork, NetworkStats},
    FeatureTable, MetaCorrelateResult,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: usize,
    /// Member row ids
    pub rows: Vec<u32>,
    pub mean_correlation: f64,
    pub min_correlation: f64,
    pub max_correlation: f64,
}

impl GroupRecord {
    fn new(group: &RowGroup, table: &FeatureTable) -> Self {
        Self {
            id: group.id,
            rows: group.rows.iter().map(|k| table[*k].id).collect(),
            mean_correlation: group.mean_correlation,
            min_correlation: group.min_correlation,
            max_correlation: group.max_correlation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub row: u32,
    pub ion: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub id: usize,
    pub stats: Option<NetworkStats>,
    pub members: Vec<MemberRecord>,
    pub relations: Vec<String>,
    pub formula_score: Option<f64>,
}

impl NetworkRecord {
    fn new(network: &IonNetwork, result: &MetaCorrelateResult) -> Self {
        let members = network
            .iter()
            .map(|(key, ion_type)| MemberRecord {
                row: result.table[*key].id,
                ion: ion_type.to_string(),
            })
            .collect();
        let relations = network
            .relations()
            .map(|rel| rel.name_for(network.key))
            .collect();
        let formula_score = result
            .formula_scores
            .iter()
            .find(|(k, _)| *k == network.key)
            .map(|(_, s)| *s);
        Self {
            id: network.key.0,
            stats: network.stats().copied(),
            members,
            relations,
            formula_score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub ion: String,
    pub network: Option<usize>,
    /// Partner row ids
    pub partners: Vec<u32>,
    pub multimer_evidence: u32,
    pub neutral_loss_evidence: u32,
}

impl IdentityRecord {
    fn new(ion: &IonIdentity, table: &FeatureTable) -> Self {
        Self {
            ion: ion.ion_type.to_string(),
            network: ion.network.map(|k| k.0),
            partners: ion.partners.keys().map(|k| table[*k].id).collect(),
            multimer_evidence: ion.multimer_evidence,
            neutral_loss_evidence: ion.neutral_loss_evidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowRecord {
    pub id: u32,
    pub mz: f64,
    pub rt: f64,
    pub group: Option<usize>,
    /// Ranked best first
    pub ions: Vec<IdentityRecord>,
}

/// The serialized form of a [`MetaCorrelateResult`], with rows referred to by id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultDocument {
    pub cancelled: bool,
    pub sample_names: Vec<String>,
    pub groups: Vec<GroupRecord>,
    pub networks: Vec<NetworkRecord>,
    pub rows: Vec<RowRecord>,
    pub ms2_similarities: Vec<Ms2Similarity>,
    pub msms_summary: MsmsSummary,
}

impl From<&MetaCorrelateResult> for ResultDocument {
    fn from(result: &MetaCorrelateResult) -> Self {
        let table = &result.table;
        let rows = table
            .rows
            .iter()
            .map(|row| RowRecord {
                id: row.id,
                mz: row.mz,
                rt: row.rt,
                group: row.group,
                ions: row
                    .ions
                    .iter()
                    .map(|ion| IdentityRecord::new(ion, table))
                    .collect(),
            })
            .collect();
        Self {
            cancelled: result.cancelled,
            sample_names: table.sample_names.clone(),
            groups: result
                .groups
                .iter()
                .map(|g| GroupRecord::new(g, table))
                .collect(),
            networks: result
                .networks
                .iter()
                .map(|n| NetworkRecord::new(n, result))
                .collect(),
            rows,
            ms2_similarities: result.ms2_similarities.clone(),
            msms_summary: result.msms_summary,
        }
    }
}

pub(crate) fn write_document<W: Write>(
    document: &ResultDocument,
    mut writer: W,
) -> io::Result<()> {
    serde_json::to_writer_pretty(&mut writer, document)?;
    writeln!(writer)?;
    writer.flush()
}

/// Write `result` as JSON to `path`, or to STDOUT if `path` is `-`
pub(crate) fn write_output(result: &MetaCorrelateResult, path: &Path) -> io::Result<()> {
    let document = ResultDocument::from(result);
    debug!(
        "Writing {} groups, {} networks and {} rows",
        document.groups.len(),
        document.networks.len(),
        document.rows.len()
    );
    if path == Path::new("-") {
        write_document(&document, io::BufWriter::new(io::stdout().lock()))
    } else {
        let handle = io::BufWriter::new(fs::File::create(path)?);
        write_document(&document, handle)?;
        info!("Wrote results to {}", path.display());
        Ok(())
    }
}
