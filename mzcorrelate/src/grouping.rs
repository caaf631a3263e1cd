/*! Connected components of the correlation graph */
use std::collections::{HashMap, HashSet, VecDeque};

use identity_hash::BuildIdentityHasher;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::correlation::R2RCorrelationData;
use crate::table::{FeatureTable, RowKey};

/// One accepted correlation between two rows
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CorrelationEdge {
    pub a: RowKey,
    pub b: RowKey,
    pub score: f64,
}

impl CorrelationEdge {
    pub fn new(a: RowKey, b: RowKey, score: f64) -> Self {
        if a <= b {
            Self { a, b, score }
        } else {
            Self { a: b, b: a, score }
        }
    }
}

impl From<&R2RCorrelationData> for CorrelationEdge {
    fn from(value: &R2RCorrelationData) -> Self {
        Self::new(value.key_a, value.key_b, value.score())
    }
}

/// A set of rows connected by correlation edges
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RowGroup {
    pub id: usize,
    /// Member rows, in key order
    pub rows: Vec<RowKey>,
    pub edges: Vec<CorrelationEdge>,
    pub mean_correlation: f64,
    pub min_correlation: f64,
    pub max_correlation: f64,
}

impl RowGroup {
    pub fn new(id: usize, mut rows: Vec<RowKey>, edges: Vec<CorrelationEdge>) -> Self {
        rows.sort();
        rows.dedup();
        let mut group = Self {
            id,
            rows,
            edges,
            mean_correlation: 0.0,
            min_correlation: 0.0,
            max_correlation: 0.0,
        };
        group.recalculate();
        group
    }

    /// Recompute the edge correlation statistics
    pub fn recalculate(&mut self) {
        let (mean, min, max) = edge_stats(&self.edges);
        self.mean_correlation = mean;
        self.min_correlation = min;
        self.max_correlation = max;
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contains(&self, key: &RowKey) -> bool {
        self.rows.binary_search(key).is_ok()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RowKey> {
        self.rows.iter()
    }
}

impl std::ops::Index<usize> for RowGroup {
    type Output = RowKey;

    fn index(&self, index: usize) -> &Self::Output {
        &self.rows[index]
    }
}

impl IntoIterator for RowGroup {
    type Item = RowKey;

    type IntoIter = <std::vec::Vec<RowKey> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

fn edge_stats(edges: &[CorrelationEdge]) -> (f64, f64, f64) {
    if edges.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut total = 0.0;
    for e in edges {
        min = min.min(e.score);
        max = max.max(e.score);
        total += e.score;
    }
    (total / edges.len() as f64, min, max)
}

type Adjacency = HashMap<RowKey, Vec<RowKey>, BuildIdentityHasher<RowKey>>;

struct BreadFirstTraversal<'a> {
    adjacency: &'a Adjacency,
    nodes: HashSet<RowKey, BuildIdentityHasher<RowKey>>,
    order: Vec<RowKey>,
}

impl<'a> Iterator for BreadFirstTraversal<'a> {
    type Item = Vec<RowKey>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_component()
    }
}

impl<'a> BreadFirstTraversal<'a> {
    fn new(adjacency: &'a Adjacency) -> Self {
        let nodes: HashSet<_, _> = adjacency.keys().copied().collect();
        let mut order: Vec<_> = nodes.iter().copied().collect();
        // Visit seeds in descending order so `pop` yields the lowest key first
        order.sort_by(|a, b| b.cmp(a));
        Self {
            adjacency,
            nodes,
            order,
        }
    }

    fn edges_from(&self, node: RowKey) -> impl Iterator<Item = RowKey> + '_ {
        self.adjacency
            .get(&node)
            .into_iter()
            .flatten()
            .filter(|k| self.nodes.contains(k))
            .copied()
    }

    fn visit(&mut self, node: RowKey) -> Vec<RowKey> {
        let mut component = Vec::new();
        let mut nodes = VecDeque::from(vec![node]);

        while let Some(node) = nodes.pop_front() {
            // Already visited nodes have been removed
            if !self.nodes.remove(&node) {
                continue;
            }
            component.push(node);
            let next: Vec<_> = self.edges_from(node).collect();
            nodes.extend(next);
        }
        component.sort();
        component
    }

    fn next_component(&mut self) -> Option<Vec<RowKey>> {
        while let Some(node) = self.order.pop() {
            if self.nodes.contains(&node) {
                return Some(self.visit(node));
            }
        }
        None
    }
}

/// Split a set of edges into connected components, each with the edges inside it
fn connected_components(edges: &[CorrelationEdge]) -> Vec<(Vec<RowKey>, Vec<CorrelationEdge>)> {
    let mut adjacency = Adjacency::default();
    for e in edges {
        adjacency.entry(e.a).or_default().push(e.b);
        adjacency.entry(e.b).or_default().push(e.a);
    }
    let components: Vec<Vec<RowKey>> = BreadFirstTraversal::new(&adjacency).collect();

    let mut membership: HashMap<RowKey, usize, BuildIdentityHasher<RowKey>> = HashMap::default();
    for (i, c) in components.iter().enumerate() {
        for k in c {
            membership.insert(*k, i);
        }
    }
    let mut component_edges: Vec<Vec<CorrelationEdge>> = vec![Vec::new(); components.len()];
    for e in edges {
        if let Some(i) = membership.get(&e.a) {
            component_edges[*i].push(*e);
        }
    }
    components.into_iter().zip(component_edges).collect()
}

/// Remove the weakest edge of a component until its mean edge correlation reaches
/// `min_correlation`, re-splitting whenever the component falls apart.
fn refine_component(
    rows: Vec<RowKey>,
    edges: Vec<CorrelationEdge>,
    min_correlation: f64,
) -> Vec<(Vec<RowKey>, Vec<CorrelationEdge>)> {
    let mut done = Vec::new();
    let mut pending = vec![(rows, edges)];
    while let Some((rows, mut edges)) = pending.pop() {
        if edges.is_empty() {
            continue;
        }
        let (mean, _, _) = edge_stats(&edges);
        if mean >= min_correlation {
            done.push((rows, edges));
            continue;
        }
        let weakest = edges
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.score
                    .total_cmp(&b.score)
                    .then_with(|| (a.a, a.b).cmp(&(b.a, b.b)))
            })
            .map(|(i, _)| i);
        if let Some(i) = weakest {
            let removed = edges.remove(i);
            debug!(
                "Removing weak edge {}-{} ({:.3}) from a group with mean correlation {:.3}",
                removed.a.0, removed.b.0, removed.score, mean
            );
        }
        pending.extend(connected_components(&edges));
    }
    done
}

/// Parameters for grouping rows on their correlation edges
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GroupingParams {
    /// The mean edge correlation every group must reach, weaker groups are split
    pub min_group_correlation: f64,
}

impl Default for GroupingParams {
    fn default() -> Self {
        Self {
            min_group_correlation: 0.0,
        }
    }
}

/// Build row groups from accepted correlation edges.
///
/// Groups are ordered by their lowest row key and numbered densely.
pub fn group_rows(edges: &[CorrelationEdge], params: &GroupingParams) -> Vec<RowGroup> {
    let components = connected_components(edges);
    debug!("Found {} connected components", components.len());
    let mut parts: Vec<(Vec<RowKey>, Vec<CorrelationEdge>)> = components
        .into_par_iter()
        .flat_map_iter(|(rows, edges)| refine_component(rows, edges, params.min_group_correlation))
        .collect();
    parts.sort_by(|a, b| a.0.first().cmp(&b.0.first()));
    parts
        .into_iter()
        .enumerate()
        .map(|(i, (rows, edges))| RowGroup::new(i, rows, edges))
        .collect()
}

/// Record each row's group on the table, clearing stale assignments first
pub fn assign_groups(table: &mut FeatureTable, groups: &[RowGroup]) {
    for row in table.rows.iter_mut() {
        row.group = None;
    }
    for group in groups {
        for key in group.iter() {
            if let Some(row) = table.get_mut(*key) {
                row.group = Some(group.id);
            }
        }
    }
    let grouped: usize = groups.iter().map(|g| g.len()).sum();
    info!(
        "Corr: Created {} groups holding {} of {} rows",
        groups.len(),
        grouped,
        table.len()
    );
}

#[cfg(test)]
mod test {
    use super::*;

    fn edge(a: usize, b: usize, score: f64) -> CorrelationEdge {
        CorrelationEdge::new(RowKey(a), RowKey(b), score)
    }

    #[test_log::test]
    fn test_chain_grouping() {
        // A-B and B-C accepted, A-C rejected and absent
        let edges = vec![edge(0, 1, 0.95), edge(2, 1, 0.9)];
        let groups = group_rows(&edges, &GroupingParams::default());
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.rows, vec![RowKey(0), RowKey(1), RowKey(2)]);
        assert_eq!(group.edge_count(), 2);
        assert!((group.mean_correlation - 0.925).abs() < 1e-12);
        assert_eq!(group.min_correlation, 0.9);
        assert_eq!(group.max_correlation, 0.95);
    }

    #[test_log::test]
    fn test_components() {
        let edges = vec![edge(5, 6, 0.9), edge(0, 1, 0.9), edge(1, 3, 0.9)];
        let groups = group_rows(&edges, &GroupingParams::default());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].id, 0);
        assert_eq!(groups[0].rows, vec![RowKey(0), RowKey(1), RowKey(3)]);
        assert_eq!(groups[1].rows, vec![RowKey(5), RowKey(6)]);
        assert!(!groups[1].contains(&RowKey(2)));
    }

    #[test_log::test]
    fn test_bridge_pruning() {
        // Two tight triangles joined by a weak bridge
        let edges = vec![
            edge(0, 1, 0.95),
            edge(1, 2, 0.95),
            edge(0, 2, 0.95),
            edge(2, 3, -0.9),
            edge(3, 4, 0.95),
            edge(4, 5, 0.95),
            edge(3, 5, 0.95),
        ];
        let params = GroupingParams {
            min_group_correlation: 0.9,
        };
        let groups = group_rows(&edges, &params);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].rows, vec![RowKey(0), RowKey(1), RowKey(2)]);
        assert_eq!(groups[1].rows, vec![RowKey(3), RowKey(4), RowKey(5)]);
        assert!(groups.iter().all(|g| g.mean_correlation >= 0.9));

        let unpruned = group_rows(&edges, &GroupingParams::default());
        assert_eq!(unpruned.len(), 1);
    }

    #[test]
    fn test_assign() {
        use crate::table::Row;
        let mut table = FeatureTable::new(
            vec![],
            (0..4).map(|i| Row::new(i, 100.0, 1.0, 0, vec![])).collect(),
        );
        let groups = group_rows(&[edge(1, 2, 0.9)], &GroupingParams::default());
        assign_groups(&mut table, &groups);
        assert_eq!(table[RowKey(1)].group, Some(0));
        assert_eq!(table[RowKey(2)].group, Some(0));
        assert_eq!(table[RowKey(0)].group, None);
    }
}
