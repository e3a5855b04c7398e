#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use trackgraph_domain::{canonical_slug, ensure_non_empty, NodeId, NodeKind, Position};

/// Grid spacing for both axes. Cosmetic; display-only.
pub const GRID_SPACING: i64 = 300;

/// A graph declared up front, as produced by the external config parser
/// (AI-assisted or hand-written YAML). Observed execution order never goes
/// through this type; it only seeds nodes and edges before a run.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DeclaredGraph {
    pub agent_name: String,
    pub nodes: Vec<DeclaredNode>,
    #[serde(default)]
    pub edges: Vec<DeclaredEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DeclaredNode {
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub tool_type: Option<String>,
    #[serde(default)]
    pub model: Option<DeclaredModel>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DeclaredModel {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub problem_type: Option<String>,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(deny_unknown_fields)]
pub struct DeclaredEdge {
    pub from: String,
    pub to: String,
    #[serde(default = "default_port")]
    pub input: String,
    #[serde(default = "default_port")]
    pub output: String,
}

fn default_port() -> String {
    "main".to_string()
}

/// Load a declared graph from a YAML file and normalize it.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, validated, or
/// normalized.
pub fn load_declared_graph_from_path(path: &Path) -> Result<DeclaredGraph> {
    let content = fs::read_to_string(path)?;
    normalize_declared_graph_yaml(&content)
}

/// Parse declared-graph YAML into canonical form: slugs in lower-camel,
/// edges rewritten to slugs and deduplicated, topology validated acyclic.
///
/// # Errors
/// Returns an error when parsing or validation fails.
pub fn normalize_declared_graph_yaml(yaml: &str) -> Result<DeclaredGraph> {
    let graph: DeclaredGraph = serde_yaml::from_str(yaml)
        .map_err(|err| anyhow!("invalid declared graph YAML structure: {err}"))?;
    normalize_declared_graph(graph)
}

/// Normalize and validate a declared graph received as structured data.
///
/// # Errors
/// Returns an error for empty names, slug collisions after normalization,
/// edges referencing unknown nodes, or a dependency cycle.
pub fn normalize_declared_graph(mut graph: DeclaredGraph) -> Result<DeclaredGraph> {
    ensure_non_empty("agent_name", &graph.agent_name)?;
    if graph.nodes.is_empty() {
        return Err(anyhow!("declared graph has no nodes"));
    }

    let mut slugs = BTreeSet::new();
    for node in &mut graph.nodes {
        ensure_non_empty("node name", &node.name)?;
        node.slug = canonical_slug(&node.name);
        if !slugs.insert(node.slug.clone()) {
            return Err(anyhow!(
                "node name {} collides with another node after slug normalization ({})",
                node.name,
                node.slug
            ));
        }
        if matches!(node.kind, NodeKind::Tool) && node.model.is_some() {
            return Err(anyhow!("tool node {} must not carry a model", node.name));
        }
    }

    for edge in &mut graph.edges {
        edge.from = resolve_endpoint(&slugs, &edge.from)
            .ok_or_else(|| anyhow!("edge references unknown node: {}", edge.from))?;
        edge.to = resolve_endpoint(&slugs, &edge.to)
            .ok_or_else(|| anyhow!("edge references unknown node: {}", edge.to))?;
        if edge.from == edge.to {
            return Err(anyhow!("edge from {} to itself is not allowed", edge.from));
        }
    }
    graph.edges.sort();
    graph.edges.dedup_by(|lhs, rhs| lhs.from == rhs.from && lhs.to == rhs.to);

    detect_cycle(&graph)?;

    Ok(graph)
}

fn resolve_endpoint(slugs: &BTreeSet<String>, reference: &str) -> Option<String> {
    trackgraph_domain::normalize_forms(reference)
        .candidates()
        .into_iter()
        .find(|candidate| slugs.contains(candidate))
}

fn detect_cycle(graph: &DeclaredGraph) -> Result<()> {
    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = graph
        .nodes
        .iter()
        .map(|node| (node.slug.as_str(), BTreeSet::new()))
        .collect();
    for edge in &graph.edges {
        if let Some(deps) = remaining.get_mut(edge.to.as_str()) {
            deps.insert(edge.from.as_str());
        }
    }

    loop {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(key, _)| *key)
            .collect();
        if ready.is_empty() {
            break;
        }

        for key in ready {
            remaining.remove(key);
            for deps in remaining.values_mut() {
                deps.remove(key);
            }
        }
    }

    if remaining.is_empty() {
        return Ok(());
    }

    let mut keys: Vec<&str> = remaining.keys().copied().collect();
    keys.sort_unstable();
    Err(anyhow!(
        "declared graph contains a cycle among nodes: {}",
        keys.join(", ")
    ))
}

/// Assign a grid position to every node by topological layering (Kahn's
/// algorithm). Zero-in-degree nodes form layer 0; each wave of newly freed
/// nodes forms the next layer. Within a wave, nodes keep discovery order,
/// so the function is deterministic and idempotent for a fixed topology.
///
/// # Errors
/// Returns an error when an edge references a node outside `node_ids` or
/// when a cycle prevents some nodes from ever reaching in-degree zero.
pub fn layer_nodes(
    node_ids: &[NodeId],
    edges: &[(NodeId, NodeId)],
) -> Result<Vec<(NodeId, Position)>> {
    let index_of: BTreeMap<NodeId, usize> = node_ids
        .iter()
        .enumerate()
        .map(|(idx, id)| (*id, idx))
        .collect();

    let mut in_degree = vec![0_usize; node_ids.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); node_ids.len()];
    for (from, to) in edges {
        let from_idx = *index_of
            .get(from)
            .ok_or_else(|| anyhow!("edge references unknown node {from}"))?;
        let to_idx = *index_of
            .get(to)
            .ok_or_else(|| anyhow!("edge references unknown node {to}"))?;
        successors[from_idx].push(to_idx);
        in_degree[to_idx] += 1;
    }

    let mut wave: Vec<usize> = (0..node_ids.len())
        .filter(|idx| in_degree[*idx] == 0)
        .collect();

    let mut placed = Vec::with_capacity(node_ids.len());
    let mut layer: i64 = 0;
    while !wave.is_empty() {
        let mut next_wave = Vec::new();
        for (column, idx) in wave.iter().enumerate() {
            let column = i64::try_from(column).map_err(|_| anyhow!("layer width overflow"))?;
            placed.push((
                node_ids[*idx],
                Position {
                    x: column * GRID_SPACING,
                    y: layer * GRID_SPACING,
                },
            ));
            for succ in &successors[*idx] {
                in_degree[*succ] -= 1;
                if in_degree[*succ] == 0 {
                    next_wave.push(*succ);
                }
            }
        }
        wave = next_wave;
        layer += 1;
    }

    if placed.len() < node_ids.len() {
        let mut stuck: Vec<String> = (0..node_ids.len())
            .filter(|idx| in_degree[*idx] > 0)
            .map(|idx| node_ids[idx].to_string())
            .collect();
        stuck.sort_unstable();
        return Err(anyhow!(
            "cycle prevents layering of nodes: {}",
            stuck.join(", ")
        ));
    }

    Ok(placed)
}

#[cfg(test)]
mod tests {
    use super::{layer_nodes, normalize_declared_graph_yaml, GRID_SPACING};
    use trackgraph_domain::NodeId;

    fn ids(count: usize) -> Vec<NodeId> {
        (0..count).map(|_| NodeId::new()).collect()
    }

    #[test]
    fn roots_land_on_layer_zero_and_waves_descend() {
        let nodes = ids(4);
        // a -> c, b -> c, c -> d
        let edges = vec![
            (nodes[0], nodes[2]),
            (nodes[1], nodes[2]),
            (nodes[2], nodes[3]),
        ];
        let placed = layer_nodes(&nodes, &edges);
        assert!(placed.is_ok());
        let placed = placed.unwrap_or_else(|_| unreachable!());
        assert_eq!(placed.len(), 4);

        assert_eq!(placed[0].0, nodes[0]);
        assert_eq!(placed[0].1.x, 0);
        assert_eq!(placed[0].1.y, 0);
        assert_eq!(placed[1].0, nodes[1]);
        assert_eq!(placed[1].1.x, GRID_SPACING);
        assert_eq!(placed[1].1.y, 0);
        assert_eq!(placed[2].0, nodes[2]);
        assert_eq!(placed[2].1.y, GRID_SPACING);
        assert_eq!(placed[3].0, nodes[3]);
        assert_eq!(placed[3].1.y, 2 * GRID_SPACING);
    }

    #[test]
    fn layering_is_deterministic() {
        let nodes = ids(5);
        let edges = vec![
            (nodes[0], nodes[1]),
            (nodes[0], nodes[2]),
            (nodes[1], nodes[3]),
            (nodes[2], nodes[3]),
            (nodes[3], nodes[4]),
        ];
        let first = layer_nodes(&nodes, &edges);
        let second = layer_nodes(&nodes, &edges);
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(
            first.unwrap_or_else(|_| unreachable!()),
            second.unwrap_or_else(|_| unreachable!())
        );
    }

    #[test]
    fn isolated_nodes_all_share_layer_zero() {
        let nodes = ids(3);
        let placed = layer_nodes(&nodes, &[]);
        assert!(placed.is_ok());
        let placed = placed.unwrap_or_else(|_| unreachable!());
        assert!(placed.iter().all(|(_, position)| position.y == 0));
    }

    #[test]
    fn cycle_is_a_layering_error() {
        let nodes = ids(3);
        let edges = vec![
            (nodes[0], nodes[1]),
            (nodes[1], nodes[2]),
            (nodes[2], nodes[1]),
        ];
        let placed = layer_nodes(&nodes, &edges);
        assert!(placed.is_err());
        let message = placed
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(message.contains("cycle"));
    }

    #[test]
    fn unknown_edge_endpoint_is_an_error() {
        let nodes = ids(2);
        let stranger = NodeId::new();
        assert!(layer_nodes(&nodes, &[(nodes[0], stranger)]).is_err());
    }

    #[test]
    fn declared_yaml_normalizes_slugs_and_edge_references() {
        let yaml = r#"
agent_name: Support Bot
nodes:
  - name: Classify Intent
    kind: model
    model:
      provider: openai
  - name: Send Reply
    kind: tool
    tool_type: http
edges:
  - from: classify_intent
    to: SendReply
"#;
        let graph = normalize_declared_graph_yaml(yaml);
        assert!(graph.is_ok());
        let graph = graph.unwrap_or_else(|_| unreachable!());
        assert_eq!(graph.nodes[0].slug, "classifyIntent");
        assert_eq!(graph.nodes[1].slug, "sendReply");
        assert_eq!(graph.edges[0].from, "classifyIntent");
        assert_eq!(graph.edges[0].to, "sendReply");
        assert_eq!(graph.edges[0].input, "main");
    }

    #[test]
    fn declared_yaml_rejects_slug_collision_and_cycles() {
        let collision = r"
agent_name: a
nodes:
  - name: Send Email
    kind: tool
  - name: sendEmail
    kind: tool
";
        assert!(normalize_declared_graph_yaml(collision).is_err());

        let cyclic = r"
agent_name: a
nodes:
  - name: one
    kind: tool
  - name: two
    kind: tool
edges:
  - from: one
    to: two
  - from: two
    to: one
";
        let result = normalize_declared_graph_yaml(cyclic);
        assert!(result.is_err());
        let message = result
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(message.contains("cycle"));
    }

    #[test]
    fn declared_yaml_rejects_unknown_edge_endpoint_and_self_edge() {
        let unknown = r"
agent_name: a
nodes:
  - name: one
    kind: tool
edges:
  - from: one
    to: ghost
";
        assert!(normalize_declared_graph_yaml(unknown).is_err());

        let self_edge = r"
agent_name: a
nodes:
  - name: one
    kind: tool
edges:
  - from: one
    to: one
";
        assert!(normalize_declared_graph_yaml(self_edge).is_err());
    }

    #[test]
    fn declared_yaml_deduplicates_repeated_edges() {
        let yaml = r"
agent_name: a
nodes:
  - name: one
    kind: tool
  - name: two
    kind: tool
edges:
  - from: one
    to: two
  - from: one
    to: two
";
        let graph = normalize_declared_graph_yaml(yaml);
        assert!(graph.is_ok());
        assert_eq!(graph.unwrap_or_else(|_| unreachable!()).edges.len(), 1);
    }
}
