#![forbid(unsafe_code)]

//! Correlation engine: resolves inbound tracking events to agents, nodes
//! and executions, grows the observed graph, and finalizes runs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use trackgraph_domain::{
    canonical_slug, normalize_forms, now_utc, Agent, AgentConnection, AgentId, AgentNode,
    ConnectionId, ErrorDetails, Execution, ExecutionId, ExecutionStatus, ExecutionSummary,
    ModelId, ModelRecord, NodeExecutionRecord, NodeId, NodeKind, RecordId, RecordStatus,
    RecordSubject, TenantContext, TrackError,
};
use trackgraph_graph::{layer_nodes, normalize_declared_graph, DeclaredGraph, DeclaredModel};
use trackgraph_store_core::{InsertOutcome, TrackingStore};

pub const DEFAULT_MODEL_PROVIDER: &str = "openai";
pub const DEFAULT_PROBLEM_TYPE: &str = "text_generation";
pub const DEFAULT_TOOL_TYPE: &str = "http";
pub const DEFAULT_PORT: &str = "main";

/// Explicit run start. Creates the agent if the slug is unknown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartExecutionRequest {
    pub agent_name: String,
    #[serde(default)]
    pub agent_description: Option<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub external_correlation_id: Option<String>,
}

/// How an inbound event names its execution. Fields are tried in order:
/// explicit id, then external correlation id, then the agent's newest
/// still-processing run (heuristic, flagged on the response).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionSelector {
    #[serde(default)]
    pub execution_id: Option<ExecutionId>,
    #[serde(default)]
    pub external_correlation_id: Option<String>,
    #[serde(default)]
    pub agent_name: Option<String>,
}

/// One observed step. `node_id` is the instrumentation-side identifier
/// (any casing), `node_name` the display name; at least one is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackItem {
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_name: Option<String>,
    pub kind: NodeKind,
    #[serde(default)]
    pub tool_type: Option<String>,
    #[serde(default)]
    pub model: Option<DeclaredModel>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_record_status")]
    pub status: RecordStatus,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub input_name: Option<String>,
    #[serde(default)]
    pub output_name: Option<String>,
}

fn default_record_status() -> RecordStatus {
    RecordStatus::Success
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackResponse {
    pub execution_id: ExecutionId,
    /// True when the execution was attached via the latest-processing
    /// heuristic rather than named explicitly.
    pub execution_inferred: bool,
    pub node_id: NodeId,
    pub node_created: bool,
    pub record_id: RecordId,
    pub record_seq: i64,
    pub linked_from: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchTrackRequest {
    #[serde(flatten)]
    pub selector: ExecutionSelector,
    pub items: Vec<TrackItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum BatchItemOutcome {
    Tracked {
        node_id: NodeId,
        record_id: RecordId,
        record_seq: i64,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub identifier: String,
    #[serde(flatten)]
    pub outcome: BatchItemOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchTrackResponse {
    pub execution_id: ExecutionId,
    pub execution_inferred: bool,
    pub items: Vec<BatchItemResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSummary {
    pub agent_id: AgentId,
    pub agent_created: bool,
    pub nodes_created: usize,
    pub edges_created: usize,
}

struct TrackedItem {
    node: AgentNode,
    node_created: bool,
    record_id: RecordId,
    record_seq: i64,
    linked_from: Option<NodeId>,
}

/// Stateless facade over a [`TrackingStore`]. Every operation reads what it
/// needs, decides, writes; no in-memory graph survives between calls, so
/// any number of engines may share one store.
pub struct TrackingEngine<'a> {
    store: &'a dyn TrackingStore,
}

impl<'a> TrackingEngine<'a> {
    #[must_use]
    pub fn new(store: &'a dyn TrackingStore) -> Self {
        Self { store }
    }

    /// Start a run explicitly. The agent is created on first sight.
    ///
    /// # Errors
    /// Returns [`TrackError::InvalidInput`] on an empty agent name and
    /// [`TrackError::Store`] on persistence failures.
    pub fn start_execution(
        &self,
        ctx: &TenantContext,
        request: &StartExecutionRequest,
    ) -> Result<Execution, TrackError> {
        let agent = self.resolve_agent(
            ctx,
            &request.agent_name,
            request.agent_description.as_deref(),
        )?;
        self.create_execution(
            &agent,
            request.input.clone(),
            request.external_correlation_id.clone(),
        )
    }

    /// Ingest one observed step: resolve the execution and node (creating
    /// either on demand), link the node to the previous tip, and append the
    /// record.
    ///
    /// # Errors
    /// Returns [`TrackError::InvalidInput`] when the event names neither an
    /// execution nor an agent, or the item names no node;
    /// [`TrackError::AmbiguousModelBinding`] when the previous tip cannot be
    /// resolved to a single node.
    pub fn track_event(
        &self,
        ctx: &TenantContext,
        selector: &ExecutionSelector,
        item: &TrackItem,
    ) -> Result<TrackResponse, TrackError> {
        // Reject a malformed item before execution resolution, which may
        // create an agent or a run as a side effect.
        Self::item_identifier(item)?;
        let (execution, inferred) = self.resolve_execution(ctx, selector)?;
        let tracked = self.track_one(&execution, item)?;
        Ok(TrackResponse {
            execution_id: execution.execution_id,
            execution_inferred: inferred,
            node_id: tracked.node.node_id,
            node_created: tracked.node_created,
            record_id: tracked.record_id,
            record_seq: tracked.record_seq,
            linked_from: tracked.linked_from,
        })
    }

    /// Ingest a batch of steps against one execution, strictly in order.
    /// The execution is resolved once; a failing item is captured in its
    /// result slot and does not stop later items.
    ///
    /// # Errors
    /// Fails only when the execution itself cannot be resolved.
    pub fn track_batch(
        &self,
        ctx: &TenantContext,
        request: &BatchTrackRequest,
    ) -> Result<BatchTrackResponse, TrackError> {
        let (execution, inferred) = self.resolve_execution(ctx, &request.selector)?;
        let mut items = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let identifier = item
                .node_id
                .clone()
                .or_else(|| item.node_name.clone())
                .unwrap_or_default();
            let outcome = match self.track_one(&execution, item) {
                Ok(tracked) => BatchItemOutcome::Tracked {
                    node_id: tracked.node.node_id,
                    record_id: tracked.record_id,
                    record_seq: tracked.record_seq,
                },
                Err(err) => BatchItemOutcome::Failed {
                    error: err.to_string(),
                },
            };
            items.push(BatchItemResult {
                identifier,
                outcome,
            });
        }
        Ok(BatchTrackResponse {
            execution_id: execution.execution_id,
            execution_inferred: inferred,
            items,
        })
    }

    /// Finalize a run: classify its terminal status from the record
    /// streams, derive the final output, compute the duration, and persist.
    ///
    /// # Errors
    /// Returns [`TrackError::ExecutionAlreadyEnded`] when the run is
    /// already terminal; finalization is not idempotent by design, so a
    /// duplicate end is surfaced as a conflict instead of absorbed.
    pub fn end_execution(
        &self,
        ctx: &TenantContext,
        selector: &ExecutionSelector,
        error: Option<ErrorDetails>,
    ) -> Result<ExecutionSummary, TrackError> {
        let execution = self.resolve_existing_execution(ctx, selector)?;
        if execution.status.is_terminal() {
            return Err(TrackError::ExecutionAlreadyEnded {
                execution_id: execution.execution_id,
                status: execution.status.as_str(),
            });
        }

        let nodes = self.store.list_nodes(execution.agent_id)?;
        let node_ids: Vec<NodeId> = nodes.iter().map(|node| node.node_id).collect();
        let model_ids: Vec<ModelId> = nodes.iter().filter_map(|node| node.model_id).collect();

        // Only records attributable to the agent's live graph participate
        // in classification and output derivation.
        let records: Vec<_> = self
            .store
            .list_records(execution.execution_id)?
            .into_iter()
            .filter(|row| match row.record.subject {
                RecordSubject::Node { node_id } => node_ids.contains(&node_id),
                RecordSubject::Model { model_id } => model_ids.contains(&model_id),
            })
            .collect();

        let node_failed = records.iter().any(|row| {
            matches!(row.record.subject, RecordSubject::Node { .. })
                && row.record.status.is_failure()
        });
        let model_failed = records.iter().any(|row| {
            matches!(row.record.subject, RecordSubject::Model { .. })
                && row.record.status.is_failure()
        });

        let status = if error.is_some() || node_failed {
            ExecutionStatus::Failed
        } else if model_failed {
            ExecutionStatus::FailedModel
        } else {
            ExecutionStatus::Success
        };

        let output = records.last().map(|row| row.record.output.clone());
        let ended_at = now_utc();
        let started = execution.started_at.unwrap_or(execution.created_at);
        let duration_ms =
            i64::try_from((ended_at - started).whole_milliseconds()).unwrap_or(i64::MAX);

        self.store.update_execution_finished(
            execution.execution_id,
            status,
            output.as_ref(),
            Some(duration_ms),
            error.as_ref(),
            ended_at,
        )?;

        Ok(ExecutionSummary {
            execution_id: execution.execution_id,
            status,
            output,
            duration_ms: Some(duration_ms),
        })
    }

    /// Seed an agent's graph from a declared (config-side) description.
    /// Idempotent: nodes and edges already present are left untouched.
    ///
    /// # Errors
    /// Returns [`TrackError::InvalidInput`] when the declaration fails
    /// validation (empty names, slug collisions, unknown edge endpoints, a
    /// cycle).
    pub fn ingest_declared_graph(
        &self,
        ctx: &TenantContext,
        graph: DeclaredGraph,
    ) -> Result<IngestSummary, TrackError> {
        let graph = normalize_declared_graph(graph)
            .map_err(|err| TrackError::InvalidInput(err.to_string()))?;

        let known = self
            .store
            .find_agent_by_slug(&ctx.tenant_id, &[canonical_slug(&graph.agent_name)])?;
        let agent_created = known.is_none();
        let agent = match known {
            Some(agent) => agent,
            None => self.resolve_agent(ctx, &graph.agent_name, None)?,
        };

        let mut nodes_created = 0_usize;
        let mut id_by_slug = std::collections::BTreeMap::new();
        for declared in &graph.nodes {
            let existing = self
                .store
                .find_node_by_slug(agent.agent_id, &[declared.slug.clone()])?;
            let node = match existing {
                Some(node) => node,
                None => {
                    let (node, created) = self.create_node(
                        agent.agent_id,
                        declared.name.clone(),
                        declared.slug.clone(),
                        declared.kind,
                        declared.tool_type.clone(),
                        declared.model.clone(),
                        declared.description.clone(),
                        declared.config.clone(),
                    )?;
                    if created {
                        nodes_created += 1;
                    }
                    node
                }
            };
            id_by_slug.insert(declared.slug.clone(), node.node_id);
        }

        let mut edges_created = 0_usize;
        for edge in &graph.edges {
            let (Some(from), Some(to)) = (id_by_slug.get(&edge.from), id_by_slug.get(&edge.to))
            else {
                // Unreachable after normalization; kept as a guard.
                continue;
            };
            if self.link_if_absent(agent.agent_id, *from, *to, &edge.input, &edge.output)? {
                edges_created += 1;
            }
        }

        self.relayout(agent.agent_id)?;

        Ok(IngestSummary {
            agent_id: agent.agent_id,
            agent_created,
            nodes_created,
            edges_created,
        })
    }

    fn resolve_agent(
        &self,
        ctx: &TenantContext,
        name: &str,
        description: Option<&str>,
    ) -> Result<Agent, TrackError> {
        let forms = normalize_forms(name);
        if forms.literal.is_empty() {
            return Err(TrackError::InvalidInput(
                "agent name MUST be non-empty".to_string(),
            ));
        }
        if let Some(agent) = self
            .store
            .find_agent_by_slug(&ctx.tenant_id, &forms.candidates())?
        {
            return Ok(agent);
        }
        let agent = Agent {
            agent_id: AgentId::new(),
            tenant_id: ctx.tenant_id.clone(),
            name: forms.literal.clone(),
            slug: forms.lower_camel,
            description: description.map(ToString::to_string),
            created_at: now_utc(),
        };
        // A concurrent creator may win the slug; either way the caller gets
        // the surviving row.
        Ok(self.store.insert_agent(&agent)?.into_inner())
    }

    fn create_execution(
        &self,
        agent: &Agent,
        input: Value,
        external_correlation_id: Option<String>,
    ) -> Result<Execution, TrackError> {
        let now = now_utc();
        let execution = Execution {
            execution_id: ExecutionId::new(),
            agent_id: agent.agent_id,
            status: ExecutionStatus::Processing,
            input,
            output: None,
            duration_ms: None,
            error_details: None,
            external_correlation_id,
            started_at: Some(now),
            ended_at: None,
            created_at: now,
        };
        self.store.insert_execution(&execution)?;
        Ok(execution)
    }

    /// Three-stage execution resolution. The boolean is true only for the
    /// heuristic third stage (latest processing run of the agent), where
    /// misattribution is possible.
    fn resolve_execution(
        &self,
        ctx: &TenantContext,
        selector: &ExecutionSelector,
    ) -> Result<(Execution, bool), TrackError> {
        if let Some(execution_id) = selector.execution_id {
            let execution = self
                .store
                .get_execution(execution_id)?
                .ok_or_else(|| TrackError::ExecutionNotFound(execution_id.to_string()))?;
            return Ok((execution, false));
        }

        if let Some(correlation_id) = selector.external_correlation_id.as_deref() {
            if let Some(execution) = self
                .store
                .find_execution_by_correlation_id(&ctx.tenant_id, correlation_id)?
            {
                return Ok((execution, false));
            }
            // Unknown correlation id: the run starts implicitly with this
            // event, carrying the id for later lookups.
            if let Some(agent_name) = selector.agent_name.as_deref() {
                let agent = self.resolve_agent(ctx, agent_name, None)?;
                let execution = self.create_execution(
                    &agent,
                    Value::Null,
                    Some(correlation_id.to_string()),
                )?;
                return Ok((execution, false));
            }
            return Err(TrackError::ExecutionNotFound(correlation_id.to_string()));
        }

        if let Some(agent_name) = selector.agent_name.as_deref() {
            let agent = self.resolve_agent(ctx, agent_name, None)?;
            if let Some(execution) = self
                .store
                .find_latest_processing_execution(agent.agent_id)?
            {
                return Ok((execution, true));
            }
            let execution = self.create_execution(&agent, Value::Null, None)?;
            return Ok((execution, false));
        }

        Err(TrackError::InvalidInput(
            "event names neither an execution nor an agent".to_string(),
        ))
    }

    /// Like [`Self::resolve_execution`] but never creates; used by
    /// finalization, where an implicit run would be meaningless.
    fn resolve_existing_execution(
        &self,
        ctx: &TenantContext,
        selector: &ExecutionSelector,
    ) -> Result<Execution, TrackError> {
        if let Some(execution_id) = selector.execution_id {
            return self
                .store
                .get_execution(execution_id)?
                .ok_or_else(|| TrackError::ExecutionNotFound(execution_id.to_string()));
        }
        if let Some(correlation_id) = selector.external_correlation_id.as_deref() {
            return self
                .store
                .find_execution_by_correlation_id(&ctx.tenant_id, correlation_id)?
                .ok_or_else(|| TrackError::ExecutionNotFound(correlation_id.to_string()));
        }
        if let Some(agent_name) = selector.agent_name.as_deref() {
            let agent = self
                .store
                .find_agent_by_slug(&ctx.tenant_id, &normalize_forms(agent_name).candidates())?
                .ok_or_else(|| TrackError::AgentNotFound(agent_name.to_string()))?;
            return self
                .store
                .find_latest_processing_execution(agent.agent_id)?
                .ok_or_else(|| {
                    TrackError::ExecutionNotFound(format!(
                        "no processing execution for agent {agent_name}"
                    ))
                });
        }
        Err(TrackError::InvalidInput(
            "finalization names neither an execution nor an agent".to_string(),
        ))
    }

    fn track_one(
        &self,
        execution: &Execution,
        item: &TrackItem,
    ) -> Result<TrackedItem, TrackError> {
        let (node, node_created) = self.resolve_node(execution.agent_id, item)?;

        // The tip is computed before this event's record lands, so the
        // edge runs from the previous step to this one.
        let tip = self.find_tip_node(execution)?;
        let linked_from = match tip {
            Some(tip_id) if tip_id != node.node_id => {
                let input = item.input_name.as_deref().unwrap_or(DEFAULT_PORT);
                let output = item.output_name.as_deref().unwrap_or(DEFAULT_PORT);
                self.link_if_absent(execution.agent_id, tip_id, node.node_id, input, output)?;
                Some(tip_id)
            }
            _ => None,
        };

        let subject = match (node.kind, node.model_id) {
            (NodeKind::Model, Some(model_id)) => RecordSubject::Model { model_id },
            _ => RecordSubject::Node {
                node_id: node.node_id,
            },
        };
        let record = NodeExecutionRecord {
            record_id: RecordId::new(),
            execution_id: execution.execution_id,
            subject,
            status: item.status,
            output: item.payload.clone(),
            created_at: now_utc(),
        };
        let record_seq = self.store.append_record(&record)?;

        Ok(TrackedItem {
            node,
            node_created,
            record_id: record.record_id,
            record_seq,
            linked_from,
        })
    }

    /// Pure input check for a track item. Kept separate from resolution so
    /// a malformed item can be rejected before any lookup creates state.
    fn item_identifier(item: &TrackItem) -> Result<&str, TrackError> {
        item.node_id
            .as_deref()
            .or(item.node_name.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                TrackError::InvalidInput("track item needs a node_id or node_name".to_string())
            })
    }

    fn resolve_node(
        &self,
        agent_id: AgentId,
        item: &TrackItem,
    ) -> Result<(AgentNode, bool), TrackError> {
        let identifier = Self::item_identifier(item)?;

        let mut candidates = normalize_forms(identifier).candidates();
        if let Some(name) = item.node_name.as_deref() {
            for candidate in normalize_forms(name).candidates() {
                if !candidates.contains(&candidate) {
                    candidates.push(candidate);
                }
            }
        }
        if let Some(node) = self.store.find_node_by_slug(agent_id, &candidates)? {
            return Ok((node, false));
        }

        let name = item
            .node_name
            .clone()
            .unwrap_or_else(|| identifier.to_string());
        self.create_node(
            agent_id,
            name,
            canonical_slug(identifier),
            item.kind,
            item.tool_type.clone(),
            item.model.clone(),
            item.description.clone(),
            Value::Null,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn create_node(
        &self,
        agent_id: AgentId,
        name: String,
        slug: String,
        kind: NodeKind,
        tool_type: Option<String>,
        model: Option<DeclaredModel>,
        description: Option<String>,
        config: Value,
    ) -> Result<(AgentNode, bool), TrackError> {
        let model_id = match kind {
            NodeKind::Model => {
                let spec = model.unwrap_or_default();
                let model = ModelRecord {
                    model_id: ModelId::new(),
                    provider: spec
                        .provider
                        .unwrap_or_else(|| DEFAULT_MODEL_PROVIDER.to_string()),
                    problem_type: spec
                        .problem_type
                        .unwrap_or_else(|| DEFAULT_PROBLEM_TYPE.to_string()),
                    params: spec.params,
                };
                self.store.insert_model(&model)?;
                Some(model.model_id)
            }
            NodeKind::Tool => None,
        };
        let tool_type = match kind {
            NodeKind::Tool => Some(tool_type.unwrap_or_else(|| DEFAULT_TOOL_TYPE.to_string())),
            NodeKind::Model => None,
        };

        let node = AgentNode {
            node_id: NodeId::new(),
            agent_id,
            name,
            slug,
            kind,
            position: trackgraph_domain::Position::default(),
            config,
            model_id,
            tool_type,
            description,
            deleted: false,
            created_at: now_utc(),
        };
        match self.store.insert_node(&node)? {
            InsertOutcome::Created(node) => {
                // Layout is cosmetic; a layout failure must not reject the
                // event that created the node.
                let _ = self.relayout(agent_id);
                Ok((node, true))
            }
            InsertOutcome::Existing(node) => Ok((node, false)),
        }
    }

    /// The node the previous record points at, across both streams. A
    /// model-keyed record resolves through the model's node binding and is
    /// only usable when that binding is unique.
    fn find_tip_node(&self, execution: &Execution) -> Result<Option<NodeId>, TrackError> {
        let Some(row) = self.store.latest_record(execution.execution_id)? else {
            return Ok(None);
        };
        match row.record.subject {
            RecordSubject::Node { node_id } => Ok(Some(node_id)),
            RecordSubject::Model { model_id } => {
                let bound = self.store.find_nodes_by_model(execution.agent_id, model_id)?;
                match bound.as_slice() {
                    [] => Ok(None),
                    [only] => Ok(Some(only.node_id)),
                    many => Err(TrackError::AmbiguousModelBinding {
                        model_id,
                        agent_id: execution.agent_id,
                        count: many.len(),
                    }),
                }
            }
        }
    }

    fn link_if_absent(
        &self,
        agent_id: AgentId,
        from: NodeId,
        to: NodeId,
        input_name: &str,
        output_name: &str,
    ) -> Result<bool, TrackError> {
        if self.store.find_connection(agent_id, from, to)?.is_some() {
            return Ok(false);
        }
        let connection = AgentConnection {
            connection_id: ConnectionId::new(),
            agent_id,
            from_node_id: from,
            to_node_id: to,
            input_name: input_name.to_string(),
            output_name: output_name.to_string(),
            created_at: now_utc(),
        };
        Ok(self.store.insert_connection(&connection)?.created())
    }

    fn relayout(&self, agent_id: AgentId) -> Result<(), TrackError> {
        let nodes = self.store.list_nodes(agent_id)?;
        let node_ids: Vec<NodeId> = nodes.iter().map(|node| node.node_id).collect();
        let edges: Vec<(NodeId, NodeId)> = self
            .store
            .list_connections(agent_id)?
            .into_iter()
            .filter(|connection| {
                node_ids.contains(&connection.from_node_id)
                    && node_ids.contains(&connection.to_node_id)
            })
            .map(|connection| (connection.from_node_id, connection.to_node_id))
            .collect();
        let positions = layer_nodes(&node_ids, &edges)?;
        self.store.update_node_positions(&positions)?;
        Ok(())
    }
}
