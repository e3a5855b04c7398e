#![forbid(unsafe_code)]

use anyhow::Result;
use trackgraph_domain::{
    Agent, AgentConnection, AgentId, AgentNode, Execution, ExecutionId, ExecutionStatus,
    ModelId, ModelRecord, NodeExecutionRecord, NodeId, Position, RecordRow,
};

/// Whether an insert created a fresh row or lost a uniqueness race and
/// returned the row another writer created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome<T> {
    Created(T),
    Existing(T),
}

impl<T> InsertOutcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Created(value) | Self::Existing(value) => value,
        }
    }

    #[must_use]
    pub fn created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Persistence seam for the tracking engine. Implementations must provide
/// read-your-writes consistency per record and enforce the uniqueness
/// invariants: agent slug per tenant, live node slug per agent, one
/// connection per ordered (from, to) pair.
pub trait TrackingStore {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_agent(&self, agent: &Agent) -> Result<InsertOutcome<Agent>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_agent(&self, agent_id: AgentId) -> Result<Option<Agent>>;

    /// Exact-match lookup over the candidate slug set, first hit wins.
    #[allow(clippy::missing_errors_doc)]
    fn find_agent_by_slug(&self, tenant_id: &str, candidates: &[String])
        -> Result<Option<Agent>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_agents(&self, tenant_id: &str) -> Result<Vec<Agent>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_model(&self, model: &ModelRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_model(&self, model_id: ModelId) -> Result<Option<ModelRecord>>;

    /// Insert a node; a live-slug conflict resolves to the winning row.
    #[allow(clippy::missing_errors_doc)]
    fn insert_node(&self, node: &AgentNode) -> Result<InsertOutcome<AgentNode>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_node(&self, node_id: NodeId) -> Result<Option<AgentNode>>;

    /// Exact-match lookup among the agent's live (non-tombstoned) nodes.
    #[allow(clippy::missing_errors_doc)]
    fn find_node_by_slug(
        &self,
        agent_id: AgentId,
        candidates: &[String],
    ) -> Result<Option<AgentNode>>;

    /// Live nodes of an agent bound to a model, in creation order.
    #[allow(clippy::missing_errors_doc)]
    fn find_nodes_by_model(&self, agent_id: AgentId, model_id: ModelId) -> Result<Vec<AgentNode>>;

    /// Live nodes of an agent in creation order.
    #[allow(clippy::missing_errors_doc)]
    fn list_nodes(&self, agent_id: AgentId) -> Result<Vec<AgentNode>>;

    #[allow(clippy::missing_errors_doc)]
    fn update_node_positions(&self, positions: &[(NodeId, Position)]) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn tombstone_node(&self, node_id: NodeId) -> Result<()>;

    /// Insert a connection; a (from, to) conflict resolves to the existing
    /// row so edge creation is idempotent under concurrency.
    #[allow(clippy::missing_errors_doc)]
    fn insert_connection(
        &self,
        connection: &AgentConnection,
    ) -> Result<InsertOutcome<AgentConnection>>;

    #[allow(clippy::missing_errors_doc)]
    fn find_connection(
        &self,
        agent_id: AgentId,
        from_node_id: NodeId,
        to_node_id: NodeId,
    ) -> Result<Option<AgentConnection>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_connections(&self, agent_id: AgentId) -> Result<Vec<AgentConnection>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_execution(&self, execution: &Execution) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_execution(&self, execution_id: ExecutionId) -> Result<Option<Execution>>;

    #[allow(clippy::missing_errors_doc)]
    fn find_execution_by_correlation_id(
        &self,
        tenant_id: &str,
        external_correlation_id: &str,
    ) -> Result<Option<Execution>>;

    /// Newest execution of the agent still in `processing`, if any.
    #[allow(clippy::missing_errors_doc)]
    fn find_latest_processing_execution(&self, agent_id: AgentId) -> Result<Option<Execution>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_executions(&self, agent_id: AgentId) -> Result<Vec<Execution>>;

    #[allow(clippy::missing_errors_doc)]
    fn update_execution_finished(
        &self,
        execution_id: ExecutionId,
        status: ExecutionStatus,
        output: Option<&serde_json::Value>,
        duration_ms: Option<i64>,
        error_details: Option<&trackgraph_domain::ErrorDetails>,
        ended_at: trackgraph_domain::DateTimeUtc,
    ) -> Result<()>;

    /// Append a node-execution record; returns the store-assigned monotonic
    /// sequence used for tip resolution.
    #[allow(clippy::missing_errors_doc)]
    fn append_record(&self, record: &NodeExecutionRecord) -> Result<i64>;

    /// Most recent record of an execution by sequence, across both subject
    /// variants.
    #[allow(clippy::missing_errors_doc)]
    fn latest_record(&self, execution_id: ExecutionId) -> Result<Option<RecordRow>>;

    /// All records of an execution in sequence order.
    #[allow(clippy::missing_errors_doc)]
    fn list_records(&self, execution_id: ExecutionId) -> Result<Vec<RecordRow>>;
}
