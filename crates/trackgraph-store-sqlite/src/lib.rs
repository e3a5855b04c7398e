#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use time::OffsetDateTime;
use trackgraph_domain::{
    now_utc, Agent, AgentConnection, AgentId, AgentNode, ConnectionId, DateTimeUtc, ErrorDetails,
    Execution, ExecutionId, ExecutionStatus, ModelId, ModelRecord, NodeExecutionRecord, NodeId,
    NodeKind, Position, RecordId, RecordRow, RecordStatus, RecordSubject,
};
use trackgraph_store_core::{InsertOutcome, TrackingStore};
use ulid::Ulid;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agents (
  agent_id TEXT PRIMARY KEY,
  tenant_id TEXT NOT NULL,
  name TEXT NOT NULL,
  slug TEXT NOT NULL,
  description TEXT,
  created_at TEXT NOT NULL,
  UNIQUE(tenant_id, slug)
);

CREATE TABLE IF NOT EXISTS models (
  model_id TEXT PRIMARY KEY,
  provider TEXT NOT NULL,
  problem_type TEXT NOT NULL,
  params_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_nodes (
  node_id TEXT PRIMARY KEY,
  agent_id TEXT NOT NULL,
  name TEXT NOT NULL,
  slug TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('model','tool')),
  pos_x INTEGER NOT NULL DEFAULT 0,
  pos_y INTEGER NOT NULL DEFAULT 0,
  config_json TEXT NOT NULL,
  model_id TEXT,
  tool_type TEXT,
  description TEXT,
  deleted INTEGER NOT NULL DEFAULT 0 CHECK (deleted IN (0,1)),
  created_at TEXT NOT NULL,
  FOREIGN KEY (agent_id) REFERENCES agents(agent_id),
  FOREIGN KEY (model_id) REFERENCES models(model_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_agent_nodes_live_slug
  ON agent_nodes(agent_id, slug) WHERE deleted = 0;

CREATE TABLE IF NOT EXISTS agent_connections (
  connection_id TEXT PRIMARY KEY,
  agent_id TEXT NOT NULL,
  from_node_id TEXT NOT NULL,
  to_node_id TEXT NOT NULL,
  input_name TEXT NOT NULL,
  output_name TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE(from_node_id, to_node_id),
  FOREIGN KEY (agent_id) REFERENCES agents(agent_id),
  FOREIGN KEY (from_node_id) REFERENCES agent_nodes(node_id),
  FOREIGN KEY (to_node_id) REFERENCES agent_nodes(node_id)
);

CREATE TABLE IF NOT EXISTS executions (
  execution_id TEXT PRIMARY KEY,
  agent_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('processing','success','failed','failed_model')),
  input_json TEXT NOT NULL,
  output_json TEXT,
  duration_ms INTEGER,
  error_message TEXT,
  error_stack TEXT,
  external_correlation_id TEXT,
  started_at TEXT,
  ended_at TEXT,
  created_at TEXT NOT NULL,
  FOREIGN KEY (agent_id) REFERENCES agents(agent_id)
);

CREATE INDEX IF NOT EXISTS idx_executions_agent_created
  ON executions(agent_id, created_at);
CREATE INDEX IF NOT EXISTS idx_executions_correlation
  ON executions(external_correlation_id);

CREATE TABLE IF NOT EXISTS node_execution_records (
  record_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  record_id TEXT NOT NULL UNIQUE,
  execution_id TEXT NOT NULL,
  subject_type TEXT NOT NULL CHECK (subject_type IN ('node','model')),
  node_id TEXT,
  model_id TEXT,
  status TEXT NOT NULL CHECK (status IN ('success','failed','error','crash')),
  output_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  CHECK (
    (subject_type = 'node' AND node_id IS NOT NULL AND model_id IS NULL)
    OR (subject_type = 'model' AND model_id IS NOT NULL AND node_id IS NULL)
  ),
  FOREIGN KEY (execution_id) REFERENCES executions(execution_id)
);

CREATE INDEX IF NOT EXISTS idx_records_execution_seq
  ON node_execution_records(execution_id, record_seq);

CREATE TRIGGER IF NOT EXISTS trg_node_execution_records_no_update
BEFORE UPDATE ON node_execution_records
BEGIN
  SELECT RAISE(FAIL, 'node_execution_records is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_node_execution_records_no_delete
BEFORE DELETE ON node_execution_records
BEGIN
  SELECT RAISE(FAIL, 'node_execution_records is append-only');
END;
";

pub struct SqliteTrackingStore {
    conn: Connection,
}

impl SqliteTrackingStore {
    /// Open or create a `SQLite` tracking database and configure local
    /// pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }
}

impl TrackingStore for SqliteTrackingStore {
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply tracking schema")?;

        let now = rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, now],
            )
            .context("failed to record tracking migration")?;

        Ok(())
    }

    fn insert_agent(&self, agent: &Agent) -> Result<InsertOutcome<Agent>> {
        let changed = self
            .conn
            .execute(
                "INSERT INTO agents(agent_id, tenant_id, name, slug, description, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(tenant_id, slug) DO NOTHING",
                params![
                    agent.agent_id.to_string(),
                    agent.tenant_id,
                    agent.name,
                    agent.slug,
                    agent.description,
                    rfc3339(agent.created_at)?,
                ],
            )
            .context("failed to insert agent")?;

        if changed == 1 {
            return Ok(InsertOutcome::Created(agent.clone()));
        }

        // Another writer owns this slug; hand back its row.
        let existing = self
            .find_agent_by_slug(&agent.tenant_id, std::slice::from_ref(&agent.slug))?
            .ok_or_else(|| {
                anyhow!(
                    "agent slug {} conflicted but no winning row found",
                    agent.slug
                )
            })?;
        Ok(InsertOutcome::Existing(existing))
    }

    fn get_agent(&self, agent_id: AgentId) -> Result<Option<Agent>> {
        let mut stmt = self.conn.prepare(
            "SELECT agent_id, tenant_id, name, slug, description, created_at
             FROM agents WHERE agent_id = ?1",
        )?;
        stmt.query_row(params![agent_id.to_string()], read_agent_parts)
            .optional()?
            .map(agent_from_parts)
            .transpose()
    }

    fn find_agent_by_slug(
        &self,
        tenant_id: &str,
        candidates: &[String],
    ) -> Result<Option<Agent>> {
        let mut stmt = self.conn.prepare(
            "SELECT agent_id, tenant_id, name, slug, description, created_at
             FROM agents WHERE tenant_id = ?1 AND slug = ?2",
        )?;
        for candidate in candidates {
            let found = stmt
                .query_row(params![tenant_id, candidate], read_agent_parts)
                .optional()?
                .map(agent_from_parts)
                .transpose()?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    fn list_agents(&self, tenant_id: &str) -> Result<Vec<Agent>> {
        let mut stmt = self.conn.prepare(
            "SELECT agent_id, tenant_id, name, slug, description, created_at
             FROM agents WHERE tenant_id = ?1
             ORDER BY created_at ASC, agent_id ASC",
        )?;
        let mut rows = stmt.query(params![tenant_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(agent_from_parts(read_agent_parts(row)?)?);
        }
        Ok(out)
    }

    fn insert_model(&self, model: &ModelRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO models(model_id, provider, problem_type, params_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    model.model_id.to_string(),
                    model.provider,
                    model.problem_type,
                    serde_json::to_string(&model.params)?,
                ],
            )
            .context("failed to insert model")?;
        Ok(())
    }

    fn get_model(&self, model_id: ModelId) -> Result<Option<ModelRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT model_id, provider, problem_type, params_json
             FROM models WHERE model_id = ?1",
        )?;
        stmt.query_row(params![model_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .optional()?
        .map(|(model_id_raw, provider, problem_type, params_json)| {
            Ok(ModelRecord {
                model_id: ModelId(parse_ulid("model_id", &model_id_raw)?),
                provider,
                problem_type,
                params: serde_json::from_str(&params_json).context("invalid params_json")?,
            })
        })
        .transpose()
    }

    fn insert_node(&self, node: &AgentNode) -> Result<InsertOutcome<AgentNode>> {
        let changed = self
            .conn
            .execute(
                "INSERT INTO agent_nodes(
                    node_id, agent_id, name, slug, kind, pos_x, pos_y,
                    config_json, model_id, tool_type, description, deleted, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(agent_id, slug) WHERE deleted = 0 DO NOTHING",
                params![
                    node.node_id.to_string(),
                    node.agent_id.to_string(),
                    node.name,
                    node.slug,
                    node.kind.as_str(),
                    node.position.x,
                    node.position.y,
                    serde_json::to_string(&node.config)?,
                    node.model_id.map(|id| id.to_string()),
                    node.tool_type,
                    node.description,
                    i64::from(node.deleted),
                    rfc3339(node.created_at)?,
                ],
            )
            .context("failed to insert agent node")?;

        if changed == 1 {
            return Ok(InsertOutcome::Created(node.clone()));
        }

        let existing = self
            .find_node_by_slug(node.agent_id, std::slice::from_ref(&node.slug))?
            .ok_or_else(|| {
                anyhow!(
                    "node slug {} conflicted but no winning row found",
                    node.slug
                )
            })?;
        Ok(InsertOutcome::Existing(existing))
    }

    fn get_node(&self, node_id: NodeId) -> Result<Option<AgentNode>> {
        let mut stmt = self.conn.prepare(&format!(
            "{NODE_SELECT} WHERE node_id = ?1"
        ))?;
        stmt.query_row(params![node_id.to_string()], read_node_parts)
            .optional()?
            .map(node_from_parts)
            .transpose()
    }

    fn find_node_by_slug(
        &self,
        agent_id: AgentId,
        candidates: &[String],
    ) -> Result<Option<AgentNode>> {
        let mut stmt = self.conn.prepare(&format!(
            "{NODE_SELECT} WHERE agent_id = ?1 AND slug = ?2 AND deleted = 0"
        ))?;
        for candidate in candidates {
            let found = stmt
                .query_row(params![agent_id.to_string(), candidate], read_node_parts)
                .optional()?
                .map(node_from_parts)
                .transpose()?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    fn find_nodes_by_model(&self, agent_id: AgentId, model_id: ModelId) -> Result<Vec<AgentNode>> {
        let mut stmt = self.conn.prepare(&format!(
            "{NODE_SELECT} WHERE agent_id = ?1 AND model_id = ?2 AND deleted = 0
             ORDER BY created_at ASC, node_id ASC"
        ))?;
        let mut rows = stmt.query(params![agent_id.to_string(), model_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(node_from_parts(read_node_parts(row)?)?);
        }
        Ok(out)
    }

    fn list_nodes(&self, agent_id: AgentId) -> Result<Vec<AgentNode>> {
        let mut stmt = self.conn.prepare(&format!(
            "{NODE_SELECT} WHERE agent_id = ?1 AND deleted = 0
             ORDER BY created_at ASC, node_id ASC"
        ))?;
        let mut rows = stmt.query(params![agent_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(node_from_parts(read_node_parts(row)?)?);
        }
        Ok(out)
    }

    fn update_node_positions(&self, positions: &[(NodeId, Position)]) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare("UPDATE agent_nodes SET pos_x = ?2, pos_y = ?3 WHERE node_id = ?1")?;
        for (node_id, position) in positions {
            stmt.execute(params![node_id.to_string(), position.x, position.y])
                .context("failed to update node position")?;
        }
        Ok(())
    }

    fn tombstone_node(&self, node_id: NodeId) -> Result<()> {
        self.conn
            .execute(
                "UPDATE agent_nodes SET deleted = 1 WHERE node_id = ?1",
                params![node_id.to_string()],
            )
            .context("failed to tombstone node")?;
        Ok(())
    }

    fn insert_connection(
        &self,
        connection: &AgentConnection,
    ) -> Result<InsertOutcome<AgentConnection>> {
        let changed = self
            .conn
            .execute(
                "INSERT INTO agent_connections(
                    connection_id, agent_id, from_node_id, to_node_id,
                    input_name, output_name, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(from_node_id, to_node_id) DO NOTHING",
                params![
                    connection.connection_id.to_string(),
                    connection.agent_id.to_string(),
                    connection.from_node_id.to_string(),
                    connection.to_node_id.to_string(),
                    connection.input_name,
                    connection.output_name,
                    rfc3339(connection.created_at)?,
                ],
            )
            .context("failed to insert connection")?;

        if changed == 1 {
            return Ok(InsertOutcome::Created(connection.clone()));
        }

        let existing = self
            .find_connection(
                connection.agent_id,
                connection.from_node_id,
                connection.to_node_id,
            )?
            .ok_or_else(|| anyhow!("connection conflicted but no winning row found"))?;
        Ok(InsertOutcome::Existing(existing))
    }

    fn find_connection(
        &self,
        agent_id: AgentId,
        from_node_id: NodeId,
        to_node_id: NodeId,
    ) -> Result<Option<AgentConnection>> {
        let mut stmt = self.conn.prepare(
            "SELECT connection_id, agent_id, from_node_id, to_node_id,
                    input_name, output_name, created_at
             FROM agent_connections
             WHERE agent_id = ?1 AND from_node_id = ?2 AND to_node_id = ?3",
        )?;
        stmt.query_row(
            params![
                agent_id.to_string(),
                from_node_id.to_string(),
                to_node_id.to_string()
            ],
            read_connection_parts,
        )
        .optional()?
        .map(connection_from_parts)
        .transpose()
    }

    fn list_connections(&self, agent_id: AgentId) -> Result<Vec<AgentConnection>> {
        let mut stmt = self.conn.prepare(
            "SELECT connection_id, agent_id, from_node_id, to_node_id,
                    input_name, output_name, created_at
             FROM agent_connections
             WHERE agent_id = ?1
             ORDER BY created_at ASC, connection_id ASC",
        )?;
        let mut rows = stmt.query(params![agent_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(connection_from_parts(read_connection_parts(row)?)?);
        }
        Ok(out)
    }

    fn insert_execution(&self, execution: &Execution) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO executions(
                    execution_id, agent_id, status, input_json, output_json,
                    duration_ms, error_message, error_stack,
                    external_correlation_id, started_at, ended_at, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    execution.execution_id.to_string(),
                    execution.agent_id.to_string(),
                    execution.status.as_str(),
                    serde_json::to_string(&execution.input)?,
                    execution
                        .output
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    execution.duration_ms,
                    execution.error_details.as_ref().map(|err| err.message.clone()),
                    execution
                        .error_details
                        .as_ref()
                        .and_then(|err| err.stack.clone()),
                    execution.external_correlation_id,
                    execution.started_at.map(rfc3339).transpose()?,
                    execution.ended_at.map(rfc3339).transpose()?,
                    rfc3339(execution.created_at)?,
                ],
            )
            .context("failed to insert execution")?;
        Ok(())
    }

    fn get_execution(&self, execution_id: ExecutionId) -> Result<Option<Execution>> {
        let mut stmt = self.conn.prepare(&format!(
            "{EXECUTION_SELECT} WHERE execution_id = ?1"
        ))?;
        stmt.query_row(params![execution_id.to_string()], read_execution_parts)
            .optional()?
            .map(execution_from_parts)
            .transpose()
    }

    fn find_execution_by_correlation_id(
        &self,
        tenant_id: &str,
        external_correlation_id: &str,
    ) -> Result<Option<Execution>> {
        let mut stmt = self.conn.prepare(&format!(
            "{EXECUTION_SELECT}
             INNER JOIN agents a ON a.agent_id = e.agent_id
             WHERE a.tenant_id = ?1 AND e.external_correlation_id = ?2
             ORDER BY e.created_at DESC, e.execution_id DESC
             LIMIT 1"
        ))?;
        stmt.query_row(
            params![tenant_id, external_correlation_id],
            read_execution_parts,
        )
        .optional()?
        .map(execution_from_parts)
        .transpose()
    }

    fn find_latest_processing_execution(&self, agent_id: AgentId) -> Result<Option<Execution>> {
        let mut stmt = self.conn.prepare(&format!(
            "{EXECUTION_SELECT}
             WHERE e.agent_id = ?1 AND e.status = 'processing'
             ORDER BY e.created_at DESC, e.execution_id DESC
             LIMIT 1"
        ))?;
        stmt.query_row(params![agent_id.to_string()], read_execution_parts)
            .optional()?
            .map(execution_from_parts)
            .transpose()
    }

    fn list_executions(&self, agent_id: AgentId) -> Result<Vec<Execution>> {
        let mut stmt = self.conn.prepare(&format!(
            "{EXECUTION_SELECT}
             WHERE e.agent_id = ?1
             ORDER BY e.created_at DESC, e.execution_id DESC"
        ))?;
        let mut rows = stmt.query(params![agent_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(execution_from_parts(read_execution_parts(row)?)?);
        }
        Ok(out)
    }

    fn update_execution_finished(
        &self,
        execution_id: ExecutionId,
        status: ExecutionStatus,
        output: Option<&serde_json::Value>,
        duration_ms: Option<i64>,
        error_details: Option<&ErrorDetails>,
        ended_at: DateTimeUtc,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE executions SET
                    status = ?2, output_json = ?3, duration_ms = ?4,
                    error_message = ?5, error_stack = ?6, ended_at = ?7
                 WHERE execution_id = ?1",
                params![
                    execution_id.to_string(),
                    status.as_str(),
                    output.map(serde_json::to_string).transpose()?,
                    duration_ms,
                    error_details.map(|err| err.message.clone()),
                    error_details.and_then(|err| err.stack.clone()),
                    rfc3339(ended_at)?,
                ],
            )
            .context("failed to update finished execution")?;
        Ok(())
    }

    fn append_record(&self, record: &NodeExecutionRecord) -> Result<i64> {
        let (subject_type, node_id, model_id) = match record.subject {
            RecordSubject::Node { node_id } => ("node", Some(node_id.to_string()), None),
            RecordSubject::Model { model_id } => ("model", None, Some(model_id.to_string())),
        };
        self.conn
            .execute(
                "INSERT INTO node_execution_records(
                    record_id, execution_id, subject_type, node_id, model_id,
                    status, output_json, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.record_id.to_string(),
                    record.execution_id.to_string(),
                    subject_type,
                    node_id,
                    model_id,
                    record.status.as_str(),
                    serde_json::to_string(&record.output)?,
                    rfc3339(record.created_at)?,
                ],
            )
            .context("failed to append node execution record")?;

        Ok(self.conn.last_insert_rowid())
    }

    fn latest_record(&self, execution_id: ExecutionId) -> Result<Option<RecordRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "{RECORD_SELECT}
             WHERE execution_id = ?1
             ORDER BY record_seq DESC
             LIMIT 1"
        ))?;
        stmt.query_row(params![execution_id.to_string()], read_record_parts)
            .optional()?
            .map(record_from_parts)
            .transpose()
    }

    fn list_records(&self, execution_id: ExecutionId) -> Result<Vec<RecordRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "{RECORD_SELECT}
             WHERE execution_id = ?1
             ORDER BY record_seq ASC"
        ))?;
        let mut rows = stmt.query(params![execution_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(record_from_parts(read_record_parts(row)?)?);
        }
        Ok(out)
    }
}

const NODE_SELECT: &str = "SELECT node_id, agent_id, name, slug, kind, pos_x, pos_y,
        config_json, model_id, tool_type, description, deleted, created_at
 FROM agent_nodes";

const EXECUTION_SELECT: &str = "SELECT e.execution_id, e.agent_id, e.status, e.input_json,
        e.output_json, e.duration_ms, e.error_message, e.error_stack,
        e.external_correlation_id, e.started_at, e.ended_at, e.created_at
 FROM executions e";

const RECORD_SELECT: &str = "SELECT record_seq, record_id, execution_id, subject_type,
        node_id, model_id, status, output_json, created_at
 FROM node_execution_records";

type AgentParts = (String, String, String, String, Option<String>, String);

fn read_agent_parts(row: &Row<'_>) -> rusqlite::Result<AgentParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn agent_from_parts(parts: AgentParts) -> Result<Agent> {
    let (agent_id_raw, tenant_id, name, slug, description, created_at) = parts;
    Ok(Agent {
        agent_id: AgentId(parse_ulid("agent_id", &agent_id_raw)?),
        tenant_id,
        name,
        slug,
        description,
        created_at: parse_rfc3339(&created_at)?,
    })
}

type NodeParts = (
    String,
    String,
    String,
    String,
    String,
    i64,
    i64,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    i64,
    String,
);

fn read_node_parts(row: &Row<'_>) -> rusqlite::Result<NodeParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
    ))
}

fn node_from_parts(parts: NodeParts) -> Result<AgentNode> {
    let (
        node_id_raw,
        agent_id_raw,
        name,
        slug,
        kind,
        pos_x,
        pos_y,
        config_json,
        model_id_raw,
        tool_type,
        description,
        deleted,
        created_at,
    ) = parts;
    Ok(AgentNode {
        node_id: NodeId(parse_ulid("node_id", &node_id_raw)?),
        agent_id: AgentId(parse_ulid("agent_id", &agent_id_raw)?),
        name,
        slug,
        kind: NodeKind::parse(&kind)?,
        position: Position { x: pos_x, y: pos_y },
        config: serde_json::from_str(&config_json).context("invalid config_json")?,
        model_id: model_id_raw
            .map(|raw| parse_ulid("model_id", &raw).map(ModelId))
            .transpose()?,
        tool_type,
        description,
        deleted: deleted != 0,
        created_at: parse_rfc3339(&created_at)?,
    })
}

type ConnectionParts = (String, String, String, String, String, String, String);

fn read_connection_parts(row: &Row<'_>) -> rusqlite::Result<ConnectionParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn connection_from_parts(parts: ConnectionParts) -> Result<AgentConnection> {
    let (connection_id_raw, agent_id_raw, from_raw, to_raw, input_name, output_name, created_at) =
        parts;
    Ok(AgentConnection {
        connection_id: ConnectionId(parse_ulid("connection_id", &connection_id_raw)?),
        agent_id: AgentId(parse_ulid("agent_id", &agent_id_raw)?),
        from_node_id: NodeId(parse_ulid("from_node_id", &from_raw)?),
        to_node_id: NodeId(parse_ulid("to_node_id", &to_raw)?),
        input_name,
        output_name,
        created_at: parse_rfc3339(&created_at)?,
    })
}

type ExecutionParts = (
    String,
    String,
    String,
    String,
    Option<String>,
    Option<i64>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
);

fn read_execution_parts(row: &Row<'_>) -> rusqlite::Result<ExecutionParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn execution_from_parts(parts: ExecutionParts) -> Result<Execution> {
    let (
        execution_id_raw,
        agent_id_raw,
        status,
        input_json,
        output_json,
        duration_ms,
        error_message,
        error_stack,
        external_correlation_id,
        started_at,
        ended_at,
        created_at,
    ) = parts;
    Ok(Execution {
        execution_id: ExecutionId(parse_ulid("execution_id", &execution_id_raw)?),
        agent_id: AgentId(parse_ulid("agent_id", &agent_id_raw)?),
        status: ExecutionStatus::parse(&status)?,
        input: serde_json::from_str(&input_json).context("invalid input_json")?,
        output: output_json
            .map(|raw| serde_json::from_str(&raw).context("invalid output_json"))
            .transpose()?,
        duration_ms,
        error_details: error_message.map(|message| ErrorDetails {
            message,
            stack: error_stack,
        }),
        external_correlation_id,
        started_at: started_at.map(|raw| parse_rfc3339(&raw)).transpose()?,
        ended_at: ended_at.map(|raw| parse_rfc3339(&raw)).transpose()?,
        created_at: parse_rfc3339(&created_at)?,
    })
}

type RecordParts = (
    i64,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    String,
);

fn read_record_parts(row: &Row<'_>) -> rusqlite::Result<RecordParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn record_from_parts(parts: RecordParts) -> Result<RecordRow> {
    let (
        record_seq,
        record_id_raw,
        execution_id_raw,
        subject_type,
        node_id_raw,
        model_id_raw,
        status,
        output_json,
        created_at,
    ) = parts;
    let subject = match subject_type.as_str() {
        "node" => {
            let raw = node_id_raw.ok_or_else(|| anyhow!("node record missing node_id"))?;
            RecordSubject::Node {
                node_id: NodeId(parse_ulid("node_id", &raw)?),
            }
        }
        "model" => {
            let raw = model_id_raw.ok_or_else(|| anyhow!("model record missing model_id"))?;
            RecordSubject::Model {
                model_id: ModelId(parse_ulid("model_id", &raw)?),
            }
        }
        other => return Err(anyhow!("unknown record subject_type: {other}")),
    };
    Ok(RecordRow {
        record_seq,
        record: NodeExecutionRecord {
            record_id: RecordId(parse_ulid("record_id", &record_id_raw)?),
            execution_id: ExecutionId(parse_ulid("execution_id", &execution_id_raw)?),
            subject,
            status: RecordStatus::parse(&status)?,
            output: serde_json::from_str(&output_json).context("invalid output_json")?,
            created_at: parse_rfc3339(&created_at)?,
        },
    })
}

fn parse_ulid(label: &str, value: &str) -> Result<Ulid> {
    Ulid::from_str(value).map_err(|err| anyhow!("invalid {label} ULID: {err}"))
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid datetime format: {err}"))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 datetime: {err}"))
}

#[cfg(test)]
mod tests {
    use super::SqliteTrackingStore;
    use serde_json::json;
    use trackgraph_domain::{
        now_utc, Agent, AgentConnection, AgentId, AgentNode, ConnectionId, Execution, ExecutionId,
        ExecutionStatus, NodeExecutionRecord, NodeId, NodeKind, Position, RecordId, RecordStatus,
        RecordSubject,
    };
    use trackgraph_store_core::TrackingStore;
    use ulid::Ulid;

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "trackgraph-sqlite-test-{}-{}.sqlite",
            name,
            Ulid::new()
        ))
    }

    fn open_store(name: &str) -> SqliteTrackingStore {
        let store = SqliteTrackingStore::open(&temp_db_path(name));
        assert!(store.is_ok());
        let store = store.unwrap_or_else(|_| unreachable!());
        assert!(store.migrate().is_ok());
        store
    }

    fn fixture_agent(tenant_id: &str, slug: &str) -> Agent {
        Agent {
            agent_id: AgentId::new(),
            tenant_id: tenant_id.to_string(),
            name: slug.to_string(),
            slug: slug.to_string(),
            description: None,
            created_at: now_utc(),
        }
    }

    fn fixture_node(agent_id: AgentId, slug: &str) -> AgentNode {
        AgentNode {
            node_id: NodeId::new(),
            agent_id,
            name: slug.to_string(),
            slug: slug.to_string(),
            kind: NodeKind::Tool,
            position: Position::default(),
            config: json!({}),
            model_id: None,
            tool_type: Some("http".to_string()),
            description: None,
            deleted: false,
            created_at: now_utc(),
        }
    }

    fn fixture_execution(agent_id: AgentId) -> Execution {
        Execution {
            execution_id: ExecutionId::new(),
            agent_id,
            status: ExecutionStatus::Processing,
            input: json!({}),
            output: None,
            duration_ms: None,
            error_details: None,
            external_correlation_id: None,
            started_at: Some(now_utc()),
            ended_at: None,
            created_at: now_utc(),
        }
    }

    fn seeded_agent(store: &SqliteTrackingStore, tenant_id: &str, slug: &str) -> Agent {
        let inserted = store.insert_agent(&fixture_agent(tenant_id, slug));
        assert!(inserted.is_ok());
        inserted.unwrap_or_else(|_| unreachable!()).into_inner()
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = open_store("migrate");
        assert!(store.migrate().is_ok());
        assert!(store.migrate().is_ok());
    }

    #[test]
    fn agent_slug_conflict_returns_winning_row() {
        let store = open_store("agent-conflict");
        let first = seeded_agent(&store, "tenant-a", "supportBot");

        let second = store.insert_agent(&fixture_agent("tenant-a", "supportBot"));
        assert!(second.is_ok());
        let second = second.unwrap_or_else(|_| unreachable!());
        assert!(!second.created());
        assert_eq!(second.into_inner().agent_id, first.agent_id);

        // Same slug in another tenant is a fresh agent.
        let other_tenant = store.insert_agent(&fixture_agent("tenant-b", "supportBot"));
        assert!(other_tenant.is_ok());
        assert!(other_tenant.unwrap_or_else(|_| unreachable!()).created());
    }

    #[test]
    fn node_live_slug_conflict_returns_winner_and_tombstone_frees_slug() {
        let store = open_store("node-conflict");
        let agent = seeded_agent(&store, "tenant", "agent");

        let first = store.insert_node(&fixture_node(agent.agent_id, "sendReply"));
        assert!(first.is_ok());
        let first = first.unwrap_or_else(|_| unreachable!());
        assert!(first.created());
        let first = first.into_inner();

        let second = store.insert_node(&fixture_node(agent.agent_id, "sendReply"));
        assert!(second.is_ok());
        let second = second.unwrap_or_else(|_| unreachable!());
        assert!(!second.created());
        assert_eq!(second.into_inner().node_id, first.node_id);

        assert!(store.tombstone_node(first.node_id).is_ok());
        let third = store.insert_node(&fixture_node(agent.agent_id, "sendReply"));
        assert!(third.is_ok());
        assert!(third.unwrap_or_else(|_| unreachable!()).created());

        let live = store.list_nodes(agent.agent_id);
        assert!(live.is_ok());
        assert_eq!(live.unwrap_or_else(|_| unreachable!()).len(), 1);
    }

    #[test]
    fn connection_pair_is_unique() {
        let store = open_store("connection-dedup");
        let agent = seeded_agent(&store, "tenant", "agent");
        let from = store
            .insert_node(&fixture_node(agent.agent_id, "a"))
            .unwrap_or_else(|_| unreachable!())
            .into_inner();
        let to = store
            .insert_node(&fixture_node(agent.agent_id, "b"))
            .unwrap_or_else(|_| unreachable!())
            .into_inner();

        let connection = AgentConnection {
            connection_id: ConnectionId::new(),
            agent_id: agent.agent_id,
            from_node_id: from.node_id,
            to_node_id: to.node_id,
            input_name: "main".to_string(),
            output_name: "main".to_string(),
            created_at: now_utc(),
        };
        let first = store.insert_connection(&connection);
        assert!(first.is_ok());
        assert!(first.unwrap_or_else(|_| unreachable!()).created());

        let duplicate = AgentConnection {
            connection_id: ConnectionId::new(),
            created_at: now_utc(),
            ..connection.clone()
        };
        let second = store.insert_connection(&duplicate);
        assert!(second.is_ok());
        let second = second.unwrap_or_else(|_| unreachable!());
        assert!(!second.created());
        assert_eq!(second.into_inner().connection_id, connection.connection_id);

        let all = store.list_connections(agent.agent_id);
        assert!(all.is_ok());
        assert_eq!(all.unwrap_or_else(|_| unreachable!()).len(), 1);
    }

    #[test]
    fn records_are_append_only_and_sequence_ordered() {
        let store = open_store("records");
        let agent = seeded_agent(&store, "tenant", "agent");
        let node = store
            .insert_node(&fixture_node(agent.agent_id, "a"))
            .unwrap_or_else(|_| unreachable!())
            .into_inner();
        let execution = fixture_execution(agent.agent_id);
        assert!(store.insert_execution(&execution).is_ok());

        let mut seqs = Vec::new();
        for _ in 0..3 {
            let appended = store.append_record(&NodeExecutionRecord {
                record_id: RecordId::new(),
                execution_id: execution.execution_id,
                subject: RecordSubject::Node {
                    node_id: node.node_id,
                },
                status: RecordStatus::Success,
                output: json!({"ok": true}),
                created_at: now_utc(),
            });
            assert!(appended.is_ok());
            seqs.push(appended.unwrap_or_else(|_| unreachable!()));
        }
        assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]));

        let latest = store.latest_record(execution.execution_id);
        assert!(latest.is_ok());
        let latest = latest.unwrap_or_else(|_| unreachable!());
        assert_eq!(latest.map(|row| row.record_seq), seqs.last().copied());

        let mutated = store.conn.execute(
            "UPDATE node_execution_records SET status = 'failed' WHERE record_seq = 1",
            [],
        );
        assert!(mutated.is_err());
    }

    #[test]
    fn latest_processing_execution_skips_terminal_runs() {
        let store = open_store("latest-processing");
        let agent = seeded_agent(&store, "tenant", "agent");

        let ended = fixture_execution(agent.agent_id);
        assert!(store.insert_execution(&ended).is_ok());
        assert!(store
            .update_execution_finished(
                ended.execution_id,
                ExecutionStatus::Success,
                Some(&json!({"done": true})),
                Some(10),
                None,
                now_utc(),
            )
            .is_ok());

        let open = fixture_execution(agent.agent_id);
        assert!(store.insert_execution(&open).is_ok());

        let found = store.find_latest_processing_execution(agent.agent_id);
        assert!(found.is_ok());
        let found = found.unwrap_or_else(|_| unreachable!());
        assert_eq!(
            found.map(|execution| execution.execution_id),
            Some(open.execution_id)
        );
    }

    #[test]
    fn execution_finished_round_trips_error_details() {
        let store = open_store("finish");
        let agent = seeded_agent(&store, "tenant", "agent");
        let execution = fixture_execution(agent.agent_id);
        assert!(store.insert_execution(&execution).is_ok());

        assert!(store
            .update_execution_finished(
                execution.execution_id,
                ExecutionStatus::Failed,
                Some(&json!({"partial": 1})),
                Some(250),
                Some(&trackgraph_domain::ErrorDetails {
                    message: "boom".to_string(),
                    stack: Some("trace".to_string()),
                }),
                now_utc(),
            )
            .is_ok());

        let loaded = store.get_execution(execution.execution_id);
        assert!(loaded.is_ok());
        let loaded = loaded
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        assert_eq!(loaded.status, ExecutionStatus::Failed);
        assert_eq!(loaded.duration_ms, Some(250));
        let error = loaded.error_details.unwrap_or_default();
        assert_eq!(error.message, "boom");
        assert_eq!(error.stack.as_deref(), Some("trace"));
    }

    #[test]
    fn correlation_id_lookup_is_tenant_scoped() {
        let store = open_store("correlation");
        let agent_a = seeded_agent(&store, "tenant-a", "agent");
        let agent_b = seeded_agent(&store, "tenant-b", "agent");

        let mut exec_a = fixture_execution(agent_a.agent_id);
        exec_a.external_correlation_id = Some("corr-1".to_string());
        assert!(store.insert_execution(&exec_a).is_ok());

        let mut exec_b = fixture_execution(agent_b.agent_id);
        exec_b.external_correlation_id = Some("corr-1".to_string());
        assert!(store.insert_execution(&exec_b).is_ok());

        let found = store.find_execution_by_correlation_id("tenant-a", "corr-1");
        assert!(found.is_ok());
        let found = found.unwrap_or_else(|_| unreachable!());
        assert_eq!(
            found.map(|execution| execution.execution_id),
            Some(exec_a.execution_id)
        );
    }
}
