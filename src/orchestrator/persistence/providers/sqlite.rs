use crate::orchestrator::domain::{
    Conversation, Message, Run, RunStatus, Step, StepStatus, ToolCall,
};
use crate::orchestrator::persistence::RunStore;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

/// Guard appended to every run update issued by a state transition.
const NOT_TERMINAL: &str = "status NOT IN ('completed', 'failed', 'cancelled')";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect (creating the database file if needed) and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid database url {database_url}"))?
            .create_if_missing(true)
            .foreign_keys(true);

        if let Some(dir) = options.get_filename().parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create database directory {}", dir.display()))?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to open database")?;

        Self::from_pool(pool).await
    }

    /// Private in-memory database. One connection that is never recycled.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;
        Ok(Self { pool })
    }

    pub fn get_pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────────────────

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    Ok(Conversation {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        metadata: row.try_get("metadata")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let role: String = row.try_get("role")?;
    let attachments: serde_json::Value = row.try_get("attachments")?;
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        role: role.parse()?,
        content: row.try_get("content")?,
        attachments: serde_json::from_value(attachments)?,
        created_at: row.try_get("created_at")?,
        metadata: row.try_get("metadata")?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<Run> {
    let status: String = row.try_get("status")?;
    Ok(Run {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        agent_id: row.try_get("agent_id")?,
        status: RunStatus::from_str(&status)?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error: row.try_get("error")?,
        metadata: row.try_get("metadata")?,
    })
}

fn step_from_row(row: &SqliteRow) -> Result<Step> {
    let status: String = row.try_get("status")?;
    Ok(Step {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        step_number: row.try_get("step_number")?,
        agent_id: row.try_get("agent_id")?,
        status: StepStatus::from_str(&status)?,
        input: row.try_get("input_data")?,
        output: row.try_get("output_data")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error: row.try_get("error")?,
    })
}

fn tool_call_from_row(row: &SqliteRow) -> Result<ToolCall> {
    Ok(ToolCall {
        id: row.try_get("id")?,
        step_id: row.try_get("step_id")?,
        tool_name: row.try_get("tool_name")?,
        arguments: row.try_get("arguments")?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Statement helpers shared by the transactional writes
// ─────────────────────────────────────────────────────────────────────────────

async fn insert_message(conn: &mut sqlx::SqliteConnection, message: &Message) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO messages (id, conversation_id, role, content, attachments, metadata, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&message.id)
    .bind(&message.conversation_id)
    .bind(message.role.as_str())
    .bind(&message.content)
    .bind(serde_json::to_value(&message.attachments)?)
    .bind(&message.metadata)
    .bind(message.created_at)
    .execute(&mut *conn)
    .await?;

    sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
        .bind(message.created_at)
        .bind(&message.conversation_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn finish_step(conn: &mut sqlx::SqliteConnection, step: &Step) -> Result<()> {
    let updated = sqlx::query(
        r#"
        UPDATE steps SET status = ?, output_data = ?, completed_at = ?, error = ?
        WHERE id = ? AND status = 'running'
        "#,
    )
    .bind(step.status.as_str())
    .bind(&step.output)
    .bind(step.completed_at)
    .bind(&step.error)
    .bind(&step.id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if updated == 0 {
        bail!("step {} is not running", step.id);
    }
    Ok(())
}

async fn finish_run(conn: &mut sqlx::SqliteConnection, run: &Run) -> Result<()> {
    let updated = sqlx::query(&format!(
        "UPDATE runs SET status = ?, started_at = ?, completed_at = ?, error = ? \
         WHERE id = ? AND {NOT_TERMINAL}"
    ))
    .bind(run.status.as_str())
    .bind(run.started_at)
    .bind(run.completed_at)
    .bind(&run.error)
    .bind(&run.id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if updated == 0 {
        bail!("run {} is missing or already terminal", run.id);
    }
    Ok(())
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn create_conversation(&self, conversation: &Conversation) -> Result<()> {
        sqlx::query(
            "INSERT INTO conversations (id, created_at, updated_at, metadata) VALUES (?, ?, ?, ?)",
        )
        .bind(&conversation.id)
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .bind(&conversation.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(conversation_from_row)
            .transpose()
    }

    async fn append_message(&self, message: &Message) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_message(&mut tx, message).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn create_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (id, conversation_id, agent_id, status, created_at, started_at,
                              completed_at, error, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.conversation_id)
        .bind(&run.agent_id)
        .bind(run.status.as_str())
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(&run.error)
        .bind(&run.metadata)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to create run for conversation {}", run.conversation_id))?;
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>> {
        sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(run_from_row)
            .transpose()
    }

    async fn list_steps(&self, run_id: &str) -> Result<Vec<Step>> {
        let rows = sqlx::query("SELECT * FROM steps WHERE run_id = ? ORDER BY step_number ASC")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(step_from_row).collect()
    }

    async fn list_tool_calls(&self, step_id: &str) -> Result<Vec<ToolCall>> {
        let rows = sqlx::query(
            "SELECT * FROM tool_calls WHERE step_id = ? ORDER BY started_at ASC, rowid ASC",
        )
        .bind(step_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(tool_call_from_row).collect()
    }

    async fn mark_running(&self, run: &Run) -> Result<()> {
        let updated =
            sqlx::query("UPDATE runs SET status = ?, started_at = ? WHERE id = ? AND status = 'queued'")
                .bind(run.status.as_str())
                .bind(run.started_at)
                .bind(&run.id)
                .execute(&self.pool)
                .await?
                .rows_affected();

        if updated == 0 {
            bail!("run {} is missing or not queued", run.id);
        }
        Ok(())
    }

    async fn insert_step(&self, step: &Step) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO steps (id, run_id, step_number, agent_id, status, input_data,
                               output_data, started_at, completed_at, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&step.id)
        .bind(&step.run_id)
        .bind(step.step_number)
        .bind(&step.agent_id)
        .bind(step.status.as_str())
        .bind(&step.input)
        .bind(&step.output)
        .bind(step.started_at)
        .bind(step.completed_at)
        .bind(&step.error)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert step {} of run {}", step.step_number, step.run_id))?;
        Ok(())
    }

    async fn save_tool_call(&self, call: &ToolCall) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tool_calls (id, step_id, tool_name, arguments, result, error,
                                    started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                result = excluded.result,
                error = excluded.error,
                completed_at = excluded.completed_at
            WHERE tool_calls.completed_at IS NULL
            "#,
        )
        .bind(&call.id)
        .bind(&call.step_id)
        .bind(&call.tool_name)
        .bind(&call.arguments)
        .bind(&call.result)
        .bind(&call.error)
        .bind(call.started_at)
        .bind(call.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn commit_completion(&self, run: &Run, step: &Step, reply: &Message) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        finish_step(&mut tx, step).await?;
        insert_message(&mut tx, reply).await?;
        finish_run(&mut tx, run).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn commit_terminal(&self, run: &Run, step: Option<&Step>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if let Some(step) = step {
            finish_step(&mut tx, step).await?;
        }
        finish_run(&mut tx, run).await?;
        tx.commit().await?;
        Ok(())
    }
}
