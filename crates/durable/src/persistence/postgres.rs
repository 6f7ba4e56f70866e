//! PostgreSQL dialect and transaction controller
//!
//! Production persistence using PostgreSQL with:
//! - Concurrent claiming with `FOR UPDATE SKIP LOCKED`
//! - Waits and responses in their own tables, matched inside the
//!   transaction that delivers the response or registers the wait
//!
//! The schema lives in `crates/durable/migrations/`; apply it with
//! [`run_migrations`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::dialect::DatabaseDialect;
use super::store::StoreError;
use super::txn::TransactionController;
use crate::workflow::{PersistentWorkflow, RegisterCall, Response, WaitMode, WorkflowState};

/// Apply the dispatch schema
pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await.map_err(|e| {
        error!("Failed to run migrations: {}", e);
        StoreError::Database(e.to_string())
    })
}

fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| {
        error!("Failed to {}: {}", context, e);
        StoreError::Database(e.to_string())
    }
}

/// Transaction controller over a connection pool
///
/// # Example
///
/// ```ignore
/// use durable_dispatch::persistence::PgTransactionController;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let txn = PgTransactionController::new(pool);
/// ```
#[derive(Clone)]
pub struct PgTransactionController {
    pool: PgPool,
}

impl PgTransactionController {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TransactionController for PgTransactionController {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        self.pool.begin().await.map_err(db_error("begin transaction"))
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.commit().await.map_err(db_error("commit transaction"))
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.rollback().await.map_err(db_error("roll back transaction"))
    }
}

/// PostgreSQL implementation of [`DatabaseDialect`]
///
/// Dequeues by priority, then insertion order.
pub struct PostgresDialect {
    engine_id: String,
    remove_when_finished: AtomicBool,
}

impl PostgresDialect {
    /// Create a dialect that claims instances as `engine_id`
    pub fn new(engine_id: impl Into<String>) -> Self {
        Self {
            engine_id: engine_id.into(),
            remove_when_finished: AtomicBool::new(false),
        }
    }

    pub fn engine_id(&self) -> &str {
        &self.engine_id
    }
}

/// Milliseconds as a BIGINT, saturating at `i64::MAX`
fn millis_i64(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn limit_i64(max: usize) -> i64 {
    i64::try_from(max).unwrap_or(i64::MAX)
}

fn response_from_row(row: &PgRow) -> Response {
    let error: Option<String> = row.get("error");
    let payload: Option<serde_json::Value> = row.get("payload");
    let removal_timeout_ms: Option<i64> = row.get("removal_timeout_ms");

    Response {
        correlation_id: row.get("correlation_id"),
        outcome: match error {
            Some(e) => Err(e),
            None => Ok(payload.unwrap_or(serde_json::Value::Null)),
        },
        timestamp: row.get("created_at"),
        removal_timeout: removal_timeout_ms.map(|ms| Duration::from_millis(ms.max(0) as u64)),
    }
}

fn instance_from_row(row: &PgRow) -> Result<PersistentWorkflow, StoreError> {
    let state: String = row.get("state");
    let state = WorkflowState::parse(&state)
        .ok_or_else(|| StoreError::Serialization(format!("unknown workflow state: {state}")))?;

    Ok(PersistentWorkflow {
        id: Some(row.get("id")),
        workflow_type: row.get("workflow_type"),
        pool_id: Some(row.get("pool_id")),
        priority: row.get("priority"),
        state,
        payload: row.get("payload"),
        register_call: None,
        responses: vec![],
        wait_expired: row.get("wait_expired"),
    })
}

/// Store a response as unmatched or matched to `instance_id`
async fn insert_response(
    conn: &mut PgConnection,
    response: &Response,
    instance_id: Option<Uuid>,
) -> Result<i64, StoreError> {
    let (payload, error) = match &response.outcome {
        Ok(payload) => (Some(payload), None),
        Err(e) => (None, Some(e.as_str())),
    };
    let removal_timeout_ms = response.removal_timeout.map(millis_i64);

    let row = sqlx::query(
        r#"
        INSERT INTO dispatch_responses
            (correlation_id, instance_id, payload, error, created_at, removal_timeout_ms, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id
        "#,
    )
    .bind(&response.correlation_id)
    .bind(instance_id)
    .bind(payload)
    .bind(error)
    .bind(response.timestamp)
    .bind(removal_timeout_ms)
    .bind(response.expires_at(Duration::ZERO))
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error("store response"))?;

    Ok(row.get("id"))
}

/// Mark a wait as answered by `response_id`
async fn attach_response(
    conn: &mut PgConnection,
    instance_id: Uuid,
    correlation_id: &str,
    response_id: i64,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE dispatch_waits
        SET response_id = $3
        WHERE instance_id = $1 AND correlation_id = $2
        "#,
    )
    .bind(instance_id)
    .bind(correlation_id)
    .bind(response_id)
    .execute(&mut *conn)
    .await
    .map_err(db_error("attach response"))?;
    Ok(())
}

/// Resume the instance if its wait condition holds; returns true if it did
async fn try_resolve(conn: &mut PgConnection, instance_id: Uuid) -> Result<bool, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT i.wait_mode,
               COUNT(*) FILTER (WHERE w.response_id IS NULL) AS open,
               COUNT(*) FILTER (WHERE w.response_id IS NOT NULL) AS answered
        FROM dispatch_instances i
        JOIN dispatch_waits w ON w.instance_id = i.id
        WHERE i.id = $1 AND i.state = 'waiting'
        GROUP BY i.wait_mode
        "#,
    )
    .bind(instance_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error("check wait condition"))?;

    let Some(row) = row else {
        return Ok(false);
    };

    let mode: Option<String> = row.get("wait_mode");
    let open: i64 = row.get("open");
    let answered: i64 = row.get("answered");

    let resolved = match mode.as_deref().and_then(WaitMode::parse) {
        Some(WaitMode::First) => answered > 0,
        Some(WaitMode::All) => open == 0,
        None => false,
    };
    if resolved {
        release(conn, &[instance_id], false).await?;
    }
    Ok(resolved)
}

/// Move waiting instances to ready and drop their waits
async fn release(conn: &mut PgConnection, ids: &[Uuid], expired: bool) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE dispatch_instances
        SET state = 'ready',
            wait_mode = NULL,
            wait_deadline = NULL,
            wait_expired = $2,
            updated_at = NOW()
        WHERE id = ANY($1)
        "#,
    )
    .bind(ids)
    .bind(expired)
    .execute(&mut *conn)
    .await
    .map_err(db_error("release waiting instances"))?;

    clear_waits(conn, ids).await
}

async fn clear_waits(conn: &mut PgConnection, ids: &[Uuid]) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM dispatch_waits WHERE instance_id = ANY($1)")
        .bind(ids)
        .execute(&mut *conn)
        .await
        .map_err(db_error("delete waits"))?;
    Ok(())
}

#[async_trait]
impl DatabaseDialect for PostgresDialect {
    type Tx = Transaction<'static, Postgres>;

    #[instrument(skip(self, tx, instances), fields(count = instances.len()))]
    async fn insert(
        &self,
        tx: &mut Self::Tx,
        instances: &[PersistentWorkflow],
    ) -> Result<(), StoreError> {
        for instance in instances {
            let id = instance
                .id
                .ok_or_else(|| StoreError::InvalidArgument("instance has no id".into()))?;

            sqlx::query(
                r#"
                INSERT INTO dispatch_instances (id, workflow_type, pool_id, priority, state, payload)
                VALUES ($1, $2, $3, $4, 'enqueued', $5)
                "#,
            )
            .bind(id)
            .bind(&instance.workflow_type)
            .bind(instance.pool_id())
            .bind(instance.priority)
            .bind(&instance.payload)
            .execute(&mut **tx)
            .await
            .map_err(db_error("insert workflow instance"))?;
        }
        Ok(())
    }

    #[instrument(skip(self, tx))]
    async fn dequeue(
        &self,
        tx: &mut Self::Tx,
        pool_id: &str,
        max: usize,
    ) -> Result<Vec<PersistentWorkflow>, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id, wait_expired AS expired
                FROM dispatch_instances
                WHERE state = 'ready' AND pool_id = $1
                ORDER BY priority DESC, seq
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE dispatch_instances i
            SET state = 'running',
                claimed_by = $3,
                wait_expired = FALSE,
                updated_at = NOW()
            FROM claimable c
            WHERE i.id = c.id
            RETURNING i.id, i.seq, i.workflow_type, i.pool_id, i.priority, i.state,
                      i.payload, c.expired AS wait_expired
            "#,
        )
        .bind(pool_id)
        .bind(limit_i64(max))
        .bind(&self.engine_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(db_error("claim workflow instances"))?;

        let mut claimed: Vec<(i64, PersistentWorkflow)> = Vec::with_capacity(rows.len());
        for row in &rows {
            claimed.push((row.get("seq"), instance_from_row(row)?));
        }
        claimed.sort_by(|(seq_a, a), (seq_b, b)| b.priority.cmp(&a.priority).then(seq_a.cmp(seq_b)));

        if claimed.is_empty() {
            return Ok(vec![]);
        }

        let ids: Vec<Uuid> = claimed.iter().filter_map(|(_, wf)| wf.id).collect();
        let response_rows = sqlx::query(
            r#"
            DELETE FROM dispatch_responses
            WHERE instance_id = ANY($1)
            RETURNING id, instance_id, correlation_id, payload, error, created_at, removal_timeout_ms
            "#,
        )
        .bind(&ids)
        .fetch_all(&mut **tx)
        .await
        .map_err(db_error("consume matched responses"))?;

        let mut delivered: HashMap<Uuid, Vec<(i64, Response)>> = HashMap::new();
        for row in &response_rows {
            let instance_id: Uuid = row.get("instance_id");
            delivered
                .entry(instance_id)
                .or_default()
                .push((row.get("id"), response_from_row(row)));
        }

        let claimed: Vec<PersistentWorkflow> = claimed
            .into_iter()
            .map(|(_, mut wf)| {
                if let Some(mut responses) = wf.id.and_then(|id| delivered.remove(&id)) {
                    responses.sort_by_key(|(id, _)| *id);
                    wf.responses = responses.into_iter().map(|(_, r)| r).collect();
                }
                wf
            })
            .collect();

        debug!(pool_id, count = claimed.len(), "claimed workflow instances");
        Ok(claimed)
    }

    #[instrument(skip(self, tx, responses), fields(count = responses.len()))]
    async fn notify(&self, tx: &mut Self::Tx, responses: &[Response]) -> Result<(), StoreError> {
        for response in responses {
            let target = sqlx::query(
                r#"
                SELECT i.id
                FROM dispatch_waits w
                JOIN dispatch_instances i ON i.id = w.instance_id
                WHERE w.correlation_id = $1
                  AND w.response_id IS NULL
                  AND i.state = 'waiting'
                ORDER BY i.wait_seq
                LIMIT 1
                FOR UPDATE OF i
                "#,
            )
            .bind(&response.correlation_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_error("find waiting instance"))?;

            match target {
                Some(row) => {
                    let instance_id: Uuid = row.get("id");
                    let response_id = insert_response(&mut **tx, response, Some(instance_id)).await?;
                    attach_response(&mut **tx, instance_id, &response.correlation_id, response_id)
                        .await?;
                    let resumed = try_resolve(&mut **tx, instance_id).await?;
                    debug!(%instance_id, correlation_id = %response.correlation_id, resumed, "matched response");
                }
                None => {
                    insert_response(&mut **tx, response, None).await?;
                }
            }
        }
        Ok(())
    }

    #[instrument(skip(self, tx, call, payload), fields(instance_id = %call.instance_id))]
    async fn register_callback(
        &self,
        tx: &mut Self::Tx,
        call: &RegisterCall,
        payload: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_instances
            SET state = 'waiting',
                payload = $2,
                claimed_by = NULL,
                wait_mode = $3,
                wait_deadline = $4,
                wait_seq = nextval('dispatch_wait_seq'),
                wait_expired = FALSE,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(call.instance_id)
        .bind(payload)
        .bind(call.wait_mode.as_str())
        .bind(call.deadline)
        .execute(&mut **tx)
        .await
        .map_err(db_error("register callback"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InstanceNotFound(call.instance_id));
        }

        clear_waits(&mut **tx, &[call.instance_id]).await?;

        let positions: Vec<i32> = (0..call.correlation_ids.len() as i32).collect();
        sqlx::query(
            r#"
            INSERT INTO dispatch_waits (instance_id, correlation_id, position)
            SELECT $1, c.correlation_id, c.position
            FROM UNNEST($2::TEXT[], $3::INTEGER[]) AS c(correlation_id, position)
            "#,
        )
        .bind(call.instance_id)
        .bind(&call.correlation_ids)
        .bind(&positions)
        .execute(&mut **tx)
        .await
        .map_err(db_error("insert waits"))?;

        // Responses that arrived before the wait; the earliest one per id wins
        for correlation_id in &call.correlation_ids {
            let pending = sqlx::query(
                r#"
                SELECT id
                FROM dispatch_responses
                WHERE correlation_id = $1 AND instance_id IS NULL
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
                "#,
            )
            .bind(correlation_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_error("find pending response"))?;

            let Some(row) = pending else {
                continue;
            };
            let response_id: i64 = row.get("id");

            sqlx::query("UPDATE dispatch_responses SET instance_id = $2 WHERE id = $1")
                .bind(response_id)
                .bind(call.instance_id)
                .execute(&mut **tx)
                .await
                .map_err(db_error("claim pending response"))?;
            attach_response(&mut **tx, call.instance_id, correlation_id, response_id).await?;

            if try_resolve(&mut **tx, call.instance_id).await? {
                break;
            }
        }
        Ok(())
    }

    #[instrument(skip(self, tx))]
    async fn finish(&self, tx: &mut Self::Tx, instance_id: Uuid) -> Result<(), StoreError> {
        let result = if self.remove_when_finished.load(Ordering::Relaxed) {
            sqlx::query("DELETE FROM dispatch_instances WHERE id = $1")
                .bind(instance_id)
                .execute(&mut **tx)
                .await
                .map_err(db_error("remove finished instance"))?
        } else {
            sqlx::query(
                r#"
                UPDATE dispatch_instances
                SET state = 'finished',
                    claimed_by = NULL,
                    wait_mode = NULL,
                    wait_deadline = NULL,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(instance_id)
            .execute(&mut **tx)
            .await
            .map_err(db_error("finish instance"))?
        };

        if result.rows_affected() == 0 {
            return Err(StoreError::InstanceNotFound(instance_id));
        }
        clear_waits(&mut **tx, &[instance_id]).await
    }

    #[instrument(skip(self, tx))]
    async fn record_error(
        &self,
        tx: &mut Self::Tx,
        instance_id: Uuid,
        cause: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_instances
            SET state = 'error',
                last_error = $2,
                claimed_by = NULL,
                wait_mode = NULL,
                wait_deadline = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .bind(cause)
        .execute(&mut **tx)
        .await
        .map_err(db_error("record error"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InstanceNotFound(instance_id));
        }
        clear_waits(&mut **tx, &[instance_id]).await
    }

    #[instrument(skip(self, tx))]
    async fn restart(&self, tx: &mut Self::Tx, instance_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_instances
            SET state = 'ready', last_error = NULL, updated_at = NOW()
            WHERE id = $1 AND state = 'error'
            "#,
        )
        .bind(instance_id)
        .execute(&mut **tx)
        .await
        .map_err(db_error("restart instance"))?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let exists = sqlx::query("SELECT 1 FROM dispatch_instances WHERE id = $1")
            .bind(instance_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_error("look up instance"))?
            .is_some();

        if exists {
            Err(StoreError::NotRestartable(instance_id))
        } else {
            Err(StoreError::InstanceNotFound(instance_id))
        }
    }

    #[instrument(skip(self, tx))]
    async fn restart_all(&self, tx: &mut Self::Tx) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_instances
            SET state = 'ready', last_error = NULL, updated_at = NOW()
            WHERE state = 'error'
            "#,
        )
        .execute(&mut **tx)
        .await
        .map_err(db_error("restart instances"))?;

        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self, tx))]
    async fn delete_stale_responses(
        &self,
        tx: &mut Self::Tx,
        max: usize,
    ) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM dispatch_responses
            WHERE id IN (
                SELECT id
                FROM dispatch_responses
                WHERE instance_id IS NULL AND expires_at <= NOW()
                ORDER BY id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(limit_i64(max))
        .execute(&mut **tx)
        .await
        .map_err(db_error("delete stale responses"))?;

        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self, tx))]
    async fn update_queue_state(&self, tx: &mut Self::Tx, max: usize) -> Result<usize, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT id, state AS previous_state
                FROM dispatch_instances
                WHERE state = 'enqueued'
                   OR (state = 'waiting' AND wait_deadline <= NOW())
                ORDER BY seq
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE dispatch_instances i
            SET state = 'ready',
                wait_expired = (due.previous_state = 'waiting'),
                wait_mode = NULL,
                wait_deadline = NULL,
                updated_at = NOW()
            FROM due
            WHERE i.id = due.id
            RETURNING i.id, due.previous_state
            "#,
        )
        .bind(limit_i64(max))
        .fetch_all(&mut **tx)
        .await
        .map_err(db_error("update queue state"))?;

        let expired: Vec<Uuid> = rows
            .iter()
            .filter(|row| row.get::<String, _>("previous_state") == "waiting")
            .map(|row| row.get("id"))
            .collect();
        if !expired.is_empty() {
            clear_waits(&mut **tx, &expired).await?;
        }

        Ok(rows.len())
    }

    #[instrument(skip(self, tx))]
    async fn resume_broken_business_processes(&self, tx: &mut Self::Tx) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_instances
            SET state = 'ready', claimed_by = NULL, updated_at = NOW()
            WHERE state = 'running' AND claimed_by = $1
            "#,
        )
        .bind(&self.engine_id)
        .execute(&mut **tx)
        .await
        .map_err(db_error("resume broken instances"))?;

        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self, tx))]
    async fn load(
        &self,
        tx: &mut Self::Tx,
        instance_id: Uuid,
    ) -> Result<Option<PersistentWorkflow>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_type, pool_id, priority, state, payload, wait_expired
            FROM dispatch_instances
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_error("load instance"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut instance = instance_from_row(&row)?;

        let responses = sqlx::query(
            r#"
            SELECT correlation_id, payload, error, created_at, removal_timeout_ms
            FROM dispatch_responses
            WHERE instance_id = $1
            ORDER BY id
            "#,
        )
        .bind(instance_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(db_error("load matched responses"))?;
        instance.responses = responses.iter().map(response_from_row).collect();

        Ok(Some(instance))
    }

    fn set_remove_when_finished(&self, remove: bool) {
        self.remove_when_finished.store(remove, Ordering::Relaxed);
    }
}
