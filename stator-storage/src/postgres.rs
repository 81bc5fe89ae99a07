//! PostgreSQL storage implementation

use crate::metrics::{DB_ERRORS_TOTAL, DB_OPERATION_DURATION};
use crate::models::{EntityModel, StateCount};
use crate::store::{DueQuery, StateStore, StateUpdate};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, QueryBuilder};
use stator_core::{EntityRecord, EntityRef, EntityType, RetryPolicy, RetryStrategy};
use std::future::Future;
use std::time::Instant;
use tracing::{error, instrument, warn};

const ENTITY_COLUMNS: &str = "entity_type, entity_id, state, state_changed, state_attempted, \
     attempt_count, state_locked_until, state_lock_owner, created_at, updated_at";

/// Upper bound on rows returned by listing operations
const MAX_LIST_LIMIT: usize = 1000;

/// Configuration for the PostgreSQL connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
    pub max_lifetime_secs: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_secs: 30,
            idle_timeout_secs: Some(600),
            max_lifetime_secs: None,
        }
    }
}

/// PostgreSQL [`StateStore`] over the `stator_entities` table
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect with the default pool configuration
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_pool_config(database_url, PoolConfig::default()).await
    }

    /// Connect using a PoolConfig
    pub async fn with_pool_config(database_url: &str, config: PoolConfig) -> Result<Self> {
        if config.min_connections == 0 {
            return Err(crate::Error::ValidationError(
                "min_connections must be > 0".to_string(),
            ));
        }
        if config.max_connections == 0 || config.max_connections < config.min_connections {
            return Err(crate::Error::ValidationError(
                "max_connections must be >= min_connections and > 0".to_string(),
            ));
        }

        let mut opts = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.acquire_timeout_secs));

        if let Some(idle) = config.idle_timeout_secs {
            opts = opts.idle_timeout(std::time::Duration::from_secs(idle));
        }
        if let Some(max_life) = config.max_lifetime_secs {
            opts = opts.max_lifetime(std::time::Duration::from_secs(max_life));
        }

        let pool = opts.connect(database_url).await.map_err(map_db_error)?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<()> {
        crate::migrations::run_migrations(&self.pool).await
    }

    fn validate_limit(limit: usize) -> Result<i64> {
        if limit == 0 {
            return Err(crate::Error::ValidationError(
                "Limit must be greater than 0".to_string(),
            ));
        }
        if limit > MAX_LIST_LIMIT {
            return Err(crate::Error::ValidationError(format!(
                "Limit cannot exceed {}",
                MAX_LIST_LIMIT
            )));
        }
        Ok(limit as i64)
    }

    fn validate_non_empty_string(value: &str, field_name: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(crate::Error::ValidationError(format!(
                "{} cannot be empty",
                field_name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for PostgresStorage {
    #[instrument(
        skip(self, record),
        fields(
            db.system = "postgresql",
            db.operation = "INSERT",
            db.sql.table = "stator_entities",
            entity_type = %record.entity.entity_type,
            entity_id = %record.entity.id
        )
    )]
    async fn insert(&self, record: &EntityRecord) -> Result<()> {
        Self::validate_non_empty_string(record.entity.entity_type.as_str(), "Entity type")?;
        Self::validate_non_empty_string(record.state.as_str(), "State")?;

        let model = EntityModel::from_record(record, Utc::now());
        timed("insert", async {
            sqlx::query(
                r#"
                INSERT INTO stator_entities (
                    entity_type, entity_id, state, state_changed, state_attempted,
                    attempt_count, state_locked_until, state_lock_owner, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(&model.entity_type)
            .bind(model.entity_id)
            .bind(&model.state)
            .bind(model.state_changed)
            .bind(model.state_attempted)
            .bind(model.attempt_count)
            .bind(model.state_locked_until)
            .bind(&model.state_lock_owner)
            .bind(model.created_at)
            .bind(model.updated_at)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
            Ok(())
        })
        .await
    }

    #[instrument(
        skip(self),
        fields(
            db.system = "postgresql",
            db.operation = "SELECT",
            db.sql.table = "stator_entities",
            entity_type = %entity.entity_type,
            entity_id = %entity.id
        )
    )]
    async fn get(&self, entity: &EntityRef) -> Result<Option<EntityRecord>> {
        timed("get", async {
            let row = sqlx::query_as::<_, EntityModel>(&format!(
                "SELECT {} FROM stator_entities WHERE entity_type = $1 AND entity_id = $2",
                ENTITY_COLUMNS
            ))
            .bind(entity.entity_type.as_str())
            .bind(entity.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;
            Ok(row.map(EntityRecord::from))
        })
        .await
    }

    #[instrument(
        skip(self, queries),
        fields(
            db.system = "postgresql",
            db.operation = "SELECT",
            db.sql.table = "stator_entities",
            query_count = queries.len(),
            limit = limit
        )
    )]
    async fn find_due(
        &self,
        queries: &[DueQuery],
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EntityRecord>> {
        if limit == 0 || queries.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = build_due_query(queries, now, limit);
        timed("find_due", async {
            let rows = qb
                .build_query_as::<EntityModel>()
                .fetch_all(&self.pool)
                .await
                .map_err(map_db_error)?;
            Ok(rows.into_iter().map(EntityRecord::from).collect())
        })
        .await
    }

    /// Single conditional UPDATE; concurrent claimers serialize on the row
    /// lock and all but one see the live lease when re-evaluating the WHERE.
    #[instrument(
        skip(self),
        fields(
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.sql.table = "stator_entities",
            entity_type = %entity.entity_type,
            entity_id = %entity.id,
            owner = %owner
        )
    )]
    async fn try_claim(
        &self,
        entity: &EntityRef,
        owner: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<EntityRecord>> {
        timed("try_claim", async {
            let row = sqlx::query_as::<_, EntityModel>(&format!(
                r#"
                UPDATE stator_entities
                SET state_locked_until = $3,
                    state_lock_owner = $4,
                    updated_at = NOW()
                WHERE entity_type = $1
                  AND entity_id = $2
                  AND (state_locked_until IS NULL OR state_locked_until <= $5)
                RETURNING {}
                "#,
                ENTITY_COLUMNS
            ))
            .bind(entity.entity_type.as_str())
            .bind(entity.id)
            .bind(until)
            .bind(owner)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;
            Ok(row.map(EntityRecord::from))
        })
        .await
    }

    #[instrument(
        skip(self, update),
        fields(
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.sql.table = "stator_entities",
            entity_type = %entity.entity_type,
            entity_id = %entity.id,
            owner = %owner
        )
    )]
    async fn complete(
        &self,
        entity: &EntityRef,
        owner: &str,
        update: &StateUpdate,
    ) -> Result<bool> {
        timed("complete", async {
            let result = match update {
                StateUpdate::Transitioned { state, at } => {
                    Self::validate_non_empty_string(state.as_str(), "State")?;
                    sqlx::query(
                        r#"
                        UPDATE stator_entities
                        SET state = $4,
                            state_changed = GREATEST(state_changed, $5),
                            state_attempted = NULL,
                            attempt_count = 0,
                            state_locked_until = NULL,
                            state_lock_owner = NULL,
                            updated_at = NOW()
                        WHERE entity_type = $1 AND entity_id = $2 AND state_lock_owner = $3
                        "#,
                    )
                    .bind(entity.entity_type.as_str())
                    .bind(entity.id)
                    .bind(owner)
                    .bind(state.as_str())
                    .bind(*at)
                    .execute(&self.pool)
                    .await
                }
                StateUpdate::Attempted { attempt_count, at } => {
                    sqlx::query(
                        r#"
                        UPDATE stator_entities
                        SET state_attempted = $4,
                            attempt_count = $5,
                            state_locked_until = NULL,
                            state_lock_owner = NULL,
                            updated_at = NOW()
                        WHERE entity_type = $1 AND entity_id = $2 AND state_lock_owner = $3
                        "#,
                    )
                    .bind(entity.entity_type.as_str())
                    .bind(entity.id)
                    .bind(owner)
                    .bind(*at)
                    .bind(i32::try_from(*attempt_count).unwrap_or(i32::MAX))
                    .execute(&self.pool)
                    .await
                }
            }
            .map_err(map_db_error)?;

            Ok(result.rows_affected() == 1)
        })
        .await
    }

    #[instrument(
        skip(self),
        fields(
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.sql.table = "stator_entities",
            entity_type = %entity.entity_type,
            entity_id = %entity.id,
            owner = %owner
        )
    )]
    async fn release(&self, entity: &EntityRef, owner: &str) -> Result<bool> {
        timed("release", async {
            let result = sqlx::query(
                r#"
                UPDATE stator_entities
                SET state_locked_until = NULL,
                    state_lock_owner = NULL,
                    updated_at = NOW()
                WHERE entity_type = $1 AND entity_id = $2 AND state_lock_owner = $3
                "#,
            )
            .bind(entity.entity_type.as_str())
            .bind(entity.id)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    #[instrument(
        skip(self),
        fields(
            db.system = "postgresql",
            db.operation = "DELETE",
            db.sql.table = "stator_entities",
            entity_type = %entity.entity_type,
            entity_id = %entity.id
        )
    )]
    async fn delete(&self, entity: &EntityRef) -> Result<bool> {
        timed("delete", async {
            let result =
                sqlx::query("DELETE FROM stator_entities WHERE entity_type = $1 AND entity_id = $2")
                    .bind(entity.entity_type.as_str())
                    .bind(entity.id)
                    .execute(&self.pool)
                    .await
                    .map_err(map_db_error)?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    #[instrument(
        skip(self),
        fields(
            db.system = "postgresql",
            db.operation = "SELECT",
            db.sql.table = "stator_entities"
        )
    )]
    async fn list_stuck(
        &self,
        entity_type: Option<&EntityType>,
        limit: usize,
    ) -> Result<Vec<EntityRecord>> {
        let limit = Self::validate_limit(limit)?;
        let entity_type = entity_type.map(|t| t.as_str().to_string());
        timed("list_stuck", async {
            let rows = sqlx::query_as::<_, EntityModel>(&format!(
                r#"
                SELECT {}
                FROM stator_entities
                WHERE attempt_count > 0
                  AND ($1::text IS NULL OR entity_type = $1)
                ORDER BY attempt_count DESC, state_attempted ASC
                LIMIT $2
                "#,
                ENTITY_COLUMNS
            ))
            .bind(entity_type)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)?;
            Ok(rows.into_iter().map(EntityRecord::from).collect())
        })
        .await
    }

    #[instrument(
        skip(self),
        fields(
            db.system = "postgresql",
            db.operation = "SELECT",
            db.sql.table = "stator_entities"
        )
    )]
    async fn count_by_state(&self) -> Result<Vec<StateCount>> {
        timed("count_by_state", async {
            let rows = sqlx::query_as::<_, StateCount>(
                r#"
                SELECT entity_type, state, COUNT(*) AS count
                FROM stator_entities
                GROUP BY entity_type, state
                ORDER BY entity_type, state
                "#,
            )
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)?;
            Ok(rows)
        })
        .await
    }
}

/// Backoff parameters as evaluated in SQL:
/// `LEAST(initial * multiplier ^ LEAST(GREATEST(attempt_count - 1, 0), max_exponent), max)`
#[derive(Debug, Clone, Copy, PartialEq)]
struct SqlBackoff {
    initial_secs: f64,
    multiplier: f64,
    max_secs: f64,
    max_exponent: i32,
}

impl SqlBackoff {
    fn from_policy(policy: &RetryPolicy) -> Self {
        let initial = policy.initial_delay.as_secs_f64();
        match policy.strategy {
            RetryStrategy::None => Self {
                initial_secs: 0.0,
                multiplier: 1.0,
                max_secs: 0.0,
                max_exponent: 0,
            },
            RetryStrategy::Fixed => Self {
                initial_secs: initial,
                multiplier: 1.0,
                max_secs: initial,
                max_exponent: 0,
            },
            RetryStrategy::Exponential => {
                let max = policy.max_delay.as_secs_f64();
                let multiplier = policy.backoff_multiplier;
                // Exponent past which the cap always applies; keeps power() finite
                let max_exponent = if multiplier <= 1.0 || initial <= 0.0 || max <= initial {
                    0
                } else {
                    ((max / initial).ln() / multiplier.ln()).ceil().clamp(0.0, i32::MAX as f64) as i32
                };
                Self {
                    initial_secs: initial,
                    multiplier,
                    max_secs: max,
                    max_exponent,
                }
            }
        }
    }

    /// Rust evaluation of the SQL expression
    #[cfg(test)]
    fn delay_secs(&self, attempt_count: u32) -> f64 {
        if attempt_count == 0 {
            return 0.0;
        }
        let exponent = (attempt_count as i64 - 1).clamp(0, self.max_exponent as i64) as i32;
        (self.initial_secs * self.multiplier.powi(exponent)).min(self.max_secs)
    }
}

fn build_due_query(queries: &[DueQuery], now: DateTime<Utc>, limit: usize) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::<Postgres>::new("SELECT ");
    qb.push(ENTITY_COLUMNS);
    qb.push(" FROM (");

    for (i, query) in queries.iter().enumerate() {
        if i > 0 {
            qb.push(" UNION ALL ");
        }
        let backoff = SqlBackoff::from_policy(&query.retry);

        qb.push("SELECT ");
        qb.push(ENTITY_COLUMNS);
        qb.push(", CASE WHEN state_attempted IS NULL THEN state_changed ELSE state_attempted + make_interval(secs => LEAST(");
        qb.push_bind(backoff.initial_secs);
        qb.push("::float8 * power(");
        qb.push_bind(backoff.multiplier);
        qb.push("::float8, LEAST(GREATEST(attempt_count - 1, 0), ");
        qb.push_bind(backoff.max_exponent);
        qb.push("::int4)::float8), ");
        qb.push_bind(backoff.max_secs);
        qb.push("::float8)) END AS due_at FROM stator_entities WHERE entity_type = ");
        qb.push_bind(query.entity_type.as_str().to_string());
        qb.push(" AND state = ");
        qb.push_bind(query.state.as_str().to_string());
        qb.push(" AND attempt_count < ");
        qb.push_bind(i32::try_from(query.retry.max_attempts).unwrap_or(i32::MAX));
        qb.push(" AND (state_locked_until IS NULL OR state_locked_until <= ");
        qb.push_bind(now);
        qb.push(")");

        if let Some(age) = query.min_state_age {
            let cutoff = chrono::Duration::from_std(age)
                .ok()
                .and_then(|age| now.checked_sub_signed(age))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            qb.push(" AND state_changed <= ");
            qb.push_bind(cutoff);
        }
    }

    qb.push(") AS due WHERE (state_attempted IS NULL OR due_at <= ");
    qb.push_bind(now);
    qb.push(") ORDER BY due_at ASC, created_at ASC LIMIT ");
    qb.push_bind(limit.min(MAX_LIST_LIMIT) as i64);
    qb
}

/// Record latency and error metrics for one store operation
async fn timed<T, F>(operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let result = fut.await;
    let elapsed = start.elapsed();

    DB_OPERATION_DURATION
        .with_label_values(&[operation])
        .observe(elapsed.as_secs_f64());

    // Log slow operations (>100ms)
    if elapsed.as_millis() > 100 {
        warn!(
            operation = operation,
            duration_ms = elapsed.as_millis() as u64,
            "Slow database operation detected"
        );
    }

    if let Err(e) = &result {
        DB_ERRORS_TOTAL
            .with_label_values(&[operation, error_kind(e)])
            .inc();
    }

    result
}

fn error_kind(err: &crate::Error) -> &'static str {
    match err {
        crate::Error::AlreadyExists(_) => "unique_violation",
        crate::Error::PoolExhausted(_) => "pool_exhausted",
        crate::Error::ConnectionFailed(_) => "connection",
        crate::Error::ValidationError(_) => "validation",
        _ => "other",
    }
}

/// Map sqlx errors to storage errors by SQLSTATE
fn map_db_error(err: sqlx::Error) -> crate::Error {
    match &err {
        sqlx::Error::PoolTimedOut => {
            error!(error = %err, "Connection pool timed out");
            return crate::Error::PoolExhausted("Connection pool timed out".to_string());
        }
        sqlx::Error::PoolClosed => {
            error!(error = %err, "Connection pool closed");
            return crate::Error::ConnectionFailed("Connection pool closed".to_string());
        }
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            error!(error = %err, "Database connection failed");
            return crate::Error::ConnectionFailed(err.to_string());
        }
        _ => {}
    }

    if let sqlx::Error::Database(db_err) = &err {
        if let Some(code) = db_err.code().as_deref() {
            match code {
                // unique_violation: entity already tracked
                "23505" => {
                    warn!(
                        error_code = code,
                        message = db_err.message(),
                        "Unique constraint violation"
                    );
                    return crate::Error::AlreadyExists(db_err.message().to_string());
                }
                "23502" | "23514" => {
                    warn!(
                        error_code = code,
                        message = db_err.message(),
                        "Constraint violation"
                    );
                    return crate::Error::ValidationError(db_err.message().to_string());
                }
                "53300" => {
                    error!(
                        error_code = code,
                        message = db_err.message(),
                        "Database connection limit reached"
                    );
                    return crate::Error::PoolExhausted(db_err.message().to_string());
                }
                "08006" | "08001" | "08003" | "08004" => {
                    error!(
                        error_code = code,
                        message = db_err.message(),
                        "Database connection failed"
                    );
                    return crate::Error::ConnectionFailed(db_err.message().to_string());
                }
                _ => {
                    error!(
                        error_code = code,
                        message = db_err.message(),
                        "Unexpected database error"
                    );
                }
            }
        }
    }

    error!(error = %err, "Database error");
    crate::Error::Database(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sql_backoff_matches_policy() {
        let policies = [
            RetryPolicy::default(),
            RetryPolicy::fixed(Duration::from_secs(7), 5),
            RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(300), 50),
            RetryPolicy {
                strategy: RetryStrategy::None,
                ..Default::default()
            },
            RetryPolicy {
                backoff_multiplier: 3.5,
                ..Default::default()
            },
        ];

        for policy in &policies {
            let sql = SqlBackoff::from_policy(policy);
            for attempt in 0..200u32 {
                let expected = policy.backoff(attempt).as_secs_f64();
                let actual = sql.delay_secs(attempt);
                assert!(
                    (expected - actual).abs() < 1e-6,
                    "attempt {} of {:?}: expected {}, got {}",
                    attempt,
                    policy.strategy,
                    expected,
                    actual
                );
            }
        }
    }

    #[test]
    fn test_sql_backoff_reaches_cap_for_slow_growth() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_secs(86_400),
            backoff_multiplier: 1.000_001,
            ..Default::default()
        };
        let sql = SqlBackoff::from_policy(&policy);
        assert!((sql.delay_secs(u32::MAX) - 86_400.0).abs() < 1e-6);
    }

    #[test]
    fn test_due_query_binds_every_pair() {
        let queries = vec![
            DueQuery::new(
                "identity".into(),
                "outdated".into(),
                RetryPolicy::default(),
            ),
            DueQuery::new("follow".into(), "pending".into(), RetryPolicy::default())
                .with_min_state_age(Duration::from_secs(60)),
        ];
        let qb = build_due_query(&queries, Utc::now(), 16);
        let sql = qb.sql();
        assert_eq!(sql.matches("UNION ALL").count(), 1);
        assert_eq!(sql.matches("FROM stator_entities").count(), 2);
        assert!(sql.contains("AND state_changed <= "));
        assert!(sql.contains("ORDER BY due_at ASC"));
    }
}
