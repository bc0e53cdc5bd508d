//! PostgreSQL client.
//!
//! Statement timeouts only stop this side from waiting. A statement that has
//! already been sent may still complete (or fail) on the server afterwards.

use crate::config::{ConnectionConfig, ExecutionConfig};
use crate::db::{Column, ColumnInfo, DatabaseClient, ForeignKey, QueryResult, Row, Schema, Table, Value};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::BigDecimal;
use sqlx::{Column as _, Decode, Executor, Postgres, Row as _, Type, TypeInfo};
use std::time::Duration;
use tracing::{debug, warn};

const CONNECT_ATTEMPTS: u32 = 3;
const FIRST_RETRY_DELAY: Duration = Duration::from_millis(500);

const COLUMNS_SQL: &str = r#"
    SELECT
        c.table_name::text,
        c.column_name::text,
        c.data_type::text,
        c.is_nullable = 'YES',
        EXISTS (
            SELECT 1
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage k
                ON k.constraint_name = tc.constraint_name
                AND k.table_schema = tc.table_schema
                AND k.table_name = tc.table_name
            WHERE tc.constraint_type = 'PRIMARY KEY'
                AND tc.table_schema = c.table_schema
                AND tc.table_name = c.table_name
                AND k.column_name = c.column_name
        )
    FROM information_schema.columns c
    JOIN information_schema.tables t
        ON t.table_schema = c.table_schema AND t.table_name = c.table_name
    WHERE c.table_schema = 'public' AND t.table_type = 'BASE TABLE'
    ORDER BY c.table_name, c.ordinal_position
"#;

// Column pairs come from conkey/confkey so composite keys keep their order.
const FOREIGN_KEYS_SQL: &str = r#"
    SELECT
        src.relname::text,
        con.conname::text,
        a.attname::text,
        dst.relname::text,
        ra.attname::text
    FROM pg_constraint con
    JOIN pg_class src ON src.oid = con.conrelid
    JOIN pg_namespace n ON n.oid = src.relnamespace
    JOIN pg_class dst ON dst.oid = con.confrelid
    CROSS JOIN LATERAL unnest(con.conkey, con.confkey) WITH ORDINALITY AS k(attnum, refnum, ord)
    JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
    JOIN pg_attribute ra ON ra.attrelid = con.confrelid AND ra.attnum = k.refnum
    WHERE con.contype = 'f' AND n.nspname = 'public'
    ORDER BY src.relname, con.conname, k.ord
"#;

/// (table, column, type, nullable, primary key)
type ColumnRow = (String, String, String, bool, bool);
/// (table, constraint, column, referred table, referred column)
type ForeignKeyRow = (String, String, String, String, String);

#[derive(Debug)]
pub struct PostgresClient {
    pool: PgPool,
    max_rows: usize,
    statement_timeout: Duration,
}

impl PostgresClient {
    pub fn from_pool(pool: PgPool, limits: &ExecutionConfig) -> Self {
        Self {
            pool,
            max_rows: limits.max_rows,
            statement_timeout: limits.statement_timeout(),
        }
    }

    /// Connects, retrying transient failures with doubling delays.
    pub async fn connect(config: &ConnectionConfig, limits: &ExecutionConfig) -> Result<Self> {
        let url = config.to_connection_string()?;
        let mut delay = FIRST_RETRY_DELAY;
        let mut attempt = 1;

        loop {
            let outcome = PgPoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(10))
                .connect(&url)
                .await;

            match outcome {
                Ok(pool) => {
                    debug!(target_db = %config.display_string(), attempt, "Connected to database");
                    return Ok(Self::from_pool(pool, limits));
                }
                Err(e) if attempt < CONNECT_ATTEMPTS && is_transient_error(&e) => {
                    warn!(attempt, error = %e, ?delay, "Database connection failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(map_connection_error(e, config)),
            }
        }
    }

    fn timeout_error(&self) -> GatewayError {
        GatewayError::execution(format!(
            "Statement timed out after {} seconds",
            self.statement_timeout.as_secs()
        ))
    }

    /// Result columns of a statement that produced no rows.
    async fn describe_columns(&self, sql: &str) -> Vec<ColumnInfo> {
        match (&self.pool).describe(sql).await {
            Ok(described) => described
                .columns()
                .iter()
                .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
                .collect(),
            Err(e) => {
                debug!(error = %e, "Could not describe statement");
                Vec::new()
            }
        }
    }

    /// Streams at most `max_rows` rows; the flag says whether more were available.
    async fn fetch_capped(&self, sql: &str) -> std::result::Result<(Vec<PgRow>, bool), sqlx::Error> {
        let mut stream = sqlx::query(sql).fetch(&self.pool);
        let mut rows = Vec::new();
        while let Some(row) = stream.try_next().await? {
            if rows.len() == self.max_rows {
                return Ok((rows, true));
            }
            rows.push(row);
        }
        Ok((rows, false))
    }
}

#[async_trait]
impl DatabaseClient for PostgresClient {
    async fn introspect_schema(&self) -> Result<Schema> {
        let columns: Vec<ColumnRow> = sqlx::query_as(COLUMNS_SQL)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| GatewayError::execution(format!("Failed to read columns: {e}")))?;
        let foreign_keys: Vec<ForeignKeyRow> = sqlx::query_as(FOREIGN_KEYS_SQL)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| GatewayError::execution(format!("Failed to read foreign keys: {e}")))?;

        let schema = assemble_schema(columns, foreign_keys);
        debug!(tables = schema.tables.len(), "Introspected schema");
        Ok(schema)
    }

    async fn execute_query(&self, sql: &str) -> Result<QueryResult> {
        let (rows, more) = tokio::time::timeout(self.statement_timeout, self.fetch_capped(sql))
            .await
            .map_err(|_| self.timeout_error())?
            .map_err(|e| GatewayError::execution(format_query_error(e)))?;

        let columns = match rows.first() {
            Some(first) => first
                .columns()
                .iter()
                .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
                .collect(),
            None => self.describe_columns(sql).await,
        };
        if more {
            warn!(max_rows = self.max_rows, "Result exceeds the row cap, truncating");
        }

        let rows = rows.iter().map(convert_row).collect();
        Ok(QueryResult::capped(columns, rows, more))
    }

    async fn execute_in_transaction(&self, sql: &str) -> Result<QueryResult> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| GatewayError::connection(format!("Failed to begin transaction: {e}")))?;

        let outcome =
            tokio::time::timeout(self.statement_timeout, sqlx::query(sql).execute(&mut *tx)).await;

        match outcome {
            Ok(Ok(done)) => {
                tx.commit()
                    .await
                    .map_err(|e| GatewayError::execution(format_query_error(e)))?;
                debug!(rows_affected = done.rows_affected(), "Transaction committed");
                Ok(QueryResult::affected(done.rows_affected()))
            }
            Ok(Err(e)) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(GatewayError::execution(format_query_error(e)))
            }
            // The dropped transaction rolls back when its connection returns to the pool.
            Err(_) => Err(self.timeout_error()),
        }
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// Groups introspection rows, already ordered by table, into a schema.
fn assemble_schema(columns: Vec<ColumnRow>, foreign_keys: Vec<ForeignKeyRow>) -> Schema {
    let mut tables: Vec<Table> = Vec::new();
    for (table, name, data_type, nullable, primary_key) in columns {
        if tables.last().map(|t| t.name != table).unwrap_or(true) {
            tables.push(Table::new(table));
        }
        if let Some(current) = tables.last_mut() {
            current.columns.push(Column {
                name,
                data_type,
                nullable,
                primary_key,
            });
        }
    }

    let mut current: Option<(String, String)> = None;
    for (table, constraint, column, referred_table, referred_column) in foreign_keys {
        let Some(owner) = tables.iter_mut().find(|t| t.name == table) else {
            continue;
        };
        let key = (table, constraint);
        if current.as_ref() != Some(&key) || owner.foreign_keys.is_empty() {
            owner.foreign_keys.push(ForeignKey {
                referred_table,
                ..ForeignKey::default()
            });
            current = Some(key);
        }
        if let Some(fk) = owner.foreign_keys.last_mut() {
            fk.columns.push(column);
            fk.referred_columns.push(referred_column);
        }
    }

    Schema { tables }
}

fn convert_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .map(|col| convert_value(row, col.ordinal(), col.type_info().name()))
        .collect()
}

fn cell<'r, T>(row: &'r PgRow, index: usize) -> Option<T>
where
    T: Decode<'r, Postgres> + Type<Postgres>,
{
    match row.try_get::<Option<T>, _>(index) {
        Ok(value) => value,
        Err(e) => {
            debug!(index, error = %e, "Could not decode column");
            None
        }
    }
}

fn convert_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    let value = match type_name {
        "BOOL" => cell::<bool>(row, index).map(Value::Bool),
        "INT2" => cell::<i16>(row, index).map(|v| Value::Int(v.into())),
        "INT4" => cell::<i32>(row, index).map(|v| Value::Int(v.into())),
        "INT8" => cell::<i64>(row, index).map(Value::Int),
        "FLOAT4" => cell::<f32>(row, index).map(|v| Value::Float(v.into())),
        "FLOAT8" => cell::<f64>(row, index).map(Value::Float),
        // SUM and AVG come back as NUMERIC.
        "NUMERIC" => cell::<BigDecimal>(row, index).map(|d| Value::from_decimal(d.to_string())),
        "TIMESTAMPTZ" => cell::<chrono::DateTime<chrono::Utc>>(row, index)
            .map(|t| Value::Text(t.to_rfc3339())),
        "TIMESTAMP" => cell::<chrono::NaiveDateTime>(row, index)
            .map(|t| Value::Text(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        "DATE" => cell::<chrono::NaiveDate>(row, index).map(|d| Value::Text(d.to_string())),
        "TIME" => cell::<chrono::NaiveTime>(row, index).map(|t| Value::Text(t.to_string())),
        "UUID" => cell::<uuid::Uuid>(row, index).map(|u| Value::Text(u.to_string())),
        "JSON" | "JSONB" => cell::<serde_json::Value>(row, index).map(Value::Json),
        "BYTEA" => cell::<Vec<u8>>(row, index).map(|bytes| Value::Text(hex_literal(&bytes))),
        _ => cell::<String>(row, index).map(Value::Text),
    };
    value.unwrap_or(Value::Null)
}

/// PostgreSQL's `\x...` hex output for bytea.
fn hex_literal(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Whether a connection failure is worth another attempt.
fn is_transient_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(_) | sqlx::Error::Tls(_) | sqlx::Error::Configuration(_) => false,
        other => {
            let text = other.to_string().to_lowercase();
            ["connection refused", "timed out", "connection reset", "temporarily unavailable"]
                .iter()
                .any(|needle| text.contains(needle))
        }
    }
}

fn map_connection_error(error: sqlx::Error, config: &ConnectionConfig) -> GatewayError {
    let host = config.host.as_deref().unwrap_or("localhost");
    let port = config.port;
    let text = error.to_string().to_lowercase();

    let message = if text.contains("connection refused") || text.contains("could not connect") {
        format!("Cannot connect to {host}:{port}; is the server running?")
    } else if text.contains("authentication failed") {
        format!(
            "Authentication failed for user '{}'",
            config.user.as_deref().unwrap_or("unknown")
        )
    } else if text.contains("does not exist") && text.contains("database") {
        format!(
            "Database '{}' does not exist",
            config.database.as_deref().unwrap_or("unknown")
        )
    } else if text.contains("ssl") || text.contains("tls") {
        "TLS negotiation failed; try adding sslmode=require to the connection string".to_string()
    } else if text.contains("timed out") {
        format!("Connection to {host}:{port} timed out")
    } else {
        error.to_string()
    };
    GatewayError::connection(message)
}

/// Database error text with the server's DETAIL and HINT lines, when present.
fn format_query_error(error: sqlx::Error) -> String {
    let Some(db_error) = error.as_database_error() else {
        return error.to_string();
    };

    let mut message = format!("ERROR: {}", db_error.message());
    if let Some(pg) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
        let extras = [
            ("DETAIL", pg.detail()),
            ("HINT", pg.hint()),
            ("TABLE", pg.table()),
            ("CONSTRAINT", pg.constraint()),
        ];
        for (label, value) in extras {
            if let Some(value) = value {
                message.push_str(&format!("\n  {label}: {value}"));
            }
        }
    }
    message
}
