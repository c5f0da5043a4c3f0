use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use super::{Catalog, Ledger};
use crate::models::counter::Counter;
use crate::models::service::Service;
use crate::models::token::{NewToken, StatusChange, TokenFilter, TokenRecord};

const TOKEN_COLUMNS: &str = "token_id, display_number, service_id, assigned_counter_id, status, \
     generation_timestamp, called_timestamp, served_timestamp, skip_count, updated_at";

/// PostgreSQL ledger (`token_history`) and read-only catalog (`services`, `counters`).
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, acquire_timeout: Duration) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Catalog for PgStore {
    async fn get_service(&self, service_id: &str) -> anyhow::Result<Option<Service>> {
        let row = sqlx::query_as::<_, Service>(
            "SELECT service_id, name, avg_duration_minutes, is_active FROM services WHERE service_id = $1",
        )
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_services(&self) -> anyhow::Result<Vec<Service>> {
        let rows = sqlx::query_as::<_, Service>(
            "SELECT service_id, name, avg_duration_minutes, is_active FROM services ORDER BY service_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_counter(&self, counter_id: i32) -> anyhow::Result<Option<Counter>> {
        let row = sqlx::query_as::<_, Counter>(
            "SELECT counter_id, name, supported_service_ids, is_open, operator_name FROM counters WHERE counter_id = $1",
        )
        .bind(counter_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_counters(&self) -> anyhow::Result<Vec<Counter>> {
        let rows = sqlx::query_as::<_, Counter>(
            "SELECT counter_id, name, supported_service_ids, is_open, operator_name FROM counters ORDER BY counter_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl Ledger for PgStore {
    async fn insert_token(&self, token: &NewToken) -> anyhow::Result<TokenRecord> {
        let sql = format!(
            r#"INSERT INTO token_history
                   (token_id, display_number, service_id, assigned_counter_id, status, generation_timestamp, skip_count, updated_at)
               VALUES ($1, $2, $3, $4, 'pending', $5, 0, $5)
               RETURNING {}"#,
            TOKEN_COLUMNS
        );
        let row = sqlx::query_as::<_, TokenRecord>(&sql)
            .bind(&token.token_id)
            .bind(&token.display_number)
            .bind(&token.service_id)
            .bind(token.assigned_counter_id)
            .bind(token.generation_timestamp)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn delete_token(&self, token_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM token_history WHERE token_id = $1")
            .bind(token_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_token(&self, token_id: &str) -> anyhow::Result<Option<TokenRecord>> {
        let sql = format!("SELECT {} FROM token_history WHERE token_id = $1", TOKEN_COLUMNS);
        let row = sqlx::query_as::<_, TokenRecord>(&sql)
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn apply(
        &self,
        token_id: &str,
        change: &StatusChange,
    ) -> anyhow::Result<Option<TokenRecord>> {
        let allowed: Vec<String> = change
            .allowed_from()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        // Single conditional UPDATE: the status guard and the write are one
        // atomic statement, so two operators racing on the same token cannot
        // both win.
        let row = match change {
            StatusChange::Call { counter_id, at } | StatusChange::Recall { counter_id, at } => {
                let sql = format!(
                    r#"UPDATE token_history
                       SET status = 'called', called_timestamp = $2, assigned_counter_id = $3, updated_at = $2
                       WHERE token_id = $1 AND status = ANY($4)
                       RETURNING {}"#,
                    TOKEN_COLUMNS
                );
                sqlx::query_as::<_, TokenRecord>(&sql)
                    .bind(token_id)
                    .bind(at)
                    .bind(counter_id)
                    .bind(&allowed)
                    .fetch_optional(&self.pool)
                    .await?
            }
            StatusChange::Serve { at } => {
                let sql = format!(
                    r#"UPDATE token_history
                       SET status = 'served', served_timestamp = $2, updated_at = $2
                       WHERE token_id = $1 AND status = ANY($3)
                       RETURNING {}"#,
                    TOKEN_COLUMNS
                );
                sqlx::query_as::<_, TokenRecord>(&sql)
                    .bind(token_id)
                    .bind(at)
                    .bind(&allowed)
                    .fetch_optional(&self.pool)
                    .await?
            }
            StatusChange::Skip { at } => {
                let sql = format!(
                    r#"UPDATE token_history
                       SET status = 'skipped', skip_count = skip_count + 1, updated_at = $2
                       WHERE token_id = $1 AND status = ANY($3)
                       RETURNING {}"#,
                    TOKEN_COLUMNS
                );
                sqlx::query_as::<_, TokenRecord>(&sql)
                    .bind(token_id)
                    .bind(at)
                    .bind(&allowed)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };
        Ok(row)
    }

    async fn list_pending(&self) -> anyhow::Result<Vec<TokenRecord>> {
        let sql = format!(
            "SELECT {} FROM token_history WHERE status = 'pending' ORDER BY generation_timestamp ASC, token_id ASC",
            TOKEN_COLUMNS
        );
        let rows = sqlx::query_as::<_, TokenRecord>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn current_called(&self, counter_id: i32) -> anyhow::Result<Option<TokenRecord>> {
        let sql = format!(
            r#"SELECT {} FROM token_history
               WHERE assigned_counter_id = $1 AND status = 'called'
               ORDER BY called_timestamp DESC NULLS LAST
               LIMIT 1"#,
            TOKEN_COLUMNS
        );
        let row = sqlx::query_as::<_, TokenRecord>(&sql)
            .bind(counter_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_tokens(&self, filter: &TokenFilter) -> anyhow::Result<Vec<TokenRecord>> {
        let sql = format!(
            r#"SELECT {} FROM token_history
               WHERE ($1::varchar IS NULL OR status = $1)
                 AND ($2::int4 IS NULL OR assigned_counter_id = $2)
                 AND ($3::text IS NULL OR token_id LIKE $3 || '%')
               ORDER BY generation_timestamp DESC, token_id DESC
               LIMIT $4"#,
            TOKEN_COLUMNS
        );
        let rows = sqlx::query_as::<_, TokenRecord>(&sql)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.counter_id)
            .bind(filter.id_prefix())
            .bind(filter.limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn max_daily_sequence(&self, date: NaiveDate) -> anyhow::Result<u64> {
        let max: i64 = sqlx::query_scalar(
            r#"SELECT COALESCE(MAX(split_part(token_id, '-', 2)::bigint), 0)
               FROM token_history
               WHERE token_id LIKE $1 || '-%'
                 AND split_part(token_id, '-', 2) ~ '^[0-9]+$'"#,
        )
        .bind(date.format("%Y%m%d").to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(max.max(0) as u64)
    }
}
