//! Persistence adapter: sessions, audit events, API keys, tenants, and the
//! pipeline-event log.
//!
//! All reads and writes of one request run through the same pool, which is
//! what gives read-your-writes inside a request. Writes are per-operation;
//! there are no cross-request transactions. The adapter can run disabled
//! (no pool), in which case reads return empty and writes are no-ops — the
//! in-memory stores own the hot state either way.

use crate::config::DatabaseConfig;
use crate::models::{ApiKeyRecord, AuditEvent, Session};
use crate::response::PipelineEvent;
use sqlx::{postgres::PgPoolOptions, PgPool};

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await
}

pub async fn health_check(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    Ok(row.0)
}

#[derive(Clone)]
pub struct Persistence {
    pool: Option<PgPool>,
}

impl Persistence {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Some(pool) }
    }

    /// Adapter with no backing store. Used by tests and by degraded
    /// deployments; every write becomes a no-op and every read comes back
    /// empty.
    pub fn disabled() -> Self {
        Self { pool: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    pub async fn health_check(&self) -> Result<String, sqlx::Error> {
        match &self.pool {
            Some(pool) => health_check(pool).await,
            None => Err(sqlx::Error::PoolClosed),
        }
    }

    // ------------------------------------------------------------------
    // API keys
    // ------------------------------------------------------------------

    pub async fn fetch_api_key_by_hash(
        &self,
        hashed_secret: &str,
    ) -> Result<Option<ApiKeyRecord>, sqlx::Error> {
        let Some(pool) = &self.pool else {
            return Ok(None);
        };
        sqlx::query_as::<_, ApiKeyRecord>(
            r#"
            SELECT id, hashed_secret, role, tenant, display_name, limits,
                   created_at, expires_at, revoked_at
            FROM api_keys
            WHERE hashed_secret = $1
            "#,
        )
        .bind(hashed_secret)
        .fetch_optional(pool)
        .await
    }

    pub async fn upsert_api_key(&self, record: &ApiKeyRecord) -> Result<(), sqlx::Error> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };
        sqlx::query(
            r#"
            INSERT INTO api_keys
                (id, hashed_secret, role, tenant, display_name, limits,
                 created_at, expires_at, revoked_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                hashed_secret = EXCLUDED.hashed_secret,
                role = EXCLUDED.role,
                tenant = EXCLUDED.tenant,
                display_name = EXCLUDED.display_name,
                limits = EXCLUDED.limits,
                expires_at = EXCLUDED.expires_at,
                revoked_at = EXCLUDED.revoked_at
            "#,
        )
        .bind(&record.id)
        .bind(&record.hashed_secret)
        .bind(&record.role)
        .bind(&record.tenant)
        .bind(&record.display_name)
        .bind(&record.limits)
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(record.revoked_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn revoke_api_key(&self, key_id: &str) -> Result<bool, sqlx::Error> {
        let Some(pool) = &self.pool else {
            return Ok(false);
        };
        let result = sqlx::query(
            "UPDATE api_keys SET revoked_at = NOW() WHERE id = $1 AND revoked_at IS NULL",
        )
        .bind(key_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_api_keys(&self) -> Result<Vec<ApiKeyRecord>, sqlx::Error> {
        let Some(pool) = &self.pool else {
            return Ok(Vec::new());
        };
        sqlx::query_as::<_, ApiKeyRecord>(
            r#"
            SELECT id, hashed_secret, role, tenant, display_name, limits,
                   created_at, expires_at, revoked_at
            FROM api_keys
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(pool)
        .await
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub async fn upsert_session(&self, session: &Session) -> Result<(), sqlx::Error> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };
        sqlx::query(
            r#"
            INSERT INTO sessions
                (id, tenant, user_id, lang, budget_tokens,
                 created_at, last_activity, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                tenant = EXCLUDED.tenant,
                user_id = EXCLUDED.user_id,
                lang = EXCLUDED.lang,
                budget_tokens = EXCLUDED.budget_tokens,
                last_activity = EXCLUDED.last_activity,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&session.id)
        .bind(&session.tenant)
        .bind(&session.user_id)
        .bind(&session.lang)
        .bind(session.budget_tokens)
        .bind(session.created_at)
        .bind(session.last_activity)
        .bind(session.expires_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), sqlx::Error> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(session_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tenants
    // ------------------------------------------------------------------

    pub async fn fetch_tenant_limit(&self, tenant: &str) -> Result<Option<i64>, sqlx::Error> {
        let Some(pool) = &self.pool else {
            return Ok(None);
        };
        sqlx::query_scalar::<_, i64>("SELECT quota_limit FROM tenants WHERE id = $1")
            .bind(tenant)
            .fetch_optional(pool)
            .await
    }

    pub async fn upsert_tenant_limit(&self, tenant: &str, limit: i64) -> Result<(), sqlx::Error> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };
        sqlx::query(
            r#"
            INSERT INTO tenants (id, quota_limit, created_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (id) DO UPDATE SET quota_limit = EXCLUDED.quota_limit
            "#,
        )
        .bind(tenant)
        .bind(limit)
        .execute(pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Audit & pipeline events (best-effort: a down database must never
    // fail a request that already has a verdict)
    // ------------------------------------------------------------------

    pub async fn record_audit(&self, event: &AuditEvent) {
        let Some(pool) = &self.pool else {
            return;
        };
        let result = sqlx::query(
            r#"
            INSERT INTO audit_events
                (id, tenant, key_id, action, code, trace_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id)
        .bind(&event.tenant)
        .bind(&event.key_id)
        .bind(&event.action)
        .bind(&event.code)
        .bind(&event.trace_id)
        .bind(event.created_at)
        .execute(pool)
        .await;
        if let Err(e) = result {
            tracing::warn!("audit write failed (continuing): {}", e);
        }
    }

    pub async fn log_pipeline_event(&self, event: &PipelineEvent) {
        let Some(pool) = &self.pool else {
            return;
        };
        let result = sqlx::query(
            r#"
            INSERT INTO pipeline_events
                (session_id, seq, event_type, eye, data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&event.session_id)
        .bind(event.seq as i64)
        .bind(&event.event_type)
        .bind(&event.eye)
        .bind(&event.data)
        .bind(event.ts)
        .execute(pool)
        .await;
        if let Err(e) = result {
            tracing::warn!("pipeline event write failed (continuing): {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuditEvent;

    #[tokio::test]
    async fn disabled_adapter_reads_empty_and_writes_nothing() {
        let persistence = Persistence::disabled();
        assert!(!persistence.is_enabled());
        assert!(persistence.health_check().await.is_err());
        assert!(persistence
            .fetch_api_key_by_hash("deadbeef")
            .await
            .unwrap()
            .is_none());
        assert!(persistence.list_api_keys().await.unwrap().is_empty());
        assert!(persistence
            .fetch_tenant_limit("acme")
            .await
            .unwrap()
            .is_none());
        // Best-effort writes must not error either.
        persistence
            .record_audit(&AuditEvent::new(None, None, "validate", "OK_ALL", "t-1"))
            .await;
    }
}
