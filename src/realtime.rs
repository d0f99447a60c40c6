//! Realtime configuration store
//!
//! Postgres rows the telephony engine polls to resolve dynamic SIP
//! endpoints (endpoint/AOR/auth share one id), plus the push-token
//! registry and a best-effort call log.

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::NoTls;
use tracing::{debug, info};

use crate::config::Config;
use crate::{Error, Result};

/// Prefix of endpoints minted for inbound doorphone calls
pub const INBOUND_PREFIX: &str = "tmp_";
/// Prefix of endpoints minted for client-initiated outbound calls
pub const OUTBOUND_PREFIX: &str = "out_";

pub const TEMPLATE_DOMOPHONE: &str = "tpl_domophone";
pub const TEMPLATE_CLIENT: &str = "tpl_client";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ps_aors (
    id TEXT PRIMARY KEY,
    max_contacts INTEGER,
    contact TEXT
);
CREATE TABLE IF NOT EXISTS ps_auths (
    id TEXT PRIMARY KEY,
    auth_type TEXT,
    username TEXT,
    password TEXT
);
CREATE TABLE IF NOT EXISTS ps_endpoints (
    id TEXT PRIMARY KEY,
    transport TEXT,
    aors TEXT,
    auth TEXT,
    context TEXT,
    disallow TEXT,
    allow TEXT,
    mailboxes TEXT,
    templates TEXT,
    direct_media TEXT,
    force_rport TEXT,
    rewrite_contact TEXT,
    rtp_symmetric TEXT
);
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS push_tokens (
    id SERIAL PRIMARY KEY,
    user_id TEXT NOT NULL,
    token TEXT NOT NULL,
    platform TEXT NOT NULL,
    device_id TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (user_id, token)
);
CREATE TABLE IF NOT EXISTS calls (
    id SERIAL PRIMARY KEY,
    call_id TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    endpoint_id TEXT NOT NULL,
    started_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

/// One disposable SIP account, written as matching AOR/auth/endpoint rows
#[derive(Debug, Clone)]
pub struct EphemeralEndpoint {
    pub id: String,
    pub username: String,
    pub password: String,
    pub context: String,
    pub template_id: String,
}

/// A registered device for one user
#[derive(Debug, Clone)]
pub struct PushTarget {
    pub token: String,
    pub platform: String,
}

#[derive(Clone)]
pub struct RealtimeStore {
    pool: Pool,
}

impl RealtimeStore {
    pub async fn connect(config: &Config) -> Result<Self> {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&config.postgres_host)
            .port(config.postgres_port)
            .dbname(&config.postgres_db)
            .user(&config.postgres_user)
            .password(&config.postgres_password);

        let manager = Manager::from_config(
            pg,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(16)
            .build()
            .map_err(|e| Error::Pool(e.to_string()))?;

        Ok(Self { pool })
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.pool.get().await.map_err(|e| Error::Pool(e.to_string()))
    }

    /// Idempotently create the endpoint, push-registry and call-log tables.
    pub async fn ensure_schema(&self) -> Result<()> {
        let client = self.client().await?;
        client.batch_execute(SCHEMA).await?;
        info!("Realtime schema ensured");
        Ok(())
    }

    /// Upsert the two endpoint templates. They differ only in their codec
    /// allow-lists; concrete endpoints reference them via `templates`.
    pub async fn ensure_templates(&self) -> Result<()> {
        let client = self.client().await?;
        for (id, allow) in [
            (TEMPLATE_DOMOPHONE, "ulaw,alaw,h264"),
            (TEMPLATE_CLIENT, "ulaw,alaw,opus,h264"),
        ] {
            client
                .execute(
                    r#"
                    INSERT INTO ps_endpoints (
                        id, disallow, allow, direct_media,
                        force_rport, rewrite_contact, rtp_symmetric
                    ) VALUES ($1, 'all', $2, 'no', 'yes', 'yes', 'yes')
                    ON CONFLICT (id) DO UPDATE SET
                        disallow = EXCLUDED.disallow,
                        allow = EXCLUDED.allow,
                        direct_media = EXCLUDED.direct_media,
                        force_rport = EXCLUDED.force_rport,
                        rewrite_contact = EXCLUDED.rewrite_contact,
                        rtp_symmetric = EXCLUDED.rtp_symmetric
                    "#,
                    &[&id, &allow],
                )
                .await?;
        }
        info!("Endpoint templates ensured");
        Ok(())
    }

    /// Insert the AOR, auth and endpoint rows for one disposable account.
    /// Re-running with the same id updates non-key columns, never
    /// duplicates.
    pub async fn create_ephemeral_endpoint(&self, endpoint: &EphemeralEndpoint) -> Result<()> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;

        tx.execute(
            r#"
            INSERT INTO ps_aors (id, max_contacts) VALUES ($1, 1)
            ON CONFLICT (id) DO UPDATE SET max_contacts = EXCLUDED.max_contacts
            "#,
            &[&endpoint.id],
        )
        .await?;

        tx.execute(
            r#"
            INSERT INTO ps_auths (id, auth_type, username, password)
            VALUES ($1, 'userpass', $2, $3)
            ON CONFLICT (id) DO UPDATE SET
                auth_type = EXCLUDED.auth_type,
                username = EXCLUDED.username,
                password = EXCLUDED.password
            "#,
            &[&endpoint.id, &endpoint.username, &endpoint.password],
        )
        .await?;

        tx.execute(
            r#"
            INSERT INTO ps_endpoints (id, aors, auth, context, templates)
            VALUES ($1, $1, $1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET
                aors = EXCLUDED.aors,
                auth = EXCLUDED.auth,
                context = EXCLUDED.context,
                templates = EXCLUDED.templates
            "#,
            &[&endpoint.id, &endpoint.context, &endpoint.template_id],
        )
        .await?;

        tx.commit().await?;
        debug!(endpoint = %endpoint.id, template = %endpoint.template_id, "Ephemeral endpoint created");
        Ok(())
    }

    /// Remove the endpoint, auth and AOR rows in that order. Safe on a
    /// missing id.
    pub async fn delete_ephemeral_endpoint(&self, id: &str) -> Result<()> {
        let client = self.client().await?;
        client
            .execute("DELETE FROM ps_endpoints WHERE id = $1", &[&id])
            .await?;
        client
            .execute("DELETE FROM ps_auths WHERE id = $1", &[&id])
            .await?;
        client
            .execute("DELETE FROM ps_aors WHERE id = $1", &[&id])
            .await?;
        Ok(())
    }

    /// Ids of every disposable endpoint currently visible to the engine.
    pub async fn list_ephemeral_endpoints(&self) -> Result<Vec<String>> {
        let client = self.client().await?;
        let rows = client
            .query(
                r"SELECT id FROM ps_endpoints WHERE id LIKE 'tmp\_%' OR id LIKE 'out\_%'",
                &[],
            )
            .await?;
        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    pub async fn ensure_user(&self, id: &str) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO users (id) VALUES ($1) ON CONFLICT (id) DO NOTHING",
                &[&id],
            )
            .await?;
        Ok(())
    }

    /// Bind a device push token to a user; unique on (user_id, token).
    pub async fn save_push_token(
        &self,
        user_id: &str,
        token: &str,
        platform: &str,
        device_id: Option<&str>,
    ) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                r#"
                INSERT INTO push_tokens (user_id, token, platform, device_id)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (user_id, token) DO UPDATE SET
                    platform = EXCLUDED.platform,
                    device_id = EXCLUDED.device_id,
                    updated_at = now()
                "#,
                &[&user_id, &token, &platform, &device_id],
            )
            .await?;
        Ok(())
    }

    pub async fn list_push_tokens(&self, user_id: &str) -> Result<Vec<PushTarget>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT token, platform FROM push_tokens WHERE user_id = $1 ORDER BY updated_at DESC",
                &[&user_id],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| PushTarget {
                token: row.get("token"),
                platform: row.get("platform"),
            })
            .collect())
    }

    /// Append one call-log row. Callers treat failure as non-fatal.
    pub async fn record_call(
        &self,
        call_id: &str,
        channel_id: &str,
        endpoint_id: &str,
    ) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO calls (call_id, channel_id, endpoint_id) VALUES ($1, $2, $3)",
                &[&call_id, &channel_id, &endpoint_id],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposable_prefixes_are_distinct() {
        assert_ne!(INBOUND_PREFIX, OUTBOUND_PREFIX);
        assert!(SCHEMA.contains("ps_endpoints"));
        assert!(SCHEMA.contains("UNIQUE (user_id, token)"));
    }
}
