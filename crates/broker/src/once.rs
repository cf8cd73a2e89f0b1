use std::time::Duration;

use anyhow::Context as _;
use redis::aio::MultiplexedConnection;
use tracing::{debug, error};

use crate::config::OnceConfig;

/// Idempotency guard backed by a shared key/value store: at most one
/// in-flight request per request id, across every broker instance sharing
/// the store.
pub struct OnceGuard {
    conn: MultiplexedConnection,
    prefix: String,
    timeout: Duration,
}

/// A claim on a request id. Dropping the lease deletes the claim; the store
/// side expiry bounds the damage if the delete never lands.
pub struct OnceLease {
    conn: MultiplexedConnection,
    key: String,
}

impl OnceGuard {
    /// Connect eagerly; configuring the middleware implies the store must be
    /// reachable.
    pub async fn connect(config: &OnceConfig) -> anyhow::Result<Self> {
        let url = config.redis_url();
        let client = redis::Client::open(url.as_str()).context("invalid redis url")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("connect to redis")?;
        Ok(Self {
            conn,
            prefix: config.key_prefix(),
            timeout: config.timeout(),
        })
    }

    /// Try to claim `id`. `None` means another request with the same id is
    /// currently in flight.
    pub async fn acquire(&self, id: &str) -> Result<Option<OnceLease>, redis::RedisError> {
        let key = format!("{}{}", self.prefix, id);
        let mut conn = self.conn.clone();
        let claimed: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg("_")
            .arg("NX")
            .arg("EX")
            .arg(self.timeout.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        if claimed.is_none() {
            return Ok(None);
        }
        debug!(key = %key, "request id claimed");
        Ok(Some(OnceLease {
            conn: self.conn.clone(),
            key,
        }))
    }
}

impl Drop for OnceLease {
    fn drop(&mut self) {
        let mut conn = self.conn.clone();
        let key = std::mem::take(&mut self.key);
        tokio::spawn(async move {
            let released: Result<(), redis::RedisError> =
                redis::cmd("DEL").arg(&key).query_async(&mut conn).await;
            if let Err(err) = released {
                error!(key = %key, error = %err, "failed to release idempotency claim");
            }
        });
    }
}
