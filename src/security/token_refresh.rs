use std::future::Future;

use chrono::Duration as TtlDuration;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::{GateError, GateResult};
use crate::security::token_cache::Refreshed;

/// Seconds shaved off an upstream `expires_in` for credentials we fetched.
pub const REFRESH_MARGIN_SECS: i64 = 200;
/// Seconds shaved off an `expires_in` handed to us by the caller.
pub const SET_MARGIN_SECS: i64 = 60;

/// A credential as issued upstream, before any safety margin is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub value: String,
    pub expires_in: i64,
}

impl Credential {
    pub fn new(value: impl Into<String>, expires_in: i64) -> Self {
        Self {
            value: value.into(),
            expires_in,
        }
    }

    /// Cache entry for a credential we fetched ourselves.
    pub fn into_refreshed(self) -> Refreshed {
        Refreshed::new(self.value, fetched_ttl(self.expires_in))
    }
}

pub fn fetched_ttl(expires_in: i64) -> TtlDuration {
    TtlDuration::seconds(expires_in - REFRESH_MARGIN_SECS)
}

pub fn injected_ttl(expires_in: i64) -> TtlDuration {
    TtlDuration::seconds(expires_in - SET_MARGIN_SECS)
}

/// Run `op`; if it fails with an expired credential, hand the error to
/// `invalidate` and run `op` exactly once more.
pub async fn retry_once_on_expired<T, Op, Fut, Inv>(mut op: Op, invalidate: Inv) -> GateResult<T>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = GateResult<T>>,
    Inv: FnOnce(&GateError),
{
    match op().await {
        Err(err) if err.is_credential_expired() => {
            debug!(code = err.code(), "credential rejected upstream, retrying once");
            invalidate(&err);
            op().await
        }
        other => other,
    }
}

/// Background task that keeps every engine's access token warm.
///
/// Runs every `interval` (+ 5-10s jitter). Failures are logged and retried on
/// the next tick.
pub fn spawn_token_prewarm(engines: Vec<Engine>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let jitter = {
                use rand::Rng;
                rand::thread_rng().gen_range(5..10)
            };
            sleep(interval + Duration::from_secs(jitter)).await;

            for engine in &engines {
                match engine.access_token().await {
                    Ok(_) => {
                        debug!(app_id = %engine.app_id(), "access token warm");
                    }
                    Err(err) => {
                        warn!(
                            app_id = %engine.app_id(),
                            error = %err,
                            "Failed to pre-warm access token (will retry)"
                        );
                    }
                }
            }
            info!(engines = engines.len(), "credential pre-warm pass complete");
        }
    })
}
