use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn signature_invalid(&self, app_id: &str, channel: &str) {
        warn!(target: "audit", event = "signature_invalid", app_id, channel);
    }

    pub fn decrypt_failed(&self, app_id: &str, reason: &str) {
        warn!(target: "audit", event = "decrypt_failed", app_id, reason);
    }

    pub fn credential_refreshed(&self, app_id: &str, credential: &str, ttl_secs: i64) {
        info!(target: "audit", event = "credential_refreshed", app_id, credential, ttl_secs);
    }

    pub fn credential_invalidated(&self, app_id: &str, credential: &str, code: i64) {
        warn!(target: "audit", event = "credential_invalidated", app_id, credential, code);
    }

    pub fn refresh_failed(&self, app_id: &str, credential: &str, error_msg: &str) {
        warn!(target: "audit", event = "refresh_failed", app_id, credential, error = error_msg);
    }

    pub fn pay_notify_rejected(&self, mch_id: &str, reason: &str) {
        warn!(target: "audit", event = "pay_notify_rejected", mch_id, reason);
    }

    pub fn component_ticket_received(&self, app_id: &str) {
        info!(target: "audit", event = "component_ticket_received", app_id);
    }
}
