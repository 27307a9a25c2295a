//! On-disk snapshot of live credentials so a restart does not refetch them.
//!
//! Layout: `{"<app_id>|<kind>": {"<name>": {"content", "SaveTime", "OutTime"}}}`
//! where `OutTime` is the remaining lifetime in seconds at `SaveTime`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::Engine;
use crate::security::token_cache::SnapshotEntry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotItem {
    pub content: String,
    #[serde(rename = "SaveTime")]
    pub save_time: i64,
    #[serde(rename = "OutTime")]
    pub out_time: i64,
}

impl SnapshotItem {
    /// Seconds left at `now`.
    pub fn remaining(&self, now: i64) -> i64 {
        self.out_time - (now - self.save_time)
    }
}

pub type SnapshotFile = BTreeMap<String, BTreeMap<String, SnapshotItem>>;

pub fn read(path: &Path) -> Result<SnapshotFile> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading snapshot {}", path.display()))?;
    serde_json::from_str(&raw).context("parsing snapshot JSON")
}

/// Entries of `file` still alive at `now`, keyed by namespace.
pub fn live_entries(file: &SnapshotFile, now: i64) -> Vec<(String, SnapshotEntry)> {
    let mut out = Vec::new();
    for (namespace, items) in file {
        if !valid_namespace(namespace) {
            continue;
        }
        for (key, item) in items {
            let remaining = item.remaining(now);
            if remaining > 0 {
                out.push((
                    namespace.clone(),
                    SnapshotEntry {
                        key: key.clone(),
                        value: item.content.clone(),
                        remaining_secs: remaining,
                    },
                ));
            }
        }
    }
    out
}

fn valid_namespace(namespace: &str) -> bool {
    matches!(namespace.split_once('|'), Some((app, kind)) if !app.is_empty() && !kind.is_empty())
}

/// Rehydrate engine caches from `path`; returns the number of entries loaded.
pub fn load(path: &Path, engines: &[Engine]) -> Result<usize> {
    let file = read(path)?;
    let now = Utc::now().timestamp();
    let mut loaded = 0;
    for engine in engines {
        let cache = engine.cache();
        let entries = live_entries(&file, now)
            .into_iter()
            .filter(|(ns, _)| ns == cache.namespace())
            .map(|(_, entry)| entry);
        let n = cache.import(entries);
        debug!(namespace = %cache.namespace(), entries = n, "snapshot restored");
        loaded += n;
    }
    info!(path = %path.display(), entries = loaded, "credential snapshot loaded");
    Ok(loaded)
}

/// Write every engine's live credentials to `path`.
///
/// Namespaces of accounts not managed here are carried over from an existing
/// snapshot unchanged.
pub fn save(path: &Path, engines: &[Engine]) -> Result<usize> {
    let mut file = if path.exists() {
        read(path).unwrap_or_default()
    } else {
        SnapshotFile::new()
    };
    let now = Utc::now().timestamp();
    let mut saved = 0;
    for engine in engines {
        let cache = engine.cache();
        let items: BTreeMap<String, SnapshotItem> = cache
            .export()
            .into_iter()
            .map(|e| {
                (
                    e.key,
                    SnapshotItem {
                        content: e.value,
                        save_time: now,
                        out_time: e.remaining_secs,
                    },
                )
            })
            .collect();
        saved += items.len();
        file.insert(cache.namespace().to_string(), items);
    }

    let json = serde_json::to_string_pretty(&file).context("serializing snapshot")?;
    fs::write(path, json).with_context(|| format!("writing snapshot {}", path.display()))?;
    info!(path = %path.display(), entries = saved, "credential snapshot saved");
    Ok(saved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{MpAccount, UpstreamClient, UpstreamHosts};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn engine(app_id: &str) -> Engine {
        let client =
            UpstreamClient::new(UpstreamHosts::default(), std::time::Duration::from_secs(1)).unwrap();
        Engine::new(
            Arc::new(MpAccount {
                app_id: app_id.into(),
                ..MpAccount::default()
            }),
            client,
        )
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wechat.json");

        let a = engine("wxa");
        a.set_access_token("token-a", 7200);
        assert_eq!(save(&path, &[a]).unwrap(), 1);

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["wxa|mp"]["Token"]["content"], "token-a");
        assert!(raw["wxa|mp"]["Token"]["OutTime"].as_i64().unwrap() > 7000);

        let restored = engine("wxa");
        assert_eq!(load(&path, &[restored.clone()]).unwrap(), 1);
        assert_eq!(restored.cache().get("Token").as_deref(), Some("token-a"));
    }

    #[test]
    fn test_load_skips_lapsed_and_foreign_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wechat.json");
        let now = Utc::now().timestamp();
        let body = serde_json::json!({
            "wxa|mp": {
                "Token": {"content": "old", "SaveTime": now - 7200, "OutTime": 7000},
                "JsapiTicket": {"content": "fresh", "SaveTime": now - 10, "OutTime": 600}
            },
            "wxb|mp": {"Token": {"content": "other", "SaveTime": now, "OutTime": 600}},
            "broken": {"Token": {"content": "x", "SaveTime": now, "OutTime": 600}}
        });
        fs::write(&path, body.to_string()).unwrap();

        let a = engine("wxa");
        assert_eq!(load(&path, &[a.clone()]).unwrap(), 1);
        assert_eq!(a.cache().get("Token"), None);
        assert_eq!(a.cache().get("JsapiTicket").as_deref(), Some("fresh"));

        let file = read(&path).unwrap();
        assert_eq!(live_entries(&file, now).len(), 2);
    }

    #[test]
    fn test_save_keeps_foreign_namespaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wechat.json");
        let now = Utc::now().timestamp();
        fs::write(
            &path,
            serde_json::json!({"wxz|qy": {"Token": {"content": "z", "SaveTime": now, "OutTime": 100}}})
                .to_string(),
        )
        .unwrap();

        save(&path, &[engine("wxa")]).unwrap();
        let file = read(&path).unwrap();
        assert!(file.contains_key("wxz|qy"));
        assert!(file["wxa|mp"].is_empty());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(load(Path::new("/nonexistent/wechat.json"), &[]).is_err());
    }
}
