//! In-memory document store used by tests and store-less development runs.
//!
//! One mutex serializes every operation, which gives the same atomicity the
//! Redis backend gets from server-side scripts. TTLs are tracked against
//! `Instant` so expiry behaviour is observable without a real store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use crate::{DocumentStore, StateError, StateResult};

struct Entry {
    doc: Value,
    expires_at: Instant,
}

impl Entry {
    fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Memory-backed [`DocumentStore`] with the same operation contract as
/// [`crate::RedisStore`].
#[derive(Clone)]
pub struct MemoryStore {
    ttl: Duration,
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Remaining TTL for a session, if it exists and has not expired.
    #[must_use]
    pub fn ttl_remaining(&self, session_id: &str) -> Option<Duration> {
        let map = self.inner.lock().unwrap();
        map.get(session_id)
            .filter(|entry| !entry.expired())
            .map(|entry| entry.expires_at.saturating_duration_since(Instant::now()))
    }

    /// Drop a session outright, simulating key expiry or external deletion.
    pub fn evict(&self, session_id: &str) {
        self.inner.lock().unwrap().remove(session_id);
    }

    /// Raw document value, for assertions.
    #[must_use]
    pub fn document(&self, session_id: &str) -> Option<Value> {
        let map = self.inner.lock().unwrap();
        map.get(session_id)
            .filter(|entry| !entry.expired())
            .map(|entry| entry.doc.clone())
    }

    fn with_entry<T>(
        &self,
        session_id: &str,
        apply: impl FnOnce(&mut Value) -> StateResult<T>,
    ) -> StateResult<T> {
        let mut map = self.inner.lock().unwrap();
        let live = map.get(session_id).is_some_and(|entry| !entry.expired());
        if !live {
            map.remove(session_id);
            return Err(StateError::NotFound(session_id.to_string()));
        }
        let entry = map.get_mut(session_id).expect("checked live");
        let out = apply(&mut entry.doc)?;
        entry.expires_at = Instant::now() + self.ttl;
        Ok(out)
    }
}

fn parse(raw: &str) -> StateResult<Value> {
    serde_json::from_str(raw).map_err(|err| StateError::Serialization(err.to_string()))
}

fn render(doc: &Value) -> String {
    doc.to_string()
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ensure(&self, session_id: &str, initial_json: &str) -> StateResult<String> {
        let initial = parse(initial_json)?;
        let mut map = self.inner.lock().unwrap();
        let absent = !map.get(session_id).is_some_and(|entry| !entry.expired());
        if absent {
            map.insert(
                session_id.to_string(),
                Entry {
                    doc: initial,
                    expires_at: Instant::now() + self.ttl,
                },
            );
        }
        let entry = map.get_mut(session_id).expect("present after ensure");
        entry.expires_at = Instant::now() + self.ttl;
        Ok(render(&entry.doc))
    }

    async fn read(&self, session_id: &str) -> StateResult<String> {
        self.with_entry(session_id, |doc| Ok(render(doc)))
    }

    async fn begin_analysis(
        &self,
        session_id: &str,
        ticker: &str,
        started_at: &str,
    ) -> StateResult<String> {
        self.with_entry(session_id, |doc| {
            doc["current_analysis"] =
                serde_json::json!({ "ticker": ticker, "started_at": started_at });
            doc["last_activity"] = Value::String(started_at.to_string());
            Ok(render(doc))
        })
    }

    async fn append_result(
        &self,
        session_id: &str,
        result_json: &str,
        last_activity: &str,
    ) -> StateResult<String> {
        let result = parse(result_json)?;
        self.with_entry(session_id, |doc| {
            match doc["analysis_results"].as_array_mut() {
                Some(results) => results.push(result),
                None => {
                    return Err(StateError::Serialization(
                        "analysis_results is not an array".to_string(),
                    ))
                }
            }
            doc["last_activity"] = Value::String(last_activity.to_string());
            Ok(render(doc))
        })
    }

    async fn apply_market_update(
        &self,
        session_id: &str,
        prices_json: &str,
        last_activity: &str,
    ) -> StateResult<String> {
        let prices: HashMap<String, f64> =
            serde_json::from_str(prices_json).map_err(|err| {
                StateError::Serialization(err.to_string())
            })?;
        self.with_entry(session_id, |doc| {
            let holdings = doc["holdings"].as_object().cloned().unwrap_or_default();
            let mut total = 0.0;
            for (ticker, shares) in holdings {
                if let (Some(price), Some(count)) = (prices.get(&ticker), shares.as_u64()) {
                    total += price * count as f64;
                }
            }
            doc["total_value"] = serde_json::json!(total);
            doc["last_activity"] = Value::String(last_activity.to_string());
            Ok(render(doc))
        })
    }

    async fn list_sessions(&self) -> StateResult<Vec<String>> {
        let mut map = self.inner.lock().unwrap();
        map.retain(|_, entry| !entry.expired());
        let mut ids: Vec<String> = map.keys().cloned().collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_millis(200);

    fn initial(session_id: &str) -> String {
        serde_json::json!({
            "session_id": session_id,
            "holdings": { "AAPL": 100, "GOOGL": 50, "MSFT": 75 },
            "total_value": 125000.0,
            "current_analysis": null,
            "analysis_results": [],
            "last_activity": "2024-05-01T12:00:00Z",
        })
        .to_string()
    }

    #[tokio::test]
    async fn ensure_is_create_if_absent() {
        let store = MemoryStore::new(TTL);
        let first = store.ensure("s1", &initial("s1")).await.unwrap();

        // A second ensure with different contents must not clobber.
        let other = serde_json::json!({
            "session_id": "s1",
            "holdings": {},
            "total_value": 0.0,
            "current_analysis": null,
            "analysis_results": [],
            "last_activity": "2024-05-02T00:00:00Z",
        })
        .to_string();
        let second = store.ensure("s1", &other).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn read_missing_session_is_not_found() {
        let store = MemoryStore::new(TTL);
        let err = store.read("ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn begin_analysis_sets_marker_and_activity() {
        let store = MemoryStore::new(TTL);
        store.ensure("s1", &initial("s1")).await.unwrap();
        let raw = store
            .begin_analysis("s1", "AAPL", "2024-05-01T13:00:00Z")
            .await
            .unwrap();
        let doc: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["current_analysis"]["ticker"], "AAPL");
        assert_eq!(doc["last_activity"], "2024-05-01T13:00:00Z");
    }

    #[tokio::test]
    async fn append_result_is_append_only() {
        let store = MemoryStore::new(TTL);
        store.ensure("s1", &initial("s1")).await.unwrap();
        for (i, ts) in ["2024-05-01T13:00:01Z", "2024-05-01T13:00:02Z"]
            .iter()
            .enumerate()
        {
            let result = serde_json::json!({
                "ticker": "AAPL",
                "metric": "momentum",
                "value": i as f64,
                "timestamp": ts,
            })
            .to_string();
            store.append_result("s1", &result, ts).await.unwrap();
        }
        let doc = store.document("s1").unwrap();
        let results = doc["analysis_results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["value"], 0.0);
        assert_eq!(results[1]["value"], 1.0);
        assert_eq!(doc["last_activity"], "2024-05-01T13:00:02Z");
    }

    #[tokio::test]
    async fn market_update_recomputes_total_from_holdings() {
        let store = MemoryStore::new(TTL);
        store.ensure("s1", &initial("s1")).await.unwrap();
        let prices = r#"{"AAPL":200.0,"GOOGL":100.0,"MSFT":400.0}"#;
        let raw = store
            .apply_market_update("s1", prices, "2024-05-01T14:00:00Z")
            .await
            .unwrap();
        let doc: Value = serde_json::from_str(&raw).unwrap();
        // 100*200 + 50*100 + 75*400 = 55000
        assert_eq!(doc["total_value"], 55000.0);
    }

    #[tokio::test]
    async fn market_update_skips_unquoted_tickers() {
        let store = MemoryStore::new(TTL);
        store.ensure("s1", &initial("s1")).await.unwrap();
        let raw = store
            .apply_market_update("s1", r#"{"AAPL":100.0}"#, "2024-05-01T14:00:00Z")
            .await
            .unwrap();
        let doc: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["total_value"], 10000.0);
    }

    #[tokio::test]
    async fn mutations_refresh_ttl() {
        let store = MemoryStore::new(TTL);
        store.ensure("s1", &initial("s1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        store.read("s1").await.unwrap();
        let remaining = store.ttl_remaining("s1").unwrap();
        assert!(remaining > Duration::from_millis(150), "ttl was not refreshed");
    }

    #[tokio::test]
    async fn expired_sessions_vanish() {
        let store = MemoryStore::new(Duration::from_millis(30));
        store.ensure("s1", &initial("s1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.read("s1").await.unwrap_err().is_not_found());
        assert!(store.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_sessions_snapshots_live_ids() {
        let store = MemoryStore::new(TTL);
        store.ensure("s2", &initial("s2")).await.unwrap();
        store.ensure("s1", &initial("s1")).await.unwrap();
        assert_eq!(store.list_sessions().await.unwrap(), vec!["s1", "s2"]);
    }
}
