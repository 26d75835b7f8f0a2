//! Optional Redis backing so multiple proxy instances share breaker,
//! rate-limit, and queue state.
//!
//! Writes are fire-and-forget: a failed write logs at debug and never blocks
//! or fails the request path. Loads tolerate every error by starting empty.

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::breaker::VendorCircuit;
use crate::queue::JobRecord;
use crate::ratelimit::ModelRateState;
use crate::types::Vendor;

/// TTL for stored async job results.
const RESULT_TTL_SECS: u64 = 3_600;

pub struct StateStore {
    conn: ConnectionManager,
    prefix: String,
}

impl StateStore {
    pub async fn connect(url: &str, prefix: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!(prefix, "connected to shared state store");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn spawn_set(&self, key: String, value: &impl Serialize, ttl_secs: u64) {
        let Ok(json) = serde_json::to_string(value) else {
            return;
        };
        let mut conn = self.conn.clone();
        tokio::spawn(async move {
            if let Err(err) = conn.set_ex::<_, _, ()>(&key, json, ttl_secs).await {
                tracing::debug!(%err, key = %key, "state write failed");
            }
        });
    }

    /// Collect `pattern` keys and their JSON payloads. Any error yields an
    /// empty result; malformed entries are skipped by the caller.
    async fn load_matching(&self, pattern: &str) -> Vec<(String, String)> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = {
            let Ok(mut iter) = conn.scan_match::<_, String>(pattern).await else {
                return Vec::new();
            };
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        let mut out = Vec::new();
        for key in keys {
            if let Ok(Some(json)) = conn.get::<_, Option<String>>(&key).await {
                out.push((key, json));
            }
        }
        out
    }

    // -----------------------------------------------------------------------
    // Circuit breaker
    // -----------------------------------------------------------------------

    pub fn spawn_save_breaker(&self, vendor: Vendor, circuit: &VendorCircuit, ttl_secs: u64) {
        self.spawn_set(self.key(&format!("cb:{}", vendor)), circuit, ttl_secs);
    }

    pub async fn load_breakers(&self) -> HashMap<Vendor, VendorCircuit> {
        let prefix = self.key("cb:");
        let mut out = HashMap::new();
        for (key, json) in self.load_matching(&format!("{}*", prefix)).await {
            let Some(vendor) = key
                .strip_prefix(&prefix)
                .and_then(|v| Vendor::from_str(v).ok())
            else {
                continue;
            };
            match serde_json::from_str::<VendorCircuit>(&json) {
                Ok(circuit) => {
                    out.insert(vendor, circuit);
                }
                Err(err) => tracing::debug!(%err, key = %key, "skipping malformed breaker entry"),
            }
        }
        out
    }

    // -----------------------------------------------------------------------
    // Rate-limit tracker
    // -----------------------------------------------------------------------

    pub fn spawn_save_rate(&self, vendor: Vendor, model: &str, state: &ModelRateState, ttl_secs: u64) {
        self.spawn_set(self.key(&format!("rl:{}:{}", vendor, model)), state, ttl_secs);
    }

    pub async fn load_rates(&self) -> HashMap<(Vendor, String), ModelRateState> {
        let prefix = self.key("rl:");
        let mut out = HashMap::new();
        for (key, json) in self.load_matching(&format!("{}*", prefix)).await {
            let Some((vendor, model)) = key
                .strip_prefix(&prefix)
                .and_then(|rest| rest.split_once(':'))
                .and_then(|(v, m)| Vendor::from_str(v).ok().map(|v| (v, m.to_string())))
            else {
                continue;
            };
            match serde_json::from_str::<ModelRateState>(&json) {
                Ok(state) => {
                    out.insert((vendor, model), state);
                }
                Err(err) => tracing::debug!(%err, key = %key, "skipping malformed rate entry"),
            }
        }
        out
    }

    // -----------------------------------------------------------------------
    // Queue (async path only; sync waiters cannot cross processes)
    // -----------------------------------------------------------------------

    pub async fn push_job(&self, record: &JobRecord) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let job_key = self.key(&format!("queue:job:{}", record.id));
        let fields = [
            ("id", record.id.to_string()),
            ("created_at", record.created_at.to_rfc3339()),
            ("timeout_at", record.timeout_at.to_rfc3339()),
            ("estimated_wait_ms", record.estimated_wait_ms.to_string()),
            ("capability", record.capability.as_str().to_string()),
            ("requested_model", record.requested_model.clone()),
            ("body", record.body.to_string()),
        ];
        conn.hset_multiple::<_, _, _, ()>(&job_key, &fields).await?;
        conn.rpush::<_, _, ()>(self.key("queue:pending"), record.id.to_string())
            .await?;
        Ok(())
    }

    /// Atomically claim the head of the pending list. Exactly one instance
    /// sees any given job.
    pub async fn pop_job(&self) -> Option<JobRecord> {
        let mut conn = self.conn.clone();
        loop {
            let id: Option<String> = conn
                .lpop(self.key("queue:pending"), None)
                .await
                .ok()
                .flatten();
            let id = id?;

            let job_key = self.key(&format!("queue:job:{}", id));
            let fields: HashMap<String, String> = conn.hgetall(&job_key).await.ok()?;
            let _: Result<(), _> = conn.del(&job_key).await;

            // The hash may have expired out from under the list entry.
            if fields.is_empty() {
                continue;
            }
            match JobRecord::from_fields(&fields) {
                Some(record) => return Some(record),
                None => {
                    tracing::debug!(id = %id, "skipping malformed queued job");
                    continue;
                }
            }
        }
    }

    pub async fn pending_count(&self) -> usize {
        let mut conn = self.conn.clone();
        conn.llen::<_, usize>(self.key("queue:pending"))
            .await
            .unwrap_or(0)
    }

    pub fn spawn_save_result(&self, id: Uuid, result: &Value) {
        self.spawn_set(self.key(&format!("queue:result:{}", id)), result, RESULT_TTL_SECS);
    }

    pub async fn load_result(&self, id: Uuid) -> Option<Value> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn
            .get(self.key(&format!("queue:result:{}", id)))
            .await
            .ok()
            .flatten();
        serde_json::from_str(&json?).ok()
    }
}
