use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;

use super::{ScoredMember, StateStore, StoreResult};
use crate::error::StoreError;

const BROADCAST_CAPACITY: usize = 1024;
const LIST_SEQ_START: i64 = i64::MAX / 2;

/// Default C1 backend: sled gives us durable KV/hash/sorted-set/list storage
/// behind one embedded file, so a single node needs no external broker;
/// pub/sub is necessarily in-memory (no broker persists undelivered
/// messages either) and lives in a channel-name-keyed broadcast map.
pub struct SledStateStore {
    db: sled::Db,
    channels: DashMap<String, broadcast::Sender<Vec<u8>>>,
}

impl SledStateStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            channels: DashMap::new(),
        })
    }

    pub fn open_temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            db,
            channels: DashMap::new(),
        })
    }

    fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn ttl_expired(&self, ttl_key: &str) -> StoreResult<bool> {
        match self.db.get(ttl_key)? {
            Some(raw) => {
                let expires_at = i64::from_be_bytes(
                    raw.as_ref()
                        .try_into()
                        .map_err(|_| StoreError::Serde("corrupt ttl entry".into()))?,
                );
                Ok(Self::now_millis() >= expires_at)
            }
            None => Ok(false),
        }
    }

    fn set_ttl(&self, ttl_key: &str, ttl: Option<Duration>) -> StoreResult<()> {
        match ttl {
            Some(d) => {
                let expires_at = Self::now_millis() + d.as_millis() as i64;
                self.db.insert(ttl_key, &expires_at.to_be_bytes())?;
            }
            None => {
                self.db.remove(ttl_key)?;
            }
        }
        Ok(())
    }

    /// Checks the list's shared TTL and, if expired, deletes the whole list
    /// (entries plus the sequence counter) the same way `kv_get`/
    /// `hash_get_all` self-delete expired keys. Returns whether it expired.
    fn list_expire_if_due(&self, key: &str) -> StoreResult<bool> {
        let ttl_key = format!("list_ttl:{key}");
        if !self.ttl_expired(&ttl_key)? {
            return Ok(false);
        }
        let prefix = format!("list:{key}:");
        let keys: Vec<_> = self.db.scan_prefix(&prefix).keys().filter_map(|k| k.ok()).collect();
        for k in keys {
            self.db.remove(k)?;
        }
        self.db.remove(format!("list_seq:{key}"))?;
        self.db.remove(ttl_key)?;
        Ok(true)
    }

    fn encode_score(score: f64) -> String {
        // Scores in this engine are always non-negative unix timestamps, so a
        // fixed-width zero-padded decimal string sorts identically to the
        // numeric order sled's own key ordering gives us.
        format!("{:020.6}", score.max(0.0))
    }
}

#[async_trait]
impl StateStore for SledStateStore {
    async fn kv_set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        let data_key = format!("kv:{key}");
        let ttl_key = format!("kv_ttl:{key}");
        self.db.insert(data_key, value)?;
        self.set_ttl(&ttl_key, ttl)?;
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let ttl_key = format!("kv_ttl:{key}");
        if self.ttl_expired(&ttl_key)? {
            self.kv_delete(key).await?;
            return Ok(None);
        }
        let data_key = format!("kv:{key}");
        Ok(self.db.get(data_key)?.map(|v| v.to_vec()))
    }

    async fn kv_delete(&self, key: &str) -> StoreResult<()> {
        self.db.remove(format!("kv:{key}"))?;
        self.db.remove(format!("kv_ttl:{key}"))?;
        Ok(())
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, &[u8])], ttl: Option<Duration>) -> StoreResult<()> {
        for (field, value) in fields {
            self.db.insert(format!("hash:{key}:{field}"), *value)?;
        }
        self.set_ttl(&format!("hash_ttl:{key}"), ttl)?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<Option<Vec<(String, Vec<u8>)>>> {
        if self.ttl_expired(&format!("hash_ttl:{key}"))? {
            self.hash_delete(key).await?;
            return Ok(None);
        }
        let prefix = format!("hash:{key}:");
        let mut out = Vec::new();
        for item in self.db.scan_prefix(&prefix) {
            let (k, v) = item?;
            let field = String::from_utf8_lossy(&k[prefix.len()..]).to_string();
            out.push((field, v.to_vec()));
        }
        if out.is_empty() {
            Ok(None)
        } else {
            Ok(Some(out))
        }
    }

    async fn hash_delete(&self, key: &str) -> StoreResult<()> {
        let prefix = format!("hash:{key}:");
        let keys: Vec<_> = self.db.scan_prefix(&prefix).keys().filter_map(|k| k.ok()).collect();
        for k in keys {
            self.db.remove(k)?;
        }
        self.db.remove(format!("hash_ttl:{key}"))?;
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let member_key = format!("zmember:{key}:{member}");
        if let Some(old_score_enc) = self.db.get(&member_key)? {
            let old_score_enc = String::from_utf8_lossy(&old_score_enc).to_string();
            self.db.remove(format!("zset:{key}:{old_score_enc}:{member}"))?;
        }
        let score_enc = Self::encode_score(score);
        self.db.insert(format!("zset:{key}:{score_enc}:{member}"), member.as_bytes())?;
        self.db.insert(member_key, score_enc.as_bytes())?;
        Ok(())
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<ScoredMember>> {
        let prefix = format!("zset:{key}:");
        let mut out = Vec::new();
        for item in self.db.scan_prefix(&prefix) {
            let (k, v) = item?;
            let rest = &k[prefix.len()..];
            let rest_str = String::from_utf8_lossy(rest);
            let mut parts = rest_str.splitn(2, ':');
            let score: f64 = parts.next().unwrap_or("0").parse().unwrap_or(0.0);
            if score >= min && score <= max {
                out.push(ScoredMember {
                    member: String::from_utf8_lossy(&v).to_string(),
                    score,
                });
            }
        }
        out.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap());
        Ok(out)
    }

    async fn zrange_by_rank(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<ScoredMember>> {
        let all = self.zrange_by_score(key, f64::MIN, f64::MAX).await?;
        let len = all.len() as isize;
        let norm = |i: isize| -> isize {
            if i < 0 {
                (len + i).max(0)
            } else {
                i.min(len)
            }
        };
        let start = norm(start);
        let stop = (norm(stop) + 1).min(len);
        if start >= stop {
            return Ok(Vec::new());
        }
        Ok(all[start as usize..stop as usize].to_vec())
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        let prefix = format!("zset:{key}:");
        Ok(self.db.scan_prefix(&prefix).count())
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> StoreResult<usize> {
        let members = self.zrange_by_score(key, min, max).await?;
        for m in &members {
            let score_enc = Self::encode_score(m.score);
            self.db.remove(format!("zset:{key}:{score_enc}:{}", m.member))?;
            self.db.remove(format!("zmember:{key}:{}", m.member))?;
        }
        Ok(members.len())
    }

    async fn list_push_front(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        let seq_key = format!("list_seq:{key}");
        let seq = match self.db.get(&seq_key)? {
            Some(raw) => i64::from_be_bytes(raw.as_ref().try_into().unwrap_or([0; 8])) - 1,
            None => LIST_SEQ_START,
        };
        self.db.insert(&seq_key, &seq.to_be_bytes())?;
        self.db.insert(format!("list:{key}:{:020}", seq), value)?;
        // The whole list shares one expiry, refreshed on every push — a
        // replay buffer that keeps receiving events should keep living.
        self.set_ttl(&format!("list_ttl:{key}"), ttl)?;
        Ok(())
    }

    async fn list_trim(&self, key: &str, max_len: usize) -> StoreResult<()> {
        if self.list_expire_if_due(key)? {
            return Ok(());
        }
        let prefix = format!("list:{key}:");
        let keys: Vec<_> = self.db.scan_prefix(&prefix).keys().filter_map(|k| k.ok()).collect();
        if keys.len() > max_len {
            for k in &keys[max_len..] {
                self.db.remove(k)?;
            }
        }
        Ok(())
    }

    async fn list_range(&self, key: &str, limit: usize) -> StoreResult<Vec<Vec<u8>>> {
        if self.list_expire_if_due(key)? {
            return Ok(Vec::new());
        }
        let prefix = format!("list:{key}:");
        let mut out = Vec::new();
        for item in self.db.scan_prefix(&prefix) {
            let (_, v) = item?;
            out.push(v.to_vec());
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    async fn list_len(&self, key: &str) -> StoreResult<usize> {
        if self.list_expire_if_due(key)? {
            return Ok(0);
        }
        let prefix = format!("list:{key}:");
        Ok(self.db.scan_prefix(&prefix).count())
    }

    async fn list_pop_back(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        if self.list_expire_if_due(key)? {
            return Ok(None);
        }
        let prefix = format!("list:{key}:");
        let last_key = self
            .db
            .scan_prefix(&prefix)
            .keys()
            .filter_map(|k| k.ok())
            .next_back();
        match last_key {
            Some(k) => {
                let value = self.db.remove(&k)?.map(|v| v.to_vec());
                Ok(value)
            }
            None => Ok(None),
        }
    }

    fn publish(&self, channel: &str, payload: Vec<u8>) {
        let sender = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(BROADCAST_CAPACITY).0)
            .clone();
        // A publish with no live subscribers is not an error; the recent
        // buffer (see C2) is the replay path for anyone who connects late.
        let _ = sender.send(payload);
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Vec<u8>> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(BROADCAST_CAPACITY).0)
            .subscribe()
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (k, _) = item?;
            out.push(String::from_utf8_lossy(&k).to_string());
        }
        Ok(out)
    }
}
