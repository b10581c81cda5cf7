//! Global control-plane flags: pause and throttle rate.
//!
//! Per §9, these are values in C1, read fresh on every worker step and every
//! scheduler admission rather than cached in local memory. `ControlFlags`
//! wraps the store calls so callers never touch the key names directly; it
//! holds no state of its own beyond a process-local cache of the last
//! observed throttle rate, used only to avoid a store round-trip when no
//! admin has ever set one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::store::StateStore;

const PAUSE_KEY: &str = "system_paused";
const THROTTLE_KEY: &str = "system_throttle_rate";
const ADMISSION_BLOCKED_KEY: &str = "system_admission_blocked";
const PAUSE_TTL: Duration = Duration::from_secs(60 * 60);

pub const THROTTLE_MIN: f64 = 0.1;
pub const THROTTLE_MAX: f64 = 2.0;

pub struct ControlFlags {
    store: Arc<dyn StateStore>,
    /// Cached as fixed-point (rate * 1_000_000) for atomic access; the store
    /// remains the source of truth, this only shortcuts the common case
    /// where no throttle override has ever been written.
    throttle_cache_fp: AtomicU64,
}

impl ControlFlags {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store, throttle_cache_fp: AtomicU64::new(1_000_000) }
    }

    pub async fn pause(&self) -> EngineResult<()> {
        self.store.kv_set(PAUSE_KEY, b"1", Some(PAUSE_TTL)).await?;
        Ok(())
    }

    pub async fn resume(&self) -> EngineResult<()> {
        self.store.kv_delete(PAUSE_KEY).await?;
        Ok(())
    }

    pub async fn is_paused(&self) -> bool {
        matches!(self.store.kv_get(PAUSE_KEY).await, Ok(Some(_)))
    }

    pub async fn block_admission(&self) -> EngineResult<()> {
        self.store.kv_set(ADMISSION_BLOCKED_KEY, b"1", None).await?;
        Ok(())
    }

    pub async fn unblock_admission(&self) -> EngineResult<()> {
        self.store.kv_delete(ADMISSION_BLOCKED_KEY).await?;
        Ok(())
    }

    pub async fn admission_blocked(&self) -> bool {
        matches!(self.store.kv_get(ADMISSION_BLOCKED_KEY).await, Ok(Some(_)))
    }

    /// Validates and persists a throttle rate. Rejected outside [0.1, 2.0]
    /// per invariant 5 / property I6 — the stored rate is left untouched.
    pub async fn set_throttle(&self, rate: f64) -> EngineResult<()> {
        if !(THROTTLE_MIN..=THROTTLE_MAX).contains(&rate) {
            return Err(EngineError::ThrottleOutOfRange(rate));
        }
        self.store.kv_set(THROTTLE_KEY, &rate.to_be_bytes(), None).await?;
        self.throttle_cache_fp.store((rate * 1_000_000.0) as u64, Ordering::Relaxed);
        Ok(())
    }

    pub async fn throttle_rate(&self) -> f64 {
        match self.store.kv_get(THROTTLE_KEY).await {
            Ok(Some(raw)) if raw.len() == 8 => {
                let bytes: [u8; 8] = raw.try_into().unwrap();
                f64::from_be_bytes(bytes)
            }
            _ => self.throttle_cache_fp.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}
