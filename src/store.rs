//! Client-table persistence behind the [`ClientStore`] seam.
//!
//! The production store is a pretty-printed JSON file; tests swap in an
//! in-memory implementation. Writes go through [`write_with_retry`], which
//! backs off with jitter and gives up quietly after ten attempts, since a
//! stale snapshot must never take the server down.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::config::Config;
use crate::error::Result;
use crate::table::{ClientRecord, ClientState};

const WRITE_ATTEMPTS: u32 = 10;
const RETRY_SLEEP_MIN_MILLIS: u64 = 500;
const RETRY_SLEEP_MAX_MILLIS: u64 = 1000;

pub trait ClientStore: Send + Sync + 'static {
    fn read(&self) -> impl Future<Output = Result<Vec<ClientRecord>>> + Send;
    fn write(&self, records: Vec<ClientRecord>) -> impl Future<Output = Result<()>> + Send;
}

/// File-backed store; the encoding is an implementation detail of this
/// type, not of the server.
#[derive(Debug, Clone)]
pub struct JsonClientStore {
    path: PathBuf,
}

impl JsonClientStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl ClientStore for JsonClientStore {
    async fn read(&self) -> Result<Vec<ClientRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        let records: Vec<ClientRecord> = serde_json::from_str(&content)?;
        Ok(records)
    }

    async fn write(&self, records: Vec<ClientRecord>) -> Result<()> {
        let content = serde_json::to_string_pretty(&records)?;
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }
}

/// Drops loaded records the server must not trust: offers that never
/// completed, and addresses outside the pool and every reservation range.
pub fn filter_loaded(records: Vec<ClientRecord>, config: &Config) -> Vec<ClientRecord> {
    records
        .into_iter()
        .filter(|record| {
            if record.state == ClientState::Offered {
                return false;
            }
            if config.ip_in_pool(record.ip_address) {
                return true;
            }
            config.reservations.iter().any(|reservation| {
                let start = u32::from(config.clamp_to_subnet(reservation.pool_start));
                let end = u32::from(config.clamp_to_subnet(reservation.pool_end));
                let addr = u32::from(record.ip_address);
                addr >= start && addr <= end
            })
        })
        .collect()
}

/// Writes the snapshot with up to ten attempts, sleeping 500-1000 ms
/// between failures. Returns whether a write landed.
pub async fn write_with_retry<S: ClientStore>(store: &S, records: Vec<ClientRecord>) -> bool {
    for attempt in 1..=WRITE_ATTEMPTS {
        match store.write(records.clone()).await {
            Ok(()) => return true,
            Err(error) => {
                debug!(attempt, %error, "client store write failed");
                if attempt < WRITE_ATTEMPTS {
                    let millis = rand::rng()
                        .random_range(RETRY_SLEEP_MIN_MILLIS..=RETRY_SLEEP_MAX_MILLIS);
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                }
            }
        }
    }
    debug!(
        attempts = WRITE_ATTEMPTS,
        "giving up on client store write; snapshot may be stale"
    );
    false
}
