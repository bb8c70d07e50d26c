//! Lease file format and the background flush worker.
//!
//! The lease table is stored as a JSON array with one [`LeaseRecord`] per
//! client. Writes never happen on the serving path: callers only
//! [`request_flush`](LeaseFile::request_flush), and a single worker task
//! drains those requests by writing full snapshots of the table.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::allocation::Allocator;
use crate::error::Result;
use crate::hex::{bytes_to_hex_string, hex_string_to_bytes};
use crate::lease::{Client, ClientState, Clients, LeaseTable};

/// Attempts per flush before giving up and leaving the file stale.
const DEFAULT_FLUSH_ATTEMPTS: u32 = 5;

/// Bounds of the randomized pause between flush attempts, in milliseconds.
const RETRY_BACKOFF_MIN_MILLIS: u64 = 500;
const RETRY_BACKOFF_MAX_MILLIS: u64 = 1000;

/// One client as stored in the lease file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Identifier bytes as colon-separated hex.
    pub identifier: String,

    /// Hardware address as colon-separated hex.
    pub hardware_address: String,

    #[serde(default)]
    pub host_name: String,

    pub state: ClientState,

    pub ip_address: Ipv4Addr,

    pub lease_start_time: DateTime<Utc>,

    /// Seconds, `u32::MAX` for an infinite lease.
    pub lease_duration: u32,
}

impl From<&Client> for LeaseRecord {
    fn from(client: &Client) -> Self {
        Self {
            identifier: bytes_to_hex_string(&client.identifier, ":"),
            hardware_address: bytes_to_hex_string(&client.hardware_address, ":"),
            host_name: client.host_name.clone(),
            state: client.state,
            ip_address: client.ip_address,
            lease_start_time: client.lease_start_time,
            lease_duration: client.lease_duration,
        }
    }
}

impl From<LeaseRecord> for Client {
    fn from(record: LeaseRecord) -> Self {
        Self {
            identifier: hex_string_to_bytes(&record.identifier),
            hardware_address: hex_string_to_bytes(&record.hardware_address),
            host_name: record.host_name,
            state: record.state,
            ip_address: record.ip_address,
            offered_time: DateTime::<Utc>::MIN_UTC,
            lease_start_time: record.lease_start_time,
            lease_duration: record.lease_duration,
        }
    }
}

/// Reads every record from a lease file.
///
/// A missing file yields an empty list.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not valid JSON.
pub async fn read_records<P: AsRef<Path>>(path: P) -> Result<Vec<LeaseRecord>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}

/// Writes `clients` to `path`, replacing its contents atomically.
pub async fn write_records<P: AsRef<Path>>(path: P, clients: &[Client]) -> Result<()> {
    let path = path.as_ref();
    let records: Vec<LeaseRecord> = clients.iter().map(LeaseRecord::from).collect();
    let content = serde_json::to_string_pretty(&records)?;

    let staging = path.with_extension("tmp");
    tokio::fs::write(&staging, content).await?;
    tokio::fs::rename(&staging, path).await?;
    Ok(())
}

/// Loads the lease table for a starting instance.
///
/// Offered records are dropped, as are records whose address lies outside
/// the allocator's pool and reservation ranges. An unreadable or corrupt file
/// is logged and treated as empty.
pub async fn load_clients<P: AsRef<Path>>(path: P, allocator: &Allocator) -> Clients {
    let path = path.as_ref();
    let records = match read_records(path).await {
        Ok(records) => records,
        Err(e) => {
            warn!("Ignoring unreadable lease file {}: {}", path.display(), e);
            return Clients::new();
        }
    };

    let total = records.len();
    let clients: Clients = records
        .into_iter()
        .map(Client::from)
        .filter(|client| client.state != ClientState::Offered)
        .filter(|client| !client.has_address() || allocator.contains(client.ip_address))
        .collect();

    info!(
        "Loaded {} of {} lease records from {}",
        clients.len(),
        total,
        path.display()
    );
    clients
}

#[derive(Debug, Default)]
struct FlushQueue {
    pending: bool,
    active: bool,
}

#[derive(Debug)]
struct FlushState {
    path: PathBuf,
    table: Arc<LeaseTable>,
    max_attempts: u32,
    queue: Mutex<FlushQueue>,
    idle: Notify,
}

impl FlushState {
    fn queue(&self) -> std::sync::MutexGuard<'_, FlushQueue> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Single-flight, debounced writer of one lease table.
///
/// Requests made while a flush is running are coalesced into one more pass
/// by the same worker. The worker exits once no request is pending.
#[derive(Debug, Clone)]
pub struct LeaseFile {
    state: Arc<FlushState>,
}

impl LeaseFile {
    pub fn new(path: impl Into<PathBuf>, table: Arc<LeaseTable>) -> Self {
        Self::with_max_attempts(path, table, DEFAULT_FLUSH_ATTEMPTS)
    }

    /// Sets how many times a flush is attempted before giving up. Minimum 1.
    pub fn with_max_attempts(
        path: impl Into<PathBuf>,
        table: Arc<LeaseTable>,
        attempts: u32,
    ) -> Self {
        Self {
            state: Arc::new(FlushState {
                path: path.into(),
                table,
                max_attempts: attempts.max(1),
                queue: Mutex::new(FlushQueue::default()),
                idle: Notify::new(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.state.path
    }

    /// Asks for the table to be written. Never blocks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn request_flush(&self) {
        {
            let mut queue = self.state.queue();
            queue.pending = true;
            if queue.active {
                return;
            }
            queue.active = true;
        }
        tokio::spawn(drain(self.state.clone()));
    }

    /// Returns true while a worker is draining requests.
    pub fn is_flushing(&self) -> bool {
        self.state.queue().active
    }

    /// Waits until no worker is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.state.idle.notified();
            if !self.is_flushing() {
                return;
            }
            notified.await;
        }
    }
}

async fn drain(state: Arc<FlushState>) {
    loop {
        {
            let mut queue = state.queue();
            if !queue.pending {
                queue.active = false;
                drop(queue);
                state.idle.notify_waiters();
                return;
            }
            queue.pending = false;
        }

        let clients = state.table.snapshot().await;
        write_with_retry(&state, &clients).await;
    }
}

async fn write_with_retry(state: &FlushState, clients: &[Client]) {
    for attempt in 1..=state.max_attempts {
        match write_records(&state.path, clients).await {
            Ok(()) => {
                debug!(
                    "Wrote {} lease records to {}",
                    clients.len(),
                    state.path.display()
                );
                return;
            }
            Err(e) if attempt < state.max_attempts => {
                let backoff: u64 =
                    rand::random_range(RETRY_BACKOFF_MIN_MILLIS..RETRY_BACKOFF_MAX_MILLIS);
                debug!(
                    "Lease file write attempt {} failed: {}; retrying in {}ms",
                    attempt, e, backoff
                );
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            Err(e) => {
                warn!(
                    "Giving up writing lease file {} after {} attempts: {}",
                    state.path.display(),
                    attempt,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::AddressRange;
    use chrono::TimeDelta;

    struct TestGuard(String);
    impl Drop for TestGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
            let _ = std::fs::remove_file(Path::new(&self.0).with_extension("tmp"));
        }
    }

    fn test_path(name: &str) -> (String, TestGuard) {
        let path = std::env::temp_dir()
            .join(format!("dhcpserve_test_leases_{}_{}.json", name, std::process::id()))
            .to_string_lossy()
            .to_string();
        (path.clone(), TestGuard(path))
    }

    fn allocator() -> Allocator {
        Allocator::new(
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(255, 255, 255, 0),
            AddressRange::new(Ipv4Addr::new(192, 168, 1, 100), Ipv4Addr::new(192, 168, 1, 110)),
            vec![],
        )
    }

    fn make_client(id: u8, ip: Ipv4Addr, state: ClientState) -> Client {
        Client {
            identifier: vec![1, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, id],
            hardware_address: vec![0xaa, 0xbb, 0xcc, 0xdd, 0xee, id],
            host_name: format!("host-{}", id),
            state,
            ip_address: ip,
            offered_time: Utc::now(),
            lease_start_time: Utc::now() - TimeDelta::seconds(10),
            lease_duration: 3600,
        }
    }

    #[test]
    fn test_record_conversion() {
        let client = make_client(7, Ipv4Addr::new(192, 168, 1, 100), ClientState::Assigned);
        let record = LeaseRecord::from(&client);
        assert_eq!(record.identifier, "01:aa:bb:cc:dd:ee:07");
        assert_eq!(record.hardware_address, "aa:bb:cc:dd:ee:07");

        let back = Client::from(record);
        assert_eq!(back, client);
        assert_eq!(back.hardware_address, client.hardware_address);
        assert_eq!(back.lease_start_time, client.lease_start_time);
        assert_eq!(back.lease_duration, 3600);
    }

    #[tokio::test]
    async fn test_write_and_load_filters() {
        let (path, _guard) = test_path("filters");
        let clients = vec![
            make_client(1, Ipv4Addr::new(192, 168, 1, 100), ClientState::Assigned),
            make_client(2, Ipv4Addr::new(192, 168, 1, 101), ClientState::Offered),
            make_client(3, Ipv4Addr::new(192, 168, 1, 200), ClientState::Assigned),
            make_client(4, Ipv4Addr::new(192, 168, 1, 102), ClientState::Released),
            make_client(5, Ipv4Addr::UNSPECIFIED, ClientState::Released),
        ];
        write_records(&path, &clients).await.unwrap();

        let loaded = load_clients(&path, &allocator()).await;
        assert_eq!(loaded.len(), 3);
        assert!(loaded.get(&clients[0].identifier).is_some());
        assert!(loaded.get(&clients[1].identifier).is_none());
        assert!(loaded.get(&clients[2].identifier).is_none());
        assert!(loaded.get(&clients[3].identifier).is_some());
        assert!(loaded.get(&clients[4].identifier).is_some());
    }

    #[tokio::test]
    async fn test_missing_and_corrupt_files() {
        let (path, _guard) = test_path("corrupt");
        assert!(load_clients(&path, &allocator()).await.is_empty());
        assert!(read_records(&path).await.unwrap().is_empty());

        std::fs::write(&path, "{ not json").unwrap();
        assert!(read_records(&path).await.is_err());
        assert!(load_clients(&path, &allocator()).await.is_empty());
    }

    #[tokio::test]
    async fn test_request_flush_writes_snapshot() {
        let (path, _guard) = test_path("flush");
        let table = Arc::new(LeaseTable::default());
        let file = LeaseFile::new(&path, table.clone());

        table
            .transact(|clients| {
                clients.insert(make_client(1, Ipv4Addr::new(192, 168, 1, 100), ClientState::Assigned));
            })
            .await;

        file.request_flush();
        file.request_flush();
        file.request_flush();
        file.wait_idle().await;
        assert!(!file.is_flushing());

        let records = read_records(&path).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ip_address, Ipv4Addr::new(192, 168, 1, 100));

        table
            .transact(|clients| {
                clients.insert(make_client(2, Ipv4Addr::new(192, 168, 1, 101), ClientState::Assigned));
            })
            .await;
        file.request_flush();
        file.wait_idle().await;
        assert_eq!(read_records(&path).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_flush_failure_does_not_propagate() {
        let path = std::env::temp_dir()
            .join("dhcpserve_missing_dir")
            .join("nested")
            .join("leases.json");
        let table = Arc::new(LeaseTable::default());
        let file = LeaseFile::with_max_attempts(&path, table, 1);

        file.request_flush();
        file.wait_idle().await;
        assert!(!path.exists());
    }
}
