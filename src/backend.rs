/// Backend record, pool, and dial fan-out.
///
/// A `Backend` is one upstream server: its identity, its single persistent
/// upstream socket, and the set of clients currently multiplexed onto it.
/// The three fields below are guarded independently, matching the three
/// sub-locks of the original `server_t`: `identity` (name/address/port and
/// the upstream socket), `connection_details` (the connection count and its
/// wake condition) and `clients` (the assigned client set). Any code that
/// needs both `connection_details` and `clients` MUST take them in that
/// order.
use crate::roster::RosterEntry;
use crate::MAX_SERVERS;
use log::{error, info};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, PartialEq)]
pub enum DialError {
    AddressParse { name: String, address: String },
    Connect { name: String, error: String },
}

impl fmt::Display for DialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialError::AddressParse { name, address } => {
                write!(f, "backend {}: address {:?} not in acceptable format", name, address)
            }
            DialError::Connect { name, error } => {
                write!(f, "backend {}: connect failed: {}", name, error)
            }
        }
    }
}

impl std::error::Error for DialError {}

/// A client freshly accepted on the inbound listener, not yet assigned to
/// any backend.
pub struct Client {
    pub id: u64,
    pub peer_address: SocketAddr,
    pub stream: TcpStream,
}

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(0);

impl Client {
    pub fn new(stream: TcpStream, peer_address: SocketAddr) -> Client {
        Client {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            peer_address,
            stream,
        }
    }
}

/// Immutable-after-dial identity, plus the write half of the upstream
/// socket (the only part of it touched on every forwarded chunk).
struct Identity {
    name: String,
    #[allow(dead_code)]
    address: String,
    #[allow(dead_code)]
    port: u16,
    upstream_writer: OwnedWriteHalf,
}

struct ConnectionDetails {
    num_connections: usize,
    max_connections: usize,
}

/// The set of clients currently assigned to this backend: pending clients
/// not yet picked up by the worker, and the write halves of clients already
/// spawned, keyed by client id so the upstream reader can route a response
/// frame back to the right socket.
struct ClientSet {
    pending: Vec<Client>,
    writers: HashMap<u64, OwnedWriteHalf>,
}

pub struct Backend {
    identity: Mutex<Identity>,
    connection_details: Mutex<ConnectionDetails>,
    workload: Notify,
    clients: Mutex<ClientSet>,
}

impl Backend {
    fn new(entry: &RosterEntry, upstream_writer: OwnedWriteHalf, max_connections: usize) -> Backend {
        Backend {
            identity: Mutex::new(Identity {
                name: entry.name.clone(),
                address: entry.address.clone(),
                port: entry.port,
                upstream_writer,
            }),
            connection_details: Mutex::new(ConnectionDetails {
                num_connections: 0,
                max_connections,
            }),
            workload: Notify::new(),
            clients: Mutex::new(ClientSet {
                pending: Vec::new(),
                writers: HashMap::new(),
            }),
        }
    }

    pub async fn name(&self) -> String {
        self.identity.lock().await.name.clone()
    }

    /// Current load fraction, `num_connections / max_connections`. The lock
    /// is released before the caller uses the value; per spec.md §4.4 that's
    /// fine because this is a heuristic, not a linearizable read.
    pub async fn load_fraction(&self) -> f64 {
        let details = self.connection_details.lock().await;
        details.num_connections as f64 / details.max_connections as f64
    }

    /// Insert a client into this backend's pending set and wake the worker.
    ///
    /// Lock order: connection-details, then poll-entries (here, `clients`),
    /// matching spec.md §4.4 exactly.
    pub async fn assign_client(&self, client: Client) {
        let mut details = self.connection_details.lock().await;
        let mut clients = self.clients.lock().await;
        clients.pending.push(client);
        details.num_connections += 1;
        self.workload.notify_one();
    }

    /// Block until at least one client is assigned, matching the
    /// guarded-wait loop around `num_connections > 0` in spec.md §4.3 step 1.
    pub(crate) async fn wait_for_work(&self) {
        loop {
            if self.connection_details.lock().await.num_connections > 0 {
                return;
            }
            self.workload.notified().await;
        }
    }

    pub(crate) async fn take_pending(&self) -> Vec<Client> {
        let mut clients = self.clients.lock().await;
        std::mem::take(&mut clients.pending)
    }

    pub(crate) async fn register_writer(&self, id: u64, writer: OwnedWriteHalf) {
        self.clients.lock().await.writers.insert(id, writer);
    }

    /// A client disconnected (EOF): drop its writer and decrement the
    /// connection count. Because the client set is a map/Vec rather than a
    /// pair of fixed arrays, removal keeps the parallel-array invariant by
    /// construction -- there is no stale descriptor left behind to re-poll,
    /// unlike the original source (spec.md §9).
    pub(crate) async fn dissociate_client(&self, id: u64) {
        self.clients.lock().await.writers.remove(&id);
        let mut details = self.connection_details.lock().await;
        details.num_connections = details.num_connections.saturating_sub(1);
    }

    /// Route a frame read back from the upstream socket to the client it
    /// names. Returns `false` if that client is no longer registered (it
    /// disconnected in the meantime) or the write failed.
    pub(crate) async fn route_to_client(&self, id: u64, payload: &[u8]) -> bool {
        let mut clients = self.clients.lock().await;
        if let Some(writer) = clients.writers.get_mut(&id) {
            if writer.write_all(payload).await.is_ok() {
                return true;
            }
            clients.writers.remove(&id);
        }
        false
    }

    pub(crate) async fn forward_to_upstream(&self, frame: &[u8]) -> std::io::Result<()> {
        self.identity.lock().await.upstream_writer.write_all(frame).await
    }
}

/// Fixed-capacity registry of backend records, indexed 0..MAX_SERVERS-1.
/// A slot is `None` when the backend was never loaded or its dial failed.
/// Iteration tolerates holes by construction (it filters them out).
pub struct Pool {
    slots: Vec<Option<Arc<Backend>>>,
}

impl Pool {
    pub fn live_backends(&self) -> impl Iterator<Item = &Arc<Backend>> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }

    pub fn live_count(&self) -> usize {
        self.live_backends().count()
    }
}

/// Dial every roster entry concurrently, dropping the ones that fail.
///
/// Each dial parses the address, opens a TCP connection, and -- on success
/// -- splits the stream so the write half can live behind the backend's
/// identity lock while the read half is handed to a freshly spawned
/// backend worker. A failure at any step (parse or connect) drops that
/// slot; there is no retry, matching spec.md §4.2.
pub async fn dial_all(roster: Vec<RosterEntry>, default_max_connections: usize) -> Pool {
    let mut tasks = tokio::task::JoinSet::new();
    for (index, entry) in roster.into_iter().take(MAX_SERVERS).enumerate() {
        tasks.spawn(async move {
            let outcome = dial_one(&entry, default_max_connections).await;
            (index, entry, outcome)
        });
    }

    let mut slots: Vec<Option<Arc<Backend>>> = (0..MAX_SERVERS).map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        let (index, entry, outcome) = match joined {
            Ok(v) => v,
            Err(e) => {
                error!("dial task panicked: {}", e);
                continue;
            }
        };
        match outcome {
            Ok(backend) => {
                info!("Backend {} ({}:{}) connected", entry.name, entry.address, entry.port);
                slots[index] = Some(backend);
            }
            Err(e) => error!("{}", e),
        }
    }

    Pool { slots }
}

async fn dial_one(entry: &RosterEntry, max_connections: usize) -> Result<Arc<Backend>, DialError> {
    let ip: std::net::Ipv4Addr = entry.address.parse().map_err(|_| DialError::AddressParse {
        name: entry.name.clone(),
        address: entry.address.clone(),
    })?;
    let addr = SocketAddr::from((ip, entry.port));
    let stream = TcpStream::connect(addr).await.map_err(|e| DialError::Connect {
        name: entry.name.clone(),
        error: e.to_string(),
    })?;
    let (read_half, write_half) = stream.into_split();
    let backend = Arc::new(Backend::new(entry, write_half, max_connections));
    crate::worker::spawn(backend.clone(), read_half);
    Ok(backend)
}
