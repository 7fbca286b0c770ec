/// Least-loaded-fraction client assignment (spec.md §4.4).
use crate::backend::{Client, Pool};
use std::fmt;

/// Every live backend is at or above its configured capacity, or the pool
/// has no live backends at all. Carries the rejected client back to the
/// caller so its socket can be closed -- the system must reject the client
/// instead of dereferencing a non-existent selection, per spec.md §9.
pub struct Rejected(pub Client);

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rejected(client {})", self.0.id)
    }
}

/// Scan the pool for the backend with the lowest `load_fraction`, assign
/// `client` to it, and wake its worker.
///
/// Ties are broken in favor of the lower-indexed backend: the scan uses a
/// strict `<` comparison, so the first minimum encountered wins and later
/// equal fractions don't replace it (spec.md §4.4).
pub async fn assign(pool: &Pool, client: Client) -> Result<(), Rejected> {
    let mut best: Option<&std::sync::Arc<crate::backend::Backend>> = None;
    let mut best_load = 1.0_f64;

    for backend in pool.live_backends() {
        let load = backend.load_fraction().await;
        if load < best_load {
            best_load = load;
            best = Some(backend);
        }
    }

    match best {
        Some(backend) => {
            backend.assign_client(client).await;
            Ok(())
        }
        None => Err(Rejected(client)),
    }
}
