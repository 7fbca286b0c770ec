/// Binary entry point: load config, load the roster, dial every backend,
/// bail out if none connected, then run the accept loop.
use log::{error, info};
use rlb::backend::dial_all;
use rlb::roster::{self, RosterEntry, RosterError};
use rlb::{server, Config};
use std::io::{self, Write};
use tokio::net::TcpListener;

const CONFIG_PATH: &str = "config.yaml";

#[tokio::main]
async fn main() -> rlb::AsyncResult<()> {
    if let Err(e) = rlb::init_logging() {
        eprintln!("logger already initialized: {}", e);
    }

    let config = Config::from_file(CONFIG_PATH);
    let roster = load_roster_or_prompt(&config.roster_path);

    let pool = dial_all(roster, config.default_max_connections).await;
    if pool.live_count() == 0 {
        error!("All server connection attempts failed.");
        std::process::exit(1);
    }
    info!("{} backend(s) connected, accepting clients", pool.live_count());

    // tokio's `TcpListener::bind` doesn't expose a backlog knob; the
    // original's `MAX_QUEUED_CONNECTIONS` (`rlb::MAX_QUEUED_CONNECTIONS`)
    // is kept as documentation of the originally configured depth rather
    // than enforced at the socket level.
    let listener = TcpListener::bind(&config.listen_on).await?;
    info!("Listening on {}", config.listen_on);
    server::run(listener, pool).await
}

/// Load the roster, reprompting on stdin for an alternate path if the
/// configured one can't be opened. Matches spec.md §7's "Reprompt user;
/// loop until success" and the original `init_servers_metadata`'s
/// interactive fallback; a malformed file (bad port, oversized field) is
/// still a hard error, not something reprompting can fix.
fn load_roster_or_prompt(path: &str) -> Vec<RosterEntry> {
    let mut path = path.to_string();
    loop {
        match roster::load(&path) {
            Ok(entries) => return entries,
            Err(RosterError::Io(msg)) => {
                eprintln!("Can't open roster file {:?}: {}", path, msg);
                print!("Enter an alternate roster file path: ");
                if io::stdout().flush().is_err() {
                    std::process::exit(1);
                }
                let mut line = String::new();
                if io::stdin().read_line(&mut line).is_err() || line.trim().is_empty() {
                    std::process::exit(1);
                }
                path = line.trim().to_string();
            }
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        }
    }
}
