//! Drives the whole dispatch core end to end: a client connects to the
//! inbound listener, its bytes are forwarded to a loopback backend, and the
//! backend's framed reply is routed back to that same client -- exercising
//! accept loop, dispatcher, backend worker, and the client/upstream framing
//! together rather than each in isolation.
use rlb::backend::dial_all;
use rlb::roster::RosterEntry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const HEADER_LEN: usize = 8;

fn encode_frame(client_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&client_id.to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

async fn read_frame(stream: &mut TcpStream) -> (u32, Vec<u8>) {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.unwrap();
    let client_id = u32::from_be_bytes(header[0..4].try_into().unwrap());
    let len = u32::from_be_bytes(header[4..8].try_into().unwrap());
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await.unwrap();
    (client_id, payload)
}

#[tokio::test]
async fn client_bytes_round_trip_through_a_loopback_backend() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend_listener.local_addr().unwrap().port();

    // Fake upstream: echo every received frame back uppercased, keeping the
    // same client id so the worker's reader routes it to the right socket.
    tokio::spawn(async move {
        let (mut upstream, _) = backend_listener.accept().await.unwrap();
        loop {
            let (client_id, payload) = read_frame(&mut upstream).await;
            let reply: Vec<u8> = payload.iter().map(|b| b.to_ascii_uppercase()).collect();
            let frame = encode_frame(client_id, &reply);
            if upstream.write_all(&frame).await.is_err() {
                return;
            }
        }
    });

    let pool = dial_all(
        vec![RosterEntry {
            name: "backend-a".to_string(),
            address: "127.0.0.1".to_string(),
            port: backend_port,
        }],
        rlb::DEFAULT_SERVER_MAX_CONNECTIONS,
    )
    .await;
    assert_eq!(pool.live_count(), 1);

    let inbound = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let inbound_addr = inbound.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = rlb::server::run(inbound, pool).await;
    });

    let mut client = TcpStream::connect(inbound_addr).await.unwrap();
    client.write_all(b"hello").await.unwrap();

    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"HELLO");
}

#[tokio::test]
async fn two_clients_on_the_same_backend_get_their_own_replies() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend_listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut upstream, _) = backend_listener.accept().await.unwrap();
        loop {
            let (client_id, payload) = read_frame(&mut upstream).await;
            // Prefix the payload with the client id so each client can
            // assert it got its own reply, not its peer's.
            let mut reply = format!("{}:", client_id).into_bytes();
            reply.extend_from_slice(&payload);
            let frame = encode_frame(client_id, &reply);
            if upstream.write_all(&frame).await.is_err() {
                return;
            }
        }
    });

    let pool = dial_all(
        vec![RosterEntry {
            name: "backend-a".to_string(),
            address: "127.0.0.1".to_string(),
            port: backend_port,
        }],
        rlb::DEFAULT_SERVER_MAX_CONNECTIONS,
    )
    .await;

    let inbound = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let inbound_addr = inbound.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = rlb::server::run(inbound, pool).await;
    });

    let mut client_0 = TcpStream::connect(inbound_addr).await.unwrap();
    let mut client_1 = TcpStream::connect(inbound_addr).await.unwrap();
    // Distinct payloads per client rather than asserting on a specific
    // client id: `NEXT_CLIENT_ID` is one process-wide counter shared with
    // every other `#[tokio::test]` in this binary, which the default test
    // harness runs concurrently on separate threads, so the ids these two
    // clients actually get aren't deterministic across the whole run.
    client_0.write_all(b"alpha").await.unwrap();
    client_1.write_all(b"bravo").await.unwrap();

    let mut buf_0 = [0u8; 32];
    let mut buf_1 = [0u8; 32];
    let n0 = client_0.read(&mut buf_0).await.unwrap();
    let n1 = client_1.read(&mut buf_1).await.unwrap();
    assert!(buf_0[..n0].ends_with(b"alpha"));
    assert!(buf_1[..n1].ends_with(b"bravo"));
    // Each client was routed its own reply, not its peer's.
    assert_ne!(&buf_0[..n0], &buf_1[..n1]);
}
