//! Integration tests for portmux
//!
//! Runs a real originator and terminator on plain threads and drives them
//! with tokio clients and target services:
//! - Stream setup (NEW/ACK) and data in both directions
//! - Half close propagation
//! - Concurrent streams and ID reuse
//! - Failed target connects and tunnel loss

use portmux::config::{Mode, TunnelConfig};
use portmux::tunnel::TunnelError;
use portmux::{Controller, Shutdown};
use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// Upper bound for any single step of a test
const STEP: Duration = Duration::from_secs(10);

/// A controller running on its own thread
struct Endpoint {
    shutdown: Shutdown,
    handle: JoinHandle<portmux::Result<()>>,
}

impl Endpoint {
    fn stop(self) -> portmux::Result<()> {
        self.shutdown.trigger();
        self.handle.join().expect("controller thread panicked")
    }

    /// Wait for the controller to end on its own
    async fn finished(self) -> portmux::Result<()> {
        let handle = self.handle;
        timeout(STEP, tokio::task::spawn_blocking(move || handle.join()))
            .await
            .expect("controller did not stop")
            .unwrap()
            .expect("controller thread panicked")
    }
}

struct Tunnel {
    /// Where application clients connect
    app_addr: SocketAddr,
    originator: Endpoint,
    terminator: Endpoint,
}

impl Tunnel {
    /// Stop the originator first; the terminator may see the tunnel drop
    /// before its own flag.
    fn stop(self) {
        let result = self.originator.stop();
        assert!(result.is_ok(), "originator failed: {:?}", result);
        let _ = self.terminator.stop();
    }
}

fn start_tunnel(target: SocketAddr) -> Tunnel {
    let tunnel_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let tunnel_addr = tunnel_listener.local_addr().unwrap();

    let config = TunnelConfig::new(Mode::Terminator, tunnel_addr.to_string(), target.to_string());
    let (tx, rx) = mpsc::channel();
    let handle = std::thread::spawn(move || {
        let mut controller = Controller::terminator_from_listener(tunnel_listener, &config)?;
        tx.send(controller.shutdown_handle()).unwrap();
        controller.run()
    });

    let config = TunnelConfig::new(Mode::Originator, "127.0.0.1:0", tunnel_addr.to_string());
    let (orig_tx, orig_rx) = mpsc::channel();
    let orig_handle = std::thread::spawn(move || {
        let mut controller = Controller::originator(&config)?;
        let addr = controller.listen_addr().expect("originator has no listener");
        orig_tx.send((addr, controller.shutdown_handle())).unwrap();
        controller.run()
    });

    let (app_addr, orig_shutdown) = orig_rx.recv_timeout(STEP).expect("originator did not start");
    let term_shutdown = rx.recv_timeout(STEP).expect("terminator did not start");

    Tunnel {
        app_addr,
        originator: Endpoint {
            shutdown: orig_shutdown,
            handle: orig_handle,
        },
        terminator: Endpoint {
            shutdown: term_shutdown,
            handle,
        },
    }
}

/// Echo service; each connection echoes until EOF, then closes
async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Send `payload`, close the write side and collect everything echoed back
async fn echo_round_trip(addr: SocketAddr, payload: Vec<u8>) -> Vec<u8> {
    let stream = timeout(STEP, TcpStream::connect(addr)).await.unwrap().unwrap();
    let (mut reader, mut writer) = stream.into_split();
    let sender = tokio::spawn(async move {
        writer.write_all(&payload).await.unwrap();
        writer.shutdown().await.unwrap();
        writer
    });

    let mut echoed = Vec::new();
    timeout(STEP, reader.read_to_end(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    drop(sender.await.unwrap());
    echoed
}

/// Every byte value, so frame markers show up in the payload
fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
}

#[tokio::test]
async fn test_bytes_flow_both_ways() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tunnel = start_tunnel(target.local_addr().unwrap());

    let mut client = TcpStream::connect(tunnel.app_addr).await.unwrap();
    let (mut server, _) = timeout(STEP, target.accept()).await.unwrap().unwrap();

    let greeting = b"hello through the tunnel";
    client.write_all(greeting).await.unwrap();
    let mut buf = [0u8; 24];
    timeout(STEP, server.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, greeting);

    // Larger than every buffer on the path, in both directions at once
    let down = pattern(300_000, 1);
    let up = pattern(200_000, 2);
    let mut got_down = vec![0u8; down.len()];
    let mut got_up = vec![0u8; up.len()];
    {
        let (mut client_rd, mut client_wr) = client.split();
        let (mut server_rd, mut server_wr) = server.split();
        let transfer = async {
            tokio::try_join!(
                server_wr.write_all(&down),
                client_rd.read_exact(&mut got_down),
                client_wr.write_all(&up),
                server_rd.read_exact(&mut got_up),
            )
        };
        timeout(STEP, transfer).await.expect("transfer timed out").unwrap();
    }
    assert!(got_down == down, "downstream bytes differ");
    assert!(got_up == up, "upstream bytes differ");

    tunnel.stop();
}

#[tokio::test]
async fn test_half_close_keeps_other_direction() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tunnel = start_tunnel(target.local_addr().unwrap());

    let mut client = TcpStream::connect(tunnel.app_addr).await.unwrap();
    let (mut server, _) = timeout(STEP, target.accept()).await.unwrap().unwrap();

    client.write_all(b"request").await.unwrap();
    client.shutdown().await.unwrap();

    // The target sees EOF after the request
    let mut request = Vec::new();
    timeout(STEP, server.read_to_end(&mut request)).await.unwrap().unwrap();
    assert_eq!(request, b"request");

    // and can still answer
    server.write_all(b"response").await.unwrap();
    server.shutdown().await.unwrap();

    let mut response = Vec::new();
    timeout(STEP, client.read_to_end(&mut response)).await.unwrap().unwrap();
    assert_eq!(response, b"response");

    tunnel.stop();
}

#[tokio::test]
async fn test_concurrent_streams_stay_separate() {
    let target = echo_server().await;
    let tunnel = start_tunnel(target);

    let clients: Vec<_> = (0..8u8)
        .map(|seed| {
            let payload = pattern(40_000 + usize::from(seed) * 1000, seed);
            let addr = tunnel.app_addr;
            tokio::spawn(async move {
                let echoed = echo_round_trip(addr, payload.clone()).await;
                (payload, echoed)
            })
        })
        .collect();

    for client in clients {
        let (sent, echoed) = client.await.unwrap();
        assert_eq!(echoed.len(), sent.len());
        assert!(echoed == sent, "stream data mixed up");
    }

    tunnel.stop();
}

#[tokio::test]
async fn test_ids_are_reused() {
    let target = echo_server().await;
    let tunnel = start_tunnel(target);

    // More sequential streams than there are IDs
    for round in 0..300u32 {
        let payload = round.to_be_bytes().to_vec();
        let echoed = echo_round_trip(tunnel.app_addr, payload.clone()).await;
        assert_eq!(echoed, payload, "round {}", round);
    }

    tunnel.stop();
}

#[tokio::test]
async fn test_unreachable_target_closes_client() {
    // Grab a port with nothing listening on it
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = unused.local_addr().unwrap();
    drop(unused);

    let tunnel = start_tunnel(target);
    let mut client = TcpStream::connect(tunnel.app_addr).await.unwrap();

    let mut buf = [0u8; 16];
    let read = timeout(STEP, client.read(&mut buf)).await.expect("client was not closed");
    assert!(matches!(read, Ok(0) | Err(_)));

    // The tunnel itself survives
    tunnel.stop();
}

#[tokio::test]
async fn test_tunnel_loss_ends_session() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tunnel = start_tunnel(target.local_addr().unwrap());

    let mut client = TcpStream::connect(tunnel.app_addr).await.unwrap();
    let (mut server, _) = timeout(STEP, target.accept()).await.unwrap().unwrap();
    client.write_all(b"x").await.unwrap();
    let mut byte = [0u8; 1];
    timeout(STEP, server.read_exact(&mut byte)).await.unwrap().unwrap();

    assert!(tunnel.originator.stop().is_ok());

    let err = tunnel
        .terminator
        .finished()
        .await
        .expect_err("terminator kept running without a tunnel");
    assert!(
        matches!(err, portmux::Error::Tunnel(TunnelError::TunnelLost)),
        "unexpected error: {:?}",
        err
    );

    // Every forwarded connection was torn down with it
    let mut buf = [0u8; 8];
    let read = timeout(STEP, server.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}
