//! End-to-end tests for the TCP redirector over loopback sockets

use std::net::SocketAddr;
use std::sync::Arc;

use portredir::config::{Config, RedirectConfig};
use portredir::metrics::RedirectMetrics;
use portredir::{start_redirector, Redirector, StopHandle};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

/// Deterministic pseudo-random payload
fn payload(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (state >> 16) as u8
        })
        .collect()
}

/// Echo server on an ephemeral loopback port
async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

/// Destination that hands every accepted stream to the test
async fn spawn_collecting_server() -> (SocketAddr, mpsc::UnboundedReceiver<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if tx.send(stream).is_err() {
                return;
            }
        }
    });

    (addr, rx)
}

fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

struct RunningRedirector {
    addr: SocketAddr,
    stop: StopHandle,
    metrics: Arc<RedirectMetrics>,
    handle: JoinHandle<portredir::Result<()>>,
}

async fn start_tcp(destination: SocketAddr) -> RunningRedirector {
    let redirect = RedirectConfig::new(0, destination.ip().to_string(), destination.port());
    let mut config = Config::with_redirect(redirect);
    config.server.bind_host = "127.0.0.1".to_string();
    config.server.connect_timeout = Duration::from_secs(2);

    let metrics = Arc::new(RedirectMetrics::new().unwrap());
    let redirector = Redirector::bind(Arc::new(config), Arc::clone(&metrics))
        .await
        .unwrap();
    let addr = redirector.local_addr();
    let stop = redirector.stop_handle();
    let handle = tokio::spawn(redirector.run());

    RunningRedirector {
        addr,
        stop,
        metrics,
        handle,
    }
}

/// Read until EOF or error; returns how many bytes arrived first
async fn read_until_closed<R: AsyncRead + Unpin>(stream: &mut R) -> usize {
    let mut total = 0;
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return total,
            Ok(n) => total += n,
        }
    }
}

#[tokio::test]
async fn test_round_trip_is_byte_exact() {
    let destination = spawn_echo_server().await;
    let redirector = start_tcp(destination).await;

    let data = payload(10_000, 7);
    let mut client = TcpStream::connect(redirector.addr).await.unwrap();
    client.write_all(&data).await.unwrap();

    let mut echoed = vec![0u8; data.len()];
    timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
        .await
        .expect("echo should arrive")
        .unwrap();
    assert_eq!(echoed, data);

    drop(client);
    timeout(Duration::from_secs(5), async {
        while redirector.metrics.active_sessions() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("session should end after the client leaves");

    assert_eq!(redirector.metrics.total_sessions(), 1);
    assert_eq!(redirector.metrics.bytes_relayed("upstream"), 10_000);
    assert_eq!(redirector.metrics.bytes_relayed("downstream"), 10_000);

    redirector.stop.stop();
    redirector.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_listener_keeps_accepting_sequential_clients() {
    let destination = spawn_echo_server().await;
    let redirector = start_tcp(destination).await;

    for seed in 0..5 {
        let data = payload(512, seed);
        let mut client = TcpStream::connect(redirector.addr).await.unwrap();
        client.write_all(&data).await.unwrap();

        let mut echoed = vec![0u8; data.len()];
        timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, data);
    }

    redirector.stop.stop();
    redirector.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_bind_conflict_fails_without_holding_port() {
    let blocker = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let port = blocker.local_addr().unwrap().port();

    let result = timeout(
        Duration::from_secs(5),
        start_redirector(RedirectConfig::new(port, "127.0.0.1", 9)),
    )
    .await
    .expect("bind failure should be reported immediately");
    let err = result.unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to start TCP listener"));

    // Once the blocker is gone the port is free, so the failed start left nothing bound
    drop(blocker);
    let rebound = TcpListener::bind(("0.0.0.0", port)).await;
    assert!(rebound.is_ok());
}

#[tokio::test]
async fn test_unreachable_destination_closes_client() {
    let destination: SocketAddr = format!("127.0.0.1:{}", unused_port()).parse().unwrap();
    let redirector = start_tcp(destination).await;

    for _ in 0..2 {
        let mut client = TcpStream::connect(redirector.addr).await.unwrap();
        let received = timeout(Duration::from_secs(5), read_until_closed(&mut client))
            .await
            .expect("client should be closed after the dial fails");
        assert_eq!(received, 0);
    }

    assert_eq!(redirector.metrics.dial_failures(), 2);
    assert_eq!(redirector.metrics.total_sessions(), 0);

    redirector.stop.stop();
    redirector.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_destination_close_reaches_client() {
    let (destination, mut accepted) = spawn_collecting_server().await;
    let redirector = start_tcp(destination).await;

    let mut client = TcpStream::connect(redirector.addr).await.unwrap();
    let mut server = timeout(Duration::from_secs(5), accepted.recv())
        .await
        .unwrap()
        .unwrap();

    server.write_all(b"goodbye").await.unwrap();
    drop(server);

    let received = timeout(Duration::from_secs(5), read_until_closed(&mut client))
        .await
        .expect("client should see the destination close");
    assert_eq!(received, 7);

    redirector.stop.stop();
    redirector.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_client_close_reaches_destination() {
    let (destination, mut accepted) = spawn_collecting_server().await;
    let redirector = start_tcp(destination).await;

    let mut client = TcpStream::connect(redirector.addr).await.unwrap();
    let mut server = timeout(Duration::from_secs(5), accepted.recv())
        .await
        .unwrap()
        .unwrap();

    client.write_all(b"bye").await.unwrap();
    drop(client);

    let received = timeout(Duration::from_secs(5), read_until_closed(&mut server))
        .await
        .expect("destination should see the client close");
    assert_eq!(received, 3);

    redirector.stop.stop();
    redirector.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let (destination_a, mut accepted_a) = spawn_collecting_server().await;
    let (destination_b, mut accepted_b) = spawn_collecting_server().await;
    let redirector_a = start_tcp(destination_a).await;
    let redirector_b = start_tcp(destination_b).await;

    let client_a = TcpStream::connect(redirector_a.addr).await.unwrap();
    let mut server_a = timeout(Duration::from_secs(5), accepted_a.recv())
        .await
        .unwrap()
        .unwrap();
    let client_b = TcpStream::connect(redirector_b.addr).await.unwrap();
    let mut server_b = timeout(Duration::from_secs(5), accepted_b.recv())
        .await
        .unwrap()
        .unwrap();

    // Stream on both sessions at once
    let (mut a_read, mut a_write) = client_a.into_split();
    let a_writer = tokio::spawn(async move {
        let chunk = payload(1_000, 1);
        for _ in 0..1_000 {
            if a_write.write_all(&chunk).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    let data = payload(10_000, 42);
    let (mut b_read, mut b_write) = client_b.into_split();
    let upstream_data = data.clone();
    let b_writer = tokio::spawn(async move {
        for chunk in upstream_data.chunks(1_000) {
            b_write.write_all(chunk).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        b_write
    });

    let mut head = vec![0u8; 1_000];
    timeout(Duration::from_secs(5), server_a.read_exact(&mut head))
        .await
        .unwrap()
        .unwrap();
    let mut upstream = vec![0u8; data.len()];
    timeout(Duration::from_secs(5), server_b.read_exact(&mut upstream[..1_000]))
        .await
        .unwrap()
        .unwrap();

    // Kill destination A while both transfers are in flight
    drop(server_a);
    timeout(Duration::from_secs(5), read_until_closed(&mut a_read))
        .await
        .expect("session A should end once its destination is gone");

    timeout(Duration::from_secs(5), server_b.read_exact(&mut upstream[1_000..]))
        .await
        .expect("session B upstream should complete")
        .unwrap();
    assert_eq!(upstream, data);

    let downstream_data = data.clone();
    let b_server_writer = tokio::spawn(async move {
        for chunk in downstream_data.chunks(1_000) {
            server_b.write_all(chunk).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        server_b
    });
    let mut downstream = vec![0u8; data.len()];
    timeout(Duration::from_secs(5), b_read.read_exact(&mut downstream))
        .await
        .expect("session B downstream should complete")
        .unwrap();
    assert_eq!(downstream, data);

    let _b_write = b_writer.await.unwrap();
    let _server_b = b_server_writer.await.unwrap();
    timeout(Duration::from_secs(10), a_writer)
        .await
        .expect("writer on the dead session should give up")
        .unwrap();

    assert_eq!(redirector_a.metrics.total_sessions(), 1);
    assert_eq!(redirector_b.metrics.active_sessions(), 1);

    redirector_a.stop.stop();
    redirector_b.stop.stop();
    redirector_a.handle.await.unwrap().unwrap();
    redirector_b.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stop_releases_port_but_keeps_sessions() {
    let destination = spawn_echo_server().await;
    let redirector = start_tcp(destination).await;

    let mut client = TcpStream::connect(redirector.addr).await.unwrap();
    client.write_all(b"before").await.unwrap();
    let mut buf = [0u8; 6];
    timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();

    redirector.stop.stop();
    redirector.handle.await.unwrap().unwrap();

    // In-flight session survives the listener going away
    client.write_all(b"after!").await.unwrap();
    timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"after!");

    // No new sessions are accepted
    let refused = TcpStream::connect(redirector.addr).await;
    assert!(refused.is_err());
}
