//! End-to-end forwarder tests
//!
//! A fake upstream UDP server answers every query with one A record; the
//! forwarder binds ephemeral loopback ports and relays client queries to
//! it. Covers the UDP and TCP ingress paths, counter behavior and the
//! mid-stream provider switch.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::rr::RecordType;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use sdfw::dns::forwarder::{Forwarder, ForwarderConfig};
use sdfw::dns::upstream::UpstreamTransport;
use sdfw::dns::wire;
use sdfw::settings::Provider;

/// Answer every query with one A record, tagging the payload with `marker`
/// as the first RDATA octet so tests can tell upstreams apart.
async fn spawn_upstream(marker: u8) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        while let Ok((len, src)) = socket.recv_from(&mut buf).await {
            let mut reply = buf[..len].to_vec();
            reply[2] = 0x81; // QR + RD
            reply[3] = 0x80; // RA, RCODE 0
            reply[6] = 0x00;
            reply[7] = 0x01; // ANCOUNT 1
            reply.extend_from_slice(&[
                0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x01, 0x2C, 0x00, 0x04, marker,
                0, 0, 1,
            ]);
            let _ = socket.send_to(&reply, src).await;
        }
    });
    addr
}

fn provider_for(upstream: SocketAddr) -> Arc<Provider> {
    let v4 = match upstream.ip() {
        std::net::IpAddr::V4(v4) => v4,
        std::net::IpAddr::V6(_) => unreachable!("fixtures bind IPv4"),
    };
    Arc::new(Provider::standard("fixture", Some(v4), None, None, None))
}

async fn running_forwarder(upstream: SocketAddr) -> Arc<Forwarder> {
    let transport = Arc::new(UpstreamTransport::with_dns_port(upstream.port()));
    let forwarder = Arc::new(Forwarder::with_config(
        transport,
        ForwarderConfig::ephemeral_v4(),
    ));
    forwarder.start(provider_for(upstream)).await.unwrap();
    forwarder
}

/// The marker octet of the first A answer, set by the fake upstream
fn answer_marker(reply: &[u8]) -> u8 {
    reply[reply.len() - 4]
}

// ============================================================================
// UDP Path
// ============================================================================

#[tokio::test]
async fn udp_query_round_trip() {
    let upstream = spawn_upstream(11).await;
    let forwarder = running_forwarder(upstream).await;
    let addr = forwarder.local_v4().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let query = wire::build_query("example.com", RecordType::A).unwrap();
    client.send_to(&query, addr).await.unwrap();

    let mut buf = vec![0u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(6), client.recv_from(&mut buf))
        .await
        .expect("response within the deadline")
        .unwrap();
    let reply = &buf[..len];

    // The reply is the upstream's bytes verbatim, same transaction ID
    assert_eq!(wire::message_id(reply), wire::message_id(&query));
    assert_eq!(wire::response_code(reply), Some(0));
    assert_eq!(wire::answer_count(reply), Some(1));
    assert_eq!(answer_marker(reply), 11);

    forwarder.stop().await;
}

#[tokio::test]
async fn udp_query_increments_counter_exactly_once() {
    let upstream = spawn_upstream(1).await;
    let forwarder = running_forwarder(upstream).await;
    let addr = forwarder.local_v4().unwrap();
    assert_eq!(forwarder.queries_handled(), 0);

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut buf = vec![0u8; 4096];

    for expected in 1..=3u64 {
        let query = wire::build_query("example.com", RecordType::A).unwrap();
        client.send_to(&query, addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(6), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        // Each answered query moves the counter by exactly one
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(forwarder.queries_handled(), expected);
    }

    forwarder.stop().await;
}

#[tokio::test]
async fn udp_runt_datagram_is_dropped() {
    let upstream = spawn_upstream(1).await;
    let forwarder = running_forwarder(upstream).await;
    let addr = forwarder.local_v4().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&[0u8; 4], addr).await.unwrap();

    let mut buf = vec![0u8; 512];
    let result = tokio::time::timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
    assert!(result.is_err(), "runt datagrams get no response");

    assert_eq!(forwarder.queries_handled(), 0);
    forwarder.stop().await;
}

// ============================================================================
// TCP Path
// ============================================================================

#[tokio::test]
async fn tcp_query_round_trip() {
    let upstream = spawn_upstream(22).await;
    let forwarder = running_forwarder(upstream).await;
    let addr = forwarder.local_v4().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let query = wire::build_query("example.com", RecordType::A).unwrap();

    #[allow(clippy::cast_possible_truncation)]
    let prefix = (query.len() as u16).to_be_bytes();
    stream.write_all(&prefix).await.unwrap();
    stream.write_all(&query).await.unwrap();
    stream.flush().await.unwrap();

    let mut len_buf = [0u8; 2];
    tokio::time::timeout(Duration::from_secs(6), stream.read_exact(&mut len_buf))
        .await
        .expect("length prefix within the deadline")
        .unwrap();
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut reply = vec![0u8; len];
    stream.read_exact(&mut reply).await.unwrap();

    assert_eq!(wire::message_id(&reply), wire::message_id(&query));
    assert_eq!(wire::response_code(&reply), Some(0));
    assert_eq!(answer_marker(&reply), 22);

    forwarder.stop().await;
}

#[tokio::test]
async fn tcp_multiple_queries_one_connection() {
    let upstream = spawn_upstream(7).await;
    let forwarder = running_forwarder(upstream).await;
    let addr = forwarder.local_v4().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();

    for _ in 0..3 {
        let query = wire::build_query("example.com", RecordType::A).unwrap();
        #[allow(clippy::cast_possible_truncation)]
        let prefix = (query.len() as u16).to_be_bytes();
        stream.write_all(&prefix).await.unwrap();
        stream.write_all(&query).await.unwrap();

        let mut len_buf = [0u8; 2];
        tokio::time::timeout(Duration::from_secs(6), stream.read_exact(&mut len_buf))
            .await
            .unwrap()
            .unwrap();
        let mut reply = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(wire::message_id(&reply), wire::message_id(&query));
    }

    forwarder.stop().await;
}

#[tokio::test]
async fn tcp_undersized_frame_closes_connection() {
    let upstream = spawn_upstream(1).await;
    let forwarder = running_forwarder(upstream).await;
    let addr = forwarder.local_v4().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    // Length prefix below the DNS header minimum
    stream.write_all(&5u16.to_be_bytes()).await.unwrap();
    stream.write_all(&[0u8; 5]).await.unwrap();
    stream.flush().await.unwrap();

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut buf)).await;
    assert!(
        matches!(read, Ok(Err(_))),
        "connection closes without a response"
    );

    forwarder.stop().await;
}

// ============================================================================
// Provider Switch
// ============================================================================

/// Like `spawn_upstream` but bound to an explicit address, so two
/// upstreams can share a port on different loopback addresses.
async fn spawn_upstream_at(addr: SocketAddr, marker: u8) -> std::io::Result<()> {
    let socket = UdpSocket::bind(addr).await?;
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        while let Ok((len, src)) = socket.recv_from(&mut buf).await {
            let mut reply = buf[..len].to_vec();
            reply[2] = 0x81;
            reply[3] = 0x80;
            reply[6] = 0x00;
            reply[7] = 0x01;
            reply.extend_from_slice(&[
                0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x01, 0x2C, 0x00, 0x04, marker,
                0, 0, 1,
            ]);
            let _ = socket.send_to(&reply, src).await;
        }
    });
    Ok(())
}

#[tokio::test]
async fn switch_affects_only_new_queries() {
    // Two upstreams on the same port, distinct loopback addresses, so the
    // provider address alone decides which one answers.
    let first = spawn_upstream(100).await;
    let port = first.port();
    let second: SocketAddr = format!("127.0.0.2:{port}").parse().unwrap();
    if spawn_upstream_at(second, 200).await.is_err() {
        // Hosts without the full 127/8 loopback block cannot run this case
        return;
    }

    let transport = Arc::new(UpstreamTransport::with_dns_port(port));
    let forwarder = Arc::new(Forwarder::with_config(
        transport,
        ForwarderConfig::ephemeral_v4(),
    ));
    forwarder.start(provider_for(first)).await.unwrap();
    let addr = forwarder.local_v4().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut buf = vec![0u8; 4096];

    let query = wire::build_query("example.com", RecordType::A).unwrap();
    client.send_to(&query, addr).await.unwrap();
    let (len, _) = tokio::time::timeout(Duration::from_secs(6), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(answer_marker(&buf[..len]), 100);

    // Switch: only queries sent after the swap see the second upstream
    forwarder.set_active(provider_for(second));

    let query = wire::build_query("example.com", RecordType::A).unwrap();
    client.send_to(&query, addr).await.unwrap();
    let (len, _) = tokio::time::timeout(Duration::from_secs(6), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(answer_marker(&buf[..len]), 200);

    forwarder.stop().await;
}

#[tokio::test]
async fn stop_releases_sockets() {
    let upstream = spawn_upstream(1).await;
    let forwarder = running_forwarder(upstream).await;
    let addr = forwarder.local_v4().unwrap();

    forwarder.stop().await;

    // The TCP listener is gone; connecting must fail
    let connect = tokio::time::timeout(Duration::from_secs(1), TcpStream::connect(addr)).await;
    match connect {
        Ok(Err(_)) => {}
        Ok(Ok(_)) => panic!("TCP port still accepting after stop"),
        Err(_) => panic!("connect attempt hung"),
    }
}
