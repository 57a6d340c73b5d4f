use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;

use lanlink::{
    handler_fn, send_envelope, CancellationToken, Discovery, DiscoveryConfig, Endpoint, Error,
    JsonIncoming, JsonProtocol, MessageEnvelope, NodeIdentity, PeerAddr, PeerAddrInfo, PeerFeed,
    PeerSelection, JSON_PROTOCOL,
};

/// An endpoint listening on loopback only.
async fn local_endpoint() -> Endpoint {
    Endpoint::builder()
        .listen_addr("127.0.0.1:0".parse().unwrap())
        .bind()
        .await
        .unwrap()
}

/// A loopback endpoint with the JSON protocol registered.
async fn receiver() -> (Endpoint, JsonIncoming) {
    let endpoint = local_endpoint().await;
    let (protocol, incoming) = JsonProtocol::new();
    endpoint.register_handler(JSON_PROTOCOL, protocol).unwrap();
    (endpoint, incoming)
}

fn addr_info(endpoint: &Endpoint) -> PeerAddrInfo {
    PeerAddrInfo::new(endpoint.local_id(), endpoint.bound_sockets())
}

/// Unique per test run so parallel runs on one LAN do not see each other.
fn rendezvous(name: &str) -> String {
    let nonce = NodeIdentity::generate().unwrap().id().fmt_short();
    format!("lanlink-test-{name}-{nonce}")
}

/// Start discovery, or `None` when the host has no multicast.
async fn try_discovery(
    endpoint: &Endpoint,
    config: DiscoveryConfig,
) -> Option<(Discovery, PeerFeed)> {
    match Discovery::start(endpoint, config).await {
        Ok(started) => Some(started),
        Err(Error::DiscoveryUnavailable(e)) => {
            eprintln!("skipping, multicast unavailable: {e}");
            None
        }
        Err(e) => panic!("discovery failed: {e}"),
    }
}

#[test_log::test(tokio::test)]
async fn test_greeting_over_printed_address() {
    let (server, mut incoming) = receiver().await;
    let client = local_endpoint().await;

    // what the receiver prints is what the sender is given
    let printed = server.local_addrs()[0].to_string();
    let addr: PeerAddr = printed.parse().unwrap();
    assert_eq!(addr.id, server.local_id());

    let ctx = CancellationToken::new();
    let session = timeout(
        Duration::from_secs(5),
        client.connect(&ctx, &PeerAddrInfo::from(addr)),
    )
    .await
    .expect("connection timed out")
    .expect("connection failed");
    assert_eq!(session.remote_id(), server.local_id());

    let envelope = MessageEnvelope::new("Greeting", "Hello, securely over libp2p QUIC!");
    send_envelope(&session, &envelope).await.unwrap();

    let received = timeout(Duration::from_secs(5), incoming.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.from, client.local_id());
    assert_eq!(received.envelope, envelope);
    assert_eq!(
        received.envelope.to_string(),
        "{Type:Greeting Content:Hello, securely over libp2p QUIC!}"
    );

    session.close();
    client.close().await;
    server.close().await;
}

#[test_log::test(tokio::test)]
async fn test_both_sides_agree_on_session() {
    let (server, _incoming) = receiver().await;
    let client = local_endpoint().await;

    let session = client
        .connect(&CancellationToken::new(), &addr_info(&server))
        .await
        .unwrap();

    let inbound = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(session) = server.session(&client.local_id()) {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("server never registered the session");

    assert_eq!(inbound.remote_id(), client.local_id());
    assert_eq!(inbound.session_id(), session.session_id());
    assert!(!session.session_id().is_empty());
    assert_eq!(session.direction(), lanlink::Direction::Outbound);
    assert_eq!(inbound.direction(), lanlink::Direction::Inbound);

    // a second connect reuses the live session
    let again = client
        .connect(&CancellationToken::new(), &addr_info(&server))
        .await
        .unwrap();
    assert_eq!(again.session_id(), session.session_id());
    assert_eq!(client.connected_peers(), vec![server.local_id()]);

    client.close().await;
    server.close().await;
}

#[test_log::test(tokio::test)]
async fn test_identity_mismatch_is_refused() {
    let (server, mut incoming) = receiver().await;
    let client = local_endpoint().await;

    let impostor = NodeIdentity::generate().unwrap().id();
    let wrong = PeerAddrInfo::new(impostor, server.bound_sockets());
    let result = timeout(
        Duration::from_secs(5),
        client.connect(&CancellationToken::new(), &wrong),
    )
    .await
    .unwrap();

    match result {
        Err(Error::IdentityMismatch { expected, actual }) => {
            assert_eq!(expected, impostor);
            assert_eq!(actual, server.local_id());
        }
        other => panic!("expected identity mismatch, got {other:?}"),
    }
    assert!(client.session(&impostor).is_none());
    assert!(client.session(&server.local_id()).is_none());
    assert!(client.connected_peers().is_empty());

    // nothing may reach the handler
    let nothing = timeout(Duration::from_millis(300), incoming.next()).await;
    assert!(nothing.is_err());

    client.close().await;
    server.close().await;
}

#[test_log::test(tokio::test)]
async fn test_malformed_payload_does_not_poison_session() {
    let (server, mut incoming) = receiver().await;
    let client = local_endpoint().await;
    let session = client
        .connect(&CancellationToken::new(), &addr_info(&server))
        .await
        .unwrap();

    let mut bad = session.open_stream(JSON_PROTOCOL).await.unwrap();
    bad.write_all(b"{\"type\": \"Greeting\"").await.unwrap();
    let rejected = bad.finish().await;
    assert!(matches!(rejected, Err(Error::Decode(_))), "{rejected:?}");

    let envelope = MessageEnvelope::new("Greeting", "still here");
    send_envelope(&session, &envelope).await.unwrap();
    let received = timeout(Duration::from_secs(5), incoming.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.envelope, envelope);

    client.close().await;
    server.close().await;
}

#[test_log::test(tokio::test)]
async fn test_oversized_payload_is_rejected() {
    let server = Endpoint::builder()
        .listen_addr("127.0.0.1:0".parse().unwrap())
        .max_message_size(1024)
        .bind()
        .await
        .unwrap();
    let (protocol, _incoming) = JsonProtocol::new();
    server.register_handler(JSON_PROTOCOL, protocol).unwrap();
    let client = local_endpoint().await;
    let session = client
        .connect(&CancellationToken::new(), &addr_info(&server))
        .await
        .unwrap();

    let envelope = MessageEnvelope::new("Blob", "x".repeat(64 * 1024));
    let result = timeout(Duration::from_secs(10), send_envelope(&session, &envelope))
        .await
        .unwrap();
    assert!(matches!(result, Err(Error::Decode(_))), "{result:?}");

    client.close().await;
    server.close().await;
}

#[test_log::test(tokio::test)]
async fn test_unregistered_protocol_is_refused() {
    let (server, _incoming) = receiver().await;
    let client = local_endpoint().await;
    let session = client
        .connect(&CancellationToken::new(), &addr_info(&server))
        .await
        .unwrap();

    let result = async {
        let mut stream = session.open_stream("/chat/2.0.0").await?;
        stream.write_all(b"hello").await?;
        stream.finish().await
    }
    .await;
    assert!(
        matches!(&result, Err(Error::UnsupportedProtocol(p)) if p == "/chat/2.0.0"),
        "{result:?}"
    );
    assert!(!session.is_closed());

    client.close().await;
    server.close().await;
}

#[test_log::test(tokio::test)]
async fn test_unreachable_address_fails_within_bound() {
    let client = Endpoint::builder()
        .listen_addr("127.0.0.1:0".parse().unwrap())
        .connect_timeout(Duration::from_millis(500))
        .bind()
        .await
        .unwrap();

    // bind and drop a socket so the port is almost certainly silent
    let silent: SocketAddr = {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap()
    };
    let target = PeerAddrInfo::new(NodeIdentity::generate().unwrap().id(), [silent]);

    let started = Instant::now();
    let result = client.connect(&CancellationToken::new(), &target).await;
    assert!(matches!(result, Err(Error::Connect(_))), "{result:?}");
    assert!(started.elapsed() < Duration::from_secs(5));

    client.close().await;
}

#[test_log::test(tokio::test)]
async fn test_close_unblocks_in_flight_reads() {
    let server = local_endpoint().await;
    let (results_tx, mut results) = mpsc::channel(1);
    server
        .register_handler(
            "/hold/1",
            handler_fn(move |mut stream| {
                let results_tx = results_tx.clone();
                async move {
                    let read = stream.read_to_end().await;
                    let _ = results_tx.send(read.map(|bytes| bytes.len())).await;
                    Ok::<(), Error>(())
                }
            }),
        )
        .unwrap();

    let client = local_endpoint().await;
    let session = client
        .connect(&CancellationToken::new(), &addr_info(&server))
        .await
        .unwrap();
    let mut stream = session.open_stream("/hold/1").await.unwrap();
    stream.write_all(b"never finished").await.unwrap();

    // give the header time to reach the dispatcher
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.close().await;

    let read = timeout(Duration::from_secs(5), results.recv())
        .await
        .expect("read stayed blocked after close")
        .unwrap();
    assert!(matches!(read, Err(Error::Closed)), "{read:?}");

    let ctx = CancellationToken::new();
    assert!(matches!(
        server.open_stream(&ctx, client.local_id(), JSON_PROTOCOL).await,
        Err(Error::Closed)
    ));
    assert!(matches!(
        server.connect(&ctx, &addr_info(&client)).await,
        Err(Error::Closed)
    ));

    client.close().await;
}

#[test_log::test(tokio::test)]
async fn test_open_stream_reconnects_known_peer() {
    let (server, mut incoming) = receiver().await;
    let client = local_endpoint().await;
    let ctx = CancellationToken::new();

    let first = client.connect(&ctx, &addr_info(&server)).await.unwrap();
    first.close();
    timeout(Duration::from_secs(5), async {
        while client.session(&server.local_id()).is_some() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let envelope = MessageEnvelope::new("Note", "second session");
    lanlink::json::send_to(&client, &ctx, server.local_id(), &envelope)
        .await
        .unwrap();
    let received = timeout(Duration::from_secs(5), incoming.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.envelope, envelope);

    client.close().await;
    server.close().await;
}

#[test_log::test(tokio::test)]
async fn test_discovery_finds_receiver() {
    let token = rendezvous("find");
    let (server, mut incoming) = receiver().await;
    let client = local_endpoint().await;

    let Some((server_discovery, mut server_feed)) =
        try_discovery(&server, DiscoveryConfig::new(token.clone())).await
    else {
        return;
    };
    let Some((client_discovery, mut feed)) =
        try_discovery(&client, DiscoveryConfig::new(token)).await
    else {
        return;
    };

    let session = lanlink::select_peer(
        &client,
        &CancellationToken::new(),
        &mut feed,
        &PeerSelection::Id(server.local_id()),
        Duration::from_secs(10),
    )
    .await
    .unwrap();
    assert_eq!(session.remote_id(), server.local_id());

    let envelope = MessageEnvelope::new("Greeting", "found you");
    send_envelope(&session, &envelope).await.unwrap();
    let received = timeout(Duration::from_secs(5), incoming.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.envelope, envelope);

    // the receiver sees the sender's announcements as well
    let seen = timeout(Duration::from_secs(10), async {
        loop {
            match server_feed.next().await {
                Some(peer) if peer.id == client.local_id() => return Some(peer),
                Some(_) => continue,
                None => return None,
            }
        }
    })
    .await
    .expect("receiver never saw the sender")
    .expect("receiver feed ended early");
    assert!(!seen.addrs.is_empty());
    assert!(seen.addrs.contains(&client.bound_sockets()[0]));

    client_discovery.cancel();
    server_discovery.cancel();
    client.close().await;
    server.close().await;
}

#[test_log::test(tokio::test)]
async fn test_discovery_keeps_running_without_reader() {
    let token = rendezvous("idle");
    let announcer = local_endpoint().await;
    let listener = local_endpoint().await;

    let Some((announcing, _announcer_feed)) =
        try_discovery(&announcer, DiscoveryConfig::new(token.clone())).await
    else {
        return;
    };
    let config = DiscoveryConfig {
        announce_interval: Duration::from_millis(50),
        buffer: 4,
        ..DiscoveryConfig::new(token)
    };
    let Some((listening, mut feed)) = try_discovery(&listener, config).await else {
        return;
    };

    // nobody reads while announcements pile up past the buffer
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(listening.is_running());
    assert!(announcing.is_running());

    let peer = timeout(Duration::from_secs(10), feed.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(peer.id, announcer.local_id());

    listening.cancel();
    let rest = timeout(Duration::from_secs(2), feed.count()).await;
    assert!(rest.is_ok(), "feed did not end after cancel");

    // closing the endpoint stops discovery that is still running
    let mut late = announcing.subscribe();
    announcer.close().await;
    let ended = timeout(Duration::from_secs(2), async {
        while late.next().await.is_some() {}
    })
    .await;
    assert!(ended.is_ok(), "feed did not end after endpoint close");
    assert!(!announcing.is_running());

    listener.close().await;
}

#[test_log::test(tokio::test)]
async fn test_discovery_rejects_closed_endpoint() {
    let endpoint = local_endpoint().await;
    endpoint.close().await;
    let result = Discovery::start(&endpoint, DiscoveryConfig::new(rendezvous("closed"))).await;
    assert!(matches!(result, Err(Error::Closed)));
}
