//! Integration tests for the TCP transport and virtual circuits over it
//!
//! Each test starts its own daemon on an ephemeral port and connects real
//! `TcpBus` clients to it.

use std::sync::Arc;
use std::time::Duration;

use rvbench_core::subject::{VC_DISCONNECTED_ADVISORY, VC_REQUEST_SUBJECT, VC_RESPONSE_SUBJECT};
use rvbench_core::*;
use tokio::sync::oneshot;

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

struct TestDaemon {
    address: String,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestDaemon {
    async fn start() -> Self {
        let daemon = Daemon::bind("127.0.0.1:0").await.unwrap();
        let address = daemon.local_addr().unwrap().to_string();
        let (shutdown, stop) = oneshot::channel::<()>();
        tokio::spawn(daemon.run_until(async move {
            let _ = stop.await;
        }));
        Self {
            address,
            shutdown: Some(shutdown),
        }
    }

    async fn client(&self, service: &str, name: &str) -> TcpBus {
        let params = TransportParams::new(service, "", &self.address);
        TcpBus::connect(params, name).await.unwrap()
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn recv_within(subscription: &mut Subscription) -> Option<Message> {
    tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .ok()
        .flatten()
}

// ----------------------------------------------------------------------------
// Routing
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_publish_routes_between_connections() {
    let daemon = TestDaemon::start().await;
    let server = daemon.client("7522:7523", "server").await;
    let client = daemon.client("7522:7524", "client").await;

    let mut locate = server.subscribe("TIBRV.LOCATE").await.unwrap();
    let mut message = Message::to_subject("TIBRV.LOCATE");
    message.update_u32("x", 11);
    client.publish(message).await.unwrap();

    let received = recv_within(&mut locate).await.unwrap();
    assert_eq!(received.get_u32("x"), Some(11));
}

#[tokio::test]
async fn test_domains_are_isolated() {
    let daemon = TestDaemon::start().await;
    let server = daemon.client("7522", "server").await;
    let stranger = daemon.client("7600", "stranger").await;

    let mut locate = server.subscribe("TIBRV.LOCATE").await.unwrap();
    stranger
        .publish(Message::to_subject("TIBRV.LOCATE"))
        .await
        .unwrap();

    assert!(tokio::time::timeout(Duration::from_millis(200), locate.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let daemon = TestDaemon::start().await;
    let bus = daemon.client("7522", "solo").await;

    let mut kept = bus.subscribe("A.>").await.unwrap();
    let mut dropped = bus.subscribe("A.B").await.unwrap();
    dropped.unsubscribe();

    bus.publish(Message::to_subject("A.B")).await.unwrap();
    assert!(recv_within(&mut kept).await.is_some());
    assert!(dropped.recv().await.is_none());
}

#[tokio::test]
async fn test_send_request_over_daemon() {
    let daemon = TestDaemon::start().await;
    let server = daemon.client("7522", "server").await;
    let client = daemon.client("7522", "client").await;

    let mut requests = server.subscribe("TIBRV.LOCATE").await.unwrap();
    tokio::spawn(async move {
        let request = requests.recv().await.unwrap();
        let mut reply = Message::new();
        reply.update_string("inbox", "_INBOX.server");
        server.send_reply(reply, &request).await.unwrap();
    });

    let reply = client
        .send_request(Message::to_subject("TIBRV.LOCATE"), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply.get_string("inbox"), Some("_INBOX.server"));
}

#[tokio::test]
async fn test_dropped_bus_still_delivers_accepted_publishes() {
    let daemon = TestDaemon::start().await;
    let server = daemon.client("7522", "server").await;
    let mut inbox = server.subscribe("A.B").await.unwrap();

    let publisher = daemon.client("7522", "publisher").await;
    for n in 0..20 {
        let mut message = Message::to_subject("A.B");
        message.update_u32("n", n);
        publisher.publish(message).await.unwrap();
    }
    drop(publisher);

    for n in 0..20 {
        let received = recv_within(&mut inbox).await.unwrap();
        assert_eq!(received.get_u32("n"), Some(n));
    }
}

#[tokio::test]
async fn test_close_flushes_then_refuses_publishes() {
    let daemon = TestDaemon::start().await;
    let server = daemon.client("7522", "server").await;
    let mut inbox = server.subscribe("A.B").await.unwrap();

    let publisher = daemon.client("7522", "publisher").await;
    publisher.publish(Message::to_subject("A.B")).await.unwrap();
    publisher.close().await.unwrap();

    assert!(!publisher.is_connected());
    assert!(matches!(
        publisher.publish(Message::to_subject("A.B")).await,
        Err(BusError::Closed)
    ));
    assert!(recv_within(&mut inbox).await.is_some());
}

#[tokio::test]
async fn test_daemon_shutdown_ends_subscriptions() {
    let mut daemon = TestDaemon::start().await;
    let bus = daemon.client("7522", "solo").await;
    let mut subscription = bus.subscribe("A.B").await.unwrap();

    if let Some(shutdown) = daemon.shutdown.take() {
        shutdown.send(()).unwrap();
    }

    assert!(tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .unwrap()
        .is_none());
    assert!(bus.publish(Message::to_subject("A.B")).await.is_err());
}

// ----------------------------------------------------------------------------
// Virtual Circuits
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_virtual_circuit_over_tcp() {
    let daemon = TestDaemon::start().await;
    let server_bus: Arc<dyn Bus> = Arc::new(daemon.client("7522", "server").await);
    let client_bus: Arc<dyn Bus> = Arc::new(daemon.client("7522", "client").await);

    let acceptor = VcAcceptor::create(Arc::clone(&server_bus));
    let mut connects = acceptor.subscribe().await.unwrap();

    let client = VirtualCircuit::connect(client_bus, acceptor.connect_subject())
        .await
        .unwrap();
    let request = recv_within(&mut connects).await.unwrap();
    let server = acceptor.accept(&request).await.unwrap();
    client.await_connected(Duration::from_secs(2)).await.unwrap();

    let mut work = server.subscribe(VC_REQUEST_SUBJECT).await.unwrap();
    let mut replies = client.subscribe(VC_RESPONSE_SUBJECT).await.unwrap();
    let mut advisories = client.subscribe(VC_DISCONNECTED_ADVISORY).await.unwrap();

    let mut outgoing = Message::to_subject(VC_REQUEST_SUBJECT).with_reply_subject(VC_RESPONSE_SUBJECT);
    outgoing.update_u32("x", 20);
    outgoing.update_u32("y", 22);
    client.send(outgoing).await.unwrap();

    let incoming = recv_within(&mut work).await.unwrap();
    let mut reply = Message::new();
    reply.update_u32("sum", incoming.get_u32("x").unwrap() + incoming.get_u32("y").unwrap());
    server.send_reply(reply, &incoming).await.unwrap();
    assert_eq!(recv_within(&mut replies).await.unwrap().get_u32("sum"), Some(42));

    server.close().await.unwrap();
    assert!(recv_within(&mut advisories).await.is_some());
    assert_eq!(client.state(), VcState::Disconnected);
}

#[tokio::test]
async fn test_circuit_close_reaches_peer_after_bus_drop() {
    let daemon = TestDaemon::start().await;
    let server_bus: Arc<dyn Bus> = Arc::new(daemon.client("7522", "server").await);
    let client_bus: Arc<dyn Bus> = Arc::new(daemon.client("7522", "client").await);

    let acceptor = VcAcceptor::create(Arc::clone(&server_bus));
    let mut connects = acceptor.subscribe().await.unwrap();

    let client = VirtualCircuit::connect(client_bus, acceptor.connect_subject())
        .await
        .unwrap();
    let request = recv_within(&mut connects).await.unwrap();
    let server = acceptor.accept(&request).await.unwrap();
    client.await_connected(Duration::from_secs(2)).await.unwrap();
    let mut advisories = server.subscribe(VC_DISCONNECTED_ADVISORY).await.unwrap();

    // same order as a client run followed by process exit
    client.close().await.unwrap();
    drop(client);

    assert!(recv_within(&mut advisories).await.is_some());
    assert_eq!(server.state(), VcState::Disconnected);
}
