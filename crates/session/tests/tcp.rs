mod common;

use std::rc::Rc;
use std::time::{Duration, Instant};

use common::{
    ClientEvent, ClientRecorder, ServerEvent, ServerRecorder, Text, init_logging, pump_until,
};
use netsession::bindings::{TcpClient, TcpServer};
use netsession::error::{CONNECTION_REFUSED, CONNECTION_TIMED_OUT, SEND_QUEUE_FULL, SERVER_FULL};
use netsession::{MessageData, NetworkClient, NetworkServer, Updateable};

const TIMEOUT: Duration = Duration::from_secs(5);

fn start_server(max_clients: usize) -> (Rc<TcpServer>, Rc<ServerRecorder>, String) {
    let server = Rc::new(TcpServer::new("127.0.0.1:0", max_clients));
    let events = ServerRecorder::new();
    server.add_delegate(events.clone());
    server.start();
    assert!(server.running());
    let addr = server.local_addr().unwrap().to_string();
    (server, events, addr)
}

fn client_for(addr: &str) -> (Rc<TcpClient>, Rc<ClientRecorder>) {
    let client = Rc::new(TcpClient::new(addr, Duration::from_secs(2)));
    let events = ClientRecorder::new();
    client.add_delegate(events.clone());
    (client, events)
}

#[test]
fn test_tcp_round_trip() {
    init_logging();
    let (server, server_events, addr) = start_server(4);
    let (client, client_events) = client_for(&addr);

    client.connect();
    assert!(pump_until(&[&*server, &*client], TIMEOUT, || {
        client.connected() && server.connected_clients() == vec![1]
    }));
    assert_eq!(client.client_id(), Some(1));

    client
        .send_message(MessageData::new(42), &Text("lala"))
        .unwrap();
    assert!(pump_until(&[&*server, &*client], TIMEOUT, || {
        !server_events.texts().is_empty()
    }));
    assert_eq!(server_events.texts(), vec![(1, "lala".to_string())]);

    server
        .send_message(MessageData::new(43).with_channel(2).to_client(1), &Text("back"))
        .unwrap();
    assert!(pump_until(&[&*server, &*client], TIMEOUT, || {
        !client_events.texts().is_empty()
    }));
    assert!(client_events.events().contains(&ClientEvent::Message {
        message_type: 43,
        channel: 2,
        text: "back".to_string(),
    }));
}

#[test]
fn test_tcp_many_messages_arrive_in_order() {
    init_logging();
    let (server, server_events, addr) = start_server(4);
    let (client, _) = client_for(&addr);

    client.connect();
    assert!(pump_until(&[&*server, &*client], TIMEOUT, || client.connected()));

    let sent: Vec<String> = (0..200).map(|i| format!("message {i}")).collect();
    for text in &sent {
        client
            .send_message(MessageData::new(10), &Text(text))
            .unwrap();
    }
    assert!(pump_until(&[&*server, &*client], TIMEOUT, || {
        server_events.texts().len() == sent.len()
    }));

    let received: Vec<String> = server_events.texts().into_iter().map(|(_, t)| t).collect();
    assert_eq!(received, sent);
}

#[test]
fn test_tcp_server_drops_client_that_stops_reading() {
    init_logging();
    let (server, server_events, addr) = start_server(4);
    let (client, _) = client_for(&addr);

    client.connect();
    assert!(pump_until(&[&*server, &*client], TIMEOUT, || {
        client.connected() && server.connected_clients() == vec![1]
    }));

    // The client is not updated again, so its socket is never drained.
    let bulk = "x".repeat(64 * 1024);
    for _ in 0..400 {
        server
            .send_message(MessageData::new(10).to_client(1), &Text(&bulk))
            .unwrap();
    }
    server.update(common::STEP);

    assert!(server.connected_clients().is_empty());
    assert_eq!(server_events.count(&ServerEvent::ClientDisconnected(1)), 1);
    assert!(server_events
        .errors()
        .iter()
        .any(|e| e.code() == SEND_QUEUE_FULL));
    assert!(server.running());
}

#[test]
fn test_tcp_client_disconnect_is_seen_by_server() {
    init_logging();
    let (server, server_events, addr) = start_server(4);
    let (client, client_events) = client_for(&addr);

    client.connect();
    assert!(pump_until(&[&*server, &*client], TIMEOUT, || {
        client.connected() && !server.connected_clients().is_empty()
    }));

    client.disconnect();
    assert_eq!(client_events.count(&ClientEvent::Disconnected), 1);
    assert!(pump_until(&[&*server, &*client], TIMEOUT, || {
        server_events.count(&ServerEvent::ClientDisconnected(1)) == 1
    }));
    assert!(server.connected_clients().is_empty());
}

#[test]
fn test_tcp_stop_disconnects_clients() {
    init_logging();
    let (server, server_events, addr) = start_server(4);
    let (client, client_events) = client_for(&addr);

    client.connect();
    assert!(pump_until(&[&*server, &*client], TIMEOUT, || client.connected()));

    server.stop();
    assert_eq!(server_events.count(&ServerEvent::ClientDisconnected(1)), 1);
    assert_eq!(server_events.count(&ServerEvent::Stopped), 1);
    assert!(server.local_addr().is_none());

    assert!(pump_until(&[&*server, &*client], TIMEOUT, || !client.connected()));
    assert_eq!(client_events.count(&ClientEvent::Disconnected), 1);
}

#[test]
fn test_tcp_full_server_denies_extra_client() {
    init_logging();
    let (server, _, addr) = start_server(1);
    let (first, _) = client_for(&addr);
    let (second, second_events) = client_for(&addr);

    first.connect();
    assert!(pump_until(&[&*server, &*first], TIMEOUT, || first.connected()));

    second.connect();
    assert!(pump_until(&[&*server, &*first, &*second], TIMEOUT, || {
        second_events
            .errors()
            .iter()
            .any(|e| e.code() == SERVER_FULL)
    }));
    assert!(!second.connected());
    assert_eq!(second_events.count(&ClientEvent::Connected), 0);
    assert_eq!(server.connected_clients(), vec![1]);
}

#[test]
fn test_tcp_connect_without_listener_reports_refused() {
    init_logging();
    // Bind then drop to find a port nobody listens on.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let addr = format!("127.0.0.1:{port}");
    let (client, client_events) = client_for(&addr);

    client.connect();
    assert!(pump_until(&[&*client], TIMEOUT, || {
        !client_events.errors().is_empty()
    }));

    let errors = client_events.errors();
    assert!(errors.iter().any(|e| e.code() == CONNECTION_REFUSED
        || e.code() == CONNECTION_TIMED_OUT));
    assert_eq!(client_events.count(&ClientEvent::Disconnected), 0);
    assert!(!client.connected());
}

#[test]
fn test_tcp_update_does_not_block_while_dialing() {
    init_logging();
    // Unroutable, so the connect either hangs or fails with a network error.
    let client = Rc::new(TcpClient::new("10.255.255.1:9", Duration::from_millis(200)));
    let client_events = ClientRecorder::new();
    client.add_delegate(client_events.clone());

    client.connect();
    let mut slowest = Duration::ZERO;
    let started = Instant::now();
    while client_events.errors().is_empty() && started.elapsed() < TIMEOUT {
        let before = Instant::now();
        client.update(Duration::from_millis(10));
        slowest = slowest.max(before.elapsed());
    }

    assert!(slowest < Duration::from_millis(100), "update took {slowest:?}");
    assert_eq!(client_events.errors().len(), 1);
    assert_eq!(client_events.count(&ClientEvent::Disconnected), 0);
    assert!(!client.connected());
}

#[test]
fn test_tcp_zero_connect_timeout_times_out_on_first_tick() {
    init_logging();
    let (server, _, addr) = start_server(1);
    let client = Rc::new(TcpClient::new(addr, Duration::ZERO));
    let client_events = ClientRecorder::new();
    client.add_delegate(client_events.clone());

    client.connect();
    client.update(Duration::from_millis(5));
    server.update(Duration::from_millis(5));

    let errors = client_events.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code(), CONNECTION_TIMED_OUT);
    assert!(!client.connected());
}
