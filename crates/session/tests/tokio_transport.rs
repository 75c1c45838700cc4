mod common;

use std::rc::Rc;
use std::time::Duration;

use common::{
    ClientEvent, ClientRecorder, ServerEvent, ServerRecorder, Text, init_logging, pump_until,
};
use netsession::bindings::{TokioClient, TokioServer, TransportRuntime};
use netsession::error::SERVER_FULL;
use netsession::{MessageData, NetworkClient, NetworkError, NetworkServer};

const TIMEOUT: Duration = Duration::from_secs(5);

fn start_server(
    runtime: &TransportRuntime,
    max_clients: usize,
) -> (Rc<TokioServer>, Rc<ServerRecorder>, String) {
    let server = Rc::new(TokioServer::new("127.0.0.1:0", max_clients, runtime.clone()));
    let events = ServerRecorder::new();
    server.add_delegate(events.clone());
    server.start();
    let addr = server.local_addr().unwrap().to_string();
    (server, events, addr)
}

fn client_for(runtime: &TransportRuntime, addr: &str) -> (Rc<TokioClient>, Rc<ClientRecorder>) {
    let client = Rc::new(TokioClient::new(addr, Duration::from_secs(2), runtime.clone()));
    let events = ClientRecorder::new();
    client.add_delegate(events.clone());
    (client, events)
}

#[test]
fn test_tokio_round_trip() {
    init_logging();
    let runtime = TransportRuntime::new().unwrap();
    let (server, server_events, addr) = start_server(&runtime, 4);
    let (client, client_events) = client_for(&runtime, &addr);

    client.connect();
    assert!(pump_until(&[&*server, &*client], TIMEOUT, || client.connected()));
    assert_eq!(client.client_id(), Some(1));
    assert_eq!(server_events.connected_ids(), vec![1]);

    client
        .send_message(MessageData::new(42), &Text("lala"))
        .unwrap();
    assert!(pump_until(&[&*server, &*client], TIMEOUT, || {
        !server_events.texts().is_empty()
    }));
    assert_eq!(server_events.texts(), vec![(1, "lala".to_string())]);

    server
        .send_message(MessageData::new(42).to_client(1), &Text("lala"))
        .unwrap();
    assert!(pump_until(&[&*server, &*client], TIMEOUT, || {
        !client_events.texts().is_empty()
    }));
    assert_eq!(client_events.texts(), vec!["lala".to_string()]);
}

#[test]
fn test_tokio_broadcast_reaches_every_client() {
    init_logging();
    let runtime = TransportRuntime::new().unwrap();
    let (server, _, addr) = start_server(&runtime, 4);
    let (first, first_events) = client_for(&runtime, &addr);
    let (second, second_events) = client_for(&runtime, &addr);

    first.connect();
    second.connect();
    assert!(pump_until(&[&*server, &*first, &*second], TIMEOUT, || {
        first.connected() && second.connected()
    }));

    server
        .send_message(MessageData::new(20), &Text("everyone"))
        .unwrap();
    assert!(pump_until(&[&*server, &*first, &*second], TIMEOUT, || {
        !first_events.texts().is_empty() && !second_events.texts().is_empty()
    }));
    assert_eq!(first_events.texts(), vec!["everyone".to_string()]);
    assert_eq!(second_events.texts(), vec!["everyone".to_string()]);
}

#[test]
fn test_tokio_stop_and_disconnect() {
    init_logging();
    let runtime = TransportRuntime::new().unwrap();
    let (server, server_events, addr) = start_server(&runtime, 4);
    let (first, first_events) = client_for(&runtime, &addr);
    let (second, _) = client_for(&runtime, &addr);

    first.connect();
    second.connect();
    assert!(pump_until(&[&*server, &*first, &*second], TIMEOUT, || {
        server.connected_clients().len() == 2 && first.connected() && second.connected()
    }));

    let leaving = second.client_id().unwrap();
    second.disconnect();
    assert!(pump_until(&[&*server, &*first, &*second], TIMEOUT, || {
        server_events.count(&ServerEvent::ClientDisconnected(leaving)) == 1
    }));

    server.stop();
    assert_eq!(server_events.count(&ServerEvent::Stopped), 1);
    assert!(pump_until(&[&*server, &*first], TIMEOUT, || !first.connected()));
    assert_eq!(first_events.count(&ClientEvent::Disconnected), 1);
    assert_eq!(server_events.count(&ServerEvent::ClientDisconnected(leaving)), 1);
}

#[test]
fn test_tokio_full_server_denies_extra_client() {
    init_logging();
    let runtime = TransportRuntime::new().unwrap();
    let (server, _, addr) = start_server(&runtime, 1);
    let (first, _) = client_for(&runtime, &addr);
    let (second, second_events) = client_for(&runtime, &addr);

    first.connect();
    assert!(pump_until(&[&*server, &*first], TIMEOUT, || first.connected()));

    second.connect();
    assert!(pump_until(&[&*server, &*first, &*second], TIMEOUT, || {
        second_events.errors().iter().any(|e| {
            matches!(e, NetworkError::Remote { code, .. } if *code == SERVER_FULL)
        })
    }));
    assert!(!second.connected());
    assert_eq!(server.connected_clients(), vec![1]);
}
