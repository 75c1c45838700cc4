mod common;

use std::rc::Rc;
use std::time::Duration;

use common::{
    ClientEvent, ClientRecorder, ServerEvent, ServerRecorder, Text, init_logging, pump_until,
};
use netsession::bindings::udp::PacketLossSimulation;
use netsession::bindings::{UdpClient, UdpServer};
use netsession::error::SERVER_FULL;
use netsession::{MessageData, NetworkClient, NetworkServer, UdpConfig};

const TIMEOUT: Duration = Duration::from_secs(10);

fn start_server(
    max_clients: usize,
    config: UdpConfig,
) -> (Rc<UdpServer>, Rc<ServerRecorder>, String) {
    let server = Rc::new(UdpServer::new("127.0.0.1:0", max_clients, config));
    let events = ServerRecorder::new();
    server.add_delegate(events.clone());
    server.start();
    let addr = server.local_addr().unwrap().to_string();
    (server, events, addr)
}

fn client_for(addr: &str, config: UdpConfig) -> (Rc<UdpClient>, Rc<ClientRecorder>) {
    let client = Rc::new(UdpClient::new(addr, Duration::from_secs(5), config));
    let events = ClientRecorder::new();
    client.add_delegate(events.clone());
    (client, events)
}

fn lossy() -> UdpConfig {
    UdpConfig {
        resend_interval_ms: 20,
        loss_simulation: Some(PacketLossSimulation::lossy(5.0)),
        ..Default::default()
    }
}

#[test]
fn test_udp_round_trip() {
    init_logging();
    let (server, server_events, addr) = start_server(4, UdpConfig::default());
    let (client, client_events) = client_for(&addr, UdpConfig::default());

    client.connect();
    assert!(pump_until(&[&*server, &*client], TIMEOUT, || client.connected()));
    assert_eq!(client.client_id(), Some(1));

    client
        .send_message(MessageData::new(42), &Text("lala"))
        .unwrap();
    assert!(pump_until(&[&*server, &*client], TIMEOUT, || {
        !server_events.texts().is_empty()
    }));
    assert_eq!(server_events.texts(), vec![(1, "lala".to_string())]);

    server
        .send_message(MessageData::new(42).with_channel(1).to_client(1), &Text("back"))
        .unwrap();
    assert!(pump_until(&[&*server, &*client], TIMEOUT, || {
        !client_events.texts().is_empty()
    }));
    assert!(client_events.events().contains(&ClientEvent::Message {
        message_type: 42,
        channel: 1,
        text: "back".to_string(),
    }));
}

#[test]
fn test_udp_ordered_delivery_under_loss() {
    init_logging();
    let (server, server_events, addr) = start_server(4, lossy());
    let (client, _) = client_for(&addr, lossy());

    client.connect();
    assert!(pump_until(&[&*server, &*client], TIMEOUT, || client.connected()));

    let sent: Vec<String> = (0..100).map(|i| format!("ordered {i}")).collect();
    for text in &sent {
        client
            .send_message(MessageData::new(12), &Text(text))
            .unwrap();
    }
    assert!(pump_until(&[&*server, &*client], TIMEOUT, || {
        server_events.texts().len() >= sent.len()
    }));

    let received: Vec<String> = server_events.texts().into_iter().map(|(_, t)| t).collect();
    assert_eq!(received, sent);
}

#[test]
fn test_udp_heavy_loss_and_reordering_keep_every_channel_ordered() {
    init_logging();
    let rough = || UdpConfig {
        resend_interval_ms: 20,
        loss_simulation: Some(PacketLossSimulation {
            enabled: true,
            loss_percent: 25.0,
            min_latency_ms: 0,
            max_latency_ms: 15,
            jitter_ms: 5,
        }),
        ..Default::default()
    };
    let (server, server_events, addr) = start_server(4, rough());
    let (client, _) = client_for(&addr, rough());

    client.connect();
    assert!(pump_until(&[&*server, &*client], TIMEOUT, || client.connected()));

    let total = 400;
    for i in 0..total {
        let channel = i % 2;
        client
            .send_message(
                MessageData::new(31).with_channel(channel),
                &Text(&format!("{channel}:{i}")),
            )
            .unwrap();
    }
    assert!(pump_until(&[&*server, &*client], TIMEOUT, || {
        server_events.texts().len() >= total as usize
    }));

    let received: Vec<String> = server_events.texts().into_iter().map(|(_, t)| t).collect();
    assert_eq!(received.len(), total as usize);
    for channel in 0..2 {
        let order: Vec<String> = received
            .iter()
            .filter(|t| t.starts_with(&format!("{channel}:")))
            .cloned()
            .collect();
        let expected: Vec<String> = (0..total)
            .filter(|i| i % 2 == channel)
            .map(|i| format!("{channel}:{i}"))
            .collect();
        assert_eq!(order, expected);
    }
}

#[test]
fn test_udp_channels_are_independent() {
    init_logging();
    let (server, server_events, addr) = start_server(4, UdpConfig::default());
    let (client, _) = client_for(&addr, UdpConfig::default());

    client.connect();
    assert!(pump_until(&[&*server, &*client], TIMEOUT, || client.connected()));

    for i in 0..10 {
        let channel = i % 2;
        client
            .send_message(
                MessageData::new(30).with_channel(channel),
                &Text(&format!("{channel}:{i}")),
            )
            .unwrap();
    }
    assert!(pump_until(&[&*server, &*client], TIMEOUT, || {
        server_events.texts().len() == 10
    }));

    for channel in ["0:", "1:"] {
        let order: Vec<String> = server_events
            .texts()
            .into_iter()
            .map(|(_, t)| t)
            .filter(|t| t.starts_with(channel))
            .collect();
        let mut sorted = order.clone();
        sorted.sort_by_key(|t| t[2..].parse::<u32>().unwrap_or(0));
        assert_eq!(order, sorted);
    }
}

#[test]
fn test_udp_disconnect_and_stop() {
    init_logging();
    let (server, server_events, addr) = start_server(4, UdpConfig::default());
    let (first, first_events) = client_for(&addr, UdpConfig::default());
    let (second, _) = client_for(&addr, UdpConfig::default());

    first.connect();
    second.connect();
    assert!(pump_until(&[&*server, &*first, &*second], TIMEOUT, || {
        first.connected() && second.connected() && server.connected_clients().len() == 2
    }));

    let leaving = second.client_id().unwrap();
    second.disconnect();
    assert!(pump_until(&[&*server, &*first], TIMEOUT, || {
        server_events.count(&ServerEvent::ClientDisconnected(leaving)) == 1
    }));

    server.stop();
    assert_eq!(server_events.count(&ServerEvent::Stopped), 1);
    assert!(pump_until(&[&*first], TIMEOUT, || !first.connected()));
    assert_eq!(first_events.count(&ClientEvent::Disconnected), 1);
}

#[test]
fn test_udp_full_server_denies() {
    init_logging();
    let (server, _, addr) = start_server(1, UdpConfig::default());
    let (first, _) = client_for(&addr, UdpConfig::default());
    let (second, second_events) = client_for(&addr, UdpConfig::default());

    first.connect();
    assert!(pump_until(&[&*server, &*first], TIMEOUT, || first.connected()));

    second.connect();
    assert!(pump_until(&[&*server, &*first, &*second], TIMEOUT, || {
        !second_events.errors().is_empty()
    }));
    assert_eq!(second_events.errors()[0].code(), SERVER_FULL);
    assert!(!second.connected());
    assert_eq!(second_events.count(&ClientEvent::Connected), 0);
}

#[test]
fn test_udp_latency_is_measured() {
    init_logging();
    let (server, _, addr) = start_server(4, UdpConfig::default());
    let (client, _) = client_for(&addr, UdpConfig::default());

    client.connect();
    assert!(pump_until(&[&*server, &*client], TIMEOUT, || client.connected()));
    assert!(client.latency().is_none());

    client
        .send_message(MessageData::new(50), &Text("measure"))
        .unwrap();
    assert!(pump_until(&[&*server, &*client], TIMEOUT, || {
        client.latency().is_some()
    }));
    assert!(client.stats().is_some_and(|stats| stats.packets_sent > 0));
}
