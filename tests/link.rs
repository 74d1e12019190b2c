//! Connection lifecycle, scanning and the temperature subscription.

mod common;

use std::time::Duration;

use tokio::time::sleep;
use vibrotherm::transport::DiscoveredDevice;
use vibrotherm::{ConnectionEvent, Device, ScanEvent, SensorError};

use common::{connected_client, fresh_client, standard_probe, temp_frame};

#[tokio::test(start_paused = true)]
async fn is_connected_tracks_the_latest_transition() {
    let (client, _transport, device) = connected_client(91_234_567).await;
    assert!(client.is_connected(&device.mac));
    assert!(client.is_connected_device(&device));
    assert_eq!(client.current_device(), Some(device.clone()));

    client.disconnect(&device).await.unwrap();
    assert!(!client.is_connected(&device.mac));
    assert_eq!(client.current_device(), None);

    client.connect(&device).await.unwrap();
    assert!(client.is_connected(&device.mac));

    assert!(!client.is_connected("11:22:33:44:55:66"));
    assert!(!client.is_connected(""));
}

#[tokio::test(start_paused = true)]
async fn connect_emits_start_then_exactly_one_outcome() {
    let (client, transport, device) = fresh_client();
    transport.set_responder(standard_probe(91_234_567));
    let mut events = client.connection_events();

    client.connect(&device).await.unwrap();
    assert_eq!(events.recv().await, Some(ConnectionEvent::ConnectStart(device.clone())));
    assert_eq!(events.recv().await, Some(ConnectionEvent::ConnectSuccess(device.clone())));

    // a failing connect reports ConnectFail instead
    let ghost = Device {
        mac: String::from("00:00:00:00:00:99"),
        name: String::from("nothing here"),
        rssi: -90,
    };
    assert!(client.connect(&ghost).await.is_err());
    assert_eq!(events.recv().await, Some(ConnectionEvent::ConnectStart(ghost.clone())));
    assert!(matches!(
        events.recv().await,
        Some(ConnectionEvent::ConnectFail(failed, _)) if failed == ghost,
    ));
}

#[tokio::test(start_paused = true)]
async fn disconnecting_an_unknown_device_is_a_noop_success() {
    let (client, _transport, device) = fresh_client();
    let mut events = client.connection_events();

    client.disconnect(&device).await.unwrap();
    assert_eq!(events.recv().await, Some(ConnectionEvent::DisconnectStart(device.clone())));
    assert_eq!(events.recv().await, Some(ConnectionEvent::DisconnectEnd(device.clone())));
}

#[tokio::test(start_paused = true)]
async fn unsolicited_link_loss_fails_pending_commands_and_raises_disconnected() {
    let (client, transport, device) = connected_client(91_234_567).await;
    let mut events = client.connection_events();

    // a command that will never be answered, then the link dies under it
    transport.set_responder(|_op, _payload| Vec::new());
    let (result, ()) = tokio::join!(client.self_check(), async {
        sleep(Duration::from_millis(10)).await;
        transport.drop_link(&device.mac);
    });
    assert!(matches!(result, Err(SensorError::LinkLost(_))));

    assert_eq!(events.recv().await, Some(ConnectionEvent::Disconnected(device.clone())));
    assert!(!client.is_connected(&device.mac));
    assert_eq!(client.current_device(), None);
}

#[tokio::test(start_paused = true)]
async fn scan_deduplicates_by_mac_and_keeps_the_latest_rssi() {
    let (client, transport, device) = fresh_client();

    let mut events = client.start_scan().await.unwrap();
    assert_eq!(events.recv().await, Some(ScanEvent::Started));
    assert!(matches!(
        events.recv().await,
        Some(ScanEvent::Discovered(found)) if found.mac == device.mac,
    ));

    // a fresh advertisement for the same probe must not produce a second
    // Discovered, but its rssi wins in the snapshot
    transport.announce(DiscoveredDevice {
        mac: device.mac.clone(),
        name: device.name.clone(),
        rssi: -40,
        services: vec![vibrotherm::protocol::make_probe_service_uuid()],
    });
    sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());

    let snapshot = client.discovered_devices();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].rssi, -40);

    client.stop_scan();
    loop {
        match events.recv().await {
            Some(ScanEvent::Ended) => break,
            Some(_) => continue,
            None => panic!("scan stream ended without ScanEvent::Ended"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn restarting_inside_the_cooldown_is_busy() {
    let (client, _transport, _device) = fresh_client();

    let mut events = client.start_scan().await.unwrap();
    client.stop_scan();
    loop {
        match events.recv().await {
            Some(ScanEvent::Ended) | None => break,
            Some(_) => continue,
        }
    }

    // inside the cooldown window: refused immediately
    assert!(matches!(client.start_scan().await, Err(SensorError::Busy(_))));

    // after the window has elapsed: accepted again
    sleep(Duration::from_millis(1100)).await;
    let mut events = client.start_scan().await.unwrap();
    assert_eq!(events.recv().await, Some(ScanEvent::Started));
    client.stop_scan();
}

#[tokio::test(start_paused = true)]
async fn starting_while_scanning_is_busy() {
    let (client, _transport, _device) = fresh_client();

    let _events = client.start_scan().await.unwrap();
    assert!(matches!(client.start_scan().await, Err(SensorError::Busy(_))));
    client.stop_scan();
}

#[tokio::test(start_paused = true)]
async fn the_name_allowlist_is_exact_and_toggleable() {
    let (transport, discovered) = vibrotherm::transport::mock::MockTransport::with_sample_device();
    let mut config = vibrotherm::ClientConfig::default();
    config.scan_filter.names = vec![String::from("some other probe")];
    config.scan_filter.names_enabled = true;
    let client =
        vibrotherm::SensorClient::initialize(config, std::sync::Arc::new(transport.clone())).unwrap();

    let mut events = client.start_scan().await.unwrap();
    assert_eq!(events.recv().await, Some(ScanEvent::Started));

    // the sample device's name is not on the allowlist
    sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
    assert!(client.discovered_devices().is_empty());
    let _ = discovered;
    client.stop_scan();
}

#[tokio::test(start_paused = true)]
async fn temp_stream_delivers_and_the_stop_race_is_observable() {
    let (client, transport, device) = connected_client(91_234_567).await;

    let mut readings = client.sample_temp(0.97).await.unwrap();

    transport.inject(&device.mac, temp_frame(25.0));
    let reading = readings.recv().await.unwrap();
    assert!((reading.temp - 25.0).abs() < 1e-6);
    assert!((reading.battery_voltage - 3.7).abs() < 1e-6);

    // local mute only: the device is still transmitting, values still cross
    // the link, none is delivered locally
    client.remove_sample_temp_callback().await.unwrap();
    sleep(Duration::from_millis(20)).await;
    transport.inject(&device.mac, temp_frame(26.0));
    sleep(Duration::from_millis(20)).await;
    assert!(readings.try_recv().is_err());

    // the network-level stop; its ack guarantees silence and closes the stream
    client.stop_sample_temp().await.unwrap();
    transport.inject(&device.mac, temp_frame(27.0));
    assert_eq!(readings.recv().await, None);
}

#[tokio::test(start_paused = true)]
async fn a_residual_value_can_arrive_between_mute_and_stop() {
    let (client, transport, device) = connected_client(91_234_567).await;

    let mut readings = client.sample_temp(0.97).await.unwrap();

    // a value that was already on the wire when the caller decided to stop
    // is still delivered: only the stop ack guarantees silence
    transport.inject(&device.mac, temp_frame(30.0));
    sleep(Duration::from_millis(20)).await;
    client.remove_sample_temp_callback().await.unwrap();

    let reading = readings.recv().await.unwrap();
    assert!((reading.temp - 30.0).abs() < 1e-6);

    client.stop_sample_temp().await.unwrap();
    assert_eq!(readings.recv().await, None);
}

#[tokio::test(start_paused = true)]
async fn disconnect_all_clears_every_connection() {
    let (client, transport, device) = connected_client(91_234_567).await;

    let second = DiscoveredDevice {
        mac: String::from("C4:64:E3:A0:00:02"),
        name: String::from("VTP-30_91000002"),
        rssi: -70,
        services: vec![vibrotherm::protocol::make_probe_service_uuid()],
    };
    transport.add_device(second.clone());
    let second = Device::from(&second);
    client.connect(&second).await.unwrap();

    assert!(client.is_connected(&device.mac));
    assert!(client.is_connected(&second.mac));
    // current follows the most recent successful connect
    assert_eq!(client.current_device(), Some(second.clone()));

    client.disconnect_all().await;
    assert!(!client.is_connected(&device.mac));
    assert!(!client.is_connected(&second.mac));
    assert_eq!(client.current_device(), None);
}
