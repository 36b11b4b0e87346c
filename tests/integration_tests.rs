//! End-to-end tests over the in-memory medium.
//!
//! Each test wires two or three complete beacons to one `MemoryHub` and
//! drives them through the public `BeaconNode` / `SessionManager` API.

use beacon_core::{
    BeaconConfig, BeaconError, BeaconNode, INCIDENT_COMMAND, LinkState, SessionEvent,
    StoragePaths, TEAM_LEAD, Target, TeardownReason, server_reply,
};
use beacon_integration_tests::{TestNode, eventually, test_config};
use beacon_transport::{LINK_MDU, MemoryHub, MeshConfig, MeshTransport, SignalQuality, Transport};
use chrono::{Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const PATH_TIMEOUT: Duration = Duration::from_secs(5);

/// Server hosting the uplink endpoint, already announced
async fn serving(hub: &MemoryHub, name: &str) -> TestNode {
    let mut server = TestNode::start(hub, name);
    server.node.serve().unwrap();
    server.node.announce().await.unwrap();
    server
}

/// Client with an ACTIVE Incident Command uplink to `server`
async fn linked_client(hub: &MemoryHub, server: &mut TestNode, name: &str) -> TestNode {
    let mut client = TestNode::start(hub, name);
    let address = server.node.uplink_address().unwrap();
    client
        .node
        .sessions()
        .connect_role(INCIDENT_COMMAND, address, PATH_TIMEOUT)
        .await
        .unwrap();
    client
        .wait_for(|event| matches!(event, SessionEvent::Established { .. }))
        .await;
    server
        .wait_for(|event| matches!(event, SessionEvent::RemoteIdentified { .. }))
        .await;
    client
}

// ============================================================================
// Identity
// ============================================================================

#[tokio::test]
async fn test_identity_survives_restart() {
    let dir = TempDir::new().unwrap();
    let hub = MemoryHub::default();
    let start = || {
        let transport: Arc<dyn Transport> = Arc::new(MeshTransport::start(
            Arc::new(hub.attach()),
            MeshConfig::default(),
        ));
        BeaconNode::start(BeaconConfig::default(), StoragePaths::new(dir.path()), transport)
            .unwrap()
    };

    let first = start();
    let identity_file = first.paths().identity();
    assert!(identity_file.exists());
    let fingerprint = first.identity().fingerprint();
    let bytes = std::fs::read(&identity_file).unwrap();
    drop(first);

    let second = start();
    assert_eq!(second.identity().fingerprint(), fingerprint);
    assert_eq!(std::fs::read(&identity_file).unwrap(), bytes);
}

// ============================================================================
// Connect, resolve, establish
// ============================================================================

#[tokio::test]
async fn test_connect_role_waits_for_path_then_establishes() {
    let hub = MemoryHub::default();
    let mut server = TestNode::start(&hub, "Incident Command");
    server.node.serve().unwrap();
    let server_identity = *server.node.identity().public();
    let address = server.node.uplink_address().unwrap();

    // Out of range, the path request goes nowhere
    server.medium.set_in_range(false);

    let mut client = TestNode::start(&hub, "Field Unit");
    let sessions = Arc::clone(client.node.sessions());
    let connect = tokio::spawn(async move {
        sessions
            .connect_role(INCIDENT_COMMAND, address, PATH_TIMEOUT)
            .await
    });

    let tracked = loop {
        if let Some(link) = client.node.sessions().link(INCIDENT_COMMAND).await {
            break link;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(tracked.state(), LinkState::Pending);

    server.medium.set_in_range(true);
    server.node.announce().await.unwrap();

    let link = connect.await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&link, &tracked));

    client
        .wait_for(|event| matches!(event, SessionEvent::Established { .. }))
        .await;
    assert!(link.is_active());

    match client
        .wait_for(|event| matches!(event, SessionEvent::RemoteIdentified { .. }))
        .await
    {
        SessionEvent::RemoteIdentified { identity, name, .. } => {
            assert_eq!(identity, server_identity);
            assert_eq!(name, INCIDENT_COMMAND);
        }
        _ => unreachable!(),
    }

    // The resolved destination is remembered
    assert!(client.node.store().get(&address).is_some());

    let records = client.flushed_records().await;
    assert!(records.contains(&format!("Establishing link with {INCIDENT_COMMAND} [{address}]...")));
    assert!(records.contains(&format!("Uplink to {INCIDENT_COMMAND} [{address}] established.")));
}

#[tokio::test]
async fn test_unreachable_role_times_out() {
    let hub = MemoryHub::default();
    let client = TestNode::start(&hub, "Field Unit");
    let nowhere = "00112233445566778899aabbccddeeff".parse().unwrap();

    let started = std::time::Instant::now();
    let result = client
        .node
        .sessions()
        .connect_role(TEAM_LEAD, nowhere, Duration::from_millis(300))
        .await;

    assert_eq!(result.unwrap_err(), BeaconError::PathTimedOut(nowhere));
    assert!(started.elapsed() < Duration::from_millis(300 + 100 + 200));
    assert!(client.node.sessions().link(TEAM_LEAD).await.is_none());
    assert!(client.flushed_records().await.contains("uplink timed out."));
}

#[tokio::test]
async fn test_server_identifies_client() {
    let hub = MemoryHub::default();
    let mut server = serving(&hub, "Incident Command").await;
    let client = linked_client(&hub, &mut server, "Field Unit").await;

    let inbound = server.node.sessions().latest_inbound().await.unwrap();
    assert!(inbound.is_active());
    assert_eq!(inbound.peer(), Some(*client.node.identity().public()));

    let client_fp = client.node.identity().fingerprint();
    eventually(|| server.records().contains(&format!("Client identified as {client_fp}."))).await;
}

// ============================================================================
// Messaging
// ============================================================================

#[tokio::test]
async fn test_message_and_reply() {
    let hub = MemoryHub::default();
    let mut server = serving(&hub, "Incident Command").await;
    let mut client = linked_client(&hub, &mut server, "Field Unit").await;
    client.medium.set_signal(SignalQuality::new(-92, 8.5));

    client
        .node
        .sessions()
        .send(&Target::from(INCIDENT_COMMAND), "all quiet at the ridge")
        .await
        .unwrap();

    let (text, provenance) = match server
        .wait_for(|event| matches!(event, SessionEvent::Message { .. }))
        .await
    {
        SessionEvent::Message {
            text, provenance, ..
        } => (text, provenance),
        _ => unreachable!(),
    };
    assert_eq!(text, "all quiet at the ridge");
    assert!(provenance.identified);
    assert_eq!(provenance.peer, Some(*client.node.identity().public()));
    assert_eq!(provenance.signal, SignalQuality::new(-92, 8.5));

    let reply = server_reply(&text, &provenance);
    server
        .node
        .sessions()
        .send(&Target::LatestInbound, reply.clone())
        .await
        .unwrap();

    match client
        .wait_for(|event| matches!(event, SessionEvent::Message { .. }))
        .await
    {
        SessionEvent::Message { name, text, .. } => {
            assert_eq!(name, INCIDENT_COMMAND);
            assert_eq!(text, reply);
            assert!(text.starts_with("I received \"all quiet at the ridge\" over the link from "));
        }
        _ => unreachable!(),
    }

    let client_fp = client.node.identity().fingerprint();
    eventually(|| {
        server.records().contains(&format!(
            "Client [{client_fp} (VERIFIED)] RSSI:-92 SNR:8.5 -- all quiet at the ridge"
        ))
    })
    .await;
}

#[tokio::test]
async fn test_oversized_message_is_rejected_without_transmitting() {
    let hub = MemoryHub::default();
    let mut server = serving(&hub, "Incident Command").await;
    let client = linked_client(&hub, &mut server, "Field Unit").await;

    let frames_before = client.transport.stats().frames_sent;
    let result = client
        .node
        .sessions()
        .send(&Target::from(INCIDENT_COMMAND), "x".repeat(LINK_MDU + 1))
        .await;

    assert_eq!(
        result,
        Err(BeaconError::PayloadTooLarge {
            size: LINK_MDU + 1,
            mdu: LINK_MDU
        })
    );
    assert_eq!(client.transport.stats().frames_sent, frames_before);
    assert!(client.flushed_records().await.contains(&format!(
        "MDU error, sent {}/{} bytes.",
        LINK_MDU + 1,
        LINK_MDU
    )));

    // Exactly MDU bytes still go through
    client
        .node
        .sessions()
        .send(&Target::from(INCIDENT_COMMAND), "x".repeat(LINK_MDU))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_latest_inbound_receives_replies() {
    let hub = MemoryHub::default();
    let mut server = serving(&hub, "Incident Command").await;
    let first = linked_client(&hub, &mut server, "Unit One").await;
    let mut second = linked_client(&hub, &mut server, "Unit Two").await;

    let latest = server.node.sessions().latest_inbound().await.unwrap();
    assert_eq!(latest.peer(), Some(*second.node.identity().public()));

    first
        .node
        .sessions()
        .send(&Target::from(INCIDENT_COMMAND), "from one")
        .await
        .unwrap();
    server
        .wait_for(|event| matches!(event, SessionEvent::Message { .. }))
        .await;
    server
        .node
        .sessions()
        .send(&Target::LatestInbound, "ack")
        .await
        .unwrap();

    match second
        .wait_for(|event| matches!(event, SessionEvent::Message { .. }))
        .await
    {
        SessionEvent::Message { text, .. } => assert_eq!(text, "ack"),
        _ => unreachable!(),
    }
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_peer_close_reaches_closed_by_peer() {
    let hub = MemoryHub::default();
    let mut server = serving(&hub, "Incident Command").await;
    let mut client = linked_client(&hub, &mut server, "Field Unit").await;
    let link = client.node.sessions().link(INCIDENT_COMMAND).await.unwrap();
    let address = server.node.uplink_address().unwrap();

    server.node.sessions().teardown_all().await;

    match client
        .wait_for(|event| matches!(event, SessionEvent::Closed { .. }))
        .await
    {
        SessionEvent::Closed { name, reason, .. } => {
            assert_eq!(name, INCIDENT_COMMAND);
            assert_eq!(reason, TeardownReason::ClosedByPeer);
        }
        _ => unreachable!(),
    }
    assert_eq!(link.state(), LinkState::Closed(TeardownReason::ClosedByPeer));
    assert!(
        client
            .flushed_records()
            .await
            .contains(&format!("{INCIDENT_COMMAND} [{address}] uplink closed by peer."))
    );

    let result = client
        .node
        .sessions()
        .send(&Target::from(INCIDENT_COMMAND), "anyone?")
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_client_teardown_closes_server_side() {
    let hub = MemoryHub::default();
    let mut server = serving(&hub, "Incident Command").await;
    let client = linked_client(&hub, &mut server, "Field Unit").await;
    let link = client.node.sessions().link(INCIDENT_COMMAND).await.unwrap();

    client.node.shutdown().await;
    assert_eq!(link.teardown_reason(), Some(TeardownReason::ClosedLocally));

    match server
        .wait_for(|event| matches!(event, SessionEvent::Closed { .. }))
        .await
    {
        SessionEvent::Closed { reason, .. } => assert_eq!(reason, TeardownReason::ClosedByPeer),
        _ => unreachable!(),
    }
    assert!(server.node.sessions().latest_inbound().await.is_none());
    assert!(client.flushed_records().await.contains("uplink closed locally."));
}

// ============================================================================
// Periodic reporting
// ============================================================================

#[tokio::test]
async fn test_reporter_checks_in_with_active_roles() {
    let hub = MemoryHub::default();
    let mut server = serving(&hub, "Incident Command").await;

    let config = BeaconConfig {
        report_time: 1,
        target_second: u8::try_from((Utc::now().second() + 1) % 60).unwrap(),
        ..test_config("Ridge Beacon")
    };
    let mut client = TestNode::start_with(&hub, config);
    client
        .node
        .sessions()
        .connect_role(
            INCIDENT_COMMAND,
            server.node.uplink_address().unwrap(),
            PATH_TIMEOUT,
        )
        .await
        .unwrap();
    client
        .wait_for(|event| matches!(event, SessionEvent::Established { .. }))
        .await;

    let cancel = tokio_util::sync::CancellationToken::new();
    let reporter = client.node.spawn_reporter(cancel.clone()).unwrap();

    let mut seen = Vec::new();
    while seen.len() < 2 {
        if let SessionEvent::Message { text, .. } = server
            .wait_for(|event| matches!(event, SessionEvent::Message { .. }))
            .await
        {
            seen.push(text);
        }
    }
    cancel.cancel();
    reporter.await.unwrap();

    assert!(seen[0].starts_with("Ridge Beacon check-in #"));
    assert!(seen[1].starts_with("Ridge Beacon check-in #"));
    assert_ne!(seen[0], seen[1]);
}

// ============================================================================
// Destination cache
// ============================================================================

#[tokio::test]
async fn test_announces_are_cached_and_restored() {
    let hub = MemoryHub::default();
    let server = serving(&hub, "Incident Command").await;
    let address = server.node.uplink_address().unwrap();

    let observer = TestNode::start(&hub, "Observer");
    server.node.announce().await.unwrap();
    let cache = observer.node.paths().known_destinations();
    eventually(|| observer.node.store().get(&address).is_some()).await;
    eventually(|| cache.exists()).await;
    observer.node.shutdown().await;

    // A fresh transport learns the path from the cache alone
    let isolated = MemoryHub::default();
    let transport: Arc<dyn Transport> = Arc::new(MeshTransport::start(
        Arc::new(isolated.attach()),
        MeshConfig::default(),
    ));
    let restarted = BeaconNode::start(
        test_config("Observer"),
        StoragePaths::new(observer.storage()),
        Arc::clone(&transport),
    )
    .unwrap();
    assert!(transport.has_path(&address));
    assert_eq!(transport.recall(&address), Some(*server.node.identity().public()));
    drop(restarted);
}
