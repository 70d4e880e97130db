//! End-to-end scenarios against an in-process server.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use gridagent_protocol::messages::{
    AcknowledgementGaSoftware, BulkMeasurements, CommandGpSwitchRelay, ConfigGaSoftware,
    ConfigGaTime, InfoAgentVersions, NotificationGaTime,
};
use gridagent_protocol::{
    handshake, AgentId, BusEvent, Measurement, MeasurementSet, Message, MessageType, Meter,
    MeterData, SoftwareVersion, DEFAULT_MAX_FRAME_LENGTH, SERVER_ROUTING_KEY,
};
use serde_json::json;
use tokio::io::{duplex, split};

use crate::server::next_event;
use crate::{TestAgent, TestServer};

const AGENT: AgentId = AgentId::new(0x3C97_0E1E_8E4E);
const METER_ID: u64 = 0xAABB_CCDD_1122_3344;

fn relay_command(relay_on: bool, meters: &[&str]) -> serde_json::Value {
    json!({
        "command": "relay_state",
        "agent": "3c970e1e8e4e",
        "relay_on": relay_on,
        "meters": meters,
    })
}

// ---------------------------------------------------------------------------
// handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn version_3_handshake_with_fixed_nonce() {
    let server = TestServer::start().await.unwrap();
    let secret = server.secret().clone();
    let (agent_side, server_side) = duplex(1024);
    let (server_read, server_write) = split(server_side);
    let (agent_read, agent_write) = split(agent_side);

    let accepting = tokio::spawn(async move {
        handshake::accept_with_nonce(
            server_read,
            server_write,
            &secret,
            3,
            0x0123_4567_89AB_CDEF,
            DEFAULT_MAX_FRAME_LENGTH,
        )
        .await
    });
    let mut agent = handshake::connect(
        agent_read,
        agent_write,
        server.secret(),
        3,
        AGENT,
        DEFAULT_MAX_FRAME_LENGTH,
    )
    .await
    .unwrap();
    let mut accepted = accepting.await.unwrap().unwrap();

    assert_eq!(accepted.agent_id, AGENT);
    assert_eq!(agent.nonce, 0x0123_4567_89AB_CDEF);
    assert_eq!((accepted.version, agent.version), (3, 3));

    let message = Message::from(CommandGpSwitchRelay {
        meter: Meter::zigbee(METER_ID),
        relay_on: true,
    });
    accepted.writer.write_message(&message).await.unwrap();
    let (header, _) = agent.reader.read_frame().await.unwrap();
    assert_eq!(header.length, 17);
    assert_eq!(header.message_type, MessageType::CommandGpSwitchRelay);
    assert_eq!(header.flags, 0x01);

    agent.writer.write_message(&message).await.unwrap();
    assert_eq!(accepted.reader.read_message().await.unwrap(), message);
}

#[tokio::test]
async fn tcp_agent_is_registered_and_announced() {
    let server = TestServer::start().await.unwrap();
    let mut lifecycle = server.subscribe(SERVER_ROUTING_KEY);

    let agent = server.connect_agent(AGENT, 3).await.unwrap();
    assert_eq!(agent.server_version(), 3);

    let (subject, event) = next_event(&mut lifecycle).await.unwrap();
    assert_eq!(subject, SERVER_ROUTING_KEY);
    match event {
        BusEvent::AgentConnected {
            agent,
            protocol_version,
            peer,
        } => {
            assert_eq!(agent, AGENT);
            assert_eq!(protocol_version, 3);
            assert!(peer.is_some_and(|p| p.starts_with("127.0.0.1:")));
        }
        other => panic!("unexpected event {other:?}"),
    }

    agent.close().await.unwrap();
    let (_, event) = next_event(&mut lifecycle).await.unwrap();
    assert_eq!(
        event,
        BusEvent::AgentDisconnected {
            agent: AGENT,
            reason: "peer_closed".into(),
        }
    );
    server
        .wait_until("unregistration", || server.registry().is_empty())
        .await
        .unwrap();
}

#[tokio::test]
async fn unsupported_client_version_is_refused() {
    let server = TestServer::start().await.unwrap();
    let result = TestAgent::connect(server.addr(), server.secret(), AGENT, 4).await;

    // the server refuses without a reply, so the agent sees the stream end
    assert!(result.is_err());
    server
        .wait_until("handshake failure", || {
            server
                .metrics_text()
                .contains("gas_handshake_failures_total 1")
        })
        .await
        .unwrap();
    assert!(server.registry().is_empty());
}

// ---------------------------------------------------------------------------
// meter encoding per version
// ---------------------------------------------------------------------------

#[tokio::test]
async fn version_1_relay_command_uses_bare_meter_id() {
    let server = TestServer::start().await.unwrap();
    let mut agent = server.connect_agent(AGENT, 1).await.unwrap();

    server
        .publish(&AGENT.routing_key(), &relay_command(true, &["aabbccdd11223344"]))
        .unwrap();

    let (header, payload) = agent.recv_frame().await.unwrap();
    assert_eq!(header.message_type, MessageType::CommandGpSwitchRelay);
    assert_eq!(header.flags, 0x01);
    assert_eq!(payload, [0xAA, 0xBB, 0xCC, 0xDD, 0x11, 0x22, 0x33, 0x44]);

    let decoded = Message::decode(&header, &payload, 1).unwrap();
    assert_eq!(
        decoded,
        Message::from(CommandGpSwitchRelay {
            meter: Meter::legacy(METER_ID as i64),
            relay_on: true,
        })
    );
}

#[tokio::test]
async fn version_2_relay_command_carries_connection_type() {
    let server = TestServer::start().await.unwrap();
    let mut agent = server.connect_agent(AGENT, 2).await.unwrap();

    server
        .publish(&AGENT.routing_key(), &relay_command(true, &["aabbccdd11223344"]))
        .unwrap();

    let (header, payload) = agent.recv_frame().await.unwrap();
    assert_eq!(header.flags, 0x01);
    assert_eq!(
        payload,
        [0x01, 0xAA, 0xBB, 0xCC, 0xDD, 0x11, 0x22, 0x33, 0x44]
    );
}

// ---------------------------------------------------------------------------
// protocol errors and displacement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_message_type_closes_session() {
    let server = TestServer::start().await.unwrap();
    let mut lifecycle = server.subscribe(SERVER_ROUTING_KEY);
    let mut agent = server.connect_agent(AGENT, 3).await.unwrap();
    next_event(&mut lifecycle).await.unwrap();

    agent
        .send_raw(&[0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 250, 0x00])
        .await
        .unwrap();
    agent.expect_closed().await.unwrap();

    let (_, event) = next_event(&mut lifecycle).await.unwrap();
    assert_eq!(
        event,
        BusEvent::AgentDisconnected {
            agent: AGENT,
            reason: "unknown_message_type".into(),
        }
    );
    assert_eq!(
        server.metric(
            "gas_protocol_errors_total",
            &[("kind", "unknown_message_type")]
        ),
        Some(1.0)
    );
}

#[tokio::test]
async fn second_connection_displaces_first() {
    let server = TestServer::start().await.unwrap();
    let mut first = server.connect_agent(AGENT, 3).await.unwrap();
    let first_session = server.session_id(AGENT);

    let _second = server.connect_agent(AGENT, 3).await.unwrap();
    let second_session = server.session_id(AGENT);
    assert_ne!(first_session, second_session);

    first.expect_closed().await.unwrap();
    assert_eq!(server.session_id(AGENT), second_session);
    assert_eq!(server.registry().len(), 1);
    assert!(server
        .metrics_text()
        .contains("gas_sessions_displaced_total 1"));
}

// ---------------------------------------------------------------------------
// bus routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn relay_command_routes_one_frame_per_meter() {
    let server = TestServer::start().await.unwrap();
    let mut agent = server.connect_agent(AGENT, 3).await.unwrap();

    server
        .publish(
            "agent.3c970e1e8e4e",
            &relay_command(false, &["aabbccdd11223344", "0000aabbcc000009"]),
        )
        .unwrap();

    for id in [METER_ID, 0x0000_AABB_CC00_0009] {
        let (header, payload) = agent.recv_frame().await.unwrap();
        assert_eq!(header.message_type, MessageType::CommandGpSwitchRelay);
        assert_eq!(header.flags, 0x00);
        let mut expected = vec![0x01];
        expected.extend_from_slice(&id.to_be_bytes());
        assert_eq!(payload, expected);
    }
}

#[tokio::test]
async fn upstream_measurements_reach_the_bus() {
    let server = TestServer::start().await.unwrap();
    let mut events = server.subscribe("agent.*");
    let mut agent = server.connect_agent(AGENT, 3).await.unwrap();

    let timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let meter_data = vec![MeterData {
        meter: Meter::zigbee(METER_ID),
        measurement_sets: vec![MeasurementSet {
            timestamp,
            measurements: vec![Measurement::new(1, 1, 0, 12_345)],
        }],
    }];
    agent
        .send(BulkMeasurements {
            meter_data: meter_data.clone(),
        })
        .await
        .unwrap();

    let (subject, event) = next_event(&mut events).await.unwrap();
    assert_eq!(subject, "agent.3c970e1e8e4e");
    assert_eq!(
        event,
        BusEvent::Measurements {
            agent: AGENT,
            meter_data,
        }
    );
}

#[tokio::test]
async fn current_agents_lists_versions() {
    let server = TestServer::start().await.unwrap();
    let mut agent = server.connect_agent(AGENT, 3).await.unwrap();
    agent
        .send(InfoAgentVersions {
            sw_version: SoftwareVersion::new(2, 1, 0, "rc1"),
            device_type: 1,
            hw_revision: SoftwareVersion::new(1, 0, 0, ""),
            serial: 4242,
        })
        .await
        .unwrap();
    server
        .wait_until("agent info", || {
            server
                .registry()
                .get(AGENT)
                .is_some_and(|handle| handle.info().serial == 4242)
        })
        .await
        .unwrap();

    let mut replies = server.subscribe("_INBOX.scenario");
    server
        .bus()
        .publish(
            SERVER_ROUTING_KEY,
            Some("_INBOX.scenario"),
            serde_json::to_vec(&json!({"command": "current_agents"}))
                .unwrap()
                .into(),
        )
        .unwrap();

    let (_, event) = next_event(&mut replies).await.unwrap();
    let BusEvent::CurrentAgents { agents } = event else {
        panic!("unexpected event {event:?}");
    };
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].agent, AGENT);
    assert_eq!(agents[0].serial, 4242);
    assert_eq!(agents[0].sw_version, Some(SoftwareVersion::new(2, 1, 0, "rc1")));
}

#[tokio::test]
async fn software_update_waits_for_acknowledgement() {
    let server = TestServer::start().await.unwrap();
    let image = b":10000000DEADBEEF\r\n:00000001FF\r\n".to_vec();
    std::fs::write(server.software_dir().join("1-hw01_00_00-sw02_01_00.hex"), &image).unwrap();
    let mut agent = server.connect_agent(AGENT, 3).await.unwrap();

    server
        .publish(
            &AGENT.routing_key(),
            &json!({
                "command": "gridagent_software",
                "agent": "3c970e1e8e4e",
                "sw_version": [2, 1, 0, ""],
                "target_hw_version": "1.0.0",
            }),
        )
        .unwrap();
    server
        .publish(&AGENT.routing_key(), &relay_command(true, &["aabbccdd11223344"]))
        .unwrap();

    match agent.recv().await.unwrap() {
        Message::ConfigGaSoftware(ConfigGaSoftware {
            image: received,
            hw_model: 1,
            ..
        }) => assert_eq!(received, image),
        other => panic!("unexpected message {other:?}"),
    }

    agent.send(AcknowledgementGaSoftware).await.unwrap();
    assert!(matches!(
        agent.recv().await.unwrap(),
        Message::CommandGpSwitchRelay(CommandGpSwitchRelay { relay_on: true, .. })
    ));
}

// ---------------------------------------------------------------------------
// time sync and shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn time_sync_sends_clock_and_corrects_drift() {
    let server = TestServer::with_config(|config| {
        config.with_time_sync_interval(Some(Duration::from_secs(3600)))
    })
    .await
    .unwrap();
    let mut agent = server.connect_agent(AGENT, 3).await.unwrap();

    let Message::ConfigGaTime(ConfigGaTime { timestamp }) = agent.recv().await.unwrap() else {
        panic!("expected the initial clock");
    };
    assert!((Utc::now() - timestamp).num_seconds().abs() < 5);

    let far_past = Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap();
    agent
        .send(NotificationGaTime {
            timestamp: far_past,
        })
        .await
        .unwrap();
    assert!(matches!(
        agent.recv().await.unwrap(),
        Message::ConfigGaTime(_)
    ));
}

#[tokio::test]
async fn shutdown_closes_connected_agents() {
    let server = TestServer::start().await.unwrap();
    let mut agent = server.connect_agent(AGENT, 3).await.unwrap();
    let bus = server.bus().clone();

    server.shutdown().await.unwrap();
    agent.expect_closed().await.unwrap();
    assert_eq!(bus.subscriber_count(), 0);
}
