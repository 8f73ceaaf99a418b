//! End-to-end scenarios against an in-process central system

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chargepoint_sim::collab::{BroadcastConsole, ConsoleEvent};
use chargepoint_sim::ocpp::types::*;
use chargepoint_sim::{parse_script, Action, ChargePoint, ConnectionState, ErrorCode, OcppError};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

const WAIT: Duration = Duration::from_secs(2);

fn accept_ocpp(_request: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
    response
        .headers_mut()
        .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("ocpp1.6"));
    Ok(response)
}

/// Minimal central system: hands every accepted WebSocket to the test
struct CentralSystem {
    base_url: String,
    accepted: mpsc::UnboundedReceiver<WebSocketStream<TcpStream>>,
}

impl CentralSystem {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, accepted) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Ok(ws) = accept_hdr_async(stream, accept_ocpp).await {
                        let _ = tx.send(ws);
                    }
                });
            }
        });

        Self {
            base_url: format!("ws://{}/ocpp", addr),
            accepted,
        }
    }

    fn url(&self, identity: &str) -> String {
        format!("{}/{}", self.base_url, identity)
    }

    async fn accept(&mut self) -> Peer {
        let ws = tokio::time::timeout(WAIT, self.accepted.recv())
            .await
            .expect("charge point did not connect")
            .unwrap();
        Peer { ws }
    }
}

/// Central-system side of one charge point connection
struct Peer {
    ws: WebSocketStream<TcpStream>,
}

impl Peer {
    async fn recv(&mut self) -> Value {
        self.recv_within(WAIT).await.expect("no frame from charge point")
    }

    async fn recv_within(&mut self, limit: Duration) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.ws.next()).await.ok()??;
            match frame {
                Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    async fn send(&mut self, frame: Value) {
        self.ws.send(Message::text(frame.to_string())).await.unwrap();
    }

    /// Wait until the charge point closes this transport
    async fn closed(&mut self) -> bool {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await
        .is_ok()
    }
}

fn charge_point(cs: &CentralSystem, identity: &str, timeout_ms: u64) -> ChargePoint {
    ChargePoint::builder(cs.url(identity))
        .response_timeout(Duration::from_millis(timeout_ms))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_heartbeat_round_trip() {
    let mut cs = CentralSystem::start().await;
    let cp = charge_point(&cs, "CP-1", 15_000);
    cp.connect().await.unwrap();
    let mut peer = cs.accept().await;
    assert_eq!(cp.state(), ConnectionState::Open);

    let reply = tokio::spawn(cp.heartbeat());

    let frame = peer.recv().await;
    assert_eq!(frame[0], 2);
    assert_eq!(frame[2], "Heartbeat");
    assert_eq!(frame[3], json!({}));

    peer.send(json!([3, frame[1], {"currentTime": "2024-05-01T12:00:00Z"}]))
        .await;
    let response = reply.await.unwrap().unwrap();
    assert_eq!(response.current_time.to_rfc3339(), "2024-05-01T12:00:00+00:00");

    cp.shutdown().await;
}

#[tokio::test]
async fn test_second_call_waits_for_first_reply() {
    let mut cs = CentralSystem::start().await;
    let cp = charge_point(&cs, "CP-2", 15_000);
    cp.connect().await.unwrap();
    let mut peer = cs.accept().await;

    let boot = tokio::spawn(cp.boot_notification(BootNotificationRequest::new("Acme", "Sim-1")));
    let status = tokio::spawn(cp.status_notification(StatusNotificationRequest::new(
        1,
        ChargePointStatus::Available,
    )));

    let first = peer.recv().await;
    assert_eq!(first[2], "BootNotification");
    assert_eq!(
        first[3],
        json!({"chargePointVendor": "Acme", "chargePointModel": "Sim-1"})
    );

    // StatusNotification must not be on the wire while Boot is outstanding
    assert!(peer.recv_within(Duration::from_millis(200)).await.is_none());

    peer.send(json!([3, first[1], {
        "currentTime": "2024-05-01T12:00:00Z",
        "interval": 300,
        "status": "Accepted"
    }]))
    .await;

    let second = peer.recv().await;
    assert_eq!(second[2], "StatusNotification");
    assert_ne!(second[1], first[1]);
    peer.send(json!([3, second[1], {}])).await;

    let boot = boot.await.unwrap().unwrap();
    assert_eq!(boot.status, RegistrationStatus::Accepted);
    assert_eq!(boot.interval, 300);
    status.await.unwrap().unwrap();

    cp.shutdown().await;
}

#[tokio::test]
async fn test_get_diagnostics_handler_replies() {
    let mut cs = CentralSystem::start().await;
    let cp = charge_point(&cs, "CP-3", 15_000);

    let invocations = Arc::new(AtomicUsize::new(0));
    let seen = invocations.clone();
    cp.on_get_diagnostics(move |cp, req| {
        let seen = seen.clone();
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            assert_eq!(req.payload.location, "ftp://diag:pw@ftp.example.com/upload");
            cp.send_response(
                &req.message_id,
                GetDiagnosticsResponse {
                    file_name: Some("diagnostics.txt".to_string()),
                },
            )?;
            Ok(())
        }
    })
    .unwrap();

    cp.connect().await.unwrap();
    let mut peer = cs.accept().await;

    peer.send(json!([2, "abc", "GetDiagnostics", {"location": "ftp://diag:pw@ftp.example.com/upload"}]))
        .await;
    assert_eq!(
        peer.recv().await,
        json!([3, "abc", {"fileName": "diagnostics.txt"}])
    );
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    cp.shutdown().await;
}

#[tokio::test]
async fn test_timeout_names_call_and_frees_slot() {
    let mut cs = CentralSystem::start().await;
    let cp = charge_point(&cs, "CP-4", 100);
    cp.connect().await.unwrap();
    let mut peer = cs.accept().await;

    let heartbeat = tokio::spawn(cp.heartbeat());
    let authorize = tokio::spawn(cp.authorize(AuthorizeRequest {
        id_tag: "TAG-1".to_string(),
    }));

    let first = peer.recv().await;
    assert_eq!(first[2], "Heartbeat");

    match heartbeat.await.unwrap() {
        Err(OcppError::Timeout { action, message_id }) => {
            assert_eq!(action, Action::Heartbeat);
            assert_eq!(message_id, first[1].as_str().unwrap());
        }
        other => panic!("expected timeout, got {:?}", other),
    }

    let second = peer.recv().await;
    assert_eq!(second[2], "Authorize");

    // A reply for the expired call is ignored and the transport stays open
    peer.send(json!([3, first[1], {"currentTime": "2024-05-01T12:00:00Z"}]))
        .await;
    peer.send(json!([3, second[1], {"idTagInfo": {"status": "Accepted"}}]))
        .await;

    let authorized = authorize.await.unwrap().unwrap();
    assert_eq!(authorized.id_tag_info.status, AuthorizationStatus::Accepted);
    assert_eq!(cp.state(), ConnectionState::Open);

    cp.shutdown().await;
}

#[tokio::test]
async fn test_meter_values_resent_after_reconnect() {
    let mut cs = CentralSystem::start().await;
    let cp = charge_point(&cs, "CP-5", 15_000);
    cp.connect().await.unwrap();
    let mut peer = cs.accept().await;

    let request = MeterValuesRequest {
        connector_id: 1,
        transaction_id: Some(7),
        meter_value: vec![MeterValue {
            timestamp: "2024-05-01T12:00:00Z".parse().unwrap(),
            sampled_value: vec![SampledValue::new(1500)],
        }],
    };
    let meter = tokio::spawn(cp.meter_values(request));

    let sent = peer.recv().await;
    assert_eq!(sent[2], "MeterValues");

    cp.reconnect().await.unwrap();
    let mut peer = cs.accept().await;
    assert_eq!(cp.instance(), 2);

    let resent = peer.recv().await;
    assert_eq!(resent, sent);

    peer.send(json!([3, resent[1], {}])).await;
    meter.await.unwrap().unwrap();

    cp.shutdown().await;
}

#[tokio::test]
async fn test_call_resent_after_central_system_drops_socket() {
    let mut cs = CentralSystem::start().await;
    let cp = charge_point(&cs, "CP-13", 15_000);

    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    cp.on_close(move || {
        let _ = closed_tx.send(());
    });

    cp.connect().await.unwrap();
    let mut peer = cs.accept().await;

    let authorize = tokio::spawn(cp.authorize(AuthorizeRequest {
        id_tag: "TAG-1".to_string(),
    }));
    let sent = peer.recv().await;
    assert_eq!(sent[2], "Authorize");

    // No close frame, the TCP connection just goes away
    drop(peer);
    tokio::time::timeout(WAIT, closed_rx.recv())
        .await
        .expect("on_close did not fire")
        .unwrap();
    assert_eq!(cp.state(), ConnectionState::Disconnected);
    assert_eq!(cp.queued_calls(), 1);
    assert!(!authorize.is_finished());

    cp.connect().await.unwrap();
    let mut peer = cs.accept().await;
    let resent = peer.recv().await;
    assert_eq!(resent, sent);

    peer.send(json!([3, resent[1], {"idTagInfo": {"status": "Accepted"}}]))
        .await;
    let response = authorize.await.unwrap().unwrap();
    assert_eq!(response.id_tag_info.status, AuthorizationStatus::Accepted);

    cp.shutdown().await;
}

#[tokio::test]
async fn test_compact_call_error_fails_pending_call() {
    let mut cs = CentralSystem::start().await;
    let cp = charge_point(&cs, "CP-14", 15_000);
    cp.connect().await.unwrap();
    let mut peer = cs.accept().await;

    let sign = tokio::spawn(cp.sign_certificate(SignCertificateRequest {
        csr: "-----BEGIN CERTIFICATE REQUEST-----".to_string(),
    }));
    let heartbeat = tokio::spawn(cp.heartbeat());

    let sent = peer.recv().await;
    assert_eq!(sent[2], "SignCertificate");
    peer.send(json!([4, sent[1], {"errorCode": "NotSupported"}])).await;

    match sign.await.unwrap() {
        Err(OcppError::CallError { code, .. }) => assert_eq!(code, ErrorCode::NotSupported),
        other => panic!("Expected CallError, got {:?}", other),
    }

    // The slot is free again and the connection stays open
    let next = peer.recv().await;
    assert_eq!(next[2], "Heartbeat");
    peer.send(json!([3, next[1], {"currentTime": "2024-05-01T12:00:00Z"}]))
        .await;
    heartbeat.await.unwrap().unwrap();
    assert_eq!(cp.state(), ConnectionState::Open);

    cp.shutdown().await;
}

#[tokio::test]
async fn test_trigger_without_handler_answers_not_implemented() {
    let mut cs = CentralSystem::start().await;
    let cp = charge_point(&cs, "CP-6", 15_000);
    cp.on_trigger_message(MessageTrigger::Heartbeat, |cp, req| async move {
        cp.send_response(
            &req.message_id,
            TriggerMessageResponse {
                status: TriggerMessageStatus::Accepted,
            },
        )?;
        Ok(())
    })
    .unwrap();

    cp.connect().await.unwrap();
    let mut peer = cs.accept().await;

    peer.send(json!([2, "t1", "TriggerMessage", {"requestedMessage": "MeterValues", "connectorId": 1}]))
        .await;
    assert_eq!(
        peer.recv().await,
        json!([3, "t1", {"status": "NotImplemented"}])
    );
    assert!(peer.recv_within(Duration::from_millis(200)).await.is_none());

    cp.shutdown().await;
}

#[tokio::test]
async fn test_unknown_action_gets_call_error() {
    let mut cs = CentralSystem::start().await;
    let cp = charge_point(&cs, "CP-7", 15_000);
    cp.connect().await.unwrap();
    let mut peer = cs.accept().await;

    peer.send(json!([2, "u1", "SetChargingProfile", {}])).await;
    let reply = peer.recv().await;
    assert_eq!(reply[0], 4);
    assert_eq!(reply[1], "u1");
    assert_eq!(reply[2], "NotImplemented");
    assert_eq!(reply[4], json!({}));

    cp.shutdown().await;
}

#[tokio::test]
async fn test_mismatched_reply_closes_transport() {
    let mut cs = CentralSystem::start().await;
    let cp = charge_point(&cs, "CP-8", 15_000);

    let closes = Arc::new(AtomicUsize::new(0));
    let counter = closes.clone();
    cp.on_close(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    cp.connect().await.unwrap();
    let mut peer = cs.accept().await;

    let heartbeat = tokio::spawn(cp.heartbeat());
    peer.recv().await;
    peer.send(json!([3, "not-the-pending-id", {}])).await;

    assert!(matches!(
        heartbeat.await.unwrap(),
        Err(OcppError::ProtocolViolation(_))
    ));
    assert!(peer.closed().await);

    // finish runs on the connection task; give it a moment
    for _ in 0..50 {
        if closes.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(cp.state(), ConnectionState::Disconnected);
    assert_eq!(cp.queued_calls(), 0);
}

#[tokio::test]
async fn test_calls_submitted_while_closed_go_out_on_connect() {
    let mut cs = CentralSystem::start().await;
    let cp = charge_point(&cs, "CP-9", 15_000);

    let heartbeat = tokio::spawn(cp.heartbeat());
    tokio::task::yield_now().await;
    assert_eq!(cp.queued_calls(), 1);

    cp.connect().await.unwrap();
    let mut peer = cs.accept().await;

    let frame = peer.recv().await;
    assert_eq!(frame[2], "Heartbeat");
    peer.send(json!([3, frame[1], {"currentTime": "2024-05-01T12:00:00Z"}]))
        .await;
    heartbeat.await.unwrap().unwrap();

    cp.shutdown().await;
}

#[tokio::test]
async fn test_console_sees_status_and_frames() {
    let mut cs = CentralSystem::start().await;
    let console = Arc::new(BroadcastConsole::default());
    let url = cs.url("CP-10");
    let cp = ChargePoint::builder(url.clone())
        .console(console.clone())
        .build()
        .unwrap();
    let mut events = console.subscribe("CP-10");

    cp.connect().await.unwrap();
    let mut peer = cs.accept().await;

    assert_eq!(
        events.recv().await.unwrap(),
        ConsoleEvent::WsStatus {
            id: 1,
            description: format!("open ({})", url),
        }
    );

    let heartbeat = tokio::spawn(cp.heartbeat());
    let frame = peer.recv().await;
    let ConsoleEvent::Log(logged) = events.recv().await.unwrap() else {
        panic!("expected the outbound frame");
    };
    assert_eq!(logged, frame);

    peer.send(json!([3, frame[1], {"currentTime": "2024-05-01T12:00:00Z"}]))
        .await;
    heartbeat.await.unwrap().unwrap();

    cp.close().await;
    let mut last = None;
    while let Ok(event) = events.try_recv() {
        last = Some(event);
    }
    assert_eq!(
        last,
        Some(ConsoleEvent::WsStatus {
            id: 1,
            description: "closed.".to_string(),
        })
    );
}

#[tokio::test]
async fn test_script_drives_charge_point() {
    let mut cs = CentralSystem::start().await;
    let cp = charge_point(&cs, "CP-11", 15_000);

    let commands = parse_script(
        r#"
# connect and say hello
{"command": "connect"}
{"command": "send", "action": "DataTransfer", "payload": {"vendorId": "org.example", "messageId": "Ping"}}
{"command": "close"}
"#,
    )
    .unwrap();

    let runner = {
        let cp = cp.clone();
        tokio::spawn(async move {
            let mut results = Vec::new();
            for command in &commands {
                results.push(command.execute(&cp).await.unwrap());
            }
            results
        })
    };

    let mut peer = cs.accept().await;
    let frame = peer.recv().await;
    assert_eq!(frame[2], "DataTransfer");
    assert_eq!(frame[3], json!({"vendorId": "org.example", "messageId": "Ping"}));
    peer.send(json!([3, frame[1], {"status": "Accepted", "data": "pong"}]))
        .await;

    let results = runner.await.unwrap();
    assert_eq!(
        results,
        vec![Value::Null, json!({"status": "Accepted", "data": "pong"}), Value::Null]
    );
    assert_eq!(cp.state(), ConnectionState::Disconnected);
}
