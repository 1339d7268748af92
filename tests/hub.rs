use std::time::Duration;

use futures::channel::mpsc::{unbounded, UnboundedReceiver};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use nutbot_relay::handler::cmd::ClientQueue;
use nutbot_relay::handler::{
    Admission, ConnectionId, ExtensionStatus, Outbound, CLOSE_DUPLICATE_CLIENT, CLOSE_REPLACED,
    CLOSE_SLOT_BUSY,
};
use nutbot_relay::types::Request;
use nutbot_relay::{Relay, RelayConfig, RelayError};

fn config() -> RelayConfig {
    RelayConfig::builder()
        .keepalive_interval(Duration::from_secs(600))
        .build()
}

fn start(config: RelayConfig) -> Relay {
    let (relay, mut hub) = Relay::new(config);
    tokio::spawn(async move { while hub.next().await.is_some() {} });
    relay
}

async fn recv(rx: &mut UnboundedReceiver<Outbound>) -> Outbound {
    tokio::time::timeout(Duration::from_secs(2), rx.next())
        .await
        .expect("timed out waiting for a message")
        .expect("connection closed")
}

async fn recv_json(rx: &mut UnboundedReceiver<Outbound>) -> Value {
    match recv(rx).await {
        Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text, got {:?}", other),
    }
}

async fn assert_silent(rx: &mut UnboundedReceiver<Outbound>) {
    let res = tokio::time::timeout(Duration::from_millis(100), rx.next()).await;
    assert!(res.is_err(), "unexpected message {:?}", res);
}

fn tab_info(target_id: &str) -> Value {
    json!({"targetId": target_id, "type": "page", "title": "", "url": "about:blank", "attached": false})
}

struct MockExtension {
    conn: ConnectionId,
    rx: UnboundedReceiver<Outbound>,
}

impl MockExtension {
    async fn connect(relay: &Relay) -> Self {
        let (tx, mut rx) = unbounded();
        match relay.connect_extension(tx).await.unwrap() {
            Admission::Accepted(conn) => {
                // an admitted extension is greeted right away
                assert_eq!(recv_json(&mut rx).await, json!({"method": "ping"}));
                Self { conn, rx }
            }
            Admission::Rejected => panic!("extension rejected"),
        }
    }

    async fn send(&self, relay: &Relay, frame: Value) {
        relay
            .extension_frame(self.conn, frame.to_string())
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> Value {
        recv_json(&mut self.rx).await
    }

    async fn reply(&self, relay: &Relay, id: &Value, result: Value) {
        self.send(relay, json!({"id": id, "result": result})).await;
    }

    async fn attach(&self, relay: &Relay, session_id: &str, target_id: &str) {
        self.send(
            relay,
            json!({
                "method": "forwardCDPEvent",
                "params": {
                    "method": "Target.attachedToTarget",
                    "params": {
                        "sessionId": session_id,
                        "targetInfo": tab_info(target_id),
                        "waitingForDebugger": false
                    }
                }
            }),
        )
        .await;
    }
}

async fn connect_client(relay: &Relay, id: &str) -> UnboundedReceiver<Outbound> {
    let (tx, rx) = unbounded();
    relay.connect_client(Some(id.to_string()), tx).await.unwrap();
    rx
}

fn spawn_execute(relay: &Relay, client: &str, request: Request) -> JoinHandle<()> {
    let relay = relay.clone();
    let client = client.to_string();
    tokio::spawn(async move { relay.execute(client, request).await.unwrap() })
}

#[tokio::test]
async fn browser_version_is_answered_locally() {
    let relay = start(config());
    let mut client = connect_client(&relay, "a").await;
    relay
        .execute("a".into(), Request::new(1, "Browser.getVersion", json!({})))
        .await
        .unwrap();
    let resp = recv_json(&mut client).await;
    assert_eq!(resp["id"], 1);
    assert_eq!(resp["result"]["protocolVersion"], "1.3");
}

#[tokio::test]
async fn commands_fail_fast_without_extension() {
    let relay = start(config());
    let mut client = connect_client(&relay, "a").await;

    relay
        .execute(
            "a".into(),
            Request::with_session(1, "Runtime.evaluate", json!({}), "nutbot-tab-1"),
        )
        .await
        .unwrap();
    let resp = recv_json(&mut client).await;
    assert_eq!(
        resp,
        json!({"id": 1, "error": {"code": -32000, "message": "Extension not connected"}, "sessionId": "nutbot-tab-1"})
    );

    relay
        .execute("a".into(), Request::new(2, "Target.setAutoAttach", json!({})))
        .await
        .unwrap();
    let resp = recv_json(&mut client).await;
    assert_eq!(resp["error"]["message"], "Extension not connected");

    let err = relay
        .notify(serde_json::from_value(json!({"title": "t", "message": "m"})).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::NotConnected));
}

#[tokio::test]
async fn auto_attach_bootstraps_initial_tab() {
    let relay = start(config());
    let mut ext = MockExtension::connect(&relay).await;
    let mut client = connect_client(&relay, "a").await;

    let exec = spawn_execute(
        &relay,
        "a",
        Request::new(
            1,
            "Target.setAutoAttach",
            json!({"autoAttach": true, "waitForDebuggerOnStart": false, "flatten": true}),
        ),
    );
    let req = ext.recv().await;
    assert_eq!(req["method"], "createInitialTab");
    ext.reply(
        &relay,
        &req["id"],
        json!({"success": true, "sessionId": "nutbot-tab-1", "targetInfo": tab_info("T1")}),
    )
    .await;
    exec.await.unwrap();

    assert_eq!(recv_json(&mut client).await, json!({"id": 1, "result": {}}));
    let event = recv_json(&mut client).await;
    assert_eq!(event["method"], "Target.attachedToTarget");
    assert_eq!(event["params"]["sessionId"], "nutbot-tab-1");
    assert_eq!(event["params"]["targetInfo"]["targetId"], "T1");
    assert_eq!(event["params"]["targetInfo"]["attached"], true);
    assert_silent(&mut client).await;

    assert_eq!(
        relay.status().await.unwrap(),
        ExtensionStatus {
            connected: true,
            active_targets: 1
        }
    );

    // a second call only re-announces what is known
    relay
        .execute("a".into(), Request::new(2, "Target.setAutoAttach", json!({})))
        .await
        .unwrap();
    assert_eq!(recv_json(&mut client).await, json!({"id": 2, "result": {}}));
    let event = recv_json(&mut client).await;
    assert_eq!(event["params"]["sessionId"], "nutbot-tab-1");
    assert_silent(&mut ext.rx).await;
}

#[tokio::test]
async fn concurrent_bootstraps_share_one_tab() {
    let relay = start(config());
    let mut ext = MockExtension::connect(&relay).await;
    let mut a = connect_client(&relay, "a").await;
    let mut b = connect_client(&relay, "b").await;
    let mut c = connect_client(&relay, "c").await;

    let exec_a = spawn_execute(&relay, "a", Request::new(1, "Target.setAutoAttach", json!({})));
    let req = ext.recv().await;
    let exec_b = spawn_execute(&relay, "b", Request::new(7, "Target.setAutoAttach", json!({})));
    // give b's request time to reach the hub
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_silent(&mut ext.rx).await;

    ext.reply(
        &relay,
        &req["id"],
        json!({"success": true, "sessionId": "nutbot-tab-1", "targetInfo": tab_info("T1")}),
    )
    .await;
    exec_a.await.unwrap();
    exec_b.await.unwrap();

    assert_eq!(recv_json(&mut a).await["id"], 1);
    assert_eq!(recv_json(&mut a).await["method"], "Target.attachedToTarget");
    assert_eq!(recv_json(&mut b).await["id"], 7);
    assert_eq!(recv_json(&mut b).await["method"], "Target.attachedToTarget");
    assert_silent(&mut a).await;
    assert_silent(&mut b).await;

    // bystanders learn about the tab once
    let event = recv_json(&mut c).await;
    assert_eq!(event["method"], "Target.attachedToTarget");
    assert_silent(&mut c).await;
}

#[tokio::test]
async fn failed_bootstrap_is_an_error_response() {
    let relay = start(config());
    let mut ext = MockExtension::connect(&relay).await;
    let mut client = connect_client(&relay, "a").await;

    let exec = spawn_execute(&relay, "a", Request::new(1, "Target.setAutoAttach", json!({})));
    let req = ext.recv().await;
    ext.reply(
        &relay,
        &req["id"],
        json!({"success": false, "error": "Cannot attach to restricted page chrome://newtab"}),
    )
    .await;
    exec.await.unwrap();

    let resp = recv_json(&mut client).await;
    assert_eq!(resp["id"], 1);
    assert_eq!(
        resp["error"]["message"],
        "Cannot attach to restricted page chrome://newtab"
    );
    assert_eq!(relay.status().await.unwrap().active_targets, 0);
}

#[tokio::test]
async fn bootstrap_times_out() {
    let relay = start(
        RelayConfig::builder()
            .bootstrap_timeout(Duration::from_millis(100))
            .keepalive_interval(Duration::from_secs(600))
            .build(),
    );
    let mut ext = MockExtension::connect(&relay).await;
    let mut client = connect_client(&relay, "a").await;

    let exec = spawn_execute(&relay, "a", Request::new(1, "Target.setAutoAttach", json!({})));
    let req = ext.recv().await;
    exec.await.unwrap();
    let resp = recv_json(&mut client).await;
    assert_eq!(resp["error"]["code"], -32000);

    // the late answer is discarded
    ext.reply(
        &relay,
        &req["id"],
        json!({"success": true, "sessionId": "nutbot-tab-1", "targetInfo": tab_info("T1")}),
    )
    .await;
    assert_silent(&mut client).await;
    assert_eq!(relay.status().await.unwrap().active_targets, 0);
}

#[tokio::test]
async fn responses_go_to_the_sender_events_to_everyone() {
    let relay = start(config());
    let mut ext = MockExtension::connect(&relay).await;
    ext.attach(&relay, "nutbot-tab-1", "T1").await;
    let mut a = connect_client(&relay, "a").await;
    let mut b = connect_client(&relay, "b").await;

    let exec = spawn_execute(
        &relay,
        "a",
        Request::with_session(3, "Runtime.evaluate", json!({"expression": "1+1"}), "nutbot-tab-1"),
    );
    let cmd = ext.recv().await;
    assert_eq!(cmd["method"], "forwardCDPCommand");
    assert_eq!(
        cmd["params"],
        json!({"method": "Runtime.evaluate", "sessionId": "nutbot-tab-1", "params": {"expression": "1+1"}})
    );
    ext.reply(&relay, &cmd["id"], json!({"result": {"type": "number", "value": 2}}))
        .await;
    exec.await.unwrap();

    let resp = recv_json(&mut a).await;
    assert_eq!(resp["id"], 3);
    assert_eq!(resp["sessionId"], "nutbot-tab-1");
    assert_eq!(resp["result"]["result"]["value"], 2);
    assert_silent(&mut b).await;

    ext.send(
        &relay,
        json!({"method": "forwardCDPEvent", "params": {"method": "Page.loadEventFired", "sessionId": "nutbot-tab-1", "params": {"timestamp": 1.5}}}),
    )
    .await;
    for rx in [&mut a, &mut b] {
        let event = recv_json(rx).await;
        assert_eq!(
            event,
            json!({"method": "Page.loadEventFired", "params": {"timestamp": 1.5}, "sessionId": "nutbot-tab-1"})
        );
    }

    // gone clients are no longer addressed
    relay.client_closed("b".into()).await.unwrap();
    ext.send(
        &relay,
        json!({"method": "forwardCDPEvent", "params": {"method": "Page.frameNavigated", "sessionId": "nutbot-tab-1", "params": {}}}),
    )
    .await;
    assert_eq!(recv_json(&mut a).await["method"], "Page.frameNavigated");
    assert!(b.next().await.is_none());
}

#[tokio::test]
async fn upstream_errors_pass_through() {
    let relay = start(config());
    let mut ext = MockExtension::connect(&relay).await;
    ext.attach(&relay, "nutbot-tab-1", "T1").await;
    let mut client = connect_client(&relay, "a").await;

    let exec = spawn_execute(
        &relay,
        "a",
        Request::with_session(1, "DOM.getDocument", json!({}), "nutbot-tab-1"),
    );
    let cmd = ext.recv().await;
    ext.send(&relay, json!({"id": cmd["id"], "error": "Debugger is not attached to the tab with id: 4."}))
        .await;
    exec.await.unwrap();
    let resp = recv_json(&mut client).await;
    assert_eq!(
        resp["error"],
        json!({"code": -32000, "message": "Debugger is not attached to the tab with id: 4."})
    );
}

#[tokio::test]
async fn unknown_sessions_fail_fast() {
    let relay = start(config());
    let mut ext = MockExtension::connect(&relay).await;
    let mut client = connect_client(&relay, "a").await;

    relay
        .execute(
            "a".into(),
            Request::with_session(1, "Page.navigate", json!({"url": "https://a.b"}), "nope"),
        )
        .await
        .unwrap();
    let resp = recv_json(&mut client).await;
    assert_eq!(resp["error"]["message"], "No such session: nope");
    assert_silent(&mut ext.rx).await;
}

#[tokio::test]
async fn child_sessions_are_routable() {
    let relay = start(config());
    let mut ext = MockExtension::connect(&relay).await;
    ext.attach(&relay, "nutbot-tab-1", "T1").await;
    ext.send(
        &relay,
        json!({
            "method": "forwardCDPEvent",
            "params": {
                "method": "Target.attachedToTarget",
                "sessionId": "nutbot-tab-1",
                "params": {
                    "sessionId": "CHILD",
                    "targetInfo": {"targetId": "F1", "type": "iframe", "title": "", "url": "https://ads.example"},
                    "waitingForDebugger": false
                }
            }
        }),
    )
    .await;
    let mut client = connect_client(&relay, "a").await;

    let exec = spawn_execute(
        &relay,
        "a",
        Request::with_session(1, "Runtime.enable", json!({}), "CHILD"),
    );
    let cmd = ext.recv().await;
    assert_eq!(cmd["params"]["sessionId"], "CHILD");
    ext.reply(&relay, &cmd["id"], json!({})).await;
    exec.await.unwrap();
    assert_eq!(recv_json(&mut client).await["result"], json!({}));

    // the child describes its own target, not the tab it lives in
    let exec = spawn_execute(
        &relay,
        "a",
        Request::with_session(2, "Target.getTargetInfo", json!({}), "CHILD"),
    );
    let cmd = ext.recv().await;
    assert_eq!(cmd["params"]["method"], "Target.getTargetInfo");
    assert_eq!(cmd["params"]["sessionId"], "CHILD");
    ext.reply(
        &relay,
        &cmd["id"],
        json!({"targetInfo": {"targetId": "F1", "type": "iframe", "title": "", "url": "https://ads.example", "attached": true}}),
    )
    .await;
    exec.await.unwrap();
    let resp = recv_json(&mut client).await;
    assert_eq!(resp["id"], 2);
    assert_eq!(resp["result"]["targetInfo"]["targetId"], "F1");

    // child iframes are not top level targets
    assert_eq!(relay.status().await.unwrap().active_targets, 1);
}

#[tokio::test]
async fn target_domain_is_served_from_the_registry() {
    let relay = start(config());
    let ext = MockExtension::connect(&relay).await;
    ext.attach(&relay, "nutbot-tab-1", "T1").await;
    ext.attach(&relay, "nutbot-tab-2", "T2").await;
    let mut client = connect_client(&relay, "a").await;

    relay
        .execute("a".into(), Request::new(1, "Target.getTargets", json!({})))
        .await
        .unwrap();
    let resp = recv_json(&mut client).await;
    let ids: Vec<_> = resp["result"]["targetInfos"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["targetId"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["T1", "T2"]);

    relay
        .execute(
            "a".into(),
            Request::new(2, "Target.setDiscoverTargets", json!({"discover": true})),
        )
        .await
        .unwrap();
    assert_eq!(recv_json(&mut client).await, json!({"id": 2, "result": {}}));
    for target in ["T1", "T2"] {
        let event = recv_json(&mut client).await;
        assert_eq!(event["method"], "Target.targetCreated");
        assert_eq!(event["params"]["targetInfo"]["targetId"], target);
    }

    relay
        .execute(
            "a".into(),
            Request::new(3, "Target.attachToTarget", json!({"targetId": "T2", "flatten": true})),
        )
        .await
        .unwrap();
    assert_eq!(
        recv_json(&mut client).await["result"],
        json!({"sessionId": "nutbot-tab-2"})
    );

    relay
        .execute("a".into(), Request::new(4, "Target.attachToTarget", json!({})))
        .await
        .unwrap();
    assert_eq!(
        recv_json(&mut client).await["error"],
        json!({"code": -32602, "message": "targetId is required"})
    );

    relay
        .execute(
            "a".into(),
            Request::with_session(5, "Target.getTargetInfo", json!({}), "nutbot-tab-2"),
        )
        .await
        .unwrap();
    assert_eq!(
        recv_json(&mut client).await["result"]["targetInfo"]["targetId"],
        "T2"
    );

    relay
        .execute(
            "a".into(),
            Request::new(6, "Target.getTargetInfo", json!({"targetId": "T9"})),
        )
        .await
        .unwrap();
    assert_eq!(
        recv_json(&mut client).await["error"]["message"],
        "Target T9 not found"
    );
}

#[tokio::test]
async fn extension_events_maintain_the_registry() {
    let relay = start(config());
    let ext = MockExtension::connect(&relay).await;
    ext.attach(&relay, "nutbot-tab-1", "T1").await;
    ext.send(
        &relay,
        json!({"method": "forwardCDPEvent", "params": {"method": "Target.targetInfoChanged", "params": {"targetInfo": {"targetId": "T1", "type": "page", "title": "Example", "url": "https://example.com"}}}}),
    )
    .await;
    let snapshot = relay.snapshot().await.unwrap();
    assert_eq!(snapshot.targets[0].title, "Example");
    assert!(snapshot.targets[0].attached);

    ext.send(
        &relay,
        json!({"method": "forwardCDPEvent", "params": {"method": "Target.detachedFromTarget", "params": {"sessionId": "nutbot-tab-1", "targetId": "T1"}}}),
    )
    .await;
    let snapshot = relay.snapshot().await.unwrap();
    assert!(snapshot.extension_connected);
    assert!(snapshot.targets.is_empty());
}

#[tokio::test]
async fn reattached_target_retires_the_old_session() {
    let relay = start(config());
    let ext = MockExtension::connect(&relay).await;
    let mut client = connect_client(&relay, "a").await;
    ext.attach(&relay, "s1", "T1").await;
    ext.attach(&relay, "s2", "T1").await;

    let mut seen = Vec::new();
    for _ in 0..3 {
        let event = recv_json(&mut client).await;
        seen.push((
            event["method"].as_str().unwrap().to_string(),
            event["params"]["sessionId"].as_str().unwrap().to_string(),
        ));
    }
    assert_eq!(
        seen,
        vec![
            ("Target.attachedToTarget".to_string(), "s1".to_string()),
            ("Target.detachedFromTarget".to_string(), "s1".to_string()),
            ("Target.attachedToTarget".to_string(), "s2".to_string()),
        ]
    );
    assert_eq!(relay.status().await.unwrap().active_targets, 1);

    relay
        .execute(
            "a".into(),
            Request::with_session(1, "Runtime.evaluate", json!({}), "s1"),
        )
        .await
        .unwrap();
    assert_eq!(
        recv_json(&mut client).await["error"]["message"],
        "No such session: s1"
    );
}

#[tokio::test]
async fn idle_extension_is_replaced_busy_one_is_kept() {
    let relay = start(config());
    let mut first = MockExtension::connect(&relay).await;
    let second = MockExtension::connect(&relay).await;

    match recv(&mut first.rx).await {
        Outbound::Close { code, .. } => assert_eq!(code, CLOSE_REPLACED),
        other => panic!("expected close, got {:?}", other),
    }
    // the replaced connection closing late does not affect its successor
    relay.extension_closed(first.conn).await.unwrap();
    assert!(relay.status().await.unwrap().connected);

    second.attach(&relay, "nutbot-tab-1", "T1").await;
    let (tx, mut third) = unbounded();
    assert_eq!(
        relay.connect_extension(tx).await.unwrap(),
        Admission::Rejected
    );
    match recv(&mut third).await {
        Outbound::Close { code, reason } => {
            assert_eq!(code, CLOSE_SLOT_BUSY);
            assert_eq!(reason, "Extension slot busy");
        }
        other => panic!("expected close, got {:?}", other),
    }
    assert_eq!(
        relay.status().await.unwrap(),
        ExtensionStatus {
            connected: true,
            active_targets: 1
        }
    );
}

#[tokio::test]
async fn extension_loss_cascades() {
    let relay = start(config());
    let mut ext = MockExtension::connect(&relay).await;
    ext.attach(&relay, "nutbot-tab-1", "T1").await;
    let mut client = connect_client(&relay, "a").await;

    let exec = spawn_execute(
        &relay,
        "a",
        Request::with_session(9, "Page.captureScreenshot", json!({}), "nutbot-tab-1"),
    );
    ext.recv().await;
    relay.extension_closed(ext.conn).await.unwrap();
    exec.await.unwrap();

    let resp = recv_json(&mut client).await;
    assert_eq!(resp["id"], 9);
    assert_eq!(resp["error"]["message"], "Extension disconnected");
    let event = recv_json(&mut client).await;
    assert_eq!(
        event,
        json!({"method": "Target.detachedFromTarget", "params": {"sessionId": "nutbot-tab-1", "targetId": "T1"}})
    );
    assert_eq!(
        relay.status().await.unwrap(),
        ExtensionStatus {
            connected: false,
            active_targets: 0
        }
    );
}

#[tokio::test]
async fn forwarded_commands_time_out() {
    let relay = start(
        RelayConfig::builder()
            .request_timeout(Duration::from_millis(100))
            .keepalive_interval(Duration::from_secs(600))
            .build(),
    );
    let mut ext = MockExtension::connect(&relay).await;
    ext.attach(&relay, "nutbot-tab-1", "T1").await;
    let mut client = connect_client(&relay, "a").await;

    let exec = spawn_execute(
        &relay,
        "a",
        Request::with_session(1, "Runtime.evaluate", json!({}), "nutbot-tab-1"),
    );
    let cmd = ext.recv().await;
    exec.await.unwrap();
    let resp = recv_json(&mut client).await;
    assert_eq!(
        resp["error"]["message"],
        "Timeout waiting for response to Runtime.evaluate"
    );

    ext.reply(&relay, &cmd["id"], json!({})).await;
    assert_silent(&mut client).await;
}

#[tokio::test]
async fn client_queue_preserves_order() {
    let relay = start(config());
    let mut ext = MockExtension::connect(&relay).await;
    ext.attach(&relay, "nutbot-tab-1", "T1").await;

    let (out_tx, mut out_rx) = unbounded();
    let (frames_tx, frames_rx) = unbounded();
    let client_id = relay
        .connect_client(Some("fifo".to_string()), out_tx.clone())
        .await
        .unwrap();
    let queue = ClientQueue::new(relay.clone(), client_id, out_tx, frames_rx);
    tokio::spawn(queue.run());

    frames_tx
        .unbounded_send(
            json!({"id": 1, "method": "Runtime.evaluate", "sessionId": "nutbot-tab-1", "params": {}})
                .to_string(),
        )
        .unwrap();
    frames_tx
        .unbounded_send(json!({"id": 2, "method": "Browser.getVersion"}).to_string())
        .unwrap();

    let cmd = ext.recv().await;
    // the second command waits for the first
    assert_silent(&mut out_rx).await;
    ext.reply(&relay, &cmd["id"], json!({"result": {}})).await;

    assert_eq!(recv_json(&mut out_rx).await["id"], 1);
    assert_eq!(recv_json(&mut out_rx).await["id"], 2);

    frames_tx
        .unbounded_send(r#"{"id": 3, "method": 5}"#.to_string())
        .unwrap();
    let resp = recv_json(&mut out_rx).await;
    assert_eq!(resp["id"], 3);
    assert_eq!(resp["error"]["code"], -32600);
}

#[tokio::test]
async fn duplicate_client_ids_are_rejected() {
    let relay = start(config());
    let _first = connect_client(&relay, "dup").await;
    let (tx, mut rx) = unbounded();
    let err = relay
        .connect_client(Some("dup".to_string()), tx)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::DuplicateClient(id) if id == "dup"));
    match recv(&mut rx).await {
        Outbound::Close { code, .. } => assert_eq!(code, CLOSE_DUPLICATE_CLIENT),
        other => panic!("expected close, got {:?}", other),
    }

    // generated ids never collide
    let (tx, _rx) = unbounded();
    let a = relay.connect_client(None, tx).await.unwrap();
    let (tx, _rx2) = unbounded();
    let b = relay.connect_client(None, tx).await.unwrap();
    assert_ne!(a, b);
    assert!(a.starts_with("client-"));
}

#[tokio::test]
async fn heartbeat_and_notifications() {
    let relay = start(config());
    let mut ext = MockExtension::connect(&relay).await;

    ext.send(&relay, json!({"method": "ping"})).await;
    assert_eq!(ext.recv().await, json!({"method": "pong"}));

    ext.send(&relay, json!({"method": "log", "params": {"level": "info", "args": ["hello", 1]}}))
        .await;
    relay
        .notify(serde_json::from_value(json!({"title": "Done", "message": "Task finished"})).unwrap())
        .await
        .unwrap();
    assert_eq!(
        ext.recv().await,
        json!({"method": "showNotification", "params": {"title": "Done", "message": "Task finished"}})
    );
}

#[tokio::test]
async fn hub_pings_the_extension() {
    let relay = start(
        RelayConfig::builder()
            .keepalive_interval(Duration::from_millis(50))
            .build(),
    );
    let mut ext = MockExtension::connect(&relay).await;
    assert_eq!(ext.recv().await, json!({"method": "ping"}));
}
