// Integration tests driving a full session against an in-process fake
// interface process on the loopback interface.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ccukit_core::{
    CachedValue, CcuConfig, CcuError, CcuSession, ChannelInfo, Dialect, ExecResult, Filter,
    GroupingInfo, InterfaceConfig, ProgramInfo, ScriptClient, Value, ValueRecord, VariableInfo,
    session_id,
};
use ccukit_rpc::{InboundCall, RpcClient, RpcServer, ServerConfig};
use tokio::sync::mpsc;

// ── Harness ──

struct EmptyScript;

#[async_trait]
impl ScriptClient for EmptyScript {
    async fn get_values(&self) -> Result<Vec<CachedValue>, CcuError> {
        Ok(Vec::new())
    }
    async fn get_channels(&self) -> Result<Vec<ChannelInfo>, CcuError> {
        Ok(Vec::new())
    }
    async fn get_rooms(&self) -> Result<Vec<GroupingInfo>, CcuError> {
        Ok(Vec::new())
    }
    async fn get_functions(&self) -> Result<Vec<GroupingInfo>, CcuError> {
        Ok(Vec::new())
    }
    async fn get_variables(&self) -> Result<Vec<VariableInfo>, CcuError> {
        Ok(Vec::new())
    }
    async fn get_programs(&self) -> Result<Vec<ProgramInfo>, CcuError> {
        Ok(Vec::new())
    }
    async fn exec(&self, _script: &str) -> Result<ExecResult, CcuError> {
        Ok(ExecResult::default())
    }
}

/// In-process stand-in for a CCU interface process.
#[derive(Clone, Default)]
struct FakeCcu {
    calls: Arc<Mutex<Vec<(String, Vec<Value>)>>>,
    set_value_delay: Duration,
}

impl FakeCcu {
    fn count(&self, method: &str) -> usize {
        self.calls.lock().expect("lock").iter().filter(|(m, _)| m == method).count()
    }

    fn params_of(&self, method: &str) -> Vec<Vec<Value>> {
        self.calls
            .lock()
            .expect("lock")
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

async fn serve_fake_ccu(state: FakeCcu, mut inbound: mpsc::Receiver<InboundCall>) {
    while let Some(call) = inbound.recv().await {
        if let Ok(mut calls) = state.calls.lock() {
            calls.push((call.method.clone(), call.params.clone()));
        }
        let answer = match call.method.as_str() {
            "getLinks" | "listDevices" => Value::Array(Vec::new()),
            "getParamsetDescription" => Value::Struct(BTreeMap::from([(
                "STATE".to_owned(),
                Value::Struct(BTreeMap::from([
                    ("TYPE".to_owned(), Value::from("BOOL")),
                    ("OPERATIONS".to_owned(), Value::Int(7)),
                ])),
            )])),
            "setValue" => {
                if !state.set_value_delay.is_zero() {
                    tokio::time::sleep(state.set_value_delay).await;
                }
                Value::from("")
            }
            _ => Value::from(""),
        };
        let _ = call.reply.send(Ok(answer));
    }
}

async fn start_fake_ccu(state: FakeCcu) -> (RpcServer, u16) {
    let (server, inbound) = RpcServer::bind(&ServerConfig::loopback()).await.expect("bind");
    let port = server.xml_addr().port();
    tokio::spawn(serve_fake_ccu(state, inbound));
    (server, port)
}

fn test_config(ccu_port: u16, data_dir: &Path) -> CcuConfig {
    let localhost: IpAddr = "127.0.0.1".parse().expect("ip");
    let mut config = CcuConfig::new("127.0.0.1", localhost);
    config.interfaces = vec![InterfaceConfig {
        name: "BidCos-RF".to_owned(),
        dialect: Dialect::Xml,
        port: ccu_port,
        path: None,
        init: true,
        ping: true,
        ping_timeout: None,
        tls: false,
        auth: None,
    }];
    config.data_dir = data_dir.to_path_buf();
    config.rpc_timeout = Duration::from_secs(5);
    config
}

async fn wait_until(what: &str, mut predicate: impl FnMut() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Client speaking the controller's side of the callback channel.
fn callback_client(session: &CcuSession) -> (RpcClient, String) {
    let url = format!("http://127.0.0.1:{}", session.xml_callback_addr().port());
    let client = RpcClient::xml(&url, Duration::from_secs(5)).expect("client");
    (client, session_id(&url, "BidCos-RF"))
}

fn device_pair() -> Value {
    let device = Value::Struct(BTreeMap::from([
        ("ADDRESS".to_owned(), Value::from("NEQ0001")),
        ("TYPE".to_owned(), Value::from("HM-Sec-SC-2")),
        ("FIRMWARE".to_owned(), Value::from("1.6")),
        ("VERSION".to_owned(), Value::Int(16)),
        ("CHILDREN".to_owned(), Value::Array(vec![Value::from("NEQ0001:1")])),
    ]));
    let channel = Value::Struct(BTreeMap::from([
        ("ADDRESS".to_owned(), Value::from("NEQ0001:1")),
        ("TYPE".to_owned(), Value::from("SHUTTER_CONTACT")),
        ("PARENT".to_owned(), Value::from("NEQ0001")),
        ("PARENT_TYPE".to_owned(), Value::from("HM-Sec-SC-2")),
        ("PARAMSETS".to_owned(), Value::Array(vec![Value::from("VALUES")])),
    ]));
    Value::Array(vec![device, channel])
}

// ── Tests ──

#[tokio::test(flavor = "multi_thread")]
async fn init_handshake_then_deinit_on_close() {
    let fake = FakeCcu::default();
    let (_ccu, port) = start_fake_ccu(fake.clone()).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let session = CcuSession::connect(test_config(port, dir.path()), Arc::new(EmptyScript))
        .await
        .expect("connect");

    wait_until("init", || fake.count("init") == 1).await;
    wait_until("getLinks", || fake.count("getLinks") == 1).await;
    wait_until("status", || session.status("BidCos-RF") == Some(true)).await;

    let url = format!("http://127.0.0.1:{}", session.xml_callback_addr().port());
    let inits = fake.params_of("init");
    assert_eq!(inits[0][0], Value::from(url.as_str()));
    assert_eq!(inits[0][1], Value::from(session_id(&url, "BidCos-RF").as_str()));

    session.close().await;
    let inits = fake.params_of("init");
    assert_eq!(inits.len(), 2, "de-init sent on close");
    assert_eq!(inits[1][1], Value::from(""), "de-init carries an empty id");
}

#[tokio::test(flavor = "multi_thread")]
async fn events_reach_subscribers_with_change_detection() {
    let fake = FakeCcu::default();
    let (_ccu, port) = start_fake_ccu(fake.clone()).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let session = CcuSession::connect(test_config(port, dir.path()), Arc::new(EmptyScript))
        .await
        .expect("connect");
    wait_until("init", || fake.count("init") == 1).await;

    let (controller, id) = callback_client(&session);
    controller
        .call("newDevices", &[Value::from(id.as_str()), device_pair()])
        .await
        .expect("newDevices");
    wait_until("registry", || session.device("BidCos-RF", "NEQ0001:1").is_some()).await;

    let received: Arc<Mutex<Vec<ValueRecord>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    session.subscribe(
        Filter::new(),
        Arc::new(move |record| {
            if let Ok(mut records) = sink.lock() {
                records.push(record);
            }
        }),
    );

    let event = [
        Value::from(id.as_str()),
        Value::from("NEQ0001:1"),
        Value::from("STATE"),
        Value::Bool(true),
    ];
    controller.call("event", &event).await.expect("event");
    wait_until("first event", || received.lock().expect("lock").len() == 1).await;
    controller.call("event", &event).await.expect("event repeat");
    wait_until("second event", || received.lock().expect("lock").len() == 2).await;

    let records = received.lock().expect("lock");
    assert_eq!(records[0].iface, "BidCos-RF");
    assert_eq!(records[0].channel, "NEQ0001:1");
    assert_eq!(records[0].datapoint, "STATE");
    assert_eq!(records[0].payload, Value::Bool(true));
    assert_eq!(records[0].device.as_deref(), Some("NEQ0001"));
    assert_eq!(records[0].channel_index, Some(1));
    assert!(records[0].change, "first observation counts as a change");
    assert!(!records[1].change, "repeated value does not");
    assert_eq!(records[1].previous, Some(Value::Bool(true)));

    session.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cache_replay_skips_momentary_press_datapoints() {
    let fake = FakeCcu::default();
    let (_ccu, port) = start_fake_ccu(fake.clone()).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let session = CcuSession::connect(test_config(port, dir.path()), Arc::new(EmptyScript))
        .await
        .expect("connect");
    wait_until("init", || fake.count("init") == 1).await;

    let (controller, id) = callback_client(&session);
    for (datapoint, payload) in
        [("PRESS_SHORT", Value::Bool(true)), ("MOTION", Value::Bool(true))]
    {
        controller
            .call(
                "event",
                &[
                    Value::from(id.as_str()),
                    Value::from("NEQ0001:1"),
                    Value::from(datapoint),
                    payload,
                ],
            )
            .await
            .expect("event");
    }
    assert!(session.value("BidCos-RF", "NEQ0001:1", "PRESS_SHORT").is_some(), "press stored");

    // The replay at subscribe time is synchronous.
    let replayed: Arc<Mutex<Vec<ValueRecord>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&replayed);
    session.subscribe(
        Filter::new().cache(true),
        Arc::new(move |record| {
            if let Ok(mut records) = sink.lock() {
                records.push(record);
            }
        }),
    );

    let replayed = replayed.lock().expect("lock");
    assert_eq!(replayed.len(), 1, "only the non-momentary datapoint replays");
    assert_eq!(replayed[0].datapoint, "MOTION");
    assert!(replayed[0].cache && !replayed[0].change);

    session.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn written_value_round_trips_through_event_echo() {
    let fake = FakeCcu::default();
    let (_ccu, port) = start_fake_ccu(fake.clone()).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let session = CcuSession::connect(test_config(port, dir.path()), Arc::new(EmptyScript))
        .await
        .expect("connect");
    wait_until("init", || fake.count("init") == 1).await;

    let (controller, id) = callback_client(&session);
    controller
        .call("newDevices", &[Value::from(id.as_str()), device_pair()])
        .await
        .expect("newDevices");
    wait_until("registry", || session.device("BidCos-RF", "NEQ0001:1").is_some()).await;

    session
        .set_value_queued("BidCos-RF", "NEQ0001:1", "STATE", Value::Bool(true), false, false)
        .await
        .expect("write resolves");
    let writes = fake.params_of("setValue");
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0][0], Value::from("NEQ0001:1"));
    assert_eq!(writes[0][1], Value::from("STATE"));
    assert_eq!(writes[0][2], Value::Bool(true));

    // The interface process confirms the write by echoing the event.
    controller
        .call(
            "event",
            &[
                Value::from(id.as_str()),
                Value::from("NEQ0001:1"),
                Value::from("STATE"),
                Value::Bool(true),
            ],
        )
        .await
        .expect("echo");

    let record = session
        .value("BidCos-RF", "NEQ0001:1", "STATE")
        .expect("datapoint readable after the echo");
    assert_eq!(record.payload, Value::Bool(true));
    assert!(!record.cache, "live echo, not a cache record");

    session.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn keepalive_reinits_exactly_once_per_detection() {
    let fake = FakeCcu::default();
    let (_ccu, port) = start_fake_ccu(fake.clone()).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let mut config = test_config(port, dir.path());
    config.ping_timeout = Duration::from_millis(800);
    let session =
        CcuSession::connect(config, Arc::new(EmptyScript)).await.expect("connect");
    wait_until("init", || fake.count("init") == 1).await;

    // The watchdog only guards interfaces that have devices attached.
    let (controller, id) = callback_client(&session);
    controller
        .call("newDevices", &[Value::from(id.as_str()), device_pair()])
        .await
        .expect("newDevices");
    wait_until("registry", || session.device("BidCos-RF", "NEQ0001:1").is_some()).await;
    let event = [
        Value::from(id.as_str()),
        Value::from("NEQ0001:1"),
        Value::from("STATE"),
        Value::Bool(false),
    ];
    controller.call("event", &event).await.expect("event");

    // Nothing else arrives, so the clock runs out: one ping at half
    // time, then a single re-init.
    wait_until("re-init", || fake.count("init") == 2).await;
    assert!(fake.count("ping") >= 1, "ping precedes the re-init");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fake.count("init"), 2, "one re-init per detection");

    session.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn queued_writes_coalesce_and_reject_the_superseded_caller() {
    let fake = FakeCcu { set_value_delay: Duration::from_millis(300), ..FakeCcu::default() };
    let (_ccu, port) = start_fake_ccu(fake.clone()).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let session = CcuSession::connect(test_config(port, dir.path()), Arc::new(EmptyScript))
        .await
        .expect("connect");
    wait_until("init", || fake.count("init") == 1).await;

    let first_session = session.clone();
    let first = tokio::spawn(async move {
        first_session
            .set_value_queued("BidCos-RF", "NEQ0001:1", "STATE", Value::Bool(true), false, false)
            .await
    });
    // Let the first write reach the wire before queueing the next two.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (second, third) = tokio::join!(
        session.set_value_queued("BidCos-RF", "NEQ0001:1", "STATE", Value::Bool(false), false, false),
        session.set_value_queued("BidCos-RF", "NEQ0001:1", "STATE", Value::Bool(false), false, true),
    );
    assert!(matches!(second, Err(CcuError::Superseded)), "replaced write rejects");
    assert!(third.is_ok(), "latest write wins");
    assert!(first.await.expect("join").is_ok());

    let writes = fake.params_of("setValue");
    assert_eq!(writes.len(), 2, "coalesced burst produced one wire write");
    assert_eq!(writes[0][2], Value::Bool(true));
    assert_eq!(writes[1][2], Value::Bool(false));

    session.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_interface_is_rejected_immediately() {
    let fake = FakeCcu::default();
    let (_ccu, port) = start_fake_ccu(fake.clone()).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let session = CcuSession::connect(test_config(port, dir.path()), Arc::new(EmptyScript))
        .await
        .expect("connect");

    let result = session.method_call("HmIP-Wired", "ping", &[]).await;
    assert!(matches!(result, Err(CcuError::UnknownInterface(_))));

    session.close().await;
}
