// ── Interface session manager ──
//
// Owns the callback server, one RPC client per interface process, the
// keepalive watchdogs and the write paths, and stitches the stores,
// the normalizer and the logic-layer runtime into one facade.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use ccukit_rpc::{Fault, InboundCall, RpcClient, RpcServer, ServerConfig, Value, XmlOptions};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{CcuConfig, Dialect, InterfaceConfig};
use crate::error::CcuError;
use crate::events::{EventContext, Normalizer};
use crate::model::{
    DeviceDescription, ParameterDescription, ParamsetDescription, Program, SysVar, ValueRecord,
    paramset_from_wire,
};
use crate::script::{ExecResult, RegaRuntime, ScriptClient};
use crate::store::{
    DeviceRegistry, FetchRequest, ParamsetCache, Persistence, RegaIndex, RegaSnapshot, ValueStore,
    paramset_key,
};
use crate::subscribe::{
    DatapointCallback, Filter, ProgramCallback, ProgramFilter, SubscriptionEngine, SysvarCallback,
    SysvarFilter,
};
use crate::write::{Throttle, WriteExecutor, WriteQueue, WriteRequest, is_redundant, param_cast};

/// Bound on the de-init calls and server teardown during shutdown.
const CLOSE_STEP_TIMEOUT: Duration = Duration::from_secs(2);
/// Pause between paramset description fetches.
const PARAMSET_FETCH_PAUSE: Duration = Duration::from_millis(200);
/// Cadence of the rx/tx counter log line.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

// ── Session ids ──

/// Registration id sent with `init`: `ck_` + six hex digits of the
/// callback URL hash + the interface name, so inbound calls can be
/// routed back to their interface. CUxD ignores custom ids and echoes
/// the bare interface name instead.
pub fn session_id(callback_url: &str, iface: &str) -> String {
    if iface == "CUxD" {
        return iface.to_owned();
    }
    let digest = Sha256::digest(callback_url.as_bytes());
    let mut hash = String::with_capacity(6);
    for byte in digest.iter().take(3) {
        let _ = write!(hash, "{byte:02x}");
    }
    format!("ck_{hash}_{iface}")
}

/// Interface name carried in an inbound registration id.
pub fn iface_from_session_id(id: &str) -> Option<&str> {
    match id.strip_prefix("ck_") {
        Some(rest) => rest.split_once('_').map(|(_, iface)| iface),
        None if !id.is_empty() => Some(id),
        None => None,
    }
}

// ── Inbound dispatch ──

const SUPPORTED_METHODS: [&str; 10] = [
    "system.listMethods",
    "setReadyConfig",
    "updateDevice",
    "replaceDevice",
    "readdedDevice",
    "newDevices",
    "deleteDevices",
    "listDevices",
    "event",
    "system.multicall",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallbackMethod {
    ListMethods,
    SetReadyConfig,
    UpdateDevice,
    ReplaceDevice,
    ReaddedDevice,
    NewDevices,
    DeleteDevices,
    ListDevices,
    Event,
    Multicall,
}

impl CallbackMethod {
    fn parse(method: &str) -> Option<Self> {
        match method {
            "system.listMethods" => Some(CallbackMethod::ListMethods),
            "setReadyConfig" => Some(CallbackMethod::SetReadyConfig),
            "updateDevice" => Some(CallbackMethod::UpdateDevice),
            "replaceDevice" => Some(CallbackMethod::ReplaceDevice),
            "readdedDevice" => Some(CallbackMethod::ReaddedDevice),
            "newDevices" => Some(CallbackMethod::NewDevices),
            "deleteDevices" => Some(CallbackMethod::DeleteDevices),
            "listDevices" => Some(CallbackMethod::ListDevices),
            "event" => Some(CallbackMethod::Event),
            "system.multicall" => Some(CallbackMethod::Multicall),
            _ => None,
        }
    }
}

// ── Per-interface runtime ──

struct QueuedCall {
    method: String,
    params: Vec<Value>,
    reply: oneshot::Sender<Result<Value, CcuError>>,
}

struct IfaceRuntime {
    config: InterfaceConfig,
    endpoint: String,
    callback_url: String,
    session_id: String,
    client: StdMutex<Option<RpcClient>>,
    /// Calls issued before the client exists; flushed in order once it does.
    queued: StdMutex<Vec<QueuedCall>>,
    last_event: watch::Sender<Instant>,
    status: watch::Sender<bool>,
    tx: AtomicU64,
    rx: AtomicU64,
}

impl IfaceRuntime {
    fn touch(&self) {
        // send_replace: the clock must advance even before the watchdog
        // subscribes (and when keepalive is disabled entirely).
        self.last_event.send_replace(Instant::now());
    }

    fn create_client(&self, timeout: Duration) -> Result<RpcClient, CcuError> {
        let client = match self.config.dialect {
            Dialect::Xml => RpcClient::xml_with(
                &self.endpoint,
                timeout,
                XmlOptions {
                    auth: self.config.auth.clone(),
                    // The controller serves a self-signed certificate.
                    insecure_tls: self.config.tls,
                },
            )?,
            Dialect::Bin => {
                let (host, port) = self
                    .endpoint
                    .rsplit_once(':')
                    .ok_or_else(|| CcuError::Config(format!("bad endpoint {}", self.endpoint)))?;
                let port = port
                    .parse()
                    .map_err(|_| CcuError::Config(format!("bad endpoint {}", self.endpoint)))?;
                RpcClient::bin(host, port, timeout)?
            }
        };
        Ok(client)
    }
}

// ── Outbound wire ──

/// Outbound RPC shared by the session facade and both write paths.
struct Wire {
    ifaces: BTreeMap<String, Arc<IfaceRuntime>>,
    registry: Arc<DeviceRegistry>,
    paramsets: Arc<ParamsetCache>,
    clamp_to_bounds: bool,
    rpc_timeout: Duration,
}

impl Wire {
    async fn call(&self, iface: &str, method: &str, params: &[Value]) -> Result<Value, CcuError> {
        let runtime = self
            .ifaces
            .get(iface)
            .ok_or_else(|| CcuError::UnknownInterface(iface.to_owned()))?;

        let client = runtime.client.lock().ok().and_then(|slot| slot.clone());
        let Some(client) = client else {
            debug!(iface, method, "client not ready, deferring call");
            let (reply, rx) = oneshot::channel();
            if let Ok(mut queued) = runtime.queued.lock() {
                queued.push(QueuedCall { method: method.to_owned(), params: params.to_vec(), reply });
            }
            return rx.await.map_err(|_| CcuError::Shutdown)?;
        };

        if matches!(method, "setValue" | "putParamset" | "activateLinkParamset") {
            runtime.tx.fetch_add(1, Ordering::Relaxed);
        }
        debug!(iface, method, "rpc >");
        match client.call(method, params).await {
            Ok(answer) => Ok(answer),
            Err(e) if e.is_transport() => {
                error!(iface, method, error = %e, "transport failure, recreating client");
                if let Ok(mut slot) = runtime.client.lock() {
                    *slot = runtime.create_client(self.rpc_timeout).ok();
                }
                Err(e.into())
            }
            Err(e) => {
                error!(iface, method, error = %e, "call rejected");
                Err(e.into())
            }
        }
    }

    /// Install the client and replay calls parked while it was missing.
    fn install_client(self: &Arc<Self>, runtime: &Arc<IfaceRuntime>, client: RpcClient) {
        if let Ok(mut slot) = runtime.client.lock() {
            *slot = Some(client);
        }
        let parked = runtime
            .queued
            .lock()
            .map(|mut queued| std::mem::take(&mut *queued))
            .unwrap_or_default();
        if parked.is_empty() {
            return;
        }
        debug!(iface = %runtime.config.name, count = parked.len(), "flushing deferred calls");
        let wire = Arc::clone(self);
        let iface = runtime.config.name.clone();
        tokio::spawn(async move {
            for call in parked {
                let result = wire.call(&iface, &call.method, &call.params).await;
                let _ = call.reply.send(result);
            }
        });
    }

    fn schema_for(
        &self,
        iface: &str,
        address: &str,
        paramset: &str,
        datapoint: &str,
    ) -> Option<ParameterDescription> {
        let device = self.registry.get(iface, address)?;
        let parent = self.registry.parent_of(iface, &device);
        let key = paramset_key(iface, &device, parent.as_ref(), paramset);
        self.paramsets
            .get_or_enqueue(FetchRequest {
                iface: iface.to_owned(),
                address: address.to_owned(),
                paramset: paramset.to_owned(),
                key,
            })
            .get(datapoint)
            .cloned()
    }

    /// One casted setValue on the wire. Burst mode is a BidCos-RF
    /// extension; other interfaces reject a fourth parameter.
    async fn set_value_rpc(&self, request: WriteRequest) -> Result<(), CcuError> {
        let schema = self.schema_for(&request.iface, &request.address, "VALUES", &request.datapoint);
        let value = param_cast(schema.as_ref(), &request.value, self.clamp_to_bounds);
        let mut params = vec![
            Value::from(request.address.as_str()),
            Value::from(request.datapoint.as_str()),
            value,
        ];
        if request.iface == "BidCos-RF" && request.burst {
            params.push(Value::Bool(true));
        }
        self.call(&request.iface, "setValue", &params).await.map(|_| ())
    }
}

fn filter_links(links: &[Value], address: &str, receiver: bool) -> Vec<String> {
    let (own, peer) = if receiver { ("RECEIVER", "SENDER") } else { ("SENDER", "RECEIVER") };
    links
        .iter()
        .filter(|link| link.get(own).and_then(Value::as_str) == Some(address))
        .filter_map(|link| link.get(peer).and_then(Value::as_str).map(str::to_owned))
        .collect()
}

// ── Session ──

struct SessionInner {
    config: CcuConfig,
    wire: Arc<Wire>,
    registry: Arc<DeviceRegistry>,
    paramsets: Arc<ParamsetCache>,
    index: Arc<RegaIndex>,
    values: Arc<ValueStore>,
    subscriptions: Arc<SubscriptionEngine>,
    normalizer: Normalizer,
    rega: RegaRuntime,
    persist: Persistence,
    links: DashMap<String, Vec<Value>>,
    queue: WriteQueue,
    throttle: Throttle,
    server: StdMutex<Option<RpcServer>>,
    xml_callback_addr: SocketAddr,
    bin_callback_addr: SocketAddr,
    cancel: CancellationToken,
}

/// Connection to one controller. Cheap to clone.
#[derive(Clone)]
pub struct CcuSession {
    inner: Arc<SessionInner>,
}

impl CcuSession {
    /// Bind the callback server, connect every configured interface and
    /// start the background machinery. Interface handshakes run in the
    /// background; a dead interface process degrades to a disconnected
    /// status rather than failing the whole session.
    pub async fn connect(
        config: CcuConfig,
        script_client: Arc<dyn ScriptClient>,
    ) -> Result<Self, CcuError> {
        let cancel = CancellationToken::new();
        let persist = Persistence::new(config.data_dir.clone(), &config.host);

        let registry = Arc::new(DeviceRegistry::new());
        registry.load(persist.load_or_default(&persist.registry_path()));
        let paramsets = Arc::new(ParamsetCache::new());
        paramsets.load(persist.load_or_default(&persist.paramsets_path()));
        let index = Arc::new(RegaIndex::new());
        index.load(persist.load_or_default::<RegaSnapshot>(&persist.rega_path()));
        let values = Arc::new(ValueStore::new());
        values.load_cold(persist.load_or_default(&persist.values_path()));

        let server_config = ServerConfig {
            xml_addr: SocketAddr::new(config.callback_host, config.callback_xml_port),
            bin_addr: SocketAddr::new(config.callback_host, config.callback_bin_port),
            queue_depth: 64,
        };
        let (server, inbound) = RpcServer::bind(&server_config).await?;
        let xml_callback_addr = server.xml_addr();
        let bin_callback_addr = server.bin_addr();
        let xml_url = format!("http://{}:{}", config.callback_host, xml_callback_addr.port());
        let bin_url = format!("xmlrpc_bin://{}:{}", config.callback_host, bin_callback_addr.port());

        let mut ifaces = BTreeMap::new();
        for iface in &config.interfaces {
            let callback_url = match iface.dialect {
                Dialect::Xml => xml_url.clone(),
                Dialect::Bin => bin_url.clone(),
            };
            let runtime = Arc::new(IfaceRuntime {
                endpoint: config.endpoint(iface),
                session_id: session_id(&callback_url, &iface.name),
                callback_url,
                config: iface.clone(),
                client: StdMutex::new(None),
                queued: StdMutex::new(Vec::new()),
                last_event: watch::Sender::new(Instant::now()),
                status: watch::Sender::new(false),
                tx: AtomicU64::new(0),
                rx: AtomicU64::new(0),
            });
            ifaces.insert(iface.name.clone(), runtime);
        }

        let wire = Arc::new(Wire {
            ifaces,
            registry: Arc::clone(&registry),
            paramsets: Arc::clone(&paramsets),
            clamp_to_bounds: config.clamp_to_bounds,
            rpc_timeout: config.rpc_timeout,
        });

        let exec_wire = Arc::clone(&wire);
        let executor: WriteExecutor = Arc::new(move |request| {
            let wire = Arc::clone(&exec_wire);
            Box::pin(async move { wire.set_value_rpc(request).await })
        });
        let queue = WriteQueue::start(
            Arc::clone(&executor),
            config.queue_timeout,
            config.queue_pause,
            cancel.child_token(),
        );
        let throttle = Throttle::new(executor, config.set_value_throttle, cancel.child_token());

        let subscriptions = Arc::new(SubscriptionEngine::new());
        let normalizer = Normalizer::new(
            Arc::clone(&registry),
            Arc::clone(&paramsets),
            Arc::clone(&index),
            Arc::clone(&values),
            Arc::clone(&subscriptions),
            config.working_debounce,
        );
        let rega = RegaRuntime::new(
            script_client,
            Arc::clone(&index),
            normalizer.clone(),
            Arc::clone(&subscriptions),
            config.interfaces.iter().map(|i| i.name.clone()).collect(),
            config.rega_poll_interval,
            cancel.child_token(),
        );

        let session = CcuSession {
            inner: Arc::new(SessionInner {
                config,
                wire,
                registry,
                paramsets,
                index,
                values,
                subscriptions,
                normalizer,
                rega,
                persist,
                links: DashMap::new(),
                queue,
                throttle,
                server: StdMutex::new(Some(server)),
                xml_callback_addr,
                bin_callback_addr,
                cancel,
            }),
        };

        session.spawn_dispatch(inbound);
        session.spawn_paramset_fetcher();
        session.spawn_stats();
        session.start_interfaces();
        session.start_rega();

        let names: Vec<&str> =
            session.inner.config.interfaces.iter().map(|i| i.name.as_str()).collect();
        info!(interfaces = names.join(", "), "session connected");
        Ok(session)
    }

    // ── Startup tasks ──

    fn start_interfaces(&self) {
        for runtime in self.inner.wire.ifaces.values() {
            match runtime.create_client(self.inner.config.rpc_timeout) {
                Ok(client) => self.inner.wire.install_client(runtime, client),
                Err(e) => error!(iface = %runtime.config.name, error = %e, "client creation failed"),
            }
            let session = self.clone();
            let runtime = Arc::clone(runtime);
            tokio::spawn(async move {
                if runtime.config.init {
                    match session.rpc_init(&runtime).await {
                        Ok(()) => session.set_status(&runtime, true),
                        Err(e) => {
                            error!(iface = %runtime.config.name, error = %e, "init failed");
                            session.set_status(&runtime, false);
                        }
                    }
                } else {
                    session.set_status(&runtime, true);
                }
                if runtime.config.init && runtime.config.ping {
                    session.spawn_watchdog(runtime);
                }
            });
        }
    }

    fn start_rega(&self) {
        let rega = self.inner.rega.clone();
        tokio::spawn(async move {
            if let Err(e) = rega.bootstrap().await {
                warn!(error = %e, "rega bootstrap failed");
            }
            rega.spawn_poller();
        });

        // First completed poll round flushes the rega/value snapshots.
        let session = self.clone();
        tokio::spawn(async move {
            let mut first = session.inner.rega.subscribe_first_poll();
            tokio::select! {
                () = session.inner.cancel.cancelled() => {}
                result = first.wait_for(|done| *done) => {
                    if result.is_ok() {
                        session.persist_rega();
                        session.persist_values();
                    }
                }
            }
        });
    }

    fn spawn_dispatch(&self, mut inbound: mpsc::Receiver<InboundCall>) {
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = session.inner.cancel.cancelled() => return,
                    call = inbound.recv() => {
                        let Some(call) = call else { return };
                        session.handle_inbound(call);
                    }
                }
            }
        });
    }

    fn spawn_paramset_fetcher(&self) {
        let session = self.clone();
        tokio::spawn(async move {
            let inner = &session.inner;
            loop {
                let request = tokio::select! {
                    () = inner.cancel.cancelled() => return,
                    request = inner.paramsets.next_request() => request,
                };
                let params =
                    [Value::from(request.address.as_str()), Value::from(request.paramset.as_str())];
                match inner.wire.call(&request.iface, "getParamsetDescription", &params).await {
                    Ok(answer) => match paramset_from_wire(&answer) {
                        Some(description) => {
                            if inner.paramsets.complete(&request.key, description) {
                                session.persist_paramsets();
                            }
                        }
                        None => {
                            warn!(key = %request.key, "undecodable paramset description");
                            inner.paramsets.abandon(&request.key);
                        }
                    },
                    Err(e) => {
                        error!(key = %request.key, error = %e, "getParamsetDescription failed");
                        inner.paramsets.abandon(&request.key);
                    }
                }
                tokio::select! {
                    () = inner.cancel.cancelled() => return,
                    () = tokio::time::sleep(PARAMSET_FETCH_PAUSE) => {}
                }
            }
        });
    }

    fn spawn_stats(&self) {
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = session.inner.cancel.cancelled() => return,
                    () = tokio::time::sleep(STATS_INTERVAL) => {}
                }
                for runtime in session.inner.wire.ifaces.values() {
                    debug!(
                        iface = %runtime.config.name,
                        rx = runtime.rx.load(Ordering::Relaxed),
                        tx = runtime.tx.load(Ordering::Relaxed),
                        "rpc stats"
                    );
                }
            }
        });
    }

    // ── Keepalive ──

    /// Per-interface liveness watchdog. The deadline is rearmed from the
    /// last-event clock whenever something arrives; at half the timeout
    /// a ping goes out, at the full timeout the interface is marked down
    /// and re-registered once.
    fn spawn_watchdog(&self, runtime: Arc<IfaceRuntime>) {
        let session = self.clone();
        tokio::spawn(async move {
            let inner = &session.inner;
            let timeout = runtime.config.effective_ping_timeout(inner.config.ping_timeout);
            let mut last_rx = runtime.last_event.subscribe();
            loop {
                // An interface with no devices pushes no events; checking
                // it would re-init in a loop for nothing.
                if !inner.registry.has_devices(&runtime.config.name) {
                    tokio::select! {
                        () = inner.cancel.cancelled() => return,
                        _ = last_rx.changed() => {}
                        () = tokio::time::sleep(timeout) => {}
                    }
                    continue;
                }

                let elapsed = last_rx.borrow_and_update().elapsed();
                if elapsed >= timeout {
                    warn!(
                        iface = %runtime.config.name,
                        elapsed_secs = elapsed.as_secs(),
                        "ping timeout"
                    );
                    session.set_status(&runtime, false);
                    // Resetting the clock guarantees a single re-init per
                    // detection even if it takes a while to come back.
                    runtime.touch();
                    match session.rpc_init(&runtime).await {
                        Ok(()) => session.set_status(&runtime, true),
                        Err(e) => error!(iface = %runtime.config.name, error = %e, "re-init failed"),
                    }
                    continue;
                }
                if elapsed >= timeout / 2 {
                    debug!(iface = %runtime.config.name, "ping");
                    let params = [Value::from(runtime.session_id.as_str())];
                    if inner.wire.call(&runtime.config.name, "ping", &params).await.is_err() {
                        session.set_status(&runtime, false);
                    }
                }
                let wait = if elapsed >= timeout / 2 { timeout - elapsed } else { timeout / 2 - elapsed };
                tokio::select! {
                    () = inner.cancel.cancelled() => return,
                    _ = last_rx.changed() => {}
                    () = tokio::time::sleep(wait) => {}
                }
            }
        });
    }

    fn set_status(&self, runtime: &IfaceRuntime, up: bool) {
        let changed = runtime.status.send_if_modified(|current| {
            if *current == up {
                false
            } else {
                *current = up;
                true
            }
        });
        if changed {
            if up {
                info!(iface = %runtime.config.name, "interface connected");
            } else {
                warn!(iface = %runtime.config.name, "interface disconnected");
            }
        }
    }

    // ── Init handshake ──

    async fn rpc_init(&self, runtime: &Arc<IfaceRuntime>) -> Result<(), CcuError> {
        let inner = &self.inner;
        let iface = runtime.config.name.as_str();
        runtime.touch();
        info!(iface, url = %runtime.callback_url, id = %runtime.session_id, "init");
        let params = [
            Value::from(runtime.callback_url.as_str()),
            Value::from(runtime.session_id.as_str()),
        ];
        inner.wire.call(iface, "init", &params).await?;

        match iface {
            // CUxD never pushes device lists; it has to be asked.
            "CUxD" => {
                if let Err(e) = self.fetch_devices(iface).await {
                    warn!(iface, error = %e, "listDevices failed");
                }
            }
            "BidCos-RF" | "BidCos-Wired" | "HmIP-RF" => {
                match inner.wire.call(iface, "getLinks", &[]).await {
                    Ok(answer) => {
                        let links = answer.as_array().cloned().unwrap_or_default();
                        debug!(iface, count = links.len(), "links loaded");
                        inner.links.insert(iface.to_owned(), links);
                    }
                    Err(e) => warn!(iface, error = %e, "getLinks failed"),
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Full device-list reconcile for interfaces that do not push
    /// newDevices/deleteDevices on their own.
    async fn fetch_devices(&self, iface: &str) -> Result<(), CcuError> {
        let inner = &self.inner;
        let answer = inner.wire.call(iface, "listDevices", &[]).await?;
        let list = answer.as_array().cloned().unwrap_or_default();

        let mut known = Vec::with_capacity(list.len());
        let mut fresh = Vec::new();
        let mut changed = false;
        for entry in &list {
            let Some(desc) = DeviceDescription::from_wire(entry) else {
                warn!(iface, "undecodable device description");
                continue;
            };
            known.push(desc.address.clone());
            if inner.registry.add_device(iface, desc.clone()) {
                changed = true;
            }
            fresh.push(desc);
        }
        for desc in &fresh {
            let parent = inner.registry.parent_of(iface, desc);
            inner.paramsets.enqueue_device(iface, desc, parent.as_ref());
        }
        for address in inner.registry.addresses(iface) {
            if !known.contains(&address) {
                debug!(iface, address = %address, "device gone");
                inner.registry.remove_device(iface, &address);
                changed = true;
            }
        }
        if changed {
            self.persist_registry();
        }
        Ok(())
    }

    // ── Inbound handling ──

    fn handle_inbound(&self, call: InboundCall) {
        let inner = &self.inner;
        let Some(method) = CallbackMethod::parse(&call.method) else {
            error!(method = %call.method, "unsupported callback method");
            let _ = call.reply.send(Err(Fault::new(-32601, "unknown method")));
            return;
        };

        let registration = call.params.first().and_then(Value::as_str).unwrap_or_default();
        let Some(iface) = iface_from_session_id(registration).map(str::to_owned) else {
            warn!(method = %call.method, "callback without registration id");
            let _ = call.reply.send(Ok(Value::from("")));
            return;
        };
        if let Some(runtime) = inner.wire.ifaces.get(&iface) {
            runtime.touch();
            self.set_status(runtime, true);
        }
        debug!(%iface, method = %call.method, "rpc <");

        let answer = match method {
            CallbackMethod::ListMethods => {
                Value::Array(SUPPORTED_METHODS.iter().map(|m| Value::from(*m)).collect())
            }
            CallbackMethod::SetReadyConfig
            | CallbackMethod::UpdateDevice
            | CallbackMethod::ReplaceDevice
            | CallbackMethod::ReaddedDevice => Value::from(""),
            CallbackMethod::NewDevices => {
                self.ingest_new_devices(&iface, call.params.get(1));
                Value::from("")
            }
            CallbackMethod::DeleteDevices => {
                self.ingest_deleted_devices(&iface, call.params.get(1));
                Value::from("")
            }
            CallbackMethod::ListDevices => inner.registry.list_answer(&iface),
            CallbackMethod::Event => {
                if let (Some(channel), Some(datapoint), Some(payload)) = (
                    call.params.get(1).and_then(Value::as_str),
                    call.params.get(2).and_then(Value::as_str),
                    call.params.get(3),
                ) {
                    if datapoint != "PONG" {
                        if let Some(runtime) = inner.wire.ifaces.get(&iface) {
                            runtime.rx.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    inner.normalizer.handle_event(
                        &iface,
                        channel,
                        datapoint,
                        payload.clone(),
                        EventContext::live(),
                    );
                }
                Value::from("")
            }
            CallbackMethod::Multicall => {
                let calls = call
                    .params
                    .first()
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let handled = inner.normalizer.handle_multicall(&iface, &calls);
                if handled > 0 {
                    if let Some(runtime) = inner.wire.ifaces.get(&iface) {
                        runtime.rx.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Value::Array(calls.iter().map(|_| Value::from("")).collect())
            }
        };
        let _ = call.reply.send(Ok(answer));
    }

    fn ingest_new_devices(&self, iface: &str, devices: Option<&Value>) {
        let inner = &self.inner;
        let Some(list) = devices.and_then(Value::as_array) else {
            return;
        };
        let mut fresh = Vec::new();
        let mut changed = false;
        for entry in list {
            let Some(desc) = DeviceDescription::from_wire(entry) else {
                warn!(iface, "undecodable device description");
                continue;
            };
            if inner.registry.add_device(iface, desc.clone()) {
                debug!(iface, address = %desc.address, "new device");
                changed = true;
            }
            fresh.push(desc);
        }
        for desc in &fresh {
            let parent = inner.registry.parent_of(iface, desc);
            inner.paramsets.enqueue_device(iface, desc, parent.as_ref());
        }
        if changed {
            self.persist_registry();
        }
    }

    fn ingest_deleted_devices(&self, iface: &str, addresses: Option<&Value>) {
        let inner = &self.inner;
        let Some(list) = addresses.and_then(Value::as_array) else {
            return;
        };
        let mut changed = false;
        for entry in list {
            if let Some(address) = entry.as_str() {
                if inner.registry.remove_device(iface, address).is_some() {
                    debug!(iface, address, "device deleted");
                    changed = true;
                }
            }
        }
        if changed {
            self.persist_registry();
        }
    }

    // ── Persistence ──

    fn persist_registry(&self) {
        let inner = &self.inner;
        let path = inner.persist.registry_path();
        if let Err(e) = inner.persist.save(&path, &inner.registry.snapshot()) {
            error!(error = %e, "persisting device registry failed");
        }
    }

    fn persist_paramsets(&self) {
        let inner = &self.inner;
        let path = inner.persist.paramsets_path();
        if let Err(e) = inner.persist.save(&path, &inner.paramsets.snapshot()) {
            error!(error = %e, "persisting paramsets failed");
        }
    }

    fn persist_rega(&self) {
        let inner = &self.inner;
        let path = inner.persist.rega_path();
        if let Err(e) = inner.persist.save(&path, &inner.index.snapshot()) {
            error!(error = %e, "persisting rega metadata failed");
        }
    }

    fn persist_values(&self) {
        let inner = &self.inner;
        let path = inner.persist.values_path();
        if let Err(e) = inner.persist.save(&path, &inner.values.snapshot()) {
            error!(error = %e, "persisting values failed");
        }
    }

    // ── Subscriptions ──

    /// Subscribe to datapoint events. With `cache` set, the current
    /// store content is replayed to the new subscriber as cache records.
    pub fn subscribe(&self, filter: Filter, callback: DatapointCallback) -> u64 {
        let inner = &self.inner;
        let id = inner.subscriptions.subscribe(filter, callback);
        if inner.subscriptions.wants_cache(id) {
            inner.values.for_each(|record| {
                // Momentary press events must never be replayed as state.
                if record.datapoint.starts_with("PRESS_") {
                    return;
                }
                let mut replay = record.clone();
                replay.cache = true;
                replay.change = false;
                inner.subscriptions.replay_to(id, &replay);
            });
        }
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.inner.subscriptions.unsubscribe(id)
    }

    pub fn subscribe_sysvar(&self, filter: SysvarFilter, callback: SysvarCallback) -> u64 {
        self.inner.subscriptions.subscribe_sysvar(filter, callback)
    }

    pub fn unsubscribe_sysvar(&self, id: u64) -> bool {
        self.inner.subscriptions.unsubscribe_sysvar(id)
    }

    pub fn subscribe_program(&self, filter: ProgramFilter, callback: ProgramCallback) -> u64 {
        self.inner.subscriptions.subscribe_program(filter, callback)
    }

    pub fn unsubscribe_program(&self, id: u64) -> bool {
        self.inner.subscriptions.unsubscribe_program(id)
    }

    // ── Writes ──

    /// Throttled direct write. BidCos-Wired endpoints choke on rapid
    /// re-registration, not on writes, and bypass the throttle.
    pub async fn set_value(
        &self,
        iface: &str,
        address: &str,
        datapoint: &str,
        value: Value,
        burst: bool,
    ) -> Result<(), CcuError> {
        let inner = &self.inner;
        if !inner.wire.ifaces.contains_key(iface) {
            return Err(CcuError::UnknownInterface(iface.to_owned()));
        }
        let request = WriteRequest {
            iface: iface.to_owned(),
            address: address.to_owned(),
            datapoint: datapoint.to_owned(),
            value,
            burst,
        };
        if iface == "BidCos-Wired" {
            return inner.wire.set_value_rpc(request).await;
        }
        inner.throttle.submit(request).await.map_err(|_| CcuError::Shutdown)?
    }

    /// Serialized write. A value the store already holds from a live
    /// observation is skipped unless forced; momentary and action
    /// datapoints always go out.
    pub async fn set_value_queued(
        &self,
        iface: &str,
        address: &str,
        datapoint: &str,
        value: Value,
        burst: bool,
        force: bool,
    ) -> Result<(), CcuError> {
        let inner = &self.inner;
        if !inner.wire.ifaces.contains_key(iface) {
            return Err(CcuError::UnknownInterface(iface.to_owned()));
        }
        let key = ValueRecord::key(iface, address, datapoint);
        let current = inner.values.get(&key);
        if is_redundant(current.as_ref(), &value, force) {
            debug!(%key, "value unchanged, skipping write");
            return Ok(());
        }
        let request = WriteRequest {
            iface: iface.to_owned(),
            address: address.to_owned(),
            datapoint: datapoint.to_owned(),
            value,
            burst,
        };
        inner.queue.submit(request).await.map_err(|_| CcuError::Shutdown)?
    }

    pub async fn set_variable(&self, name: &str, value: Value) -> Result<(), CcuError> {
        self.inner.rega.set_variable(name, value).await
    }

    pub async fn program_active(&self, name: &str, active: bool) -> Result<Program, CcuError> {
        self.inner.rega.program_active(name, active).await
    }

    pub async fn program_execute(&self, name: &str) -> Result<Program, CcuError> {
        self.inner.rega.program_execute(name).await
    }

    // ── RPC and scripting passthrough ──

    pub async fn method_call(
        &self,
        iface: &str,
        method: &str,
        params: &[Value],
    ) -> Result<Value, CcuError> {
        self.inner.wire.call(iface, method, params).await
    }

    pub async fn script(&self, script: &str) -> Result<ExecResult, CcuError> {
        self.inner.rega.exec(script).await
    }

    // ── Lookups ──

    /// Interface a channel or device address belongs to.
    pub fn find_iface(&self, address: &str) -> Option<String> {
        self.inner.registry.find_iface(address)
    }

    /// Address of a channel (or device, unless `channels_only`) by its
    /// display name.
    pub fn find_channel(&self, name: &str, channels_only: bool) -> Option<String> {
        self.inner
            .index
            .snapshot()
            .channel_names
            .into_iter()
            .find(|(address, channel_name)| {
                channel_name == name && (!channels_only || address.contains(':'))
            })
            .map(|(address, _)| address)
    }

    /// Cache key of an address's paramset, resolved through its parent.
    pub fn paramset_name(&self, iface: &str, address: &str, paramset: &str) -> Option<String> {
        let device = self.inner.registry.get(iface, address)?;
        let parent = self.inner.registry.parent_of(iface, &device);
        Some(paramset_key(iface, &device, parent.as_ref(), paramset))
    }

    /// Schema of one paramset; queues a background fetch when unknown.
    pub fn paramset_description(
        &self,
        iface: &str,
        address: &str,
        paramset: &str,
    ) -> Option<ParamsetDescription> {
        let inner = &self.inner;
        let device = inner.registry.get(iface, address)?;
        let parent = inner.registry.parent_of(iface, &device);
        let key = paramset_key(iface, &device, parent.as_ref(), paramset);
        if let Some(found) = inner.paramsets.get(&key) {
            return Some(found);
        }
        inner.paramsets.enqueue(FetchRequest {
            iface: iface.to_owned(),
            address: address.to_owned(),
            paramset: paramset.to_owned(),
            key,
        });
        None
    }

    /// Coerce a value the way a write to this datapoint would.
    pub fn param_cast(&self, iface: &str, address: &str, datapoint: &str, value: &Value) -> Value {
        let schema = self.inner.wire.schema_for(iface, address, "VALUES", datapoint);
        param_cast(schema.as_ref(), value, self.inner.config.clamp_to_bounds)
    }

    /// Link partners of a channel, filtered by direction.
    pub fn get_links(&self, iface: &str, address: &str, receiver: bool) -> Vec<String> {
        self.inner
            .links
            .get(iface)
            .map(|links| filter_links(&links, address, receiver))
            .unwrap_or_default()
    }

    pub fn interfaces(&self) -> Vec<String> {
        self.inner.wire.ifaces.keys().cloned().collect()
    }

    pub fn status(&self, iface: &str) -> Option<bool> {
        self.inner.wire.ifaces.get(iface).map(|r| *r.status.borrow())
    }

    /// Observe an interface's connected/disconnected transitions.
    pub fn subscribe_status(&self, iface: &str) -> Option<watch::Receiver<bool>> {
        self.inner.wire.ifaces.get(iface).map(|r| r.status.subscribe())
    }

    pub fn rooms(&self) -> Vec<String> {
        self.inner.index.room_names()
    }

    pub fn functions(&self) -> Vec<String> {
        self.inner.index.function_names()
    }

    pub fn sysvars(&self) -> Vec<SysVar> {
        self.inner.rega.sysvars()
    }

    pub fn programs(&self) -> Vec<Program> {
        self.inner.rega.programs()
    }

    pub fn value(&self, iface: &str, channel: &str, datapoint: &str) -> Option<ValueRecord> {
        self.inner.values.get(&ValueRecord::key(iface, channel, datapoint))
    }

    pub fn device(&self, iface: &str, address: &str) -> Option<DeviceDescription> {
        self.inner.registry.get(iface, address)
    }

    /// Local callback endpoint for the XML dialect.
    pub fn xml_callback_addr(&self) -> SocketAddr {
        self.inner.xml_callback_addr
    }

    /// Local callback endpoint for the binary dialect.
    pub fn bin_callback_addr(&self) -> SocketAddr {
        self.inner.bin_callback_addr
    }

    // ── Shutdown ──

    /// De-register from every interface, close the callback server and
    /// persist state. Every step is bounded; close always completes.
    pub async fn close(&self) {
        let inner = &self.inner;
        debug!("closing session");
        inner.cancel.cancel();

        for runtime in inner.wire.ifaces.values() {
            if !runtime.config.init {
                continue;
            }
            let iface = runtime.config.name.as_str();
            // An empty registration id tells the interface process to
            // stop calling back.
            let params =
                [Value::from(runtime.callback_url.as_str()), Value::from("")];
            match tokio::time::timeout(
                CLOSE_STEP_TIMEOUT,
                inner.wire.call(iface, "init", &params),
            )
            .await
            {
                Ok(Ok(_)) => info!(iface, "de-init done"),
                Ok(Err(e)) => error!(iface, error = %e, "de-init failed"),
                Err(_) => error!(iface, "de-init timed out"),
            }
        }

        let server = inner.server.lock().ok().and_then(|mut slot| slot.take());
        if let Some(server) = server {
            server.shutdown().await;
        }

        inner.values.abort_debounces();
        self.persist_registry();
        self.persist_rega();
        self.persist_values();
        self.persist_paramsets();
        info!("session closed");
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn session_id_round_trips_through_parse() {
        let url = "http://192.168.1.2:2015";
        let id = session_id(url, "BidCos-RF");
        assert!(id.starts_with("ck_"));
        assert!(id.ends_with("_BidCos-RF"));
        assert_eq!(id.len(), "ck_".len() + 6 + "_BidCos-RF".len());
        assert_eq!(iface_from_session_id(&id), Some("BidCos-RF"));

        // Stable per URL, distinct across URLs.
        assert_eq!(session_id(url, "BidCos-RF"), id);
        assert_ne!(session_id("http://192.168.1.3:2015", "BidCos-RF"), id);
    }

    #[test]
    fn cuxd_uses_the_bare_interface_name() {
        assert_eq!(session_id("xmlrpc_bin://10.0.0.1:2016", "CUxD"), "CUxD");
        assert_eq!(iface_from_session_id("CUxD"), Some("CUxD"));
        assert_eq!(iface_from_session_id(""), None);
    }

    #[test]
    fn callback_methods_parse_exhaustively() {
        for method in SUPPORTED_METHODS {
            assert!(CallbackMethod::parse(method).is_some(), "{method}");
        }
        assert_eq!(CallbackMethod::parse("system.methodHelp"), None);
        assert_eq!(
            CallbackMethod::parse("system.multicall"),
            Some(CallbackMethod::Multicall)
        );
    }

    #[test]
    fn links_filter_by_direction() {
        let link = |sender: &str, receiver: &str| {
            Value::Struct(
                [
                    ("SENDER".to_owned(), Value::from(sender)),
                    ("RECEIVER".to_owned(), Value::from(receiver)),
                ]
                .into_iter()
                .collect(),
            )
        };
        let links = vec![link("NEQ1:1", "NEQ2:1"), link("NEQ3:2", "NEQ1:1"), link("NEQ4:1", "NEQ5:1")];

        assert_eq!(filter_links(&links, "NEQ1:1", false), vec!["NEQ2:1"]);
        assert_eq!(filter_links(&links, "NEQ1:1", true), vec!["NEQ3:2"]);
        assert!(filter_links(&links, "NEQ9:1", true).is_empty());
    }
}
