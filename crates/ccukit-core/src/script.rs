// ── Logic-layer scripting ──
//
// System variables, programs, channel metadata and the initial value
// dump all come from the controller's scripting engine, reached over
// HTTP rather than the device buses. The transport hides behind
// [`ScriptClient`] so the runtime can be driven by a mock in tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ccukit_rpc::Value;
use chrono::NaiveDateTime;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::CcuError;
use crate::events::Normalizer;
use crate::model::{Program, SysVar, now_ms};
use crate::store::RegaIndex;
use crate::subscribe::SubscriptionEngine;

/// How long a write to a not-yet-known variable is held back before
/// giving up.
const DEFER_DEADLINE: Duration = Duration::from_secs(30);

// ── Wire shapes ──

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChannelInfo {
    pub id: i64,
    pub address: String,
    pub name: String,
}

/// A room or function: a named set of channel ids.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GroupingInfo {
    pub name: String,
    pub channels: Vec<i64>,
}

/// One entry of the initial value dump. `name` is the dotted
/// `iface.channel.datapoint` path; `ts` is epoch millis, absent or
/// non-positive when the controller never saw a live value.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub name: String,
    pub value: Value,
    pub ts: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableInfo {
    pub id: i64,
    pub name: String,
    pub value: Value,
    pub ts: Option<i64>,
    pub value_type: i64,
    pub sub_type: i64,
    pub enum_list: Vec<String>,
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgramInfo {
    pub id: i64,
    pub name: String,
    pub active: bool,
    pub ts: i64,
}

/// Result of a script execution: the printed output plus the final
/// values of the script's variables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecResult {
    pub output: String,
    pub objects: BTreeMap<String, String>,
}

/// Access to the controller's scripting engine.
#[async_trait]
pub trait ScriptClient: Send + Sync {
    async fn get_values(&self) -> Result<Vec<CachedValue>, CcuError>;
    async fn get_channels(&self) -> Result<Vec<ChannelInfo>, CcuError>;
    async fn get_rooms(&self) -> Result<Vec<GroupingInfo>, CcuError>;
    async fn get_functions(&self) -> Result<Vec<GroupingInfo>, CcuError>;
    async fn get_variables(&self) -> Result<Vec<VariableInfo>, CcuError>;
    async fn get_programs(&self) -> Result<Vec<ProgramInfo>, CcuError>;
    async fn exec(&self, script: &str) -> Result<ExecResult, CcuError>;
}

// Group membership lives in a config file on the controller, not in any
// queryable object tree.
const GROUPS_SCRIPT: &str = r#"var stdoutGroups;
var stderrGroups;
system.Exec("cat /etc/config/groups.gson", &stdoutGroups, &stderrGroups);"#;

#[derive(Debug, Deserialize)]
struct GroupsFile {
    #[serde(default)]
    groups: Vec<GroupEntry>,
}

#[derive(Debug, Deserialize)]
struct GroupEntry {
    id: String,
    #[serde(default)]
    members: Vec<String>,
}

// ── Runtime ──

struct DeferredSet {
    value: Value,
    expiry: JoinHandle<()>,
}

/// Drives the logic layer: the metadata bootstrap, the variable/program
/// poll loop, and script-backed writes.
#[derive(Clone)]
pub struct RegaRuntime {
    inner: Arc<RegaInner>,
}

struct RegaInner {
    client: Arc<dyn ScriptClient>,
    index: Arc<RegaIndex>,
    normalizer: Normalizer,
    subscriptions: Arc<SubscriptionEngine>,
    enabled_ifaces: Vec<String>,
    channel_by_id: DashMap<i64, String>,
    sysvars: DashMap<String, SysVar>,
    programs: DashMap<String, Program>,
    vars_known: watch::Sender<bool>,
    deferred: Mutex<HashMap<String, DeferredSet>>,
    poll_pending: AtomicBool,
    poll_now: Notify,
    first_poll: watch::Sender<bool>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl RegaRuntime {
    pub fn new(
        client: Arc<dyn ScriptClient>,
        index: Arc<RegaIndex>,
        normalizer: Normalizer,
        subscriptions: Arc<SubscriptionEngine>,
        enabled_ifaces: Vec<String>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        RegaRuntime {
            inner: Arc::new(RegaInner {
                client,
                index,
                normalizer,
                subscriptions,
                enabled_ifaces,
                channel_by_id: DashMap::new(),
                sysvars: DashMap::new(),
                programs: DashMap::new(),
                vars_known: watch::Sender::new(false),
                deferred: Mutex::new(HashMap::new()),
                poll_pending: AtomicBool::new(false),
                poll_now: Notify::new(),
                first_poll: watch::Sender::new(false),
                poll_interval,
                cancel,
            }),
        }
    }

    // ── Bootstrap ──

    /// Fetch the logic-layer metadata in order: channels, rooms,
    /// functions, the initial value dump, group membership. The channel
    /// list is the spine everything else resolves against, so its
    /// failure aborts; the later steps degrade to warnings.
    pub async fn bootstrap(&self) -> Result<(), CcuError> {
        let inner = &self.inner;

        debug!("rega getChannels");
        let channels = inner.client.get_channels().await?;
        for channel in &channels {
            inner.index.set_channel(&channel.address, channel.id, &channel.name);
            inner.channel_by_id.insert(channel.id, channel.address.clone());
        }
        debug!(count = channels.len(), "channel names loaded");

        debug!("rega getRooms");
        match inner.client.get_rooms().await {
            Ok(rooms) => inner.index.set_rooms(self.resolve_grouping(rooms)),
            Err(e) => warn!(error = %e, "rega getRooms failed"),
        }

        debug!("rega getFunctions");
        match inner.client.get_functions().await {
            Ok(functions) => inner.index.set_functions(self.resolve_grouping(functions)),
            Err(e) => warn!(error = %e, "rega getFunctions failed"),
        }

        info!("rega getValues");
        match inner.client.get_values().await {
            Ok(values) => self.load_values(values),
            Err(e) => warn!(error = %e, "rega getValues failed"),
        }

        debug!("get groups");
        match inner.client.exec(GROUPS_SCRIPT).await {
            Ok(result) => self.load_groups(&result),
            Err(e) => debug!(error = %e, "group config not readable"),
        }

        Ok(())
    }

    fn resolve_grouping(&self, groupings: Vec<GroupingInfo>) -> Vec<(String, Vec<String>)> {
        groupings
            .into_iter()
            .map(|g| {
                let addresses = g
                    .channels
                    .iter()
                    .filter_map(|id| self.inner.channel_by_id.get(id).map(|a| a.clone()))
                    .collect();
                (g.name, addresses)
            })
            .collect()
    }

    fn load_values(&self, values: Vec<CachedValue>) {
        let inner = &self.inner;
        let mut loaded = 0_usize;
        for entry in values {
            let mut parts = entry.name.splitn(3, '.');
            let (Some(iface), Some(channel), Some(datapoint)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            if datapoint.is_empty() || !inner.enabled_ifaces.iter().any(|i| i == iface) {
                continue;
            }
            inner.normalizer.load_cached(iface, channel, datapoint, entry.value, entry.ts);
            loaded += 1;
        }
        info!(count = loaded, "cached values loaded");
    }

    fn load_groups(&self, result: &ExecResult) {
        if result.objects.get("stderrGroups").is_some_and(|s| s != "null") {
            return;
        }
        let Some(raw) = result.objects.get("stdoutGroups") else {
            return;
        };
        match serde_json::from_str::<GroupsFile>(raw) {
            Ok(file) => {
                let groups = file.groups.into_iter().map(|g| (g.id, g.members)).collect();
                self.inner.index.set_groups(groups);
            }
            Err(e) => debug!(error = %e, "unparsable group config"),
        }
    }

    // ── Poll loop ──

    /// Spawn the variable/program poll loop. Polls immediately, then
    /// reschedules the interval after each completed round so rounds
    /// never overlap; [`RegaRuntime::trigger_poll`] cuts the wait short.
    pub fn spawn_poller(&self) -> JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            loop {
                runtime.poll().await;
                tokio::select! {
                    () = runtime.inner.cancel.cancelled() => return,
                    () = tokio::time::sleep(runtime.inner.poll_interval) => {}
                    () = runtime.inner.poll_now.notified() => {}
                }
            }
        })
    }

    /// Request an immediate poll round.
    pub fn trigger_poll(&self) {
        if !self.inner.poll_pending.load(Ordering::SeqCst) {
            self.inner.poll_now.notify_one();
        }
    }

    pub async fn poll(&self) {
        let inner = &self.inner;
        if inner.poll_pending.swap(true, Ordering::SeqCst) {
            warn!("rega poll already pending");
            return;
        }
        if let Err(e) = self.update_variables().await {
            error!(error = %e, "getVariables failed");
        }
        if let Err(e) = self.update_programs().await {
            error!(error = %e, "getPrograms failed");
        }
        if !*inner.first_poll.borrow() {
            // send() would no-op while nobody subscribed yet.
            inner.first_poll.send_replace(true);
        }
        inner.poll_pending.store(false, Ordering::SeqCst);
    }

    /// Completes once the first full poll round has run; shutdown
    /// persistence hangs off this.
    pub fn subscribe_first_poll(&self) -> watch::Receiver<bool> {
        self.inner.first_poll.subscribe()
    }

    async fn update_variables(&self) -> Result<(), CcuError> {
        debug!("getRegaVariables");
        let infos = self.inner.client.get_variables().await?;
        for info in infos {
            self.apply_variable(info);
        }
        if !*self.inner.vars_known.borrow() {
            // The channel has no receivers; send() would drop the update.
            self.inner.vars_known.send_replace(true);
            self.flush_deferred().await;
        }
        Ok(())
    }

    fn apply_variable(&self, info: VariableInfo) {
        let inner = &self.inner;
        let ts = info.ts.unwrap_or_else(now_ms);
        let updated = match inner.sysvars.entry(info.name.clone()) {
            dashmap::Entry::Vacant(entry) => {
                // First observation is a cache record, change stays false.
                let sysvar = SysVar {
                    name: info.name,
                    id: info.id,
                    payload: info.value,
                    previous: None,
                    ts,
                    ts_previous: None,
                    lc: ts,
                    lc_previous: None,
                    change: false,
                    cache: true,
                    value_type: info.value_type,
                    sub_type: info.sub_type,
                    enum_list: info.enum_list,
                    min: info.min,
                    max: info.max,
                    unit: info.unit,
                };
                entry.insert(sysvar.clone());
                Some(sysvar)
            }
            dashmap::Entry::Occupied(mut entry) => {
                let current = entry.get_mut();
                if current.ts == ts {
                    None
                } else {
                    let changed = current.payload != info.value;
                    current.previous = Some(std::mem::replace(&mut current.payload, info.value));
                    current.ts_previous = Some(current.ts);
                    current.lc_previous = Some(current.lc);
                    if changed {
                        current.lc = ts;
                    }
                    current.ts = ts;
                    current.change = changed;
                    current.cache = false;
                    current.enum_list = info.enum_list;
                    current.min = info.min;
                    current.max = info.max;
                    current.unit = info.unit;
                    Some(current.clone())
                }
            }
        };
        if let Some(sysvar) = updated {
            inner.subscriptions.publish_sysvar(&sysvar);
        }
    }

    async fn update_programs(&self) -> Result<(), CcuError> {
        debug!("getRegaPrograms");
        let infos = self.inner.client.get_programs().await?;
        for info in infos {
            let updated = match self.inner.programs.entry(info.name.clone()) {
                dashmap::Entry::Vacant(entry) => {
                    let program = Program {
                        name: info.name,
                        id: info.id,
                        active: info.active,
                        ts: info.ts,
                        lc: info.ts,
                        change: false,
                    };
                    entry.insert(program.clone());
                    Some(program)
                }
                dashmap::Entry::Occupied(mut entry) => {
                    let current = entry.get_mut();
                    if current.active == info.active && current.ts == info.ts {
                        None
                    } else {
                        current.change = current.active != info.active;
                        if current.change {
                            current.lc = info.ts;
                        }
                        current.active = info.active;
                        current.ts = info.ts;
                        Some(current.clone())
                    }
                }
            };
            if let Some(program) = updated {
                self.inner.subscriptions.publish_program(&program);
            }
        }
        Ok(())
    }

    // ── Writes ──

    /// Write a system variable. Before the first successful variable
    /// poll the write is parked (latest value per name wins) and flushed
    /// once the variables are known, or dropped after 30 seconds.
    pub async fn set_variable(&self, name: &str, value: Value) -> Result<(), CcuError> {
        let inner = &self.inner;
        if !*inner.vars_known.borrow() {
            debug!(name, "variables not yet known, deferring write");
            self.defer_set(name, value);
            return Ok(());
        }

        let sysvar = inner
            .sysvars
            .get(name)
            .map(|s| s.clone())
            .ok_or_else(|| CcuError::UnknownVariable(name.to_owned()))?;
        let script = format!("dom.GetObject({}).State({});", sysvar.id, rega_literal(&sysvar, &value));
        debug!(name, %script, "setVariable");
        inner.client.exec(&script).await?;
        self.trigger_poll();
        Ok(())
    }

    fn defer_set(&self, name: &str, value: Value) {
        let inner = &self.inner;
        let Ok(mut deferred) = inner.deferred.lock() else {
            return;
        };
        if let Some(old) = deferred.remove(name) {
            old.expiry.abort();
        }
        let expiry_name = name.to_owned();
        let runtime = self.clone();
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(DEFER_DEADLINE).await;
            if let Ok(mut deferred) = runtime.inner.deferred.lock() {
                if deferred.remove(&expiry_name).is_some() {
                    error!(name = %expiry_name, "variable write dropped, variables still unknown");
                }
            }
        });
        deferred.insert(name.to_owned(), DeferredSet { value, expiry });
    }

    async fn flush_deferred(&self) {
        let parked: Vec<(String, Value)> = match self.inner.deferred.lock() {
            Ok(mut deferred) => deferred
                .drain()
                .map(|(name, set)| {
                    set.expiry.abort();
                    (name, set.value)
                })
                .collect(),
            Err(_) => return,
        };
        for (name, value) in parked {
            if let Err(e) = self.set_variable(&name, value).await {
                error!(name, error = %e, "deferred variable write failed");
            }
        }
    }

    /// Activate or deactivate a program.
    pub async fn program_active(&self, name: &str, active: bool) -> Result<Program, CcuError> {
        let inner = &self.inner;
        let program = inner
            .programs
            .get(name)
            .map(|p| p.clone())
            .ok_or_else(|| CcuError::UnknownProgram(name.to_owned()))?;
        let script = format!("dom.GetObject({}).Active({active});", program.id);
        debug!(name, %script, "programActive");
        inner.client.exec(&script).await?;
        let mut updated = program;
        updated.active = active;
        inner.programs.insert(name.to_owned(), updated.clone());
        Ok(updated)
    }

    /// Fire a program and record its new last-execution time.
    pub async fn program_execute(&self, name: &str) -> Result<Program, CcuError> {
        let inner = &self.inner;
        let program = inner
            .programs
            .get(name)
            .map(|p| p.clone())
            .ok_or_else(|| CcuError::UnknownProgram(name.to_owned()))?;
        let script = format!(
            "dom.GetObject({id}).ProgramExecute();\nvar lastExecTime = dom.GetObject({id}).ProgramLastExecuteTime();",
            id = program.id
        );
        debug!(name, "programExecute");
        let result = inner.client.exec(&script).await?;
        let ts = result
            .objects
            .get("lastExecTime")
            .and_then(|raw| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").ok())
            .map_or_else(now_ms, |dt| dt.and_utc().timestamp_millis());
        let mut updated = program;
        updated.ts = ts;
        inner.programs.insert(name.to_owned(), updated.clone());
        Ok(updated)
    }

    /// Run an arbitrary script.
    pub async fn exec(&self, script: &str) -> Result<ExecResult, CcuError> {
        self.inner.client.exec(script).await
    }

    // ── Snapshots ──

    pub fn sysvar(&self, name: &str) -> Option<SysVar> {
        self.inner.sysvars.get(name).map(|s| s.clone())
    }

    pub fn sysvars(&self) -> Vec<SysVar> {
        let mut all: Vec<SysVar> = self.inner.sysvars.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn program(&self, name: &str) -> Option<Program> {
        self.inner.programs.get(name).map(|p| p.clone())
    }

    pub fn programs(&self) -> Vec<Program> {
        let mut all: Vec<Program> = self.inner.programs.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn variables_known(&self) -> bool {
        *self.inner.vars_known.borrow()
    }
}

/// Render a value as a script literal matching the variable's type:
/// booleans bare, strings quoted, enum labels as their index, everything
/// else numeric.
fn rega_literal(sysvar: &SysVar, value: &Value) -> String {
    if sysvar.is_boolean() {
        let truthy = match value {
            Value::String(s) => match sysvar.enum_index(s) {
                Some(index) => index != 0,
                None => !(s.is_empty() || s == "false" || s == "0"),
            },
            other => other.is_truthy(),
        };
        return truthy.to_string();
    }
    if sysvar.is_string() {
        return format!("\"{}\"", value.to_string().replace('"', "\\\""));
    }
    if let Value::String(s) = value {
        if let Some(index) = sysvar.enum_index(s) {
            return index.to_string();
        }
        return s.trim().parse::<f64>().unwrap_or(0.0).to_string();
    }
    match value {
        Value::Bool(b) => i64::from(*b).to_string(),
        Value::Double(d) => d.to_string(),
        other => other.as_i64().unwrap_or(0).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model::value_type;
    use crate::store::{DeviceRegistry, ParamsetCache, ValueStore};
    use crate::subscribe::SysvarFilter;

    // ── mock client ──

    #[derive(Default)]
    struct MockScript {
        channels: Vec<ChannelInfo>,
        rooms: Vec<GroupingInfo>,
        functions: Vec<GroupingInfo>,
        values: Vec<CachedValue>,
        variables: StdMutex<Vec<VariableInfo>>,
        programs: Vec<ProgramInfo>,
        exec_results: StdMutex<Vec<ExecResult>>,
        executed: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl ScriptClient for MockScript {
        async fn get_values(&self) -> Result<Vec<CachedValue>, CcuError> {
            Ok(self.values.clone())
        }
        async fn get_channels(&self) -> Result<Vec<ChannelInfo>, CcuError> {
            Ok(self.channels.clone())
        }
        async fn get_rooms(&self) -> Result<Vec<GroupingInfo>, CcuError> {
            Ok(self.rooms.clone())
        }
        async fn get_functions(&self) -> Result<Vec<GroupingInfo>, CcuError> {
            Ok(self.functions.clone())
        }
        async fn get_variables(&self) -> Result<Vec<VariableInfo>, CcuError> {
            Ok(self.variables.lock().expect("lock").clone())
        }
        async fn get_programs(&self) -> Result<Vec<ProgramInfo>, CcuError> {
            Ok(self.programs.clone())
        }
        async fn exec(&self, script: &str) -> Result<ExecResult, CcuError> {
            self.executed.lock().expect("lock").push(script.to_owned());
            Ok(self.exec_results.lock().expect("lock").pop().unwrap_or_default())
        }
    }

    fn runtime_with(mock: MockScript) -> (RegaRuntime, Arc<MockScript>, Arc<RegaIndex>) {
        let client = Arc::new(mock);
        let index = Arc::new(RegaIndex::new());
        let subscriptions = Arc::new(SubscriptionEngine::new());
        let normalizer = Normalizer::new(
            Arc::new(DeviceRegistry::new()),
            Arc::new(ParamsetCache::new()),
            Arc::clone(&index),
            Arc::new(ValueStore::new()),
            Arc::clone(&subscriptions),
            Duration::from_millis(300),
        );
        let runtime = RegaRuntime::new(
            Arc::clone(&client) as Arc<dyn ScriptClient>,
            Arc::clone(&index),
            normalizer,
            subscriptions,
            vec!["BidCos-RF".to_owned()],
            Duration::from_secs(30),
            CancellationToken::new(),
        );
        (runtime, client, index)
    }

    fn variable(name: &str, value: Value, ts: i64) -> VariableInfo {
        VariableInfo {
            id: 950,
            name: name.to_owned(),
            value,
            ts: Some(ts),
            value_type: value_type::FLOAT,
            sub_type: 0,
            enum_list: Vec::new(),
            min: None,
            max: None,
            unit: None,
        }
    }

    #[tokio::test]
    async fn bootstrap_resolves_channel_ids_for_rooms() {
        let mock = MockScript {
            channels: vec![
                ChannelInfo { id: 1001, address: "NEQ1:1".into(), name: "Deckenlampe".into() },
                ChannelInfo { id: 1002, address: "NEQ2:1".into(), name: "Stehlampe".into() },
            ],
            rooms: vec![GroupingInfo { name: "Wohnzimmer".into(), channels: vec![1001, 1002] }],
            functions: vec![GroupingInfo { name: "Licht".into(), channels: vec![1001] }],
            ..MockScript::default()
        };
        let (runtime, _, index) = runtime_with(mock);
        runtime.bootstrap().await.expect("bootstrap");

        assert_eq!(index.name_of("NEQ1:1"), Some("Deckenlampe".to_owned()));
        assert_eq!(index.rooms_of("NEQ2:1"), vec!["Wohnzimmer"]);
        assert_eq!(index.functions_of("NEQ1:1"), vec!["Licht"]);
        assert!(index.functions_of("NEQ2:1").is_empty());
    }

    #[tokio::test]
    async fn bootstrap_skips_values_of_disabled_interfaces() {
        let mock = MockScript {
            values: vec![
                CachedValue {
                    name: "BidCos-RF.NEQ1:1.STATE".into(),
                    value: Value::Bool(true),
                    ts: Some(1_600_000_000_000),
                },
                CachedValue {
                    name: "HmIP-RF.ABC:1.STATE".into(),
                    value: Value::Bool(true),
                    ts: Some(1_600_000_000_000),
                },
            ],
            ..MockScript::default()
        };
        let (runtime, _, _) = runtime_with(mock);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        runtime.inner.subscriptions.subscribe(
            crate::subscribe::Filter::new().cache(true),
            Arc::new(move |record| sink.lock().expect("lock").push(record.datapoint_name)),
        );
        runtime.bootstrap().await.expect("bootstrap");

        let seen = seen.lock().expect("lock");
        assert_eq!(*seen, vec!["BidCos-RF.NEQ1:1.STATE".to_owned()]);
    }

    #[tokio::test]
    async fn first_poll_is_cache_second_sets_change() {
        let mock = MockScript::default();
        let (runtime, client, _) = runtime_with(mock);
        if let Ok(mut vars) = client.variables.lock() {
            *vars = vec![variable("Temperatur", Value::Double(19.5), 1000)];
        }

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        runtime.inner.subscriptions.subscribe_sysvar(
            SysvarFilter { name: None, cache: true, change: false },
            Arc::new(move |sysvar| sink.lock().expect("lock").push(sysvar)),
        );

        runtime.poll().await;
        if let Ok(mut vars) = client.variables.lock() {
            *vars = vec![variable("Temperatur", Value::Double(21.0), 2000)];
        }
        runtime.poll().await;

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 2);
        assert!(seen[0].cache && !seen[0].change);
        assert!(!seen[1].cache && seen[1].change);
        assert_eq!(seen[1].previous, Some(Value::Double(19.5)));
        assert_eq!(seen[1].lc, 2000);
    }

    #[tokio::test]
    async fn unchanged_timestamp_publishes_nothing() {
        let mock = MockScript::default();
        let (runtime, client, _) = runtime_with(mock);
        if let Ok(mut vars) = client.variables.lock() {
            *vars = vec![variable("Anwesenheit", Value::Bool(true), 1000)];
        }

        let count = Arc::new(StdMutex::new(0_usize));
        let sink = Arc::clone(&count);
        runtime.inner.subscriptions.subscribe_sysvar(
            SysvarFilter { name: None, cache: true, change: false },
            Arc::new(move |_| *sink.lock().expect("lock") += 1),
        );

        runtime.poll().await;
        runtime.poll().await;
        assert_eq!(*count.lock().expect("lock"), 1);
    }

    #[tokio::test]
    async fn variables_become_known_without_any_subscriber() {
        let mock = MockScript::default();
        let (runtime, client, _) = runtime_with(mock);
        if let Ok(mut vars) = client.variables.lock() {
            *vars = vec![variable("Temperatur", Value::Double(19.5), 1000)];
        }
        assert!(!runtime.variables_known());

        // Nothing holds a receiver on either watch channel here.
        runtime.poll().await;
        assert!(runtime.variables_known());

        // A receiver subscribed only after the round still sees it.
        assert!(*runtime.subscribe_first_poll().borrow());
    }

    #[tokio::test]
    async fn set_variable_coerces_by_type_and_polls() {
        let mock = MockScript::default();
        let (runtime, client, _) = runtime_with(mock);
        if let Ok(mut vars) = client.variables.lock() {
            *vars = vec![
                VariableInfo {
                    value_type: value_type::ALARM,
                    ..variable("Alarm", Value::Bool(false), 1000)
                },
                VariableInfo {
                    value_type: value_type::STRING,
                    ..variable("Nachricht", Value::from(""), 1000)
                },
                VariableInfo {
                    value_type: value_type::INTEGER,
                    enum_list: vec!["AUS".into(), "AN".into()],
                    ..variable("Modus", Value::Int(0), 1000)
                },
            ];
        }
        runtime.poll().await;

        runtime.set_variable("Alarm", Value::Int(1)).await.expect("set");
        runtime.set_variable("Nachricht", Value::from("hallo")).await.expect("set");
        runtime.set_variable("Modus", Value::from("AN")).await.expect("set");

        let executed = client.executed.lock().expect("lock").clone();
        assert_eq!(executed[0], "dom.GetObject(950).State(true);");
        assert_eq!(executed[1], "dom.GetObject(950).State(\"hallo\");");
        assert_eq!(executed[2], "dom.GetObject(950).State(1);");

        let unknown = runtime.set_variable("Gibtsnicht", Value::Bool(true)).await;
        assert!(matches!(unknown, Err(CcuError::UnknownVariable(_))));
    }

    #[tokio::test]
    async fn early_variable_write_is_deferred_until_first_poll() {
        let mock = MockScript::default();
        let (runtime, client, _) = runtime_with(mock);
        if let Ok(mut vars) = client.variables.lock() {
            *vars = vec![variable("Sollwert", Value::Double(20.0), 1000)];
        }

        runtime.set_variable("Sollwert", Value::Double(22.5)).await.expect("defer");
        assert!(client.executed.lock().expect("lock").is_empty());

        runtime.poll().await;
        let executed = client.executed.lock().expect("lock").clone();
        assert_eq!(executed, vec!["dom.GetObject(950).State(22.5);".to_owned()]);
    }

    #[tokio::test]
    async fn program_execute_updates_last_run_timestamp() {
        let mock = MockScript {
            programs: vec![ProgramInfo { id: 4711, name: "Morgens".into(), active: true, ts: 0 }],
            ..MockScript::default()
        };
        let (runtime, client, _) = runtime_with(mock);
        runtime.poll().await;
        if let Ok(mut results) = client.exec_results.lock() {
            results.push(ExecResult {
                output: String::new(),
                objects: BTreeMap::from([(
                    "lastExecTime".to_owned(),
                    "2026-08-23 07:30:00".to_owned(),
                )]),
            });
        }

        let program = runtime.program_execute("Morgens").await.expect("execute");
        assert!(program.ts > 0);
        assert_eq!(runtime.program("Morgens").map(|p| p.ts), Some(program.ts));

        let missing = runtime.program_execute("Abends").await;
        assert!(matches!(missing, Err(CcuError::UnknownProgram(_))));
    }

    #[tokio::test]
    async fn program_active_toggles_local_state() {
        let mock = MockScript {
            programs: vec![ProgramInfo { id: 4711, name: "Nachts".into(), active: true, ts: 10 }],
            ..MockScript::default()
        };
        let (runtime, client, _) = runtime_with(mock);
        runtime.poll().await;

        let program = runtime.program_active("Nachts", false).await.expect("toggle");
        assert!(!program.active);
        assert_eq!(
            client.executed.lock().expect("lock").last().map(String::as_str),
            Some("dom.GetObject(4711).Active(false);")
        );
    }
}
