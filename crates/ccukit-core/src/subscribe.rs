// ── Subscription and filter engine ──
//
// Three independent namespaces: datapoint events, system variables,
// programs. Datapoint filters are a conjunction of typed clauses over an
// allow-listed attribute set; a structural clause's outcome for a given
// datapoint cannot change between deliveries (the denormalized metadata
// is fixed), so the engine memoizes it in per-datapoint white/blacklists
// and re-evaluates only the per-delivery cache/change/stable flags.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ccukit_rpc::Value;
use dashmap::DashMap;
use regex::Regex;
use tracing::debug;

use crate::error::CcuError;
use crate::model::{Program, SysVar, ValueRecord};

// ── Filters ──

/// Record attributes a filter clause may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAttr {
    Iface,
    Device,
    DeviceType,
    DeviceName,
    Channel,
    ChannelType,
    ChannelName,
    ChannelIndex,
    Datapoint,
    DatapointName,
    Room,
    Function,
    Rooms,
    Functions,
}

impl FromStr for FilterAttr {
    type Err = CcuError;

    fn from_str(s: &str) -> Result<Self, CcuError> {
        // Unknown attribute names are a hard error: a typo here would
        // otherwise silently match everything.
        Ok(match s {
            "iface" | "interface" => FilterAttr::Iface,
            "device" => FilterAttr::Device,
            "deviceType" => FilterAttr::DeviceType,
            "deviceName" => FilterAttr::DeviceName,
            "channel" => FilterAttr::Channel,
            "channelType" => FilterAttr::ChannelType,
            "channelName" => FilterAttr::ChannelName,
            "channelIndex" => FilterAttr::ChannelIndex,
            "datapoint" => FilterAttr::Datapoint,
            "datapointName" => FilterAttr::DatapointName,
            "room" => FilterAttr::Room,
            "function" => FilterAttr::Function,
            "rooms" => FilterAttr::Rooms,
            "functions" => FilterAttr::Functions,
            other => return Err(CcuError::InvalidFilter(format!("unknown attribute {other}"))),
        })
    }
}

/// How one clause matches its attribute.
#[derive(Debug, Clone)]
pub enum MatchExpr {
    Exact(Value),
    Regex(Regex),
}

impl MatchExpr {
    /// Compile `pattern` into a regex clause.
    pub fn regex(pattern: &str) -> Result<Self, CcuError> {
        Regex::new(pattern)
            .map(MatchExpr::Regex)
            .map_err(|e| CcuError::InvalidFilter(format!("bad regex {pattern}: {e}")))
    }

    fn matches_str(&self, s: &str) -> bool {
        match self {
            MatchExpr::Exact(v) => match v {
                Value::String(expected) => expected == s,
                other => other.to_string() == s,
            },
            MatchExpr::Regex(re) => re.is_match(s),
        }
    }

    fn matches_int(&self, i: i64) -> bool {
        match self {
            MatchExpr::Exact(v) => v.as_i64() == Some(i),
            MatchExpr::Regex(re) => re.is_match(&i.to_string()),
        }
    }

    fn matches_list(&self, list: &[String]) -> bool {
        list.iter().any(|item| self.matches_str(item))
    }
}

#[derive(Debug, Clone)]
pub struct FilterClause {
    pub attr: FilterAttr,
    pub expr: MatchExpr,
}

/// A datapoint subscription filter.
///
/// Structural clauses are conjunctive; the three flags below are
/// evaluated on every delivery:
/// - `cache`: also deliver cache-origin records (and replay the current
///   store at subscribe time),
/// - `change`: only deliver actual changes (cache-origin records are
///   exempt when `cache` lets them through),
/// - `stable`: suppress records still mid-transition.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub cache: bool,
    pub change: bool,
    pub stable: bool,
    clauses: Vec<FilterClause>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    pub fn change(mut self, change: bool) -> Self {
        self.change = change;
        self
    }

    pub fn stable(mut self, stable: bool) -> Self {
        self.stable = stable;
        self
    }

    /// Add a clause; the attribute name is validated against the
    /// allow-list.
    pub fn clause(mut self, attr: &str, expr: MatchExpr) -> Result<Self, CcuError> {
        let attr = attr.parse()?;
        self.clauses.push(FilterClause { attr, expr });
        Ok(self)
    }

    /// Evaluate the structural clauses (everything but the flags).
    /// Short-circuits on the first failing clause.
    pub fn matches_structural(&self, record: &ValueRecord) -> bool {
        self.clauses.iter().all(|clause| {
            let expr = &clause.expr;
            match clause.attr {
                FilterAttr::Iface => expr.matches_str(&record.iface),
                FilterAttr::Device => opt_str(expr, record.device.as_deref()),
                FilterAttr::DeviceType => opt_str(expr, record.device_type.as_deref()),
                FilterAttr::DeviceName => opt_str(expr, record.device_name.as_deref()),
                FilterAttr::Channel => expr.matches_str(&record.channel),
                FilterAttr::ChannelType => opt_str(expr, record.channel_type.as_deref()),
                FilterAttr::ChannelName => opt_str(expr, record.channel_name.as_deref()),
                FilterAttr::ChannelIndex => {
                    record.channel_index.is_some_and(|i| expr.matches_int(i))
                }
                FilterAttr::Datapoint => expr.matches_str(&record.datapoint),
                FilterAttr::DatapointName => expr.matches_str(&record.datapoint_name),
                FilterAttr::Room => opt_str(expr, record.room.as_deref()),
                FilterAttr::Function => opt_str(expr, record.function.as_deref()),
                FilterAttr::Rooms => expr.matches_list(&record.rooms),
                FilterAttr::Functions => expr.matches_list(&record.functions),
            }
        })
    }

    /// Evaluate the per-delivery flags.
    pub fn passes_flags(&self, record: &ValueRecord) -> bool {
        if record.cache && !self.cache {
            return false;
        }
        if self.change && !record.change && !record.cache {
            return false;
        }
        if self.stable && !record.stable {
            return false;
        }
        true
    }

    /// Full evaluation (used for cache replay, which bypasses the
    /// memoized lists).
    pub fn matches(&self, record: &ValueRecord) -> bool {
        self.matches_structural(record) && self.passes_flags(record)
    }
}

fn opt_str(expr: &MatchExpr, value: Option<&str>) -> bool {
    value.is_some_and(|s| expr.matches_str(s))
}

/// Filter for system-variable subscriptions.
#[derive(Debug, Clone, Default)]
pub struct SysvarFilter {
    pub name: Option<String>,
    pub cache: bool,
    pub change: bool,
}

impl SysvarFilter {
    fn matches(&self, sysvar: &SysVar) -> bool {
        if let Some(name) = &self.name {
            if name != &sysvar.name {
                return false;
            }
        }
        if sysvar.cache && !self.cache {
            return false;
        }
        if self.change && !sysvar.change && !sysvar.cache {
            return false;
        }
        true
    }
}

/// Filter for program-state subscriptions.
#[derive(Debug, Clone, Default)]
pub struct ProgramFilter {
    pub name: Option<String>,
}

// ── Engine ──

pub type DatapointCallback = Arc<dyn Fn(ValueRecord) + Send + Sync>;
pub type SysvarCallback = Arc<dyn Fn(SysVar) + Send + Sync>;
pub type ProgramCallback = Arc<dyn Fn(Program) + Send + Sync>;

struct DatapointSubscription {
    filter: Filter,
    callback: DatapointCallback,
}

#[derive(Default)]
pub struct SubscriptionEngine {
    next_id: AtomicU64,
    datapoints: DashMap<u64, DatapointSubscription>,
    sysvars: DashMap<u64, (SysvarFilter, SysvarCallback)>,
    programs: DashMap<u64, (ProgramFilter, ProgramCallback)>,
    /// datapoint_name -> subscription ids with a memoized structural match
    whitelist: DashMap<String, HashSet<u64>>,
    /// datapoint_name -> subscription ids with a memoized structural miss
    blacklist: DashMap<String, HashSet<u64>>,
}

impl SubscriptionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn subscribe(&self, filter: Filter, callback: DatapointCallback) -> u64 {
        let id = self.next_id();
        self.datapoints.insert(id, DatapointSubscription { filter, callback });
        debug!(id, "datapoint subscription added");
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let removed = self.datapoints.remove(&id).is_some();
        if removed {
            for mut entry in self.whitelist.iter_mut() {
                entry.remove(&id);
            }
            for mut entry in self.blacklist.iter_mut() {
                entry.remove(&id);
            }
        }
        removed
    }

    pub fn subscribe_sysvar(&self, filter: SysvarFilter, callback: SysvarCallback) -> u64 {
        let id = self.next_id();
        self.sysvars.insert(id, (filter, callback));
        id
    }

    pub fn unsubscribe_sysvar(&self, id: u64) -> bool {
        self.sysvars.remove(&id).is_some()
    }

    pub fn subscribe_program(&self, filter: ProgramFilter, callback: ProgramCallback) -> u64 {
        let id = self.next_id();
        self.programs.insert(id, (filter, callback));
        id
    }

    pub fn unsubscribe_program(&self, id: u64) -> bool {
        self.programs.remove(&id).is_some()
    }

    /// Fan a normalized record out to matching subscribers. Callbacks
    /// receive their own clone, so they cannot mutate shared state.
    pub fn publish(&self, record: &ValueRecord) {
        let key = &record.datapoint_name;
        for entry in self.datapoints.iter() {
            let id = *entry.key();
            if self.blacklist.get(key).is_some_and(|b| b.contains(&id)) {
                continue;
            }
            let memoized = self.whitelist.get(key).is_some_and(|w| w.contains(&id));
            if !memoized {
                if entry.filter.matches_structural(record) {
                    self.whitelist.entry(key.clone()).or_default().insert(id);
                } else {
                    self.blacklist.entry(key.clone()).or_default().insert(id);
                    continue;
                }
            }
            if entry.filter.passes_flags(record) {
                (entry.callback)(record.clone());
            }
        }
    }

    /// Replay one record through one subscription's full filter
    /// (subscribe-time cache replay).
    pub fn replay_to(&self, id: u64, record: &ValueRecord) -> bool {
        let Some(sub) = self.datapoints.get(&id) else {
            return false;
        };
        if sub.filter.matches(record) {
            (sub.callback)(record.clone());
            return true;
        }
        false
    }

    /// Whether a subscription asked for cache-origin delivery.
    pub fn wants_cache(&self, id: u64) -> bool {
        self.datapoints.get(&id).is_some_and(|s| s.filter.cache)
    }

    pub fn publish_sysvar(&self, sysvar: &SysVar) {
        for entry in self.sysvars.iter() {
            let (filter, callback) = entry.value();
            if filter.matches(sysvar) {
                callback(sysvar.clone());
            }
        }
    }

    pub fn publish_program(&self, program: &Program) {
        for entry in self.programs.iter() {
            let (filter, callback) = entry.value();
            if filter.name.as_deref().is_none_or(|n| n == program.name) {
                callback(program.clone());
            }
        }
    }
}
