//! Session layer for Homematic CCU controllers.
//!
//! This crate owns the domain model and the connection lifecycle on top
//! of the [`ccukit_rpc`] wire layer:
//!
//! - **[`CcuSession`]** — Central facade managing the full lifecycle:
//!   [`connect()`](CcuSession::connect) binds the shared callback server,
//!   registers with every configured interface process, then runs the
//!   keepalive watchdogs, the paramset fetcher and the logic-layer poll
//!   loop until [`close()`](CcuSession::close).
//!
//! - **Stores** ([`store`]) — `DashMap`-backed device registry, paramset
//!   schema cache, last-value store and ReGa metadata index, all
//!   persisted as flat JSON snapshots across restarts.
//!
//! - **[`Normalizer`]** — Turns raw interface events into enriched
//!   [`ValueRecord`]s: names, rooms, functions, change detection and the
//!   settle window for actuators that report transient busy states.
//!
//! - **[`SubscriptionEngine`]** — Filtered fan-out to datapoint, system
//!   variable and program subscribers, with per-datapoint memoization of
//!   structural filter decisions.
//!
//! - **Write paths** ([`write`]) — A serialized queue with per-datapoint
//!   coalescing and a throttled direct path for interactive controls.

pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod script;
pub mod session;
pub mod store;
pub mod subscribe;
pub mod write;

// ── Primary re-exports ──────────────────────────────────────────────
pub use ccukit_rpc::Value;
pub use config::{CcuConfig, Dialect, InterfaceConfig};
pub use error::CcuError;
pub use events::{EventContext, Normalizer};
pub use model::{
    DeviceDescription, ParameterDescription, ParameterType, ParamsetDescription, Program, SysVar,
    ValueRecord,
};
pub use script::{
    CachedValue, ChannelInfo, ExecResult, GroupingInfo, ProgramInfo, RegaRuntime, ScriptClient,
    VariableInfo,
};
pub use session::{CcuSession, iface_from_session_id, session_id};
pub use store::{DeviceRegistry, ParamsetCache, Persistence, RegaIndex, ValueStore};
pub use subscribe::{Filter, MatchExpr, ProgramFilter, SubscriptionEngine, SysvarFilter};
pub use write::{WriteRequest, param_cast};
