// ── ReGa-sourced records ──
//
// System variables and programs live on the controller's logic layer and
// are polled rather than pushed.

use ccukit_rpc::Value;
use serde::{Deserialize, Serialize};

/// ReGa value-type codes, as the logic layer reports them.
pub mod value_type {
    pub const ALARM: i64 = 2;
    pub const FLOAT: i64 = 4;
    pub const INTEGER: i64 = 16;
    pub const STRING: i64 = 20;
}

/// One system variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SysVar {
    pub name: String,
    pub id: i64,
    pub payload: Value,
    pub previous: Option<Value>,
    pub ts: i64,
    pub ts_previous: Option<i64>,
    pub lc: i64,
    pub lc_previous: Option<i64>,
    pub change: bool,
    /// Cold-start value; replaced silently by the first live poll.
    pub cache: bool,
    /// ReGa value-type code (see [`value_type`]).
    pub value_type: i64,
    /// Value subtype code; distinguishes booleans from alarms and
    /// integers from enums.
    pub sub_type: i64,
    /// Labels for enum-typed variables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_list: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl SysVar {
    pub fn is_boolean(&self) -> bool {
        self.value_type == value_type::ALARM
    }

    pub fn is_string(&self) -> bool {
        self.value_type == value_type::STRING
    }

    pub fn is_enum(&self) -> bool {
        self.value_type == value_type::INTEGER && !self.enum_list.is_empty()
    }

    /// Index of an enum label, if this variable has one.
    pub fn enum_index(&self, label: &str) -> Option<i64> {
        self.enum_list.iter().position(|l| l == label).map(|i| i as i64)
    }
}

/// One automation program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    pub id: i64,
    pub active: bool,
    pub ts: i64,
    pub lc: i64,
    pub change: bool,
}
