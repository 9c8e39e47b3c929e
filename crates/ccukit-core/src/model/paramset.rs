// ── Parameter schemas ──

use std::collections::BTreeMap;

use ccukit_rpc::Value;
use serde::{Deserialize, Serialize};

/// A fetched paramset description: parameter name -> schema.
pub type ParamsetDescription = BTreeMap<String, ParameterDescription>;

/// Wire data type of a single parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParameterType {
    #[serde(rename = "BOOL")]
    Bool,
    #[serde(rename = "FLOAT")]
    Float,
    #[serde(rename = "INTEGER")]
    Integer,
    #[serde(rename = "ENUM")]
    Enum,
    #[serde(rename = "STRING")]
    String,
    /// Write-only, stateless trigger (key presses and the like). Every
    /// observation counts as a change.
    #[serde(rename = "ACTION")]
    Action,
    #[serde(other)]
    #[default]
    Unknown,
}

/// Schema of one parameter within a paramset.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParameterDescription {
    #[serde(rename = "TYPE", default)]
    pub param_type: ParameterType,

    #[serde(rename = "MIN", default, skip_serializing_if = "Option::is_none")]
    pub min: Option<Value>,

    #[serde(rename = "MAX", default, skip_serializing_if = "Option::is_none")]
    pub max: Option<Value>,

    #[serde(rename = "DEFAULT", default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(rename = "UNIT", default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    /// Labels for ENUM parameters, index-ordered.
    #[serde(rename = "VALUE_LIST", default, skip_serializing_if = "Vec::is_empty")]
    pub value_list: Vec<String>,

    /// Bitmask: 1 read, 2 write, 4 event.
    #[serde(rename = "OPERATIONS", default)]
    pub operations: i64,

    #[serde(rename = "FLAGS", default)]
    pub flags: i64,
}

impl ParameterDescription {
    pub fn is_action(&self) -> bool {
        self.param_type == ParameterType::Action
    }

    pub fn readable(&self) -> bool {
        self.operations & 1 != 0
    }

    pub fn writable(&self) -> bool {
        self.operations & 2 != 0
    }

    /// Index of an ENUM label, if this parameter has one.
    pub fn enum_index(&self, label: &str) -> Option<i64> {
        self.value_list.iter().position(|l| l == label).map(|i| i as i64)
    }
}

/// Parse a getParamsetDescription answer.
pub fn paramset_from_wire(value: &Value) -> Option<ParamsetDescription> {
    let json = serde_json::to_value(value).ok()?;
    serde_json::from_value(json).ok()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap as Map;

    use super::*;

    #[test]
    fn wire_paramset_parses() {
        let wire = Value::Struct(Map::from([(
            "LEVEL".to_owned(),
            Value::Struct(Map::from([
                ("TYPE".to_owned(), Value::String("FLOAT".into())),
                ("MIN".to_owned(), Value::Double(0.0)),
                ("MAX".to_owned(), Value::Double(1.0)),
                ("OPERATIONS".to_owned(), Value::Int(7)),
                ("UNIT".to_owned(), Value::String("100%".into())),
            ])),
        )]));
        let set = paramset_from_wire(&wire).expect("parse");
        let level = set.get("LEVEL").expect("LEVEL");
        assert_eq!(level.param_type, ParameterType::Float);
        assert!(level.readable() && level.writable());
        assert_eq!(level.max, Some(Value::Double(1.0)));
    }

    #[test]
    fn unknown_type_degrades() {
        let wire = Value::Struct(Map::from([(
            "X".to_owned(),
            Value::Struct(Map::from([(
                "TYPE".to_owned(),
                Value::String("SOMETHING_NEW".into()),
            )])),
        )]));
        let set = paramset_from_wire(&wire).expect("parse");
        assert_eq!(set.get("X").map(|p| p.param_type), Some(ParameterType::Unknown));
    }

    #[test]
    fn enum_labels_resolve_to_indices() {
        let desc = ParameterDescription {
            param_type: ParameterType::Enum,
            value_list: vec!["CLOSED".into(), "TILTED".into(), "OPEN".into()],
            ..ParameterDescription::default()
        };
        assert_eq!(desc.enum_index("TILTED"), Some(1));
        assert_eq!(desc.enum_index("AJAR"), None);
    }
}
