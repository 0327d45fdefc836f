use serde_json::{Map, Value};

use crate::error::CommandParamError;
use crate::model::{Property, WorkflowDefinition};

pub const CMD_PARAM_START_NODES: &str = "StartNodeList";
pub const CMD_PARAM_RECOVERY_START_NODE_ID_LIST: &str = "RecoveryStartNodeIdList";
pub const CMD_PARAM_START_PARAMS: &str = "StartParams";

/// Parsed view of a command's JSON `cmdParam` object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandParam {
    map: Map<String, Value>,
}

impl CommandParam {
    /// A missing or blank param parses as an empty object.
    pub fn parse(raw: Option<&str>) -> Result<Self, CommandParamError> {
        let raw = raw.map(str::trim).unwrap_or("");
        if raw.is_empty() {
            return Ok(Self::default());
        }
        let map: Map<String, Value> = serde_json::from_str(raw)?;
        Ok(Self { map })
    }

    /// Raw entries of a comma separated list. Also accepts a JSON array.
    pub fn list_entries(&self, key: &str) -> Vec<String> {
        match self.map.get(key) {
            Some(Value::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_string)
                .collect(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.trim().to_string(),
                    other => other.to_string(),
                })
                .filter(|e| !e.is_empty())
                .collect(),
            Some(Value::Number(n)) => vec![n.to_string()],
            _ => Vec::new(),
        }
    }

    pub fn id_list(&self, key: &'static str) -> Result<Vec<i64>, CommandParamError> {
        self.list_entries(key)
            .into_iter()
            .map(|entry| {
                entry
                    .parse::<i64>()
                    .map_err(|_| CommandParamError::InvalidList { key, value: entry })
            })
            .collect()
    }

    /// `StartParams` as IN properties: `{"name": "value"}`.
    pub fn start_params(&self) -> Vec<Property> {
        match self.map.get(CMD_PARAM_START_PARAMS) {
            Some(Value::Object(params)) => params
                .iter()
                .map(|(name, value)| {
                    let value = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    Property::input(name, value)
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }
}

/// Task instance ids to resume from.
pub fn parse_recovery_node_id_list(raw: Option<&str>) -> Result<Vec<i64>, CommandParamError> {
    CommandParam::parse(raw)?.id_list(CMD_PARAM_RECOVERY_START_NODE_ID_LIST)
}

/// Start nodes named in `StartNodeList`, given as task codes or task names.
pub fn parse_start_node_list(
    raw: Option<&str>,
    definition: &WorkflowDefinition,
) -> Result<Vec<i64>, CommandParamError> {
    let param = CommandParam::parse(raw)?;
    let mut codes = Vec::new();
    for entry in param.list_entries(CMD_PARAM_START_NODES) {
        let code = match entry.parse::<i64>() {
            Ok(code) => code,
            Err(_) => definition
                .tasks
                .iter()
                .find(|t| t.name == entry)
                .map(|t| t.code)
                .ok_or(CommandParamError::InvalidList {
                    key: CMD_PARAM_START_NODES,
                    value: entry.clone(),
                })?,
        };
        if !codes.contains(&code) {
            codes.push(code);
        }
    }
    Ok(codes)
}
