use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    #[default]
    Varchar,
    Integer,
    Long,
    Float,
    Double,
    Boolean,
    Date,
    Time,
    Timestamp,
    List,
}

/// One named value in a var pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub prop: String,
    pub direct: Direction,
    #[serde(rename = "type", default)]
    pub data_type: DataType,
    #[serde(default)]
    pub value: String,
}

impl Property {
    pub fn new(prop: &str, direct: Direction, value: impl Into<String>) -> Self {
        Self {
            prop: prop.to_string(),
            direct,
            data_type: DataType::Varchar,
            value: value.into(),
        }
    }

    pub fn input(prop: &str, value: impl Into<String>) -> Self {
        Self::new(prop, Direction::In, value)
    }

    pub fn output(prop: &str, value: impl Into<String>) -> Self {
        Self::new(prop, Direction::Out, value)
    }
}

/// Merge `incoming` into `target` by name. Later entries overwrite earlier ones and
/// keep their original position, new names are appended.
pub fn merge_properties(target: &mut Vec<Property>, incoming: impl IntoIterator<Item = Property>) {
    for property in incoming {
        match target.iter_mut().find(|p| p.prop == property.prop) {
            Some(existing) => *existing = property,
            None => target.push(property),
        }
    }
}

pub fn find_property<'a>(pool: &'a [Property], prop: &str) -> Option<&'a Property> {
    pool.iter().find(|p| p.prop == prop)
}
