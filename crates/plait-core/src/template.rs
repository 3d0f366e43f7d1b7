use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::types::Role;

/// A named, registry-resolvable data reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceRef {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Map<String, Value>>,
}

impl SourceRef {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            args: None,
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    pub fn arg(&self, key: &str) -> Option<&Value> {
        self.args.as_ref().and_then(|a| a.get(key))
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.arg(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageNode {
    pub role: Role,
    /// Literal text with `{{path}}` placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Registry-sourced content; takes precedence over `content`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<SourceRef>,
    #[serde(default)]
    pub prefix: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<u64>,
    #[serde(default)]
    pub skip_if_empty_interpolation: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    Asc,
    Desc,
    #[default]
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Interleave {
    pub separator: String,
    /// Role of the separator message (defaults to `system`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

fn default_stop_when_out_of_budget() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ForEachNode {
    pub source: SourceRef,
    #[serde(default)]
    pub order: Order,
    /// Dot path inside each item used as the sort key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interleave: Option<Interleave>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<u64>,
    #[serde(default = "default_stop_when_out_of_budget")]
    pub stop_when_out_of_budget: bool,
    #[serde(default)]
    pub map: Vec<PlanNode>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConditionOp {
    Exists,
    NonEmpty,
    Eq,
    Neq,
    Gt,
    Lt,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    pub op: ConditionOp,
    #[serde(rename = "ref")]
    pub source_ref: SourceRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IfNode {
    pub condition: Condition,
    #[serde(default)]
    pub then: Vec<PlanNode>,
    #[serde(default, rename = "else", skip_serializing_if = "Vec::is_empty")]
    pub otherwise: Vec<PlanNode>,
}

/// A node kind this version does not understand, kept verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct UnknownNode {
    pub kind: String,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanNode {
    Message(MessageNode),
    ForEach(ForEachNode),
    If(IfNode),
    Unknown(UnknownNode),
}

impl PlanNode {
    pub fn kind(&self) -> &str {
        match self {
            Self::Message(_) => "message",
            Self::ForEach(_) => "forEach",
            Self::If(_) => "if",
            Self::Unknown(n) => &n.kind,
        }
    }

    /// Literal message shorthand.
    pub fn message(role: Role, content: impl Into<String>) -> Self {
        Self::Message(MessageNode {
            role,
            content: Some(content.into()),
            from: None,
            prefix: false,
            budget: None,
            skip_if_empty_interpolation: false,
        })
    }

    /// Registry-sourced message shorthand.
    pub fn message_from(role: Role, from: SourceRef) -> Self {
        Self::Message(MessageNode {
            role,
            content: None,
            from: Some(from),
            prefix: false,
            budget: None,
            skip_if_empty_interpolation: false,
        })
    }

    fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let kind = node_kind(&value)?;
        Ok(match kind.as_str() {
            "message" => Self::Message(serde_json::from_value(value)?),
            "forEach" => Self::ForEach(serde_json::from_value(value)?),
            "if" => Self::If(serde_json::from_value(value)?),
            _ => Self::Unknown(UnknownNode { kind, raw: value }),
        })
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        let mut value = match self {
            Self::Message(n) => serde_json::to_value(n)?,
            Self::ForEach(n) => serde_json::to_value(n)?,
            Self::If(n) => serde_json::to_value(n)?,
            Self::Unknown(n) => return Ok(n.raw.clone()),
        };
        if let Some(obj) = value.as_object_mut() {
            obj.insert("kind".to_string(), Value::String(self.kind().to_string()));
        }
        Ok(value)
    }
}

fn node_kind(value: &Value) -> Result<String, serde_json::Error> {
    value
        .get("kind")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| serde_json::Error::custom("plan node is missing a string `kind`"))
}

impl<'de> Deserialize<'de> for PlanNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        PlanNode::from_value(value).map_err(D::Error::custom)
    }
}

impl Serialize for PlanNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

/// One layout position: either an inline node or a reference to a slot.
#[derive(Debug, Clone, PartialEq)]
pub enum LayoutItem {
    Slot { name: String },
    Node(PlanNode),
}

impl<'de> Deserialize<'de> for LayoutItem {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let kind = node_kind(&value).map_err(D::Error::custom)?;
        if kind == "slot" {
            let name = value
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| D::Error::custom("slot reference is missing `name`"))?;
            return Ok(LayoutItem::Slot {
                name: name.to_string(),
            });
        }
        PlanNode::from_value(value)
            .map(LayoutItem::Node)
            .map_err(D::Error::custom)
    }
}

impl Serialize for LayoutItem {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            LayoutItem::Slot { name } => {
                serde_json::json!({ "kind": "slot", "name": name }).serialize(serializer)
            }
            LayoutItem::Node(node) => node.serialize(serializer),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Slot {
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub plan: Vec<PlanNode>,
}

/// A named, versioned prompt template. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Template {
    pub id: String,
    pub task: String,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub layout: Vec<LayoutItem>,
    #[serde(default)]
    pub slots: BTreeMap<String, Slot>,
}

impl Template {
    pub fn new(id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            version: 0,
            layout: Vec::new(),
            slots: BTreeMap::new(),
        }
    }

    pub fn with_node(mut self, node: PlanNode) -> Self {
        self.layout.push(LayoutItem::Node(node));
        self
    }

    pub fn with_slot_ref(mut self, name: impl Into<String>) -> Self {
        self.layout.push(LayoutItem::Slot { name: name.into() });
        self
    }

    pub fn with_slot(mut self, name: impl Into<String>, priority: i32, plan: Vec<PlanNode>) -> Self {
        self.slots.insert(name.into(), Slot { priority, plan });
        self
    }
}
