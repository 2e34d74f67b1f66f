use std::collections::{HashMap, HashSet};

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraversalIssue {
    #[error("conversation has no mapping")]
    MissingMapping,
    #[error("mapping does not parse: {0}")]
    UnparsableMapping(String),
    #[error("current node is missing")]
    MissingCurrentNode,
    #[error("node {node} has an unreadable parent reference")]
    MalformedParent { node: String },
    #[error("node {node} points at missing parent {parent}")]
    DanglingParent { node: String, parent: String },
    #[error("parent chain loops back to node {node}")]
    Cycle { node: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeMessage {
    pub role: Option<String>,
    pub text: Option<String>,
    pub create_time: Option<f64>,
}

impl NodeMessage {
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let role = match obj.get("author") {
            Some(Value::String(role)) => Some(role.clone()),
            Some(Value::Object(author)) => author
                .get("role")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        };
        let text = match obj.get("text").and_then(Value::as_str) {
            Some(text) => Some(text.to_string()),
            None => obj.get("content").and_then(content_text),
        };
        Some(Self {
            role,
            text,
            create_time: obj.get("create_time").and_then(timestamp),
        })
    }

    fn is_usable(&self) -> bool {
        self.role.as_deref().is_some_and(|r| !r.is_empty())
            && self.text.as_deref().is_some_and(|t| !t.is_empty())
    }
}

fn content_text(content: &Value) -> Option<String> {
    let content = content.as_object()?;
    match content.get("content_type").and_then(Value::as_str) {
        None | Some("text") => {}
        Some(_) => return None,
    }
    let parts: Vec<&str> = content
        .get("parts")?
        .as_array()?
        .iter()
        .filter_map(Value::as_str)
        .filter(|p| !p.is_empty())
        .collect();
    (!parts.is_empty()).then(|| parts.join("\n"))
}

pub fn timestamp(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Parent {
    Root,
    Id(String),
    // Present but not a node id, or the node itself is not an object.
    Malformed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub parent: Parent,
    pub message: Option<NodeMessage>,
    pub raw: Value,
}

impl Node {
    pub fn from_value(value: &Value) -> Self {
        let parent = match value.as_object().map(|obj| obj.get("parent")) {
            None => Parent::Malformed,
            Some(None | Some(Value::Null)) => Parent::Root,
            Some(Some(Value::String(id))) => Parent::Id(id.clone()),
            Some(Some(_)) => Parent::Malformed,
        };
        let message = value.get("message").and_then(NodeMessage::from_value);
        Self {
            parent,
            message,
            raw: value.clone(),
        }
    }
}

pub type Mapping = HashMap<String, Node>;

pub fn parse_mapping(value: &Value) -> Result<Mapping, TraversalIssue> {
    let nodes = value
        .as_object()
        .ok_or_else(|| TraversalIssue::UnparsableMapping("mapping is not an object".to_string()))?;
    Ok(nodes
        .iter()
        .map(|(id, node)| (id.clone(), Node::from_value(node)))
        .collect())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub node_id: String,
    pub role: String,
    pub text: String,
    pub create_time: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    // oldest first
    pub entries: Vec<TranscriptEntry>,
    pub issue: Option<TraversalIssue>,
}

impl Transcript {
    fn failed(issue: TraversalIssue) -> Self {
        Self {
            entries: Vec::new(),
            issue: Some(issue),
        }
    }

    pub fn pairs(&self) -> Vec<(&str, &str)> {
        self.entries
            .iter()
            .map(|e| (e.role.as_str(), e.text.as_str()))
            .collect()
    }
}

/// Follows parent pointers from `current` to the root. A dangling or
/// malformed parent, or a revisited node, ends the walk with what was
/// collected so far and records the issue.
pub fn reconstruct(current: &str, mapping: &Mapping) -> Transcript {
    if !mapping.contains_key(current) {
        return Transcript::failed(TraversalIssue::MissingCurrentNode);
    }
    let mut entries = Vec::new();
    let mut issue = None;
    let mut visited: HashSet<&str> = HashSet::new();
    let mut cursor = Some(current);

    while let Some(id) = cursor {
        if !visited.insert(id) {
            issue = Some(TraversalIssue::Cycle {
                node: id.to_string(),
            });
            break;
        }
        let Some((key, node)) = mapping.get_key_value(id) else {
            break;
        };
        if let Some(message) = &node.message
            && message.is_usable()
        {
            entries.push(TranscriptEntry {
                node_id: key.clone(),
                role: message.role.clone().unwrap_or_default(),
                text: message.text.clone().unwrap_or_default(),
                create_time: message.create_time,
            });
        }
        cursor = match &node.parent {
            Parent::Root => None,
            Parent::Id(parent) if mapping.contains_key(parent.as_str()) => Some(parent.as_str()),
            Parent::Id(parent) => {
                issue = Some(TraversalIssue::DanglingParent {
                    node: key.clone(),
                    parent: parent.clone(),
                });
                None
            }
            Parent::Malformed => {
                issue = Some(TraversalIssue::MalformedParent { node: key.clone() });
                None
            }
        };
    }

    entries.reverse();
    Transcript { entries, issue }
}

#[derive(Debug, Clone, PartialEq)]
enum MappingField {
    Missing,
    Unparsable(String),
    Parsed(Mapping),
}

impl MappingField {
    fn from_text(text: Option<&str>) -> Self {
        match text.map(str::trim) {
            None | Some("") => MappingField::Missing,
            Some(text) => match serde_json::from_str::<Value>(text) {
                Ok(value) => Self::from_value(&value),
                Err(err) => MappingField::Unparsable(err.to_string()),
            },
        }
    }

    fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => MappingField::Missing,
            Value::String(text) => Self::from_text(Some(text)),
            other => match parse_mapping(other) {
                Ok(mapping) => MappingField::Parsed(mapping),
                Err(TraversalIssue::UnparsableMapping(reason)) => MappingField::Unparsable(reason),
                Err(other) => MappingField::Unparsable(other.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRecord {
    pub id: String,
    pub title: Option<String>,
    pub create_time: Option<f64>,
    pub update_time: Option<f64>,
    pub current_node: Option<String>,
    mapping: MappingField,
    pub extra: Vec<(String, Option<String>)>,
}

impl ConversationRecord {
    pub fn from_fields<'a>(fields: impl IntoIterator<Item = (&'a str, Option<&'a str>)>) -> Self {
        let mut record = Self::empty();
        for (key, value) in fields {
            match key {
                "id" => record.id = value.unwrap_or_default().to_string(),
                "title" => record.title = value.map(str::to_string),
                "create_time" => record.create_time = value.and_then(|v| v.trim().parse().ok()),
                "update_time" => record.update_time = value.and_then(|v| v.trim().parse().ok()),
                "current_node" => {
                    record.current_node = value.filter(|v| !v.is_empty()).map(str::to_string)
                }
                "mapping" => record.mapping = MappingField::from_text(value),
                _ => record
                    .extra
                    .push((key.to_string(), value.map(str::to_string))),
            }
        }
        record
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        let obj: &Map<String, Value> = value.as_object()?;
        let mut record = Self::empty();
        for (key, value) in obj {
            match key.as_str() {
                "id" => record.id = scalar_text(value).unwrap_or_default(),
                "title" => record.title = scalar_text(value),
                "create_time" => record.create_time = timestamp(value),
                "update_time" => record.update_time = timestamp(value),
                "current_node" => record.current_node = value.as_str().map(str::to_string),
                "mapping" => record.mapping = MappingField::from_value(value),
                _ => record.extra.push((key.clone(), scalar_text(value))),
            }
        }
        Some(record)
    }

    fn empty() -> Self {
        Self {
            id: String::new(),
            title: None,
            create_time: None,
            update_time: None,
            current_node: None,
            mapping: MappingField::Missing,
            extra: Vec::new(),
        }
    }

    pub fn mapping(&self) -> Option<&Mapping> {
        match &self.mapping {
            MappingField::Parsed(mapping) => Some(mapping),
            _ => None,
        }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.mapping()?.get(id)
    }

    pub fn transcript(&self) -> Transcript {
        let transcript = match (&self.mapping, self.current_node.as_deref()) {
            (MappingField::Missing, _) => Transcript::failed(TraversalIssue::MissingMapping),
            (MappingField::Unparsable(reason), _) => {
                Transcript::failed(TraversalIssue::UnparsableMapping(reason.clone()))
            }
            (MappingField::Parsed(_), None) => {
                Transcript::failed(TraversalIssue::MissingCurrentNode)
            }
            (MappingField::Parsed(mapping), Some(current)) => reconstruct(current, mapping),
        };
        if let Some(issue) = &transcript.issue {
            warn!(conversation = %self.id, entries = transcript.entries.len(), "{issue}");
        }
        transcript
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
