use crate::error::Error;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;

/// Index of a node in its plan's arena.
pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAction {
    Start,
    Terminate,
    Func,
    Unknown,
}

impl TriggerAction {
    fn parse(raw: &str) -> Self {
        match raw {
            "start" => TriggerAction::Start,
            "terminate" => TriggerAction::Terminate,
            "func" => TriggerAction::Func,
            _ => TriggerAction::Unknown,
        }
    }
}

/// A watched (tag, status) condition plus the action taken when it matches.
/// `active` flips to false exactly once per call when the trigger fires.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub watch_tag: String,
    pub watch_status: String,
    pub action: TriggerAction,
    pub func: Option<String>,
    pub active: bool,
}

impl Trigger {
    fn from_value(raw: &Value) -> Self {
        let str_field = |key: &str, default: &str| -> String {
            raw.get(key)
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string()
        };
        Self {
            watch_tag: str_field("trigger_tag", "unknown"),
            watch_status: str_field("trigger_status", "unknown"),
            action: TriggerAction::parse(&str_field("action", "unknown")),
            func: raw.get("func").and_then(Value::as_str).map(str::to_string),
            active: raw.get("active").and_then(Value::as_bool).unwrap_or(true),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanNode {
    pub name: String,
    pub tag: String,
    /// Raw node type string ("room", "bridge", "chan_outbound", ...). Kept
    /// verbatim; chan variants are resolved at instantiation time so an
    /// unrecognized type degrades instead of failing the load.
    pub kind: String,
    /// Status recorded when the live node is instantiated.
    pub initial_status: String,
    pub params: Map<String, Value>,
    pub triggers: Vec<Trigger>,
    pub children: Vec<NodeId>,
    pub parent: Option<NodeId>,
}

impl PlanNode {
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// A call-flow definition: the tree is stored as a flat arena so the per-call
/// copy is a plain index-preserving clone and trigger flags can be flipped
/// while other parts of the tree are being read.
#[derive(Debug, Clone)]
pub struct Plan {
    nodes: Vec<PlanNode>,
    root: NodeId,
}

impl Plan {
    /// Parse one call-flow document. `tag` is the only required field; the
    /// rest default (`name` = "unknown", `status` = "init").
    pub fn from_value(raw: &Value) -> Result<Self, Error> {
        let mut nodes = Vec::new();
        let root = Self::build(raw, None, &mut nodes)?;
        Ok(Self { nodes, root })
    }

    fn build(raw: &Value, parent: Option<NodeId>, nodes: &mut Vec<PlanNode>) -> Result<NodeId, Error> {
        let tag = raw
            .get("tag")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::MalformedPlan("node is missing a tag".to_string()))?
            .to_string();

        let id = nodes.len();
        nodes.push(PlanNode {
            name: raw
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            tag,
            kind: raw
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            initial_status: raw
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("init")
                .to_string(),
            params: raw
                .get("params")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            triggers: raw
                .get("triggers")
                .and_then(Value::as_array)
                .map(|list| list.iter().map(Trigger::from_value).collect())
                .unwrap_or_default(),
            children: Vec::new(),
            parent,
        });

        if let Some(content) = raw.get("content").and_then(Value::as_array) {
            for child_raw in content {
                let child = Self::build(child_raw, Some(id), nodes)?;
                nodes[id].children.push(child);
            }
        }
        Ok(id)
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::MalformedPlan(format!("{}: {}", path.display(), e)))?;
        let raw: Value = serde_json::from_str(&text)
            .map_err(|e| Error::MalformedPlan(format!("{}: {}", path.display(), e)))?;
        Self::from_value(&raw)
    }

    /// Load every `*.json` in a directory into a named-flow table keyed by
    /// file stem.
    pub fn load_dir(path: &str) -> Result<HashMap<String, Plan>, Error> {
        let mut plans = HashMap::new();
        let entries = std::fs::read_dir(path)
            .map_err(|e| Error::MalformedPlan(format!("{}: {}", path, e)))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::MalformedPlan(e.to_string()))?;
            let file = entry.path();
            if file.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let name = file
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            plans.insert(name, Self::load(&file)?);
        }
        Ok(plans)
    }

    /// Independent copy for one call, so trigger `active` flags are isolated
    /// per call instance.
    pub fn clone_for_call(&self) -> Plan {
        self.clone()
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &PlanNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut PlanNode {
        &mut self.nodes[id]
    }

    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes[id].children.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "name": "test flow",
            "tag": "room",
            "type": "room",
            "status": "init",
            "triggers": [
                {"trigger_tag": "room", "trigger_status": "ChannelDestroyed", "action": "terminate"}
            ],
            "content": [
                {
                    "tag": "main-bridge",
                    "type": "bridge",
                    "triggers": [
                        {"trigger_tag": "room", "trigger_status": "ready", "action": "start"}
                    ],
                    "content": [
                        {"tag": "oper", "type": "chan_outbound",
                         "params": {"dial_option_name": "intphone"}}
                    ]
                }
            ]
        })
    }

    #[test]
    fn parses_tree_with_defaults() {
        let plan = Plan::from_value(&sample()).unwrap();
        let root = plan.node(plan.root());
        assert_eq!(root.tag, "room");
        assert_eq!(root.children.len(), 1);

        let bridge = plan.node(root.children[0]);
        // missing name/status degrade to defaults instead of failing
        assert_eq!(bridge.name, "unknown");
        assert_eq!(bridge.initial_status, "init");
        assert_eq!(bridge.triggers[0].action, TriggerAction::Start);

        let chan = plan.node(bridge.children[0]);
        assert_eq!(chan.str_param("dial_option_name"), Some("intphone"));
        assert_eq!(chan.parent, Some(root.children[0]));
    }

    #[test]
    fn missing_tag_is_malformed() {
        let raw = json!({"name": "no tag here", "type": "room"});
        match Plan::from_value(&raw) {
            Err(Error::MalformedPlan(_)) => {}
            other => panic!("expected MalformedPlan, got {:?}", other),
        }
    }

    #[test]
    fn unknown_action_is_kept_inert() {
        let raw = json!({
            "tag": "room",
            "triggers": [{"trigger_tag": "room", "trigger_status": "x", "action": "explode"}]
        });
        let plan = Plan::from_value(&raw).unwrap();
        assert_eq!(
            plan.node(plan.root()).triggers[0].action,
            TriggerAction::Unknown
        );
    }

    #[test]
    fn per_call_clone_isolates_trigger_flags() {
        let plan = Plan::from_value(&sample()).unwrap();
        let mut first = plan.clone_for_call();
        let second = plan.clone_for_call();

        let root = first.root();
        first.node_mut(root).triggers[0].active = false;
        assert!(second.node(second.root()).triggers[0].active);
        assert!(plan.node(plan.root()).triggers[0].active);
    }
}
