#![allow(clippy::result_large_err)] // Plan loading returns AppError to preserve structured validation context without boxing.

use crate::core::error::AppError;
use crate::core::plan_graph::expression::{CompiledExpression, ExpressionEvaluator};
use crate::core::plan_graph::state::compute_sha256_hex;
use crate::core::types::ErrorCategory;
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn default_params_value() -> Value {
    Value::Object(Map::new())
}

fn default_max_iterations() -> u32 {
    100
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    })
}

/// Root document of a plan.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Plan {
    pub id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub version: String,
    pub entry: String,
    pub nodes: Vec<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PlanMetadata>,
}

/// Descriptive metadata carried with a plan.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PlanMetadata {
    pub name: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// One typed unit of a plan.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Node {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Sequence(GroupSpec),
    Parallel(GroupSpec),
    Conditional(ConditionalSpec),
    Loop(LoopSpec),
    HumanApproval(ApprovalSpec),
    LocalTask(LeafSpec),
    AgentInvocation(LeafSpec),
    McpTool(LeafSpec),
    ExternalService(LeafSpec),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GroupSpec {
    #[serde(default)]
    pub children: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConditionSpec {
    pub expression: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalSpec {
    pub condition: ConditionSpec,
    #[serde(default)]
    pub when_true: Vec<String>,
    #[serde(default)]
    pub when_false: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum LoopMode {
    #[serde(rename = "while")]
    While,
    #[serde(rename = "forEach", alias = "for-each", alias = "for_each")]
    ForEach,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopSpec {
    pub mode: LoopMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_path: Option<Value>,
    #[serde(default)]
    pub body: Vec<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default = "default_params_value")]
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeafSpec {
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default = "default_params_value")]
    pub params: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

/// Discriminant of [`NodeKind`], used to key adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Sequence,
    Parallel,
    Conditional,
    Loop,
    HumanApproval,
    LocalTask,
    AgentInvocation,
    McpTool,
    ExternalService,
}

impl NodeType {
    pub const LEAF_TYPES: [NodeType; 4] = [
        NodeType::LocalTask,
        NodeType::AgentInvocation,
        NodeType::McpTool,
        NodeType::ExternalService,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Sequence => "sequence",
            NodeType::Parallel => "parallel",
            NodeType::Conditional => "conditional",
            NodeType::Loop => "loop",
            NodeType::HumanApproval => "human_approval",
            NodeType::LocalTask => "local_task",
            NodeType::AgentInvocation => "agent_invocation",
            NodeType::McpTool => "mcp_tool",
            NodeType::ExternalService => "external_service",
        }
    }

    /// Control nodes only route; they never reach an adapter or a gate.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            NodeType::Sequence | NodeType::Parallel | NodeType::Conditional | NodeType::Loop
        )
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Sequence(_) => NodeType::Sequence,
            NodeKind::Parallel(_) => NodeType::Parallel,
            NodeKind::Conditional(_) => NodeType::Conditional,
            NodeKind::Loop(_) => NodeType::Loop,
            NodeKind::HumanApproval(_) => NodeType::HumanApproval,
            NodeKind::LocalTask(_) => NodeType::LocalTask,
            NodeKind::AgentInvocation(_) => NodeType::AgentInvocation,
            NodeKind::McpTool(_) => NodeType::McpTool,
            NodeKind::ExternalService(_) => NodeType::ExternalService,
        }
    }

    pub fn leaf(&self) -> Option<&LeafSpec> {
        match self {
            NodeKind::LocalTask(spec)
            | NodeKind::AgentInvocation(spec)
            | NodeKind::McpTool(spec)
            | NodeKind::ExternalService(spec) => Some(spec),
            _ => None,
        }
    }
}

impl Node {
    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    pub fn risk_level(&self) -> RiskLevel {
        match &self.kind {
            NodeKind::HumanApproval(spec) => spec.risk_level,
            kind => kind.leaf().map(|spec| spec.risk_level).unwrap_or_default(),
        }
    }

    /// Declared `requiresApproval`; `human_approval` nodes always require it.
    pub fn requires_approval(&self) -> bool {
        match &self.kind {
            NodeKind::HumanApproval(_) => true,
            kind => kind.leaf().map(|spec| spec.requires_approval).unwrap_or(false),
        }
    }

    /// Whether reaching this node must pass an approval gate first.
    pub fn is_gated(&self) -> bool {
        self.requires_approval() || self.risk_level() == RiskLevel::High
    }

    /// Leaf parameters, or the approval payload for `human_approval` nodes.
    pub fn params(&self) -> Option<&Value> {
        match &self.kind {
            NodeKind::HumanApproval(spec) => Some(&spec.payload),
            kind => kind.leaf().map(|spec| &spec.params),
        }
    }

    /// Every node id referenced from this node, in declaration order.
    pub fn child_ids(&self) -> Vec<&str> {
        match &self.kind {
            NodeKind::Sequence(group) | NodeKind::Parallel(group) => {
                group.children.iter().map(String::as_str).collect()
            }
            NodeKind::Conditional(spec) => spec
                .when_true
                .iter()
                .chain(spec.when_false.iter())
                .map(String::as_str)
                .collect(),
            NodeKind::Loop(spec) => spec.body.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }
}

/// A validated plan with its derived lookup tables.
#[derive(Debug, Clone)]
pub struct LoadedPlan {
    pub plan: Plan,
    pub node_map: HashMap<String, Node>,
    pub adjacency: HashMap<String, Vec<String>>,
    /// SHA-256 of the canonical plan document, used to bind checkpoints.
    pub hash: String,
    /// Conditions and collections compiled at load time, keyed by node id.
    pub expressions: HashMap<String, Arc<CompiledExpression>>,
}

impl LoadedPlan {
    pub fn id(&self) -> &str {
        &self.plan.id
    }

    pub fn version(&self) -> &str {
        &self.plan.version
    }

    pub fn entry(&self) -> &str {
        &self.plan.entry
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.node_map.get(id)
    }

    /// The compiled condition or collection of a conditional or loop node.
    pub fn expression(&self, node_id: &str) -> Option<&CompiledExpression> {
        self.expressions.get(node_id).map(Arc::as_ref)
    }

    /// Non-control nodes in declaration order.
    pub fn leaf_nodes(&self) -> impl Iterator<Item = &Node> {
        self.plan
            .nodes
            .iter()
            .filter(|node| !node.node_type().is_control())
    }
}

fn load_error(code: &str, message: impl Into<String>) -> AppError {
    AppError::new(ErrorCategory::ValidationError, message).with_code(code)
}

/// Parse and validate a raw plan document.
pub fn load_plan(raw: Value) -> Result<LoadedPlan, AppError> {
    load_plan_with(raw, &ExpressionEvaluator::default())
}

/// Parse and validate a raw plan, compiling expressions with `evaluator`.
pub fn load_plan_with(raw: Value, evaluator: &ExpressionEvaluator) -> Result<LoadedPlan, AppError> {
    let plan: Plan = serde_json::from_value(raw)
        .map_err(|err| load_error("PLN-LOAD-001", format!("invalid plan document: {}", err)))?;
    let expressions = validate_plan(&plan, evaluator)?;

    let node_map: HashMap<String, Node> = plan
        .nodes
        .iter()
        .map(|node| (node.id.clone(), node.clone()))
        .collect();
    let adjacency = plan
        .nodes
        .iter()
        .map(|node| {
            let children = node.child_ids().into_iter().map(str::to_string).collect();
            (node.id.clone(), children)
        })
        .collect();
    let canonical = serde_json::to_vec(&plan).map_err(|err| {
        AppError::new(
            ErrorCategory::SerializationError,
            format!("failed to serialize plan {}: {}", plan.id, err),
        )
    })?;
    let hash = compute_sha256_hex(&canonical);

    tracing::debug!(plan_id = %plan.id, nodes = plan.nodes.len(), "plan loaded");
    Ok(LoadedPlan {
        plan,
        node_map,
        adjacency,
        hash,
        expressions,
    })
}

/// Load a plan from a `.json`, `.yaml`, or `.yml` file.
pub fn load_plan_file(path: &Path) -> Result<LoadedPlan, AppError> {
    let text = fs::read_to_string(path).map_err(|err| {
        AppError::new(
            ErrorCategory::IoError,
            format!("failed to read {}: {}", path.display(), err),
        )
        .with_code("PLN-LOAD-001")
    })?;
    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    );
    let raw: Value = if is_yaml {
        serde_yaml::from_str(&text).map_err(|err| {
            load_error(
                "PLN-LOAD-001",
                format!("failed to parse {}: {}", path.display(), err),
            )
        })?
    } else {
        serde_json::from_str(&text).map_err(|err| {
            load_error(
                "PLN-LOAD-001",
                format!("failed to parse {}: {}", path.display(), err),
            )
        })?
    };
    load_plan(raw)
}

fn validate_plan(
    plan: &Plan,
    evaluator: &ExpressionEvaluator,
) -> Result<HashMap<String, Arc<CompiledExpression>>, AppError> {
    if plan.id.trim().is_empty() {
        return Err(load_error("PLN-LOAD-001", "plan id must not be empty"));
    }
    if plan.nodes.is_empty() {
        return Err(load_error("PLN-LOAD-001", "plan must define at least one node"));
    }

    let mut ids = HashSet::new();
    for node in &plan.nodes {
        if node.id.trim().is_empty() {
            return Err(load_error("PLN-LOAD-001", "node id must not be empty"));
        }
        if !ids.insert(node.id.as_str()) {
            return Err(load_error(
                "PLN-LOAD-003",
                format!("duplicate node id: {}", node.id),
            ));
        }
    }

    if !ids.contains(plan.entry.as_str()) {
        return Err(load_error(
            "PLN-LOAD-002",
            format!("entry '{}' is not present in plan nodes", plan.entry),
        ));
    }

    let mut expressions = HashMap::new();
    for node in &plan.nodes {
        for child in node.child_ids() {
            if !ids.contains(child) {
                return Err(load_error(
                    "PLN-LOAD-002",
                    format!("node '{}' references unknown node '{}'", node.id, child),
                )
                .with_context("node_id", node.id.clone()));
            }
        }
        if let Some(compiled) = compile_expressions(node, evaluator)? {
            expressions.insert(node.id.clone(), compiled);
        }
    }

    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for node in &plan.nodes {
        graph.add_node(node.id.as_str());
        for child in node.child_ids() {
            graph.add_edge(node.id.as_str(), child, ());
        }
    }
    if let Err(cycle) = toposort(&graph, None) {
        return Err(load_error(
            "PLN-LOAD-004",
            format!("plan contains a structural cycle through '{}'", cycle.node_id()),
        ));
    }

    Ok(expressions)
}

fn compile_expressions(
    node: &Node,
    evaluator: &ExpressionEvaluator,
) -> Result<Option<Arc<CompiledExpression>>, AppError> {
    let compile = |expr: &Value| {
        evaluator
            .compile(expr)
            .map(Some)
            .map_err(|err| err.with_context("node_id", node.id.clone()))
    };
    match &node.kind {
        NodeKind::Conditional(spec) => compile(&spec.condition.expression),
        NodeKind::Loop(spec) => match spec.mode {
            LoopMode::While => match &spec.condition {
                Some(condition) => compile(&condition.expression),
                None => Err(load_error(
                    "PLN-LOAD-005",
                    format!("while loop '{}' has no condition", node.id),
                )),
            },
            LoopMode::ForEach => match &spec.collection_path {
                Some(path) => compile(path),
                None => Err(load_error(
                    "PLN-LOAD-005",
                    format!("forEach loop '{}' has no collectionPath", node.id),
                )),
            },
        },
        _ => Ok(None),
    }
}
