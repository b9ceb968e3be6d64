//! Turns [`FindArgs`] into an [`ExecutionPlan`]: an arena of query nodes,
//! one per record type reached through `include`, each carrying its analyzed
//! filter, ordering, window and output fields.

use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use xxhash_rust::xxh64::Xxh64;

use crate::error::{EngineError, Result};
use crate::query::analyze::{analyze_filter, analyze_unique};
use crate::query::ast::{Cursor, FindArgs, NullsOrder, OrderBy, SortOrder};
use crate::query::filter::{Filter, RelationPredicate};
use crate::query::value::{format_tuple, Value};
use crate::schema::{Cardinality, RecordType, Schema};

/// Order in which nested relations are loaded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TraversalStrategy {
    /// Load one relation level for every parent row before descending.
    #[default]
    BreadthFirst,
    /// Finish each parent row's whole subtree before the next row.
    DepthFirst,
}

/// Limits applied while planning and loading relations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlannerConfig {
    /// Deepest relation nesting accepted.
    pub max_depth: usize,
    /// Related records a single request may load.
    pub max_fanout: usize,
    /// Relation-loading order.
    pub strategy: TraversalStrategy,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_depth: 8,
            max_fanout: 100_000,
            strategy: TraversalStrategy::BreadthFirst,
        }
    }
}

/// `_count` request for one to-many relation.
#[derive(Clone, Debug, PartialEq)]
pub struct RelationCount {
    /// Relation name.
    pub relation: String,
    /// Analyzed filter over the related records.
    pub filter: Option<Filter>,
}

/// One record type visited by a query.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryNode {
    /// Arena index.
    pub id: usize,
    /// Parent arena index; `None` for the root.
    pub parent: Option<usize>,
    /// Nesting depth, 0 for the root.
    pub depth: usize,
    /// Record type scanned by this node.
    pub record_type: String,
    /// Relation on the parent that leads here.
    pub via: Option<String>,
    /// Analyzed filter.
    pub filter: Option<Filter>,
    /// Ordering keys.
    pub order_by: Vec<OrderBy>,
    /// Coerced cursor values in constraint order.
    pub cursor: Option<Vec<(String, Value)>>,
    /// Offset.
    pub skip: usize,
    /// Signed page size.
    pub take: Option<i64>,
    /// Distinct key.
    pub distinct: Vec<String>,
    /// Output scalars in declaration order.
    pub scalars: Vec<String>,
    /// Included relations.
    pub children: Vec<usize>,
    /// Relation counts.
    pub counts: Vec<RelationCount>,
}

/// Planner output.
#[derive(Clone, Debug)]
pub struct ExecutionPlan {
    /// Node arena; index 0 is the root.
    pub nodes: Vec<QueryNode>,
    /// Relation-loading order.
    pub strategy: TraversalStrategy,
    /// Related records the execution may load.
    pub max_fanout: usize,
    /// Hash of the plan shape; filter and cursor literals do not contribute.
    pub plan_hash: u64,
    /// Human-readable plan.
    pub explain: PlanExplain,
}

impl ExecutionPlan {
    /// Root node.
    pub fn root(&self) -> &QueryNode {
        &self.nodes[0]
    }

    /// Node by arena index.
    pub fn node(&self, id: usize) -> &QueryNode {
        &self.nodes[id]
    }
}

/// Human-readable explain tree.
#[derive(Clone, Debug, Serialize)]
pub struct PlanExplain {
    /// Root node of the explain tree.
    pub root: ExplainNode,
    /// Deterministic hash for the plan.
    pub plan_hash: u64,
}

/// Explain node representing one scan with its arguments.
#[derive(Clone, Debug, Serialize)]
pub struct ExplainNode {
    /// Operator name.
    pub op: String,
    /// Additional properties describing the operator.
    pub props: Vec<ExplainProp>,
    /// Nested relation loads.
    pub inputs: Vec<ExplainNode>,
}

impl ExplainNode {
    /// Creates a new explain node with the given operator name.
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            props: Vec::new(),
            inputs: Vec::new(),
        }
    }
}

/// Single property associated with an [`ExplainNode`].
#[derive(Clone, Debug, Serialize)]
pub struct ExplainProp {
    /// Property key.
    pub key: String,
    /// Property value serialized for display.
    pub value: String,
    /// Whether this property contains literal data that may be redacted.
    pub redactable: bool,
}

impl ExplainProp {
    fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: false,
        }
    }

    fn literal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: true,
        }
    }
}

impl fmt::Display for PlanExplain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn render(node: &ExplainNode, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:width$}{}", "", node.op, width = indent * 2)?;
            for prop in &node.props {
                write!(f, " {}={}", prop.key, prop.value)?;
            }
            writeln!(f)?;
            for input in &node.inputs {
                render(input, indent + 1, f)?;
            }
            Ok(())
        }
        render(&self.root, 0, f)?;
        write!(f, "plan_hash={:016x}", self.plan_hash)
    }
}

/// Validates read requests against the schema and lays out their execution.
#[derive(Clone, Debug)]
pub struct Planner {
    schema: Arc<Schema>,
    config: PlannerConfig,
}

impl Planner {
    /// Creates a planner over a finalized schema.
    pub fn new(schema: Arc<Schema>, config: PlannerConfig) -> Self {
        Self { schema, config }
    }

    /// Active limits.
    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Plans a read of `record_type`.
    pub fn plan(&self, record_type: &str, args: &FindArgs) -> Result<ExecutionPlan> {
        let ty = self.schema.record_type(record_type)?;
        let mut nodes = Vec::new();
        let mut path = Vec::new();
        self.plan_node(ty, args, None, 0, &mut path, &mut nodes)?;
        let root = explain_node(&nodes, 0);
        let plan_hash = hash_plan(&nodes);
        debug!(
            record_type,
            nodes = nodes.len(),
            plan_hash,
            "planner.plan"
        );
        Ok(ExecutionPlan {
            nodes,
            strategy: self.config.strategy,
            max_fanout: self.config.max_fanout,
            plan_hash,
            explain: PlanExplain { root, plan_hash },
        })
    }

    fn plan_node(
        &self,
        ty: &RecordType,
        args: &FindArgs,
        parent: Option<(usize, &str)>,
        depth: usize,
        path: &mut Vec<(String, String)>,
        nodes: &mut Vec<QueryNode>,
    ) -> Result<usize> {
        if depth > self.config.max_depth {
            return Err(EngineError::ProjectionTooDeep {
                depth,
                max: self.config.max_depth,
            });
        }
        let filter = args
            .filter
            .as_ref()
            .map(|filter| analyze_filter(&self.schema, ty, filter))
            .transpose()?;
        for order in &args.order_by {
            let field = ty.require_scalar(&order.field, "orderBy")?;
            if field.list {
                return Err(EngineError::InvalidArgument(format!(
                    "cannot order '{}' by list field '{}'",
                    ty.name, order.field
                )));
            }
        }
        for field in &args.distinct {
            ty.require_scalar(field, "distinct")?;
        }
        let cursor = args
            .cursor
            .as_ref()
            .map(|cursor| self.plan_cursor(ty, cursor))
            .transpose()?;
        let scalars = output_scalars(ty, args)?;

        let id = nodes.len();
        nodes.push(QueryNode {
            id,
            parent: parent.map(|(idx, _)| idx),
            depth,
            record_type: ty.name.clone(),
            via: parent.map(|(_, relation)| relation.to_owned()),
            filter,
            order_by: args.order_by.clone(),
            cursor,
            skip: args.skip.unwrap_or(0),
            take: args.take,
            distinct: args.distinct.clone(),
            scalars,
            children: Vec::new(),
            counts: Vec::new(),
        });

        let mut counts = Vec::with_capacity(args.projection.count.len());
        for (name, filter) in &args.projection.count {
            let rel = ty.require_relation(name)?;
            if rel.cardinality != Cardinality::Many {
                return Err(EngineError::InvalidArgument(format!(
                    "_count requires a to-many relation; '{}.{name}' is to-one",
                    ty.name
                )));
            }
            let target = self.schema.record_type(&rel.target)?;
            let filter = filter
                .as_ref()
                .map(|filter| analyze_filter(&self.schema, target, filter))
                .transpose()?;
            counts.push(RelationCount {
                relation: name.clone(),
                filter,
            });
        }

        let mut children = Vec::with_capacity(args.projection.include.len());
        for (name, nested) in &args.projection.include {
            let rel = ty.require_relation(name)?;
            if rel.cardinality == Cardinality::One && nested.has_window() {
                return Err(EngineError::InvalidArgument(format!(
                    "to-one relation '{}.{name}' accepts only select, omit, include and _count",
                    ty.name
                )));
            }
            let step = (ty.name.clone(), name.clone());
            if path.contains(&step) {
                let mut rendered: Vec<String> = path.iter().map(|(t, r)| format!("{t}.{r}")).collect();
                rendered.push(format!("{}.{name}", ty.name));
                return Err(EngineError::ProjectionCycle {
                    record_type: ty.name.clone(),
                    relation: name.clone(),
                    path: rendered.join(" -> "),
                });
            }
            let target = self.schema.record_type(&rel.target)?;
            path.push(step);
            let child = self.plan_node(target, nested, Some((id, name)), depth + 1, path, nodes);
            path.pop();
            children.push(child?);
        }

        let node = &mut nodes[id];
        node.children = children;
        node.counts = counts;
        Ok(id)
    }

    fn plan_cursor(&self, ty: &RecordType, cursor: &Cursor) -> Result<Vec<(String, Value)>> {
        analyze_unique(&self.schema, ty, &cursor.0, "cursor")
    }
}

fn output_scalars(ty: &RecordType, args: &FindArgs) -> Result<Vec<String>> {
    let projection = &args.projection;
    if !projection.select.is_empty() && !projection.omit.is_empty() {
        return Err(EngineError::AmbiguousSelectOmit {
            record_type: ty.name.clone(),
        });
    }
    for name in &projection.select {
        ty.require_scalar(name, "select")?;
    }
    for name in &projection.omit {
        ty.require_scalar(name, "omit")?;
    }
    Ok(ty
        .scalars
        .iter()
        .map(|field| &field.name)
        .filter(|name| {
            if projection.select.is_empty() {
                !projection.omit.contains(name)
            } else {
                projection.select.contains(name)
            }
        })
        .cloned()
        .collect())
}

fn explain_node(nodes: &[QueryNode], id: usize) -> ExplainNode {
    let node = &nodes[id];
    let mut explain = ExplainNode::new(if node.parent.is_none() { "Find" } else { "Include" });
    explain.props.push(ExplainProp::plain("type", node.record_type.clone()));
    if let Some(via) = &node.via {
        explain.props.push(ExplainProp::plain("via", via.clone()));
    }
    if let Some(filter) = &node.filter {
        explain.props.push(ExplainProp::literal("filter", filter.to_string()));
    }
    if !node.order_by.is_empty() {
        let keys: Vec<String> = node.order_by.iter().map(describe_order).collect();
        explain.props.push(ExplainProp::plain("order", keys.join(",")));
    }
    if let Some(cursor) = &node.cursor {
        let values: Vec<Value> = cursor.iter().map(|(_, value)| value.clone()).collect();
        let fields: Vec<&str> = cursor.iter().map(|(name, _)| name.as_str()).collect();
        explain.props.push(ExplainProp::plain("cursor_on", fields.join(",")));
        explain.props.push(ExplainProp::literal("cursor", format_tuple(&values)));
    }
    if node.skip > 0 {
        explain.props.push(ExplainProp::plain("skip", node.skip.to_string()));
    }
    if let Some(take) = node.take {
        explain.props.push(ExplainProp::plain("take", take.to_string()));
    }
    if !node.distinct.is_empty() {
        explain.props.push(ExplainProp::plain("distinct", node.distinct.join(",")));
    }
    explain.props.push(ExplainProp::plain("fields", node.scalars.join(",")));
    for count in &node.counts {
        let value = match &count.filter {
            Some(filter) => format!("{}[{filter}]", count.relation),
            None => count.relation.clone(),
        };
        explain.props.push(ExplainProp::literal("count", value));
    }
    explain.inputs = node
        .children
        .iter()
        .map(|child| explain_node(nodes, *child))
        .collect();
    explain
}

fn describe_order(order: &OrderBy) -> String {
    let direction = match order.direction {
        SortOrder::Asc => "asc",
        SortOrder::Desc => "desc",
    };
    let nulls = match order.nulls_order() {
        NullsOrder::First => "nulls first",
        NullsOrder::Last => "nulls last",
    };
    format!("{} {direction} {nulls}", order.field)
}

fn hash_plan(nodes: &[QueryNode]) -> u64 {
    let mut hasher = Xxh64::new(0);
    hash_node(nodes, 0, &mut hasher);
    hasher.finish()
}

fn hash_node(nodes: &[QueryNode], id: usize, hasher: &mut Xxh64) {
    let node = &nodes[id];
    hasher.write(node.record_type.as_bytes());
    hasher.write(node.via.as_deref().unwrap_or("").as_bytes());
    match &node.filter {
        Some(filter) => {
            hasher.write_u8(1);
            hash_filter(filter, hasher);
        }
        None => hasher.write_u8(0),
    }
    for order in &node.order_by {
        hasher.write(describe_order(order).as_bytes());
    }
    if let Some(cursor) = &node.cursor {
        for (field, _) in cursor {
            hasher.write(field.as_bytes());
        }
    }
    hasher.write_u64(node.skip as u64);
    hasher.write_i64(node.take.unwrap_or(i64::MIN));
    for field in node.distinct.iter().chain(&node.scalars) {
        hasher.write(field.as_bytes());
    }
    for count in &node.counts {
        hasher.write(count.relation.as_bytes());
        if let Some(filter) = &count.filter {
            hash_filter(filter, hasher);
        }
    }
    hasher.write_u64(node.children.len() as u64);
    for child in &node.children {
        hash_node(nodes, *child, hasher);
    }
}

/// Hashes the structure of a filter; operand values do not contribute.
fn hash_filter(filter: &Filter, hasher: &mut Xxh64) {
    match filter {
        Filter::And(children) | Filter::Or(children) | Filter::Not(children) => {
            hasher.write_u8(match filter {
                Filter::And(_) => 1,
                Filter::Or(_) => 2,
                _ => 3,
            });
            hasher.write_u64(children.len() as u64);
            for child in children {
                hash_filter(child, hasher);
            }
        }
        Filter::Field { field, op, mode } => {
            hasher.write_u8(4);
            hasher.write(field.as_bytes());
            hasher.write(op.name().as_bytes());
            hasher.write_u8(*mode as u8);
        }
        Filter::Relation {
            relation,
            predicate,
        } => {
            hasher.write_u8(5);
            hasher.write(relation.as_bytes());
            hasher.write(predicate.name().as_bytes());
            match predicate {
                RelationPredicate::Some(inner)
                | RelationPredicate::Every(inner)
                | RelationPredicate::None(inner)
                | RelationPredicate::Is(Some(inner))
                | RelationPredicate::IsNot(Some(inner)) => hash_filter(inner, hasher),
                RelationPredicate::Is(None) | RelationPredicate::IsNot(None) => hasher.write_u8(0),
            }
        }
    }
}
