//! Executes an [`ExecutionPlan`] against a [`RecordStore`] view.
//!
//! The root node is scanned, filtered, ordered, de-duplicated and windowed;
//! included relations are then resolved level by level (or row by row, per
//! [`TraversalStrategy`]) under a fan-out budget. Relation lookups go through
//! [`Reader`], which caches scans and key indexes for the lifetime of one
//! request.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::trace;

use crate::error::{EngineError, Result};
use crate::query::ast::{NullsOrder, OrderBy, SortOrder};
use crate::query::eval::{evaluate, RelationResolver};
use crate::query::filter::Filter;
use crate::query::planner::{ExecutionPlan, QueryNode, TraversalStrategy};
use crate::query::value::{Value, ValueKey};
use crate::schema::{Cardinality, RecordType, RelationField, RelationLink, Schema};
use crate::storage::{ReadView, Record, RecordStore};

/// Result row: output scalars plus nested relation objects.
pub type Row = BTreeMap<String, Value>;

type IndexKey = SmallVec<[ValueKey; 2]>;
type KeyIndex = FxHashMap<IndexKey, Vec<usize>>;

/// Request-scoped, cached access to the records visible in one view.
pub struct Reader<'a> {
    schema: &'a Schema,
    store: &'a dyn RecordStore,
    view: ReadView,
    scans: FxHashMap<String, Rc<Vec<Record>>>,
    indexes: FxHashMap<(String, Vec<String>), Rc<KeyIndex>>,
}

impl<'a> Reader<'a> {
    /// Creates a reader over `store` as seen by `view`.
    pub fn new(schema: &'a Schema, store: &'a dyn RecordStore, view: ReadView) -> Self {
        Self {
            schema,
            store,
            view,
            scans: FxHashMap::default(),
            indexes: FxHashMap::default(),
        }
    }

    /// Schema the reader resolves relations with.
    pub fn schema(&self) -> &'a Schema {
        self.schema
    }

    /// View every read goes through.
    pub fn view(&self) -> ReadView {
        self.view
    }

    /// Drops cached scans; required after writing through the same view.
    pub fn invalidate(&mut self) {
        self.scans.clear();
        self.indexes.clear();
    }

    /// Every visible record of `record_type`, in store order.
    pub fn scan(&mut self, record_type: &str) -> Result<Rc<Vec<Record>>> {
        if let Some(records) = self.scans.get(record_type) {
            return Ok(Rc::clone(records));
        }
        let records = Rc::new(self.store.scan(record_type, &self.view)?);
        trace!(record_type, records = records.len(), "reader.scan");
        self.scans.insert(record_type.to_owned(), Rc::clone(&records));
        Ok(records)
    }

    /// Records of `record_type` whose `fields` equal `key`. A key containing
    /// null matches nothing.
    pub fn lookup(&mut self, record_type: &str, fields: &[String], key: &[Value]) -> Result<Vec<Record>> {
        if key.iter().any(Value::is_null) {
            return Ok(Vec::new());
        }
        let records = self.scan(record_type)?;
        let index = self.index(record_type, fields, &records);
        let lookup: IndexKey = key.iter().map(Value::key).collect();
        Ok(index
            .get(&lookup)
            .map(|hits| hits.iter().map(|idx| records[*idx].clone()).collect())
            .unwrap_or_default())
    }

    fn index(&mut self, record_type: &str, fields: &[String], records: &[Record]) -> Rc<KeyIndex> {
        let cache_key = (record_type.to_owned(), fields.to_vec());
        if let Some(index) = self.indexes.get(&cache_key) {
            return Rc::clone(index);
        }
        let mut index = KeyIndex::default();
        for (idx, record) in records.iter().enumerate() {
            let key: IndexKey = fields.iter().map(|f| record.value(f).key()).collect();
            index.entry(key).or_default().push(idx);
        }
        let index = Rc::new(index);
        self.indexes.insert(cache_key, Rc::clone(&index));
        index
    }

    /// Records of `record_type` that satisfy `filter`, in store order.
    pub fn matching(&mut self, record_type: &RecordType, filter: Option<&Filter>) -> Result<Vec<Record>> {
        let records = self.scan(&record_type.name)?;
        let Some(filter) = filter else {
            return Ok(records.as_ref().clone());
        };
        let schema = self.schema;
        let mut hits = Vec::new();
        for record in records.iter() {
            if evaluate(schema, record_type, filter, record, self)? {
                hits.push(record.clone());
            }
        }
        Ok(hits)
    }

    /// Records related to `record` through `relation` declared on `owner`.
    pub fn related(
        &mut self,
        owner: &RecordType,
        relation: &RelationField,
        record: &Record,
    ) -> Result<Vec<Record>> {
        let schema = self.schema;
        match &relation.link {
            RelationLink::ForeignKey {
                fields, references, ..
            } => self.lookup(&relation.target, references, &record.tuple(fields)),
            RelationLink::Inverse => {
                let backing = schema.backing_foreign_key(owner, relation)?;
                let Some((fields, references, _)) = backing.foreign_key() else {
                    return Err(EngineError::relation_not_loadable(&owner.name, &relation.name));
                };
                self.lookup(&relation.target, fields, &record.tuple(references))
            }
            RelationLink::Through {
                join_type,
                near,
                far,
            } => {
                let join = schema.record_type(join_type)?;
                let (near_fields, near_refs) = owning_fields(join, near)?;
                let (far_fields, far_refs) = owning_fields(join, far)?;
                let links = self.lookup(join_type, &near_fields, &record.tuple(&near_refs))?;
                let mut related = Vec::with_capacity(links.len());
                for link in &links {
                    related.extend(self.lookup(&relation.target, &far_refs, &link.tuple(&far_fields))?);
                }
                Ok(related)
            }
        }
    }
}

impl RelationResolver for Reader<'_> {
    fn related(&mut self, owner: &RecordType, relation: &RelationField, record: &Record) -> Result<Vec<Record>> {
        Reader::related(self, owner, relation, record)
    }
}

fn owning_fields(join: &RecordType, relation: &str) -> Result<(Vec<String>, Vec<String>)> {
    join.require_relation(relation)?
        .foreign_key()
        .map(|(fields, references, _)| (fields.to_vec(), references.to_vec()))
        .ok_or_else(|| EngineError::relation_not_loadable(&join.name, relation))
}

/// Cap on related records loaded by one request.
#[derive(Debug, Clone, Copy)]
struct FanoutBudget {
    max: usize,
    loaded: usize,
}

impl FanoutBudget {
    fn charge(&mut self, records: usize) -> Result<()> {
        self.loaded += records;
        if self.loaded > self.max {
            return Err(EngineError::FanoutExceeded {
                loaded: self.loaded,
                max: self.max,
            });
        }
        Ok(())
    }
}

/// Runs one plan.
pub struct Executor<'r, 'a> {
    reader: &'r mut Reader<'a>,
    plan: &'r ExecutionPlan,
    budget: FanoutBudget,
}

impl<'r, 'a> Executor<'r, 'a> {
    /// Prepares to run `plan` through `reader`.
    pub fn new(reader: &'r mut Reader<'a>, plan: &'r ExecutionPlan) -> Self {
        Self {
            reader,
            plan,
            budget: FanoutBudget {
                max: plan.max_fanout,
                loaded: 0,
            },
        }
    }

    /// Scans and windows the root node and projects the result.
    pub fn run(mut self) -> Result<Vec<Row>> {
        let records = self.root_records()?;
        self.materialize(records)
    }

    /// Root records after filter, order, distinct and window, unprojected.
    pub fn root_records(&mut self) -> Result<Vec<Record>> {
        let plan = self.plan;
        let root = plan.root();
        let ty = self.reader.schema().record_type(&root.record_type)?;
        let records = self.reader.matching(ty, root.filter.as_ref())?;
        self.shape(ty, root, records)
    }

    /// Projects `records` of the root type, loading included relations.
    pub fn materialize(&mut self, records: Vec<Record>) -> Result<Vec<Row>> {
        match self.plan.strategy {
            TraversalStrategy::BreadthFirst => self.breadth_first(0, &records),
            TraversalStrategy::DepthFirst => records
                .iter()
                .map(|record| self.depth_first(0, record))
                .collect(),
        }
    }

    fn shape(&mut self, ty: &RecordType, node: &QueryNode, mut records: Vec<Record>) -> Result<Vec<Record>> {
        sort_records(&mut records, &node.order_by);
        if !node.distinct.is_empty() {
            let mut seen = FxHashSet::default();
            records.retain(|record| {
                let key: Vec<ValueKey> = node.distinct.iter().map(|f| record.value(f).key()).collect();
                seen.insert(key)
            });
        }
        let anchor = match &node.cursor {
            Some(cursor) => Some(self.cursor_position(ty, node, cursor, &records)?),
            None => None,
        };
        Ok(apply_window(records, anchor, node.skip, node.take))
    }

    fn cursor_position(
        &mut self,
        ty: &RecordType,
        node: &QueryNode,
        cursor: &[(String, Value)],
        records: &[Record],
    ) -> Result<usize> {
        let fields: Vec<String> = cursor.iter().map(|(f, _)| f.clone()).collect();
        let values: Vec<Value> = cursor.iter().map(|(_, v)| v.clone()).collect();
        let Some(anchor) = self.reader.lookup(&ty.name, &fields, &values)?.into_iter().next() else {
            let rendered: Vec<String> = cursor.iter().map(|(f, v)| format!("{f}: {v}")).collect();
            return Err(EngineError::CursorNotFound {
                record_type: ty.name.clone(),
                cursor: format!("{{{}}}", rendered.join(", ")),
            });
        };
        if let Some(idx) = records.iter().position(|r| r.id == anchor.id) {
            return Ok(idx);
        }
        // filtered out: anchor at the position it would sort into
        Ok(records
            .iter()
            .position(|r| compare_records(&node.order_by, r, &anchor) == Ordering::Greater)
            .unwrap_or(records.len()))
    }

    fn related_rows(&mut self, node: &QueryNode, parent: &Record) -> Result<Vec<Record>> {
        let plan = self.plan;
        let parent_node = node.parent.map(|idx| plan.node(idx));
        let (Some(parent_node), Some(via)) = (parent_node, node.via.as_deref()) else {
            return Ok(Vec::new());
        };
        let schema = self.reader.schema();
        let owner = schema.record_type(&parent_node.record_type)?;
        let relation = owner.require_relation(via)?;
        let target = schema.record_type(&node.record_type)?;
        let mut related = self.reader.related(owner, relation, parent)?;
        if let Some(filter) = &node.filter {
            let mut kept = Vec::with_capacity(related.len());
            for record in related {
                if evaluate(schema, target, filter, &record, &mut *self.reader)? {
                    kept.push(record);
                }
            }
            related = kept;
        }
        let related = self.shape(target, node, related)?;
        self.budget.charge(related.len())?;
        Ok(related)
    }

    fn counts(&mut self, node: &QueryNode, record: &Record) -> Result<Option<Value>> {
        if node.counts.is_empty() {
            return Ok(None);
        }
        let schema = self.reader.schema();
        let owner = schema.record_type(&node.record_type)?;
        let mut counts = BTreeMap::new();
        for count in &node.counts {
            let relation = owner.require_relation(&count.relation)?;
            let target = schema.record_type(&relation.target)?;
            let related = self.reader.related(owner, relation, record)?;
            let mut hits = 0i64;
            for candidate in &related {
                let matched = match &count.filter {
                    Some(filter) => evaluate(schema, target, filter, candidate, &mut *self.reader)?,
                    None => true,
                };
                if matched {
                    hits += 1;
                }
            }
            counts.insert(count.relation.clone(), Value::Int(hits));
        }
        Ok(Some(Value::Object(counts)))
    }

    fn project(&mut self, node: &QueryNode, record: &Record) -> Result<Row> {
        let mut row: Row = node
            .scalars
            .iter()
            .map(|name| (name.clone(), record.value(name).clone()))
            .collect();
        if let Some(counts) = self.counts(node, record)? {
            row.insert("_count".to_owned(), counts);
        }
        Ok(row)
    }

    fn depth_first(&mut self, id: usize, record: &Record) -> Result<Row> {
        let plan = self.plan;
        let node = plan.node(id);
        let mut row = self.project(node, record)?;
        for child_id in &node.children {
            let child = plan.node(*child_id);
            let related = self.related_rows(child, record)?;
            let rows = related
                .iter()
                .map(|rec| self.depth_first(*child_id, rec))
                .collect::<Result<Vec<_>>>()?;
            insert_relation(&mut row, self.reader.schema(), node, child, rows)?;
        }
        Ok(row)
    }

    fn breadth_first(&mut self, id: usize, records: &[Record]) -> Result<Vec<Row>> {
        let plan = self.plan;
        let node = plan.node(id);
        let mut rows = records
            .iter()
            .map(|record| self.project(node, record))
            .collect::<Result<Vec<_>>>()?;
        for child_id in &node.children {
            let child = plan.node(*child_id);
            let mut sizes = Vec::with_capacity(records.len());
            let mut level = Vec::new();
            for record in records {
                let related = self.related_rows(child, record)?;
                sizes.push(related.len());
                level.extend(related);
            }
            let mut child_rows = self.breadth_first(*child_id, &level)?.into_iter();
            for (row, size) in rows.iter_mut().zip(sizes) {
                let nested: Vec<Row> = child_rows.by_ref().take(size).collect();
                insert_relation(row, self.reader.schema(), node, child, nested)?;
            }
        }
        Ok(rows)
    }
}

fn insert_relation(
    row: &mut Row,
    schema: &Schema,
    parent: &QueryNode,
    child: &QueryNode,
    nested: Vec<Row>,
) -> Result<()> {
    let Some(via) = child.via.as_deref() else {
        return Ok(());
    };
    let relation = schema.record_type(&parent.record_type)?.require_relation(via)?;
    let value = match relation.cardinality {
        Cardinality::One => nested.into_iter().next().map_or(Value::Null, Value::Object),
        Cardinality::Many => Value::List(nested.into_iter().map(Value::Object).collect()),
    };
    row.insert(via.to_owned(), value);
    Ok(())
}

/// Stable sort by the ordering keys; ties keep their incoming order.
pub fn sort_records(records: &mut [Record], order_by: &[OrderBy]) {
    if !order_by.is_empty() {
        records.sort_by(|a, b| compare_by_keys(order_by, a, b));
    }
}

fn compare_by_keys(order_by: &[OrderBy], a: &Record, b: &Record) -> Ordering {
    for key in order_by {
        let ord = compare_values(key, a.value(&key.field), b.value(&key.field));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn compare_records(order_by: &[OrderBy], a: &Record, b: &Record) -> Ordering {
    compare_by_keys(order_by, a, b).then(a.id.cmp(&b.id))
}

/// Compares two values of one ordering key, honoring direction and null
/// placement.
pub fn compare_values(key: &OrderBy, a: &Value, b: &Value) -> Ordering {
    let nulls_first = key.nulls_order() == NullsOrder::First;
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) if nulls_first => Ordering::Less,
        (true, false) => Ordering::Greater,
        (false, true) if nulls_first => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            let ord = a.sort_cmp(b);
            match key.direction {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        }
    }
}

/// Applies `skip`/`take` relative to an optional anchor position.
///
/// Forward pages start at the anchor (inclusive). Backward pages
/// (`take < 0`) end just before it, so the anchor itself is never returned.
/// Without an anchor a backward page counts from the end.
pub fn apply_window<T>(items: Vec<T>, anchor: Option<usize>, skip: usize, take: Option<i64>) -> Vec<T> {
    let len = items.len();
    let (start, end) = match take {
        Some(0) => (0, 0),
        Some(take) if take < 0 => {
            let count = take.unsigned_abs() as usize;
            let end = anchor.unwrap_or(len).saturating_sub(skip);
            (end.saturating_sub(count), end)
        }
        Some(take) => {
            let start = anchor.unwrap_or(0).saturating_add(skip).min(len);
            (start, start.saturating_add(take as usize).min(len))
        }
        None => (anchor.unwrap_or(0).saturating_add(skip).min(len), len),
    };
    items.into_iter().skip(start).take(end - start).collect()
}
