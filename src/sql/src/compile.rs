// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Lowering from the query AST to an operator pipeline.
//!
//! The lowering walks the AST once: the queried table becomes a source,
//! joins recurse into child pipelines, `AND` stacks filters, `OR` branches
//! the stream and rejoins it through concat-then-distinct, grouping lowers
//! to a reduction, and the root is always an ordered tree view. All
//! validation happens here; a pipeline that compiles will not fail at
//! runtime on query-shape grounds.

use std::collections::{BTreeMap, BTreeSet};

use lens_compute::{
    Aggregate, ArrayAgg, Avg, Catch, Concat, Count, Distinct, Filter, Join, JoinKind, Max,
    MemorySource, MemoryStorage, Min, Operator, OperatorId, Pipeline, PipelineBuilder,
    PipelineError, Reduce, Sum, TreeView,
};
use lens_repr::{ColumnName, RelationDesc, ScalarType, SortOrder, VERSION_COLUMN};
use lens_storage_types::TableRef;

use crate::ast::{self, Ast, Condition, DistinctSpec};
use crate::condition::{ColumnResolver, CompiledCondition};
use crate::like::LikeError;

/// The default schema for unqualified table names.
const DEFAULT_SCHEMA: &str = "public";

/// A query rejected at compile time.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    /// The AST names a table that is not replicated.
    #[error("unknown table {0}")]
    UnknownTable(TableRef),
    /// The AST names a column its table does not have.
    #[error("unknown column {column:?}")]
    UnknownColumn {
        /// The offending column.
        column: String,
    },
    /// The limit is negative or fractional.
    #[error("limit must be a non-negative integer, got {0}")]
    BadLimit(serde_json::Number),
    /// An ordered comparison across incompatible types.
    #[error("cannot order-compare column {column:?} of type {column_type} against {literal}")]
    CrossTypeComparison {
        /// The compared column.
        column: String,
        /// Its declared type.
        column_type: ScalarType,
        /// The literal it was compared against.
        literal: String,
    },
    /// A literal of the wrong shape for its operator.
    #[error("operator {op} cannot take literal {value}")]
    BadLiteral {
        /// The operator.
        op: &'static str,
        /// The literal.
        value: serde_json::Value,
    },
    /// `min`/`max`/`array` need grouping to be meaningful.
    #[error("aggregate {0} requires a groupBy")]
    AggregateRequiresGroupBy(&'static str),
    /// Every aggregate except `count` needs a field.
    #[error("aggregate {0} requires a field")]
    AggregateRequiresField(&'static str),
    /// Grouping, ordering, and limits are not supported inside joined
    /// subqueries.
    #[error("{0} is not supported in a joined subquery")]
    UnsupportedInSubquery(&'static str),
    /// A malformed `LIKE` pattern.
    #[error(transparent)]
    BadLikePattern(#[from] LikeError),
    /// An internal graph construction error; indicates a compiler bug.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Describes how pipeline output nodes map back onto tables, so that the
/// view syncer can attribute every node (and its relationship children) to
/// a `(table, key, columns)` triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultShape {
    /// The table the nodes at this level belong to.
    pub table: TableRef,
    /// The identity columns of nodes at this level.
    pub key: Vec<ColumnName>,
    /// The client-visible columns, including the key and version columns.
    pub columns: Vec<ColumnName>,
    /// Shapes of the named relationships below this level.
    pub relationships: BTreeMap<String, ResultShape>,
    /// Whether this level is hidden from clients.
    pub hidden: bool,
}

/// A compiled query: the pipeline plus the metadata the view syncer needs
/// to diff and project its results.
#[derive(Debug)]
pub struct CompiledQuery {
    /// The operator pipeline, not yet hydrated.
    pub pipeline: Pipeline,
    /// How results map back onto tables.
    pub shape: ResultShape,
    /// Every column the query reads, per table: the union of selected,
    /// filtered, joined, grouped, and ordered columns.
    pub footprint: BTreeMap<TableRef, BTreeSet<String>>,
    /// Whether the query is singular.
    pub one: bool,
}

/// Compiles an AST against the replicated schema.
pub fn compile(
    ast: &Ast,
    schemas: &BTreeMap<TableRef, RelationDesc>,
) -> Result<CompiledQuery, CompileError> {
    let mut ctx = Context {
        builder: PipelineBuilder::new(),
        schemas,
        sources: BTreeMap::new(),
        footprint: BTreeMap::new(),
    };
    let level = compile_level(ast, &mut ctx, true)?;

    let limit = match &ast.limit {
        Some(n) => match n.as_u64() {
            Some(n) => Some(n as usize),
            None => return Err(CompileError::BadLimit(n.clone())),
        },
        None => None,
    };
    let limit = match (ast.one, limit) {
        (true, Some(0)) => Some(0),
        (true, _) => Some(1),
        (false, l) => l,
    };

    let mut order_by = Vec::new();
    for term in &ast.order_by {
        if !level.columns_available.contains(term.field.as_str()) {
            return Err(CompileError::UnknownColumn {
                column: term.field.clone(),
            });
        }
        ctx.note(&level.shape.table, [term.field.clone()]);
        let direction = match term.direction {
            ast::Direction::Asc => SortOrder::Asc,
            ast::Direction::Desc => SortOrder::Desc,
        };
        order_by.push((ColumnName::from(term.field.clone()), direction));
    }

    let view = TreeView::new(order_by, level.shape.key.clone(), limit);
    let root = ctx.builder.add(Operator::View(view), vec![level.op])?;
    Ok(CompiledQuery {
        pipeline: ctx.builder.finish(root)?,
        shape: level.shape,
        footprint: ctx.footprint,
        one: ast.one,
    })
}

/// Compiles an AST into a pipeline rooted at a [`Catch`] sink instead of a
/// view, for tests that assert on raw deltas.
pub fn compile_to_catch(
    ast: &Ast,
    schemas: &BTreeMap<TableRef, RelationDesc>,
) -> Result<CompiledQuery, CompileError> {
    let mut ctx = Context {
        builder: PipelineBuilder::new(),
        schemas,
        sources: BTreeMap::new(),
        footprint: BTreeMap::new(),
    };
    let level = compile_level(ast, &mut ctx, true)?;
    let root = ctx
        .builder
        .add(Operator::Catch(Catch::new()), vec![level.op])?;
    Ok(CompiledQuery {
        pipeline: ctx.builder.finish(root)?,
        shape: level.shape,
        footprint: ctx.footprint,
        one: ast.one,
    })
}

struct Context<'a> {
    builder: PipelineBuilder,
    schemas: &'a BTreeMap<TableRef, RelationDesc>,
    sources: BTreeMap<TableRef, OperatorId>,
    footprint: BTreeMap<TableRef, BTreeSet<String>>,
}

impl<'a> Context<'a> {
    fn source(&mut self, table: &TableRef) -> Result<(OperatorId, &'a RelationDesc), CompileError> {
        let desc = self
            .schemas
            .get(table)
            .ok_or_else(|| CompileError::UnknownTable(table.clone()))?;
        let id = match self.sources.get(table) {
            Some(id) => *id,
            None => {
                let id = self.builder.add_source(MemorySource::new(desc.clone()));
                self.sources.insert(table.clone(), id);
                id
            }
        };
        Ok((id, desc))
    }

    fn note(&mut self, table: &TableRef, columns: impl IntoIterator<Item = String>) {
        self.footprint
            .entry(table.clone())
            .or_default()
            .extend(columns);
    }
}

struct Level {
    op: OperatorId,
    shape: ResultShape,
    /// The columns conditions and orderings at this level may reference.
    columns_available: BTreeSet<String>,
}

fn compile_level(ast: &Ast, ctx: &mut Context, top: bool) -> Result<Level, CompileError> {
    if !top {
        if ast.group_by.is_some() || !ast.aggregates.is_empty() {
            return Err(CompileError::UnsupportedInSubquery("groupBy"));
        }
        if ast.having.is_some() {
            return Err(CompileError::UnsupportedInSubquery("having"));
        }
        if ast.distinct.is_some() {
            return Err(CompileError::UnsupportedInSubquery("distinct"));
        }
        if !ast.order_by.is_empty() || ast.limit.is_some() || ast.one {
            return Err(CompileError::UnsupportedInSubquery("orderBy/limit"));
        }
    }

    let table = TableRef::new(
        ast.schema.clone().unwrap_or_else(|| DEFAULT_SCHEMA.into()),
        ast.table.clone(),
    );
    let (source_op, desc) = ctx.source(&table)?;
    let key: Vec<ColumnName> = desc.key().to_vec();

    // Validate the projection and derive the client-visible column list.
    let mut columns: Vec<ColumnName> = Vec::new();
    match &ast.select {
        Some(select) => {
            for col in select {
                if !desc.has_column(col) {
                    return Err(CompileError::UnknownColumn { column: col.clone() });
                }
                columns.push(ColumnName::from(col.clone()));
            }
            for k in &key {
                if !columns.contains(k) {
                    columns.push(k.clone());
                }
            }
            let version = ColumnName::from(VERSION_COLUMN);
            if desc.has_column(VERSION_COLUMN) && !columns.contains(&version) {
                columns.push(version);
            }
        }
        None => {
            columns.extend(desc.columns().iter().map(|(name, _)| name.clone()));
        }
    }
    ctx.note(&table, columns.iter().map(|c| c.as_str().to_owned()));
    ctx.note(&table, key.iter().map(|c| c.as_str().to_owned()));

    let mut current = source_op;
    let mut relationships = BTreeMap::new();

    // Joins first, in declaration order; each reads a recursively compiled
    // child pipeline.
    for join in &ast.joins {
        let (parent_col, child_col) = (&join.on.0, &join.on.1);
        if !desc.has_column(parent_col) {
            return Err(CompileError::UnknownColumn {
                column: parent_col.clone(),
            });
        }
        let child = compile_level(&join.other, ctx, false)?;
        if !child.columns_available.contains(child_col.as_str()) {
            return Err(CompileError::UnknownColumn {
                column: child_col.clone(),
            });
        }
        ctx.note(&table, [parent_col.clone()]);
        ctx.note(&child.shape.table, [child_col.clone()]);
        let kind = match join.kind {
            ast::JoinKind::Inner => JoinKind::Inner,
            ast::JoinKind::Left => JoinKind::Left,
        };
        let op = Join::new(
            kind,
            join.alias.clone(),
            ColumnName::from(parent_col.clone()),
            ColumnName::from(child_col.clone()),
            key.clone(),
            child.shape.key.clone(),
            MemoryStorage::default(),
            join.hidden,
        );
        current = ctx
            .builder
            .add(Operator::Join(op), vec![current, child.op])?;
        let mut child_shape = child.shape;
        child_shape.hidden = join.hidden;
        relationships.insert(join.alias.clone(), child_shape);
    }

    // Then the where clause.
    if let Some(where_clause) = &ast.where_clause {
        let cols = CompiledCondition::compile(where_clause, desc)?.columns();
        ctx.note(&table, cols);
        current = apply_condition(ctx, current, where_clause, desc, &key)?;
    }

    let mut shape = ResultShape {
        table: table.clone(),
        key: key.clone(),
        columns,
        relationships,
        hidden: false,
    };
    let mut columns_available: BTreeSet<String> = desc
        .columns()
        .iter()
        .map(|(name, _)| name.as_str().to_owned())
        .collect();

    // Grouping and aggregation.
    if ast.group_by.is_some() || !ast.aggregates.is_empty() {
        let group_by = ast.group_by.clone().unwrap_or_default();
        for col in &group_by {
            if !desc.has_column(col) {
                return Err(CompileError::UnknownColumn { column: col.clone() });
            }
        }
        ctx.note(&table, group_by.iter().cloned());
        let mut aggregates: Vec<Box<dyn Aggregate>> = Vec::new();
        for call in &ast.aggregates {
            aggregates.push(lower_aggregate(call, &group_by, desc, ctx, &table)?);
        }
        let group_cols: Vec<ColumnName> =
            group_by.iter().map(|c| ColumnName::from(c.clone())).collect();
        let reduce = Reduce::new(group_cols.clone(), key.clone(), aggregates);
        current = ctx.builder.add(Operator::Reduce(reduce), vec![current])?;

        // Reduced output rows consist of the group columns and aliases.
        columns_available = group_by.iter().cloned().collect();
        columns_available.extend(ast.aggregates.iter().map(|a| a.alias.clone()));
        shape.key = group_cols.clone();
        shape.columns = columns_available
            .iter()
            .map(|c| ColumnName::from(c.clone()))
            .collect();

        if let Some(having) = &ast.having {
            current = apply_condition(ctx, current, having, &columns_available, &group_cols)?;
        }
    } else if let Some(having) = &ast.having {
        // `having` without aggregation degenerates to a filter.
        let cols = CompiledCondition::compile(having, desc)?.columns();
        ctx.note(&table, cols);
        current = apply_condition(ctx, current, having, desc, &key)?;
    }

    // Deduplication.
    if let Some(spec) = &ast.distinct {
        let distinct_key = match spec {
            DistinctSpec::Row(_) => shape.key.clone(),
            DistinctSpec::Column(col) => {
                if !columns_available.contains(col.as_str()) {
                    return Err(CompileError::UnknownColumn { column: col.clone() });
                }
                ctx.note(&table, [col.clone()]);
                vec![ColumnName::from(col.clone())]
            }
        };
        current = ctx
            .builder
            .add(Operator::Distinct(Distinct::new(distinct_key)), vec![current])?;
    }

    Ok(Level {
        op: current,
        shape,
        columns_available,
    })
}

fn lower_aggregate(
    call: &ast::AggregateCall,
    group_by: &[String],
    desc: &RelationDesc,
    ctx: &mut Context,
    table: &TableRef,
) -> Result<Box<dyn Aggregate>, CompileError> {
    let mut field = |name: &'static str| -> Result<ColumnName, CompileError> {
        let field = call
            .field
            .as_ref()
            .ok_or(CompileError::AggregateRequiresField(name))?;
        if !desc.has_column(field) {
            return Err(CompileError::UnknownColumn {
                column: field.clone(),
            });
        }
        ctx.note(table, [field.clone()]);
        Ok(ColumnName::from(field.clone()))
    };
    let grouped = |name: &'static str| -> Result<(), CompileError> {
        if group_by.is_empty() {
            Err(CompileError::AggregateRequiresGroupBy(name))
        } else {
            Ok(())
        }
    };
    let alias = ColumnName::from(call.alias.clone());
    Ok(match call.aggregate {
        ast::AggregateFunc::Count => Box::new(Count { alias }),
        ast::AggregateFunc::Sum => Box::new(Sum {
            field: field("sum")?,
            alias,
        }),
        ast::AggregateFunc::Avg => Box::new(Avg {
            field: field("avg")?,
            alias,
        }),
        ast::AggregateFunc::Min => {
            grouped("min")?;
            Box::new(Min {
                field: field("min")?,
                alias,
            })
        }
        ast::AggregateFunc::Max => {
            grouped("max")?;
            Box::new(Max {
                field: field("max")?,
                alias,
            })
        }
        ast::AggregateFunc::Array => {
            grouped("array")?;
            Box::new(ArrayAgg {
                field: field("array")?,
                alias,
            })
        }
    })
}

fn apply_condition(
    ctx: &mut Context,
    input: OperatorId,
    condition: &Condition,
    resolver: &dyn ColumnResolver,
    identity: &[ColumnName],
) -> Result<OperatorId, CompileError> {
    match condition {
        // AND composes by stacking filters.
        Condition::And { conditions } => {
            let mut current = input;
            for c in conditions {
                current = apply_condition(ctx, current, c, resolver, identity)?;
            }
            Ok(current)
        }
        // OR branches the stream, filters each branch, concatenates, and
        // deduplicates.
        Condition::Or { conditions } => {
            let mut branches = Vec::with_capacity(conditions.len());
            for c in conditions {
                branches.push(apply_condition(ctx, input, c, resolver, identity)?);
            }
            let concat = ctx.builder.add(Operator::Concat(Concat), branches)?;
            let distinct = Distinct::new(identity.to_vec());
            Ok(ctx
                .builder
                .add(Operator::Distinct(distinct), vec![concat])?)
        }
        Condition::Simple { .. } => {
            let compiled = CompiledCondition::compile(condition, resolver)?;
            Ok(ctx
                .builder
                .add(Operator::Filter(Filter::new(Box::new(compiled))), vec![input])?)
        }
    }
}
