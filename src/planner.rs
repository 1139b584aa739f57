use std::collections::HashMap;

use smallvec::SmallVec;

use crate::dialect::SqlDialect;
use crate::error::{TrellisError, TrellisResult};
use crate::hooks::Hooks;
use crate::predicate::Predicate;
use crate::query::{Direction, FindSpec, RowLock};
use crate::registry::{ColumnType, ModelDefinition, Registry, RelationDefinition};
use crate::sql::SqlBuf;
use crate::value::BindValue;

/// One result column of a planned statement.
#[derive(Debug, Clone)]
pub(crate) struct ProjField {
    pub label: String,
    pub name: String,
    pub ty: ColumnType,
    pub requested: bool,
}

/// The alias-to-output-path map for one node of the query shape.
///
/// `pks` always lists the node's primary-key labels, whether or not the caller
/// requested those columns; the materializer correlates rows through them and
/// strips them from the output when `requested` is false.
#[derive(Debug, Clone)]
pub(crate) struct Projection {
    pub model: String,
    pub fields: Vec<ProjField>,
    pub pks: Vec<(String, ColumnType)>,
    pub nested: Vec<(String, bool, Projection)>,
}

#[derive(Debug)]
struct ColumnIr {
    alias: String,
    stored: String,
    label: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum JoinKind {
    Left,
    Inner,
}

#[derive(Debug)]
struct OnEq {
    self_col: String,
    other_alias: String,
    other_col: String,
}

#[derive(Debug)]
struct JoinIr {
    model: String,
    alias: String,
    kind: JoinKind,
    on: Vec<OnEq>,
    pred: Option<Predicate>,
}

#[derive(Debug)]
struct CorrelationIr {
    alias: String,
    stored: String,
    outer_label: String,
}

#[derive(Debug)]
struct OrderIr {
    alias: String,
    stored: String,
    label: String,
    direction: Direction,
}

#[derive(Debug)]
struct LateralIr {
    sub_alias: String,
    child: SelectIr,
}

/// Transient compile state for one statement. Built fully before any SQL text
/// is emitted; rendering walks it in one pass so parameter order matches
/// placeholder order.
#[derive(Debug)]
struct SelectIr {
    model: String,
    alias: String,
    columns: Vec<ColumnIr>,
    joins: Vec<JoinIr>,
    predicate: Option<Predicate>,
    correlation: Vec<CorrelationIr>,
    laterals: Vec<LateralIr>,
    order: Vec<OrderIr>,
    limit: Option<i64>,
    offset: Option<i64>,
    lock: Option<RowLock>,
}

/// A compiled read: one statement plus the projection map for reassembly.
pub(crate) struct CompiledFind {
    pub sql: String,
    pub params: SmallVec<[BindValue; 8]>,
    pub projection: Projection,
}

/// A compiled count: one aggregate statement.
pub(crate) struct CompiledCount {
    pub sql: String,
    pub params: SmallVec<[BindValue; 8]>,
}

struct ParentLink<'a> {
    relation: &'a RelationDefinition,
    relation_name: String,
    parent_model: String,
    parent_pk_labels: Vec<String>,
}

struct Planner<'r> {
    registry: &'r Registry,
    hooks: &'r Hooks,
    // Threaded through every recursive call so nested statements keep aliases
    // globally unique.
    next_alias: u32,
}

type JoinMap = HashMap<(String, String), String>;

impl<'r> Planner<'r> {
    fn table_alias(&mut self) -> String {
        let alias = format!("t{}", self.next_alias);
        self.next_alias += 1;
        alias
    }

    fn lateral_alias(&mut self) -> String {
        let alias = format!("l{}", self.next_alias);
        self.next_alias += 1;
        alias
    }

    /// Plans one self-contained statement: the top-level query, or the child
    /// side of a to-many relation (correlated through `link`).
    fn plan_statement(
        &mut self,
        model_name: &str,
        spec: &FindSpec,
        link: Option<ParentLink<'_>>,
    ) -> TrellisResult<(SelectIr, Projection)> {
        let registry = self.registry;
        let model = registry.model(model_name)?;
        let alias = self.table_alias();

        let mut ir = SelectIr {
            model: model_name.to_string(),
            alias: alias.clone(),
            columns: Vec::new(),
            joins: Vec::new(),
            predicate: self
                .hooks
                .apply_find_predicate(registry, model_name, spec.predicate.clone()),
            correlation: Vec::new(),
            laterals: Vec::new(),
            order: Vec::new(),
            limit: spec.limit,
            offset: spec.offset,
            lock: spec.lock,
        };

        let mut join_map = JoinMap::new();
        let projection =
            self.plan_columns_and_includes(model, spec, &alias, &mut ir, &mut join_map)?;

        if let Some(link) = &link {
            self.correlate(link, model, &alias, &mut ir)?;
        }

        self.plan_order(model, spec, &alias, &mut ir, &mut join_map)?;
        finalize_order_labels(&mut ir);

        Ok((ir, projection))
    }

    /// Projects the node's columns (primary key always, the rest as selected)
    /// and descends into its includes. To-one children merge into `ir`;
    /// to-many children become correlated lateral statements.
    fn plan_columns_and_includes(
        &mut self,
        model: &'r ModelDefinition,
        spec: &FindSpec,
        alias: &str,
        ir: &mut SelectIr,
        join_map: &mut JoinMap,
    ) -> TrellisResult<Projection> {
        for name in &spec.columns {
            if model.column_by_name(name).is_none() {
                return Err(TrellisError::build(
                    &model.name,
                    format!("unknown column '{}'", name),
                ));
            }
        }

        let select_all = spec.columns.is_empty();
        let requested = |name: &str| select_all || spec.columns.iter().any(|c| c == name);

        let mut projection = Projection {
            model: model.name.clone(),
            fields: Vec::new(),
            pks: Vec::new(),
            nested: Vec::new(),
        };

        for column in &model.columns {
            let wanted = requested(&column.name);
            if !column.primary_key && !wanted {
                continue;
            }
            let label = format!("{}__{}", alias, column.stored);
            ir.columns.push(ColumnIr {
                alias: alias.to_string(),
                stored: column.stored.clone(),
                label: label.clone(),
            });
            if column.primary_key {
                projection.pks.push((label.clone(), column.ty));
            }
            projection.fields.push(ProjField {
                label,
                name: column.name.clone(),
                ty: column.ty,
                requested: wanted,
            });
        }

        for (relation_name, child_spec) in &spec.include {
            let relation = model.relations.get(relation_name).ok_or_else(|| {
                TrellisError::build(
                    &model.name,
                    format!("unknown relation '{}'", relation_name),
                )
            })?;
            match relation {
                RelationDefinition::ToOne { .. } => {
                    let (join_alias, child_projection) = self.plan_to_one(
                        model,
                        alias,
                        relation_name,
                        relation,
                        child_spec,
                        ir,
                        join_map,
                    )?;
                    join_map.insert(
                        (alias.to_string(), relation_name.clone()),
                        join_alias,
                    );
                    projection
                        .nested
                        .push((relation_name.clone(), false, child_projection));
                }
                RelationDefinition::ToMany { .. } | RelationDefinition::ManyToMany { .. } => {
                    let link = ParentLink {
                        relation,
                        relation_name: relation_name.clone(),
                        parent_model: model.name.clone(),
                        parent_pk_labels: projection
                            .pks
                            .iter()
                            .map(|(label, _)| label.clone())
                            .collect(),
                    };
                    let sub_alias = self.lateral_alias();
                    let (child_ir, child_projection) =
                        self.plan_statement(relation.target(), child_spec, Some(link))?;
                    ir.laterals.push(LateralIr {
                        sub_alias,
                        child: child_ir,
                    });
                    projection
                        .nested
                        .push((relation_name.clone(), true, child_projection));
                }
            }
        }

        Ok(projection)
    }

    /// Merges a to-one relation into the enclosing statement as a LEFT JOIN.
    #[allow(clippy::too_many_arguments)]
    fn plan_to_one(
        &mut self,
        parent: &'r ModelDefinition,
        parent_alias: &str,
        relation_name: &str,
        relation: &RelationDefinition,
        child_spec: &FindSpec,
        ir: &mut SelectIr,
        join_map: &mut JoinMap,
    ) -> TrellisResult<(String, Projection)> {
        if !child_spec.order_by.is_empty()
            || child_spec.limit.is_some()
            || child_spec.offset.is_some()
            || child_spec.lock.is_some()
        {
            return Err(TrellisError::build(
                &parent.name,
                format!(
                    "relation '{}' is to-one; ordering, pagination and locks are not allowed on it",
                    relation_name
                ),
            ));
        }

        let RelationDefinition::ToOne { model: target_name, fk_columns } = relation else {
            return Err(TrellisError::build(&parent.name, "expected a to-one relation"));
        };
        let registry = self.registry;
        let target = registry.model(target_name)?;

        let join_alias = self.join_to_one(
            parent,
            parent_alias,
            relation_name,
            target,
            fk_columns,
            child_spec.predicate.clone(),
            ir,
        )?;
        let child_projection =
            self.plan_columns_and_includes(target, child_spec, &join_alias, ir, join_map)?;
        Ok((join_alias, child_projection))
    }

    /// Builds the LEFT JOIN for a to-one edge, folding the child's (possibly
    /// middleware-injected) predicate into the ON clause so a filtered-out
    /// child nulls the nested object instead of dropping the parent row.
    #[allow(clippy::too_many_arguments)]
    fn join_to_one(
        &mut self,
        parent: &ModelDefinition,
        parent_alias: &str,
        relation_name: &str,
        target: &ModelDefinition,
        fk_columns: &[String],
        child_predicate: Option<Predicate>,
        ir: &mut SelectIr,
    ) -> TrellisResult<String> {
        let target_pk = target.primary_key();
        if fk_columns.len() != target_pk.len() {
            return Err(TrellisError::build(
                &parent.name,
                format!(
                    "relation '{}' has {} foreign-key columns but '{}' has {} primary-key columns",
                    relation_name,
                    fk_columns.len(),
                    target.name,
                    target_pk.len()
                ),
            ));
        }

        let join_alias = self.table_alias();
        let mut on = Vec::with_capacity(fk_columns.len());
        for (fk, pk) in fk_columns.iter().zip(target_pk.iter()) {
            let fk_column = parent.column_by_name(fk).ok_or_else(|| {
                TrellisError::build(
                    &parent.name,
                    format!("relation '{}' references unknown column '{}'", relation_name, fk),
                )
            })?;
            on.push(OnEq {
                self_col: pk.stored.clone(),
                other_alias: parent_alias.to_string(),
                other_col: fk_column.stored.clone(),
            });
        }

        ir.joins.push(JoinIr {
            model: target.name.clone(),
            alias: join_alias.clone(),
            kind: JoinKind::Left,
            on,
            pred: self
                .hooks
                .apply_find_predicate(self.registry, &target.name, child_predicate),
        });
        Ok(join_alias)
    }

    /// Adds the correlation of a to-many (or many-to-many) child statement
    /// against the parent statement's driving set.
    fn correlate(
        &mut self,
        link: &ParentLink<'_>,
        child: &ModelDefinition,
        child_alias: &str,
        ir: &mut SelectIr,
    ) -> TrellisResult<()> {
        let registry = self.registry;
        let parent = registry.model(&link.parent_model)?;
        let parent_pk = parent.primary_key();

        match link.relation {
            RelationDefinition::ToMany { fk_columns, .. } => {
                if fk_columns.len() != parent_pk.len() {
                    return Err(relation_arity_error(parent, &link.relation_name, fk_columns.len(), parent_pk.len()));
                }
                for (fk, label) in fk_columns.iter().zip(link.parent_pk_labels.iter()) {
                    let fk_column = child.column_by_name(fk).ok_or_else(|| {
                        TrellisError::build(
                            &parent.name,
                            format!(
                                "relation '{}' references unknown column '{}' on '{}'",
                                link.relation_name, fk, child.name
                            ),
                        )
                    })?;
                    ir.correlation.push(CorrelationIr {
                        alias: child_alias.to_string(),
                        stored: fk_column.stored.clone(),
                        outer_label: label.clone(),
                    });
                }
            }
            RelationDefinition::ManyToMany {
                through,
                fk_self,
                fk_target,
                ..
            } => {
                let through_model = registry.model(through)?;
                let child_pk = child.primary_key();
                if fk_self.len() != parent_pk.len() {
                    return Err(relation_arity_error(parent, &link.relation_name, fk_self.len(), parent_pk.len()));
                }
                if fk_target.len() != child_pk.len() {
                    return Err(relation_arity_error(parent, &link.relation_name, fk_target.len(), child_pk.len()));
                }

                let through_alias = self.table_alias();
                let mut on = Vec::with_capacity(fk_target.len());
                for (fk, pk) in fk_target.iter().zip(child_pk.iter()) {
                    let fk_column = through_model.column_by_name(fk).ok_or_else(|| {
                        TrellisError::build(
                            &parent.name,
                            format!(
                                "relation '{}' references unknown column '{}' on '{}'",
                                link.relation_name, fk, through_model.name
                            ),
                        )
                    })?;
                    on.push(OnEq {
                        self_col: fk_column.stored.clone(),
                        other_alias: child_alias.to_string(),
                        other_col: pk.stored.clone(),
                    });
                }
                ir.joins.push(JoinIr {
                    model: through_model.name.clone(),
                    alias: through_alias.clone(),
                    kind: JoinKind::Inner,
                    on,
                    pred: None,
                });

                for (fk, label) in fk_self.iter().zip(link.parent_pk_labels.iter()) {
                    let fk_column = through_model.column_by_name(fk).ok_or_else(|| {
                        TrellisError::build(
                            &parent.name,
                            format!(
                                "relation '{}' references unknown column '{}' on '{}'",
                                link.relation_name, fk, through_model.name
                            ),
                        )
                    })?;
                    ir.correlation.push(CorrelationIr {
                        alias: through_alias.clone(),
                        stored: fk_column.stored.clone(),
                        outer_label: label.clone(),
                    });
                }
            }
            RelationDefinition::ToOne { .. } => {
                return Err(TrellisError::build(
                    &parent.name,
                    format!("relation '{}' cannot be correlated laterally", link.relation_name),
                ));
            }
        }
        Ok(())
    }

    /// Resolves order-by paths, joining to-one relations along the path
    /// without projecting them.
    fn plan_order(
        &mut self,
        model: &'r ModelDefinition,
        spec: &FindSpec,
        alias: &str,
        ir: &mut SelectIr,
        join_map: &mut JoinMap,
    ) -> TrellisResult<()> {
        let registry = self.registry;
        for order in &spec.order_by {
            let Some((column_name, relation_path)) = order.path.split_last() else {
                return Err(TrellisError::build(&model.name, "empty order-by path"));
            };

            let mut current_model = model;
            let mut current_alias = alias.to_string();
            for segment in relation_path {
                let relation = current_model.relations.get(segment).ok_or_else(|| {
                    TrellisError::build(
                        &current_model.name,
                        format!("unknown relation '{}' in order-by path", segment),
                    )
                })?;
                let RelationDefinition::ToOne { model: target_name, fk_columns } = relation else {
                    return Err(TrellisError::build(
                        &current_model.name,
                        format!("order-by path crosses non-to-one relation '{}'", segment),
                    ));
                };
                let target = registry.model(target_name)?;
                let key = (current_alias.clone(), segment.clone());
                let join_alias = match join_map.get(&key) {
                    Some(existing) => existing.clone(),
                    None => {
                        let created = self.join_to_one(
                            current_model,
                            &current_alias,
                            segment,
                            target,
                            fk_columns,
                            None,
                            ir,
                        )?;
                        join_map.insert(key, created.clone());
                        created
                    }
                };
                current_model = target;
                current_alias = join_alias;
            }

            let column = current_model.column_by_name(column_name).ok_or_else(|| {
                TrellisError::build(
                    &current_model.name,
                    format!("unknown column '{}' in order-by", column_name),
                )
            })?;
            ir.order.push(OrderIr {
                alias: current_alias,
                stored: column.stored.clone(),
                label: String::new(),
                direction: order.direction,
            });
        }
        Ok(())
    }
}

fn relation_arity_error(
    model: &ModelDefinition,
    relation: &str,
    fk_count: usize,
    pk_count: usize,
) -> TrellisError {
    TrellisError::build(
        &model.name,
        format!(
            "relation '{}' has {} foreign-key columns for {} primary-key columns",
            relation, fk_count, pk_count
        ),
    )
}

/// When the statement gains laterals its rows are re-ordered by the outer
/// query, so every order target must be projected (hidden if not requested)
/// for the outer ORDER BY to reference.
fn finalize_order_labels(ir: &mut SelectIr) {
    if ir.laterals.is_empty() {
        return;
    }
    for i in 0..ir.order.len() {
        let (alias, stored) = (ir.order[i].alias.clone(), ir.order[i].stored.clone());
        let label = match ir
            .columns
            .iter()
            .find(|c| c.alias == alias && c.stored == stored)
        {
            Some(column) => column.label.clone(),
            None => {
                let label = format!("{}__{}", alias, stored);
                ir.columns.push(ColumnIr {
                    alias,
                    stored,
                    label: label.clone(),
                });
                label
            }
        };
        ir.order[i].label = label;
    }
}

fn table_sql<DB: SqlDialect>(model: &ModelDefinition) -> String {
    match &model.schema {
        Some(schema) => format!(
            "{}.{}",
            DB::quote_identifier(schema),
            DB::quote_identifier(&model.table)
        ),
        None => DB::quote_identifier(&model.table),
    }
}

fn render_flat<DB: SqlDialect>(
    registry: &Registry,
    ir: &SelectIr,
    buf: &mut SqlBuf,
) -> TrellisResult<()> {
    buf.push("SELECT ");
    for (i, column) in ir.columns.iter().enumerate() {
        if i > 0 {
            buf.push(", ");
        }
        buf.push(&format!(
            "{}.{} AS {}",
            column.alias,
            DB::quote_identifier(&column.stored),
            DB::quote_identifier(&column.label)
        ));
    }

    let model = registry.model(&ir.model)?;
    buf.push(" FROM ");
    buf.push(&table_sql::<DB>(model));
    buf.push(&format!(" AS {}", ir.alias));

    for join in &ir.joins {
        let join_model = registry.model(&join.model)?;
        buf.push(match join.kind {
            JoinKind::Left => " LEFT JOIN ",
            JoinKind::Inner => " JOIN ",
        });
        buf.push(&table_sql::<DB>(join_model));
        buf.push(&format!(" AS {} ON ", join.alias));
        for (i, on) in join.on.iter().enumerate() {
            if i > 0 {
                buf.push(" AND ");
            }
            buf.push(&format!(
                "{}.{} = {}.{}",
                join.alias,
                DB::quote_identifier(&on.self_col),
                on.other_alias,
                DB::quote_identifier(&on.other_col)
            ));
        }
        if let Some(pred) = &join.pred {
            buf.push(" AND (");
            pred.compile::<DB>(join_model, Some(&join.alias), buf)?;
            buf.push(")");
        }
    }

    if !ir.correlation.is_empty() || ir.predicate.is_some() {
        buf.push(" WHERE ");
        let mut first = true;
        for correlation in &ir.correlation {
            if !first {
                buf.push(" AND ");
            }
            first = false;
            buf.push(&format!(
                "{}.{} = base.{}",
                correlation.alias,
                DB::quote_identifier(&correlation.stored),
                DB::quote_identifier(&correlation.outer_label)
            ));
        }
        if let Some(pred) = &ir.predicate {
            if first {
                pred.compile::<DB>(model, Some(&ir.alias), buf)?;
            } else {
                buf.push(" AND (");
                pred.compile::<DB>(model, Some(&ir.alias), buf)?;
                buf.push(")");
            }
        }
    }

    if !ir.order.is_empty() {
        buf.push(" ORDER BY ");
        for (i, order) in ir.order.iter().enumerate() {
            if i > 0 {
                buf.push(", ");
            }
            buf.push(&format!(
                "{}.{} {}",
                order.alias,
                DB::quote_identifier(&order.stored),
                order.direction.sql()
            ));
        }
    }

    if let Some(limit) = ir.limit {
        buf.push(&format!(" LIMIT {}", limit));
    }
    if let Some(offset) = ir.offset {
        buf.push(&format!(" OFFSET {}", offset));
    }
    if let Some(lock) = ir.lock {
        buf.push(DB::row_lock_clause(lock));
    }
    Ok(())
}

/// Renders a statement. A statement without to-many children is one flat
/// SELECT; with them, the flat parent becomes the `base` driving set and each
/// to-many child a correlated lateral subquery whose own limit/offset bound
/// only that parent's children.
fn render_statement<DB: SqlDialect>(
    registry: &Registry,
    ir: &SelectIr,
    correlated: bool,
    buf: &mut SqlBuf,
) -> TrellisResult<()> {
    if ir.laterals.is_empty() {
        return render_flat::<DB>(registry, ir, buf);
    }

    buf.push("SELECT base.*");
    for lateral in &ir.laterals {
        buf.push(&format!(", {}.*", lateral.sub_alias));
    }
    buf.push(" FROM ");
    if correlated {
        buf.push("LATERAL ");
    }
    buf.push("(");
    render_flat::<DB>(registry, ir, buf)?;
    buf.push(") AS base");

    for lateral in &ir.laterals {
        buf.push(" LEFT JOIN LATERAL (");
        render_statement::<DB>(registry, &lateral.child, true, buf)?;
        buf.push(&format!(") AS {} ON TRUE", lateral.sub_alias));
    }

    if !ir.order.is_empty() {
        buf.push(" ORDER BY ");
        for (i, order) in ir.order.iter().enumerate() {
            if i > 0 {
                buf.push(", ");
            }
            buf.push(&format!(
                "base.{} {}",
                DB::quote_identifier(&order.label),
                order.direction.sql()
            ));
        }
    }
    Ok(())
}

/// Compiles a find-many over `model`.
pub(crate) fn compile_find<DB: SqlDialect>(
    registry: &Registry,
    hooks: &Hooks,
    model: &str,
    spec: &FindSpec,
) -> TrellisResult<CompiledFind> {
    let mut planner = Planner {
        registry,
        hooks,
        next_alias: 0,
    };
    let (ir, projection) = planner.plan_statement(model, spec, None)?;
    let mut buf = SqlBuf::new();
    render_statement::<DB>(registry, &ir, false, &mut buf)?;
    Ok(CompiledFind {
        sql: buf.sql,
        params: buf.params,
        projection,
    })
}

/// Compiles a find-one: a find-many with the driving set capped at two rows,
/// so zero and more-than-one results stay distinguishable.
pub(crate) fn compile_find_one<DB: SqlDialect>(
    registry: &Registry,
    hooks: &Hooks,
    model: &str,
    spec: &FindSpec,
) -> TrellisResult<CompiledFind> {
    let mut capped = spec.clone();
    capped.limit = Some(2);
    compile_find::<DB>(registry, hooks, model, &capped)
}

/// Compiles a count: the projection becomes a single aggregate and ordering,
/// pagination, locks and includes are dropped. To-many relation filters never
/// affect top-level cardinality.
pub(crate) fn compile_count<DB: SqlDialect>(
    registry: &Registry,
    hooks: &Hooks,
    model_name: &str,
    spec: &FindSpec,
) -> TrellisResult<CompiledCount> {
    let model = registry.model(model_name)?;
    let predicate = hooks.apply_count_predicate(registry, model_name, spec.predicate.clone());

    let mut buf = SqlBuf::new();
    buf.push("SELECT COUNT(*) AS ");
    buf.push(&DB::quote_identifier("count"));
    buf.push(" FROM ");
    buf.push(&table_sql::<DB>(model));
    buf.push(" AS t0");
    if let Some(pred) = &predicate {
        buf.push(" WHERE ");
        pred.compile::<DB>(model, Some("t0"), &mut buf)?;
    }
    Ok(CompiledCount {
        sql: buf.sql,
        params: buf.params,
    })
}
