use crate::dialect::SqlDialect;
use crate::error::{TrellisError, TrellisResult};
use crate::registry::ModelDefinition;
use crate::sql::SqlBuf;
use crate::value::BindValue;

/// A comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    ILike,
    In,
    Is,
    IsNot,
}

/// The right-hand side of a comparison.
#[derive(Debug, Clone)]
pub enum PredValue {
    Value(BindValue),
    List(Vec<BindValue>),
}

/// A boolean condition tree over the columns of one model.
///
/// Leaves compare a logical column against a value; combinators compose
/// left-to-right and parenthesize their children when compiled.
#[derive(Debug, Clone)]
pub enum Predicate {
    Compare {
        column: String,
        op: CompareOp,
        value: PredValue,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    fn compare(column: impl Into<String>, op: CompareOp, value: impl Into<BindValue>) -> Self {
        Self::Compare {
            column: column.into(),
            op,
            value: PredValue::Value(value.into()),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<BindValue>) -> Self {
        Self::compare(column, CompareOp::Eq, value)
    }

    pub fn ne(column: impl Into<String>, value: impl Into<BindValue>) -> Self {
        Self::compare(column, CompareOp::Ne, value)
    }

    pub fn gt(column: impl Into<String>, value: impl Into<BindValue>) -> Self {
        Self::compare(column, CompareOp::Gt, value)
    }

    pub fn gte(column: impl Into<String>, value: impl Into<BindValue>) -> Self {
        Self::compare(column, CompareOp::Gte, value)
    }

    pub fn lt(column: impl Into<String>, value: impl Into<BindValue>) -> Self {
        Self::compare(column, CompareOp::Lt, value)
    }

    pub fn lte(column: impl Into<String>, value: impl Into<BindValue>) -> Self {
        Self::compare(column, CompareOp::Lte, value)
    }

    pub fn like(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::compare(column, CompareOp::Like, pattern.into())
    }

    pub fn ilike(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::compare(column, CompareOp::ILike, pattern.into())
    }

    pub fn is_in<I, V>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<BindValue>,
    {
        Self::Compare {
            column: column.into(),
            op: CompareOp::In,
            value: PredValue::List(values.into_iter().map(Into::into).collect()),
        }
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Self::compare(column, CompareOp::Is, BindValue::Null)
    }

    pub fn is_not_null(column: impl Into<String>) -> Self {
        Self::compare(column, CompareOp::IsNot, BindValue::Null)
    }

    pub fn and(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        Self::And(predicates.into_iter().collect())
    }

    pub fn or(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        Self::Or(predicates.into_iter().collect())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(predicate: Predicate) -> Self {
        Self::Not(Box::new(predicate))
    }

    /// True when no comparison leaf exists anywhere in the tree.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Compare { .. } => false,
            Self::And(children) | Self::Or(children) => children.iter().all(Self::is_empty),
            Self::Not(child) => child.is_empty(),
        }
    }

    /// Compiles the tree into `buf`, qualifying columns with `alias` when
    /// given. Parameters are appended in placeholder occurrence order.
    pub(crate) fn compile<DB: SqlDialect>(
        &self,
        model: &ModelDefinition,
        alias: Option<&str>,
        buf: &mut SqlBuf,
    ) -> TrellisResult<()> {
        match self {
            Self::Compare { column, op, value } => {
                compile_compare::<DB>(model, alias, column, *op, value, buf)
            }
            Self::And(children) => compile_group::<DB>(model, alias, children, " AND ", "1=1", buf),
            Self::Or(children) => compile_group::<DB>(model, alias, children, " OR ", "1=0", buf),
            Self::Not(child) => {
                buf.push("NOT (");
                child.compile::<DB>(model, alias, buf)?;
                buf.push(")");
                Ok(())
            }
        }
    }

    /// Renders the tree for log output, replacing values of sensitive columns
    /// with `***`.
    pub(crate) fn format_for_log(&self, model: &ModelDefinition) -> String {
        match self {
            Self::Compare { column, op, value } => {
                let sensitive = model
                    .column_by_name(column)
                    .map(|c| c.sensitive)
                    .unwrap_or(false);
                let render = |v: &BindValue| {
                    if sensitive {
                        "***".to_string()
                    } else {
                        v.to_log_string()
                    }
                };
                match value {
                    PredValue::List(values) => {
                        let rendered = values.iter().map(render).collect::<Vec<_>>().join(", ");
                        format!("{} IN ({})", column, rendered)
                    }
                    PredValue::Value(BindValue::Null) => match op {
                        CompareOp::IsNot | CompareOp::Ne => format!("{} IS NOT NULL", column),
                        _ => format!("{} IS NULL", column),
                    },
                    PredValue::Value(v) => format!("{} {} {}", column, op_text_generic(*op), render(v)),
                }
            }
            Self::And(children) => format_group(children, model, " AND "),
            Self::Or(children) => format_group(children, model, " OR "),
            Self::Not(child) => format!("NOT ({})", child.format_for_log(model)),
        }
    }
}

fn format_group(children: &[Predicate], model: &ModelDefinition, sep: &str) -> String {
    let parts: Vec<String> = children.iter().map(|c| c.format_for_log(model)).collect();
    format!("({})", parts.join(sep))
}

fn op_text_generic(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "=",
        CompareOp::Ne => "!=",
        CompareOp::Gt => ">",
        CompareOp::Gte => ">=",
        CompareOp::Lt => "<",
        CompareOp::Lte => "<=",
        CompareOp::Like => "LIKE",
        CompareOp::ILike => "ILIKE",
        CompareOp::In => "IN",
        CompareOp::Is => "IS",
        CompareOp::IsNot => "IS NOT",
    }
}

fn compile_group<DB: SqlDialect>(
    model: &ModelDefinition,
    alias: Option<&str>,
    children: &[Predicate],
    sep: &str,
    empty: &str,
    buf: &mut SqlBuf,
) -> TrellisResult<()> {
    if children.is_empty() {
        buf.push(empty);
        return Ok(());
    }
    buf.push("(");
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            buf.push(sep);
        }
        child.compile::<DB>(model, alias, buf)?;
    }
    buf.push(")");
    Ok(())
}

fn compile_compare<DB: SqlDialect>(
    model: &ModelDefinition,
    alias: Option<&str>,
    column: &str,
    op: CompareOp,
    value: &PredValue,
    buf: &mut SqlBuf,
) -> TrellisResult<()> {
    let definition = model.column_by_name(column).ok_or_else(|| {
        TrellisError::build(&model.name, format!("unknown column '{}'", column))
    })?;
    let column_sql = match alias {
        Some(alias) => format!("{}.{}", alias, DB::quote_identifier(&definition.stored)),
        None => DB::quote_identifier(&definition.stored),
    };

    match (op, value) {
        (CompareOp::In, PredValue::List(values)) => {
            if values.is_empty() {
                // Matches nothing, on purpose.
                buf.push("1=0");
                return Ok(());
            }
            buf.push(&column_sql);
            buf.push(" IN (");
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    buf.push(", ");
                }
                buf.push_param::<DB>(v.clone());
            }
            buf.push(")");
            Ok(())
        }
        (CompareOp::In, PredValue::Value(_)) => Err(TrellisError::build(
            &model.name,
            format!("'in' on column '{}' requires a list value", column),
        )),
        (_, PredValue::List(_)) => Err(TrellisError::build(
            &model.name,
            format!("list value on column '{}' is only valid with 'in'", column),
        )),
        (CompareOp::Is, PredValue::Value(BindValue::Null)) => {
            buf.push(&column_sql);
            buf.push(" IS NULL");
            Ok(())
        }
        (CompareOp::IsNot, PredValue::Value(BindValue::Null)) => {
            buf.push(&column_sql);
            buf.push(" IS NOT NULL");
            Ok(())
        }
        (CompareOp::Is | CompareOp::IsNot, PredValue::Value(_)) => Err(TrellisError::build(
            &model.name,
            format!("'is' on column '{}' only accepts null", column),
        )),
        (CompareOp::Eq, PredValue::Value(BindValue::Null)) => {
            buf.push(&column_sql);
            buf.push(" IS NULL");
            Ok(())
        }
        (CompareOp::Ne, PredValue::Value(BindValue::Null)) => {
            buf.push(&column_sql);
            buf.push(" IS NOT NULL");
            Ok(())
        }
        (_, PredValue::Value(BindValue::Null)) => Err(TrellisError::build(
            &model.name,
            format!("null on column '{}' is only valid with eq/ne/is", column),
        )),
        (op, PredValue::Value(v)) => {
            buf.push(&column_sql);
            buf.push(" ");
            let op_sql = match op {
                CompareOp::ILike => DB::ilike_operator(),
                other => op_text_generic(other),
            };
            buf.push(op_sql);
            buf.push(" ");
            buf.push_param::<DB>(v.clone());
            Ok(())
        }
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::registry::{ColumnDefinition, ColumnType};
    use sqlx::Sqlite;

    fn user() -> ModelDefinition {
        ModelDefinition::new("user")
            .column(ColumnDefinition::new("id", ColumnType::Integer).primary_key())
            .column(ColumnDefinition::new("username", ColumnType::Text))
            .column(ColumnDefinition::new("password", ColumnType::Text).sensitive())
            .column(
                ColumnDefinition::new("deletedAt", ColumnType::DateTime)
                    .stored("deleted_at")
                    .nullable(),
            )
    }

    fn compile(p: &Predicate) -> (String, Vec<BindValue>) {
        let model = user();
        let mut buf = SqlBuf::new();
        p.compile::<Sqlite>(&model, Some("t0"), &mut buf).unwrap();
        (buf.sql, buf.params.into_vec())
    }

    #[test]
    fn compiles_scalar_comparison_to_equality() {
        let (sql, params) = compile(&Predicate::eq("username", "alice"));
        assert_eq!(sql, "t0.`username` = ?");
        assert_eq!(params, vec![BindValue::String("alice".into())]);
    }

    #[test]
    fn resolves_stored_column_names() {
        let (sql, _) = compile(&Predicate::is_null("deletedAt"));
        assert_eq!(sql, "t0.`deleted_at` IS NULL");
    }

    #[test]
    fn null_under_eq_and_ne_becomes_is_null() {
        let (sql, params) = compile(&Predicate::eq("deletedAt", BindValue::Null));
        assert_eq!(sql, "t0.`deleted_at` IS NULL");
        assert!(params.is_empty());

        let (sql, _) = compile(&Predicate::ne("deletedAt", BindValue::Null));
        assert_eq!(sql, "t0.`deleted_at` IS NOT NULL");
    }

    #[test]
    fn empty_in_matches_nothing() {
        let (sql, params) = compile(&Predicate::is_in("id", Vec::<i64>::new()));
        assert_eq!(sql, "1=0");
        assert!(params.is_empty());
    }

    #[test]
    fn in_binds_every_element_in_order() {
        let (sql, params) = compile(&Predicate::is_in("id", [3i64, 1, 2]));
        assert_eq!(sql, "t0.`id` IN (?, ?, ?)");
        assert_eq!(
            params,
            vec![BindValue::I64(3), BindValue::I64(1), BindValue::I64(2)]
        );
    }

    #[test]
    fn combinators_parenthesize_and_keep_parameter_order() {
        let p = Predicate::and([
            Predicate::gt("id", 5i64),
            Predicate::or([
                Predicate::like("username", "a%"),
                Predicate::not(Predicate::eq("username", "bob")),
            ]),
        ]);
        let (sql, params) = compile(&p);
        assert_eq!(
            sql,
            "(t0.`id` > ? AND (t0.`username` LIKE ? OR NOT (t0.`username` = ?)))"
        );
        assert_eq!(
            params,
            vec![
                BindValue::I64(5),
                BindValue::String("a%".into()),
                BindValue::String("bob".into()),
            ]
        );
    }

    #[test]
    fn empty_groups_have_boolean_identities() {
        let (sql, _) = compile(&Predicate::and([]));
        assert_eq!(sql, "1=1");
        let (sql, _) = compile(&Predicate::or([]));
        assert_eq!(sql, "1=0");
    }

    #[test]
    fn ilike_falls_back_to_like_on_sqlite() {
        let (sql, _) = compile(&Predicate::ilike("username", "A%"));
        assert_eq!(sql, "t0.`username` LIKE ?");
    }

    #[test]
    fn unknown_column_is_a_build_error() {
        let model = user();
        let mut buf = SqlBuf::new();
        let err = Predicate::eq("nope", 1i64).compile::<Sqlite>(&model, None, &mut buf);
        assert!(matches!(err, Err(TrellisError::Build { .. })));
    }

    #[test]
    fn in_requires_a_list() {
        let model = user();
        let mut buf = SqlBuf::new();
        let p = Predicate::Compare {
            column: "id".into(),
            op: CompareOp::In,
            value: PredValue::Value(BindValue::I64(1)),
        };
        let err = p.compile::<Sqlite>(&model, None, &mut buf);
        assert!(matches!(err, Err(TrellisError::Build { .. })));
    }

    #[test]
    fn log_rendering_redacts_sensitive_columns() {
        let model = user();
        let p = Predicate::and([
            Predicate::eq("password", "secret"),
            Predicate::eq("username", "alice"),
        ]);
        let rendered = p.format_for_log(&model);
        assert!(rendered.contains("password = ***"));
        assert!(rendered.contains("username = alice"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn emptiness_looks_through_combinators() {
        assert!(Predicate::and([]).is_empty());
        assert!(Predicate::and([Predicate::or([])]).is_empty());
        assert!(!Predicate::and([Predicate::eq("id", 1i64)]).is_empty());
    }
}
