use crate::predicate::Predicate;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Row-lock mode for the selected rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLock {
    ForUpdate,
    ForShare,
}

/// One ordering term. The path may cross to-one relations; its last segment
/// is a column of the model the preceding segments navigate to.
#[derive(Debug, Clone)]
pub struct OrderBy {
    pub path: Vec<String>,
    pub direction: Direction,
}

/// A nested read request over one model.
///
/// `FindSpec` provides a fluent interface for building reads with column
/// selection, filtering, relation includes, ordering and pagination.
#[derive(Debug, Clone, Default)]
pub struct FindSpec {
    /// Logical columns to return; empty selects every column.
    pub columns: Vec<String>,
    pub predicate: Option<Predicate>,
    /// Included relations, in include order.
    pub include: Vec<(String, FindSpec)>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub lock: Option<RowLock>,
}

impl FindSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects the given logical columns.
    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Includes a relation, shaped by its own nested spec.
    pub fn include(mut self, relation: impl Into<String>, spec: FindSpec) -> Self {
        self.include.push((relation.into(), spec));
        self
    }

    /// Orders by a column of this model.
    pub fn order_by(mut self, column: impl Into<String>, direction: Direction) -> Self {
        self.order_by.push(OrderBy {
            path: vec![column.into()],
            direction,
        });
        self
    }

    /// Orders by a column reached through one or more to-one relations.
    pub fn order_by_path<I, S>(mut self, path: I, direction: Direction) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.order_by.push(OrderBy {
            path: path.into_iter().map(Into::into).collect(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn lock(mut self, lock: RowLock) -> Self {
        self.lock = Some(lock);
        self
    }
}
