use smallvec::SmallVec;

use crate::dialect::SqlDialect;
use crate::value::BindValue;

/// Growing SQL statement plus its positional parameters.
///
/// The placeholder index is always `params.len() + 1` at the moment the
/// parameter is pushed, so parameter order matches placeholder occurrence
/// order by construction and is never reordered afterwards.
pub(crate) struct SqlBuf {
    pub sql: String,
    pub params: SmallVec<[BindValue; 8]>,
}

impl SqlBuf {
    pub fn new() -> Self {
        Self {
            sql: String::with_capacity(128),
            params: SmallVec::new(),
        }
    }

    pub fn push(&mut self, fragment: &str) {
        self.sql.push_str(fragment);
    }

    pub fn push_param<DB: SqlDialect>(&mut self, value: BindValue) {
        self.params.push(value);
        let placeholder = DB::placeholder(self.params.len());
        self.sql.push_str(&placeholder);
    }
}
