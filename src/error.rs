/// Trellis-specific error type with actionable variants.
///
/// Compile-side variants (`InvalidModel`, `Build`) indicate a programming
/// error in the registry or the call's spec and are raised before any
/// statement executes. Execution-side variants surface after the innermost
/// active rollback has run.
#[derive(Debug)]
pub enum TrellisError {
    /// Registry construction rejected a model definition.
    InvalidModel {
        /// The model being defined.
        model: String,
        /// What was wrong with it.
        reason: String,
    },
    /// A query or write spec could not be compiled.
    Build {
        /// The model the spec targeted.
        model: String,
        /// What was wrong with the spec.
        reason: String,
    },
    /// A find-one matched no rows.
    NotFound {
        /// The model queried.
        model: String,
    },
    /// A find-one matched more than one row.
    NotUnique {
        /// The model queried.
        model: String,
    },
    /// A single-row write affected no rows; the savepoint was rolled back.
    ZeroRowsAffected {
        /// The model written.
        model: String,
        /// Which operation violated the invariant.
        operation: &'static str,
    },
    /// A single-row write affected more than one row; the savepoint was
    /// rolled back.
    MultipleRowsAffected {
        /// The model written.
        model: String,
        /// Which operation violated the invariant.
        operation: &'static str,
        /// How many rows the statement touched.
        affected: u64,
    },
    /// Underlying sqlx error.
    Sqlx(sqlx::Error),
}

impl std::fmt::Display for TrellisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidModel { model, reason } => {
                write!(f, "invalid model definition '{}': {}", model, reason)
            }
            Self::Build { model, reason } => {
                write!(f, "cannot build statement for '{}': {}", model, reason)
            }
            Self::NotFound { model } => write!(f, "no '{}' row matched", model),
            Self::NotUnique { model } => {
                write!(f, "more than one '{}' row matched", model)
            }
            Self::ZeroRowsAffected { model, operation } => {
                write!(f, "{} on '{}' affected no rows", operation, model)
            }
            Self::MultipleRowsAffected {
                model,
                operation,
                affected,
            } => {
                write!(
                    f,
                    "{} on '{}' affected {} rows, expected exactly one",
                    operation, model, affected
                )
            }
            Self::Sqlx(err) => write!(f, "sqlx error: {}", err),
        }
    }
}

impl std::error::Error for TrellisError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sqlx(err) => Some(err),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for TrellisError {
    fn from(err: sqlx::Error) -> Self {
        Self::Sqlx(err)
    }
}

/// Result alias for Trellis operations.
pub type TrellisResult<T> = Result<T, TrellisError>;

impl TrellisError {
    pub(crate) fn build(model: &str, reason: impl Into<String>) -> Self {
        Self::Build {
            model: model.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(model: &str, reason: impl Into<String>) -> Self {
        Self::InvalidModel {
            model: model.to_string(),
            reason: reason.into(),
        }
    }
}
