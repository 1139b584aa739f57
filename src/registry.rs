use std::collections::{BTreeMap, BTreeSet};

use crate::error::{TrellisError, TrellisResult};
use crate::value::BindValue;

/// The logical type of a column, used to check caller-supplied values and to
/// decode result rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Float,
    Boolean,
    Text,
    Uuid,
    DateTime,
}

/// A column default: either a concrete value bound as a parameter, or a SQL
/// expression rendered inline.
#[derive(Debug, Clone)]
pub enum ColumnDefault {
    Value(BindValue),
    Expression(String),
}

/// Metadata about one column of a model.
#[derive(Debug, Clone)]
pub struct ColumnDefinition {
    /// The logical name callers use.
    pub name: String,
    /// The column name in the table. Defaults to the logical name.
    pub stored: String,
    /// The logical type tag.
    pub ty: ColumnType,
    /// Whether the column can contain NULL values.
    pub nullable: bool,
    /// Default applied when a create row omits the column.
    pub default: Option<ColumnDefault>,
    /// Whether the column carries a UNIQUE constraint.
    pub unique: bool,
    /// Whether the column is part of the primary key.
    pub primary_key: bool,
    /// Whether values of this column are redacted in logs.
    pub sensitive: bool,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        let name = name.into();
        Self {
            stored: name.clone(),
            name,
            ty,
            nullable: false,
            default: None,
            unique: false,
            primary_key: false,
            sensitive: false,
        }
    }

    /// Overrides the stored column name.
    pub fn stored(mut self, stored: impl Into<String>) -> Self {
        self.stored = stored.into();
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<BindValue>) -> Self {
        self.default = Some(ColumnDefault::Value(value.into()));
        self
    }

    /// Sets a SQL expression default, rendered verbatim into INSERT statements.
    pub fn default_expression(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(ColumnDefault::Expression(expr.into()));
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

/// A navigable edge between two models.
#[derive(Debug, Clone)]
pub enum RelationDefinition {
    /// A single related row; the foreign-key columns live on this model and
    /// reference the target's primary key.
    ToOne {
        model: String,
        fk_columns: Vec<String>,
    },
    /// Many related rows; the foreign-key columns live on the target model
    /// and reference this model's primary key.
    ToMany {
        model: String,
        fk_columns: Vec<String>,
    },
    /// Many related rows reached through a join table. `fk_self` are the
    /// through-model columns referencing this model's primary key, `fk_target`
    /// those referencing the target's.
    ManyToMany {
        model: String,
        through: String,
        fk_self: Vec<String>,
        fk_target: Vec<String>,
    },
}

impl RelationDefinition {
    pub fn to_one<S: Into<String>>(model: impl Into<String>, fk_columns: impl IntoIterator<Item = S>) -> Self {
        Self::ToOne {
            model: model.into(),
            fk_columns: fk_columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn to_many<S: Into<String>>(model: impl Into<String>, fk_columns: impl IntoIterator<Item = S>) -> Self {
        Self::ToMany {
            model: model.into(),
            fk_columns: fk_columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn many_to_many<S: Into<String>, T: Into<String>>(
        model: impl Into<String>,
        through: impl Into<String>,
        fk_self: impl IntoIterator<Item = S>,
        fk_target: impl IntoIterator<Item = T>,
    ) -> Self {
        Self::ManyToMany {
            model: model.into(),
            through: through.into(),
            fk_self: fk_self.into_iter().map(Into::into).collect(),
            fk_target: fk_target.into_iter().map(Into::into).collect(),
        }
    }

    /// The model this relation navigates to.
    pub fn target(&self) -> &str {
        match self {
            Self::ToOne { model, .. } | Self::ToMany { model, .. } | Self::ManyToMany { model, .. } => model,
        }
    }
}

/// Metadata about one model: its table identity, columns and relations.
#[derive(Debug, Clone)]
pub struct ModelDefinition {
    /// The model name callers use.
    pub name: String,
    /// Optional schema qualifier for the table.
    pub schema: Option<String>,
    /// The table name. Defaults to the lowercased model name plus `s`.
    pub table: String,
    /// The ordered column set.
    pub columns: Vec<ColumnDefinition>,
    /// Named relations to other models.
    pub relations: BTreeMap<String, RelationDefinition>,
}

impl ModelDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let table = format!("{}s", name.to_lowercase());
        Self {
            name,
            schema: None,
            table,
            columns: Vec::new(),
            relations: BTreeMap::new(),
        }
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn column(mut self, column: ColumnDefinition) -> Self {
        self.columns.push(column);
        self
    }

    pub fn relation(mut self, name: impl Into<String>, relation: RelationDefinition) -> Self {
        self.relations.insert(name.into(), relation);
        self
    }

    /// Returns a column by logical name.
    pub fn column_by_name(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Returns the primary-key columns, in declaration order.
    pub fn primary_key(&self) -> Vec<&ColumnDefinition> {
        self.columns.iter().filter(|c| c.primary_key).collect()
    }

    fn validate(&self) -> TrellisResult<()> {
        if self.table.is_empty() {
            return Err(TrellisError::invalid(&self.name, "empty table name"));
        }
        if self.columns.is_empty() {
            return Err(TrellisError::invalid(&self.name, "no columns"));
        }

        let mut stored = BTreeSet::new();
        let mut logical = BTreeSet::new();
        for column in &self.columns {
            if !stored.insert(column.stored.as_str()) {
                return Err(TrellisError::invalid(
                    &self.name,
                    format!("duplicate stored column name '{}'", column.stored),
                ));
            }
            if !logical.insert(column.name.as_str()) {
                return Err(TrellisError::invalid(
                    &self.name,
                    format!("duplicate column name '{}'", column.name),
                ));
            }
        }

        if self.primary_key().is_empty() {
            return Err(TrellisError::invalid(&self.name, "no primary-key column"));
        }
        Ok(())
    }
}

/// Immutable, process-wide model metadata.
///
/// Built once from raw definitions, validated, then shared behind an `Arc`.
#[derive(Debug)]
pub struct Registry {
    models: BTreeMap<String, ModelDefinition>,
}

impl Registry {
    /// Validates the definitions and builds the registry.
    ///
    /// Model-local problems (empty table, zero columns, duplicate column
    /// names, missing primary key) and dangling relation targets are fatal
    /// here; foreign-key arity against the referenced primary key is checked
    /// when the relation is first traversed.
    pub fn new(definitions: Vec<ModelDefinition>) -> TrellisResult<Self> {
        let mut models = BTreeMap::new();
        for definition in definitions {
            definition.validate()?;
            let name = definition.name.clone();
            if models.insert(name.clone(), definition).is_some() {
                return Err(TrellisError::invalid(&name, "duplicate model name"));
            }
        }

        let registry = Self { models };
        for model in registry.models.values() {
            for (relation_name, relation) in &model.relations {
                if !registry.models.contains_key(relation.target()) {
                    return Err(TrellisError::invalid(
                        &model.name,
                        format!(
                            "relation '{}' references unknown model '{}'",
                            relation_name,
                            relation.target()
                        ),
                    ));
                }
                if let RelationDefinition::ManyToMany { through, .. } = relation
                    && !registry.models.contains_key(through)
                {
                    return Err(TrellisError::invalid(
                        &model.name,
                        format!(
                            "relation '{}' goes through unknown model '{}'",
                            relation_name, through
                        ),
                    ));
                }
            }
        }
        Ok(registry)
    }

    /// Looks a model up by name.
    pub fn model(&self, name: &str) -> TrellisResult<&ModelDefinition> {
        self.models
            .get(name)
            .ok_or_else(|| TrellisError::build(name, "unknown model"))
    }

    /// Iterates all registered models.
    pub fn models(&self) -> impl Iterator<Item = &ModelDefinition> {
        self.models.values()
    }
}
