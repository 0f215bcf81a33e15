//! Typed errors and their machine-readable body for callers that forward them.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// One failed validation rule on one field.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Violation {
    pub field: String,
    pub label: String,
    /// The rule term that failed, e.g. `between(1,120)`.
    pub rule: String,
    pub message: String,
}

/// All violations collected by one validation pass, in field declaration order.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Violations(pub Vec<Violation>);

impl Violations {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Violation> {
        self.0.iter()
    }

    /// Violations reported for `field`.
    pub fn for_field<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a Violation> + 'a {
        self.0.iter().filter(move |v| v.field == field)
    }
}

impl fmt::Display for Violations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<&str> = self.0.iter().map(|v| v.message.as_str()).collect();
        write!(f, "{}", messages.join("; "))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Error, Debug)]
pub enum OrmError {
    #[error("validation: {0}")]
    Validation(Violations),
    #[error("unknown column '{column}' on {entity}")]
    UnknownColumn { entity: String, column: String },
    #[error("unknown relation '{relation}' on {entity}")]
    UnknownRelation { entity: String, relation: String },
    #[error("relation '{relation}' on {entity} is not {expected}")]
    RelationMismatch {
        entity: String,
        relation: String,
        expected: &'static str,
    },
    #[error("{entity} is not loaded")]
    EntityNotLoaded { entity: String },
    #[error("{entity} has been deleted")]
    EntityDeleted { entity: String },
    #[error("{entity} is already loaded")]
    EntityAlreadyLoaded { entity: String },
    #[error("primary key '{column}' of {entity} cannot change once persisted")]
    PrimaryKeyImmutable { entity: String, column: String },
    #[error("table of {entity} can no longer be reassigned")]
    TableLocked { entity: String },
    #[error("invalid clause value: {0}")]
    InvalidClauseValue(String),
    #[error("invalid rule: {0}")]
    InvalidRule(String),
    #[error("decode '{column}': {source}")]
    Decode {
        column: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("database: {0}")]
    Database(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<sqlx::Error> for OrmError {
    fn from(e: sqlx::Error) -> Self {
        OrmError::Database(Box::new(e))
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl OrmError {
    /// Stable code a transport layer can map to its own status space.
    pub fn code(&self) -> &'static str {
        match self {
            OrmError::Validation(_) => "validation_error",
            OrmError::UnknownColumn { .. } => "unknown_column",
            OrmError::UnknownRelation { .. } => "unknown_relation",
            OrmError::RelationMismatch { .. } => "relation_mismatch",
            OrmError::EntityNotLoaded { .. } => "not_loaded",
            OrmError::EntityDeleted { .. } => "deleted",
            OrmError::EntityAlreadyLoaded { .. } => "already_loaded",
            OrmError::PrimaryKeyImmutable { .. } => "primary_key_immutable",
            OrmError::TableLocked { .. } => "table_locked",
            OrmError::InvalidClauseValue(_) => "invalid_clause_value",
            OrmError::InvalidRule(_) => "invalid_rule",
            OrmError::Decode { .. } => "decode_error",
            OrmError::Database(_) => "database_error",
            OrmError::Config(_) => "config_error",
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let details = match self {
            OrmError::Validation(violations) => serde_json::to_value(violations).ok(),
            _ => None,
        };
        ErrorBody {
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
                details,
            },
        }
    }

    pub(crate) fn unknown_column(entity: &str, column: &str) -> Self {
        OrmError::UnknownColumn {
            entity: entity.to_string(),
            column: column.to_string(),
        }
    }

    pub(crate) fn unknown_relation(entity: &str, relation: &str) -> Self {
        OrmError::UnknownRelation {
            entity: entity.to_string(),
            relation: relation.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_body_carries_violations() {
        let err = OrmError::Validation(Violations(vec![Violation {
            field: "age".into(),
            label: "Age".into(),
            rule: "between(1,120)".into(),
            message: "Age must be between 1 and 120".into(),
        }]));
        let body = serde_json::to_value(err.to_body()).unwrap();
        assert_eq!(body["error"]["code"], "validation_error");
        assert_eq!(body["error"]["details"][0]["field"], "age");
        assert_eq!(body["error"]["message"], "validation: Age must be between 1 and 120");
    }

    #[test]
    fn non_validation_body_has_no_details() {
        let err = OrmError::unknown_column("User", "nope");
        let body = serde_json::to_value(err.to_body()).unwrap();
        assert_eq!(body["error"]["code"], "unknown_column");
        assert!(body["error"].get("details").is_none());
    }
}
