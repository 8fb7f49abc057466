//! Filter trees and their compilation to SQL
//!
//! Filters arrive as untrusted JSON:
//!
//! ```json
//! { "type": "allOf", "children": [
//!     { "type": "single", "operation": "gt", "left": 0, "right": "5" },
//!     { "type": "single", "operation": "containsCI", "left": 1, "right": "abc" }
//! ] }
//! ```
//!
//! [`FilterTree::sanitize`] never fails. It bounds the tree to
//! [`MAX_DEPTH`] levels and [`MAX_CHILDREN`] children per node by dropping
//! the excess, and maps anything it does not recognize to a harmless
//! default. [`FilterTree::compile`] then produces a SQL fragment with `?`
//! markers; the only identifiers it writes are the configured field names.

use tabsync_rdbc::dialect::SqlDialect;
use tabsync_rdbc::security::escape_like_pattern;
use tabsync_rdbc::types::Value;

use crate::coerce::{coerce, truncate_chars};
use crate::field::Field;

/// Maximum tree depth; the root is at depth 1
pub const MAX_DEPTH: usize = 4;

/// Maximum number of children kept per node
pub const MAX_CHILDREN: usize = 16;

/// Maximum literal length, in characters
pub const MAX_LITERAL_CHARS: usize = 1024;

/// Node kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// Leaf condition on one field
    Single,
    /// Alias of [`FilterKind::Single`]
    One,
    /// Disjunction of children
    AnyOf,
    /// Conjunction of children
    AllOf,
    /// Negated disjunction of children
    Not,
}

impl FilterKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "single" => Some(Self::Single),
            "one" => Some(Self::One),
            "anyOf" => Some(Self::AnyOf),
            "allOf" => Some(Self::AllOf),
            "not" => Some(Self::Not),
            _ => None,
        }
    }

    /// Whether this kind combines children
    #[inline]
    pub const fn is_composite(self) -> bool {
        matches!(self, Self::AnyOf | Self::AllOf | Self::Not)
    }
}

/// Leaf operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Operation {
    /// Unrecognized operation; compiles to nothing
    Noop,
    IsNull,
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    ContainsCi,
    StartsWith,
    StartsWithCi,
    EndsWith,
    EndsWithCi,
}

impl Operation {
    fn parse(s: &str) -> Self {
        match s {
            "null" => Self::IsNull,
            "eq" => Self::Eq,
            "lt" => Self::Lt,
            "le" => Self::Le,
            "gt" => Self::Gt,
            "ge" => Self::Ge,
            "contains" => Self::Contains,
            "containsCI" => Self::ContainsCi,
            "startsWith" => Self::StartsWith,
            "startsWithCI" => Self::StartsWithCi,
            "endsWith" => Self::EndsWith,
            "endsWithCI" => Self::EndsWithCi,
            _ => Self::Noop,
        }
    }

    fn comparison(self) -> Option<&'static str> {
        match self {
            Self::Eq => Some("="),
            Self::Lt => Some("<"),
            Self::Le => Some("<="),
            Self::Gt => Some(">"),
            Self::Ge => Some(">="),
            _ => None,
        }
    }

    /// (leading wildcard, trailing wildcard, case-insensitive)
    fn like_shape(self) -> Option<(bool, bool, bool)> {
        match self {
            Self::Contains => Some((true, true, false)),
            Self::ContainsCi => Some((true, true, true)),
            Self::StartsWith => Some((false, true, false)),
            Self::StartsWithCi => Some((false, true, true)),
            Self::EndsWith => Some((true, false, false)),
            Self::EndsWithCi => Some((true, false, true)),
            _ => None,
        }
    }
}

/// A sanitized filter expression
#[derive(Debug, Clone, PartialEq)]
pub struct FilterTree {
    /// Node kind
    pub kind: FilterKind,
    /// Leaf operation (ignored by composite kinds)
    pub operation: Operation,
    /// Field position the leaf refers to; -1 when absent
    pub feature_index: i64,
    /// Literal operand; `None` is distinct from the string `"null"`
    pub literal: Option<String>,
    /// Children (composite kinds only)
    pub children: Vec<FilterTree>,
}

impl Default for FilterTree {
    fn default() -> Self {
        Self {
            kind: FilterKind::AnyOf,
            operation: Operation::Noop,
            feature_index: -1,
            literal: None,
            children: Vec::new(),
        }
    }
}

impl FilterTree {
    /// Parse an optional wire filter; absent or non-object input means no filter
    pub fn from_wire(raw: Option<&serde_json::Value>) -> Option<Self> {
        match raw {
            Some(v) if v.is_object() => Some(Self::sanitize(v)),
            _ => None,
        }
    }

    /// Normalize arbitrary JSON into a bounded, well-formed tree
    pub fn sanitize(raw: &serde_json::Value) -> Self {
        Self::sanitize_at(raw, 1)
    }

    fn sanitize_at(raw: &serde_json::Value, depth: usize) -> Self {
        let Some(obj) = raw.as_object() else {
            return Self::default();
        };

        let operation = obj
            .get("operation")
            .and_then(|v| v.as_str())
            .map(Operation::parse)
            .unwrap_or(Operation::Noop);

        let kind = match obj.get("type") {
            None | Some(serde_json::Value::Null) if operation != Operation::Noop => {
                FilterKind::Single
            }
            Some(serde_json::Value::String(s)) => {
                FilterKind::parse(s).unwrap_or(FilterKind::AnyOf)
            }
            _ => FilterKind::AnyOf,
        };

        let feature_index = obj
            .get("left")
            .and_then(|v| {
                v.as_i64()
                    .or_else(|| v.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            })
            .unwrap_or(-1);

        let literal = match obj.get("right") {
            Some(serde_json::Value::String(s)) => {
                Some(truncate_chars(s.clone(), MAX_LITERAL_CHARS))
            }
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            Some(serde_json::Value::Bool(b)) => Some(b.to_string()),
            _ => None,
        };

        let children = match obj.get("children").and_then(|v| v.as_array()) {
            Some(raw_children) if kind.is_composite() && depth < MAX_DEPTH => raw_children
                .iter()
                .take(MAX_CHILDREN)
                .map(|child| Self::sanitize_at(child, depth + 1))
                .collect(),
            _ => Vec::new(),
        };

        Self {
            kind,
            operation,
            feature_index,
            literal,
            children,
        }
    }

    /// Number of levels in the tree (a single node has depth 1)
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(Self::depth).max().unwrap_or(0)
    }

    /// Compile against a source's fields, quoting columns the way `dialect` does
    pub fn compile(&self, fields: &[Field], dialect: &dyn SqlDialect) -> CompiledCondition {
        let mut params = Vec::new();
        let sql = self
            .compile_into(fields, dialect, &mut params)
            .unwrap_or_default();
        CompiledCondition { sql, params }
    }

    fn compile_into(
        &self,
        fields: &[Field],
        dialect: &dyn SqlDialect,
        params: &mut Vec<Value>,
    ) -> Option<String> {
        match self.kind {
            FilterKind::Single | FilterKind::One => self.compile_leaf(fields, dialect, params),
            FilterKind::AnyOf => self.compile_children(fields, dialect, params, " OR ", false),
            FilterKind::AllOf => self.compile_children(fields, dialect, params, " AND ", false),
            FilterKind::Not => self.compile_children(fields, dialect, params, " OR ", true),
        }
    }

    fn compile_children(
        &self,
        fields: &[Field],
        dialect: &dyn SqlDialect,
        params: &mut Vec<Value>,
        joiner: &str,
        negate: bool,
    ) -> Option<String> {
        let parts: Vec<String> = self
            .children
            .iter()
            .filter_map(|child| child.compile_into(fields, dialect, params))
            .collect();

        match parts.len() {
            0 => None,
            1 if !negate => parts.into_iter().next(),
            _ => {
                let joined = parts.join(joiner);
                Some(if negate {
                    format!("NOT ({})", joined)
                } else {
                    format!("({})", joined)
                })
            }
        }
    }

    fn compile_leaf(
        &self,
        fields: &[Field],
        dialect: &dyn SqlDialect,
        params: &mut Vec<Value>,
    ) -> Option<String> {
        let field = usize::try_from(self.feature_index)
            .ok()
            .and_then(|i| fields.get(i))?;
        let column = dialect.quote_identifier(&field.name);

        if self.operation == Operation::IsNull {
            return Some(format!("{} IS NULL", column));
        }

        if let Some(op) = self.operation.comparison() {
            let raw = self.literal.clone().map(Value::String).unwrap_or(Value::Null);
            params.push(coerce(&raw, field.field_type));
            return Some(format!("{} {} ?", column, op));
        }

        let (leading, trailing, case_insensitive) = self.operation.like_shape()?;
        let mut pattern = escape_like_pattern(self.literal.as_deref().unwrap_or(""));
        if leading {
            pattern.insert(0, '%');
        }
        if trailing {
            pattern.push('%');
        }
        params.push(Value::String(pattern));

        let target = if field.field_type.is_textual() {
            column
        } else {
            format!("CAST({} AS TEXT)", column)
        };

        Some(if case_insensitive {
            format!("LOWER({}) LIKE LOWER(?) ESCAPE '\\'", target)
        } else {
            format!("{} LIKE ? ESCAPE '\\'", target)
        })
    }
}

/// SQL boolean expression with positional `?` parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledCondition {
    /// Fragment to place after `WHERE`; empty when nothing constrains the rows
    pub sql: String,
    /// Parameters in marker order
    pub params: Vec<Value>,
}

impl CompiledCondition {
    /// Whether the condition constrains nothing
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }

    /// Compile an optional filter; no filter yields an empty condition
    pub fn from_filter(
        filter: Option<&FilterTree>,
        fields: &[Field],
        dialect: &dyn SqlDialect,
    ) -> Self {
        filter.map(|f| f.compile(fields, dialect)).unwrap_or_default()
    }
}
