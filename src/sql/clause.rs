//! Decorating clauses (WHERE, GROUP BY, HAVING, ORDER BY, JOIN) compiled from ordered
//! sub-expressions.
//!
//! Each clause is a list of sub-expressions (e.g. `age > 18`), and each sub-expression is
//! a fixed number of elements (`age`, `>`, `18`). Every element position has a handler that
//! renders it: identifiers are validated and quoted, values become `$n` parameters.

use crate::error::OrmError;
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::OnceLock;

/// Statement text plus positional parameters, in placeholder order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<Value>,
}

impl QueryBuf {
    pub fn new() -> Self {
        QueryBuf::default()
    }

    /// Append a parameter and return its placeholder.
    pub fn push_param(&mut self, v: Value) -> String {
        self.params.push(v);
        format!("${}", self.params.len())
    }
}

/// Renders one element of a sub-expression into clause text.
pub type ElementHandler = fn(&Value, &mut QueryBuf) -> Result<String, OrmError>;

/// Static description of one clause kind.
pub struct ClauseKind {
    pub name: &'static str,
    /// Leading keyword, empty for JOIN where each sub-expression carries its own.
    pub keyword: &'static str,
    pub combinator: &'static str,
    pub handlers: &'static [ElementHandler],
    /// Checks between elements of the same sub-expression.
    pub check: fn(&[Value]) -> Result<(), OrmError>,
    pub layout: fn(&[String]) -> String,
}

impl fmt::Debug for ClauseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClauseKind").field("name", &self.name).finish()
    }
}

pub static WHERE: ClauseKind = ClauseKind {
    name: "where",
    keyword: "WHERE",
    combinator: " AND ",
    handlers: &[column, operator, value],
    check: check_comparison,
    layout: layout_comparison,
};

pub static HAVING: ClauseKind = ClauseKind {
    name: "having",
    keyword: "HAVING",
    combinator: " AND ",
    handlers: &[column, operator, value],
    check: check_comparison,
    layout: layout_comparison,
};

pub static GROUP_BY: ClauseKind = ClauseKind {
    name: "group by",
    keyword: "GROUP BY",
    combinator: ", ",
    handlers: &[column],
    check: no_check,
    layout: layout_plain,
};

pub static ORDER_BY: ClauseKind = ClauseKind {
    name: "order by",
    keyword: "ORDER BY",
    combinator: ", ",
    handlers: &[column, direction],
    check: no_check,
    layout: layout_plain,
};

pub static JOIN: ClauseKind = ClauseKind {
    name: "join",
    keyword: "",
    combinator: " ",
    handlers: &[join_type, table, column, column],
    check: no_check,
    layout: layout_join,
};

/// Compiler for one clause kind. Cloning copies the sub-expression list, so a clone can be
/// extended without touching the original.
#[derive(Clone, Debug)]
pub struct ClauseCompiler {
    kind: &'static ClauseKind,
    subexps: Vec<Vec<Value>>,
}

impl ClauseCompiler {
    pub fn new(kind: &'static ClauseKind) -> Self {
        ClauseCompiler {
            kind,
            subexps: Vec::new(),
        }
    }

    pub fn kind(&self) -> &'static ClauseKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.subexps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subexps.is_empty()
    }

    /// Append one sub-expression after running it through every element handler.
    pub fn add_subexpression(&mut self, elements: Vec<Value>) -> Result<(), OrmError> {
        if elements.len() != self.kind.handlers.len() {
            return Err(OrmError::InvalidClauseValue(format!(
                "{} expects {} elements, got {}",
                self.kind.name,
                self.kind.handlers.len(),
                elements.len()
            )));
        }
        let mut scratch = QueryBuf::new();
        self.render(&elements, &mut scratch)?;
        self.subexps.push(elements);
        Ok(())
    }

    /// Write the clause into `buf`, preceded by a space. Writes nothing when empty.
    pub fn compile(&self, buf: &mut QueryBuf) -> Result<(), OrmError> {
        if self.subexps.is_empty() {
            return Ok(());
        }
        let mut parts = Vec::with_capacity(self.subexps.len());
        for subexp in &self.subexps {
            parts.push(self.render(subexp, buf)?);
        }
        buf.sql.push(' ');
        if !self.kind.keyword.is_empty() {
            buf.sql.push_str(self.kind.keyword);
            buf.sql.push(' ');
        }
        buf.sql.push_str(&parts.join(self.kind.combinator));
        Ok(())
    }

    pub fn clear(&mut self) {
        self.subexps.clear();
    }

    fn render(&self, elements: &[Value], buf: &mut QueryBuf) -> Result<String, OrmError> {
        (self.kind.check)(elements)?;
        let mut rendered = Vec::with_capacity(elements.len());
        for (handler, element) in self.kind.handlers.iter().zip(elements) {
            rendered.push(handler(element, buf)?);
        }
        Ok((self.kind.layout)(&rendered))
    }
}

/// Quote an identifier for PostgreSQL.
pub fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

const IDENT: &str = r"[A-Za-z_][A-Za-z0-9_]*";

fn column_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"^(?:({IDENT})\.)?({IDENT})$")).expect("column pattern compiles")
    })
}

fn aggregate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"^(?i)(COUNT|SUM|AVG|MIN|MAX)\(\s*(\*|(?:{IDENT}\.)?{IDENT})\s*\)$"
        ))
        .expect("aggregate pattern compiles")
    })
}

/// Render a column reference: `col`, `table.col`, or an aggregate such as `COUNT(*)`.
pub fn render_column(s: &str) -> Result<String, OrmError> {
    let s = s.trim();
    if let Some(caps) = column_re().captures(s) {
        let col = quoted(&caps[2]);
        return Ok(match caps.get(1) {
            Some(table) => format!("{}.{}", quoted(table.as_str()), col),
            None => col,
        });
    }
    if let Some(caps) = aggregate_re().captures(s) {
        let func = caps[1].to_uppercase();
        let arg = match &caps[2] {
            "*" => "*".to_string(),
            inner => render_column(inner)?,
        };
        return Ok(format!("{}({})", func, arg));
    }
    Err(OrmError::InvalidClauseValue(format!("invalid column reference '{}'", s)))
}

const OPERATORS: &[&str] = &[
    "=", "!=", "<>", ">", "<", ">=", "<=", "IN", "NOT IN", "LIKE", "NOT LIKE", "IS", "IS NOT",
];

fn normalize_operator(v: &Value) -> Result<String, OrmError> {
    let op = v
        .as_str()
        .map(|s| s.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase())
        .ok_or_else(|| OrmError::InvalidClauseValue(format!("operator must be a string, got {}", v)))?;
    if OPERATORS.contains(&op.as_str()) {
        Ok(op)
    } else {
        Err(OrmError::InvalidClauseValue(format!("unsupported operator '{}'", op)))
    }
}

fn column(v: &Value, _buf: &mut QueryBuf) -> Result<String, OrmError> {
    let s = v
        .as_str()
        .ok_or_else(|| OrmError::InvalidClauseValue(format!("column must be a string, got {}", v)))?;
    render_column(s)
}

fn table(v: &Value, _buf: &mut QueryBuf) -> Result<String, OrmError> {
    let s = v
        .as_str()
        .ok_or_else(|| OrmError::InvalidClauseValue(format!("table must be a string, got {}", v)))?;
    // same shape as a column: name or schema.name
    match column_re().captures(s.trim()) {
        Some(caps) => Ok(match caps.get(1) {
            Some(schema) => format!("{}.{}", quoted(schema.as_str()), quoted(&caps[2])),
            None => quoted(&caps[2]),
        }),
        None => Err(OrmError::InvalidClauseValue(format!("invalid table '{}'", s))),
    }
}

fn operator(v: &Value, _buf: &mut QueryBuf) -> Result<String, OrmError> {
    normalize_operator(v)
}

fn is_scalar(v: &Value) -> bool {
    matches!(v, Value::Bool(_) | Value::Number(_) | Value::String(_))
}

fn value(v: &Value, buf: &mut QueryBuf) -> Result<String, OrmError> {
    match v {
        Value::Null => Ok("NULL".to_string()),
        Value::Array(items) => {
            if items.is_empty() {
                return Err(OrmError::InvalidClauseValue("value list cannot be empty".into()));
            }
            let mut placeholders = Vec::with_capacity(items.len());
            for item in items {
                if !is_scalar(item) {
                    return Err(OrmError::InvalidClauseValue(format!(
                        "value list items must be scalars, got {}",
                        item
                    )));
                }
                placeholders.push(buf.push_param(item.clone()));
            }
            Ok(format!("({})", placeholders.join(", ")))
        }
        Value::Object(_) => Err(OrmError::InvalidClauseValue(format!("unsupported value {}", v))),
        _ => Ok(buf.push_param(v.clone())),
    }
}

fn direction(v: &Value, _buf: &mut QueryBuf) -> Result<String, OrmError> {
    match v.as_str().map(|s| s.trim().to_uppercase()) {
        Some(d) if d == "ASC" || d == "DESC" => Ok(d),
        _ => Err(OrmError::InvalidClauseValue(format!("invalid sort direction {}", v))),
    }
}

fn join_type(v: &Value, _buf: &mut QueryBuf) -> Result<String, OrmError> {
    match v.as_str().map(|s| s.trim().to_uppercase()) {
        Some(t) if t == "INNER" || t == "LEFT" || t == "RIGHT" => Ok(format!("{} JOIN", t)),
        _ => Err(OrmError::InvalidClauseValue(format!("invalid join type {}", v))),
    }
}

fn no_check(_elements: &[Value]) -> Result<(), OrmError> {
    Ok(())
}

fn check_comparison(elements: &[Value]) -> Result<(), OrmError> {
    let op = normalize_operator(&elements[1])?;
    let v = &elements[2];
    match op.as_str() {
        "IN" | "NOT IN" if !v.is_array() => Err(OrmError::InvalidClauseValue(format!(
            "{} requires a list of values",
            op
        ))),
        "IS" | "IS NOT" if !v.is_null() => Err(OrmError::InvalidClauseValue(format!(
            "{} only compares with null",
            op
        ))),
        "IN" | "NOT IN" | "IS" | "IS NOT" => Ok(()),
        _ if v.is_null() => Err(OrmError::InvalidClauseValue(format!(
            "use IS / IS NOT to compare with null, not {}",
            op
        ))),
        _ if !is_scalar(v) => Err(OrmError::InvalidClauseValue(format!(
            "{} requires a single value",
            op
        ))),
        _ => Ok(()),
    }
}

fn layout_comparison(parts: &[String]) -> String {
    parts.join(" ")
}

fn layout_plain(parts: &[String]) -> String {
    parts.join(" ")
}

fn layout_join(parts: &[String]) -> String {
    format!("{} {} ON {} = {}", parts[0], parts[1], parts[2], parts[3])
}
