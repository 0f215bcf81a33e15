//! Field validation rules: `notEmpty && between(1,120)` style expressions evaluated against
//! attribute values, with an extensible process-wide rule vocabulary.

use crate::db::Row;
use crate::error::{OrmError, Violation, Violations};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

/// Rule declared on one field.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidationRule {
    pub field: String,
    pub label: String,
    pub expr: String,
}

/// Check for one rule name: `(value, args) -> passed`. Malformed args should return
/// [`OrmError::InvalidRule`].
pub type RuleCheck = Arc<dyn Fn(&Value, &[String]) -> Result<bool, OrmError> + Send + Sync>;

struct RuleEntry {
    /// Message template; `{label}`, `{0}`, `{1}`.. and `{args}` are substituted.
    message: String,
    check: RuleCheck,
}

fn library() -> &'static RwLock<HashMap<String, RuleEntry>> {
    static LIBRARY: OnceLock<RwLock<HashMap<String, RuleEntry>>> = OnceLock::new();
    LIBRARY.get_or_init(|| RwLock::new(builtins()))
}

/// Add or replace a rule process-wide.
pub fn register_rule<F>(name: &str, message: &str, check: F)
where
    F: Fn(&Value, &[String]) -> Result<bool, OrmError> + Send + Sync + 'static,
{
    let entry = RuleEntry {
        message: message.to_string(),
        check: Arc::new(check),
    };
    library()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(name.to_string(), entry);
}

#[derive(Debug, PartialEq)]
struct Term {
    source: String,
    name: String,
    args: Vec<String>,
}

fn term_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*(?:\((.*)\))?$").expect("term pattern compiles"))
}

/// Terms of `expr`; a blank expression only labels its field and checks nothing.
fn parse(expr: &str) -> Result<Vec<Term>, OrmError> {
    let mut terms = Vec::new();
    if expr.trim().is_empty() {
        return Ok(terms);
    }
    for raw in expr.split("&&") {
        let source = raw.trim();
        let caps = term_re()
            .captures(source)
            .ok_or_else(|| OrmError::InvalidRule(format!("malformed rule term '{}' in '{}'", source, expr)))?;
        let name = caps[1].to_string();
        let args = match caps.get(2) {
            None => Vec::new(),
            Some(inner) if name == "regex" => vec![inner.as_str().to_string()],
            Some(inner) if inner.as_str().trim().is_empty() => Vec::new(),
            Some(inner) => inner.as_str().split(',').map(unquote).collect(),
        };
        terms.push(Term {
            source: source.to_string(),
            name,
            args,
        });
    }
    Ok(terms)
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    let quoted = s.len() >= 2
        && ((s.starts_with('\'') && s.ends_with('\'')) || (s.starts_with('"') && s.ends_with('"')));
    if quoted {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

impl ValidationRule {
    pub fn new(field: &str, label: &str, expr: &str) -> Self {
        ValidationRule {
            field: field.to_string(),
            label: label.to_string(),
            expr: expr.to_string(),
        }
    }

    /// Evaluate terms left to right and report the first that fails.
    pub fn check(&self, value: &Value) -> Result<Option<Violation>, OrmError> {
        let terms = parse(&self.expr)?;
        let lib = library().read().unwrap_or_else(PoisonError::into_inner);
        for term in terms {
            // absent values only fail notEmpty
            if value.is_null() && term.name != "notEmpty" {
                continue;
            }
            let entry = lib
                .get(&term.name)
                .ok_or_else(|| OrmError::InvalidRule(format!("unknown rule '{}'", term.name)))?;
            if !(entry.check)(value, &term.args)? {
                return Ok(Some(Violation {
                    field: self.field.clone(),
                    label: self.label.clone(),
                    rule: term.source,
                    message: render_message(&entry.message, &self.label, &term.args),
                }));
            }
        }
        Ok(None)
    }
}

fn render_message(template: &str, label: &str, args: &[String]) -> String {
    let mut out = template.replace("{label}", label).replace("{args}", &args.join(", "));
    for (i, a) in args.iter().enumerate() {
        out = out.replace(&format!("{{{}}}", i), a);
    }
    out
}

/// Validate `data` against `rules`, restricted to `only` when given. Every violation is
/// collected before failing.
pub fn validate(rules: &[ValidationRule], data: &Row, only: Option<&[String]>) -> Result<(), OrmError> {
    let mut violations = Vec::new();
    for rule in rules {
        if let Some(fields) = only {
            if !fields.iter().any(|f| *f == rule.field) {
                continue;
            }
        }
        let value = data.get(&rule.field).unwrap_or(&Value::Null);
        if let Some(v) = rule.check(value)? {
            violations.push(v);
        }
    }
    if violations.is_empty() {
        Ok(())
    } else {
        Err(OrmError::Validation(Violations(violations)))
    }
}

/// String form of a scalar: strings unquoted, numbers and bools as written.
pub(crate) fn scalar_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn numeric_arg(name: &str, args: &[String], i: usize) -> Result<f64, OrmError> {
    args.get(i)
        .and_then(|a| a.parse().ok())
        .ok_or_else(|| OrmError::InvalidRule(format!("{} expects a numeric argument at position {}", name, i + 1)))
}

fn expect_args(name: &str, args: &[String], n: usize) -> Result<(), OrmError> {
    if args.len() == n {
        Ok(())
    } else {
        Err(OrmError::InvalidRule(format!("{} expects {} argument(s), got {}", name, n, args.len())))
    }
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern compiles"))
}

fn add<F>(m: &mut HashMap<String, RuleEntry>, name: &str, message: &str, check: F)
where
    F: Fn(&Value, &[String]) -> Result<bool, OrmError> + Send + Sync + 'static,
{
    m.insert(
        name.to_string(),
        RuleEntry {
            message: message.to_string(),
            check: Arc::new(check),
        },
    );
}

fn builtins() -> HashMap<String, RuleEntry> {
    let mut m = HashMap::new();
    add(
        &mut m,
        "notEmpty",
        "{label} must not be empty",
        |v, _| {
            Ok(match v {
                Value::Null => false,
                Value::String(s) => !s.trim().is_empty(),
                Value::Array(a) => !a.is_empty(),
                Value::Object(o) => !o.is_empty(),
                _ => true,
            })
        },
    );
    add(
        &mut m,
        "digit",
        "{label} must contain only digits",
        |v, _| {
            Ok(match v {
                Value::String(s) => !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()),
                Value::Number(n) => n.is_u64(),
                _ => false,
            })
        },
    );
    add(
        &mut m,
        "between",
        "{label} must be between {0} and {1}",
        |v, args| {
            expect_args("between", args, 2)?;
            let (lo, hi) = (numeric_arg("between", args, 0)?, numeric_arg("between", args, 1)?);
            Ok(as_number(v).is_some_and(|n| n >= lo && n <= hi))
        },
    );
    add(
        &mut m,
        "min",
        "{label} must be at least {0}",
        |v, args| {
            expect_args("min", args, 1)?;
            let lo = numeric_arg("min", args, 0)?;
            Ok(as_number(v).is_some_and(|n| n >= lo))
        },
    );
    add(
        &mut m,
        "max",
        "{label} must be at most {0}",
        |v, args| {
            expect_args("max", args, 1)?;
            let hi = numeric_arg("max", args, 0)?;
            Ok(as_number(v).is_some_and(|n| n <= hi))
        },
    );
    add(
        &mut m,
        "length",
        "{label} must be between {0} and {1} characters",
        |v, args| {
            expect_args("length", args, 2)?;
            let (lo, hi) = (numeric_arg("length", args, 0)?, numeric_arg("length", args, 1)?);
            let len = scalar_text(v).map(|s| s.chars().count() as f64);
            Ok(len.is_some_and(|n| n >= lo && n <= hi))
        },
    );
    add(
        &mut m,
        "email",
        "{label} must be a valid email",
        |v, _| Ok(v.as_str().is_some_and(|s| email_re().is_match(s))),
    );
    add(
        &mut m,
        "uuid",
        "{label} must be a valid UUID",
        |v, _| Ok(v.as_str().is_some_and(|s| uuid::Uuid::parse_str(s).is_ok())),
    );
    add(
        &mut m,
        "regex",
        "{label} does not match required pattern",
        |v, args| {
            expect_args("regex", args, 1)?;
            let re = Regex::new(&args[0])
                .map_err(|e| OrmError::InvalidRule(format!("invalid pattern '{}': {}", args[0], e)))?;
            Ok(scalar_text(v).is_some_and(|s| re.is_match(&s)))
        },
    );
    add(
        &mut m,
        "in",
        "{label} must be one of: {args}",
        |v, args| Ok(scalar_text(v).is_some_and(|s| args.iter().any(|a| *a == s))),
    );
    m
}
