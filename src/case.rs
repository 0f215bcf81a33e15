//! Identifier case conversion used to derive table and foreign-key names from type names.

/// Convert a type identifier from CamelCase to snake_case.
/// e.g. "User" -> "user", "OrderLine" -> "order_line"
pub fn to_snake_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    let mut prev_lower = false;
    for c in s.chars() {
        if c.is_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.extend(c.to_lowercase());
            prev_lower = false;
        } else {
            out.push(c);
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
        }
    }
    out
}

/// Foreign-key column that rows of other types use to point at `type_name`.
/// e.g. "User" -> "user_id"
pub fn foreign_key_for(type_name: &str) -> String {
    format!("{}_id", to_snake_case(type_name))
}
