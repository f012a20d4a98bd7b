//! Restricted attribute templates.
//!
//! A template is literal text with `{{ path | filter | ... }}` expressions.
//! Paths walk a JSON context (`ldap.givenName`, `person.surname`,
//! `class.EmailEmployee`); object keys match case-insensitively when there
//! is no exact match. Supported filters: `lower`, `upper`, `trim`, `first`,
//! `date` and `default('value')`.
//!
//! Rendered values of `None` (any case) or the empty string collapse to
//! "no value".

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;

use moldap_common::{Error, Result};

/// Marker a renderer produces for absent values.
const SENTINEL: &str = "none";

#[derive(Debug, Clone, PartialEq)]
enum FilterOp {
    Lower,
    Upper,
    Trim,
    First,
    Date,
    Default(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Expr {
    path: Vec<String>,
    filters: Vec<FilterOp>,
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Literal(String),
    Expr(Expr),
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    parts: Vec<Part>,
}

impl Template {
    /// # Errors
    /// - `Configuration` for unbalanced braces, empty paths or unknown filters
    pub fn parse(source: &str) -> Result<Self> {
        let mut parts = Vec::new();
        let mut rest = source;
        while let Some(start) = rest.find("{{") {
            if start > 0 {
                parts.push(Part::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| {
                Error::Configuration(format!("Unterminated expression in template {:?}", source))
            })?;
            parts.push(Part::Expr(parse_expr(&after[..end], source)?));
            rest = &after[end + 2..];
        }
        if rest.contains("}}") {
            return Err(Error::Configuration(format!(
                "Unbalanced braces in template {:?}",
                source
            )));
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            parts,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Paths referenced by the template's expressions.
    pub fn paths(&self) -> impl Iterator<Item = &[String]> {
        self.parts.iter().filter_map(|part| match part {
            Part::Expr(expr) => Some(expr.path.as_slice()),
            Part::Literal(_) => None,
        })
    }

    /// Render to a single value; `None` when the result collapses.
    pub fn render(&self, context: &Value) -> Option<String> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Expr(expr) => {
                    let value = expr.evaluate(context);
                    out.push_str(&scalar_text(first_of(&value)));
                }
            }
        }
        collapse(out)
    }

    /// Render to possibly several values.
    ///
    /// A template consisting of one expression that resolves to a list
    /// yields one value per element; anything else yields at most one.
    pub fn render_values(&self, context: &Value) -> Vec<String> {
        if let [Part::Expr(expr)] = self.parts.as_slice() {
            if let Value::Array(items) = lookup(context, &expr.path) {
                let element = Expr {
                    path: Vec::new(),
                    filters: expr.filters.clone(),
                };
                return items
                    .iter()
                    .filter_map(|item| collapse(scalar_text(&element.apply(item.clone()))))
                    .collect();
            }
        }
        self.render(context).into_iter().collect()
    }
}

fn parse_expr(body: &str, source: &str) -> Result<Expr> {
    let mut pieces = body.split('|').map(str::trim);
    let path_text = pieces.next().unwrap_or_default();
    if path_text.is_empty() {
        return Err(Error::Configuration(format!(
            "Empty expression in template {:?}",
            source
        )));
    }
    let path: Vec<String> = path_text.split('.').map(str::to_string).collect();
    if path.iter().any(|segment| !is_identifier(segment)) {
        return Err(Error::Configuration(format!(
            "Invalid path {:?} in template {:?}",
            path_text, source
        )));
    }
    let filters = pieces
        .map(|name| parse_filter(name, source))
        .collect::<Result<Vec<_>>>()?;
    Ok(Expr { path, filters })
}

fn is_identifier(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn parse_filter(text: &str, source: &str) -> Result<FilterOp> {
    match text {
        "lower" => return Ok(FilterOp::Lower),
        "upper" => return Ok(FilterOp::Upper),
        "trim" => return Ok(FilterOp::Trim),
        "first" => return Ok(FilterOp::First),
        "date" => return Ok(FilterOp::Date),
        _ => {}
    }
    if let Some(argument) = text
        .strip_prefix("default(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        let argument = argument.trim();
        let unquoted = argument
            .strip_prefix('\'')
            .and_then(|a| a.strip_suffix('\''))
            .or_else(|| argument.strip_prefix('"').and_then(|a| a.strip_suffix('"')));
        if let Some(value) = unquoted {
            return Ok(FilterOp::Default(value.to_string()));
        }
    }
    Err(Error::Configuration(format!(
        "Unknown filter {:?} in template {:?}",
        text, source
    )))
}

impl Expr {
    fn evaluate(&self, context: &Value) -> Value {
        self.apply(lookup(context, &self.path).clone())
    }

    fn apply(&self, mut value: Value) -> Value {
        for filter in &self.filters {
            value = match filter {
                FilterOp::First => first_of(&value).clone(),
                FilterOp::Default(fallback) => {
                    if is_absent(&value) {
                        Value::String(fallback.clone())
                    } else {
                        value
                    }
                }
                op => map_text(&value, &|text: &str| match op {
                    FilterOp::Lower => text.to_lowercase(),
                    FilterOp::Upper => text.to_uppercase(),
                    FilterOp::Trim => text.trim().to_string(),
                    FilterOp::Date => to_date(text).unwrap_or_default(),
                    FilterOp::First | FilterOp::Default(_) => text.to_string(),
                }),
            };
        }
        value
    }
}

fn lookup<'a>(context: &'a Value, path: &[String]) -> &'a Value {
    let mut current = context;
    for segment in path {
        current = match current {
            Value::Object(map) => map
                .get(segment)
                .or_else(|| {
                    map.iter()
                        .find(|(key, _)| key.eq_ignore_ascii_case(segment))
                        .map(|(_, value)| value)
                })
                .unwrap_or(&Value::Null),
            _ => &Value::Null,
        };
    }
    current
}

fn first_of(value: &Value) -> &Value {
    match value {
        Value::Array(items) => items.first().unwrap_or(&Value::Null),
        other => other,
    }
}

fn map_text(value: &Value, f: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Array(items) => Value::Array(items.iter().map(|item| map_text(item, f)).collect()),
        other => Value::String(f(&scalar_text(other))),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::Null => SENTINEL.to_string(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(_) => scalar_text(first_of(value)),
        Value::Object(_) => value.to_string(),
    }
}

fn is_absent(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => collapse(text.clone()).is_none(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn collapse(rendered: String) -> Option<String> {
    let trimmed = rendered.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(SENTINEL) {
        None
    } else {
        Some(rendered)
    }
}

/// Parse a date or timestamp as rendered by templates or the directory.
///
/// Accepts RFC 3339, plain `YYYY-MM-DD`, and directory generalized time
/// (`YYYYmmddHHMMSS[.f]Z` or with a `+0000` offset).
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(at.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|at| at.and_utc());
    }
    let generalized = text.replace('Z', "+0000");
    ["%Y%m%d%H%M%S%.f%z", "%Y%m%d%H%M%S%z"]
        .iter()
        .find_map(|format| DateTime::parse_from_str(&generalized, format).ok())
        .map(|at| at.with_timezone(&Utc))
}

fn to_date(text: &str) -> Option<String> {
    parse_timestamp(text).map(|at| at.format("%Y-%m-%d").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "ldap": {"givenName": "Anna", "mail": ["a@x.dk", "b@x.dk"], "title": null},
            "person": {"surname": "Hansen", "cpr_number": "0101011234"},
            "class": {"EmailEmployee": "4d4e3e9c-0000-0000-0000-000000000001"}
        })
    }

    #[test]
    fn test_render_literal_and_expressions() {
        let template = Template::parse("{{ ldap.givenname }} {{ person.surname | upper }}").unwrap();
        assert_eq!(template.render(&context()).as_deref(), Some("Anna HANSEN"));
    }

    #[test]
    fn test_sentinel_collapses() {
        assert_eq!(Template::parse("{{ ldap.title }}").unwrap().render(&context()), None);
        assert_eq!(Template::parse("{{ ldap.missing }}").unwrap().render(&context()), None);
        assert_eq!(Template::parse("None").unwrap().render(&context()), None);
        assert_eq!(Template::parse("").unwrap().render(&context()), None);
    }

    #[test]
    fn test_default_filter() {
        let template = Template::parse("{{ ldap.title | default('Medarbejder') }}").unwrap();
        assert_eq!(template.render(&context()).as_deref(), Some("Medarbejder"));
    }

    #[test]
    fn test_render_values_expands_lists() {
        let template = Template::parse("{{ ldap.mail | upper }}").unwrap();
        assert_eq!(template.render_values(&context()), vec!["A@X.DK", "B@X.DK"]);

        let single = Template::parse("<{{ ldap.mail }}>").unwrap();
        assert_eq!(single.render_values(&context()), vec!["<a@x.dk>"]);
    }

    #[test]
    fn test_parse_errors_are_configuration() {
        for source in ["{{ ldap.x", "{{ }}", "{{ ldap.x | shout }}", "a }}", "{{ a..b }}"] {
            assert!(
                matches!(Template::parse(source), Err(Error::Configuration(_))),
                "{}",
                source
            );
        }
    }

    #[test]
    fn test_paths() {
        let template = Template::parse("{{ class.EmailEmployee }}-{{ ldap.cn }}").unwrap();
        let paths: Vec<String> = template.paths().map(|p| p.join(".")).collect();
        assert_eq!(paths, vec!["class.EmailEmployee", "ldap.cn"]);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = "2024-03-01T00:00:00Z";
        for text in ["2024-03-01", "2024-03-01T00:00:00Z", "20240301000000.0Z", "20240301000000+0000"] {
            assert_eq!(
                parse_timestamp(text).map(|at| at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
                Some(expected.to_string()),
                "{}",
                text
            );
        }
        assert!(parse_timestamp("tomorrow").is_none());
    }

    #[test]
    fn test_date_filter() {
        let ctx = json!({"ldap": {"whenCreated": "20240301101500.0Z"}});
        let template = Template::parse("{{ ldap.whenCreated | date }}").unwrap();
        assert_eq!(template.render(&ctx).as_deref(), Some("2024-03-01"));
    }
}
