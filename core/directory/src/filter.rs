//! Typed search filters and directory timestamp formatting.

use chrono::{DateTime, Datelike, Utc};

use crate::attributes::Attributes;

/// Search filter, rendered to RFC 4515 syntax for the wire and evaluated
/// directly by the in-memory backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equals(String, String),
    Present(String),
    GreaterOrEqual(String, String),
}

impl Filter {
    pub fn equals(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Equals(attribute.into(), value.into())
    }

    pub fn present(attribute: impl Into<String>) -> Self {
        Filter::Present(attribute.into())
    }

    pub fn object_class(object_class: impl Into<String>) -> Self {
        Filter::Equals("objectClass".to_string(), object_class.into())
    }

    /// Entries modified at or after `since`.
    pub fn modified_since(since: DateTime<Utc>) -> Self {
        Filter::GreaterOrEqual("modifyTimestamp".to_string(), ldap_timestamp(since))
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::And(mut filters) => {
                filters.push(other);
                Filter::And(filters)
            }
            first => Filter::And(vec![first, other]),
        }
    }

    /// Render as an RFC 4515 string.
    pub fn to_ldap_string(&self) -> String {
        match self {
            Filter::And(filters) => {
                let inner: String = filters.iter().map(Filter::to_ldap_string).collect();
                format!("(&{})", inner)
            }
            Filter::Or(filters) => {
                let inner: String = filters.iter().map(Filter::to_ldap_string).collect();
                format!("(|{})", inner)
            }
            Filter::Not(filter) => format!("(!{})", filter.to_ldap_string()),
            Filter::Equals(attribute, value) => {
                format!("({}={})", attribute, escape_filter_value(value))
            }
            Filter::Present(attribute) => format!("({}=*)", attribute),
            Filter::GreaterOrEqual(attribute, value) => {
                format!("({}>={})", attribute, escape_filter_value(value))
            }
        }
    }

    /// Evaluate against an attribute bag. Equality is case-insensitive,
    /// ordering compares the raw strings.
    pub fn matches(&self, attributes: &Attributes) -> bool {
        match self {
            Filter::And(filters) => filters.iter().all(|f| f.matches(attributes)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(attributes)),
            Filter::Not(filter) => !filter.matches(attributes),
            Filter::Equals(attribute, value) => attributes
                .all(attribute)
                .iter()
                .any(|v| v.eq_ignore_ascii_case(value)),
            Filter::Present(attribute) => attributes
                .get(attribute)
                .is_some_and(|v| !v.is_empty()),
            Filter::GreaterOrEqual(attribute, value) => attributes
                .all(attribute)
                .iter()
                .any(|v| *v >= value.as_str()),
        }
    }
}

/// Escape special characters in filter values (RFC 4515).
pub fn escape_filter_value(value: &str) -> String {
    value
        .replace('\\', "\\5c")
        .replace('*', "\\2a")
        .replace('(', "\\28")
        .replace(')', "\\29")
        .replace('\0', "\\00")
}

/// Format a timestamp as directory generalized time, e.g.
/// `20220101120000.000000+0000`. The year is always four digits.
pub fn ldap_timestamp(at: DateTime<Utc>) -> String {
    format!("{:04}{}", at.year(), at.format("%m%d%H%M%S.%6f%z"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_render_nested_filter() {
        let filter = Filter::object_class("user")
            .and(Filter::equals("employeeID", "0101011234"))
            .and(Filter::Not(Box::new(Filter::present("disabled"))));
        assert_eq!(
            filter.to_ldap_string(),
            "(&(objectClass=user)(employeeID=0101011234)(!(disabled=*)))"
        );
    }

    #[test]
    fn test_escape_values() {
        let filter = Filter::equals("cn", "a*(b)\\");
        assert_eq!(filter.to_ldap_string(), "(cn=a\\2a\\28b\\29\\5c)");
    }

    #[test]
    fn test_ldap_timestamp_format() {
        let at = Utc.with_ymd_and_hms(2022, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(ldap_timestamp(at), "20220102030405.000000+0000");
    }

    #[test]
    fn test_ldap_timestamp_pads_year() {
        let at = Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap();
        assert!(ldap_timestamp(at).starts_with("0001"));
    }

    #[test]
    fn test_matches() {
        let attrs = Attributes::new()
            .with("objectClass", vec!["top".to_string(), "user".to_string()])
            .with("modifyTimestamp", "20220102030405.000000+0000");
        assert!(Filter::object_class("USER").matches(&attrs));
        assert!(!Filter::object_class("group").matches(&attrs));
        let since = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
        assert!(Filter::modified_since(since).matches(&attrs));
        let later = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        assert!(!Filter::modified_since(later).matches(&attrs));
        assert!(Filter::present("objectClass").matches(&attrs));
        assert!(!Filter::present("mail").matches(&attrs));
    }
}
