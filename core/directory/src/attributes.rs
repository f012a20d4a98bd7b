//! Case-insensitive attribute bags for directory entries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;

use moldap_common::Dn;

/// Value of a single directory attribute.
///
/// Whether an attribute is single- or multi-valued is a schema property;
/// callers read through [`AttributeValue::first`] and
/// [`AttributeValue::values`] so they never have to care.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Scalar(String),
    List(Vec<String>),
}

impl AttributeValue {
    /// Build from raw values, collapsing a one-element list to a scalar.
    pub fn from_values(mut values: Vec<String>) -> Self {
        if values.len() == 1 {
            AttributeValue::Scalar(values.remove(0))
        } else {
            AttributeValue::List(values)
        }
    }

    /// All values, in order.
    pub fn values(&self) -> Vec<&str> {
        match self {
            AttributeValue::Scalar(v) => vec![v.as_str()],
            AttributeValue::List(vs) => vs.iter().map(String::as_str).collect(),
        }
    }

    /// Owned copy of all values.
    pub fn to_vec(&self) -> Vec<String> {
        self.values().into_iter().map(str::to_string).collect()
    }

    /// First value, if any.
    pub fn first(&self) -> Option<&str> {
        match self {
            AttributeValue::Scalar(v) => Some(v.as_str()),
            AttributeValue::List(vs) => vs.first().map(String::as_str),
        }
    }

    /// No values, or a single empty string.
    pub fn is_empty(&self) -> bool {
        match self {
            AttributeValue::Scalar(v) => v.is_empty(),
            AttributeValue::List(vs) => vs.iter().all(String::is_empty),
        }
    }

    /// Whether `value` is one of the values (exact match).
    pub fn contains(&self, value: &str) -> bool {
        self.values().contains(&value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Scalar(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Scalar(value)
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(values: Vec<String>) -> Self {
        AttributeValue::List(values)
    }
}

/// Attribute bag keyed by lowercased name, remembering the spelling first seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    entries: BTreeMap<String, (String, AttributeValue)>,
}

impl Attributes {
    /// Create an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the multi-valued map an LDAP search returns.
    pub fn from_multi_map(map: HashMap<String, Vec<String>>) -> Self {
        let mut attrs = Self::new();
        for (name, values) in map {
            attrs.set(name, AttributeValue::from_values(values));
        }
        attrs
    }

    /// Set an attribute, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttributeValue>) {
        let name = name.into();
        let key = name.to_lowercase();
        let spelled = match self.entries.get(&key) {
            Some((existing, _)) => existing.clone(),
            None => name,
        };
        self.entries.insert(key, (spelled, value.into()));
    }

    /// Builder-style [`Attributes::set`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.entries.get(&name.to_lowercase()).map(|(_, v)| v)
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(AttributeValue::first)
    }

    /// All values of an attribute; empty when absent.
    pub fn all(&self, name: &str) -> Vec<&str> {
        self.get(name).map(AttributeValue::values).unwrap_or_default()
    }

    pub fn remove(&mut self, name: &str) -> Option<AttributeValue> {
        self.entries.remove(&name.to_lowercase()).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_lowercase())
    }

    /// Attribute names as first spelled.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.entries.values().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keep only the named attributes (case-insensitive). `*` keeps all.
    pub fn project(&self, names: &[String]) -> Self {
        if names.is_empty() || names.iter().any(|n| n == "*") {
            return self.clone();
        }
        let wanted: Vec<String> = names.iter().map(|n| n.to_lowercase()).collect();
        Self {
            entries: self
                .entries
                .iter()
                .filter(|(key, _)| wanted.contains(key))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// A directory entry snapshot: its DN plus the attributes that were requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub dn: Dn,
    pub attributes: Attributes,
}

impl DirectoryEntry {
    pub fn new(dn: Dn, attributes: Attributes) -> Self {
        Self { dn, attributes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let attrs = Attributes::new().with("givenName", "Jane");
        assert_eq!(attrs.first("givenname"), Some("Jane"));
        assert_eq!(attrs.first("GIVENNAME"), Some("Jane"));
        assert_eq!(attrs.names().collect::<Vec<_>>(), vec!["givenName"]);
    }

    #[test]
    fn test_set_keeps_first_spelling() {
        let mut attrs = Attributes::new().with("mail", "a@example.org");
        attrs.set("MAIL", "b@example.org");
        assert_eq!(attrs.names().collect::<Vec<_>>(), vec!["mail"]);
        assert_eq!(attrs.first("mail"), Some("b@example.org"));
    }

    #[test]
    fn test_single_and_multi_valued_accessors() {
        let attrs = Attributes::from_multi_map(HashMap::from([
            ("title".to_string(), vec!["Engineer".to_string()]),
            (
                "mobile".to_string(),
                vec!["1111".to_string(), "2222".to_string()],
            ),
        ]));
        assert_eq!(attrs.get("title"), Some(&AttributeValue::Scalar("Engineer".into())));
        assert_eq!(attrs.all("mobile"), vec!["1111", "2222"]);
        assert_eq!(attrs.first("mobile"), Some("1111"));
        assert!(attrs.all("missing").is_empty());
    }

    #[test]
    fn test_project() {
        let attrs = Attributes::new()
            .with("cn", "x")
            .with("mail", "y")
            .with("title", "z");
        let projected = attrs.project(&["Mail".to_string(), "cn".to_string()]);
        assert_eq!(projected.len(), 2);
        assert!(!projected.contains("title"));
        assert_eq!(attrs.project(&["*".to_string()]).len(), 3);
    }

    #[test]
    fn test_empty_values() {
        assert!(AttributeValue::List(vec![]).is_empty());
        assert!(AttributeValue::Scalar(String::new()).is_empty());
        assert!(!AttributeValue::from("x").is_empty());
    }
}
