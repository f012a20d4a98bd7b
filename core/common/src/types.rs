//! Common types used throughout the synchronization crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

/// A distinguished name: the directory's mutable, hierarchical key.
///
/// The original spelling is preserved for writes; comparisons and map keys
/// go through [`Dn::normalized`], which lowercases and strips whitespace
/// around the separators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dn(String);

impl Dn {
    /// Parse a DN string.
    ///
    /// # Errors
    /// - Returns error if the string is empty or any RDN lacks `attr=value`
    pub fn parse(dn: impl Into<String>) -> crate::Result<Self> {
        let dn = dn.into();
        let trimmed = dn.trim();
        if trimmed.is_empty() {
            return Err(crate::Error::InvalidInput("DN cannot be empty".to_string()));
        }
        for rdn in split_rdns(trimmed) {
            if !rdn.contains('=') {
                return Err(crate::Error::InvalidInput(format!(
                    "Invalid RDN '{}' in DN '{}'",
                    rdn, trimmed
                )));
            }
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Get the DN as written.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-normalized form, used as exclusivity and echo key.
    pub fn normalized(&self) -> String {
        split_rdns(&self.0)
            .map(|rdn| match rdn.split_once('=') {
                Some((attr, value)) => {
                    format!("{}={}", attr.trim().to_lowercase(), value.trim().to_lowercase())
                }
                None => rdn.trim().to_lowercase(),
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// The DN one level up, if any.
    pub fn parent(&self) -> Option<Self> {
        let rdns: Vec<&str> = split_rdns(&self.0).collect();
        if rdns.len() <= 1 {
            return None;
        }
        Some(Self(rdns[1..].join(",")))
    }

    /// The leftmost RDN (e.g. `CN=Jane Doe`).
    pub fn rdn(&self) -> &str {
        split_rdns(&self.0).next().unwrap_or(&self.0)
    }

    /// Whether this DN lies at or below `base`.
    pub fn is_within(&self, base: &Dn) -> bool {
        let me = self.normalized();
        let base = base.normalized();
        me == base || me.ends_with(&format!(",{}", base))
    }
}

/// Split a DN at unescaped commas.
fn split_rdns(dn: &str) -> impl Iterator<Item = &str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, ch) in dn.char_indices() {
        match ch {
            '\\' if !escaped => escaped = true,
            ',' if !escaped => {
                parts.push(dn[start..i].trim());
                start = i + 1;
            }
            _ => escaped = false,
        }
    }
    parts.push(dn[start..].trim());
    parts.into_iter().filter(|p| !p.is_empty())
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for Dn {}

impl std::hash::Hash for Dn {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration-defined tag naming a mapping rule set, e.g. `Employee`,
/// `EmailEmployee` or `ADtitle`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kind(String);

impl Kind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Kind {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Secret string (bind passwords, client secrets) that zeroizes on drop.
#[derive(Clone, Zeroize, Deserialize)]
#[zeroize(drop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the secret for handing to a client library.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dn_parse_rejects_empty() {
        assert!(Dn::parse("").is_err());
        assert!(Dn::parse("   ").is_err());
        assert!(Dn::parse("no-equals-sign").is_err());
    }

    #[test]
    fn test_dn_normalized_equality() {
        let a = Dn::parse("CN=Jane Doe,OU=Users,DC=example,DC=org").unwrap();
        let b = Dn::parse("cn=jane doe, ou=users, dc=Example, dc=org").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.normalized(), "cn=jane doe,ou=users,dc=example,dc=org");
        // The written form survives normalization.
        assert_eq!(a.as_str(), "CN=Jane Doe,OU=Users,DC=example,DC=org");
    }

    #[test]
    fn test_dn_escaped_comma() {
        let dn = Dn::parse(r"CN=Doe\, Jane,OU=Users,DC=example").unwrap();
        assert_eq!(dn.rdn(), r"CN=Doe\, Jane");
        assert_eq!(dn.parent().unwrap().as_str(), "OU=Users,DC=example");
    }

    #[test]
    fn test_dn_is_within() {
        let base = Dn::parse("DC=example,DC=org").unwrap();
        let dn = Dn::parse("CN=x,OU=Users,DC=example,DC=org").unwrap();
        assert!(dn.is_within(&base));
        assert!(base.is_within(&base));
        assert!(!base.is_within(&dn));
    }

    #[test]
    fn test_secret_debug_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret([REDACTED])");
        assert_eq!(secret.expose(), "hunter2");
    }
}
