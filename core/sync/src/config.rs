//! Engine configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use moldap_common::{Error, Kind, Result};
use moldap_directory::LdapSettings;
use moldap_remote::{ObjectKind, RemoteSettings};

use crate::dispatcher::DEFAULT_MAX_CONCURRENT_EVENTS;
use crate::echo::DEFAULT_ECHO_TTL_SECS;
use crate::mapping::MappingSettings;
use crate::retry::RetrySettings;

/// The kind every deployment must map.
pub const EMPLOYEE_KIND: &str = "Employee";

/// Complete engine configuration, loaded from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    pub ldap: LdapSettings,
    pub remote: RemoteSettings,
    pub mapping: MappingSettings,
    /// Seconds between directory polls.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Seconds an echo token stays valid.
    #[serde(default = "default_echo_ttl_secs")]
    pub echo_ttl_secs: u64,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default = "default_max_concurrent_events")]
    pub max_concurrent_events: usize,
    /// User key of the IT system holding directory unique ids.
    #[serde(default)]
    pub it_system: Option<String>,
    /// Where poll cursors survive restarts. Kept in memory when absent.
    #[serde(default)]
    pub cursor_file: Option<PathBuf>,
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_echo_ttl_secs() -> u64 {
    DEFAULT_ECHO_TTL_SECS.unsigned_abs()
}

fn default_max_concurrent_events() -> usize {
    DEFAULT_MAX_CONCURRENT_EVENTS
}

impl SyncSettings {
    /// Read and validate settings.
    ///
    /// # Errors
    /// - `Io` if the file cannot be read
    /// - `Configuration` if it does not parse or does not validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let settings = Self::from_json(&raw).map_err(|e| match e {
            Error::Configuration(msg) => {
                Error::Configuration(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })?;
        Ok(settings)
    }

    /// Parse and validate settings from a JSON document.
    pub fn from_json(raw: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(raw)
            .map_err(|e| Error::Configuration(format!("Invalid settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// # Errors
    /// - `Configuration` for the first problem found
    pub fn validate(&self) -> Result<()> {
        self.ldap.validate()?;
        self.remote.validate()?;

        if !self.mapping.contains_key(&Kind::from(EMPLOYEE_KIND)) {
            return Err(Error::Configuration(format!(
                "Mapping for '{}' is required",
                EMPLOYEE_KIND
            )));
        }
        for (kind, rules) in &self.mapping {
            if rules.remote_kind == ObjectKind::OrgUnit && rules.import_to_remote {
                return Err(Error::Configuration(format!(
                    "Kind {} cannot import org units",
                    kind
                )));
            }
            if rules.to_directory.is_empty() && rules.from_directory.is_empty() {
                return Err(Error::Configuration(format!("Kind {} maps nothing", kind)));
            }
        }

        if self.poll_interval_secs == 0 {
            return Err(Error::Configuration("poll_interval_secs must be positive".to_string()));
        }
        if self.echo_ttl_secs == 0 {
            return Err(Error::Configuration("echo_ttl_secs must be positive".to_string()));
        }
        if self.max_concurrent_events == 0 {
            return Err(Error::Configuration(
                "max_concurrent_events must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Configuration("retry.max_attempts must be positive".to_string()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn echo_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.echo_ttl_secs).unwrap_or(i64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample() -> serde_json::Value {
        serde_json::json!({
            "ldap": {
                "servers": [{"host": "dc1"}],
                "bind_dn": "CN=sync,DC=ad",
                "password": "hunter2",
                "search_base": "DC=ad",
                "ous_to_poll": ["OU=Users"],
                "cpr_attribute": "employeeID"
            },
            "remote": {
                "graphql_url": "http://mo:5000/graphql/v22",
                "token_url": "http://keycloak:8080/auth/realms/mo/protocol/openid-connect/token",
                "client_id": "dipex",
                "client_secret": "secret"
            },
            "mapping": {
                "Employee": {
                    "remote_kind": "person",
                    "to_directory": {"sn": "{{ person.surname }}"},
                    "from_directory": {"surname": "{{ ldap.sn }}"}
                }
            },
            "it_system": "ADGUID"
        })
    }

    #[test]
    fn test_defaults_applied() {
        let settings = SyncSettings::from_json(&sample().to_string()).unwrap();
        assert_eq!(settings.poll_interval(), Duration::from_secs(5));
        assert_eq!(settings.echo_ttl(), chrono::Duration::seconds(60));
        assert_eq!(settings.max_concurrent_events, 10);
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.it_system.as_deref(), Some("ADGUID"));
        assert!(settings.cursor_file.is_none());
    }

    #[test]
    fn test_employee_mapping_required() {
        let mut raw = sample();
        raw["mapping"] = serde_json::json!({
            "EmailEmployee": {
                "remote_kind": "address",
                "to_directory": {"mail": "{{ object.value }}"}
            }
        });
        assert!(matches!(
            SyncSettings::from_json(&raw.to_string()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_unknown_remote_kind_rejected() {
        let mut raw = sample();
        raw["mapping"]["Employee"]["remote_kind"] = serde_json::json!("spaceship");
        assert!(matches!(
            SyncSettings::from_json(&raw.to_string()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut raw = sample();
        raw["max_concurrent_events"] = serde_json::json!(0);
        assert!(matches!(
            SyncSettings::from_json(&raw.to_string()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_empty_discriminator_rejected() {
        let mut raw = sample();
        raw["ldap"]["discriminator"] = serde_json::json!({
            "attribute": "extensionAttribute1",
            "mode": "exclude",
            "values": []
        });
        assert!(matches!(
            SyncSettings::from_json(&raw.to_string()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample().to_string().as_bytes()).unwrap();
        let settings = SyncSettings::load(file.path()).unwrap();
        assert_eq!(settings.ldap.poll_bases().unwrap().len(), 1);

        let missing = file.path().with_extension("missing");
        assert!(matches!(SyncSettings::load(missing), Err(Error::Io(_))));
    }
}
