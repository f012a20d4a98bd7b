//! Directory connection and correlation settings.

use serde::Deserialize;

use moldap_common::{Dn, Error, Result, Secret};

use crate::discriminator::Discriminator;

/// Settings model for one domain controller.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// Hostname / IP to establish connection with.
    pub host: String,
    /// Defaults to 636 for SSL and 389 otherwise.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub use_ssl: bool,
    /// Skip certificate verification.
    #[serde(default)]
    pub insecure: bool,
    /// Seconds to wait for a connection.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl ServerSettings {
    pub fn url(&self) -> String {
        let (scheme, default_port) = if self.use_ssl {
            ("ldaps", 636)
        } else {
            ("ldap", 389)
        };
        format!("{}://{}:{}", scheme, self.host, self.port.unwrap_or(default_port))
    }
}

/// Directory settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LdapSettings {
    /// Domain controllers, tried in order.
    pub servers: Vec<ServerSettings>,
    pub bind_dn: String,
    pub password: Secret,
    /// Search base for all requests.
    pub search_base: String,
    /// OUs (relative to the search base) to poll for changes.
    /// Empty means poll the whole search base.
    #[serde(default)]
    pub ous_to_poll: Vec<String>,
    /// Vendor-stable unique identifier attribute.
    #[serde(default = "default_unique_id_attribute")]
    pub unique_id_attribute: String,
    /// Attribute carrying the personal correlation id, if any.
    #[serde(default)]
    pub cpr_attribute: Option<String>,
    /// Attributes the directory schema declares single-valued.
    #[serde(default)]
    pub single_valued: Vec<String>,
    #[serde(default)]
    pub discriminator: Option<Discriminator>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_unique_id_attribute() -> String {
    "entryUUID".to_string()
}

fn default_page_size() -> u32 {
    500
}

fn default_max_pages() -> u32 {
    10_000
}

impl LdapSettings {
    /// Minimal settings for a given search base, mostly for tests.
    pub fn for_base(search_base: impl Into<String>) -> Self {
        Self {
            servers: Vec::new(),
            bind_dn: String::new(),
            password: Secret::new(""),
            search_base: search_base.into(),
            ous_to_poll: Vec::new(),
            unique_id_attribute: default_unique_id_attribute(),
            cpr_attribute: None,
            single_valued: Vec::new(),
            discriminator: None,
            page_size: default_page_size(),
            max_pages: default_max_pages(),
        }
    }

    /// Parsed search base.
    pub fn search_base(&self) -> Result<Dn> {
        Dn::parse(&self.search_base)
            .map_err(|e| Error::Configuration(format!("Invalid search base: {}", e)))
    }

    /// Absolute bases the poller should scan.
    pub fn poll_bases(&self) -> Result<Vec<Dn>> {
        let base = self.search_base()?;
        if self.ous_to_poll.is_empty() {
            return Ok(vec![base]);
        }
        let mut bases: Vec<Dn> = Vec::new();
        for ou in &self.ous_to_poll {
            let combined = if ou.trim().is_empty() {
                base.clone()
            } else {
                Dn::parse(format!("{},{}", ou.trim(), base.as_str())).map_err(|e| {
                    Error::Configuration(format!("Invalid OU '{}': {}", ou, e))
                })?
            };
            if !bases.contains(&combined) {
                bases.push(combined);
            }
        }
        Ok(bases)
    }

    pub fn is_single_valued(&self, attribute: &str) -> bool {
        self.single_valued
            .iter()
            .any(|a| a.eq_ignore_ascii_case(attribute))
    }

    /// Upper bound on entries returned by one paged search.
    pub fn max_entries(&self) -> usize {
        self.page_size as usize * self.max_pages as usize
    }

    /// Check the settings for static mistakes.
    ///
    /// # Errors
    /// - `Configuration` for an empty server list, an unparsable search base,
    ///   a zero page size, or a discriminator without values
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::Configuration(
                "At least one LDAP server must be configured".to_string(),
            ));
        }
        self.poll_bases()?;
        if self.page_size == 0 {
            return Err(Error::Configuration("page_size must be positive".to_string()));
        }
        if let Some(discriminator) = &self.discriminator {
            discriminator.validate()?;
        }
        Ok(())
    }
}
