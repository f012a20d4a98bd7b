//! LDAP directory backend built on `ldap3`.

use async_trait::async_trait;
use ldap3::adapters::{Adapter, EntriesOnly, PagedResults};
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapError, Mod, Scope, SearchEntry};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use moldap_common::{Dn, Error, Result};

use crate::attributes::{Attributes, DirectoryEntry};
use crate::backend::{Directory, Modification, SearchRequest, SearchScope};
use crate::config::{LdapSettings, ServerSettings};

/// `noSuchObject`
const RC_NO_SUCH_OBJECT: u32 = 32;
/// `invalidCredentials`
const RC_INVALID_CREDENTIALS: u32 = 49;

/// Result codes meaning the server understood the request and refused the
/// values: noSuchAttribute, constraintViolation, attributeOrValueExists,
/// invalidAttributeSyntax, namingViolation, objectClassViolation,
/// notAllowedOnNonLeaf, entryAlreadyExists, unwillingToPerform.
const REJECTION_CODES: &[u32] = &[16, 19, 20, 21, 53, 64, 65, 66, 68];

/// Directory backed by one or more LDAP servers.
///
/// A single connection is established lazily and shared by every caller;
/// `ldap3::Ldap` handles multiplex over it. A transport failure drops the
/// cached handle so the next call reconnects, trying servers in order.
pub struct LdapDirectory {
    settings: LdapSettings,
    connection: Arc<RwLock<Option<Ldap>>>,
}

impl LdapDirectory {
    /// Create a directory backend. No connection is made until first use.
    ///
    /// # Errors
    /// - `Configuration` if the settings are invalid
    pub fn new(settings: LdapSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            connection: Arc::new(RwLock::new(None)),
        })
    }

    fn operation_timeout(&self) -> Duration {
        let secs = self
            .settings
            .servers
            .iter()
            .map(|s| s.timeout_secs)
            .max()
            .unwrap_or(5);
        Duration::from_secs(secs.max(1) * 6)
    }

    async fn get_connection(&self) -> Result<Ldap> {
        {
            let guard = self.connection.read().await;
            if let Some(ref ldap) = *guard {
                return Ok(ldap.clone());
            }
        }

        let mut guard = self.connection.write().await;
        if let Some(ref ldap) = *guard {
            return Ok(ldap.clone());
        }

        let mut last_error = Error::Configuration("No LDAP servers configured".to_string());
        for server in &self.settings.servers {
            match self.connect(server).await {
                Ok(ldap) => {
                    *guard = Some(ldap.clone());
                    return Ok(ldap);
                }
                Err(e) => {
                    warn!(host = %server.host, error = %e, "LDAP server unreachable, trying next");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn connect(&self, server: &ServerSettings) -> Result<Ldap> {
        let url = server.url();
        debug!(url = %url, "Connecting to LDAP server");

        let conn_settings = LdapConnSettings::new()
            .set_conn_timeout(Duration::from_secs(server.timeout_secs))
            .set_no_tls_verify(server.insecure);

        let (conn, mut ldap) = LdapConnAsync::with_settings(conn_settings, &url)
            .await
            .map_err(|e| Error::Transport(format!("Failed to connect to {}: {}", url, e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection driver error");
            }
        });

        let result = ldap
            .simple_bind(&self.settings.bind_dn, self.settings.password.expose())
            .await
            .map_err(|e| Error::Transport(format!("LDAP bind failed: {}", e)))?;

        if result.rc == RC_INVALID_CREDENTIALS {
            return Err(Error::Configuration(format!(
                "Invalid credentials for {}",
                self.settings.bind_dn
            )));
        }
        if result.rc != 0 {
            return Err(Error::Transport(format!(
                "LDAP bind failed with code {}: {}",
                result.rc, result.text
            )));
        }

        info!(host = %server.host, "LDAP connection established");
        Ok(ldap)
    }

    /// Forget the cached connection after a transport-level failure.
    async fn reset(&self) {
        *self.connection.write().await = None;
    }

    async fn transport_error(&self, context: &str, err: LdapError) -> Error {
        self.reset().await;
        Error::Transport(format!("{}: {}", context, err))
    }
}

fn map_result_code(rc: u32, text: &str, dn: &Dn, operation: &str) -> Result<()> {
    match rc {
        0 => Ok(()),
        RC_NO_SUCH_OBJECT => Err(Error::NotFound(format!("No such object: {}", dn))),
        rc if REJECTION_CODES.contains(&rc) => Err(Error::BusinessRejection(format!(
            "LDAP {} on {} rejected with code {}: {}",
            operation, dn, rc, text
        ))),
        rc => Err(Error::Transport(format!(
            "LDAP {} on {} failed with code {}: {}",
            operation, dn, rc, text
        ))),
    }
}

fn to_ldap_mod(change: Modification) -> Mod<String> {
    match change {
        Modification::Add(name, values) => Mod::Add(name, values.into_iter().collect()),
        Modification::Replace(name, values) => Mod::Replace(name, values.into_iter().collect()),
        Modification::Delete(name, values) => Mod::Delete(name, values.into_iter().collect()),
    }
}

/// Convert a raw search entry. Sixteen-byte binary values (AD `objectGUID`)
/// are rendered as UUID strings; other binary values are dropped.
fn convert_entry(entry: SearchEntry) -> Option<DirectoryEntry> {
    let dn = match Dn::parse(&entry.dn) {
        Ok(dn) => dn,
        Err(e) => {
            warn!(dn = %entry.dn, error = %e, "Skipping entry with unparsable DN");
            return None;
        }
    };
    let mut attrs: HashMap<String, Vec<String>> = entry.attrs;
    for (name, values) in entry.bin_attrs {
        let rendered: Vec<String> = values
            .iter()
            .filter_map(|v| <[u8; 16]>::try_from(v.as_slice()).ok())
            .map(|bytes| Uuid::from_bytes_le(bytes).to_string())
            .collect();
        if !rendered.is_empty() {
            attrs.insert(name, rendered);
        }
    }
    Some(DirectoryEntry::new(dn, Attributes::from_multi_map(attrs)))
}

#[async_trait]
impl Directory for LdapDirectory {
    fn name(&self) -> &str {
        "ldap"
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<DirectoryEntry>> {
        let mut ldap = self.get_connection().await?;
        let filter = request.filter.to_ldap_string();
        let scope = match request.scope {
            SearchScope::Base => Scope::Base,
            SearchScope::Subtree => Scope::Subtree,
        };
        let attributes: Vec<String> = if request.attributes.is_empty() {
            vec!["*".to_string()]
        } else {
            request.attributes.clone()
        };
        let max_entries = self.settings.max_entries();

        debug!(base = %request.base, filter = %filter, "Searching LDAP");

        let adapters: Vec<Box<dyn Adapter<_, _>>> = vec![
            Box::new(EntriesOnly::new()),
            Box::new(PagedResults::new(self.settings.page_size as i32)),
        ];
        let mut stream = match ldap
            .with_timeout(self.operation_timeout())
            .streaming_search_with(adapters, request.base.as_str(), scope, &filter, attributes)
            .await
        {
            Ok(stream) => stream,
            Err(e) => return Err(self.transport_error("LDAP search failed", e).await),
        };

        let mut entries = Vec::new();
        let mut truncated = false;
        loop {
            match stream.next().await {
                Ok(Some(raw)) => {
                    if entries.len() >= max_entries {
                        truncated = true;
                        continue;
                    }
                    if let Some(entry) = convert_entry(SearchEntry::construct(raw)) {
                        entries.push(entry);
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(self.transport_error("LDAP search failed", e).await),
            }
        }
        let result = stream.finish().await;

        if truncated {
            warn!(base = %request.base, limit = max_entries, "Search result truncated");
        }
        match result.rc {
            0 => Ok(entries),
            RC_NO_SUCH_OBJECT => Ok(Vec::new()),
            rc => Err(Error::Transport(format!(
                "LDAP search under {} failed with code {}: {}",
                request.base, rc, result.text
            ))),
        }
    }

    async fn modify(&self, dn: &Dn, changes: Vec<Modification>) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut ldap = self.get_connection().await?;
        let mods: Vec<Mod<String>> = changes.into_iter().map(to_ldap_mod).collect();

        let result = match ldap
            .with_timeout(self.operation_timeout())
            .modify(dn.as_str(), mods)
            .await
        {
            Ok(result) => result,
            Err(e) => return Err(self.transport_error("LDAP modify failed", e).await),
        };
        map_result_code(result.rc, &result.text, dn, "modify")?;
        debug!(dn = %dn, "LDAP entry modified");
        Ok(())
    }

    async fn add(&self, dn: &Dn, object_class: &str, attributes: &Attributes) -> Result<()> {
        let mut ldap = self.get_connection().await?;

        let mut ldap_attrs: Vec<(String, HashSet<String>)> = vec![(
            "objectClass".to_string(),
            HashSet::from([object_class.to_string()]),
        )];
        for (name, value) in attributes.iter() {
            if name.eq_ignore_ascii_case("objectClass") || value.is_empty() {
                continue;
            }
            ldap_attrs.push((name.to_string(), value.to_vec().into_iter().collect()));
        }

        let result = match ldap
            .with_timeout(self.operation_timeout())
            .add(dn.as_str(), ldap_attrs)
            .await
        {
            Ok(result) => result,
            Err(e) => return Err(self.transport_error("LDAP add failed", e).await),
        };
        map_result_code(result.rc, &result.text, dn, "add")?;
        info!(dn = %dn, object_class = %object_class, "LDAP entry created");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dn() -> Dn {
        Dn::parse("CN=a,DC=x").unwrap()
    }

    #[test]
    fn test_result_code_mapping() {
        assert!(map_result_code(0, "", &dn(), "modify").is_ok());
        assert!(matches!(
            map_result_code(32, "", &dn(), "modify"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            map_result_code(19, "constraint", &dn(), "modify"),
            Err(Error::BusinessRejection(_))
        ));
        assert!(matches!(
            map_result_code(52, "unavailable", &dn(), "modify"),
            Err(Error::Transport(_))
        ));
    }

    #[test]
    fn test_to_ldap_mod() {
        match to_ldap_mod(Modification::Replace("title".into(), vec!["x".into()])) {
            Mod::Replace(name, values) => {
                assert_eq!(name, "title");
                assert!(values.contains("x"));
            }
            _ => panic!("expected replace"),
        }
    }

    #[test]
    fn test_convert_entry_renders_guid() {
        let guid = Uuid::parse_str("6f0f4a9c-0000-4000-8000-000000000001").unwrap();
        let entry = SearchEntry {
            dn: "CN=a,DC=x".to_string(),
            attrs: HashMap::from([("cn".to_string(), vec!["a".to_string()])]),
            bin_attrs: HashMap::from([(
                "objectGUID".to_string(),
                vec![guid.to_bytes_le().to_vec()],
            )]),
        };
        let converted = convert_entry(entry).unwrap();
        assert_eq!(converted.attributes.first("objectguid"), Some(guid.to_string().as_str()));
        assert_eq!(converted.attributes.first("cn"), Some("a"));
    }

    #[test]
    fn test_new_rejects_empty_servers() {
        let settings = LdapSettings::for_base("DC=x");
        assert!(matches!(LdapDirectory::new(settings), Err(Error::Configuration(_))));
    }
}
