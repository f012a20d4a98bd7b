//! Mapping between directory entries and remote objects.
//!
//! A mapping is configured per [`Kind`]: which remote object kind it
//! produces, which directory object class it writes, and one template per
//! attribute in each direction. [`TemplateMapper`] is the stock
//! implementation of the [`Mapper`] contract.
//!
//! Context variables available to templates:
//! - `ldap`: the directory entry's attributes (import only)
//! - `dn`: the account DN, when one is known
//! - `person`, `person_uuid`: the remote person
//! - `engagement`: the person's primary engagement, if any
//! - `object`: the remote object being exported (multi-object kinds)
//! - `class.<user_key>`, `it_system.<user_key>`: resolved lookups
//! - `now`: the current time (RFC 3339)

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};
use uuid::Uuid;

use moldap_common::{Dn, Error, Kind, Result};
use moldap_directory::{AttributeValue, Attributes, DirectoryEntry};
use moldap_remote::{MoObject, ObjectKind, RemoteClient};

use crate::template::{parse_timestamp, Template};

/// Template key whose rendered date flags a candidate for termination.
pub const TERMINATE_FIELD: &str = "_terminate_";

/// Pseudo-attribute carrying the target DN of an export.
pub const DN_ATTRIBUTE: &str = "dn";

/// Mapping rules for one kind.
#[derive(Debug, Clone, Deserialize)]
pub struct KindMapping {
    /// Remote object kind this mapping produces and consumes.
    pub remote_kind: ObjectKind,
    /// Object class used when an export has to create the entry.
    #[serde(default = "default_object_class")]
    pub object_class: String,
    /// User key of the class (or, for IT users, the IT system) selecting
    /// which remote objects belong to this kind.
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default = "enabled")]
    pub import_to_remote: bool,
    #[serde(default = "enabled")]
    pub export_to_directory: bool,
    /// Replace multi-valued attributes instead of adding to them.
    #[serde(default)]
    pub overwrite: bool,
    /// Directory attribute -> template over the remote context.
    #[serde(default)]
    pub to_directory: BTreeMap<String, String>,
    /// Remote field (dotted for nesting) -> template over the directory entry.
    #[serde(default)]
    pub from_directory: BTreeMap<String, String>,
}

fn default_object_class() -> String {
    "user".to_string()
}

fn enabled() -> bool {
    true
}

/// Per-kind mapping rules, keyed by kind name.
pub type MappingSettings = BTreeMap<Kind, KindMapping>;

/// A remote object produced from a directory entry, not yet reconciled.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub object: MoObject,
    /// Top-level fields the mapping rendered a value for.
    pub mapped_fields: BTreeSet<String>,
    /// Set when the mapping flagged this candidate as a termination.
    pub terminate_at: Option<DateTime<Utc>>,
}

/// Variables handed to a mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingContext {
    values: Map<String, Value>,
}

impl MappingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a serializable variable.
    pub fn insert<T: Serialize>(&mut self, name: &str, value: &T) -> Result<()> {
        self.values
            .insert(name.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn with_dn(mut self, dn: &Dn) -> Self {
        self.values
            .insert(DN_ATTRIBUTE.to_string(), Value::String(dn.as_str().to_string()));
        self
    }

    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.values.insert(
            "now".to_string(),
            Value::String(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        self
    }

    pub fn dn(&self) -> Option<&str> {
        self.values.get(DN_ATTRIBUTE).and_then(Value::as_str)
    }

    pub fn person_uuid(&self) -> Option<Uuid> {
        self.values
            .get("person_uuid")
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }

    fn set_group(&mut self, group: &str, name: &str, value: Value) {
        let entry = self
            .values
            .entry(group.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = entry {
            map.insert(name.to_string(), value);
        }
    }

    fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }

    /// Context with `ldap` bound to the entry's values at `position`.
    ///
    /// Attributes with one value keep it at every position; multi-valued
    /// attributes contribute their `position`-th value.
    fn at_position(&self, entry: &DirectoryEntry, position: usize) -> Value {
        let mut ldap = Map::new();
        for (name, value) in entry.attributes.iter() {
            let values = value.values();
            let bound = match values.as_slice() {
                [] => Value::Null,
                [single] => Value::String(single.to_string()),
                many => many
                    .get(position)
                    .map(|v| Value::String(v.to_string()))
                    .unwrap_or(Value::Null),
            };
            ldap.insert(name.to_string(), bound);
        }
        let mut values = self.values.clone();
        values.insert("ldap".to_string(), Value::Object(ldap));
        values
            .entry(DN_ATTRIBUTE.to_string())
            .or_insert_with(|| Value::String(entry.dn.as_str().to_string()));
        Value::Object(values)
    }
}

/// Conversion between directory entries and remote objects.
#[async_trait]
pub trait Mapper: Send + Sync {
    /// Every configured kind.
    fn kinds(&self) -> Vec<Kind>;

    fn rules(&self, kind: &Kind) -> Option<&KindMapping>;

    /// Directory attributes written by any kind.
    fn mapped_attributes(&self) -> Vec<String>;

    /// Render the directory attributes for one kind, always including
    /// [`DN_ATTRIBUTE`].
    ///
    /// # Errors
    /// - `Configuration` for an unknown kind, an unresolvable lookup, or no
    ///   way to determine the DN
    async fn to_directory(&self, kind: &Kind, context: &MappingContext) -> Result<Attributes>;

    /// Produce candidate objects from a directory entry, one per position of
    /// the multi-valued attributes the mapping reads.
    ///
    /// Candidates that fail to form a valid object are dropped and logged.
    ///
    /// # Errors
    /// - `Configuration` for an unknown kind or an unresolvable lookup
    async fn from_directory(
        &self,
        kind: &Kind,
        entry: &DirectoryEntry,
        context: &MappingContext,
    ) -> Result<Vec<Candidate>>;
}

/// Resolve the class (or IT system) selecting the objects of a kind.
///
/// # Errors
/// - `Configuration` when the configured user key is unknown remotely
pub async fn selector_uuid(remote: &RemoteClient, rules: &KindMapping) -> Result<Option<Uuid>> {
    let Some(user_key) = &rules.class else {
        return Ok(None);
    };
    let found = match rules.remote_kind {
        ObjectKind::ItUser => remote.api().it_system_uuid(user_key).await?,
        _ => remote.api().class_uuid(user_key).await?,
    };
    found.map(Some).ok_or_else(|| {
        Error::Configuration(format!(
            "Unknown {} selector '{}'",
            rules.remote_kind, user_key
        ))
    })
}

/// Whether an object belongs to the kind whose selector resolved to `selector`.
pub fn matches_selector(object: &MoObject, selector: Option<Uuid>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    match object {
        MoObject::Address(a) => a.address_type == selector,
        MoObject::ItUser(i) => i.itsystem == selector,
        MoObject::Engagement(e) => e.engagement_type == selector,
        MoObject::Person(_) | MoObject::OrgUnit(_) => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Lookup {
    Class,
    ItSystem,
}

struct CompiledKind {
    rules: KindMapping,
    export: Vec<(String, Template)>,
    import: Vec<(String, Template)>,
    /// Directory attributes read by the import templates.
    import_attributes: Vec<String>,
    lookups: BTreeSet<(Lookup, String)>,
}

impl CompiledKind {
    fn compile(kind: &Kind, rules: &KindMapping) -> Result<Self> {
        if rules.remote_kind == ObjectKind::OrgUnit && rules.import_to_remote {
            return Err(Error::Configuration(format!(
                "Kind {} imports org units, which cannot be created from the directory",
                kind
            )));
        }
        let compile_all = |templates: &BTreeMap<String, String>| {
            templates
                .iter()
                .map(|(name, source)| -> Result<(String, Template)> {
                    Ok((name.clone(), Template::parse(source)?))
                })
                .collect::<Result<Vec<_>>>()
        };
        let export = compile_all(&rules.to_directory)?;
        let import = compile_all(&rules.from_directory)?;

        let mut import_attributes = Vec::new();
        let mut lookups = BTreeSet::new();
        for (_, template) in export.iter().chain(import.iter()) {
            for path in template.paths() {
                match path {
                    [root, name, ..] if root == "class" => {
                        lookups.insert((Lookup::Class, name.clone()));
                    }
                    [root, name, ..] if root == "it_system" => {
                        lookups.insert((Lookup::ItSystem, name.clone()));
                    }
                    _ => {}
                }
            }
        }
        for (_, template) in &import {
            for path in template.paths() {
                if let [root, attribute, ..] = path {
                    if root.eq_ignore_ascii_case("ldap") && !import_attributes.contains(attribute) {
                        import_attributes.push(attribute.clone());
                    }
                }
            }
        }

        Ok(Self {
            rules: rules.clone(),
            export,
            import,
            import_attributes,
            lookups,
        })
    }
}

/// Template-driven [`Mapper`].
pub struct TemplateMapper {
    kinds: BTreeMap<Kind, CompiledKind>,
    remote: RemoteClient,
}

impl TemplateMapper {
    /// Compile every template up front.
    ///
    /// # Errors
    /// - `Configuration` for a template that does not parse, or a kind
    ///   that imports org units
    pub fn new(settings: &MappingSettings, remote: RemoteClient) -> Result<Self> {
        let kinds = settings
            .iter()
            .map(|(kind, rules)| -> Result<(Kind, CompiledKind)> {
                Ok((kind.clone(), CompiledKind::compile(kind, rules)?))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self { kinds, remote })
    }

    fn compiled(&self, kind: &Kind) -> Result<&CompiledKind> {
        self.kinds
            .get(kind)
            .ok_or_else(|| Error::Configuration(format!("No mapping for kind {}", kind)))
    }

    async fn resolve_lookups(&self, compiled: &CompiledKind, context: &mut MappingContext) -> Result<()> {
        for (lookup, user_key) in &compiled.lookups {
            let (group, found) = match lookup {
                Lookup::Class => ("class", self.remote.api().class_uuid(user_key).await?),
                Lookup::ItSystem => ("it_system", self.remote.api().it_system_uuid(user_key).await?),
            };
            let uuid = found.ok_or_else(|| {
                Error::Configuration(format!("Template refers to unknown {} '{}'", group, user_key))
            })?;
            context.set_group(group, user_key, Value::String(uuid.to_string()));
        }
        Ok(())
    }

    fn build_candidate(
        &self,
        compiled: &CompiledKind,
        context: &Value,
        person_uuid: Option<Uuid>,
        selector: Option<Uuid>,
    ) -> Result<Option<Candidate>> {
        let rules = &compiled.rules;
        let mut payload = Map::new();
        let mut mapped_fields = BTreeSet::new();
        let mut terminate_at = None;

        for (field, template) in &compiled.import {
            let Some(rendered) = template.render(context) else {
                continue;
            };
            if field == TERMINATE_FIELD {
                terminate_at = parse_timestamp(&rendered);
                if terminate_at.is_none() {
                    debug!(field = %field, value = %rendered, "Ignoring unparsable termination date");
                }
                continue;
            }
            let rendered = if field.starts_with("validity.") {
                parse_timestamp(&rendered)
                    .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))
                    .unwrap_or(rendered)
            } else {
                rendered
            };
            insert_path(&mut payload, field, Value::String(rendered));
            if let Some(top) = field.split('.').next() {
                mapped_fields.insert(top.to_string());
            }
        }

        if mapped_fields.is_empty() && terminate_at.is_none() {
            return Ok(None);
        }

        let uuid = match (rules.remote_kind, person_uuid) {
            (ObjectKind::Person, Some(person)) => person,
            _ => Uuid::new_v4(),
        };
        payload
            .entry("uuid")
            .or_insert_with(|| Value::String(uuid.to_string()));

        let today = self
            .remote
            .now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|at| at.and_utc().to_rfc3339_opts(SecondsFormat::Secs, true));
        if let Value::Object(validity) = payload
            .entry("validity")
            .or_insert_with(|| Value::Object(Map::new()))
        {
            if !validity.contains_key("from") {
                validity.insert("from".to_string(), today.map(Value::String).unwrap_or(Value::Null));
            }
            validity.entry("to").or_insert(Value::Null);
        }

        let owned = matches!(
            rules.remote_kind,
            ObjectKind::Address | ObjectKind::Engagement | ObjectKind::ItUser
        );
        if let (true, Some(person)) = (owned, person_uuid) {
            if !payload.contains_key("person") && !payload.contains_key("org_unit") {
                payload.insert("person".to_string(), Value::String(person.to_string()));
            }
        }
        if let Some(selector) = selector {
            let field = match rules.remote_kind {
                ObjectKind::Address => Some("address_type"),
                ObjectKind::ItUser => Some("itsystem"),
                ObjectKind::Engagement => Some("engagement_type"),
                ObjectKind::Person | ObjectKind::OrgUnit => None,
            };
            if let Some(field) = field {
                payload
                    .entry(field)
                    .or_insert_with(|| Value::String(selector.to_string()));
            }
        }
        payload.insert("type".to_string(), serde_json::to_value(rules.remote_kind)?);

        match serde_json::from_value::<MoObject>(Value::Object(payload)) {
            Ok(object) => Ok(Some(Candidate {
                object,
                mapped_fields,
                terminate_at,
            })),
            Err(e) => {
                info!(kind = %rules.remote_kind, error = %e, "Dropping candidate missing required fields");
                Ok(None)
            }
        }
    }
}

fn insert_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            target.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(map) = child {
                insert_path(map, rest, value);
            }
        }
    }
}

#[async_trait]
impl Mapper for TemplateMapper {
    fn kinds(&self) -> Vec<Kind> {
        self.kinds.keys().cloned().collect()
    }

    fn rules(&self, kind: &Kind) -> Option<&KindMapping> {
        self.kinds.get(kind).map(|compiled| &compiled.rules)
    }

    fn mapped_attributes(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for compiled in self.kinds.values() {
            for (name, _) in &compiled.export {
                let taken = names.iter().any(|n| n.eq_ignore_ascii_case(name));
                if !name.eq_ignore_ascii_case(DN_ATTRIBUTE) && !taken {
                    names.push(name.clone());
                }
            }
        }
        names
    }

    async fn to_directory(&self, kind: &Kind, context: &MappingContext) -> Result<Attributes> {
        let compiled = self.compiled(kind)?;
        let mut context = context.clone().with_now(self.remote.now());
        self.resolve_lookups(compiled, &mut context).await?;
        let rendered_context = context.to_value();

        let mut attributes = Attributes::new();
        let mut dn = None;
        for (name, template) in &compiled.export {
            if name.eq_ignore_ascii_case(DN_ATTRIBUTE) {
                dn = template.render(&rendered_context);
                continue;
            }
            let values = template.render_values(&rendered_context);
            attributes.set(name.as_str(), AttributeValue::from_values(values));
        }

        let dn = dn
            .or_else(|| context.dn().map(str::to_string))
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "Kind {} renders no dn and no directory account is known",
                    kind
                ))
            })?;
        attributes.set(DN_ATTRIBUTE, dn);
        Ok(attributes)
    }

    async fn from_directory(
        &self,
        kind: &Kind,
        entry: &DirectoryEntry,
        context: &MappingContext,
    ) -> Result<Vec<Candidate>> {
        let compiled = self.compiled(kind)?;
        let mut context = context.clone().with_now(self.remote.now());
        self.resolve_lookups(compiled, &mut context).await?;
        let selector = selector_uuid(&self.remote, &compiled.rules).await?;
        let person_uuid = context.person_uuid();

        let positions = compiled
            .import_attributes
            .iter()
            .map(|attribute| entry.attributes.all(attribute).len())
            .max()
            .unwrap_or(1)
            .max(1);

        let mut candidates = Vec::new();
        for position in 0..positions {
            let bound = context.at_position(entry, position);
            if let Some(candidate) = self.build_candidate(compiled, &bound, person_uuid, selector)? {
                candidates.push(candidate);
            }
        }
        debug!(kind = %kind, dn = %entry.dn, count = candidates.len(), "Converted directory entry");
        Ok(candidates)
    }
}
