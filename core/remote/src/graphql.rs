//! Remote backend speaking the HR system's GraphQL API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use moldap_common::{Error, Result};

use crate::api::RemoteApi;
use crate::auth::TokenManager;
use crate::config::RemoteSettings;
use crate::model::{Address, Engagement, ItUser, MoObject, ObjectKind, OrgUnit, Person};

const VALIDITY: &str = "validity { from to }";

/// GraphQL collection queried for a kind.
fn collection(kind: ObjectKind) -> &'static str {
    match kind {
        ObjectKind::Person => "employees",
        ObjectKind::Address => "addresses",
        ObjectKind::Engagement => "engagements",
        ObjectKind::ItUser => "itusers",
        ObjectKind::OrgUnit => "org_units",
    }
}

/// Fields selected for a kind.
fn fields(kind: ObjectKind) -> String {
    let own = match kind {
        ObjectKind::Person => {
            "uuid user_key given_name surname cpr_number nickname_given_name nickname_surname"
        }
        ObjectKind::Address => {
            "uuid user_key value address_type_uuid employee_uuid org_unit_uuid engagement_uuid visibility_uuid"
        }
        ObjectKind::Engagement => {
            "uuid user_key org_unit_uuid employee_uuid job_function_uuid engagement_type_uuid primary_uuid is_primary extension_1 extension_2 extension_3"
        }
        ObjectKind::ItUser => {
            "uuid user_key itsystem_uuid employee_uuid org_unit_uuid engagement_uuid"
        }
        ObjectKind::OrgUnit => "uuid user_key name parent_uuid unit_type_uuid",
    };
    format!("{} {}", own, VALIDITY)
}

/// Mutation name prefix and input type prefix for a kind.
fn mutation_names(kind: ObjectKind) -> (&'static str, &'static str) {
    match kind {
        ObjectKind::Person => ("employee", "Employee"),
        ObjectKind::Address => ("address", "Address"),
        ObjectKind::Engagement => ("engagement", "Engagement"),
        ObjectKind::ItUser => ("ituser", "ITUser"),
        ObjectKind::OrgUnit => ("org_unit", "OrganisationUnit"),
    }
}

fn parse_object(kind: ObjectKind, value: Value) -> Result<MoObject> {
    Ok(match kind {
        ObjectKind::Person => MoObject::Person(serde_json::from_value(value)?),
        ObjectKind::Address => MoObject::Address(serde_json::from_value(value)?),
        ObjectKind::Engagement => MoObject::Engagement(serde_json::from_value(value)?),
        ObjectKind::ItUser => MoObject::ItUser(serde_json::from_value(value)?),
        ObjectKind::OrgUnit => MoObject::OrgUnit(serde_json::from_value(value)?),
    })
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct Versions {
    #[serde(default)]
    validities: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Current {
    #[serde(default)]
    current: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Objects<T> {
    objects: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct UuidOnly {
    uuid: Uuid,
}

/// GraphQL remote backend.
pub struct GraphQlRemote {
    http: Client,
    url: String,
    tokens: Arc<TokenManager>,
}

impl GraphQlRemote {
    /// # Errors
    /// - `Configuration` if the HTTP client cannot be built
    pub fn new(settings: &RemoteSettings, tokens: Arc<TokenManager>) -> Result<Self> {
        let http = Client::builder()
            .user_agent("moldap/0.1")
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            url: settings.graphql_url.to_string(),
            tokens,
        })
    }

    /// Run a query or mutation and return its `data`.
    ///
    /// GraphQL errors on a mutation are the remote refusing the input;
    /// on a query they indicate a server-side problem.
    async fn execute(&self, query: &str, variables: Value, mutation: bool) -> Result<Value> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(token.expose())
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| Error::Transport(format!("GraphQL request failed: {}", e)))?;

        let body = self.handle_response(response).await?;
        if !body.errors.is_empty() {
            let messages: Vec<String> = body.errors.into_iter().map(|e| e.message).collect();
            let joined = messages.join("; ");
            return Err(if mutation {
                Error::BusinessRejection(joined)
            } else {
                Error::Transport(format!("GraphQL query failed: {}", joined))
            });
        }
        body.data
            .ok_or_else(|| Error::Transport("GraphQL response without data".to_string()))
    }

    async fn handle_response(&self, response: reqwest::Response) -> Result<GraphQlResponse> {
        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::Transport(format!("Failed to parse response: {}", e)))
        } else if status == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
            Err(Error::Transport("Invalid or expired token".to_string()))
        } else if status == StatusCode::FORBIDDEN {
            Err(Error::Configuration("Client is not allowed to use the API".to_string()))
        } else if status == StatusCode::NOT_FOUND {
            Err(Error::Configuration(format!("No GraphQL endpoint at {}", self.url)))
        } else if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
            let body = response.text().await.unwrap_or_default();
            Err(Error::BusinessRejection(format!("{} - {}", status, body)))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Transport(format!("API error: {} - {}", status, body)))
        }
    }

    fn take(data: Value, key: &str) -> Result<Value> {
        match data {
            Value::Object(mut map) => map
                .remove(key)
                .ok_or_else(|| Error::Serialization(format!("Missing '{}' in response", key))),
            _ => Err(Error::Serialization("Response data is not an object".to_string())),
        }
    }

    async fn versions(&self, kind: ObjectKind, filter: &str, variables: Value) -> Result<Vec<MoObject>> {
        let query = format!(
            "query Versions($uuid: UUID!) {{ {}(filter: {{{}, from_date: null, to_date: null}}) {{ objects {{ validities {{ {} }} }} }} }}",
            collection(kind),
            filter,
            fields(kind)
        );
        let data = self.execute(&query, variables, false).await?;
        let objects: Objects<Versions> = serde_json::from_value(Self::take(data, collection(kind))?)?;
        objects
            .objects
            .into_iter()
            .flat_map(|o| o.validities)
            .map(|v| parse_object(kind, v))
            .collect()
    }

    async fn current(&self, kind: ObjectKind, filter: &str, variables: Value) -> Result<Vec<MoObject>> {
        let query = format!(
            "query Current($uuid: UUID!) {{ {}(filter: {{{}}}) {{ objects {{ current {{ {} }} }} }} }}",
            collection(kind),
            filter,
            fields(kind)
        );
        let data = self.execute(&query, variables, false).await?;
        let objects: Objects<Current> = serde_json::from_value(Self::take(data, collection(kind))?)?;
        objects
            .objects
            .into_iter()
            .filter_map(|o| o.current)
            .map(|v| parse_object(kind, v))
            .collect()
    }

    async fn uuids(&self, query: &str, key: &str, variables: Value) -> Result<Vec<Uuid>> {
        let data = self.execute(query, variables, false).await?;
        let objects: Objects<UuidOnly> = serde_json::from_value(Self::take(data, key)?)?;
        Ok(objects.objects.into_iter().map(|o| o.uuid).collect())
    }

    async fn create(&self, object: &MoObject) -> Result<Uuid> {
        let (name, input) = mutation_names(object.kind());
        let mut payload = Self::payload(object)?;
        if let (MoObject::Person(_), Value::Object(map)) = (object, &mut payload) {
            map.remove("validity");
        }
        let query = format!(
            "mutation Create($input: {}CreateInput!) {{ {}_create(input: $input) {{ uuid }} }}",
            input, name
        );
        let data = self.execute(&query, json!({ "input": payload }), true).await?;
        let created: UuidOnly = serde_json::from_value(Self::take(data, &format!("{}_create", name))?)?;
        debug!(kind = %object.kind(), uuid = %created.uuid, "Created remote object");
        Ok(created.uuid)
    }

    async fn update(&self, object: &MoObject) -> Result<()> {
        let (name, input) = mutation_names(object.kind());
        let query = format!(
            "mutation Update($input: {}UpdateInput!) {{ {}_update(input: $input) {{ uuid }} }}",
            input, name
        );
        self.execute(&query, json!({ "input": Self::payload(object)? }), true)
            .await?;
        Ok(())
    }

    /// Mutation input for an object: its fields without the type tag.
    fn payload(object: &MoObject) -> Result<Value> {
        let mut value = serde_json::to_value(object)?;
        if let Value::Object(map) = &mut value {
            map.remove("type");
        }
        Ok(value)
    }
}

#[async_trait]
impl RemoteApi for GraphQlRemote {
    fn name(&self) -> &str {
        "graphql"
    }

    async fn person_versions(&self, uuid: Uuid) -> Result<Vec<Person>> {
        let objects = self
            .versions(ObjectKind::Person, "uuids: [$uuid]", json!({ "uuid": uuid }))
            .await?;
        Ok(objects
            .into_iter()
            .filter_map(|o| match o {
                MoObject::Person(p) => Some(p),
                _ => None,
            })
            .collect())
    }

    async fn object_versions(&self, kind: ObjectKind, uuid: Uuid) -> Result<Vec<MoObject>> {
        self.versions(kind, "uuids: [$uuid]", json!({ "uuid": uuid }))
            .await
    }

    async fn objects_of_person(&self, person: Uuid, kind: ObjectKind) -> Result<Vec<MoObject>> {
        let filter = match kind {
            ObjectKind::Person => "uuids: [$uuid]",
            ObjectKind::OrgUnit => {
                return Err(Error::InvalidInput("Org units do not belong to persons".to_string()))
            }
            _ => "employee: {uuids: [$uuid]}",
        };
        self.current(kind, filter, json!({ "uuid": person })).await
    }

    async fn objects_of_org_unit(&self, unit: Uuid, kind: ObjectKind) -> Result<Vec<MoObject>> {
        let filter = match kind {
            ObjectKind::OrgUnit => "uuids: [$uuid]",
            ObjectKind::Person => {
                return Err(Error::InvalidInput("Persons do not belong to org units".to_string()))
            }
            _ => "org_unit: {uuids: [$uuid]}",
        };
        self.current(kind, filter, json!({ "uuid": unit })).await
    }

    async fn engagement_slices(&self, person: Uuid) -> Result<Vec<Engagement>> {
        let objects = self
            .versions(
                ObjectKind::Engagement,
                "employee: {uuids: [$uuid]}",
                json!({ "uuid": person }),
            )
            .await?;
        Ok(objects
            .into_iter()
            .filter_map(|o| match o {
                MoObject::Engagement(e) => Some(e),
                _ => None,
            })
            .collect())
    }

    async fn persons_by_cpr(&self, cpr: &str) -> Result<Vec<Uuid>> {
        self.uuids(
            "query PersonsByCpr($cpr: CPR!) { employees(filter: {cpr_numbers: [$cpr]}) { objects { uuid } } }",
            "employees",
            json!({ "cpr": cpr }),
        )
        .await
    }

    async fn persons_by_it_user_key(&self, user_key: &str) -> Result<Vec<Uuid>> {
        let query = "query PersonsByItUser($key: String!) { itusers(filter: {user_keys: [$key]}) { objects { current { employee_uuid } } } }";
        let data = self.execute(query, json!({ "key": user_key }), false).await?;
        let objects: Objects<Current> = serde_json::from_value(Self::take(data, "itusers")?)?;
        let mut persons: Vec<Uuid> = objects
            .objects
            .into_iter()
            .filter_map(|o| o.current)
            .filter_map(|c| c.get("employee_uuid").and_then(|v| serde_json::from_value::<Uuid>(v.clone()).ok()))
            .collect();
        persons.sort();
        persons.dedup();
        Ok(persons)
    }

    async fn it_system_uuid(&self, user_key: &str) -> Result<Option<Uuid>> {
        let found = self
            .uuids(
                "query ItSystem($key: String!) { itsystems(filter: {user_keys: [$key]}) { objects { uuid } } }",
                "itsystems",
                json!({ "key": user_key }),
            )
            .await?;
        if found.len() > 1 {
            warn!(user_key = %user_key, count = found.len(), "Several IT systems share a user key");
        }
        Ok(found.into_iter().next())
    }

    async fn class_uuid(&self, user_key: &str) -> Result<Option<Uuid>> {
        let found = self
            .uuids(
                "query Class($key: String!) { classes(filter: {user_keys: [$key]}) { objects { uuid } } }",
                "classes",
                json!({ "key": user_key }),
            )
            .await?;
        match found.as_slice() {
            [] => Ok(None),
            [uuid] => Ok(Some(*uuid)),
            _ => Err(Error::Ambiguous(format!(
                "Several classes with user_key '{}'",
                user_key
            ))),
        }
    }

    async fn create_person(&self, person: &Person) -> Result<Uuid> {
        self.create(&MoObject::Person(person.clone())).await
    }

    async fn edit_person(&self, person: &Person) -> Result<()> {
        self.update(&MoObject::Person(person.clone())).await
    }

    async fn create_address(&self, address: &Address) -> Result<Uuid> {
        self.create(&MoObject::Address(address.clone())).await
    }

    async fn edit_address(&self, address: &Address) -> Result<()> {
        self.update(&MoObject::Address(address.clone())).await
    }

    async fn create_engagement(&self, engagement: &Engagement) -> Result<Uuid> {
        self.create(&MoObject::Engagement(engagement.clone())).await
    }

    async fn edit_engagement(&self, engagement: &Engagement) -> Result<()> {
        self.update(&MoObject::Engagement(engagement.clone())).await
    }

    async fn create_it_user(&self, it_user: &ItUser) -> Result<Uuid> {
        self.create(&MoObject::ItUser(it_user.clone())).await
    }

    async fn edit_it_user(&self, it_user: &ItUser) -> Result<()> {
        self.update(&MoObject::ItUser(it_user.clone())).await
    }

    async fn edit_org_unit(&self, unit: &OrgUnit) -> Result<()> {
        self.update(&MoObject::OrgUnit(unit.clone())).await
    }

    async fn terminate(&self, kind: ObjectKind, uuid: Uuid, at: DateTime<Utc>) -> Result<()> {
        let (name, input) = mutation_names(kind);
        let query = format!(
            "mutation Terminate($input: {}TerminateInput!) {{ {}_terminate(input: $input) {{ uuid }} }}",
            input, name
        );
        self.execute(
            &query,
            json!({ "input": { "uuid": uuid, "to": at } }),
            true,
        )
        .await?;
        Ok(())
    }
}
