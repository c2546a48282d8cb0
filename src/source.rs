use crate::error::{MigrateError, Result};
use crate::models::{is_relationship_type, Page, PageInfo, SourceEntity};
use crate::stage::Stage;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

/// Read-only access to the platform being migrated from.
#[async_trait(?Send)]
pub trait SourceApi {
    /// One page of the entities migrated in `stage`, ascending by creation time.
    async fn list(&self, stage: Stage, after: Option<&str>, first: u32) -> Result<Page>;

    /// Full export of an entity or relationship, with every object it references.
    async fn export_object(&self, entity: &SourceEntity) -> Result<Vec<Value>>;

    /// Complete a synthesized `object` standing for `entity` with the objects
    /// the entity references (author, markings, ...). `object` takes the place
    /// of the entity's native object in the export.
    async fn prepare_export(&self, entity: &SourceEntity, object: Value) -> Result<Vec<Value>>;
}

const DOMAIN_ENTITY_TYPES: &[&str] = &[
    "Threat-Actor",
    "Intrusion-Set",
    "Campaign",
    "Incident",
    "Malware",
    "Tool",
    "Vulnerability",
    "Attack-Pattern",
    "Course-Of-Action",
    "Indicator",
    "Sector",
    "Organization",
    "User",
    "Region",
    "Country",
    "City",
];

const CONTAINER_ENTITY_TYPES: &[&str] = &["Report", "Note"];

const PAGE_INFO_FIELDS: &str = "pageInfo { endCursor hasNextPage globalCount }";

const LIST_DOMAIN_ENTITIES: &str = r#"query List($first: Int, $after: ID, $types: [String]) {
  items: stixDomainEntities(first: $first, after: $after, types: $types, orderBy: created_at, orderMode: asc) {
    edges { node { id entity_type created_at description } }
    {page_info}
  }
}"#;

const LIST_OBSERVABLES: &str = r#"query List($first: Int, $after: ID) {
  items: stixObservables(first: $first, after: $after, orderBy: created_at, orderMode: asc) {
    edges { node { id entity_type created_at observable_value description } }
    {page_info}
  }
}"#;

const LIST_RELATIONS: &str = r#"query List($first: Int, $after: ID) {
  items: stixRelations(first: $first, after: $after, orderBy: created_at, orderMode: asc) {
    edges { node { id entity_type created_at from { id entity_type } to { id entity_type } } }
    {page_info}
  }
}"#;

const EXPORT_DOMAIN_ENTITY: &str =
    r#"query Export($id: String!) { item: stixDomainEntity(id: $id) { toStix } }"#;
const EXPORT_OBSERVABLE: &str =
    r#"query Export($id: String!) { item: stixObservable(id: $id) { toStix } }"#;
const EXPORT_RELATION: &str =
    r#"query Export($id: String!) { item: stixRelation(id: $id) { toStix } }"#;

#[derive(Deserialize)]
struct GraphqlResponse {
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Connection {
    edges: Vec<Edge>,
    page_info: RawPageInfo,
}

#[derive(Deserialize)]
struct Edge {
    node: SourceEntity,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPageInfo {
    end_cursor: Option<String>,
    has_next_page: bool,
    #[serde(default)]
    global_count: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Exported {
    to_stix: Option<String>,
}

/// GraphQL client for the source platform.
pub struct GraphqlSource {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl GraphqlSource {
    pub fn new(url: &str, token: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("cti-migrate/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            token: token.to_string(),
        })
    }

    async fn query(&self, query: &str, variables: Value) -> Result<Value> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?
            .error_for_status()?;

        let body: GraphqlResponse = response.json().await?;
        if !body.errors.is_empty() {
            let messages: Vec<String> = body.errors.into_iter().map(|e| e.message).collect();
            return Err(MigrateError::Fetch(messages.join("; ")));
        }
        body.data
            .ok_or_else(|| MigrateError::Fetch("response carried no data".to_string()))
    }

    async fn export(&self, query: &str, id: &str) -> Result<Vec<Value>> {
        let data = self.query(query, json!({ "id": id })).await?;
        let item = data.get("item").cloned().unwrap_or(Value::Null);
        if item.is_null() {
            return Err(MigrateError::Fetch(format!("entity {id} not found")));
        }
        let exported: Exported = serde_json::from_value(item)?;
        let raw = exported
            .to_stix
            .ok_or_else(|| MigrateError::Fetch(format!("entity {id} has no STIX export")))?;
        bundle_objects(serde_json::from_str(&raw)?)
    }
}

fn list_query(stage: Stage) -> (String, Option<&'static [&'static str]>) {
    let (template, types) = match stage {
        Stage::DomainObjects => (LIST_DOMAIN_ENTITIES, Some(DOMAIN_ENTITY_TYPES)),
        Stage::Observables => (LIST_OBSERVABLES, None),
        Stage::CoreRelationships | Stage::RelationshipToRelationship => (LIST_RELATIONS, None),
        Stage::Containers => (LIST_DOMAIN_ENTITIES, Some(CONTAINER_ENTITY_TYPES)),
    };
    (template.replace("{page_info}", PAGE_INFO_FIELDS), types)
}

/// Accepts a bundle, a bare object list or a single object.
fn bundle_objects(exported: Value) -> Result<Vec<Value>> {
    match exported {
        Value::Array(objects) => Ok(objects),
        Value::Object(mut map) => match map.remove("objects") {
            Some(Value::Array(objects)) => Ok(objects),
            Some(_) => Err(MigrateError::Fetch(
                "export 'objects' is not an array".to_string(),
            )),
            None => Ok(vec![Value::Object(map)]),
        },
        other => Err(MigrateError::Fetch(format!(
            "unexpected export payload: {other}"
        ))),
    }
}

/// Types an export carries alongside the exported entity itself.
const REFERENCED_TYPES: &[&str] = &["identity", "marking-definition"];

/// Swap the entity's own object for `replacement`, keeping every referenced
/// object. The entity is found by id, else as the first non-referenced object;
/// `replacement` is appended when neither matches.
fn replace_native_object(mut objects: Vec<Value>, entity_id: &str, replacement: Value) -> Vec<Value> {
    let by_id = objects.iter().position(|o| {
        ["id", "x_opencti_id"]
            .iter()
            .any(|key| o.get(*key).and_then(Value::as_str) == Some(entity_id))
    });
    let position = by_id.or_else(|| {
        objects.iter().position(|o| {
            o.get("type")
                .and_then(Value::as_str)
                .is_none_or(|t| !REFERENCED_TYPES.contains(&t))
        })
    });
    match position {
        Some(i) => objects[i] = replacement,
        None => objects.push(replacement),
    }
    objects
}

#[async_trait(?Send)]
impl SourceApi for GraphqlSource {
    async fn list(&self, stage: Stage, after: Option<&str>, first: u32) -> Result<Page> {
        let (query, types) = list_query(stage);
        let mut variables = json!({ "first": first, "after": after });
        if let Some(types) = types {
            variables["types"] = json!(types);
        }

        let data = self.query(&query, variables).await?;
        let items = data
            .get("items")
            .cloned()
            .ok_or_else(|| MigrateError::Fetch("listing carried no items".to_string()))?;
        let connection: Connection = serde_json::from_value(items)?;

        debug!(
            stage = %stage,
            returned = connection.edges.len(),
            has_next = connection.page_info.has_next_page,
            "Fetched page"
        );

        Ok(Page {
            entities: connection.edges.into_iter().map(|e| e.node).collect(),
            pagination: PageInfo {
                has_next_page: connection.page_info.has_next_page,
                end_cursor: connection.page_info.end_cursor,
                global_count: connection.page_info.global_count,
            },
        })
    }

    async fn export_object(&self, entity: &SourceEntity) -> Result<Vec<Value>> {
        let query = if is_relationship_type(&entity.entity_type) {
            EXPORT_RELATION
        } else {
            EXPORT_DOMAIN_ENTITY
        };
        self.export(query, &entity.id).await
    }

    async fn prepare_export(&self, entity: &SourceEntity, object: Value) -> Result<Vec<Value>> {
        let objects = self.export(EXPORT_OBSERVABLE, &entity.id).await?;
        Ok(replace_native_object(objects, &entity.id, object))
    }
}
