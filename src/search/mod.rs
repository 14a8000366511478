//! Search routing across the two remote search dialects.
//!
//! Personal Microsoft accounts do not support the unified `/search/query`
//! endpoint, so the router picks a dialect per account class:
//!
//! - **personal**: per-kind endpoints — emails and events are fetched recent
//!   and filtered client-side, files go through the drive search path
//! - **work/school** (and unknown): the unified POST endpoint, with results
//!   extracted from `hitsContainers[].hits[].resource`
//!
//! Contact search always uses prefix `$filter` matching; the unified API has
//! limited contact support on both account classes.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;

use crate::accounts::AccountClass;
use crate::graph::{GraphClient, GraphError};

/// Search validation and routing errors
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid limit: {0} (expected 1..=500)")]
    InvalidLimit(usize),

    #[error("invalid entity types: {0}")]
    InvalidEntityTypes(String),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Result type for search operations
pub type SearchResult<T> = Result<T, SearchError>;

/// Entity kinds supported by unified search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityType {
    Message,
    Event,
    DriveItem,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Message => "message",
            EntityType::Event => "event",
            EntityType::DriveItem => "driveItem",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "message" => Some(EntityType::Message),
            "event" => Some(EntityType::Event),
            "driveItem" => Some(EntityType::DriveItem),
            _ => None,
        }
    }
}

/// Parse entity type names from the tool boundary, rejecting unknown names
/// and the empty set.
pub fn parse_entity_types(raw: &[&str]) -> SearchResult<Vec<EntityType>> {
    if raw.is_empty() {
        return Err(SearchError::InvalidEntityTypes("empty entity type list".to_string()));
    }
    raw.iter()
        .map(|name| {
            EntityType::parse(name)
                .ok_or_else(|| SearchError::InvalidEntityTypes(format!("unsupported: {name}")))
        })
        .collect()
}

const MAX_QUERY_CHARS: usize = 512;
const MAX_LIMIT: usize = 500;

/// Routes search requests to the dialect an account class supports.
pub struct SearchRouter {
    graph: Arc<dyn GraphClient>,
}

impl SearchRouter {
    pub fn new(graph: Arc<dyn GraphClient>) -> Self {
        Self { graph }
    }

    /// Search email messages.
    pub async fn search_emails(
        &self,
        account_id: &str,
        account_class: AccountClass,
        query: &str,
        limit: usize,
    ) -> SearchResult<Vec<Value>> {
        validate(query, limit)?;
        log::info!(
            "Routing email search for account_class={}, limit={}",
            account_class.as_str(),
            limit
        );

        match account_class {
            AccountClass::Personal => self.search_emails_filtered(account_id, query, limit).await,
            _ => {
                self.unified_single(
                    account_id,
                    EntityType::Message,
                    query,
                    limit,
                    &["subject", "from", "receivedDateTime", "hasAttachments", "bodyPreview"],
                )
                .await
            }
        }
    }

    /// Search calendar events.
    pub async fn search_events(
        &self,
        account_id: &str,
        account_class: AccountClass,
        query: &str,
        limit: usize,
    ) -> SearchResult<Vec<Value>> {
        validate(query, limit)?;
        log::info!(
            "Routing event search for account_class={}, limit={}",
            account_class.as_str(),
            limit
        );

        match account_class {
            AccountClass::Personal => self.search_events_filtered(account_id, query, limit).await,
            _ => {
                self.unified_single(
                    account_id,
                    EntityType::Event,
                    query,
                    limit,
                    &["subject", "start", "end", "location", "attendees", "organizer"],
                )
                .await
            }
        }
    }

    /// Search drive items.
    pub async fn search_files(
        &self,
        account_id: &str,
        account_class: AccountClass,
        query: &str,
        limit: usize,
    ) -> SearchResult<Vec<Value>> {
        validate(query, limit)?;
        log::info!(
            "Routing file search for account_class={}, limit={}",
            account_class.as_str(),
            limit
        );

        match account_class {
            AccountClass::Personal => self.search_files_drive(account_id, query, limit).await,
            _ => {
                self.unified_single(
                    account_id,
                    EntityType::DriveItem,
                    query,
                    limit,
                    &["name", "webUrl", "lastModifiedDateTime", "size", "file", "folder"],
                )
                .await
            }
        }
    }

    /// Search contacts by prefix, regardless of account class.
    ///
    /// Prefix matching is a Graph API limitation; the unified endpoint does
    /// not cover contacts well enough to use here.
    pub async fn search_contacts(
        &self,
        account_id: &str,
        _account_class: AccountClass,
        query: &str,
        limit: usize,
    ) -> SearchResult<Vec<Value>> {
        validate(query, limit)?;

        let prefix = query.replace('\'', "''");
        let filter = format!(
            "startswith(displayName,'{prefix}') or startswith(givenName,'{prefix}') or startswith(surname,'{prefix}')"
        );
        let params = json!({
            "$filter": filter,
            "$top": limit,
            "$select": "id,displayName,emailAddresses,givenName,surname,companyName",
        });

        let result = self
            .graph
            .request("GET", "/me/contacts", account_id, Some(&params), None)
            .await?;
        Ok(value_list(&result))
    }

    /// Search multiple entity kinds at once.
    ///
    /// Work/school (and unknown) accounts use one batched unified request;
    /// personal accounts fall back to sequential per-kind searches where a
    /// failed kind yields an empty list.
    pub async fn unified_search(
        &self,
        account_id: &str,
        account_class: AccountClass,
        query: &str,
        entity_types: &[EntityType],
        limit: usize,
    ) -> SearchResult<BTreeMap<String, Vec<Value>>> {
        validate(query, limit)?;
        if entity_types.is_empty() {
            return Err(SearchError::InvalidEntityTypes("empty entity type list".to_string()));
        }

        match account_class {
            AccountClass::Personal => {
                self.unified_fallback(account_id, query, entity_types, limit).await
            }
            _ => self.unified_batch(account_id, query, entity_types, limit).await,
        }
    }

    /// Fetch recent messages and filter client-side.
    ///
    /// Personal accounts reject `$search` and advanced `$filter`, so this
    /// over-fetches and matches the query against subject, body preview and
    /// sender.
    async fn search_emails_filtered(
        &self,
        account_id: &str,
        query: &str,
        limit: usize,
    ) -> SearchResult<Vec<Value>> {
        let params = json!({
            "$top": overfetch_limit(limit),
            "$select": "id,subject,from,receivedDateTime,hasAttachments,bodyPreview",
            "$orderby": "receivedDateTime desc",
        });

        let result = self
            .graph
            .request("GET", "/me/messages", account_id, Some(&params), None)
            .await?;

        let needle = query.to_lowercase();
        let matches = value_list(&result)
            .into_iter()
            .filter(|message| {
                contains_ci(message, &["subject"], &needle)
                    || contains_ci(message, &["bodyPreview"], &needle)
                    || contains_ci(message, &["from", "emailAddress", "name"], &needle)
                    || contains_ci(message, &["from", "emailAddress", "address"], &needle)
            })
            .take(limit)
            .collect();
        Ok(matches)
    }

    async fn search_events_filtered(
        &self,
        account_id: &str,
        query: &str,
        limit: usize,
    ) -> SearchResult<Vec<Value>> {
        let params = json!({
            "$top": overfetch_limit(limit),
            "$select": "id,subject,start,end,location,attendees,organizer",
            "$orderby": "start/dateTime desc",
        });

        let result = self
            .graph
            .request("GET", "/me/events", account_id, Some(&params), None)
            .await?;

        let needle = query.to_lowercase();
        let matches = value_list(&result)
            .into_iter()
            .filter(|event| {
                contains_ci(event, &["subject"], &needle)
                    || contains_ci(event, &["location", "displayName"], &needle)
                    || contains_ci(event, &["organizer", "emailAddress", "name"], &needle)
                    || contains_ci(event, &["organizer", "emailAddress", "address"], &needle)
            })
            .take(limit)
            .collect();
        Ok(matches)
    }

    async fn search_files_drive(
        &self,
        account_id: &str,
        query: &str,
        limit: usize,
    ) -> SearchResult<Vec<Value>> {
        let encoded = urlencoding::encode(query);
        let path = format!("/me/drive/root/search(q='{encoded}')");
        let params = json!({"$top": limit});

        let result = self
            .graph
            .request("GET", &path, account_id, Some(&params), None)
            .await?;
        Ok(value_list(&result))
    }

    async fn unified_single(
        &self,
        account_id: &str,
        entity_type: EntityType,
        query: &str,
        limit: usize,
        fields: &[&str],
    ) -> SearchResult<Vec<Value>> {
        let payload = json!({
            "requests": [{
                "entityTypes": [entity_type.as_str()],
                "query": {"queryString": query},
                "from": 0,
                "size": limit,
                "fields": fields,
            }]
        });

        let result = self
            .graph
            .request("POST", "/search/query", account_id, None, Some(&payload))
            .await?;

        let mut hits = extract_hits(&result);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn unified_batch(
        &self,
        account_id: &str,
        query: &str,
        entity_types: &[EntityType],
        limit: usize,
    ) -> SearchResult<BTreeMap<String, Vec<Value>>> {
        let requests: Vec<Value> = entity_types
            .iter()
            .map(|entity_type| {
                json!({
                    "entityTypes": [entity_type.as_str()],
                    "query": {"queryString": query},
                    "from": 0,
                    "size": limit,
                })
            })
            .collect();

        let result = self
            .graph
            .request(
                "POST",
                "/search/query",
                account_id,
                None,
                Some(&json!({"requests": requests})),
            )
            .await?;

        let mut by_type: BTreeMap<String, Vec<Value>> = entity_types
            .iter()
            .map(|entity_type| (entity_type.as_str().to_string(), Vec::new()))
            .collect();

        for resource in extract_hits(&result) {
            let odata_type = resource
                .get("@odata.type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            let bucket = if odata_type.contains("message") {
                "message"
            } else if odata_type.contains("driveItem") {
                "driveItem"
            } else if odata_type.contains("event") {
                "event"
            } else {
                continue;
            };

            if let Some(entries) = by_type.get_mut(bucket) {
                entries.push(resource);
            }
        }

        Ok(by_type)
    }

    async fn unified_fallback(
        &self,
        account_id: &str,
        query: &str,
        entity_types: &[EntityType],
        limit: usize,
    ) -> SearchResult<BTreeMap<String, Vec<Value>>> {
        log::info!("Using sequential search fallback for personal account");

        let mut results = BTreeMap::new();
        for entity_type in entity_types {
            let outcome = match entity_type {
                EntityType::Message => self.search_emails_filtered(account_id, query, limit).await,
                EntityType::Event => self.search_events_filtered(account_id, query, limit).await,
                EntityType::DriveItem => self.search_files_drive(account_id, query, limit).await,
            };

            let entries = match outcome {
                Ok(entries) => entries,
                Err(e) => {
                    log::error!("Search failed for entity_type={}: {}", entity_type.as_str(), e);
                    Vec::new()
                }
            };
            results.insert(entity_type.as_str().to_string(), entries);
        }

        Ok(results)
    }
}

fn validate(query: &str, limit: usize) -> SearchResult<()> {
    let chars = query.chars().count();
    if chars == 0 {
        return Err(SearchError::InvalidQuery("query is required".to_string()));
    }
    if chars > MAX_QUERY_CHARS {
        return Err(SearchError::InvalidQuery(format!(
            "query exceeds {MAX_QUERY_CHARS} characters"
        )));
    }
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(SearchError::InvalidLimit(limit));
    }
    Ok(())
}

fn overfetch_limit(limit: usize) -> usize {
    (limit * 5).max(50)
}

/// Items under the `value` key of a collection response.
fn value_list(result: &Value) -> Vec<Value> {
    result
        .get("value")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Resources nested in a unified search response:
/// `value[].hitsContainers[].hits[].resource`.
fn extract_hits(result: &Value) -> Vec<Value> {
    let mut resources = Vec::new();
    for response in value_list(result) {
        let containers = response
            .get("hitsContainers")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for container in containers {
            let hits = container
                .get("hits")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for hit in hits {
                if let Some(resource) = hit.get("resource") {
                    if !resource.is_null() {
                        resources.push(resource.clone());
                    }
                }
            }
        }
    }
    resources
}

/// Nested string field lookup with case-insensitive containment.
fn contains_ci(value: &Value, path: &[&str], needle: &str) -> bool {
    let mut current = value;
    for segment in path {
        current = match current.get(segment) {
            Some(next) => next,
            None => return false,
        };
    }
    current
        .as_str()
        .map(|s| s.to_lowercase().contains(needle))
        .unwrap_or(false)
}
