//! Connector for JSON REST and recruiting-platform endpoints.

use async_trait::async_trait;
use jobfeed_core::JobCandidate;
use jobfeed_storage::HttpFetcher;
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use crate::normalize::{candidate_from_fields, json_text, ExtractedFields};
use crate::registry::{config_error, HttpMethod, Pagination, SourceConfig};
use crate::{
    Connector, ConnectorContext, ConnectorError, ConnectorKind, PageCursor, RawItem, SourcePage,
};

#[derive(Debug, Clone)]
pub struct JsonApiConnector {
    config: SourceConfig,
}

impl JsonApiConnector {
    pub fn new(config: SourceConfig) -> Result<Self, ConnectorError> {
        for (name, pointer) in config.fields.locators() {
            if !pointer.is_empty() && !pointer.starts_with('/') {
                return Err(config_error(
                    &config,
                    format!("field `{name}` must be a JSON pointer, got `{pointer}`"),
                ));
            }
        }
        if let Some(body) = &config.request_body {
            if !body.is_object() {
                return Err(config_error(&config, "request_body must be a JSON object"));
            }
        }
        Ok(Self { config })
    }

    /// Pagination parameters for the request at `cursor`.
    pub fn page_params(&self, cursor: &PageCursor) -> Vec<(String, String)> {
        self.config.pagination.request_params(cursor)
    }

    /// POST body: the configured body with pagination parameters merged in.
    fn request_body(&self, params: &[(String, String)]) -> JsonValue {
        let mut body = match &self.config.request_body {
            Some(JsonValue::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        for (key, value) in params {
            let value = value
                .parse::<u64>()
                .map(JsonValue::from)
                .unwrap_or_else(|_| JsonValue::String(value.clone()));
            body.insert(key.clone(), value);
        }
        JsonValue::Object(body)
    }

    /// Interprets one decoded response for the request made at `cursor`.
    pub fn page_from_response(
        &self,
        cursor: &PageCursor,
        body: &JsonValue,
    ) -> Result<SourcePage, ConnectorError> {
        let pointer = self.config.items_pointer.as_str();
        let target = if pointer.is_empty() {
            Some(body)
        } else {
            body.pointer(pointer)
        };
        let items = match target {
            Some(JsonValue::Array(items)) => items.clone(),
            Some(JsonValue::Null) => Vec::new(),
            Some(_) => {
                return Err(ConnectorError::Decode(format!(
                    "`{pointer}` is not an array in the {} response",
                    self.config.source_name
                )))
            }
            None => {
                return Err(ConnectorError::Decode(format!(
                    "`{pointer}` missing from the {} response",
                    self.config.source_name
                )))
            }
        };
        let count = items.len() as u64;

        let (has_more, next_cursor) = match &self.config.pagination {
            Pagination::Single => (false, cursor.clone()),
            Pagination::Offset {
                page_size,
                total_pointer,
                ..
            } => {
                let current = match cursor {
                    PageCursor::Offset(o) => *o,
                    _ => 0,
                };
                let next = current + count;
                let total = total_pointer
                    .as_deref()
                    .and_then(|p| json_text(body, p))
                    .and_then(|t| t.parse::<u64>().ok());
                let has_more = count > 0
                    && match total {
                        Some(total) => next < total,
                        None => count >= u64::from(*page_size),
                    };
                (has_more, PageCursor::Offset(next))
            }
            Pagination::Page {
                first_page,
                page_size,
                ..
            } => {
                let current = match cursor {
                    PageCursor::Page(p) => *p,
                    _ => *first_page,
                };
                let has_more =
                    count > 0 && page_size.map_or(true, |size| count >= u64::from(size));
                (has_more, PageCursor::Page(current + 1))
            }
            Pagination::Cursor {
                next_cursor_pointer,
                ..
            } => match json_text(body, next_cursor_pointer) {
                Some(token) if PageCursor::Token(token.clone()) != *cursor => {
                    (true, PageCursor::Token(token))
                }
                _ => (false, cursor.clone()),
            },
        };

        Ok(SourcePage {
            items,
            has_more,
            next_cursor,
        })
    }

    fn extract(&self, raw: &RawItem) -> ExtractedFields {
        self.config
            .fields
            .locators()
            .into_iter()
            .filter_map(|(name, pointer)| json_text(raw, pointer).map(|v| (name, v)))
            .collect()
    }
}

#[async_trait]
impl Connector for JsonApiConnector {
    fn source_name(&self) -> &str {
        &self.config.source_name
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::JsonApi
    }

    fn max_pages(&self) -> Option<u32> {
        self.config.max_pages
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        ctx: &ConnectorContext,
        cursor: &PageCursor,
    ) -> Result<SourcePage, ConnectorError> {
        let params = self.page_params(cursor);
        let response = match self.config.method {
            HttpMethod::Get => {
                let mut query: Vec<(String, String)> = self
                    .config
                    .query
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                query.extend(params);
                http.get(&self.config.source_name, &self.config.endpoint, &query)
                    .await?
            }
            HttpMethod::Post => {
                let body = self.request_body(&params);
                http.post_json(&self.config.source_name, &self.config.endpoint, &body)
                    .await?
            }
        };
        let body = response.json()?;
        let page = self.page_from_response(cursor, &body)?;
        debug!(
            source = %self.config.source_name,
            cycle_id = %ctx.cycle_id,
            %cursor,
            items = page.items.len(),
            has_more = page.has_more,
            "fetched json page"
        );
        Ok(page)
    }

    fn normalize(&self, raw: &RawItem) -> Option<JobCandidate> {
        if !raw.is_object() {
            return None;
        }
        Some(candidate_from_fields(&self.config, &self.extract(raw)))
    }
}
