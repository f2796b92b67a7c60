//! `sources.yaml` model and the explicit connector registry built from it at startup.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use jobfeed_storage::{HttpFetcher, TokenBucketConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::html::{HtmlListingConnector, HttpPageRenderer, PageRenderer};
use crate::json_api::JsonApiConnector;
use crate::{Connector, ConnectorError, ConnectorKind, PageCursor};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub source_name: String,
    pub display_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub kind: ConnectorKind,
    pub endpoint: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub request_body: Option<JsonValue>,
    #[serde(default)]
    pub pagination: Pagination,
    /// JSON pointer to the item array; empty means the response root.
    #[serde(default)]
    pub items_pointer: String,
    /// CSS selector for one listing card (HTML kinds).
    #[serde(default)]
    pub item_selector: Option<String>,
    #[serde(default)]
    pub next_page_selector: Option<String>,
    /// Organization text applied when items carry no department of their own.
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub max_pages: Option<u32>,
    /// Dedicated request pacing for this source; unset falls back to the shared limit.
    #[serde(default)]
    pub rate_limit_per_sec: Option<u32>,
    pub fields: FieldMap,
    #[serde(default)]
    pub notes: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Pagination {
    #[default]
    Single,
    Offset {
        offset_param: String,
        limit_param: String,
        page_size: u32,
        #[serde(default)]
        total_pointer: Option<String>,
    },
    Page {
        page_param: String,
        #[serde(default = "first_page_default")]
        first_page: u64,
        #[serde(default)]
        page_size: Option<u32>,
        #[serde(default)]
        page_size_param: Option<String>,
    },
    Cursor {
        cursor_param: String,
        next_cursor_pointer: String,
    },
}

fn first_page_default() -> u64 {
    1
}

impl Pagination {
    /// Query (or body) parameters selecting the page at `cursor`.
    pub fn request_params(&self, cursor: &PageCursor) -> Vec<(String, String)> {
        match self {
            Self::Single => Vec::new(),
            Self::Offset {
                offset_param,
                limit_param,
                page_size,
                ..
            } => {
                let offset = match cursor {
                    PageCursor::Offset(o) => *o,
                    _ => 0,
                };
                vec![
                    (offset_param.clone(), offset.to_string()),
                    (limit_param.clone(), page_size.to_string()),
                ]
            }
            Self::Page {
                page_param,
                first_page,
                page_size,
                page_size_param,
            } => {
                let page = match cursor {
                    PageCursor::Page(p) => *p,
                    _ => *first_page,
                };
                let mut params = vec![(page_param.clone(), page.to_string())];
                if let (Some(param), Some(size)) = (page_size_param, page_size) {
                    params.push((param.clone(), size.to_string()));
                }
                params
            }
            Self::Cursor { cursor_param, .. } => match cursor {
                PageCursor::Token(token) => vec![(cursor_param.clone(), token.clone())],
                _ => Vec::new(),
            },
        }
    }
}

/// Where each canonical field lives in a source item: JSON pointers for `json_api`,
/// CSS selectors (`selector` for text, `selector@attr` or `@attr` for attributes) for HTML.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FieldMap {
    pub source_job_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category_code: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub job_family: Option<String>,
    #[serde(default)]
    pub duty_station: Option<String>,
    #[serde(default)]
    pub recruitment_type: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub apply_link: Option<String>,
    /// Builds the apply link from the job id, e.g. `https://jobs.example.org/job/{id}`.
    #[serde(default)]
    pub apply_link_template: Option<String>,
    /// Explicit chrono format tried before the built-in date formats.
    #[serde(default)]
    pub date_format: Option<String>,
}

impl FieldMap {
    /// Configured (field name, locator) pairs.
    pub fn locators(&self) -> Vec<(&'static str, &str)> {
        let mut out = vec![
            ("source_job_id", self.source_job_id.as_str()),
            ("title", self.title.as_str()),
        ];
        let optional = [
            ("description", &self.description),
            ("category_code", &self.category_code),
            ("level", &self.level),
            ("job_family", &self.job_family),
            ("duty_station", &self.duty_station),
            ("recruitment_type", &self.recruitment_type),
            ("start_date", &self.start_date),
            ("end_date", &self.end_date),
            ("department", &self.department),
            ("apply_link", &self.apply_link),
        ];
        for (name, locator) in optional {
            if let Some(locator) = locator {
                out.push((name, locator.as_str()));
            }
        }
        out
    }
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        registry.check_unique_names()?;
        Ok(registry)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Gives every enabled source with a `rate_limit_per_sec` its own bucket on `http`.
    pub fn apply_rate_limits(&self, mut http: HttpFetcher) -> HttpFetcher {
        for source in self.enabled() {
            let limit = source.rate_limit_per_sec.and_then(TokenBucketConfig::per_second);
            if let Some(limit) = limit {
                http = http.with_source_rate_limit(source.source_name.clone(), limit);
            }
        }
        http
    }

    fn check_unique_names(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.source_name.as_str()) {
                anyhow::bail!("source `{}` is declared more than once", source.source_name);
            }
        }
        Ok(())
    }
}

pub(crate) fn config_error(config: &SourceConfig, message: impl Into<String>) -> ConnectorError {
    ConnectorError::Config {
        source_name: config.source_name.clone(),
        message: message.into(),
    }
}

/// Builds the connector for one source. `renderer` is used by `rendered_html` sources; when
/// absent they render through plain HTTP.
pub fn connector_for_source(
    config: &SourceConfig,
    http: Arc<HttpFetcher>,
    renderer: Option<Arc<dyn PageRenderer>>,
) -> Result<Box<dyn Connector>, ConnectorError> {
    if config.source_name.trim().is_empty() {
        return Err(config_error(config, "source_name must not be empty"));
    }
    if config.max_pages == Some(0) {
        return Err(config_error(config, "max_pages must be at least 1"));
    }
    match config.kind {
        ConnectorKind::JsonApi => Ok(Box::new(JsonApiConnector::new(config.clone())?)),
        ConnectorKind::HtmlListing => Ok(Box::new(HtmlListingConnector::direct(config.clone())?)),
        ConnectorKind::RenderedHtml => {
            let renderer = renderer.unwrap_or_else(|| {
                Arc::new(HttpPageRenderer::new(http, config.source_name.clone()))
            });
            Ok(Box::new(HtmlListingConnector::rendered(
                config.clone(),
                renderer,
            )?))
        }
    }
}

/// Registry of connectors for every enabled source, in declaration order.
pub fn build_connectors(
    registry: &SourceRegistry,
    http: Arc<HttpFetcher>,
    renderer: Option<Arc<dyn PageRenderer>>,
) -> Result<Vec<Box<dyn Connector>>, ConnectorError> {
    registry
        .enabled()
        .map(|config| connector_for_source(config, Arc::clone(&http), renderer.clone()))
        .collect()
}
