//! Source connector contract + configurable JSON and HTML connector implementations.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobfeed_core::JobCandidate;
use jobfeed_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub mod html;
pub mod json_api;
pub mod normalize;
pub mod registry;

pub use html::{HtmlListingConnector, HttpPageRenderer, PageRenderer};
pub use json_api::JsonApiConnector;
pub use registry::{
    build_connectors, connector_for_source, FieldMap, HttpMethod, Pagination, SourceConfig,
    SourceRegistry,
};

pub const CRATE_NAME: &str = "jobfeed-connectors";

/// One undecoded listing entry as delivered by a source.
pub type RawItem = JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind {
    JsonApi,
    HtmlListing,
    RenderedHtml,
}

/// Position within a source's listing. Connectors receive one and hand back the next.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageCursor {
    #[default]
    Start,
    Offset(u64),
    Page(u64),
    Token(String),
}

impl fmt::Display for PageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::Offset(o) => write!(f, "offset={o}"),
            Self::Page(p) => write!(f, "page={p}"),
            Self::Token(t) => write!(f, "token={t}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourcePage {
    pub items: Vec<RawItem>,
    pub has_more: bool,
    pub next_cursor: PageCursor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorContext {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl ConnectorContext {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            started_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected response shape: {0}")]
    Decode(String),
    #[error("page render crashed: {0}")]
    RenderCrashed(String),
    #[error("invalid configuration for source {source_name}: {message}")]
    Config {
        source_name: String,
        message: String,
    },
    #[error("{0}")]
    Message(String),
}

/// Contract every external source satisfies.
///
/// Implementations keep no state between calls apart from the cursor they are handed, and
/// `normalize` never fails hard: a malformed item yields `None` and is counted by the caller.
#[async_trait]
pub trait Connector: Send + Sync {
    fn source_name(&self) -> &str;
    fn kind(&self) -> ConnectorKind;

    /// Upper bound on pages fetched per run, if the source declares one.
    fn max_pages(&self) -> Option<u32> {
        None
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        ctx: &ConnectorContext,
        cursor: &PageCursor,
    ) -> Result<SourcePage, ConnectorError>;

    fn normalize(&self, raw: &RawItem) -> Option<JobCandidate>;
}
