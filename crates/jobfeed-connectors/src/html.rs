//! Listing-page connectors: plain HTML fetched directly, and pages that need rendering first.

use std::sync::Arc;

use async_trait::async_trait;
use jobfeed_core::JobCandidate;
use jobfeed_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};
use url::Url;

use crate::normalize::{candidate_from_fields, json_text, ExtractedFields};
use crate::registry::{config_error, Pagination, SourceConfig};
use crate::{
    Connector, ConnectorContext, ConnectorError, ConnectorKind, PageCursor, RawItem, SourcePage,
};

/// Produces the final HTML of a page, executing whatever the page needs first.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, url: &str) -> Result<String, ConnectorError>;
}

/// Renderer for pages whose listing is already present in the served markup.
#[derive(Debug, Clone)]
pub struct HttpPageRenderer {
    http: Arc<HttpFetcher>,
    source_name: String,
}

impl HttpPageRenderer {
    pub fn new(http: Arc<HttpFetcher>, source_name: String) -> Self {
        Self { http, source_name }
    }
}

#[async_trait]
impl PageRenderer for HttpPageRenderer {
    async fn render(&self, url: &str) -> Result<String, ConnectorError> {
        Ok(self.http.get(&self.source_name, url, &[]).await?.text())
    }
}

#[derive(Clone)]
pub struct HtmlListingConnector {
    config: Arc<SourceConfig>,
    renderer: Option<Arc<dyn PageRenderer>>,
}

impl std::fmt::Debug for HtmlListingConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HtmlListingConnector")
            .field("source_name", &self.config.source_name)
            .field("rendered", &self.renderer.is_some())
            .finish()
    }
}

/// A field locator: `selector`, `selector@attr`, or `@attr` on the card itself.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Locator<'a> {
    selector: Option<&'a str>,
    attr: Option<&'a str>,
}

fn parse_locator(raw: &str) -> Locator<'_> {
    let raw = raw.trim();
    let (selector, attr) = match raw.rsplit_once('@') {
        Some((selector, attr)) => (selector.trim(), Some(attr.trim())),
        None => (raw, None),
    };
    Locator {
        selector: (!selector.is_empty()).then_some(selector),
        attr: attr.filter(|a| !a.is_empty()),
    }
}

fn parse_selector(config: &SourceConfig, selector: &str) -> Result<Selector, ConnectorError> {
    Selector::parse(selector)
        .map_err(|e| config_error(config, format!("bad selector `{selector}`: {e}")))
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ")
}

fn locate(
    config: &SourceConfig,
    card: ElementRef<'_>,
    locator: &Locator<'_>,
) -> Result<Option<String>, ConnectorError> {
    let target = match locator.selector {
        Some(selector) => {
            let selector = parse_selector(config, selector)?;
            match card.select(&selector).next() {
                Some(element) => element,
                None => return Ok(None),
            }
        }
        None => card,
    };
    let value = match locator.attr {
        Some(attr) => target.value().attr(attr).map(str::to_string),
        None => Some(element_text(target)),
    };
    Ok(value.filter(|v| !v.trim().is_empty()))
}

/// Pulls one flat JSON object per listing card out of `html`, keyed by field name. The
/// second value reports whether the configured next-page marker is present.
pub fn extract_cards(
    html: &str,
    config: &SourceConfig,
) -> Result<(Vec<RawItem>, bool), ConnectorError> {
    let item_selector = config
        .item_selector
        .as_deref()
        .ok_or_else(|| config_error(config, "item_selector is required for html sources"))?;
    let item_selector = parse_selector(config, item_selector)?;
    let locators: Vec<(&'static str, Locator<'_>)> = config
        .fields
        .locators()
        .into_iter()
        .map(|(name, raw)| (name, parse_locator(raw)))
        .collect();

    let document = Html::parse_document(html);
    let mut cards = Vec::new();
    for card in document.select(&item_selector) {
        let mut object = Map::new();
        for (name, locator) in &locators {
            if let Some(value) = locate(config, card, locator)? {
                object.insert((*name).to_string(), JsonValue::String(value));
            }
        }
        cards.push(JsonValue::Object(object));
    }

    let next_present = match config.next_page_selector.as_deref() {
        Some(selector) => {
            let selector = parse_selector(config, selector)?;
            document.select(&selector).next().is_some()
        }
        None => false,
    };
    Ok((cards, next_present))
}

impl HtmlListingConnector {
    /// Connector for pages fetched as served.
    pub fn direct(config: SourceConfig) -> Result<Self, ConnectorError> {
        Self::validate(&config)?;
        Ok(Self {
            config: Arc::new(config),
            renderer: None,
        })
    }

    /// Connector for pages that go through `renderer` before extraction.
    pub fn rendered(
        config: SourceConfig,
        renderer: Arc<dyn PageRenderer>,
    ) -> Result<Self, ConnectorError> {
        Self::validate(&config)?;
        Ok(Self {
            config: Arc::new(config),
            renderer: Some(renderer),
        })
    }

    fn validate(config: &SourceConfig) -> Result<(), ConnectorError> {
        let item_selector = config
            .item_selector
            .as_deref()
            .ok_or_else(|| config_error(config, "item_selector is required for html sources"))?;
        parse_selector(config, item_selector)?;
        if let Some(next) = config.next_page_selector.as_deref() {
            parse_selector(config, next)?;
        }
        for (name, raw) in config.fields.locators() {
            let locator = parse_locator(raw);
            if locator.selector.is_none() && locator.attr.is_none() {
                return Err(config_error(config, format!("field `{name}` has an empty locator")));
            }
            if let Some(selector) = locator.selector {
                parse_selector(config, selector)?;
            }
        }
        if matches!(config.pagination, Pagination::Cursor { .. }) {
            return Err(config_error(
                config,
                "cursor pagination is not supported for html listings",
            ));
        }
        Url::parse(&config.endpoint)
            .map_err(|e| config_error(config, format!("bad endpoint: {e}")))?;
        Ok(())
    }

    /// Listing URL for the page at `cursor`.
    pub fn page_url(&self, cursor: &PageCursor) -> Result<String, ConnectorError> {
        let mut url = Url::parse(&self.config.endpoint)
            .map_err(|e| config_error(&self.config, format!("bad endpoint: {e}")))?;
        let params = self.config.pagination.request_params(cursor);
        if !self.config.query.is_empty() || !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.config.query {
                pairs.append_pair(key, value);
            }
            for (key, value) in &params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url.to_string())
    }

    /// Builds the page result from extracted cards.
    pub fn page_from_cards(
        &self,
        cursor: &PageCursor,
        items: Vec<RawItem>,
        next_present: bool,
    ) -> SourcePage {
        let count = items.len() as u64;
        let uses_marker = self.config.next_page_selector.is_some();
        let (has_more, next_cursor) = match &self.config.pagination {
            Pagination::Single | Pagination::Cursor { .. } => (false, cursor.clone()),
            Pagination::Offset { page_size, .. } => {
                let current = match cursor {
                    PageCursor::Offset(o) => *o,
                    _ => 0,
                };
                let more = if uses_marker {
                    next_present
                } else {
                    count >= u64::from(*page_size)
                };
                (count > 0 && more, PageCursor::Offset(current + count))
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
                let more = if uses_marker {
                    next_present
                } else {
                    page_size.map_or(true, |size| count >= u64::from(size))
                };
                (count > 0 && more, PageCursor::Page(current + 1))
            }
        };
        SourcePage {
            items,
            has_more,
            next_cursor,
        }
    }

    async fn fetch_rendered(
        &self,
        renderer: Arc<dyn PageRenderer>,
        url: String,
    ) -> Result<(Vec<RawItem>, bool), ConnectorError> {
        let config = Arc::clone(&self.config);
        // Rendering runs on its own task so a crash in the renderer stays contained.
        let task = tokio::spawn(async move {
            let html = renderer.render(&url).await?;
            extract_cards(&html, &config)
        });
        match task.await {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => {
                warn!(source = %self.config.source_name, "page renderer crashed");
                Err(ConnectorError::RenderCrashed(format!(
                    "{}: renderer panicked",
                    self.config.source_name
                )))
            }
            Err(join_error) => Err(ConnectorError::RenderCrashed(join_error.to_string())),
        }
    }
}

#[async_trait]
impl Connector for HtmlListingConnector {
    fn source_name(&self) -> &str {
        &self.config.source_name
    }

    fn kind(&self) -> ConnectorKind {
        if self.renderer.is_some() {
            ConnectorKind::RenderedHtml
        } else {
            ConnectorKind::HtmlListing
        }
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
        let url = self.page_url(cursor)?;
        let (items, next_present) = match &self.renderer {
            Some(renderer) => self.fetch_rendered(Arc::clone(renderer), url).await?,
            None => {
                let html = http.get(&self.config.source_name, &url, &[]).await?.text();
                extract_cards(&html, &self.config)?
            }
        };
        let page = self.page_from_cards(cursor, items, next_present);
        debug!(
            source = %self.config.source_name,
            cycle_id = %ctx.cycle_id,
            %cursor,
            items = page.items.len(),
            has_more = page.has_more,
            "fetched listing page"
        );
        Ok(page)
    }

    fn normalize(&self, raw: &RawItem) -> Option<JobCandidate> {
        let object = raw.as_object()?;
        let fields: ExtractedFields = self
            .config
            .fields
            .locators()
            .into_iter()
            .filter_map(|(name, _)| {
                object
                    .get(name)
                    .and_then(|v| json_text(v, ""))
                    .map(|v| (name, v))
            })
            .collect();
        Some(candidate_from_fields(&self.config, &fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FieldMap, HttpMethod};
    use chrono::{TimeZone, Utc};
    use jobfeed_storage::HttpClientConfig;

    const LISTING: &str = r#"
<html><body>
  <table>
    <tr class="vacancy" data-id="UNI-1">
      <td class="title"> Programme   Officer </td>
      <td class="station">Nairobi</td>
      <td class="deadline">15-Jan-2099</td>
      <td><a href="/job/UNI-1">Apply</a></td>
    </tr>
    <tr class="vacancy" data-id="UNI-2">
      <td class="title">Driver</td>
      <td class="deadline">closing soon</td>
    </tr>
  </table>
  <a class="next" href="?p=2">Next</a>
</body></html>
"#;

    fn config() -> SourceConfig {
        SourceConfig {
            source_name: "unicef".into(),
            display_name: "UNICEF".into(),
            enabled: true,
            kind: ConnectorKind::HtmlListing,
            endpoint: "https://careers.example.org/list".into(),
            method: HttpMethod::Get,
            query: [("lang".to_string(), "en".to_string())].into_iter().collect(),
            request_body: None,
            pagination: Pagination::Page {
                page_param: "p".into(),
                first_page: 1,
                page_size: None,
                page_size_param: None,
            },
            items_pointer: String::new(),
            item_selector: Some("tr.vacancy".into()),
            next_page_selector: Some("a.next".into()),
            organization: Some("UNICEF".into()),
            max_pages: Some(5),
            rate_limit_per_sec: None,
            fields: FieldMap {
                source_job_id: "@data-id".into(),
                title: "td.title".into(),
                duty_station: Some("td.station".into()),
                end_date: Some("td.deadline".into()),
                apply_link: Some("a@href".into()),
                ..Default::default()
            },
            notes: None,
        }
    }

    #[test]
    fn locators_split_selector_and_attribute() {
        assert_eq!(
            parse_locator("a@href"),
            Locator {
                selector: Some("a"),
                attr: Some("href")
            }
        );
        assert_eq!(
            parse_locator("@data-id"),
            Locator {
                selector: None,
                attr: Some("data-id")
            }
        );
        assert_eq!(
            parse_locator("td.title"),
            Locator {
                selector: Some("td.title"),
                attr: None
            }
        );
    }

    #[test]
    fn cards_are_extracted_and_normalized() {
        let connector = HtmlListingConnector::direct(config()).unwrap();
        let (cards, next_present) = extract_cards(LISTING, &connector.config).unwrap();
        assert_eq!(cards.len(), 2);
        assert!(next_present);

        let first = connector.normalize(&cards[0]).unwrap();
        assert_eq!(first.source_job_id, "UNI-1");
        assert_eq!(first.title, "Programme Officer");
        assert_eq!(first.duty_station.as_deref(), Some("Nairobi"));
        assert_eq!(first.department_text.as_deref(), Some("UNICEF"));
        assert_eq!(
            first.end_date,
            Some(Utc.with_ymd_and_hms(2099, 1, 15, 23, 59, 59).unwrap())
        );
        assert_eq!(
            first.apply_link.as_deref(),
            Some("https://careers.example.org/job/UNI-1")
        );

        let second = connector.normalize(&cards[1]).unwrap();
        assert_eq!(second.duty_station, None);
        assert_eq!(second.end_date, None);
    }

    #[test]
    fn next_page_marker_drives_pagination() {
        let connector = HtmlListingConnector::direct(config()).unwrap();
        let page = connector.page_from_cards(&PageCursor::Start, vec![JsonValue::Null], true);
        assert!(page.has_more);
        assert_eq!(page.next_cursor, PageCursor::Page(2));

        let last = connector.page_from_cards(&PageCursor::Page(2), vec![JsonValue::Null], false);
        assert!(!last.has_more);
        let empty = connector.page_from_cards(&PageCursor::Page(3), Vec::new(), true);
        assert!(!empty.has_more);
    }

    #[test]
    fn page_urls_carry_static_and_page_params() {
        let connector = HtmlListingConnector::direct(config()).unwrap();
        assert_eq!(
            connector.page_url(&PageCursor::Page(3)).unwrap(),
            "https://careers.example.org/list?lang=en&p=3"
        );
    }

    #[test]
    fn invalid_selectors_and_cursor_pagination_are_rejected() {
        let mut bad_selector = config();
        bad_selector.item_selector = Some("tr[".into());
        assert!(matches!(
            HtmlListingConnector::direct(bad_selector),
            Err(ConnectorError::Config { .. })
        ));

        let mut cursor = config();
        cursor.pagination = Pagination::Cursor {
            cursor_param: "after".into(),
            next_cursor_pointer: "/next".into(),
        };
        assert!(HtmlListingConnector::direct(cursor).is_err());
    }

    struct StaticRenderer(&'static str);

    #[async_trait]
    impl PageRenderer for StaticRenderer {
        async fn render(&self, _url: &str) -> Result<String, ConnectorError> {
            Ok(self.0.to_string())
        }
    }

    struct CrashingRenderer;

    #[async_trait]
    impl PageRenderer for CrashingRenderer {
        async fn render(&self, _url: &str) -> Result<String, ConnectorError> {
            panic!("browser process died")
        }
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn rendered_pages_are_extracted_after_rendering() {
        let connector =
            HtmlListingConnector::rendered(config(), Arc::new(StaticRenderer(LISTING))).unwrap();
        assert_eq!(connector.kind(), ConnectorKind::RenderedHtml);
        let ctx = ConnectorContext::new(Utc::now());
        let page = connector
            .fetch_page(&fetcher(), &ctx, &PageCursor::Start)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn renderer_crash_becomes_a_connector_error() {
        let connector =
            HtmlListingConnector::rendered(config(), Arc::new(CrashingRenderer)).unwrap();
        let ctx = ConnectorContext::new(Utc::now());
        let err = connector
            .fetch_page(&fetcher(), &ctx, &PageCursor::Start)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::RenderCrashed(_)));
    }
}
