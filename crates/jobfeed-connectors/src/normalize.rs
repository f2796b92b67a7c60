//! Shared text, date and link normalization used by every connector.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use jobfeed_core::JobCandidate;
use scraper::Html;
use serde_json::Value as JsonValue;
use url::Url;

use crate::registry::SourceConfig;

/// Field name → raw extracted text for one listing item.
pub type ExtractedFields = BTreeMap<&'static str, String>;

pub fn clean_text(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Strips markup from description bodies; plain text passes through `clean_text`.
pub fn html_to_text(value: &str) -> Option<String> {
    if !value.contains('<') {
        return clean_text(value);
    }
    let fragment = Html::parse_fragment(value);
    let text = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    clean_text(&text)
}

/// Reads the value at `pointer` as text. Numbers and booleans are stringified and arrays
/// of scalars are joined with ", ".
pub fn json_text(value: &JsonValue, pointer: &str) -> Option<String> {
    let target = if pointer.is_empty() {
        value
    } else {
        value.pointer(pointer)?
    };
    match target {
        JsonValue::String(s) => clean_text(s),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Array(items) => {
            let parts = items
                .iter()
                .filter_map(|item| json_text(item, ""))
                .collect::<Vec<_>>();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(", "))
            }
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParsedDate {
    Instant(DateTime<Utc>),
    Day(NaiveDate),
}

const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"];

const DATE_FORMATS: [&str; 9] = [
    "%Y-%m-%d",
    "%d-%b-%Y",
    "%d %b %Y",
    "%d/%m/%Y",
    "%d.%m.%Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
    "%Y/%m/%d",
];

fn parse_flexible(value: &str, explicit_format: Option<&str>) -> Option<ParsedDate> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Some(format) = explicit_format {
        if let Ok(dt) = DateTime::parse_from_str(value, format) {
            return Some(ParsedDate::Instant(dt.with_timezone(&Utc)));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(ParsedDate::Instant(Utc.from_utc_datetime(&naive)));
        }
        if let Ok(day) = NaiveDate::parse_from_str(value, format) {
            return Some(ParsedDate::Day(day));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(ParsedDate::Instant(dt.with_timezone(&Utc)));
    }
    if value.len() >= 10 && value.chars().all(|c| c.is_ascii_digit()) {
        let raw: i64 = value.parse().ok()?;
        // 13+ digits are epoch milliseconds
        let parsed = if value.len() >= 13 {
            Utc.timestamp_millis_opt(raw).single()
        } else {
            Utc.timestamp_opt(raw, 0).single()
        };
        return parsed.map(ParsedDate::Instant);
    }
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(ParsedDate::Instant(Utc.from_utc_datetime(&naive)));
        }
    }
    for format in DATE_FORMATS {
        if let Ok(day) = NaiveDate::parse_from_str(value, format) {
            return Some(ParsedDate::Day(day));
        }
    }
    None
}

/// Parses an application deadline. Bare dates close at the end of that day (UTC).
pub fn parse_deadline(value: &str, explicit_format: Option<&str>) -> Option<DateTime<Utc>> {
    match parse_flexible(value, explicit_format)? {
        ParsedDate::Instant(dt) => Some(dt),
        ParsedDate::Day(day) => {
            let end_of_day = NaiveTime::from_hms_opt(23, 59, 59)?;
            Some(Utc.from_utc_datetime(&day.and_time(end_of_day)))
        }
    }
}

/// Parses a posting start. Bare dates open at midnight (UTC).
pub fn parse_start(value: &str, explicit_format: Option<&str>) -> Option<DateTime<Utc>> {
    match parse_flexible(value, explicit_format)? {
        ParsedDate::Instant(dt) => Some(dt),
        ParsedDate::Day(day) => Some(Utc.from_utc_datetime(&day.and_time(NaiveTime::MIN))),
    }
}

/// Resolves a possibly relative link against the source endpoint.
pub fn resolve_link(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with("javascript:") || href == "#" {
        return None;
    }
    if let Ok(absolute) = Url::parse(href) {
        return Some(absolute.to_string());
    }
    Url::parse(base)
        .ok()?
        .join(href)
        .ok()
        .map(|u| u.to_string())
}

/// Maps extracted field text onto the canonical candidate shape. Missing required values
/// are left empty so that validation reports them.
pub fn candidate_from_fields(config: &SourceConfig, fields: &ExtractedFields) -> JobCandidate {
    let text = |name: &str| fields.get(name).and_then(|v| clean_text(v));
    let date_format = config.fields.date_format.as_deref();

    let source_job_id = text("source_job_id").unwrap_or_default();
    let apply_link = match &config.fields.apply_link_template {
        Some(template) if !source_job_id.is_empty() => {
            Some(template.replace("{id}", &source_job_id))
        }
        _ => text("apply_link").and_then(|href| resolve_link(&config.endpoint, &href)),
    };

    JobCandidate {
        source_job_id,
        source_name: config.source_name.clone(),
        organization_id: None,
        department_text: text("department").or_else(|| config.organization.clone()),
        title: text("title").unwrap_or_default(),
        description: fields.get("description").and_then(|v| html_to_text(v)),
        category_code: text("category_code"),
        level: text("level"),
        job_family: text("job_family"),
        duty_station: text("duty_station"),
        recruitment_type: text("recruitment_type"),
        start_date: text("start_date").and_then(|v| parse_start(&v, date_format)),
        end_date: text("end_date").and_then(|v| parse_deadline(&v, date_format)),
        apply_link,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clean_text_collapses_whitespace() {
        assert_eq!(clean_text("  Programme \n  Analyst\t"), Some("Programme Analyst".into()));
        assert_eq!(clean_text(" \n "), None);
    }

    #[test]
    fn html_descriptions_are_flattened() {
        let text = html_to_text("<p>Support the <b>country office</b></p><ul><li>Travel</li></ul>");
        assert_eq!(text.as_deref(), Some("Support the country office Travel"));
        assert_eq!(html_to_text("plain"), Some("plain".into()));
    }

    #[test]
    fn json_text_stringifies_scalars_and_arrays() {
        let value = json!({"id": 42, "tags": ["P-3", "Fixed term"], "remote": false, "none": null});
        assert_eq!(json_text(&value, "/id"), Some("42".into()));
        assert_eq!(json_text(&value, "/tags"), Some("P-3, Fixed term".into()));
        assert_eq!(json_text(&value, "/remote"), Some("false".into()));
        assert_eq!(json_text(&value, "/none"), None);
        assert_eq!(json_text(&value, "/missing"), None);
    }

    #[test]
    fn deadlines_parse_common_source_formats() {
        let expected_day_end = Utc.with_ymd_and_hms(2026, 1, 15, 23, 59, 59).unwrap();
        for raw in ["2026-01-15", "15-Jan-2026", "15/01/2026", "January 15, 2026", "15 Jan 2026"] {
            assert_eq!(parse_deadline(raw, None), Some(expected_day_end), "{raw}");
        }
        assert_eq!(
            parse_deadline("2026-01-15T10:00:00Z", None),
            Some(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap())
        );
        assert_eq!(
            parse_deadline("1768471200000", None),
            Some(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap())
        );
        assert_eq!(
            parse_deadline("15|01|2026", Some("%d|%m|%Y")),
            Some(expected_day_end)
        );
        assert_eq!(parse_deadline("open until filled", None), None);
    }

    #[test]
    fn start_dates_open_at_midnight() {
        assert_eq!(
            parse_start("2026-01-15", None),
            Some(Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn relative_links_resolve_against_the_endpoint() {
        assert_eq!(
            resolve_link("https://jobs.example.org/careers/list", "/job/42").as_deref(),
            Some("https://jobs.example.org/job/42")
        );
        assert_eq!(
            resolve_link("https://jobs.example.org", "https://other.example.org/x").as_deref(),
            Some("https://other.example.org/x")
        );
        assert_eq!(resolve_link("https://jobs.example.org", "#"), None);
    }
}
