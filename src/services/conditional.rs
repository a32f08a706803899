//! HTTP conditional-request evaluation and cache headers for file reads.
//!
//! Rules are checked in a fixed order and the first decisive one wins:
//!
//! 1. `If-Match` present and etag not listed: 412
//! 2. `If-None-Match` present and etag listed: 304
//! 3. `If-Modified-Since` present and not modified strictly after it: 304
//! 4. `If-Unmodified-Since` present and modified strictly after it: 412
//! 5. otherwise 200 (the caller upgrades to 206 when it serves a range)

use crate::errors::{ApiError, ApiResult};
use axum::http::{
    HeaderMap, HeaderValue, StatusCode,
    header::{self, HeaderName},
};
use chrono::{DateTime, SubsecRound, Utc};
use std::time::SystemTime;

/// Request precondition headers.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Preconditions {
    pub if_match: Option<Vec<String>>,
    pub if_none_match: Option<Vec<String>>,
    pub if_modified_since: Option<SystemTime>,
    pub if_unmodified_since: Option<SystemTime>,
}

impl Preconditions {
    /// Parse the precondition headers; an unparseable date is a 400.
    pub fn from_headers(headers: &HeaderMap) -> ApiResult<Self> {
        Ok(Self {
            if_match: etag_list(headers, &header::IF_MATCH),
            if_none_match: etag_list(headers, &header::IF_NONE_MATCH),
            if_modified_since: http_date(headers, &header::IF_MODIFIED_SINCE)?,
            if_unmodified_since: http_date(headers, &header::IF_UNMODIFIED_SINCE)?,
        })
    }
}

fn etag_list(headers: &HeaderMap, name: &HeaderName) -> Option<Vec<String>> {
    let mut values = headers.get_all(name).iter().peekable();
    values.peek()?;
    Some(
        values
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

fn http_date(headers: &HeaderMap, name: &HeaderName) -> ApiResult<Option<SystemTime>> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    let parsed = value
        .to_str()
        .map_err(|e| e.to_string())
        .and_then(|v| httpdate::parse_http_date(v).map_err(|e| e.to_string()));

    match parsed {
        Ok(date) => Ok(Some(date)),
        Err(err) => Err(ApiError::bad_request(format!("invalid {} header", name))
            .with_data("header", name.as_str())
            .extend(err)),
    }
}

/// The stored representation a read is about to serve.
#[derive(Debug, Clone, Copy)]
pub struct Representation<'a> {
    pub etag: &'a str,
    pub updated_at: DateTime<Utc>,
    pub cache_control: &'a str,
    pub content_type: &'a str,
    /// Length of the full representation.
    pub content_length: u64,
}

impl Representation<'_> {
    pub fn evaluate(&self, pre: &Preconditions) -> StatusCode {
        if let Some(list) = &pre.if_match {
            if !list.iter().any(|etag| etag == self.etag) {
                return StatusCode::PRECONDITION_FAILED;
            }
        }

        if let Some(list) = &pre.if_none_match {
            if list.iter().any(|etag| etag == self.etag) {
                return StatusCode::NOT_MODIFIED;
            }
        }

        // HTTP dates carry whole seconds.
        let modified = SystemTime::from(self.updated_at.trunc_subsecs(0));

        if let Some(since) = pre.if_modified_since {
            if modified <= since {
                return StatusCode::NOT_MODIFIED;
            }
        }

        if let Some(since) = pre.if_unmodified_since {
            if modified > since {
                return StatusCode::PRECONDITION_FAILED;
            }
        }

        StatusCode::OK
    }

    pub fn last_modified(&self) -> String {
        httpdate::fmt_http_date(SystemTime::from(self.updated_at))
    }

    /// Headers for a response with `status`.
    ///
    /// Cache headers are always present; `Content-Length`/`Content-Type`
    /// only when a body is served (200/206). For 206 the caller replaces
    /// `Content-Length` with the range length.
    pub fn headers(&self, status: StatusCode) -> HeaderMap {
        let mut headers = HeaderMap::new();
        insert(&mut headers, header::CACHE_CONTROL, self.cache_control);
        insert(&mut headers, header::ETAG, self.etag);
        insert(&mut headers, header::LAST_MODIFIED, &self.last_modified());

        if matches!(status, StatusCode::OK | StatusCode::PARTIAL_CONTENT) {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(self.content_length));
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_str(self.content_type)
                    .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
            );
            headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        }
        headers
    }
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    const ETAG: &str = "\"abc\"";

    fn updated_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::milliseconds(250)
    }

    fn repr() -> Representation<'static> {
        Representation {
            etag: ETAG,
            updated_at: updated_at(),
            cache_control: "max-age=3600",
            content_type: "text/plain",
            content_length: 12,
        }
    }

    fn at(offset_secs: i64) -> SystemTime {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        SystemTime::from(base + Duration::seconds(offset_secs))
    }

    fn list(values: &[&str]) -> Option<Vec<String>> {
        Some(values.iter().map(|v| v.to_string()).collect())
    }

    #[test]
    fn decision_table() {
        let cases: Vec<(Preconditions, StatusCode)> = vec![
            (Preconditions::default(), StatusCode::OK),
            (
                Preconditions { if_match: list(&[ETAG]), ..Default::default() },
                StatusCode::OK,
            ),
            (
                Preconditions { if_match: list(&["\"other\""]), ..Default::default() },
                StatusCode::PRECONDITION_FAILED,
            ),
            (
                Preconditions { if_match: list(&["\"other\"", ETAG]), ..Default::default() },
                StatusCode::OK,
            ),
            (
                Preconditions { if_none_match: list(&[ETAG]), ..Default::default() },
                StatusCode::NOT_MODIFIED,
            ),
            (
                Preconditions { if_none_match: list(&["\"other\""]), ..Default::default() },
                StatusCode::OK,
            ),
            (
                Preconditions { if_modified_since: Some(at(0)), ..Default::default() },
                StatusCode::NOT_MODIFIED,
            ),
            (
                Preconditions { if_modified_since: Some(at(-1)), ..Default::default() },
                StatusCode::OK,
            ),
            (
                Preconditions { if_unmodified_since: Some(at(0)), ..Default::default() },
                StatusCode::OK,
            ),
            (
                Preconditions { if_unmodified_since: Some(at(-1)), ..Default::default() },
                StatusCode::PRECONDITION_FAILED,
            ),
        ];

        for (i, (pre, expected)) in cases.into_iter().enumerate() {
            assert_eq!(repr().evaluate(&pre), expected, "case {i}: {pre:?}");
        }
    }

    #[test]
    fn if_match_is_checked_first() {
        let pre = Preconditions {
            if_match: list(&["\"other\""]),
            if_none_match: list(&[ETAG]),
            if_modified_since: Some(at(10)),
            ..Default::default()
        };
        assert_eq!(repr().evaluate(&pre), StatusCode::PRECONDITION_FAILED);

        // matching If-Match falls through to If-None-Match
        let pre = Preconditions {
            if_match: list(&[ETAG]),
            if_none_match: list(&[ETAG]),
            ..Default::default()
        };
        assert_eq!(repr().evaluate(&pre), StatusCode::NOT_MODIFIED);
    }

    #[test]
    fn undecided_modified_since_falls_through() {
        let pre = Preconditions {
            if_modified_since: Some(at(-1)),
            if_unmodified_since: Some(at(-1)),
            ..Default::default()
        };
        assert_eq!(repr().evaluate(&pre), StatusCode::PRECONDITION_FAILED);

        let pre = Preconditions {
            if_modified_since: Some(at(0)),
            if_unmodified_since: Some(at(-1)),
            ..Default::default()
        };
        assert_eq!(repr().evaluate(&pre), StatusCode::NOT_MODIFIED);
    }

    #[test]
    fn parses_headers() {
        let mut headers = HeaderMap::new();
        headers.append(header::IF_MATCH, HeaderValue::from_static("\"a\", \"b\""));
        headers.append(header::IF_MATCH, HeaderValue::from_static("\"c\""));
        headers.insert(
            header::IF_MODIFIED_SINCE,
            HeaderValue::from_static("Wed, 01 May 2024 12:00:00 GMT"),
        );

        let pre = Preconditions::from_headers(&headers).unwrap();
        assert_eq!(pre.if_match, list(&["\"a\"", "\"b\"", "\"c\""]));
        assert_eq!(pre.if_none_match, None);
        assert_eq!(pre.if_modified_since, Some(at(0)));
    }

    #[test]
    fn bad_dates_are_client_errors() {
        let mut headers = HeaderMap::new();
        headers.insert(header::IF_UNMODIFIED_SINCE, HeaderValue::from_static("yesterday"));
        let err = Preconditions::from_headers(&headers).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "invalid if-unmodified-since header");
    }

    #[test]
    fn headers_depend_on_status() {
        let ok = repr().headers(StatusCode::OK);
        assert_eq!(ok[header::CACHE_CONTROL], "max-age=3600");
        assert_eq!(ok[header::ETAG], ETAG);
        assert_eq!(ok[header::LAST_MODIFIED], "Wed, 01 May 2024 12:00:00 GMT");
        assert_eq!(ok[header::CONTENT_LENGTH], "12");
        assert_eq!(ok[header::CONTENT_TYPE], "text/plain");

        let not_modified = repr().headers(StatusCode::NOT_MODIFIED);
        assert_eq!(not_modified[header::ETAG], ETAG);
        assert!(not_modified.contains_key(header::CACHE_CONTROL));
        assert!(!not_modified.contains_key(header::CONTENT_LENGTH));
        assert!(!not_modified.contains_key(header::CONTENT_TYPE));
    }
}
