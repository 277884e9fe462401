use std::fs::{self, File};
use std::thread;
use std::time::Duration;

use camino::Utf8Path;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::warn;

use crate::domain::SeriesId;
use crate::error::StageError;
use crate::fs_util;

/// Remote imaging archive: series listing and download.
pub trait ArchiveClient: Send + Sync {
    fn list_series(&self, collection: &str, modality: &str) -> Result<Vec<SeriesId>, StageError>;

    /// Downloads every identifier into `destination/<series id>/`.
    fn download(&self, ids: &[SeriesId], destination: &Utf8Path) -> Result<(), StageError>;
}

/// Backoff for NBIA requests. The service sheds load with 429 and gateway
/// errors while large `getImage` archives are being assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Linear backoff before retry number `retry` (1-based); `None` once the budget is spent.
    pub fn delay_before(&self, retry: u32) -> Option<Duration> {
        (retry >= 1 && retry <= self.retries).then(|| self.base_delay * retry)
    }

    pub fn is_transient_status(status: u16) -> bool {
        matches!(status, 429 | 500 | 502 | 503 | 504)
    }
}

/// Client for the TCIA NBIA REST API.
#[derive(Clone)]
pub struct NbiaHttpClient {
    client: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl NbiaHttpClient {
    pub fn new() -> Result<Self, StageError> {
        Self::with_base_url("https://services.cancerimagingarchive.net/nbia-api/services/v1")
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, StageError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("volstage/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| StageError::ArchiveHttp(err.to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|err| StageError::ArchiveHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            retry: RetryPolicy::default(),
        })
    }

    fn download_one(&self, id: &SeriesId, destination: &Utf8Path) -> Result<(), StageError> {
        let mut response = self.get("getImage", &[("SeriesInstanceUID", id.as_str())])?;

        let zip_path = destination.join(format!("{}.zip", id.as_str()));
        let mut file = File::create(zip_path.as_std_path())
            .map_err(|err| StageError::io(format!("create {zip_path}"), err))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| StageError::io(format!("write {zip_path}"), err))?;
        drop(file);

        let series_dir = destination.join(id.as_str());
        fs::create_dir_all(series_dir.as_std_path())
            .map_err(|err| StageError::io(format!("create {series_dir}"), err))?;
        fs_util::extract_zip(zip_path.as_std_path(), series_dir.as_std_path())?;
        fs::remove_file(zip_path.as_std_path())
            .map_err(|err| StageError::io(format!("remove {zip_path}"), err))?;
        Ok(())
    }

    /// GET `<base>/<endpoint>`, backing off on transient failures. Anything
    /// other than a 2xx after the last attempt becomes `ArchiveStatus`.
    fn get(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<Response, StageError> {
        let url = format!("{}/{endpoint}", self.base_url);
        let mut attempt = 0;
        let response = loop {
            let sent = self.client.get(&url).query(query).send();
            let transient = match &sent {
                Ok(response) => RetryPolicy::is_transient_status(response.status().as_u16()),
                Err(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            };
            match self.retry.delay_before(attempt + 1) {
                Some(delay) if transient => {
                    warn!(endpoint, attempt, "archive request failed; retrying in {delay:?}");
                    thread::sleep(delay);
                    attempt += 1;
                }
                _ => break sent.map_err(|err| StageError::ArchiveHttp(err.to_string()))?,
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .text()
            .ok()
            .filter(|body| !body.trim().is_empty())
            .unwrap_or_else(|| format!("{endpoint} failed"));
        Err(StageError::ArchiveStatus {
            status: status.as_u16(),
            message,
        })
    }
}

impl ArchiveClient for NbiaHttpClient {
    fn list_series(&self, collection: &str, modality: &str) -> Result<Vec<SeriesId>, StageError> {
        let response = self.get("getSeries", &[("Collection", collection), ("Modality", modality)])?;
        // An empty collection comes back as an empty body rather than `[]`.
        let body = response
            .text()
            .map_err(|err| StageError::ArchiveHttp(err.to_string()))?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        let value: Value =
            serde_json::from_str(&body).map_err(|err| StageError::ArchiveListing(err.to_string()))?;
        parse_series_listing(&value)
    }

    fn download(&self, ids: &[SeriesId], destination: &Utf8Path) -> Result<(), StageError> {
        fs::create_dir_all(destination.as_std_path())
            .map_err(|err| StageError::io(format!("create {destination}"), err))?;
        for id in ids {
            self.download_one(id, destination)?;
        }
        Ok(())
    }
}

/// Accepts either objects carrying `SeriesInstanceUID` or bare identifier strings.
pub fn parse_series_listing(value: &Value) -> Result<Vec<SeriesId>, StageError> {
    let items = value
        .as_array()
        .ok_or_else(|| StageError::ArchiveListing("response is not a list".to_string()))?;
    items
        .iter()
        .map(|item| match item {
            Value::String(uid) => uid.parse(),
            Value::Object(map) => map
                .get("SeriesInstanceUID")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    StageError::ArchiveListing("entry without SeriesInstanceUID".to_string())
                })?
                .parse(),
            other => Err(StageError::ArchiveListing(format!(
                "unsupported entry: {other}"
            ))),
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn listing_accepts_objects_and_strings() {
        let objects = json!([
            {"SeriesInstanceUID": "1.2.3", "Modality": "CT"},
            {"SeriesInstanceUID": "1.2.4"}
        ]);
        let ids = parse_series_listing(&objects).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[1].as_str(), "1.2.4");

        let strings = json!(["9.8.7"]);
        assert_eq!(parse_series_listing(&strings).unwrap()[0].as_str(), "9.8.7");
    }

    #[test]
    fn retry_delays_grow_linearly_until_budget_is_spent() {
        let policy = RetryPolicy {
            retries: 2,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_before(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_before(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_before(3), None);
        assert_eq!(RetryPolicy { retries: 0, ..policy }.delay_before(1), None);
    }

    #[test]
    fn only_throttling_and_gateway_statuses_are_transient() {
        for status in [429, 500, 502, 503, 504] {
            assert!(RetryPolicy::is_transient_status(status));
        }
        for status in [400, 401, 404, 501] {
            assert!(!RetryPolicy::is_transient_status(status));
        }
    }

    #[test]
    fn listing_rejects_unknown_shapes() {
        assert_matches!(
            parse_series_listing(&json!({"a": 1})),
            Err(StageError::ArchiveListing(_))
        );
        assert_matches!(
            parse_series_listing(&json!([42])),
            Err(StageError::ArchiveListing(_))
        );
    }
}
