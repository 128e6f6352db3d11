use std::fs::File;
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::ClientSettings;
use crate::domain::{InstanceUid, SeriesUid};
use crate::error::NbiaError;
use crate::query::{Method, PageCursor, Request};

/// What to fetch for one series package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRequest {
    pub uid: SeriesUid,
    /// Ask the archive to include `md5hashes.csv` in the package.
    pub with_md5: bool,
    /// Replaces the configured API base URL for this package only.
    pub base_url: Option<String>,
}

/// One DICOM instance of a series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub series: SeriesUid,
    pub sop: InstanceUid,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageInfo {
    pub bytes: u64,
    pub is_zip: bool,
}

/// Transport to the archive. Each call is a single attempt; retry policy
/// belongs to the pager and the download orchestrator.
pub trait ArchiveClient: Send + Sync {
    fn fetch_page(&self, request: &Request, cursor: &PageCursor) -> Result<Value, NbiaError>;
    fn fetch_package(
        &self,
        request: &PackageRequest,
        destination: &Path,
    ) -> Result<PackageInfo, NbiaError>;
    fn fetch_image(
        &self,
        request: &ImageRequest,
        destination: &Path,
    ) -> Result<PackageInfo, NbiaError>;
}

#[derive(Clone)]
pub struct HttpArchiveClient {
    client: Client,
    base_url: String,
}

impl HttpArchiveClient {
    pub fn new(settings: &ClientSettings) -> Result<Self, NbiaError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("nbia-fetch/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| NbiaError::Http(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|err| NbiaError::Http(err.to_string()))?;

        Ok(Self {
            client,
            base_url: settings.api_base_url(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn endpoint_url(base_url: &str, api_version: &str, path: &str) -> String {
        format!("{}/{}/{}", base_url.trim_end_matches('/'), api_version, path)
    }

    pub fn package_url(base_url: &str, request: &PackageRequest) -> String {
        let path = if request.with_md5 {
            format!("getImageWithMD5Hash?SeriesInstanceUID={}", request.uid)
        } else {
            format!("getImage?NewFileNames=Yes&SeriesInstanceUID={}", request.uid)
        };
        Self::endpoint_url(base_url, "v4", &path)
    }

    pub fn image_url(base_url: &str, request: &ImageRequest) -> String {
        let path = format!(
            "getSingleImage?SeriesInstanceUID={}&SOPInstanceUID={}",
            request.series, request.sop
        );
        Self::endpoint_url(base_url, "v4", &path)
    }

    /// Streams the body of `url` into `destination`.
    fn download_to(
        &self,
        url: &str,
        destination: &Path,
        label: &str,
    ) -> Result<PackageInfo, NbiaError> {
        let mut response = self.send(self.client.get(url))?;
        let is_zip = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.contains("zip"))
            .unwrap_or(false);

        let mut file =
            File::create(destination).map_err(|err| NbiaError::Filesystem(err.to_string()))?;
        let bytes = std::io::copy(&mut response, &mut file).map_err(|err| NbiaError::Transient {
            status: None,
            message: format!("transfer of {label} interrupted: {err}"),
        })?;
        Ok(PackageInfo { bytes, is_zip })
    }

    fn send(&self, builder: RequestBuilder) -> Result<Response, NbiaError> {
        let response = builder.send().map_err(classify_transport_error)?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "NBIA request failed".to_string());
        Err(classify_status(status, message))
    }
}

impl ArchiveClient for HttpArchiveClient {
    fn fetch_page(&self, request: &Request, cursor: &PageCursor) -> Result<Value, NbiaError> {
        let endpoint = request.endpoint();
        let url = Self::endpoint_url(&self.base_url, endpoint.api_version(), endpoint.path());
        let params = request.page_params(cursor);
        info!(endpoint = %endpoint, ?params, "calling NBIA");

        let builder = match endpoint.method() {
            Method::Get => self.client.get(&url).query(&params),
            Method::PostForm => self.client.post(&url).form(&params),
        };
        let response = self.send(builder)?;
        let body = response.text().map_err(classify_transport_error)?;
        if body.trim().is_empty() {
            debug!(endpoint = %endpoint, "empty response body");
            return Ok(Value::Array(Vec::new()));
        }
        serde_json::from_str(&body)
            .map_err(|err| NbiaError::UnexpectedResponse(format!("{endpoint}: {err}")))
    }

    fn fetch_package(
        &self,
        request: &PackageRequest,
        destination: &Path,
    ) -> Result<PackageInfo, NbiaError> {
        let base_url = request.base_url.as_deref().unwrap_or(&self.base_url);
        let url = Self::package_url(base_url, request);
        info!(series = %request.uid, %url, "downloading package");
        self.download_to(&url, destination, request.uid.as_str())
    }

    fn fetch_image(
        &self,
        request: &ImageRequest,
        destination: &Path,
    ) -> Result<PackageInfo, NbiaError> {
        let base_url = request.base_url.as_deref().unwrap_or(&self.base_url);
        let url = Self::image_url(base_url, request);
        info!(series = %request.series, sop = %request.sop, "downloading image");
        self.download_to(&url, destination, request.sop.as_str())
    }
}

/// Rate limits, timeouts and server errors are worth retrying; other 4xx are not.
pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

pub fn classify_status(status: u16, message: String) -> NbiaError {
    if is_retryable_status(status) {
        NbiaError::Transient {
            status: Some(status),
            message,
        }
    } else {
        NbiaError::RequestRejected { status, message }
    }
}

fn classify_transport_error(err: reqwest::Error) -> NbiaError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        NbiaError::Transient {
            status: None,
            message: err.to_string(),
        }
    } else {
        NbiaError::Http(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn status_classification() {
        assert_matches!(
            classify_status(429, String::new()),
            NbiaError::Transient {
                status: Some(429),
                ..
            }
        );
        assert_matches!(
            classify_status(503, String::new()),
            NbiaError::Transient { .. }
        );
        assert_matches!(
            classify_status(404, String::new()),
            NbiaError::RequestRejected { status: 404, .. }
        );
    }

    #[test]
    fn package_urls() {
        let request = PackageRequest {
            uid: "1.2.3".parse().unwrap(),
            with_md5: true,
            base_url: None,
        };
        assert_eq!(
            HttpArchiveClient::package_url("https://example.org/api/", &request),
            "https://example.org/api/v4/getImageWithMD5Hash?SeriesInstanceUID=1.2.3"
        );
    }

    #[test]
    fn single_image_urls_name_series_and_instance() {
        let request = ImageRequest {
            series: "1.2.3".parse().unwrap(),
            sop: "1.2.3.4".parse().unwrap(),
            base_url: None,
        };
        assert_eq!(
            HttpArchiveClient::image_url("https://example.org/api", &request),
            "https://example.org/api/v4/getSingleImage?SeriesInstanceUID=1.2.3&SOPInstanceUID=1.2.3.4"
        );
    }
}
