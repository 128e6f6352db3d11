use nbia_fetch::client::{HttpArchiveClient, PackageRequest, is_retryable_status};
use nbia_fetch::config::ClientSettings;
use nbia_fetch::domain::ApiHost;

#[test]
fn endpoint_urls() {
    let base = ApiHost::Services.base_url();
    assert_eq!(
        HttpArchiveClient::endpoint_url(&base, "v4", "getSeries"),
        "https://services.cancerimagingarchive.net/nbia-api/services/v4/getSeries"
    );
    assert_eq!(
        HttpArchiveClient::endpoint_url(&base, "v1", "getContentsByName"),
        "https://services.cancerimagingarchive.net/nbia-api/services/v1/getContentsByName"
    );
}

#[test]
fn package_urls_ask_for_new_file_names() {
    let request = PackageRequest {
        uid: "1.3.6.1.4.1.9328.50.4.2".parse().unwrap(),
        with_md5: false,
        base_url: None,
    };
    assert_eq!(
        HttpArchiveClient::package_url(&ApiHost::Nlst.base_url(), &request),
        "https://nlst.cancerimagingarchive.net/nbia-api/services/v4/getImage?NewFileNames=Yes&SeriesInstanceUID=1.3.6.1.4.1.9328.50.4.2"
    );
}

#[test]
fn client_uses_configured_base_url() {
    let settings = ClientSettings {
        base_url: Some("http://localhost:9000/nbia-api/services/".to_string()),
        ..ClientSettings::default()
    };
    let client = HttpArchiveClient::new(&settings).unwrap();
    assert_eq!(client.base_url(), "http://localhost:9000/nbia-api/services");
}

#[test]
fn retryable_statuses() {
    for status in [408, 429, 500, 502, 503, 504] {
        assert!(is_retryable_status(status), "{status}");
    }
    for status in [400, 401, 403, 404, 410] {
        assert!(!is_retryable_status(status), "{status}");
    }
}
