//! Shared fixtures for unit tests.
use crate::settings::ServiceSettings;
use camino::Utf8PathBuf;
use std::time::Duration;

pub(crate) fn settings(root: &str, staging: &str) -> ServiceSettings {
    ServiceSettings {
        root_path: Utf8PathBuf::from(root),
        staging_path: Utf8PathBuf::from(staging),
        api_host: "127.0.0.1".to_string(),
        api_port: 8085,
        pacs_base_url: None,
        pacs_token_url: None,
        pacs_client_id: None,
        pacs_client_secret: None,
        pacs_max_upload_kbps: None,
        institution_name: "Test Dental".to_string(),
        auto_start: false,
        scan_interval: Duration::from_secs(5),
        recovery_interval: Duration::from_secs(60 * 60 * 24),
    }
}

pub(crate) fn settings_with_cap(cap_kbps: Option<i64>) -> ServiceSettings {
    ServiceSettings {
        pacs_max_upload_kbps: cap_kbps,
        ..settings("/cases", "/staging")
    }
}
