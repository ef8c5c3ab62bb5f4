//! Service settings, loaded from the backing TOML file with environment
//! variable overrides for the PACS credentials and upload cap.
use camino::Utf8PathBuf;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSettings {
    /// Monitored directory containing per-day folders.
    pub root_path: Utf8PathBuf,
    /// Base directory of the processed mirror tree.
    pub staging_path: Utf8PathBuf,
    #[serde(default = "default_api_host")]
    pub api_host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default)]
    pub pacs_base_url: Option<String>,
    #[serde(default)]
    pub pacs_token_url: Option<String>,
    #[serde(default)]
    pub pacs_client_id: Option<String>,
    #[serde(default)]
    pub pacs_client_secret: Option<String>,
    /// Upload cap in kilobytes per second. Absent or <= 0 means unthrottled.
    #[serde(default)]
    pub pacs_max_upload_kbps: Option<i64>,
    /// Written into the `InstitutionName` tag of every emitted instance.
    #[serde(default)]
    pub institution_name: String,
    /// Hint for the service host only; the core never reads it.
    #[serde(default)]
    pub auto_start: bool,
    #[serde(with = "humantime_serde", default = "default_scan_interval")]
    pub scan_interval: std::time::Duration,
    #[serde(with = "humantime_serde", default = "default_recovery_interval")]
    pub recovery_interval: std::time::Duration,
}

impl ServiceSettings {
    /// The effective upload cap, if any.
    pub fn upload_cap_kbps(&self) -> Option<u64> {
        self.pacs_max_upload_kbps
            .filter(|kbps| *kbps > 0)
            .map(|kbps| kbps as u64)
    }
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8085
}

fn default_scan_interval() -> std::time::Duration {
    std::time::Duration::from_secs(5)
}

fn default_recovery_interval() -> std::time::Duration {
    std::time::Duration::from_secs(60 * 60 * 24)
}
