//! Hot-reloadable access to [ServiceSettings].
//!
//! The backing TOML file is polled for mtime changes: at most one `stat`
//! per 500 ms, a reload only when the mtime actually moved. Environment
//! variables override the file for the PACS credentials and the upload cap.
use crate::settings::ServiceSettings;
use camino::{Utf8Path, Utf8PathBuf};
use figment::Figment;
use figment::providers::{Format, Serialized, Toml};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

const PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Environment variables that take precedence over the backing file.
/// `PACS_MAX_UPLOAD_BPS` maps onto `pacs_max_upload_kbps` and is read in KB/s.
const ENV_OVERRIDES: [(&str, &str); 5] = [
    ("PACS_BASE_URL", "pacs_base_url"),
    ("PACS_TOKEN_URL", "pacs_token_url"),
    ("PACS_CLIENT_ID", "pacs_client_id"),
    ("PACS_CLIENT_SECRET", "pacs_client_secret"),
    ("PACS_MAX_UPLOAD_BPS", "pacs_max_upload_kbps"),
];

pub struct ConfigWatcher {
    path: Utf8PathBuf,
    state: Mutex<WatchState>,
}

struct WatchState {
    snapshot: Arc<ServiceSettings>,
    mtime: Option<SystemTime>,
    last_probe: Instant,
}

impl ConfigWatcher {
    /// Load the backing file once and start watching it.
    pub fn open(path: impl AsRef<Utf8Path>) -> anyhow::Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let snapshot = Arc::new(load_settings(&path)?);
        let mtime = mtime_of(&path);
        Ok(Arc::new(Self {
            path,
            state: Mutex::new(WatchState {
                snapshot,
                mtime,
                last_probe: Instant::now(),
            }),
        }))
    }

    /// Current settings snapshot. Callers must treat it as immutable; a later
    /// `get` may return a different snapshot after a reload.
    pub fn get(&self) -> Arc<ServiceSettings> {
        let mut state = self.state.lock().unwrap();
        if state.last_probe.elapsed() >= PROBE_INTERVAL {
            state.last_probe = Instant::now();
            let mtime = mtime_of(&self.path);
            if mtime != state.mtime {
                state.mtime = mtime;
                match load_settings(&self.path) {
                    Ok(settings) => {
                        tracing::info!(path = self.path.as_str(), "configuration reloaded");
                        state.snapshot = Arc::new(settings);
                    }
                    Err(e) => {
                        // Keep serving the last good snapshot.
                        tracing::error!(
                            path = self.path.as_str(),
                            message = e.to_string(),
                            "configuration reload failed"
                        );
                    }
                }
            }
        }
        Arc::clone(&state.snapshot)
    }
}

/// One-shot load: TOML file, then targeted environment overrides on top.
pub fn load_settings(path: &Utf8Path) -> anyhow::Result<ServiceSettings> {
    let mut figment = Figment::new().merge(Toml::file(path));
    for (var, key) in ENV_OVERRIDES {
        let Ok(value) = std::env::var(var) else {
            continue;
        };
        if key == "pacs_max_upload_kbps" {
            match value.trim().parse::<i64>() {
                Ok(kbps) => figment = figment.merge(Serialized::default(key, kbps)),
                Err(_) => tracing::warn!(var, value, "ignoring non-numeric upload cap override"),
            }
        } else {
            figment = figment.merge(Serialized::default(key, value));
        }
    }
    let settings = figment.extract()?;
    Ok(settings)
}

fn mtime_of(path: &Utf8Path) -> Option<SystemTime> {
    fs_err::metadata(path).ok().and_then(|m| m.modified().ok())
}

#[cfg(test)]
impl ConfigWatcher {
    /// Watcher pinned to a fixed snapshot, for tests that do not exercise reload.
    pub(crate) fn fixed(settings: ServiceSettings) -> Arc<Self> {
        Arc::new(Self {
            path: Utf8PathBuf::from("-"),
            state: Mutex::new(WatchState {
                snapshot: Arc::new(settings),
                mtime: None,
                last_probe: Instant::now(),
            }),
        })
    }

    /// Swap the fixed snapshot, e.g. to change the upload cap mid-test.
    pub(crate) fn set_fixed(&self, settings: ServiceSettings) {
        let mut state = self.state.lock().unwrap();
        state.snapshot = Arc::new(settings);
        state.last_probe = Instant::now();
    }
}
