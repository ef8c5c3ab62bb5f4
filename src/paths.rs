//! Derives the per-day source and staging directories.
//!
//! The source tree keeps one `DD-MM-YYYY` folder per day directly under the
//! monitored root; the staging mirror nests the same leaf under
//! `Staging/YYYY/MM-YYYY/`.
use crate::settings::ServiceSettings;
use camino::Utf8PathBuf;
use time::macros::format_description;
use time::{Duration, OffsetDateTime};

/// The source root and staging directory of one calendar day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayFolders {
    /// `root_path/DD-MM-YYYY`; contains the case folders.
    pub root: Utf8PathBuf,
    /// `staging_path/Staging/YYYY/MM-YYYY/DD-MM-YYYY`; receives the mirror tree.
    pub staging: Utf8PathBuf,
}

impl DayFolders {
    pub fn today(settings: &ServiceSettings) -> Self {
        Self::for_date(settings, local_now())
    }

    pub fn yesterday(settings: &ServiceSettings) -> Self {
        Self::for_date(settings, local_now() - Duration::days(1))
    }

    fn for_date(settings: &ServiceSettings, date: OffsetDateTime) -> Self {
        let day_leaf = format(date, format_description!("[day]-[month]-[year]"));
        let root = settings.root_path.join(&day_leaf);
        let staging = settings
            .staging_path
            .join("Staging")
            .join(format(date, format_description!("[year]")))
            .join(format(date, format_description!("[month]-[year]")))
            .join(day_leaf);
        Self { root, staging }
    }

    /// Create the staging directory (with parents). Idempotent.
    pub fn ensure_staging(&self) -> std::io::Result<()> {
        fs_err::create_dir_all(self.staging.as_path())
    }

    /// Create the day's source root (with parents). Idempotent.
    pub fn ensure_root(&self) -> std::io::Result<()> {
        fs_err::create_dir_all(self.root.as_path())
    }
}

fn local_now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

fn format(
    date: OffsetDateTime,
    description: &[time::format_description::BorrowedFormatItem<'_>],
) -> String {
    date.format(description)
        .expect("date format descriptions are statically valid")
}
