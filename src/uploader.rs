//! Drives the upload of one staged `Orthanc/` folder to the PACS.
//!
//! Single flight per folder is enforced by an in-memory set of canonicalized
//! paths; the on-disk `.pacs_uploading` sentinel is only a cross-restart
//! hint. A sentinel found at claim time marks an interrupted run: both
//! sentinels and the `temp/` scratch directory are cleared and the upload
//! starts over, skipping every instance the PACS already has.
use crate::dicom_meta::{self, instance_uids, trimmed_string};
use crate::log_sink::UiLog;
use crate::pacs::PacsClient;
use crate::throttle::ProgressFn;
use crate::types::{CaseLabel, CaseName, SeriesInstanceUid, SopInstanceUid, StudyInstanceUid};
use camino::{Utf8Path, Utf8PathBuf};
use dicom::dictionary_std::tags;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use time::macros::format_description;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

const UPLOADING_SENTINEL: &str = ".pacs_uploading";
const PROGRESS_SENTINEL: &str = ".pacs_progress";
const TEMP_DIR: &str = "temp";

const CONFIRM_ATTEMPTS: u32 = 3;
const CONFIRM_DELAY: Duration = Duration::from_millis(500);

/// Result of asking the orchestrator to upload a folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadStart {
    pub started: bool,
    pub reason: Option<&'static str>,
}

impl UploadStart {
    fn started() -> Self {
        Self {
            started: true,
            reason: None,
        }
    }

    fn refused(reason: &'static str) -> Self {
        Self {
            started: false,
            reason: Some(reason),
        }
    }
}

#[derive(Clone)]
pub struct UploadOrchestrator {
    pacs: Arc<PacsClient>,
    ui: UiLog,
    cancel: CancellationToken,
    active: Arc<Mutex<HashSet<Utf8PathBuf>>>,
}

impl UploadOrchestrator {
    pub fn new(pacs: Arc<PacsClient>, ui: UiLog, cancel: CancellationToken) -> Self {
        Self {
            pacs,
            ui,
            cancel,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Claim the folder and spawn a background worker for it. Never waits for
    /// the upload itself.
    pub fn upload_folder(
        &self,
        folder: Utf8PathBuf,
        case_name: CaseName,
        labels: Vec<CaseLabel>,
    ) -> UploadStart {
        if !folder.is_dir() {
            return UploadStart::refused("missing-folder");
        }
        if let Err(e) = self.pacs.check_configured() {
            tracing::warn!(case = case_name.as_str(), message = e.to_string());
            self.ui.log(
                format!("PACS upload skipped for {case_name}: {e}"),
                "uploader",
            );
            return UploadStart::refused("not-configured");
        }

        let key = canonical_key(&folder);
        {
            let mut active = self.active.lock().unwrap();
            if !active.insert(key.clone()) {
                self.ui
                    .log("PACS upload already in progress".to_string(), "uploader");
                return UploadStart::refused("in-progress");
            }
        }

        let lock_path = folder.join(UPLOADING_SENTINEL);
        if lock_path.exists() {
            // Leftover from a crashed run: report how far it got, then reset.
            let percent = fs_err::read_to_string(folder.join(PROGRESS_SENTINEL))
                .map(|p| p.trim().to_string())
                .unwrap_or_default();
            if percent.is_empty() {
                self.ui
                    .log("Recovering interrupted PACS upload", "uploader");
            } else {
                self.ui.log(
                    format!("Recovering interrupted PACS upload at {percent}%"),
                    "uploader",
                );
            }
            clear_run_state(&folder);
        }

        if let Err(e) = fs_err::write(lock_path.as_path(), sentinel_timestamp()) {
            tracing::warn!(path = lock_path.as_str(), message = e.to_string());
        }
        write_progress(&folder, 0);

        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator
                .run_worker(&folder, &case_name, &labels)
                .await;
            clear_run_state(&folder);
            orchestrator.active.lock().unwrap().remove(&key);
        });
        UploadStart::started()
    }

    async fn run_worker(&self, folder: &Utf8Path, case_name: &CaseName, labels: &[CaseLabel]) {
        let files = dicom_files_under(folder);
        if files.is_empty() {
            return;
        }
        self.ui.log(
            format!(
                "PACS upload started for case {case_name}: {} file(s)",
                files.len()
            ),
            "uploader",
        );

        let temp_dir = folder.join(TEMP_DIR);
        if let Err(e) = fs_err::create_dir_all(temp_dir.as_path()) {
            tracing::error!(dir = temp_dir.as_str(), message = e.to_string());
            return;
        }

        let mut failures: Vec<(Utf8PathBuf, String)> = Vec::new();
        for path in &files {
            if self.cancel.is_cancelled() {
                return;
            }
            if let Err(error) = self
                .upload_one(folder, &temp_dir, path, case_name)
                .await
            {
                failures.push((path.clone(), error));
            }
        }

        if failures.is_empty() {
            write_progress(folder, 100);
            self.apply_labels(folder, case_name, labels).await;
            self.ui.log(
                format!(
                    "PACS upload completed for case {case_name}: {} file(s)",
                    files.len()
                ),
                "uploader",
            );
        } else {
            for (path, error) in &failures {
                self.ui.log_color(
                    format!("PACS upload failed for case {case_name}: {path} - {error}"),
                    "uploader",
                    "red",
                );
            }
            self.ui.log_color(
                format!(
                    "PACS upload completed for case {case_name} with {} failure(s) out of {}",
                    failures.len(),
                    files.len()
                ),
                "uploader",
                "red",
            );
        }
    }

    /// Upload a single staged file: skip when the PACS already has it, copy
    /// into `temp/`, stream it up, then poll until the instance is visible.
    async fn upload_one(
        &self,
        folder: &Utf8Path,
        temp_dir: &Utf8Path,
        path: &Utf8Path,
        case_name: &CaseName,
    ) -> Result<(), String> {
        let file_name = path.file_name().unwrap_or(path.as_str());
        let uids = match dicom_meta::read_header(path) {
            Ok(dcm) => instance_uids(&dcm),
            Err(e) => {
                self.ui.log(
                    format!("PACS SOP UID read failed for {file_name}: {e}"),
                    "uploader",
                );
                (None, None)
            }
        };

        if let (Some(sop_uid), Some(series_uid)) = (&uids.0, &uids.1) {
            match self.pacs.instance_exists(sop_uid, series_uid).await {
                Ok(true) => {
                    self.ui.log(
                        format!("PACS already has for case {case_name}: {file_name}, skipping"),
                        "uploader",
                    );
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => {
                    // Lookup failure is not fatal; the upload itself decides.
                    tracing::warn!(path = path.as_str(), message = e.to_string());
                }
            }
        }

        let temp_path = temp_destination(temp_dir, path);
        fs_err::copy(path, temp_path.as_path()).map_err(|e| e.to_string())?;

        let progress = self.progress_writer(folder, case_name, file_name.to_string());
        self.pacs
            .upload_instance(&temp_path, progress)
            .await
            .map_err(|e| e.to_string())?;

        match (&uids.0, &uids.1) {
            (Some(sop_uid), Some(series_uid)) => {
                if self.confirm_uploaded(sop_uid, series_uid).await {
                    self.ui.log(
                        format!("PACS upload confirmed for case {case_name}: {file_name}"),
                        "uploader",
                    );
                    Ok(())
                } else {
                    self.ui.log(
                        format!("PACS upload not confirmed for case {case_name}: {file_name}"),
                        "uploader",
                    );
                    Err("upload-not-confirmed".to_string())
                }
            }
            _ => {
                self.ui.log(
                    format!(
                        "PACS upload completed for case {case_name}: {file_name} (no SOPInstanceUID)"
                    ),
                    "uploader",
                );
                Ok(())
            }
        }
    }

    async fn confirm_uploaded(
        &self,
        sop_uid: &SopInstanceUid,
        series_uid: &SeriesInstanceUid,
    ) -> bool {
        for attempt in 0..CONFIRM_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(CONFIRM_DELAY).await;
            }
            if let Ok(true) = self.pacs.instance_exists(sop_uid, series_uid).await {
                return true;
            }
        }
        false
    }

    async fn apply_labels(&self, folder: &Utf8Path, case_name: &CaseName, labels: &[CaseLabel]) {
        if labels.is_empty() {
            return;
        }
        let Some(study_uid) = study_uid_under(folder) else {
            self.ui.log(
                format!("PACS labels skipped for case {case_name}: no study UID found"),
                "uploader",
            );
            return;
        };
        for label in labels {
            self.pacs.add_label(&study_uid, label.as_str()).await;
        }
    }

    /// Progress callback: rewrite `.pacs_progress` and notify the operator
    /// only when the integer percent actually changes.
    fn progress_writer(
        &self,
        folder: &Utf8Path,
        case_name: &CaseName,
        file_name: String,
    ) -> ProgressFn {
        let folder = folder.to_path_buf();
        let case_name = case_name.clone();
        let ui = self.ui.clone();
        let last_percent = Mutex::new(-1i64);
        Arc::new(move |sent, total| {
            if total == 0 {
                return;
            }
            let percent = (sent * 100 / total) as i64;
            let mut last = last_percent.lock().unwrap();
            if percent == *last {
                return;
            }
            *last = percent;
            write_progress(&folder, percent);
            ui.log(
                format!("PACS upload progress for case {case_name}: {percent}% ({file_name})"),
                "uploader",
            );
        })
    }
}

/// Every `.dcm` file below the folder except the `temp/` scratch area,
/// in sorted full-path order.
fn dicom_files_under(folder: &Utf8Path) -> Vec<Utf8PathBuf> {
    let temp_dir = folder.join(TEMP_DIR);
    let mut files: Vec<Utf8PathBuf> = WalkDir::new(folder)
        .into_iter()
        .filter_entry(|e| !(e.file_type().is_dir() && e.path() == temp_dir.as_std_path()))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| Utf8PathBuf::from_path_buf(entry.into_path()).ok())
        .filter(|path| {
            path.extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
                && !path
                    .file_name()
                    .is_some_and(|name| name.starts_with('.'))
        })
        .collect();
    files.sort();
    files
}

/// Study UID of the first DICOM under the folder, for labeling.
fn study_uid_under(folder: &Utf8Path) -> Option<StudyInstanceUid> {
    dicom_files_under(folder).iter().find_map(|path| {
        let dcm = dicom_meta::read_header(path).ok()?;
        trimmed_string(&dcm, tags::STUDY_INSTANCE_UID).map(StudyInstanceUid::from)
    })
}

/// Same-named scratch copy; a leftover of a different size gets a unique
/// epoch-millis suffix instead of being overwritten.
fn temp_destination(temp_dir: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    let file_name = path.file_name().unwrap_or(path.as_str());
    let dest = temp_dir.join(file_name);
    let same_size = match (fs_err::metadata(dest.as_path()), fs_err::metadata(path)) {
        (Ok(dest_meta), Ok(src_meta)) => dest_meta.len() == src_meta.len(),
        (Err(_), _) => return dest,
        _ => false,
    };
    if same_size {
        return dest;
    }
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let stem = path.file_stem().unwrap_or(file_name);
    let extension = path
        .extension()
        .map(|e| format!(".{e}"))
        .unwrap_or_else(|| ".dcm".to_string());
    temp_dir.join(format!("{stem}_{millis}{extension}"))
}

/// Remove both sentinels and the scratch directory; errors are irrelevant
/// because a later run clears them again.
fn clear_run_state(folder: &Utf8Path) {
    let _ = fs_err::remove_file(folder.join(UPLOADING_SENTINEL));
    let _ = fs_err::remove_file(folder.join(PROGRESS_SENTINEL));
    let _ = fs_err::remove_dir_all(folder.join(TEMP_DIR));
}

fn write_progress(folder: &Utf8Path, percent: i64) {
    let _ = fs_err::write(folder.join(PROGRESS_SENTINEL), percent.to_string());
}

fn sentinel_timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    ))
    .unwrap_or_default()
}

/// Single-flight key: the OS-normalized absolute path when resolvable.
fn canonical_key(folder: &Utf8Path) -> Utf8PathBuf {
    folder
        .canonicalize_utf8()
        .unwrap_or_else(|_| folder.to_path_buf())
}
