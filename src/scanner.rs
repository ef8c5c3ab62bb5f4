//! The top-level scan loop: sweep today's folder every tick, periodically
//! re-drive yesterday's cases to catch anything a crash or outage left
//! behind.
use crate::classifier::{self, classify_case};
use crate::config::ConfigWatcher;
use crate::dicom_meta::{self, instance_uids};
use crate::log_sink::UiLog;
use crate::pacs::PacsClient;
use crate::paths::DayFolders;
use crate::settings::ServiceSettings;
use crate::stager::{self, StagedCase, stage_case};
use crate::types::{CaseLabel, CaseName};
use crate::uploader::UploadOrchestrator;
use camino::{Utf8Path, Utf8PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct ScanContext {
    pub config: Arc<ConfigWatcher>,
    pub ui: UiLog,
    pub pacs: Arc<PacsClient>,
    pub uploader: Arc<UploadOrchestrator>,
}

/// Run scans until cancelled. Scans never overlap themselves; uploads run on
/// background tasks and are not awaited here.
pub async fn scan_loop(ctx: ScanContext, cancel: CancellationToken) {
    ctx.ui.log("Case scan service starting", "service");
    let mut last_recovery: Option<Instant> = None;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let settings = ctx.config.get();
        if let Err(e) = scan_today(&ctx, &settings, &cancel).await {
            tracing::error!(message = e.to_string(), "today scan failed");
            ctx.ui
                .log_color(format!("Scan failed: {e}"), "service", "red");
        }

        let recovery_due = last_recovery
            .map(|at| at.elapsed() >= settings.recovery_interval)
            .unwrap_or(true);
        if recovery_due && !cancel.is_cancelled() {
            last_recovery = Some(Instant::now());
            if let Err(e) = scan_yesterday(&ctx, &settings, &cancel).await {
                tracing::error!(message = e.to_string(), "yesterday recovery failed");
                ctx.ui
                    .log_color(format!("Yesterday recovery failed: {e}"), "service", "red");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(settings.scan_interval) => {}
        }
    }
    ctx.ui.log("Case scan service stopped", "service");
}

/// One sweep of today's root. A case's failure never stops the sweep.
async fn scan_today(
    ctx: &ScanContext,
    settings: &ServiceSettings,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let day = DayFolders::today(settings);
    day.ensure_root()?;
    day.ensure_staging()?;
    tracing::debug!(root = day.root.as_str(), "scanning");

    for case_dir in case_folders(&day.root)? {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let Some(case_name) = case_name_of(&case_dir) else {
            continue;
        };
        match stage_in_background(ctx, settings, &day, case_dir, &case_name).await {
            Ok(staged) => {
                ctx.uploader
                    .upload_folder(staged.orthanc_dir, case_name, staged.labels);
            }
            Err(e) => {
                tracing::error!(case = case_name.as_str(), message = e.to_string());
                ctx.ui.log_color(
                    format!("Failed to process case {case_name}: {e}"),
                    "scanner",
                    "red",
                );
            }
        }
    }
    Ok(())
}

/// Yesterday recovery: skip fully uploaded cases, upload-only the staged
/// ones, fully process the rest. Everything it touches gets the recovery
/// label.
async fn scan_yesterday(
    ctx: &ScanContext,
    settings: &ServiceSettings,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let day = DayFolders::yesterday(settings);
    if !day.root.is_dir() {
        ctx.ui.log(
            "Yesterday's folder not found, skipping yesterday processing",
            "scanner",
        );
        return Ok(());
    }
    day.ensure_staging()?;

    let mut processed = 0usize;
    for case_dir in case_folders(&day.root)? {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let Some(case_name) = case_name_of(&case_dir) else {
            continue;
        };
        let staging_case_dir = day.staging.join(case_name.as_str());
        let orthanc_dir = staging_case_dir.join("Orthanc");

        if stager::is_staged(&staging_case_dir) {
            if is_uploaded(ctx, &orthanc_dir).await {
                continue;
            }
            ctx.ui.log(
                format!("Yesterday case '{case_name}' is staged but not uploaded. Uploading now..."),
                "scanner",
            );
            ctx.uploader.upload_folder(
                orthanc_dir,
                case_name,
                vec![CaseLabel::YesterdayRecovery],
            );
            processed += 1;
        } else {
            ctx.ui.log(
                format!("Yesterday case '{case_name}' not staged. Processing and uploading..."),
                "scanner",
            );
            match stage_in_background(ctx, settings, &day, case_dir, &case_name).await {
                Ok(mut staged) => {
                    staged.labels.push(CaseLabel::YesterdayRecovery);
                    ctx.uploader
                        .upload_folder(staged.orthanc_dir, case_name, staged.labels);
                    processed += 1;
                }
                Err(e) => {
                    tracing::error!(case = case_name.as_str(), message = e.to_string());
                    ctx.ui.log_color(
                        format!("Failed to process yesterday case '{case_name}': {e}"),
                        "scanner",
                        "red",
                    );
                }
            }
        }
    }
    if processed > 0 {
        ctx.ui.log(
            format!("Yesterday processing: {processed} case(s) processed"),
            "scanner",
        );
    }
    Ok(())
}

/// Classify and stage on the blocking pool; both are filesystem-bound.
async fn stage_in_background(
    ctx: &ScanContext,
    settings: &ServiceSettings,
    day: &DayFolders,
    case_dir: Utf8PathBuf,
    case_name: &CaseName,
) -> anyhow::Result<StagedCase> {
    let staging_case_dir = day.staging.join(case_name.as_str());
    let institution = settings.institution_name.clone();
    let ui = ctx.ui.clone();
    let case_name = case_name.clone();
    let staged = tokio::task::spawn_blocking(move || {
        let contents = classify_case(&case_dir, &case_name, &staging_case_dir, &ui);
        stage_case(&contents, &case_name, &staging_case_dir, &institution, &ui)
    })
    .await?;
    Ok(staged)
}

/// The case folders directly under a day root, in name order.
fn case_folders(root: &Utf8Path) -> std::io::Result<Vec<Utf8PathBuf>> {
    let mut cases: Vec<Utf8PathBuf> = fs_err::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| Utf8PathBuf::from_path_buf(entry.path()).ok())
        .filter(|path| classifier::is_case_folder(path))
        .collect();
    cases.sort();
    Ok(cases)
}

fn case_name_of(case_dir: &Utf8Path) -> Option<CaseName> {
    case_dir
        .file_name()
        .map(|name| CaseName::from(name.trim().to_string()))
}

/// A staged case counts as uploaded when the PACS already knows the first
/// instance under its Orthanc folder.
async fn is_uploaded(ctx: &ScanContext, orthanc_dir: &Utf8Path) -> bool {
    let Some(first) = first_dicom_under(orthanc_dir) else {
        return false;
    };
    let Ok(dcm) = dicom_meta::read_header(&first) else {
        return false;
    };
    let (Some(sop_uid), Some(series_uid)) = instance_uids(&dcm) else {
        return false;
    };
    ctx.pacs
        .instance_exists(&sop_uid, &series_uid)
        .await
        .unwrap_or(false)
}

fn first_dicom_under(orthanc_dir: &Utf8Path) -> Option<Utf8PathBuf> {
    let mut files: Vec<Utf8PathBuf> = walkdir::WalkDir::new(orthanc_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| Utf8PathBuf::from_path_buf(entry.into_path()).ok())
        .filter(|path| {
            path.extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
                && !path.file_name().is_some_and(|name| name.starts_with('.'))
        })
        .collect();
    files.sort();
    files.into_iter().next()
}
