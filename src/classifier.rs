//! Walks a case folder and partitions its contents into semantic buckets.
//!
//! A case is walked twice: once for PDF/raster attachments (pruning the
//! vendor viewer folders), once for DICOM instances (descending everywhere,
//! because the 3D instances live inside the `OnDemand 3D` subtree). Both
//! walks mirror what they accept into the staging tree as they go.
use crate::dicom_meta::{
    self, StudyInfo, instance_uids, int_value, is_romexis_authored, trimmed_string,
};
use crate::log_sink::UiLog;
use crate::types::CaseName;
use camino::{Utf8Path, Utf8PathBuf};
use dicom::dictionary_std::tags;
use std::collections::{BTreeMap, HashSet};
use walkdir::WalkDir;

/// Folder names that are never cases.
const EXCLUDED_NAMES: [&str; 2] = ["cbct", "new folder"];
/// Vendor viewer folders: skipped by the attachment walk, required by the
/// DICOM walk.
const VIEWER_FOLDERS: [&str; 2] = ["planmeca romexis", "ondemand 3d"];
const ONDEMAND_FOLDER: &str = "ondemand 3d";

const PDF_EXTENSIONS: [&str; 1] = ["pdf"];
const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "tif", "tiff"];

/// The partitioned contents of one case folder.
#[derive(Debug, Default)]
pub struct CaseContents {
    pub pdf_files: Vec<Utf8PathBuf>,
    pub image_files: Vec<Utf8PathBuf>,
    /// Multi-frame CT volumes from the OnDemand 3D subtree.
    pub single_dicom_files: Vec<Utf8PathBuf>,
    /// Single-frame OnDemand 3D "project" instances.
    pub project_files: Vec<Utf8PathBuf>,
    /// Frameless non-CT instances (panoramics and other 2D captures).
    pub two_d_files: Vec<Utf8PathBuf>,
    /// Frameless CT instances grouped by series: CBCT exports spread one
    /// volume over hundreds of files.
    pub multi_series: BTreeMap<String, Vec<Utf8PathBuf>>,
    /// Identifying tags of the first DICOM seen, if any.
    pub study_info: Option<StudyInfo>,
    /// Whether any instance was authored by Planmeca Romexis.
    pub romexis: bool,
}

impl CaseContents {
    /// The series with the most files, used for multi-frame fusion.
    pub fn largest_series(&self) -> Option<&[Utf8PathBuf]> {
        self.multi_series
            .values()
            .max_by_key(|files| files.len())
            .map(|files| files.as_slice())
    }
}

/// Whether a directory entry under a day root qualifies as a case folder:
/// its trimmed name contains a space, is not an excluded vendor name, and
/// the directory has contents.
pub fn is_case_folder(dir: &Utf8Path) -> bool {
    if !dir.is_dir() {
        return false;
    }
    let Some(name) = dir.file_name() else {
        return false;
    };
    let trimmed = name.trim();
    if !trimmed.contains(' ') {
        return false;
    }
    if EXCLUDED_NAMES.contains(&trimmed.to_lowercase().as_str()) {
        return false;
    }
    fs_err::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Classify a case folder, mirroring attachments into
/// `<staging_case>/Attachments/` and DICOMs into `<staging_case>/Dicoms/`.
///
/// Per-file failures are logged and skipped; a case is never aborted on a
/// single bad file.
pub fn classify_case(
    case_dir: &Utf8Path,
    case_name: &CaseName,
    staging_case_dir: &Utf8Path,
    ui: &UiLog,
) -> CaseContents {
    let mut contents = CaseContents::default();
    let attachments_dir = staging_case_dir.join("Attachments");
    let dicoms_dir = staging_case_dir.join("Dicoms");
    for dir in [&attachments_dir, &dicoms_dir] {
        if let Err(e) = fs_err::create_dir_all(dir.as_path()) {
            tracing::error!(dir = dir.as_str(), message = e.to_string());
            ui.log(
                format!("Failed to create staging folder {dir}: {e}"),
                "scanner",
            );
            return contents;
        }
    }

    walk_attachments(case_dir, case_name, &attachments_dir, &mut contents, ui);
    walk_dicoms(case_dir, case_name, &dicoms_dir, &mut contents, ui);
    contents
}

fn walk_attachments(
    case_dir: &Utf8Path,
    case_name: &CaseName,
    attachments_dir: &Utf8Path,
    contents: &mut CaseContents,
    ui: &UiLog,
) {
    let walk = WalkDir::new(case_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !(e.file_type().is_dir() && is_viewer_folder(e.file_name())));
    for entry in walk {
        let Some(path) = file_entry_path(entry, case_name, ui) else {
            continue;
        };
        let Some(extension) = path.extension().map(|e| e.to_lowercase()) else {
            continue;
        };
        let bucket = if PDF_EXTENSIONS.contains(&extension.as_str()) {
            &mut contents.pdf_files
        } else if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
            &mut contents.image_files
        } else {
            continue;
        };
        bucket.push(path.clone());
        if let Err(e) = copy_unless_same_size(&path, &attachments_dir.join(path_file_name(&path))) {
            ui.log(
                format!(
                    "Failed to copy attachment {} for case {case_name}: {e}",
                    path_file_name(&path)
                ),
                "scanner",
            );
        }
    }
}

fn walk_dicoms(
    case_dir: &Utf8Path,
    case_name: &CaseName,
    dicoms_dir: &Utf8Path,
    contents: &mut CaseContents,
    ui: &UiLog,
) {
    let mut sop_seen: HashSet<String> = HashSet::new();
    for entry in WalkDir::new(case_dir).sort_by_file_name() {
        let Some(path) = file_entry_path(entry, case_name, ui) else {
            continue;
        };
        if !dicom_meta::looks_like_dicom(&path) {
            continue;
        }
        let dcm = match dicom_meta::read_header(&path) {
            Ok(dcm) => dcm,
            Err(e) => {
                tracing::warn!(path = path.as_str(), message = e.to_string());
                ui.log(
                    format!("Invalid DICOM file {}, skipping: {e}", path_file_name(&path)),
                    "scanner",
                );
                continue;
            }
        };

        if !contents.romexis && is_romexis_authored(&dcm) {
            contents.romexis = true;
        }
        if contents.study_info.is_none() {
            contents.study_info = Some(StudyInfo::from_dicom(&dcm));
        }

        let (sop_uid, series_uid) = instance_uids(&dcm);
        if let Some(sop_uid) = &sop_uid {
            if !sop_seen.insert(sop_uid.to_string()) {
                // Duplicate instance elsewhere in the tree.
                continue;
            }
        }

        if let Err(e) = copy_unless_same_size(&path, &dicoms_dir.join(path_file_name(&path))) {
            ui.log(
                format!(
                    "Failed to copy DICOM file {} for case {case_name}: {e}",
                    path_file_name(&path)
                ),
                "scanner",
            );
        }

        let number_of_frames = int_value(&dcm, tags::NUMBER_OF_FRAMES);
        let is_ct = trimmed_string(&dcm, tags::MODALITY)
            .is_some_and(|m| m.eq_ignore_ascii_case("CT"));
        let from_ondemand = is_under_ondemand(case_dir, &path);

        match number_of_frames {
            Some(frames) if frames > 1 => {
                if is_ct && from_ondemand {
                    contents.single_dicom_files.push(path);
                }
            }
            Some(_) => {
                if is_ct && from_ondemand {
                    contents.project_files.push(path);
                }
            }
            // Absent modality is defensively treated as "not CT".
            None if !is_ct => contents.two_d_files.push(path),
            None => {
                let key = series_uid
                    .map(|uid| uid.to_string())
                    .unwrap_or_else(|| format!("unknown-{case_name}"));
                contents.multi_series.entry(key).or_default().push(path);
            }
        }
    }
}

fn is_viewer_folder(name: &std::ffi::OsStr) -> bool {
    name.to_str()
        .is_some_and(|n| VIEWER_FOLDERS.contains(&n.trim().to_lowercase().as_str()))
}

/// Whether the file sits below an `OnDemand 3D` directory inside the case.
fn is_under_ondemand(case_dir: &Utf8Path, path: &Utf8Path) -> bool {
    path.parent()
        .and_then(|parent| parent.strip_prefix(case_dir).ok())
        .map(|rel| rel.as_str().to_lowercase().contains(ONDEMAND_FOLDER))
        .unwrap_or(false)
}

/// Unwrap a walk entry into a UTF-8 file path, logging and dropping
/// everything else (walk errors, directories, non-UTF-8 names).
fn file_entry_path(
    entry: walkdir::Result<walkdir::DirEntry>,
    case_name: &CaseName,
    ui: &UiLog,
) -> Option<Utf8PathBuf> {
    let entry = match entry {
        Ok(entry) => entry,
        Err(e) => {
            tracing::warn!(case = case_name.as_str(), message = e.to_string());
            ui.log(
                format!("Error while scanning case {case_name}: {e}"),
                "scanner",
            );
            return None;
        }
    };
    if !entry.file_type().is_file() {
        return None;
    }
    match Utf8PathBuf::from_path_buf(entry.into_path()) {
        Ok(path) => Some(path),
        Err(path) => {
            tracing::warn!(case = case_name.as_str(), path = %path.display(), "non-UTF-8 path skipped");
            None
        }
    }
}

fn path_file_name(path: &Utf8Path) -> &str {
    path.file_name().unwrap_or(path.as_str())
}

/// Copy `src` to `dst` unless a file of the same size is already there.
fn copy_unless_same_size(src: &Utf8Path, dst: &Utf8Path) -> std::io::Result<bool> {
    if let (Ok(dst_meta), Ok(src_meta)) = (fs_err::metadata(dst), fs_err::metadata(src)) {
        if dst_meta.len() == src_meta.len() {
            return Ok(false);
        }
    }
    fs_err::copy(src, dst)?;
    Ok(true)
}
