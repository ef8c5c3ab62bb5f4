//! Materializes the PACS-ready `Orthanc/` directory for a case.
//!
//! Every rule is idempotent: an output file that already exists is left
//! alone, so re-scanning an unchanged case performs no writes.
use crate::classifier::CaseContents;
use crate::dicom_meta::new_uid;
use crate::log_sink::UiLog;
use crate::transform;
use crate::types::{CaseLabel, CaseName, StudyInstanceUid};
use camino::{Utf8Path, Utf8PathBuf};

/// Where the uploader reads from, and which labels it should apply.
#[derive(Debug)]
pub struct StagedCase {
    pub orthanc_dir: Utf8PathBuf,
    pub labels: Vec<CaseLabel>,
}

/// Apply the staging rules to classified case contents.
pub fn stage_case(
    contents: &CaseContents,
    case_name: &CaseName,
    staging_case_dir: &Utf8Path,
    institution: &str,
    ui: &UiLog,
) -> StagedCase {
    let orthanc_dir = staging_case_dir.join("Orthanc");
    let mut labels = Vec::new();
    if let Err(e) = fs_err::create_dir_all(orthanc_dir.as_path()) {
        tracing::error!(dir = orthanc_dir.as_str(), message = e.to_string());
        ui.log(
            format!("Failed to create Orthanc staging for case {case_name}: {e}"),
            "stager",
        );
        return StagedCase {
            orthanc_dir,
            labels,
        };
    }

    if !contents.single_dicom_files.is_empty() {
        labels.push(CaseLabel::ThreeD);
        for src in &contents.single_dicom_files {
            let dst = orthanc_dir.join(renamed(src, "DCM"));
            if dst.exists() {
                continue;
            }
            let result = if contents.romexis {
                // Already PACS-acceptable; keep the original bytes.
                fs_err::copy(src.as_path(), dst.as_path()).map(|_| ()).map_err(Into::into)
            } else {
                transform::resave_with_institution(src, &dst, institution, true)
            };
            if let Err(e) = result {
                stage_failure(ui, case_name, src, &e);
            }
        }
    } else if let Some(series) = contents.largest_series() {
        labels.push(CaseLabel::ThreeD);
        let dst = orthanc_dir.join(format!("{case_name} DCM.dcm"));
        if !dst.exists() {
            match transform::fuse_series(series, institution)
                .and_then(|obj| obj.write_to_file(&dst).map_err(Into::into))
            {
                Ok(()) => ui.log(
                    format!(
                        "Fused {} slice(s) into a multi-frame volume for case {case_name}",
                        series.len()
                    ),
                    "stager",
                ),
                Err(e) => {
                    tracing::error!(case = case_name.as_str(), message = e.to_string());
                    ui.log_color(
                        format!("Multi-frame conversion error for case {case_name}: {e}"),
                        "stager",
                        "red",
                    );
                }
            }
        }
    }

    if !contents.project_files.is_empty() {
        labels.push(CaseLabel::OnDemandProject);
        for src in &contents.project_files {
            let dst = orthanc_dir.join(renamed(src, "DCM"));
            if dst.exists() {
                continue;
            }
            if let Err(e) = transform::resave_with_institution(src, &dst, institution, false) {
                stage_failure(ui, case_name, src, &e);
            }
        }
    }

    if !contents.two_d_files.is_empty() {
        labels.push(CaseLabel::TwoD);
        for src in &contents.two_d_files {
            let dst = orthanc_dir.join(renamed(src, "DCM"));
            if dst.exists() {
                continue;
            }
            if let Err(e) = transform::resave_with_institution(src, &dst, institution, false) {
                stage_failure(ui, case_name, src, &e);
            }
        }
    }

    if !contents.pdf_files.is_empty() || !contents.image_files.is_empty() {
        // One study for every attachment-derived instance of the case.
        let mut study = contents.study_info.clone().unwrap_or_default();
        if study.study_uid.is_none() {
            study.study_uid = Some(StudyInstanceUid::from(new_uid()));
        }

        if !contents.pdf_files.is_empty() {
            labels.push(CaseLabel::Pdf);
            for src in &contents.pdf_files {
                let dst = orthanc_dir.join(format!("{} PDF.dcm", stem_of(src)));
                if dst.exists() {
                    continue;
                }
                match transform::encapsulated_pdf(src, case_name, &study, institution)
                    .and_then(|obj| obj.write_to_file(&dst).map_err(Into::into))
                {
                    Ok(()) => ui.log(
                        format!(
                            "Created PDF DICOM for {} in Orthanc staging for case {case_name}",
                            path_file_name(src)
                        ),
                        "stager",
                    ),
                    Err(e) => stage_failure(ui, case_name, src, &e),
                }
            }
        }

        if !contents.image_files.is_empty() {
            labels.push(CaseLabel::Image);
            for src in &contents.image_files {
                let dst = orthanc_dir.join(format!("{} IMG.dcm", stem_of(src)));
                if dst.exists() {
                    continue;
                }
                if let Err(e) = transform::secondary_capture(src, case_name, &study, institution)
                    .and_then(|obj| obj.write_to_file(&dst).map_err(Into::into))
                {
                    stage_failure(ui, case_name, src, &e);
                }
            }
        }
    }

    StagedCase {
        orthanc_dir,
        labels,
    }
}

/// Whether a staged case already has uploadable output.
pub fn is_staged(staging_case_dir: &Utf8Path) -> bool {
    let orthanc_dir = staging_case_dir.join("Orthanc");
    fs_err::read_dir(orthanc_dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// `scan.dcm` becomes `scan DCM .dcm`; an extensionless `scan` becomes
/// `scan DCM .dcm` as well. The odd spacing is load-bearing: the PACS-side
/// tooling matches these names.
fn renamed(path: &Utf8Path, infix: &str) -> String {
    let extension = path
        .extension()
        .map(|e| format!(".{e}"))
        .unwrap_or_else(|| ".dcm".to_string());
    format!("{} {infix} {extension}", stem_of(path))
}

fn stem_of(path: &Utf8Path) -> &str {
    path.file_stem().unwrap_or(path.as_str())
}

fn path_file_name(path: &Utf8Path) -> &str {
    path.file_name().unwrap_or(path.as_str())
}

fn stage_failure(ui: &UiLog, case_name: &CaseName, src: &Utf8Path, error: &crate::error::StageError) {
    tracing::error!(
        case = case_name.as_str(),
        path = src.as_str(),
        message = error.to_string()
    );
    ui.log_color(
        format!(
            "Failed to stage {} for case {case_name}: {error}",
            path_file_name(src)
        ),
        "stager",
        "red",
    );
}
