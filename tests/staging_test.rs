//! End-to-end staging pipeline tests: classify a synthetic case folder,
//! stage it, and inspect the resulting `Orthanc/` tree.
mod util;

use camino::Utf8PathBuf;
use dentsync::{CaseLabel, CaseName, UiLog, classify_case, is_case_folder, stage_case};
use dicom::dictionary_std::{tags, uids};
use pretty_assertions::assert_eq;
use rstest::rstest;
use util::{DicomSpec, dentsync_uid, file_names, tag_str, utf8, write_dicom};

const INSTITUTION: &str = "Test Dental";

struct CaseSandbox {
    _dir: tempfile::TempDir,
    case_dir: Utf8PathBuf,
    staging_dir: Utf8PathBuf,
    case_name: CaseName,
}

impl CaseSandbox {
    fn new(case_name: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let case_dir = utf8(dir.path().join("15-03-2025").join(case_name));
        let staging_dir = utf8(dir.path().join("Staging").join(case_name));
        fs_err::create_dir_all(case_dir.as_path()).unwrap();
        Self {
            _dir: dir,
            case_dir,
            staging_dir,
            case_name: CaseName::from(case_name.to_string()),
        }
    }

    fn run_pipeline(&self) -> dentsync::StagedCase {
        let ui = UiLog::disconnected();
        let contents = classify_case(&self.case_dir, &self.case_name, &self.staging_dir, &ui);
        stage_case(&contents, &self.case_name, &self.staging_dir, INSTITUTION, &ui)
    }

    fn orthanc(&self) -> Utf8PathBuf {
        self.staging_dir.join("Orthanc")
    }

    fn attachments(&self) -> Utf8PathBuf {
        self.staging_dir.join("Attachments")
    }

    fn dicoms(&self) -> Utf8PathBuf {
        self.staging_dir.join("Dicoms")
    }
}

#[test]
fn test_pure_pdf_case() {
    let sandbox = CaseSandbox::new("Jane Doe");
    let source = sandbox.case_dir.join("report.pdf");
    fs_err::write(source.as_path(), b"%PDF-1.4 one kilobyte of report").unwrap();

    let staged = sandbox.run_pipeline();

    // Attachment mirror is byte-identical to the source.
    let mirrored = sandbox.attachments().join("report.pdf");
    assert_eq!(
        fs_err::read(mirrored.as_path()).unwrap(),
        fs_err::read(source.as_path()).unwrap()
    );

    let out = sandbox.orthanc().join("report PDF.dcm");
    assert_eq!(
        tag_str(&out, tags::SOP_CLASS_UID).as_deref(),
        Some(uids::ENCAPSULATED_PDF_STORAGE)
    );
    assert_eq!(tag_str(&out, tags::MODALITY).as_deref(), Some("DOC"));
    assert_eq!(tag_str(&out, tags::PATIENT_NAME).as_deref(), Some("Jane Doe"));
    assert_eq!(
        tag_str(&out, tags::INSTITUTION_NAME).as_deref(),
        Some(INSTITUTION)
    );
    assert_eq!(staged.labels, vec![CaseLabel::Pdf]);
}

#[test]
fn test_romexis_single_frame_copied_verbatim() {
    let sandbox = CaseSandbox::new("Jane Doe");
    let source = sandbox.case_dir.join("ondemand 3d").join("scan.dcm");
    write_dicom(
        &DicomSpec {
            number_of_frames: Some(120),
            romexis: true,
            ..Default::default()
        },
        &source,
    );

    let staged = sandbox.run_pipeline();

    let out = sandbox.orthanc().join("scan DCM .dcm");
    assert_eq!(
        fs_err::read(out.as_path()).unwrap(),
        fs_err::read(source.as_path()).unwrap(),
        "a Romexis-authored volume must be copied byte-verbatim"
    );
    assert_eq!(staged.labels, vec![CaseLabel::ThreeD]);
    // No multi-frame fusion output.
    assert_eq!(file_names(&sandbox.orthanc()), vec!["scan DCM .dcm"]);
}

#[test]
fn test_non_romexis_single_frame_is_stamped() {
    let sandbox = CaseSandbox::new("Jane Doe");
    let source = sandbox.case_dir.join("ondemand 3d").join("scan.dcm");
    write_dicom(
        &DicomSpec {
            number_of_frames: Some(120),
            romexis: false,
            ..Default::default()
        },
        &source,
    );

    let staged = sandbox.run_pipeline();

    let out = sandbox.orthanc().join("scan DCM .dcm");
    let obj = dicom::object::open_file(&out).unwrap();
    assert_eq!(
        obj.meta().implementation_version_name.as_deref(),
        Some("ROMEXIS_10")
    );
    assert_eq!(
        tag_str(&out, tags::INSTITUTION_NAME).as_deref(),
        Some(INSTITUTION)
    );
    assert_eq!(staged.labels, vec![CaseLabel::ThreeD]);
}

#[test]
fn test_multi_file_series_fused_in_instance_order() {
    let sandbox = CaseSandbox::new("John Smith");
    let series_uid = dentsync_uid();
    let study_uid = dentsync_uid();
    // Write slices in shuffled order; fusion must follow InstanceNumber.
    for instance_number in [3, 1, 12, 7, 2, 11, 4, 9, 5, 10, 6, 8] {
        write_dicom(
            &DicomSpec {
                series_uid: series_uid.clone(),
                study_uid: study_uid.clone(),
                instance_number: Some(instance_number),
                pixel_data: vec![instance_number as u8; 8],
                ..Default::default()
            },
            &sandbox
                .case_dir
                .join("ondemand 3d")
                .join(format!("slice{instance_number:02}.dcm")),
        );
    }

    let staged = sandbox.run_pipeline();
    assert_eq!(staged.labels, vec![CaseLabel::ThreeD]);

    let out = sandbox.orthanc().join("John Smith DCM.dcm");
    let obj = dicom::object::open_file(&out).unwrap();
    let frames: i32 = obj
        .element(tags::NUMBER_OF_FRAMES)
        .unwrap()
        .to_int()
        .unwrap();
    assert_eq!(frames, 12);
    assert!(
        obj.element(tags::INSTANCE_NUMBER).is_err(),
        "fusion must clear the single-frame InstanceNumber"
    );

    let pixels = obj.element(tags::PIXEL_DATA).unwrap().to_bytes().unwrap();
    let expected: Vec<u8> = (1..=12u8).flat_map(|n| [n; 8]).collect();
    assert_eq!(pixels.as_ref(), expected.as_slice());
    assert_eq!(
        tag_str(&out, tags::INSTITUTION_NAME).as_deref(),
        Some(INSTITUTION)
    );
}

#[test]
fn test_duplicate_sop_uid_recorded_once() {
    let sandbox = CaseSandbox::new("Jane Doe");
    let sop_uid = dentsync_uid();
    let series_uid = dentsync_uid();
    for name in ["a.dcm", "b.dcm"] {
        write_dicom(
            &DicomSpec {
                sop_uid: sop_uid.clone(),
                series_uid: series_uid.clone(),
                ..Default::default()
            },
            &sandbox.case_dir.join(name),
        );
    }

    let ui = UiLog::disconnected();
    let contents = classify_case(
        &sandbox.case_dir,
        &sandbox.case_name,
        &sandbox.staging_dir,
        &ui,
    );

    let series: Vec<_> = contents.multi_series.values().collect();
    assert_eq!(series.len(), 1);
    assert_eq!(series[0].len(), 1, "the duplicate instance must be dropped");
    // Only the first-seen file is mirrored.
    assert_eq!(file_names(&sandbox.dicoms()), vec!["a.dcm"]);
}

#[test]
fn test_buckets_are_pairwise_disjoint() {
    let sandbox = CaseSandbox::new("Jane Doe");
    fs_err::write(sandbox.case_dir.join("report.pdf"), b"%PDF-1.4 x").unwrap();
    let photo = image::RgbImage::from_pixel(4, 4, image::Rgb([1u8, 2, 3]));
    photo
        .save(sandbox.case_dir.join("photo.png").as_std_path())
        .unwrap();
    write_dicom(
        &DicomSpec {
            modality: "PX",
            ..Default::default()
        },
        &sandbox.case_dir.join("pano.dcm"),
    );
    write_dicom(
        &DicomSpec {
            number_of_frames: Some(120),
            ..Default::default()
        },
        &sandbox.case_dir.join("ondemand 3d").join("volume.dcm"),
    );
    write_dicom(
        &DicomSpec {
            number_of_frames: Some(1),
            ..Default::default()
        },
        &sandbox.case_dir.join("ondemand 3d").join("project.dcm"),
    );
    write_dicom(
        &DicomSpec::default(),
        &sandbox.case_dir.join("ondemand 3d").join("slice.dcm"),
    );

    let ui = UiLog::disconnected();
    let contents = classify_case(
        &sandbox.case_dir,
        &sandbox.case_name,
        &sandbox.staging_dir,
        &ui,
    );

    let mut all: Vec<&Utf8PathBuf> = Vec::new();
    all.extend(&contents.pdf_files);
    all.extend(&contents.image_files);
    all.extend(&contents.single_dicom_files);
    all.extend(&contents.project_files);
    all.extend(&contents.two_d_files);
    all.extend(contents.multi_series.values().flatten());
    let unique: std::collections::HashSet<_> = all.iter().collect();
    assert_eq!(unique.len(), all.len(), "buckets must be pairwise disjoint");
    assert_eq!(all.len(), 6);
    assert_eq!(contents.pdf_files.len(), 1);
    assert_eq!(contents.image_files.len(), 1);
    assert_eq!(contents.two_d_files.len(), 1);
    assert_eq!(contents.single_dicom_files.len(), 1);
    assert_eq!(contents.project_files.len(), 1);
}

#[test]
fn test_staging_runs_are_idempotent() {
    let mut generator = names::Generator::default();
    let case_name = generator.next().unwrap().replace('-', " ");
    let sandbox = CaseSandbox::new(&case_name);
    fs_err::write(sandbox.case_dir.join("report.pdf"), b"%PDF-1.4 y").unwrap();
    let series_uid = dentsync_uid();
    for n in 1..=3 {
        write_dicom(
            &DicomSpec {
                series_uid: series_uid.clone(),
                instance_number: Some(n),
                ..Default::default()
            },
            &sandbox
                .case_dir
                .join("ondemand 3d")
                .join(format!("slice{n}.dcm")),
        );
    }

    let first = sandbox.run_pipeline();
    let snapshot = |dir: &Utf8PathBuf| -> Vec<(String, std::time::SystemTime)> {
        file_names(dir)
            .into_iter()
            .map(|name| {
                let mtime = fs_err::metadata(dir.join(&name))
                    .unwrap()
                    .modified()
                    .unwrap();
                (name, mtime)
            })
            .collect()
    };
    let orthanc_before = snapshot(&sandbox.orthanc());
    let attachments_before = snapshot(&sandbox.attachments());
    assert!(!orthanc_before.is_empty());

    let second = sandbox.run_pipeline();
    assert_eq!(first.labels, second.labels);
    assert_eq!(snapshot(&sandbox.orthanc()), orthanc_before);
    assert_eq!(snapshot(&sandbox.attachments()), attachments_before);
}

#[rstest]
#[case::no_space("JaneDoe", false)]
#[case::excluded_cbct("cbct", false)]
#[case::excluded_cbct_cased("CBCT", false)]
#[case::excluded_new_folder("New Folder", false)]
#[case::plain_case("Jane Doe", true)]
fn test_case_folder_eligibility(#[case] name: &str, #[case] eligible: bool) {
    let dir = tempfile::tempdir().unwrap();
    let case_dir = utf8(dir.path().join(name));
    fs_err::create_dir_all(case_dir.as_path()).unwrap();
    fs_err::write(case_dir.join("report.pdf"), b"%PDF").unwrap();
    assert_eq!(is_case_folder(&case_dir), eligible);
}

#[test]
fn test_empty_folder_is_not_a_case() {
    let dir = tempfile::tempdir().unwrap();
    let case_dir = utf8(dir.path().join("Jane Doe"));
    fs_err::create_dir_all(case_dir.as_path()).unwrap();
    assert!(!is_case_folder(&case_dir));
}

#[test]
fn test_viewer_folders_excluded_from_attachment_walk() {
    let sandbox = CaseSandbox::new("Jane Doe");
    // A stray PDF inside the viewer folder must not become an attachment.
    let hidden = sandbox
        .case_dir
        .join("Planmeca Romexis")
        .join("manual.pdf");
    fs_err::create_dir_all(hidden.parent().unwrap()).unwrap();
    fs_err::write(hidden.as_path(), b"%PDF-1.4 viewer manual").unwrap();
    fs_err::write(sandbox.case_dir.join("report.pdf"), b"%PDF-1.4 real").unwrap();

    let ui = UiLog::disconnected();
    let contents = classify_case(
        &sandbox.case_dir,
        &sandbox.case_name,
        &sandbox.staging_dir,
        &ui,
    );
    assert_eq!(contents.pdf_files.len(), 1);
    assert!(contents.pdf_files[0].ends_with("report.pdf"));
}
