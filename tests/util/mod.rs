//! Helpers for building case folders full of synthetic DICOM files.
use camino::{Utf8Path, Utf8PathBuf};
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};

pub struct DicomSpec {
    pub sop_uid: String,
    pub series_uid: String,
    pub study_uid: String,
    pub modality: &'static str,
    pub number_of_frames: Option<i32>,
    pub instance_number: Option<i32>,
    pub patient_name: &'static str,
    pub pixel_data: Vec<u8>,
    pub romexis: bool,
}

impl Default for DicomSpec {
    fn default() -> Self {
        Self {
            sop_uid: dentsync_uid(),
            series_uid: dentsync_uid(),
            study_uid: dentsync_uid(),
            modality: "CT",
            number_of_frames: None,
            instance_number: None,
            patient_name: "Doe^Jane",
            pixel_data: vec![0u8; 16],
            romexis: false,
        }
    }
}

/// Write a synthetic DICOM file described by `spec`.
pub fn write_dicom(spec: &DicomSpec, path: &Utf8Path) {
    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent).unwrap();
    }
    let mut obj = InMemDicomObject::new_empty();
    obj.put_str(tags::SOP_CLASS_UID, VR::UI, uids::CT_IMAGE_STORAGE);
    obj.put_str(tags::SOP_INSTANCE_UID, VR::UI, spec.sop_uid.as_str());
    obj.put_str(tags::SERIES_INSTANCE_UID, VR::UI, spec.series_uid.as_str());
    obj.put_str(tags::STUDY_INSTANCE_UID, VR::UI, spec.study_uid.as_str());
    obj.put_str(tags::MODALITY, VR::CS, spec.modality);
    obj.put_str(tags::PATIENT_NAME, VR::PN, spec.patient_name);
    obj.put_str(tags::PATIENT_ID, VR::LO, "1234");
    obj.put_str(tags::STUDY_DATE, VR::DA, "20250315");
    if let Some(frames) = spec.number_of_frames {
        obj.put_str(tags::NUMBER_OF_FRAMES, VR::IS, frames.to_string());
    }
    if let Some(number) = spec.instance_number {
        obj.put_str(tags::INSTANCE_NUMBER, VR::IS, number.to_string());
    }
    obj.put(DataElement::new(
        tags::PIXEL_DATA,
        VR::OW,
        PrimitiveValue::U8(spec.pixel_data.clone().into()),
    ));

    let mut meta = FileMetaTableBuilder::new()
        .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
        .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
        .media_storage_sop_instance_uid(spec.sop_uid.as_str());
    if spec.romexis {
        meta = meta.implementation_version_name("ROMEXIS_10");
    }
    obj.with_exact_meta(meta.build().unwrap())
        .write_to_file(path)
        .unwrap();
}

/// A `2.25.`-rooted UID, distinct per call.
pub fn dentsync_uid() -> String {
    format!("2.25.{}", ulid::Ulid::new().0)
}

/// Trimmed string value of a tag in a written DICOM file.
pub fn tag_str(path: &Utf8Path, tag: dicom::core::Tag) -> Option<String> {
    let obj = dicom::object::open_file(path).unwrap();
    obj.element(tag)
        .ok()
        .and_then(|e| {
            e.string()
                .map(|s| s.trim_matches(|c: char| c == '\0' || c.is_whitespace()).to_string())
                .ok()
        })
}

/// Sorted file names directly inside a directory.
pub fn file_names(dir: &Utf8Path) -> Vec<String> {
    let mut names: Vec<String> = match fs_err::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

pub fn utf8(path: std::path::PathBuf) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path).unwrap()
}
