//! Header-only access to DICOM files.
//!
//! Everything here reads at most the non-pixel portion of a file. Absent tags
//! map to [None], never to an error.
use crate::types::{SeriesInstanceUid, SopInstanceUid, StudyInstanceUid};
use camino::Utf8Path;
use dicom::dictionary_std::tags;
use dicom::object::{DefaultDicomObject, OpenFileOptions, Tag};
use std::io::Read;

/// Cheap probe for the `DICM` magic at offset 128, without parsing anything.
pub fn looks_like_dicom(path: &Utf8Path) -> bool {
    let mut preamble = [0u8; 132];
    match fs_err::File::open(path) {
        Ok(mut f) => f.read_exact(&mut preamble).is_ok() && &preamble[128..] == b"DICM",
        Err(_) => false,
    }
}

/// Read a DICOM file's metadata, stopping before the pixel data.
pub fn read_header(path: &Utf8Path) -> Result<DefaultDicomObject, dicom::object::ReadError> {
    OpenFileOptions::new()
        .read_until(tags::PIXEL_DATA)
        .open_file(path)
}

/// Trimmed string value of a tag, if present and readable.
pub fn trimmed_str(dcm: &DefaultDicomObject, tag: Tag) -> Option<&str> {
    dcm.element(tag)
        .ok()
        .and_then(|e| e.string().map(|s| s.trim()).ok())
}

/// Owned variant of [trimmed_str].
pub fn trimmed_string(dcm: &DefaultDicomObject, tag: Tag) -> Option<String> {
    trimmed_str(dcm, tag).map(|s| s.to_string())
}

/// Integer value of a tag, if present and numeric.
pub fn int_value(dcm: &DefaultDicomObject, tag: Tag) -> Option<i32> {
    dcm.element(tag).ok().and_then(|e| e.to_int::<i32>().ok())
}

/// SOP and series UIDs of an instance, read from the dataset.
pub fn instance_uids(
    dcm: &DefaultDicomObject,
) -> (Option<SopInstanceUid>, Option<SeriesInstanceUid>) {
    (
        trimmed_string(dcm, tags::SOP_INSTANCE_UID).map(SopInstanceUid::from),
        trimmed_string(dcm, tags::SERIES_INSTANCE_UID).map(SeriesInstanceUid::from),
    )
}

/// Whether the file meta marks this instance as Romexis-authored.
pub fn is_romexis_authored(dcm: &DefaultDicomObject) -> bool {
    dcm.meta()
        .implementation_version_name
        .as_deref()
        .is_some_and(|v| v.to_uppercase().contains("ROMEXIS"))
}

/// A fresh `2.25.`-rooted UID from 128 bits of ULID randomness.
pub fn new_uid() -> String {
    format!("2.25.{}", ulid::Ulid::new().0)
}

/// The study-identifying tags of the first DICOM seen in a case. Copied onto
/// every instance the transformer emits.
#[derive(Debug, Clone, Default)]
pub struct StudyInfo {
    pub study_uid: Option<StudyInstanceUid>,
    pub patient_name: Option<String>,
    pub patient_id: Option<String>,
    pub patient_birth_date: Option<String>,
    pub patient_sex: Option<String>,
    pub study_date: Option<String>,
    pub study_time: Option<String>,
    pub accession_number: Option<String>,
    pub study_description: Option<String>,
}

impl StudyInfo {
    pub fn from_dicom(dcm: &DefaultDicomObject) -> Self {
        Self {
            study_uid: trimmed_string(dcm, tags::STUDY_INSTANCE_UID).map(StudyInstanceUid::from),
            patient_name: trimmed_string(dcm, tags::PATIENT_NAME),
            patient_id: trimmed_string(dcm, tags::PATIENT_ID),
            patient_birth_date: trimmed_string(dcm, tags::PATIENT_BIRTH_DATE),
            patient_sex: trimmed_string(dcm, tags::PATIENT_SEX),
            study_date: trimmed_string(dcm, tags::STUDY_DATE),
            study_time: trimmed_string(dcm, tags::STUDY_TIME),
            accession_number: trimmed_string(dcm, tags::ACCESSION_NUMBER),
            study_description: trimmed_string(dcm, tags::STUDY_DESCRIPTION),
        }
    }
}
