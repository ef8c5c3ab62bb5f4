//! Builds the normalized DICOM instances that land in `Orthanc/`.
//!
//! Every emitted file is Explicit VR Little Endian with `InstitutionName`
//! taken from configuration. Study-identifying tags are copied from the
//! case's [StudyInfo] when present.
use crate::dicom_meta::{StudyInfo, int_value, new_uid};
use crate::error::StageError;
use crate::types::CaseName;
use camino::{Utf8Path, Utf8PathBuf};
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::{DefaultDicomObject, FileMetaTableBuilder, InMemDicomObject, open_file};
use time::OffsetDateTime;
use time::macros::format_description;

/// `ImplementationVersionName` accepted by the downstream PACS for 3D volumes.
pub const ROMEXIS_VERSION_NAME: &str = "ROMEXIS_10";

/// Encapsulate a PDF report as an EncapsulatedPDFStorage instance.
pub fn encapsulated_pdf(
    pdf_path: &Utf8Path,
    case_name: &CaseName,
    study: &StudyInfo,
    institution: &str,
) -> Result<DefaultDicomObject, StageError> {
    let pdf_bytes = fs_err::read(pdf_path)?;
    let pdf_len = pdf_bytes.len() as u32;

    // A raster/PDF input never carries its own SOP UID; mint one per instance
    // so a case with several attachments emits pairwise-distinct objects.
    let sop_uid = new_uid();
    let mut obj = InMemDicomObject::new_empty();
    obj.put_str(tags::SOP_CLASS_UID, VR::UI, uids::ENCAPSULATED_PDF_STORAGE);
    obj.put_str(tags::SOP_INSTANCE_UID, VR::UI, sop_uid.as_str());
    obj.put_str(tags::SERIES_INSTANCE_UID, VR::UI, new_uid());
    obj.put_str(tags::MODALITY, VR::CS, "DOC");
    obj.put_str(tags::SERIES_NUMBER, VR::IS, "1");
    obj.put_str(tags::INSTANCE_NUMBER, VR::IS, "1");
    obj.put_str(
        tags::MIME_TYPE_OF_ENCAPSULATED_DOCUMENT,
        VR::LO,
        "application/pdf",
    );
    obj.put(DataElement::new(
        tags::ENCAPSULATED_DOCUMENT,
        VR::OB,
        PrimitiveValue::U8(even_padded(pdf_bytes).into()),
    ));
    obj.put(DataElement::new(
        tags::ENCAPSULATED_DOCUMENT_LENGTH,
        VR::UL,
        dicom_value!(U32, [pdf_len]),
    ));
    put_content_timestamp(&mut obj);
    put_study_tags(&mut obj, study, case_name, institution);

    let file_meta = FileMetaTableBuilder::new()
        .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
        .media_storage_sop_class_uid(uids::ENCAPSULATED_PDF_STORAGE)
        .media_storage_sop_instance_uid(sop_uid)
        .build()?;
    Ok(obj.with_exact_meta(file_meta))
}

/// Convert a raster image into a 24-bit RGB SecondaryCapture instance.
pub fn secondary_capture(
    image_path: &Utf8Path,
    case_name: &CaseName,
    study: &StudyInfo,
    institution: &str,
) -> Result<DefaultDicomObject, StageError> {
    let image = image::open(image_path.as_std_path())?.to_rgb8();
    let (columns, rows) = image.dimensions();
    let pixel_bytes = image.into_raw();

    let sop_uid = new_uid();
    let mut obj = InMemDicomObject::new_empty();
    obj.put_str(
        tags::SOP_CLASS_UID,
        VR::UI,
        uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
    );
    obj.put_str(tags::SOP_INSTANCE_UID, VR::UI, sop_uid.as_str());
    obj.put_str(tags::SERIES_INSTANCE_UID, VR::UI, new_uid());
    obj.put_str(tags::MODALITY, VR::CS, "SC");
    obj.put_str(tags::SERIES_NUMBER, VR::IS, "1");
    obj.put_str(tags::INSTANCE_NUMBER, VR::IS, "1");
    put_content_timestamp(&mut obj);
    put_study_tags(&mut obj, study, case_name, institution);

    obj.put(DataElement::new(
        tags::SAMPLES_PER_PIXEL,
        VR::US,
        dicom_value!(U16, [3]),
    ));
    obj.put_str(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "RGB");
    obj.put(DataElement::new(
        tags::PLANAR_CONFIGURATION,
        VR::US,
        dicom_value!(U16, [0]),
    ));
    obj.put(DataElement::new(
        tags::ROWS,
        VR::US,
        dicom_value!(U16, [rows as u16]),
    ));
    obj.put(DataElement::new(
        tags::COLUMNS,
        VR::US,
        dicom_value!(U16, [columns as u16]),
    ));
    obj.put(DataElement::new(
        tags::BITS_ALLOCATED,
        VR::US,
        dicom_value!(U16, [8]),
    ));
    obj.put(DataElement::new(
        tags::BITS_STORED,
        VR::US,
        dicom_value!(U16, [8]),
    ));
    obj.put(DataElement::new(
        tags::HIGH_BIT,
        VR::US,
        dicom_value!(U16, [7]),
    ));
    obj.put(DataElement::new(
        tags::PIXEL_REPRESENTATION,
        VR::US,
        dicom_value!(U16, [0]),
    ));
    obj.put(DataElement::new(
        tags::PIXEL_DATA,
        VR::OB,
        PrimitiveValue::U8(even_padded(pixel_bytes).into()),
    ));

    let file_meta = FileMetaTableBuilder::new()
        .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
        .media_storage_sop_class_uid(uids::SECONDARY_CAPTURE_IMAGE_STORAGE)
        .media_storage_sop_instance_uid(sop_uid)
        .build()?;
    Ok(obj.with_exact_meta(file_meta))
}

/// Fuse the single-frame files of one series into a single multi-frame
/// instance, stacking pixel data in `InstanceNumber` order.
pub fn fuse_series(
    dicom_paths: &[Utf8PathBuf],
    institution: &str,
) -> Result<DefaultDicomObject, StageError> {
    if dicom_paths.is_empty() {
        return Err(StageError::EmptySeries);
    }
    let mut datasets = dicom_paths
        .iter()
        .map(open_file)
        .collect::<Result<Vec<_>, _>>()?;
    // Absent InstanceNumber sorts first, like an instance number of zero.
    datasets.sort_by_key(|ds| int_value(ds, tags::INSTANCE_NUMBER).unwrap_or(0));

    let mut stacked: Vec<u8> = Vec::new();
    for ds in &datasets {
        let pixels = ds.element(tags::PIXEL_DATA)?.to_bytes().map_err(|_| {
            StageError::InvalidValue(tags::PIXEL_DATA)
        })?;
        stacked.extend_from_slice(&pixels);
    }

    let first = datasets.swap_remove(0);
    let pixel_vr = first.element(tags::PIXEL_DATA)?.header().vr();
    let sop_class = first.meta().media_storage_sop_class_uid.clone();
    let mut fused = first.into_inner();

    let new_sop_uid = new_uid();
    fused.put_str(tags::SOP_INSTANCE_UID, VR::UI, new_sop_uid.as_str());
    fused.put_str(
        tags::NUMBER_OF_FRAMES,
        VR::IS,
        dicom_paths.len().to_string(),
    );
    fused.put(DataElement::new(
        tags::PIXEL_DATA,
        pixel_vr,
        PrimitiveValue::U8(even_padded(stacked).into()),
    ));
    fused.put_str(tags::INSTITUTION_NAME, VR::LO, institution);
    fused.remove_element(tags::INSTANCE_NUMBER);
    fused.remove_element(tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE);

    let file_meta = FileMetaTableBuilder::new()
        .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
        .media_storage_sop_class_uid(sop_class.trim_end_matches('\0'))
        .media_storage_sop_instance_uid(new_sop_uid)
        .build()?;
    Ok(fused.with_exact_meta(file_meta))
}

/// Re-save a DICOM file with `InstitutionName` set, optionally stamping the
/// Romexis implementation version into the file meta.
pub fn resave_with_institution(
    src: &Utf8Path,
    dst: &Utf8Path,
    institution: &str,
    stamp_romexis: bool,
) -> Result<(), StageError> {
    let dcm = open_file(src)?;
    let meta = dcm.meta();
    let transfer_syntax = meta.transfer_syntax.trim_end_matches('\0').to_string();
    let sop_class = meta
        .media_storage_sop_class_uid
        .trim_end_matches('\0')
        .to_string();
    let sop_instance = meta
        .media_storage_sop_instance_uid
        .trim_end_matches('\0')
        .to_string();

    let mut builder = FileMetaTableBuilder::new()
        .transfer_syntax(transfer_syntax)
        .media_storage_sop_class_uid(sop_class)
        .media_storage_sop_instance_uid(sop_instance);
    if stamp_romexis {
        builder = builder.implementation_version_name(ROMEXIS_VERSION_NAME);
    }

    let file_meta = builder.build()?;
    let mut ds = dcm.into_inner();
    ds.put_str(tags::INSTITUTION_NAME, VR::LO, institution);
    let file_obj = ds.with_exact_meta(file_meta);
    file_obj.write_to_file(dst)?;
    Ok(())
}

fn put_content_timestamp(obj: &mut InMemDicomObject) {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let date = now
        .format(format_description!("[year][month][day]"))
        .expect("date format descriptions are statically valid");
    let time = now
        .format(format_description!("[hour][minute][second]"))
        .expect("date format descriptions are statically valid");
    obj.put_str(tags::CONTENT_DATE, VR::DA, date);
    obj.put_str(tags::CONTENT_TIME, VR::TM, time);
}

/// Copy the study-identifying tags, falling back to the case name for the
/// patient name and to fresh UIDs where the case had none.
fn put_study_tags(
    obj: &mut InMemDicomObject,
    study: &StudyInfo,
    case_name: &CaseName,
    institution: &str,
) {
    let study_uid = study
        .study_uid
        .as_ref()
        .map(|uid| uid.to_string())
        .unwrap_or_else(new_uid);
    let patient_name = study
        .patient_name
        .as_deref()
        .filter(|name| !name.is_empty())
        .unwrap_or(case_name.as_str());
    obj.put_str(tags::STUDY_INSTANCE_UID, VR::UI, study_uid);
    obj.put_str(tags::PATIENT_NAME, VR::PN, patient_name);
    obj.put_str(
        tags::PATIENT_ID,
        VR::LO,
        study.patient_id.as_deref().unwrap_or_default(),
    );
    obj.put_str(
        tags::PATIENT_BIRTH_DATE,
        VR::DA,
        study.patient_birth_date.as_deref().unwrap_or_default(),
    );
    obj.put_str(
        tags::PATIENT_SEX,
        VR::CS,
        study.patient_sex.as_deref().unwrap_or_default(),
    );
    obj.put_str(
        tags::STUDY_DATE,
        VR::DA,
        study.study_date.as_deref().unwrap_or_default(),
    );
    obj.put_str(
        tags::STUDY_TIME,
        VR::TM,
        study.study_time.as_deref().unwrap_or_default(),
    );
    obj.put_str(
        tags::ACCESSION_NUMBER,
        VR::SH,
        study.accession_number.as_deref().unwrap_or_default(),
    );
    obj.put_str(
        tags::STUDY_DESCRIPTION,
        VR::LO,
        study.study_description.as_deref().unwrap_or_default(),
    );
    obj.put_str(tags::INSTITUTION_NAME, VR::LO, institution);
}

/// DICOM element values must have even length.
fn even_padded(mut bytes: Vec<u8>) -> Vec<u8> {
    if bytes.len() % 2 != 0 {
        bytes.push(0);
    }
    bytes
}
