use dicom::core::{DataDictionary, Tag};
use dicom::dictionary_std::StandardDataDictionary;

/// Error producing a normalized DICOM instance for the Orthanc staging folder.
#[derive(thiserror::Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Read(#[from] dicom::object::ReadError),

    #[error(transparent)]
    Write(#[from] dicom::object::WriteError),

    #[error(transparent)]
    Access(#[from] dicom::object::AccessError),

    #[error("failed to build DICOM file meta information")]
    Meta(#[from] dicom::object::meta::Error),

    #[error("could not decode image: {0}")]
    Image(#[from] image::ImageError),

    #[error("value for {} is not usable", name_of(.0))]
    InvalidValue(Tag),

    #[error("cannot fuse an empty series")]
    EmptySeries,
}

/// Error talking to the PACS HTTP API.
#[derive(thiserror::Error, Debug)]
pub enum PacsError {
    #[error("PACS is not configured: {0}")]
    NotConfigured(&'static str),

    #[error("PACS token response is missing access_token")]
    MissingAccessToken,

    #[error(transparent)]
    Request(#[from] reqwest::Error),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

/// Get the standard name of a tag, or its numeric form for private tags.
pub(crate) fn name_of(tag: &Tag) -> String {
    StandardDataDictionary
        .by_tag(*tag)
        .map(|e| e.alias.to_string())
        .unwrap_or_else(|| tag.to_string())
}
