use aliri_braid::braid;
use std::fmt::Display;

/// SOP Instance UID: globally unique identifier of one DICOM object.
#[braid(serde)]
pub struct SopInstanceUid;

/// Series Instance UID shared by the instances of one series.
#[braid(serde)]
pub struct SeriesInstanceUid;

/// Study Instance UID shared by the series of one study.
#[braid(serde)]
pub struct StudyInstanceUid;

/// Name of a case folder, e.g. `"Jane Doe"`. The folder name is the stable
/// identifier of the case for its day.
#[braid(serde)]
pub struct CaseName;

/// PACS study label attached after a successful upload.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum CaseLabel {
    /// A 3D CBCT volume (single multi-frame instance).
    ThreeD,
    /// An OnDemand 3D "project" instance.
    OnDemandProject,
    /// A plain 2D DICOM (panoramic, intraoral, ...).
    TwoD,
    /// An encapsulated PDF report.
    Pdf,
    /// A secondary-capture raster image.
    Image,
    /// Added to everything handled by the yesterday-recovery pass.
    YesterdayRecovery,
}

impl CaseLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseLabel::ThreeD => "3D-DICOM",
            CaseLabel::OnDemandProject => "OD3D",
            CaseLabel::TwoD => "2D-DICOM",
            CaseLabel::Pdf => "PDF",
            CaseLabel::Image => "Image",
            CaseLabel::YesterdayRecovery => "Yesterday-Recovery",
        }
    }
}

impl Display for CaseLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
