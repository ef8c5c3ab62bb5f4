mod classifier;
mod config;
mod dicom_meta;
mod error;
mod log_sink;
mod pacs;
mod paths;
mod run_service;
mod scanner;
mod settings;
mod stager;
#[cfg(test)]
mod test_support;
mod throttle;
mod transform;
mod types;
mod uploader;

pub use classifier::{CaseContents, classify_case, is_case_folder};
pub use config::{ConfigWatcher, load_settings};
pub use dicom_meta::StudyInfo;
pub use error::{PacsError, StageError};
pub use log_sink::UiLog;
pub use pacs::PacsClient;
pub use paths::DayFolders;
pub use run_service::{run_service, run_service_from_env};
pub use scanner::{ScanContext, scan_loop};
pub use settings::ServiceSettings;
pub use stager::{StagedCase, is_staged, stage_case};
pub use throttle::ProgressFn;
pub use types::{CaseLabel, CaseName, SeriesInstanceUid, SopInstanceUid, StudyInstanceUid};
pub use uploader::{UploadOrchestrator, UploadStart};
