pub mod class_index;
pub mod config;
pub mod model_metadata;
pub mod model_storage;

pub use class_index::ClassIndex;
pub use config::{AppConfig, DeviceType, ModelSettings, TrainingSettings};
pub use model_metadata::{ModelMetadata, PhaseSummary};
pub use model_storage::{
    load_metadata, load_model_with_metadata, log_metadata_info, save_model_with_metadata,
    write_atomically,
};
