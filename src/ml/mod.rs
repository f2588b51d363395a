pub mod augmentation;
pub mod backbone;
pub mod callbacks;
pub mod dataset;
pub mod inference;
pub mod ml_model;
pub mod training;

pub use backbone::{BackboneSpec, MobileNetV2};
pub use inference::{load_trained_model, InferenceEngine, Prediction};
pub use ml_model::{
    image_to_chw, load_and_normalize_image, load_rgb_image, resize_square, ClassifierHead,
    FreshnessClassifier, ModelConfig,
};
pub use training::{train_model, EpochReport, PhasePlan, TrainingPhase, TrainingReport};
