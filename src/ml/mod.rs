pub mod backbone;
pub mod builder;
pub mod inference;
pub mod network;
pub mod training;

pub use backbone::{BackboneConfig, Vgg16Backbone, VggFeatures};
pub use builder::{build_model, prepare_artifacts, restore_checkpoint, BuiltModel, CLASS_LABELS};
pub use inference::VggClassifier;
pub use network::{TrafficLightNet, TrafficLightNetConfig};
pub use training::{train, LightBatcher, LightDataset};
