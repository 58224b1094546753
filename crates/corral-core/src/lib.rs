pub mod config;
pub mod image;
pub mod resource;

pub use config::{ConfigError, CorralConfig};
pub use image::{image_repository, image_tag, render_build_manifest, short_sha};
pub use resource::{ResourceConfig, VolumeBinding};
