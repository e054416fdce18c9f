//! # sdgen
//!
//! Turns a text prompt into an image file with a Stable Diffusion 3 checkpoint.
//! A run probes the hardware, resolves the request against what was found,
//! loads the model, generates one image, saves it and reports the outcome.

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod capability;
pub mod device_map;
pub mod error;
pub mod loader;
mod loader_factory;
mod persist;
mod pipeline;
pub mod report;
mod request;
mod util;

mod sd3;

pub use capability::*;
pub use device_map::*;
pub use error::{ErrorCategory, Result, SdgenError};
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use persist::persist;
pub use pipeline::Pipeline;
pub use report::{GenerationOutcome, GenerationResult, Reporter};
pub use request::*;
pub use sd3::{AssetSource, HubAssets, Sd3Loader, Sd3Model, TextEncoderAssets};
pub(crate) use util::*;

/// A loaded model that turns one resolved request into one image.
pub trait ImageModel {
    fn generate(&mut self, request: &GenerationRequest) -> Result<DynamicImage>;
}
