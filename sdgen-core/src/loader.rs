use std::future::Future;
use std::path::Path;

use candle_core::Device;
use image::DynamicImage;

use crate::{report, GenerationRequest, ImageModel, Result};

/// Builds a model from a checkpoint on disk, on `device` and at the precision
/// the request was resolved to.
pub trait Loader {
    type Model: ImageModel;

    fn load(
        &self,
        model_path: &Path,
        request: &GenerationRequest,
        device: &Device,
    ) -> impl Future<Output = Result<Self::Model>>;
}

/// Loads the model and runs exactly one generation pass. No retries.
pub async fn generate<L: Loader>(
    loader: &L,
    model_path: &Path,
    request: &GenerationRequest,
    device: &Device,
) -> Result<DynamicImage> {
    let mut model = loader.load(model_path, request, device).await?;
    report::generation_started(&request.prompt);
    model.generate(request)
}
