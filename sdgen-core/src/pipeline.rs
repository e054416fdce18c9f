use std::path::Path;

use anyhow::Context;

use crate::{
    loader, persist, report, resolve, CapabilityProvider, GenerationResult, Loader, Result,
    SdgenError, UserOverrides,
};

/// Probe, resolve, load and generate, persist. One request per run.
pub struct Pipeline<C, L> {
    capabilities: C,
    loader: L,
}

impl<C: CapabilityProvider, L: Loader> Pipeline<C, L> {
    pub fn new(capabilities: C, loader: L) -> Self {
        Self {
            capabilities,
            loader,
        }
    }

    pub async fn run(
        &self,
        overrides: &UserOverrides,
        model_path: &Path,
        output_path: &Path,
    ) -> Result<GenerationResult> {
        let capabilities = self.capabilities.probe();
        let request = resolve(overrides, &capabilities);
        report::probe_summary(&capabilities, &request);

        report::model_load_started(model_path);
        let device = self
            .capabilities
            .device(request.device)
            .with_context(|| format!("failed to set up device {}", request.device))
            .map_err(|err| SdgenError::model_load(model_path, err))?;
        let image = loader::generate(&self.loader, model_path, &request, &device).await?;

        let path = persist(&image, output_path)?;
        report::image_saved(&path);

        Ok(GenerationResult::new(&path, &request))
    }
}
