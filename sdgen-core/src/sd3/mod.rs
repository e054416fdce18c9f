//! Stable Diffusion 3 backend on candle.
//!
//! Loads a single-file checkpoint that bundles the MMDiT, the VAE and the three
//! text encoders. Tokenizers and the T5 config are not part of such files and
//! are fetched from the Hugging Face hub.

use std::future::Future;
use std::path::Path;

use anyhow::{Context, Error};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::{
    mmdit::model::MMDiT, stable_diffusion::vae::AutoEncoderKL, t5,
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;

mod clip;
mod sampling;
mod vae;

use crate::{
    tensor_to_image, CheckpointHeader, GenerationRequest, ImageModel, Loader, Result, Sd3Variant,
    SdgenError,
};
use clip::TripleTextEncoder;
pub use clip::TextEncoderAssets;

pub struct Sd3Model {
    device: Device,
    dtype: DType,
    text_encoder: TripleTextEncoder,
    mmdit: MMDiT,
    autoencoder: AutoEncoderKL,
}

impl Sd3Model {
    fn run(&mut self, request: &GenerationRequest) -> anyhow::Result<DynamicImage> {
        let width = request.width.get();
        let height = request.height.get();

        // --- Conditional and unconditional embeddings, batched ---
        let (context, y) = {
            let (context, y) = self
                .text_encoder
                .encode(&request.prompt, &self.device)
                .context("failed to encode prompt")?;
            let negative = request.negative_prompt.as_deref().unwrap_or("");
            let (context_uncond, y_uncond) = self
                .text_encoder
                .encode(negative, &self.device)
                .context("failed to encode negative prompt")?;
            (
                Tensor::cat(&[context, context_uncond], 0)?,
                Tensor::cat(&[y, y_uncond], 0)?,
            )
        };

        // --- Denoise ---
        let latents = sampling::euler_sample(
            &self.mmdit,
            &y,
            &context,
            request.steps.get(),
            request.guidance_scale,
            Sd3Variant::TIME_SHIFT,
            height,
            width,
            request.seed,
            self.dtype,
        )?;
        tracing::debug!("Generated latent image");

        // --- Decode ---
        let latents = latents.affine(1.0 / vae::SCALING_FACTOR, vae::SHIFT_FACTOR)?;
        let decoded = self.autoencoder.decode(&latents)?;
        tracing::debug!("Decoded image");

        // --- Postprocessing: clamp, scale, crop to the requested size ---
        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        let img = img.i(0)?.narrow(1, 0, height)?.narrow(2, 0, width)?;

        tensor_to_image(&img)
    }
}

impl ImageModel for Sd3Model {
    fn generate(&mut self, request: &GenerationRequest) -> Result<DynamicImage> {
        self.run(request).map_err(SdgenError::generation)
    }
}

async fn fetch_tokenizer(api: &Api, repo: &str, file: &str) -> anyhow::Result<Tokenizer> {
    let path = api
        .model(repo.to_string())
        .get(file)
        .await
        .with_context(|| format!("failed to get {repo}/{file}"))?;
    Tokenizer::from_file(path)
        .map_err(Error::msg)
        .with_context(|| format!("failed to load tokenizer {repo}/{file}"))
}

/// Supplies the tokenizers and T5 config a checkpoint does not bundle.
pub trait AssetSource {
    fn fetch(&self) -> impl Future<Output = anyhow::Result<TextEncoderAssets>>;
}

/// Downloads text encoder assets from the Hugging Face hub, or reuses the
/// local hub cache.
#[derive(Clone, Copy, Debug, Default)]
pub struct HubAssets;

impl AssetSource for HubAssets {
    async fn fetch(&self) -> anyhow::Result<TextEncoderAssets> {
        let api = Api::new().context("failed to create hf hub API")?;
        fetch_text_encoder_assets(&api).await
    }
}

async fn fetch_text_encoder_assets(api: &Api) -> anyhow::Result<TextEncoderAssets> {
    let t5_repo = api.repo(hf_hub::Repo::with_revision(
        "google/t5-v1_1-xxl".to_string(),
        hf_hub::RepoType::Model,
        "refs/pr/2".to_string(),
    ));
    let config_filename = t5_repo
        .get("config.json")
        .await
        .context("failed to get T5 config")?;
    let config_str =
        std::fs::read_to_string(&config_filename).context("failed to read T5 config")?;
    let t5_config: t5::Config =
        serde_json::from_str(&config_str).context("failed to parse T5 config")?;

    Ok(TextEncoderAssets {
        clip_l_tokenizer: fetch_tokenizer(api, "openai/clip-vit-large-patch14", "tokenizer.json")
            .await?,
        clip_g_tokenizer: fetch_tokenizer(
            api,
            "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k",
            "tokenizer.json",
        )
        .await?,
        t5_tokenizer: fetch_tokenizer(api, "lmz/mt5-tokenizers", "t5-v1_1-xxl.tokenizer.json")
            .await?,
        t5_config,
    })
}

/// Memory-maps `model_path` at `dtype`.
fn mmap_checkpoint(
    model_path: &Path,
    dtype: DType,
    device: &Device,
) -> anyhow::Result<VarBuilder<'static>> {
    // SAFETY: the checkpoint is not modified while it is mapped.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[model_path], dtype, device)? };
    Ok(vb)
}

#[derive(Clone, Debug, Default)]
pub struct Sd3Loader<A = HubAssets> {
    assets: A,
}

impl Sd3Loader {
    pub fn new() -> Self {
        Self { assets: HubAssets }
    }
}

impl<A: AssetSource> Sd3Loader<A> {
    pub fn with_assets(assets: A) -> Self {
        Self { assets }
    }
}

impl<A: AssetSource> Loader for Sd3Loader<A> {
    type Model = Sd3Model;

    async fn load(
        &self,
        model_path: &Path,
        request: &GenerationRequest,
        device: &Device,
    ) -> Result<Self::Model> {
        let model_load = |err: anyhow::Error| SdgenError::model_load(model_path, err);

        let header = CheckpointHeader::read(model_path).map_err(model_load)?;
        let variant = Sd3Variant::from_header(&header).map_err(model_load)?;
        tracing::debug!(
            "checkpoint: {variant:?}, {} tensors, stored as {}",
            header.len(),
            header.mmdit_dtype().unwrap_or("unknown")
        );

        let dtype = request.precision.dtype();
        let vb = mmap_checkpoint(model_path, dtype, device)
            .context("failed to map checkpoint")
            .map_err(model_load)?;
        let vb_t5 = mmap_checkpoint(model_path, DType::F32, device)
            .context("failed to map checkpoint")
            .map_err(model_load)?;

        // --- Tokenizers and T5 config ---
        let assets = self
            .assets
            .fetch()
            .await
            .map_err(|err| SdgenError::missing_capability("text encoder assets", err))?;

        // --- Text encoders ---
        let text_encoder =
            TripleTextEncoder::new(vb.pp("text_encoders"), vb_t5.pp("text_encoders"), assets)
                .map_err(model_load)?;

        // --- MMDiT ---
        let mmdit = MMDiT::new(
            &variant.mmdit_config(),
            cfg!(feature = "flash-attn"),
            vb.pp("model.diffusion_model"),
        )
        .context("failed to load MMDiT")
        .map_err(model_load)?;

        // --- Autoencoder ---
        let autoencoder = vae::build_sd3_autoencoder(
            vb.rename_f(vae::sd3_vae_vb_rename).pp("first_stage_model"),
        )
        .context("failed to load autoencoder")
        .map_err(model_load)?;

        Ok(Sd3Model {
            device: device.clone(),
            dtype,
            text_encoder,
            mmdit,
            autoencoder,
        })
    }
}
