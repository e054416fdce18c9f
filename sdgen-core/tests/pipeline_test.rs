use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use candle_core::Device;
use image::{DynamicImage, RgbImage};
use sdgen_core::{
    AcceleratorKind, AssetSource, CapabilityReport, ErrorCategory, FixedCapabilities,
    GenerationOutcome, GenerationRequest, ImageModel, Loader, Pipeline, Reporter, Result,
    Sd3Loader, SdgenError, TextEncoderAssets, UserOverrides,
};

type Seen = Rc<RefCell<Vec<GenerationRequest>>>;

/// Records every request it is asked to load and produces a blank image of the
/// requested size.
#[derive(Default)]
struct RecordingLoader {
    seen: Seen,
    fail_generation: bool,
}

impl RecordingLoader {
    fn seen(&self) -> Seen {
        Rc::clone(&self.seen)
    }
}

struct BlankModel {
    fail: bool,
}

impl ImageModel for BlankModel {
    fn generate(&mut self, request: &GenerationRequest) -> Result<DynamicImage> {
        if self.fail {
            return Err(SdgenError::generation(anyhow::anyhow!("out of memory")));
        }
        Ok(DynamicImage::ImageRgb8(RgbImage::new(
            request.width.get() as u32,
            request.height.get() as u32,
        )))
    }
}

impl Loader for RecordingLoader {
    type Model = BlankModel;

    async fn load(
        &self,
        _model_path: &Path,
        request: &GenerationRequest,
        _device: &Device,
    ) -> Result<BlankModel> {
        self.seen.borrow_mut().push(request.clone());
        Ok(BlankModel {
            fail: self.fail_generation,
        })
    }
}

fn fox() -> UserOverrides {
    UserOverrides {
        prompt: "a red fox".to_string(),
        ..Default::default()
    }
}

fn cpu() -> FixedCapabilities {
    FixedCapabilities(CapabilityReport::fallback())
}

fn gpu() -> FixedCapabilities {
    FixedCapabilities(CapabilityReport::accelerated(AcceleratorKind::Cuda, 0))
}

fn report(result: Result<sdgen_core::GenerationResult>) -> (u8, String, Option<ErrorCategory>) {
    let outcome = GenerationOutcome::from(result);
    let mut reporter = Reporter::new(Vec::new());
    let status = reporter.report(&outcome).unwrap();
    let out = String::from_utf8(reporter.into_inner()).unwrap();
    (status, out, outcome.category())
}

#[tokio::test]
async fn red_fox_on_cpu_uses_small_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out/img.png");
    let pipeline = Pipeline::new(cpu(), RecordingLoader::default());

    let result = pipeline
        .run(&fox(), Path::new("m.safetensors"), &output)
        .await;
    let (status, out, category) = report(result);

    assert_eq!(status, 0);
    assert_eq!(category, None);
    assert_eq!(out.lines().count(), 1);
    let record: serde_json::Value = serde_json::from_str(out.trim_end()).unwrap();
    assert_eq!(record["success"], true);
    assert_eq!(record["width"], 512);
    assert_eq!(record["height"], 512);
    assert_eq!(record["steps"], 10);
    assert_eq!(record["cuda"], false);
    assert_eq!(record["path"], output.to_string_lossy().as_ref());

    let written = image::open(&output).unwrap();
    assert_eq!((written.width(), written.height()), (512, 512));
}

#[tokio::test]
async fn red_fox_on_gpu_uses_large_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out/img.png");
    let loader = RecordingLoader::default();
    let seen = loader.seen();
    let pipeline = Pipeline::new(gpu(), loader);

    let result = pipeline
        .run(&fox(), Path::new("m.safetensors"), &output)
        .await
        .unwrap();

    assert_eq!((result.width, result.height, result.steps), (1024, 1024, 28));
    assert!(result.cuda);
    assert_eq!(result.device, "cuda");

    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].precision, sdgen_core::Precision::Reduced);
}

#[tokio::test]
async fn explicit_sizes_win_on_both_profiles() {
    let overrides = UserOverrides {
        width: Some(640),
        height: Some(480),
        steps: Some(15),
        ..fox()
    };
    for capabilities in [cpu(), gpu()] {
        let dir = tempfile::tempdir().unwrap();
        let loader = RecordingLoader::default();
        let seen = loader.seen();
        let pipeline = Pipeline::new(capabilities, loader);
        let result = pipeline
            .run(&overrides, Path::new("m.safetensors"), &dir.path().join("img.png"))
            .await
            .unwrap();
        assert_eq!((result.width, result.height, result.steps), (640, 480, 15));

        let seen = seen.borrow();
        assert_eq!(
            (seen[0].width.get(), seen[0].height.get(), seen[0].steps.get()),
            (640, 480, 15)
        );
    }
}

#[tokio::test]
async fn empty_and_absent_negative_prompts_match() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("img.png");
    let loader = RecordingLoader::default();
    let seen = loader.seen();
    let pipeline = Pipeline::new(cpu(), loader);

    let empty = UserOverrides {
        negative_prompt: Some(String::new()),
        ..fox()
    };
    pipeline.run(&fox(), Path::new("m"), &output).await.unwrap();
    pipeline.run(&empty, Path::new("m"), &output).await.unwrap();

    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], seen[1]);
    assert_eq!(seen[0].negative_prompt, None);
}

#[tokio::test]
async fn rerunning_into_the_same_nested_path_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("a/b/img.png");
    let pipeline = Pipeline::new(cpu(), RecordingLoader::default());

    pipeline.run(&fox(), Path::new("m"), &output).await.unwrap();
    pipeline.run(&fox(), Path::new("m"), &output).await.unwrap();
    assert!(output.is_file());
}

#[tokio::test]
async fn missing_model_is_a_model_load_failure() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out/img.png");
    let model = dir.path().join("missing.safetensors");
    let pipeline = Pipeline::new(cpu(), Sd3Loader::new());

    let result = pipeline.run(&fox(), &model, &output).await;
    let err = result.as_ref().unwrap_err();
    assert!(err.to_string().contains("missing.safetensors"), "{err}");

    let (status, out, category) = report(result);
    assert_eq!(status, 1);
    assert!(out.is_empty());
    assert_eq!(category, Some(ErrorCategory::ModelLoad));
    assert!(!output.exists());
}

#[tokio::test]
async fn non_checkpoint_model_is_a_model_load_failure() {
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("m.safetensors");
    std::fs::write(&model, b"definitely not safetensors").unwrap();
    let pipeline = Pipeline::new(cpu(), Sd3Loader::new());

    let err = pipeline
        .run(&fox(), &model, &dir.path().join("img.png"))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::ModelLoad);
}

#[tokio::test]
async fn generation_failure_writes_no_file_and_no_record() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("img.png");
    let loader = RecordingLoader {
        fail_generation: true,
        ..Default::default()
    };
    let pipeline = Pipeline::new(cpu(), loader);

    let (status, out, category) = report(pipeline.run(&fox(), Path::new("m"), &output).await);
    assert_eq!(status, 1);
    assert!(out.is_empty());
    assert_eq!(category, Some(ErrorCategory::Generation));
    assert!(!output.exists());
}

#[tokio::test]
async fn unwritable_destination_is_an_io_failure() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"").unwrap();
    let pipeline = Pipeline::new(cpu(), RecordingLoader::default());

    let (status, out, category) =
        report(pipeline.run(&fox(), Path::new("m"), &blocker.join("img.png")).await);
    assert_eq!(status, 1);
    assert!(out.is_empty());
    assert_eq!(category, Some(ErrorCategory::Io));
}

/// An asset source that behaves like a machine without hub access.
struct OfflineAssets;

impl AssetSource for OfflineAssets {
    async fn fetch(&self) -> anyhow::Result<TextEncoderAssets> {
        anyhow::bail!("hub unreachable")
    }
}

/// Writes a tiny but well-formed SD3 medium checkpoint: every tensor is a
/// single F16 zero.
fn write_checkpoint(path: &Path) {
    let mut names = vec![
        "first_stage_model.decoder.conv_in.weight".to_string(),
        "text_encoders.clip_l.transformer.text_model.final_layer_norm.weight".to_string(),
        "text_encoders.clip_g.transformer.text_model.final_layer_norm.weight".to_string(),
        "text_encoders.t5xxl.transformer.shared.weight".to_string(),
    ];
    for block in 0..24 {
        names.push(format!(
            "model.diffusion_model.joint_blocks.{block}.x_block.attn.qkv.weight"
        ));
    }

    let mut table = serde_json::Map::new();
    for (index, name) in names.iter().enumerate() {
        table.insert(
            name.clone(),
            serde_json::json!({
                "dtype": "F16",
                "shape": [1],
                "data_offsets": [index * 2, index * 2 + 2],
            }),
        );
    }
    let header = serde_json::Value::Object(table).to_string();

    let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(header.as_bytes());
    bytes.resize(bytes.len() + names.len() * 2, 0);
    std::fs::write(path, bytes).unwrap();
}

#[tokio::test]
async fn unreachable_text_encoder_assets_are_a_missing_capability() {
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("sd3_medium.safetensors");
    write_checkpoint(&model);
    let output = dir.path().join("out/img.png");
    let pipeline = Pipeline::new(cpu(), Sd3Loader::with_assets(OfflineAssets));

    let (status, out, category) = report(pipeline.run(&fox(), &model, &output).await);
    assert_eq!(status, 1);
    assert!(out.is_empty());
    assert_eq!(category, Some(ErrorCategory::MissingCapability));
    assert!(!output.exists());
}
