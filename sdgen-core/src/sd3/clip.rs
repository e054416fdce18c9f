use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::{stable_diffusion, t5};
use tokenizers::Tokenizer;

pub const MAX_POSITION_EMBEDDINGS: usize = 77;

const END_OF_TEXT: &str = "<|endoftext|>";
const CLIP_G_HIDDEN: usize = 1280;
const CONTEXT_WIDTH: usize = 4096;

/// Tokenizers and the T5 config, fetched separately from the checkpoint.
pub struct TextEncoderAssets {
    pub clip_l_tokenizer: Tokenizer,
    pub clip_g_tokenizer: Tokenizer,
    pub t5_tokenizer: Tokenizer,
    pub t5_config: t5::Config,
}

struct ClipWithTokenizer {
    clip: stable_diffusion::clip::ClipTextTransformer,
    tokenizer: Tokenizer,
    pad_id: u32,
    eos_id: u32,
}

impl ClipWithTokenizer {
    fn new(
        vb: VarBuilder,
        config: stable_diffusion::clip::Config,
        tokenizer: Tokenizer,
    ) -> Result<Self> {
        let vocab = tokenizer.get_vocab(true);
        let eos_id = *vocab
            .get(END_OF_TEXT)
            .context("CLIP tokenizer has no end-of-text token")?;
        let pad_id = match &config.pad_with {
            Some(padding) => *vocab
                .get(padding.as_str())
                .with_context(|| format!("CLIP tokenizer has no padding token {padding:?}"))?,
            None => eos_id,
        };
        let clip = stable_diffusion::clip::ClipTextTransformer::new(vb, &config)?;
        Ok(Self {
            clip,
            tokenizer,
            pad_id,
            eos_id,
        })
    }

    /// Returns the penultimate hidden states and the pooled embedding.
    fn encode(&self, prompt: &str, device: &Device) -> Result<(Tensor, Tensor)> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > MAX_POSITION_EMBEDDINGS {
            tracing::warn!(
                "prompt is {} CLIP tokens, truncating to {MAX_POSITION_EMBEDDINGS}",
                tokens.len()
            );
            tokens.truncate(MAX_POSITION_EMBEDDINGS);
            if let Some(last) = tokens.last_mut() {
                *last = self.eos_id;
            }
        }
        let eos_position = tokens.len().saturating_sub(1);
        tokens.resize(MAX_POSITION_EMBEDDINGS, self.pad_id);

        let tokens = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        let (last, penultimate) = self
            .clip
            .forward_until_encoder_layer(&tokens, usize::MAX, -2)?;
        let pooled = last.i((0, eos_position, ..))?;
        Ok((penultimate, pooled))
    }
}

struct T5WithTokenizer {
    t5: t5::T5EncoderModel,
    tokenizer: Tokenizer,
}

impl T5WithTokenizer {
    fn encode(&mut self, prompt: &str, device: &Device) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.resize(MAX_POSITION_EMBEDDINGS, 0);
        let input_token_ids = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        Ok(self.t5.forward_dt(&input_token_ids, Some(DType::F32))?)
    }
}

/// CLIP-L, CLIP-G and T5-XXL, combined into the MMDiT conditioning.
pub struct TripleTextEncoder {
    clip_l: ClipWithTokenizer,
    clip_g: ClipWithTokenizer,
    clip_g_text_projection: candle_nn::Linear,
    t5: T5WithTokenizer,
    dtype: DType,
}

impl TripleTextEncoder {
    /// `vb` points at `text_encoders`; `vb_t5` is the same checkpoint mapped at
    /// full precision, since T5-XXL overflows in f16.
    pub fn new(vb: VarBuilder, vb_t5: VarBuilder, assets: TextEncoderAssets) -> Result<Self> {
        let clip_l = ClipWithTokenizer::new(
            vb.pp("clip_l.transformer"),
            stable_diffusion::clip::Config::sdxl(),
            assets.clip_l_tokenizer,
        )
        .context("failed to load CLIP-L")?;
        let clip_g = ClipWithTokenizer::new(
            vb.pp("clip_g.transformer"),
            stable_diffusion::clip::Config::sdxl2(),
            assets.clip_g_tokenizer,
        )
        .context("failed to load CLIP-G")?;
        let clip_g_text_projection = candle_nn::linear_no_bias(
            CLIP_G_HIDDEN,
            CLIP_G_HIDDEN,
            vb.pp("clip_g.transformer.text_projection"),
        )
        .context("failed to load CLIP-G text projection")?;
        let t5 = t5::T5EncoderModel::load(vb_t5.pp("t5xxl.transformer"), &assets.t5_config)
            .context("failed to load T5-XXL")?;

        Ok(Self {
            clip_l,
            clip_g,
            clip_g_text_projection,
            t5: T5WithTokenizer {
                t5,
                tokenizer: assets.t5_tokenizer,
            },
            dtype: vb.dtype(),
        })
    }

    /// Returns `(context, y)`: the token context and the pooled vector.
    pub fn encode(&mut self, prompt: &str, device: &Device) -> Result<(Tensor, Tensor)> {
        let (clip_l_embeddings, clip_l_pooled) = self.clip_l.encode(prompt, device)?;
        let (clip_g_embeddings, clip_g_pooled) = self.clip_g.encode(prompt, device)?;
        let clip_g_pooled = self
            .clip_g_text_projection
            .forward(&clip_g_pooled.unsqueeze(0)?)?
            .squeeze(0)?;

        let y = Tensor::cat(&[&clip_l_pooled, &clip_g_pooled], 0)?.unsqueeze(0)?;
        let clip_context = Tensor::cat(&[&clip_l_embeddings, &clip_g_embeddings], D::Minus1)?;
        let clip_width = clip_context.dim(D::Minus1)?;
        let clip_context = clip_context.pad_with_zeros(D::Minus1, 0, CONTEXT_WIDTH - clip_width)?;

        let t5_embeddings = self.t5.encode(prompt, device)?.to_dtype(self.dtype)?;
        let context = Tensor::cat(&[&clip_context, &t5_embeddings], D::Minus2)?;
        Ok((context, y))
    }
}
