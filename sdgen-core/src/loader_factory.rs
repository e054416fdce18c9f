use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use candle_transformers::models::mmdit;
use serde::{de::IgnoredAny, Deserialize};

/// Upper bound on a safetensors JSON header; anything larger is not a checkpoint.
const MAX_HEADER_LEN: u64 = 100 * 1024 * 1024;

const MMDIT_PREFIX: &str = "model.diffusion_model.";
const TEXT_ENCODER_PREFIXES: [&str; 3] = [
    "text_encoders.clip_l.transformer.",
    "text_encoders.clip_g.transformer.",
    "text_encoders.t5xxl.transformer.",
];
const VAE_PREFIX: &str = "first_stage_model.";

#[derive(Debug, Clone, Deserialize)]
pub struct TensorInfo {
    pub dtype: String,
    pub shape: Vec<usize>,
    pub data_offsets: (u64, u64),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HeaderEntry {
    Tensor(TensorInfo),
    Other(IgnoredAny),
}

/// Tensor table of a `.safetensors` file, read without touching the weights.
#[derive(Debug, Clone, Default)]
pub struct CheckpointHeader {
    tensors: HashMap<String, TensorInfo>,
}

impl CheckpointHeader {
    pub fn read(path: &Path) -> Result<Self> {
        if !path.is_file() {
            bail!("no checkpoint file at {}", path.display());
        }
        let mut file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut len = [0u8; 8];
        file.read_exact(&mut len)
            .context("file too short to be a safetensors checkpoint")?;
        let len = u64::from_le_bytes(len);
        if len == 0 || len > MAX_HEADER_LEN {
            bail!("invalid safetensors header length {len}");
        }
        let mut header = vec![0u8; len as usize];
        file.read_exact(&mut header)
            .context("truncated safetensors header")?;
        Self::parse(&header)
    }

    pub fn parse(header: &[u8]) -> Result<Self> {
        let entries: HashMap<String, HeaderEntry> =
            serde_json::from_slice(header).context("malformed safetensors header")?;

        let mut checkpoint = Self::default();
        for (name, entry) in entries {
            match entry {
                HeaderEntry::Tensor(info) => {
                    checkpoint.tensors.insert(name, info);
                }
                HeaderEntry::Other(_) if name == "__metadata__" => {}
                HeaderEntry::Other(_) => bail!("unexpected header entry {name}"),
            }
        }
        Ok(checkpoint)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    fn get(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.get(name)
    }

    fn has_prefix(&self, prefix: &str) -> bool {
        self.tensors.keys().any(|name| name.starts_with(prefix))
    }

    /// Storage dtype of the MMDiT weights, for logging.
    pub fn mmdit_dtype(&self) -> Option<&str> {
        self.tensors
            .iter()
            .find(|(name, _)| name.starts_with(MMDIT_PREFIX))
            .map(|(_, info)| info.dtype.as_str())
    }

    fn joint_block_count(&self) -> usize {
        let prefix = format!("{MMDIT_PREFIX}joint_blocks.");
        self.tensors
            .keys()
            .filter_map(|name| name.strip_prefix(prefix.as_str()))
            .filter_map(|rest| rest.split('.').next())
            .filter_map(|index| index.parse::<usize>().ok())
            .collect::<BTreeSet<_>>()
            .len()
    }
}

/// Stable Diffusion 3 family members this crate can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sd3Variant {
    Medium,
    V3_5Medium,
    V3_5Large,
}

impl Sd3Variant {
    /// Detect the variant from the MMDiT layout in the checkpoint, and check
    /// that the checkpoint bundles everything a single-file load needs.
    pub fn from_header(header: &CheckpointHeader) -> Result<Self> {
        if header.is_empty() {
            bail!("checkpoint contains no tensors");
        }
        for prefix in [VAE_PREFIX]
            .into_iter()
            .chain(TEXT_ENCODER_PREFIXES)
        {
            if !header.has_prefix(prefix) {
                bail!("checkpoint is missing `{}` weights", prefix.trim_end_matches('.'));
            }
        }

        let depth = header.joint_block_count();
        let dual_attention = header
            .get(&format!("{MMDIT_PREFIX}joint_blocks.0.x_block.attn2.qkv.weight"))
            .is_some();
        match (depth, dual_attention) {
            (0, _) => Err(anyhow!("checkpoint has no MMDiT joint blocks")),
            (24, false) => Ok(Self::Medium),
            (24, true) => Ok(Self::V3_5Medium),
            (38, _) => Ok(Self::V3_5Large),
            (depth, _) => Err(anyhow!("unsupported MMDiT depth {depth}")),
        }
    }

    pub fn mmdit_config(&self) -> mmdit::model::Config {
        match self {
            Self::Medium => mmdit::model::Config::sd3_medium(),
            Self::V3_5Medium => mmdit::model::Config::sd3_5_medium(),
            Self::V3_5Large => mmdit::model::Config::sd3_5_large(),
        }
    }

    /// Shift applied to the flow-matching noise schedule. Shared by every
    /// variant.
    pub const TIME_SHIFT: f64 = 3.0;
}
