//! Outcome reporting.
//!
//! Progress goes to the diagnostic stream through `tracing`. The primary
//! stream receives one JSON line on success and nothing on failure.

use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::{CapabilityReport, ErrorCategory, GenerationRequest, Result, SdgenError};

/// Characters of the prompt shown in the generation announcement.
pub const PROMPT_PREVIEW_CHARS: usize = 50;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;

/// The record printed on success. Field names are stable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub success: bool,
    /// Saved path, rendered lossily when it is not UTF-8.
    pub path: String,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    /// Whether an accelerator was used.
    pub cuda: bool,
    pub device: &'static str,
}

impl GenerationResult {
    pub fn new(path: &Path, request: &GenerationRequest) -> Self {
        Self {
            success: true,
            path: path.to_string_lossy().into_owned(),
            width: request.width.get(),
            height: request.height.get(),
            steps: request.steps.get(),
            cuda: request.device.is_accelerated(),
            device: request.device.label(),
        }
    }
}

/// Final state of a run.
#[derive(Debug)]
pub enum GenerationOutcome {
    Success(GenerationResult),
    Failure(SdgenError),
}

impl GenerationOutcome {
    pub fn exit_status(&self) -> u8 {
        match self {
            Self::Success(_) => EXIT_SUCCESS,
            Self::Failure(_) => EXIT_FAILURE,
        }
    }

    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            Self::Success(_) => None,
            Self::Failure(err) => Some(err.category()),
        }
    }
}

impl From<Result<GenerationResult>> for GenerationOutcome {
    fn from(result: Result<GenerationResult>) -> Self {
        match result {
            Ok(result) => Self::Success(result),
            Err(err) => Self::Failure(err),
        }
    }
}

/// Prefix of `prompt` at most `max_chars` characters long.
pub fn truncate_prompt(prompt: &str, max_chars: usize) -> &str {
    match prompt.char_indices().nth(max_chars) {
        Some((end, _)) => &prompt[..end],
        None => prompt,
    }
}

pub fn probe_summary(report: &CapabilityReport, request: &GenerationRequest) {
    tracing::info!(
        "[SD3] cuda={} device={} width={} height={} steps={}",
        report.accelerated_available(),
        request.device,
        request.width,
        request.height,
        request.steps
    );
}

pub fn model_load_started(model_path: &Path) {
    tracing::info!("Loading model from: {}", model_path.display());
}

pub fn generation_started(prompt: &str) {
    tracing::info!(
        "Generating image: {}...",
        truncate_prompt(prompt, PROMPT_PREVIEW_CHARS)
    );
}

pub fn image_saved(path: &Path) {
    tracing::info!("Image saved to: {}", path.display());
}

/// Writes the run's single structured record.
pub struct Reporter<W> {
    out: W,
    reported: bool,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            reported: false,
        }
    }

    /// Reports `outcome` and returns the process exit status. A second call
    /// writes nothing and fails.
    pub fn report(&mut self, outcome: &GenerationOutcome) -> Result<u8> {
        if self.reported {
            return Err(SdgenError::Other(anyhow::anyhow!(
                "outcome already reported for this run"
            )));
        }
        self.reported = true;

        match outcome {
            GenerationOutcome::Success(result) => {
                let line = serde_json::to_string(result)
                    .map_err(|err| SdgenError::Report(err.into()))?;
                writeln!(self.out, "{line}").map_err(SdgenError::Report)?;
                self.out.flush().map_err(SdgenError::Report)?;
            }
            GenerationOutcome::Failure(err) => {
                tracing::error!("{}: {err}", err.category());
            }
        }
        Ok(outcome.exit_status())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
