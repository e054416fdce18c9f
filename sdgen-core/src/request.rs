use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use crate::capability::{CapabilityReport, DeviceKind, Precision};

pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.0;

/// What the user asked for. Unset numeric fields fall back to the capability
/// defaults; `Some(0)` is accepted and means the same as `None`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct UserOverrides {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub steps: Option<usize>,
    pub guidance: Option<f64>,
    pub seed: Option<u64>,
}

/// A fully resolved request, ready for the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: NonZeroUsize,
    pub height: NonZeroUsize,
    pub steps: NonZeroUsize,
    pub guidance_scale: f64,
    pub device: DeviceKind,
    pub precision: Precision,
    pub seed: Option<u64>,
}

fn or_default(value: Option<usize>, default: NonZeroUsize) -> NonZeroUsize {
    value.and_then(NonZeroUsize::new).unwrap_or(default)
}

/// Merges user overrides with the probe's defaults. Positive overrides are
/// used verbatim, without clamping to any backend limit.
pub fn resolve(overrides: &UserOverrides, report: &CapabilityReport) -> GenerationRequest {
    GenerationRequest {
        prompt: overrides.prompt.clone(),
        negative_prompt: overrides
            .negative_prompt
            .clone()
            .filter(|negative| !negative.is_empty()),
        width: or_default(overrides.width, report.default_width),
        height: or_default(overrides.height, report.default_height),
        steps: or_default(overrides.steps, report.default_steps),
        guidance_scale: overrides.guidance.unwrap_or(DEFAULT_GUIDANCE_SCALE),
        device: report.device,
        precision: report.precision,
        seed: overrides.seed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::AcceleratorKind;

    fn fox() -> UserOverrides {
        UserOverrides {
            prompt: "a red fox".to_string(),
            ..Default::default()
        }
    }

    fn dims(request: &GenerationRequest) -> (usize, usize, usize) {
        (request.width.get(), request.height.get(), request.steps.get())
    }

    #[test]
    fn unset_fields_use_fallback_defaults() {
        let request = resolve(&fox(), &CapabilityReport::fallback());
        assert_eq!(dims(&request), (512, 512, 10));
        assert_eq!(request.device, DeviceKind::Fallback);
        assert_eq!(request.precision, Precision::Full);
        assert_eq!(request.guidance_scale, 7.0);
    }

    #[test]
    fn unset_fields_use_accelerated_defaults() {
        let report = CapabilityReport::accelerated(AcceleratorKind::Cuda, 0);
        let request = resolve(&fox(), &report);
        assert_eq!(dims(&request), (1024, 1024, 28));
        assert_eq!(request.precision, Precision::Reduced);
        assert!(request.device.is_accelerated());
    }

    #[test]
    fn zero_means_unset() {
        let overrides = UserOverrides {
            width: Some(0),
            height: Some(0),
            steps: Some(0),
            ..fox()
        };
        assert_eq!(
            resolve(&overrides, &CapabilityReport::fallback()),
            resolve(&fox(), &CapabilityReport::fallback())
        );
    }

    #[test]
    fn positive_overrides_win_on_every_profile() {
        let overrides = UserOverrides {
            width: Some(640),
            height: Some(480),
            steps: Some(15),
            ..fox()
        };
        for report in [
            CapabilityReport::fallback(),
            CapabilityReport::accelerated(AcceleratorKind::Cuda, 0),
            CapabilityReport::accelerated(AcceleratorKind::Metal, 0),
        ] {
            assert_eq!(dims(&resolve(&overrides, &report)), (640, 480, 15));
        }
    }

    #[test]
    fn fields_resolve_independently() {
        let overrides = UserOverrides {
            width: Some(768),
            ..fox()
        };
        let request = resolve(&overrides, &CapabilityReport::fallback());
        assert_eq!(dims(&request), (768, 512, 10));
    }

    #[test]
    fn oversized_requests_are_not_clamped() {
        let overrides = UserOverrides {
            width: Some(16384),
            steps: Some(1000),
            ..fox()
        };
        let request = resolve(&overrides, &CapabilityReport::fallback());
        assert_eq!(request.width.get(), 16384);
        assert_eq!(request.steps.get(), 1000);
    }

    #[test]
    fn empty_negative_prompt_is_absent() {
        let empty = UserOverrides {
            negative_prompt: Some(String::new()),
            ..fox()
        };
        let report = CapabilityReport::fallback();
        assert_eq!(resolve(&empty, &report), resolve(&fox(), &report));
        assert_eq!(resolve(&empty, &report).negative_prompt, None);

        let blurry = UserOverrides {
            negative_prompt: Some("blurry".to_string()),
            ..fox()
        };
        assert_eq!(
            resolve(&blurry, &report).negative_prompt.as_deref(),
            Some("blurry")
        );
    }

    #[test]
    fn prompt_guidance_and_seed_pass_through() {
        let overrides = UserOverrides {
            prompt: String::new(),
            guidance: Some(3.5),
            seed: Some(42),
            ..Default::default()
        };
        let request = resolve(&overrides, &CapabilityReport::fallback());
        assert_eq!(request.prompt, "");
        assert_eq!(request.guidance_scale, 3.5);
        assert_eq!(request.seed, Some(42));
    }
}
