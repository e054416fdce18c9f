//! Hardware capability probing.
//!
//! The probe decides once per run whether an accelerator is usable and derives
//! the precision and default image size from that answer. Everything downstream
//! consumes the resulting [`CapabilityReport`] instead of querying hardware
//! again, so tests can swap in [`FixedCapabilities`].

use std::cell::OnceCell;
use std::fmt;
use std::num::NonZeroUsize;

use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device};

use crate::{select_device, DeviceMap};

const fn dim(n: usize) -> NonZeroUsize {
    match NonZeroUsize::new(n) {
        Some(n) => n,
        None => NonZeroUsize::MIN,
    }
}

const ACCELERATED_SIZE: NonZeroUsize = dim(1024);
const ACCELERATED_STEPS: NonZeroUsize = dim(28);
const FALLBACK_SIZE: NonZeroUsize = dim(512);
const FALLBACK_STEPS: NonZeroUsize = dim(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AcceleratorKind {
    Cuda,
    Metal,
}

/// Device a request runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Accelerated { kind: AcceleratorKind, ordinal: usize },
    Fallback,
}

impl DeviceKind {
    pub fn is_accelerated(&self) -> bool {
        matches!(self, Self::Accelerated { .. })
    }

    /// Short label used in logs and the result record.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Accelerated {
                kind: AcceleratorKind::Cuda,
                ..
            } => "cuda",
            Self::Accelerated {
                kind: AcceleratorKind::Metal,
                ..
            } => "metal",
            Self::Fallback => "cpu",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accelerated { ordinal, .. } => write!(f, "{}:{ordinal}", self.label()),
            Self::Fallback => f.write_str(self.label()),
        }
    }
}

/// Numeric precision used for weights and activations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Precision {
    Reduced,
    Full,
}

impl Precision {
    pub fn dtype(&self) -> DType {
        match self {
            Self::Reduced => DType::F16,
            Self::Full => DType::F32,
        }
    }
}

/// What the probe found, plus the defaults implied by it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapabilityReport {
    pub device: DeviceKind,
    pub precision: Precision,
    pub default_width: NonZeroUsize,
    pub default_height: NonZeroUsize,
    pub default_steps: NonZeroUsize,
}

impl CapabilityReport {
    pub fn accelerated(kind: AcceleratorKind, ordinal: usize) -> Self {
        Self {
            device: DeviceKind::Accelerated { kind, ordinal },
            precision: Precision::Reduced,
            default_width: ACCELERATED_SIZE,
            default_height: ACCELERATED_SIZE,
            default_steps: ACCELERATED_STEPS,
        }
    }

    pub fn fallback() -> Self {
        Self {
            device: DeviceKind::Fallback,
            precision: Precision::Full,
            default_width: FALLBACK_SIZE,
            default_height: FALLBACK_SIZE,
            default_steps: FALLBACK_STEPS,
        }
    }

    pub fn accelerated_available(&self) -> bool {
        self.device.is_accelerated()
    }
}

/// Source of the run's [`CapabilityReport`] and of the device it names.
pub trait CapabilityProvider {
    fn probe(&self) -> CapabilityReport;

    /// Compute device for `kind`.
    fn device(&self, kind: DeviceKind) -> anyhow::Result<Device> {
        select_device(kind)
    }
}

/// Asks candle which accelerators exist and whether the chosen one opens.
///
/// The accelerator opened while probing is kept and handed out by
/// [`CapabilityProvider::device`].
#[derive(Clone, Debug, Default)]
pub struct HardwareProbe {
    device_map: DeviceMap,
    opened: OnceCell<(DeviceKind, Device)>,
}

impl HardwareProbe {
    pub fn new(device_map: DeviceMap) -> Self {
        Self {
            device_map,
            opened: OnceCell::new(),
        }
    }

    fn keep(&self, device: Device, report: CapabilityReport) -> CapabilityReport {
        // A repeated probe keeps the first device.
        let _ = self.opened.set((report.device, device));
        report
    }
}

impl CapabilityProvider for HardwareProbe {
    fn probe(&self) -> CapabilityReport {
        let ordinal = match self.device_map {
            DeviceMap::ForceCpu => {
                tracing::debug!("accelerators disabled, using cpu");
                return CapabilityReport::fallback();
            }
            DeviceMap::Ordinal(ordinal) => ordinal,
        };

        if cuda_is_available() {
            match Device::new_cuda(ordinal) {
                Ok(device) => {
                    let report = CapabilityReport::accelerated(AcceleratorKind::Cuda, ordinal);
                    return self.keep(device, report);
                }
                Err(err) => tracing::warn!("cuda device {ordinal} unusable, falling back: {err}"),
            }
        } else if metal_is_available() {
            match Device::new_metal(ordinal) {
                Ok(device) => {
                    let report = CapabilityReport::accelerated(AcceleratorKind::Metal, ordinal);
                    return self.keep(device, report);
                }
                Err(err) => tracing::warn!("metal device {ordinal} unusable, falling back: {err}"),
            }
        } else {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                tracing::info!(
                    "Running on CPU, to run on GPU(metal), build with `--features metal`"
                );
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                tracing::info!("Running on CPU, to run on GPU, build with `--features cuda`");
            }
        }

        CapabilityReport::fallback()
    }

    fn device(&self, kind: DeviceKind) -> anyhow::Result<Device> {
        match self.opened.get() {
            Some((opened, device)) if *opened == kind => Ok(device.clone()),
            _ => select_device(kind),
        }
    }
}

/// Always reports the same capabilities. Never touches hardware: every
/// device it hands out is the CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedCapabilities(pub CapabilityReport);

impl CapabilityProvider for FixedCapabilities {
    fn probe(&self) -> CapabilityReport {
        self.0
    }

    fn device(&self, _kind: DeviceKind) -> anyhow::Result<Device> {
        Ok(Device::Cpu)
    }
}
