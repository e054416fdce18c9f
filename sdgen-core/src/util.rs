use anyhow::Result;
use candle_core::{Device, Tensor};
use image::DynamicImage;

use crate::capability::{AcceleratorKind, DeviceKind};

/// Opens the candle device a resolved request points at.
pub fn select_device(device: DeviceKind) -> Result<Device> {
    match device {
        DeviceKind::Fallback => Ok(Device::Cpu),
        DeviceKind::Accelerated {
            kind: AcceleratorKind::Cuda,
            ordinal,
        } => Ok(Device::new_cuda(ordinal)?),
        DeviceKind::Accelerated {
            kind: AcceleratorKind::Metal,
            ordinal,
        } => Ok(Device::new_metal(ordinal)?),
    }
}

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}
