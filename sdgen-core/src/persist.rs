use std::path::{Path, PathBuf};

use image::DynamicImage;

use crate::{Result, SdgenError};

/// Writes `image` to `output_path`, creating missing parent directories.
/// The format follows the file extension. A failed write may leave a partial
/// file behind.
pub fn persist(image: &DynamicImage, output_path: &Path) -> Result<PathBuf> {
    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| SdgenError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    image
        .save(output_path)
        .map_err(|source| SdgenError::ImageSave {
            path: output_path.to_path_buf(),
            source,
        })?;

    Ok(output_path.to_path_buf())
}
