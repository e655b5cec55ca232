use std::path::{Path, PathBuf};

use image::{ImageFormat, RgbaImage};
use tracing::debug;

use crate::error::{Error, Result};

/// Destination for a read-back frame.
pub trait ImageSink {
    /// Consumes `width * height` row-major `0xAABBGGRR` pixels.
    fn write(&self, pixels: &[u32], width: u32, height: u32) -> Result<()>;
}

/// Writes frames as RGBA8 PNG files.
#[derive(Debug, Clone)]
pub struct PngSink {
    path: PathBuf,
}

impl PngSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fail(&self, reason: impl Into<String>) -> Error {
        Error::Output {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }
}

impl ImageSink for PngSink {
    fn write(&self, pixels: &[u32], width: u32, height: u32) -> Result<()> {
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(self.fail(format!(
                "expected {expected} pixels for {width}x{height}, got {}",
                pixels.len()
            )));
        }
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|err| self.fail(format!("creating {}: {err}", parent.display())))?;
        }

        // Little-endian words are already R, G, B, A in memory order.
        let bytes: Vec<u8> = pixels.iter().flat_map(|pixel| pixel.to_le_bytes()).collect();
        let image = RgbaImage::from_raw(width, height, bytes)
            .ok_or_else(|| self.fail("pixel buffer does not match the frame size"))?;
        image
            .save_with_format(&self.path, ImageFormat::Png)
            .map_err(|err| self.fail(err.to_string()))?;
        debug!(path = %self.path.display(), width, height, "wrote png");
        Ok(())
    }
}
