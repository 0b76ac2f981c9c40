//! Rendering of processed frames.
//!
//! The render sink is responsible for:
//! - Decoding the server's data URI into pixels
//! - Resizing the drawing surface only when the frame dimensions change
//! - Presenting the image exactly as received (no local post-processing)
//!
//! The render sink MUST NOT:
//! - Queue frames; each render replaces the previous image
//! - Touch the statistics; the controller counts successful renders

use anyhow::{anyhow, Context, Result};
use image::{ImageFormat, RgbaImage};
use std::path::{Path, PathBuf};

use crate::protocol::decode_data_uri;

/// A drawing target for processed frames.
pub trait Surface {
    /// Current surface dimensions, `None` before the first resize.
    fn size(&self) -> Option<(u32, u32)>;
    fn resize(&mut self, width: u32, height: u32) -> Result<()>;
    fn present(&mut self, image: &RgbaImage) -> Result<()>;
}

impl<S: Surface + ?Sized> Surface for Box<S> {
    fn size(&self) -> Option<(u32, u32)> {
        (**self).size()
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        (**self).resize(width, height)
    }

    fn present(&mut self, image: &RgbaImage) -> Result<()> {
        (**self).present(image)
    }
}

pub struct RenderSink<S: Surface> {
    surface: S,
    rendered: u64,
    dropped: u64,
}

impl<S: Surface> RenderSink<S> {
    pub fn new(surface: S) -> Self {
        Self {
            surface,
            rendered: 0,
            dropped: 0,
        }
    }

    /// Decode `data_uri` and draw it. A failed decode leaves the surface
    /// untouched. Every frame that is not presented counts as dropped.
    pub fn render(&mut self, data_uri: &str) -> Result<()> {
        match self.draw(data_uri) {
            Ok(()) => {
                self.rendered += 1;
                Ok(())
            }
            Err(err) => {
                self.dropped += 1;
                Err(err)
            }
        }
    }

    fn draw(&mut self, data_uri: &str) -> Result<()> {
        let image = decode_image(data_uri)?;
        let dims = image.dimensions();
        if self.surface.size() != Some(dims) {
            self.surface
                .resize(dims.0, dims.1)
                .with_context(|| format!("resize surface to {}x{}", dims.0, dims.1))?;
        }
        self.surface.present(&image).context("present frame")
    }

    pub fn rendered(&self) -> u64 {
        self.rendered
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }
}

fn decode_image(data_uri: &str) -> Result<RgbaImage> {
    let uri = decode_data_uri(data_uri)?;
    if !uri.mime.starts_with("image/") {
        return Err(anyhow!("processed frame is not an image ({})", uri.mime));
    }
    let image = image::load_from_memory(&uri.payload).context("decode processed frame")?;
    Ok(image.into_rgba8())
}

// ----------------------------------------------------------------------------
// Surfaces
// ----------------------------------------------------------------------------

/// Keeps the most recent image in memory.
#[derive(Default)]
pub struct MemorySurface {
    size: Option<(u32, u32)>,
    latest: Option<RgbaImage>,
    presented: u64,
    resizes: u64,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<&RgbaImage> {
        self.latest.as_ref()
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }

    pub fn resizes(&self) -> u64 {
        self.resizes
    }
}

impl Surface for MemorySurface {
    fn size(&self) -> Option<(u32, u32)> {
        self.size
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.size = Some((width, height));
        self.resizes += 1;
        Ok(())
    }

    fn present(&mut self, image: &RgbaImage) -> Result<()> {
        self.latest = Some(image.clone());
        self.presented += 1;
        Ok(())
    }
}

/// Writes every presented frame over a single image file.
///
/// The file is replaced atomically (write to a sibling, then rename) so a
/// viewer polling the path never observes a half-written image.
pub struct FileSurface {
    path: PathBuf,
    partial: PathBuf,
    format: ImageFormat,
    size: Option<(u32, u32)>,
}

impl FileSurface {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let format = ImageFormat::from_path(&path)
            .with_context(|| format!("unsupported output image type: {}", path.display()))?;
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow!("output path has no file name: {}", path.display()))?
            .to_string_lossy()
            .into_owned();
        let partial = path.with_file_name(format!(".{}.partial", file_name));
        Ok(Self {
            path,
            partial,
            format,
            size: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Surface for FileSurface {
    fn size(&self) -> Option<(u32, u32)> {
        self.size
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        log::info!(
            "FileSurface: {} now {}x{}",
            self.path.display(),
            width,
            height
        );
        self.size = Some((width, height));
        Ok(())
    }

    fn present(&mut self, image: &RgbaImage) -> Result<()> {
        let rgb = image::DynamicImage::ImageRgba8(image.clone()).into_rgb8();
        rgb.save_with_format(&self.partial, self.format)
            .with_context(|| format!("write {}", self.partial.display()))?;
        std::fs::rename(&self.partial, &self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }
}
