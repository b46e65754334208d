use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};

use crate::models::settings::{OutputFormat, PreprocessSettings};

/// Job-scoped store of inference-ready image bytes, keyed by file id.
///
/// Owned by a single runner and dropped with it; never shared across jobs.
pub struct ResizeCache {
    settings: PreprocessSettings,
    entries: HashMap<String, Arc<Vec<u8>>>,
    transforms: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ResizeError {
    #[error("could not read source image: {0}")]
    Source(String),

    #[error("image processing failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("resize task failed: {0}")]
    Task(String),

    #[error("loading and resizing the image took longer than {0}s")]
    Timeout(u64),
}

impl ResizeCache {
    pub fn new(settings: PreprocessSettings) -> Self {
        Self {
            settings,
            entries: HashMap::new(),
            transforms: 0,
        }
    }

    /// Return cached bytes for `file_id`, or load, transform and cache them.
    ///
    /// `load` is only awaited on a miss.
    pub async fn get_or_prepare<F, Fut>(
        &mut self,
        file_id: &str,
        load: F,
    ) -> Result<Arc<Vec<u8>>, ResizeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, ResizeError>>,
    {
        if let Some(hit) = self.entries.get(file_id) {
            return Ok(Arc::clone(hit));
        }

        let source = load().await?;
        let settings = self.settings.clone();
        self.transforms += 1;
        let prepared = tokio::task::spawn_blocking(move || prepare_image(&source, &settings))
            .await
            .map_err(|e| ResizeError::Task(e.to_string()))??;

        let prepared = Arc::new(prepared);
        self.entries
            .insert(file_id.to_string(), Arc::clone(&prepared));
        Ok(prepared)
    }

    /// Number of decode/transform passes performed so far.
    pub fn transform_count(&self) -> usize {
        self.transforms
    }

    pub fn mime_type(&self) -> &'static str {
        self.settings.format.mime_type()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decode, flatten, scale and re-encode one image.
pub fn prepare_image(source: &[u8], settings: &PreprocessSettings) -> Result<Vec<u8>, ResizeError> {
    let mut img = image::load_from_memory(source)?;

    if img.color().has_alpha() {
        img = flatten_on_white(&img);
    }

    let max = settings.max_resolution.max(1);
    let (width, height) = img.dimensions();
    if width.max(height) > max {
        img = if settings.maintain_aspect_ratio {
            img.resize(max, max, FilterType::Lanczos3)
        } else {
            img.resize_exact(max, max, FilterType::Lanczos3)
        };
    }

    let mut buf = Vec::new();
    match settings.format {
        OutputFormat::Jpeg => {
            let quality = settings.quality.clamp(1, 100);
            DynamicImage::ImageRgb8(img.to_rgb8())
                .write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality))?;
        }
        OutputFormat::Png => {
            img.write_with_encoder(PngEncoder::new(&mut buf))?;
        }
        // The webp encoder is lossless only, so `quality` does not apply.
        OutputFormat::Webp => {
            DynamicImage::ImageRgb8(img.to_rgb8())
                .write_with_encoder(WebPEncoder::new_lossless(&mut buf))?;
        }
    }
    Ok(buf)
}

/// Composite an image with transparency onto a white background.
fn flatten_on_white(img: &DynamicImage) -> DynamicImage {
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut out = RgbImage::new(width, height);
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u32::from(pixel[3]);
        let blend = |c: u8| ((u32::from(c) * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        out.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    DynamicImage::ImageRgb8(out)
}
