//! The resize engine: pixel geometry plus resample/crop execution.
//!
//! The engine holds one decoded raster and the codec it was probed as.
//! All operations are synchronous and CPU-bound; callers that live in an
//! async context are expected to wrap the decode/resize/encode sequence in
//! [`tokio::task::spawn_blocking`].
//!
//! Geometry is computed by pure functions so the numeric edge cases
//! (aspect-ratio rounding, crop centering) are testable without touching
//! any raster.

use std::io::Cursor;

use anyhow::anyhow;
use image::codecs::png::{
    CompressionType, FilterType as PngFilterType, PngEncoder,
};
use image::imageops::{self, FilterType};
use image::{
    ColorType, DynamicImage, ImageEncoder, ImageFormat, ImageOutputFormat,
    Rgba, RgbaImage,
};

use crate::error::{Error, Result};
use crate::sizespec::ScaleMode;

/// The fixed set of codecs the engine accepts. Anything else is rejected
/// at decode time; adding a format means adding a variant here, not
/// touching call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageCodec {
    Jpeg,
    Png,
    Gif,
}

impl ImageCodec {
    fn from_format(format: ImageFormat) -> Result<Self> {
        match format {
            ImageFormat::Jpeg => Ok(Self::Jpeg),
            ImageFormat::Png => Ok(Self::Png),
            ImageFormat::Gif => Ok(Self::Gif),
            _ => Err(Error::UnsupportedFormat),
        }
    }

    /// The MIME type for this codec.
    pub fn mime(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
        }
    }

    /// The file extension for this codec, without the dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
        }
    }
}

/// Resolved output geometry for one resize call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Width of the resampled canvas.
    pub width: u32,
    /// Height of the resampled canvas.
    pub height: u32,
    /// Center-crop applied after resampling, if any.
    pub crop: Option<CropBox>,
}

/// A crop window inside the resampled canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Resolve [`ScaleMode::Auto`] to a concrete mode from the source
/// orientation, possibly rewriting the target dimensions (the square-source
/// case collapses to `Exact` on the larger requested side).
fn resolve_auto(
    width: Option<u32>,
    height: Option<u32>,
    orig_w: u32,
    orig_h: u32,
) -> (ScaleMode, Option<u32>, Option<u32>) {
    match (width, height) {
        (Some(_), None) => (ScaleMode::Landscape, width, height),
        (None, Some(_)) => (ScaleMode::Portrait, width, height),
        (Some(w), Some(h)) => {
            if orig_h < orig_w {
                (ScaleMode::Landscape, width, height)
            } else if orig_h > orig_w {
                (ScaleMode::Portrait, width, height)
            } else if h < w {
                (ScaleMode::Exact, Some(w), Some(w))
            } else {
                (ScaleMode::Exact, Some(h), Some(h))
            }
        }
        // Unreachable behind validation, but keep it total.
        (None, None) => (ScaleMode::Auto, None, None),
    }
}

/// Compute the output geometry for a resize request.
///
/// Rounding policy: ratio math is done in `f64` and rounded
/// half-away-from-zero ([`f64::round`]); crop offsets truncate, matching
/// the integer pixel coordinates of the resampling step.
pub fn compute_geometry(
    width: Option<u32>,
    height: Option<u32>,
    mode: ScaleMode,
    orig_w: u32,
    orig_h: u32,
) -> Result<Geometry> {
    // Zero means "unconstrained", same as absent.
    let width = width.filter(|w| *w > 0);
    let height = height.filter(|h| *h > 0);

    if matches!(mode, ScaleMode::Exact | ScaleMode::Crop)
        && (width.is_none() || height.is_none())
    {
        return Err(Error::InvalidDimensions);
    }
    if width.is_none() && height.is_none() {
        return Err(Error::InvalidDimensions);
    }

    let (mode, width, height) = if mode == ScaleMode::Auto {
        resolve_auto(width, height, orig_w, orig_h)
    } else {
        (mode, width, height)
    };

    let geometry = match mode {
        ScaleMode::Exact => Geometry {
            // Both present: validated above, and resolve_auto only
            // produces Exact with both sides set.
            width: width.ok_or(Error::InvalidDimensions)?,
            height: height.ok_or(Error::InvalidDimensions)?,
            crop: None,
        },
        ScaleMode::Portrait => {
            let h = height.ok_or(Error::InvalidDimensions)?;
            let w = (h as f64 * (orig_w as f64 / orig_h as f64)).round();
            Geometry {
                width: (w as u32).max(1),
                height: h,
                crop: None,
            }
        }
        ScaleMode::Landscape => {
            let w = width.ok_or(Error::InvalidDimensions)?;
            let h = (w as f64 * (orig_h as f64 / orig_w as f64)).round();
            Geometry {
                width: w,
                height: (h as u32).max(1),
                crop: None,
            }
        }
        ScaleMode::Crop => {
            let given_w = width.ok_or(Error::InvalidDimensions)?;
            let given_h = height.ok_or(Error::InvalidDimensions)?;

            // Scale factor that makes the source fully cover the box.
            let ratio = (given_h as f64 / orig_h as f64)
                .max(given_w as f64 / orig_w as f64);
            let scaled_w = ((orig_w as f64 * ratio).round() as u32).max(1);
            let scaled_h = ((orig_h as f64 * ratio).round() as u32).max(1);

            // Center along the longer scaled axis, zero along the other.
            let (x, y) = if scaled_w > scaled_h {
                let x = scaled_w as f64 / 2.0 - given_w as f64 / 2.0;
                (x as u32, 0)
            } else {
                let y = scaled_h as f64 / 2.0 - given_h as f64 / 2.0;
                (0, y as u32)
            };

            Geometry {
                width: scaled_w,
                height: scaled_h,
                crop: Some(CropBox {
                    x,
                    y,
                    width: given_w.min(scaled_w),
                    height: given_h.min(scaled_h),
                }),
            }
        }
        ScaleMode::Auto => return Err(Error::InvalidDimensions),
    };

    Ok(geometry)
}

/// Map an encode quality (1..=100) onto the 0..=9 PNG compression-level
/// scale: `level = 9 - round(quality / 100 * 9)`.
pub fn png_compression_level(quality: u8) -> u8 {
    9 - (quality as f64 / 100.0 * 9.0).round() as u8
}

/// One decoded raster image plus its detected codec.
///
/// The decoded buffer is exclusively owned by the engine and released when
/// the engine goes out of scope.
pub struct ResizeEngine {
    raster: DynamicImage,
    codec: ImageCodec,
}

impl ResizeEngine {
    /// Probe the format from the content (never the filename) and decode
    /// into an addressable raster.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let reader = image::io::Reader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| Error::Decode(anyhow!(e)))?;
        let codec = reader
            .format()
            .ok_or(Error::UnsupportedFormat)
            .and_then(ImageCodec::from_format)?;
        let raster = reader.decode().map_err(|e| Error::Decode(anyhow!(e)))?;
        Ok(Self { raster, codec })
    }

    /// Intrinsic width of the current raster, pixels.
    pub fn width(&self) -> u32 {
        self.raster.width()
    }

    /// Intrinsic height of the current raster, pixels.
    pub fn height(&self) -> u32 {
        self.raster.height()
    }

    /// Long side over short side; always >= 1.
    pub fn ratio(&self) -> f64 {
        let w = self.width() as f64;
        let h = self.height() as f64;
        if w > h {
            w / h
        } else {
            h / w
        }
    }

    /// The codec detected at decode time.
    pub fn codec(&self) -> ImageCodec {
        self.codec
    }

    /// Resample (and for [`ScaleMode::Crop`], center-crop) the raster in
    /// place. Returns `self` for chaining.
    ///
    /// The resampled canvas starts opaque white, which flattens any
    /// transparency before a lossy encode; JPEG has no alpha channel.
    pub fn resize(
        &mut self,
        width: Option<u32>,
        height: Option<u32>,
        mode: ScaleMode,
    ) -> Result<&mut Self> {
        let geometry =
            compute_geometry(width, height, mode, self.width(), self.height())?;

        let resized = self
            .raster
            .resize_exact(geometry.width, geometry.height, FilterType::Triangle)
            .to_rgba8();
        let mut canvas = RgbaImage::from_pixel(
            geometry.width,
            geometry.height,
            Rgba([255, 255, 255, 255]),
        );
        imageops::overlay(&mut canvas, &resized, 0, 0);
        let mut flat = DynamicImage::ImageRgba8(canvas).to_rgb8();

        if let Some(c) = geometry.crop {
            flat = imageops::crop_imm(&flat, c.x, c.y, c.width, c.height)
                .to_image();
        }

        self.raster = DynamicImage::ImageRgb8(flat);
        Ok(self)
    }

    /// Serialize the current raster.
    ///
    /// `format` defaults to the codec detected at decode time. Quality is
    /// clamped to 1..=100; JPEG uses it directly, PNG goes through
    /// [`png_compression_level`], GIF ignores it.
    pub fn encode(
        &self,
        format: Option<ImageCodec>,
        quality: u8,
    ) -> Result<Vec<u8>> {
        let codec = format.unwrap_or(self.codec);
        let quality = quality.clamp(1, 100);
        let mut cursor = Cursor::new(Vec::new());

        match codec {
            ImageCodec::Jpeg => self
                .raster
                .write_to(&mut cursor, ImageOutputFormat::Jpeg(quality)),
            ImageCodec::Gif => {
                self.raster.write_to(&mut cursor, ImageOutputFormat::Gif)
            }
            ImageCodec::Png => {
                // The png codec exposes named compression tiers, not the
                // numeric 0..=9 scale; quantize onto the nearest tier.
                let compression = match png_compression_level(quality) {
                    0..=1 => CompressionType::Fast,
                    2..=7 => CompressionType::Default,
                    _ => CompressionType::Best,
                };
                let rgb = self.raster.to_rgb8();
                PngEncoder::new_with_quality(
                    &mut cursor,
                    compression,
                    PngFilterType::Adaptive,
                )
                .write_image(
                    rgb.as_raw(),
                    rgb.width(),
                    rgb.height(),
                    ColorType::Rgb8,
                )
            }
        }
        .map_err(|e| Error::GenerationFailed(anyhow!(e)))?;

        Ok(cursor.into_inner())
    }
}
