//! Image codec: decode, orient, resize and encode variants
//!
//! Everything here is a pure transform from source bytes to encoded variant
//! bytes. Writing variants to disk is the folder manager's job.

use crate::config::{ImageFormat, OptimizationConfig, QualityTier, SizeTier};
use crate::error::{PipelineError, Result};
use crate::models::VariantKey;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageEncoder, ImageError, ImageReader, Limits};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;
use tracing::{debug, instrument, warn};

/// Map of produced variants keyed by tier and output format
pub type VariantSet = BTreeMap<VariantKey, EncodedVariant>;

/// One encoded output image
#[derive(Debug, Clone)]
pub struct EncodedVariant {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
}

/// Codec tuning knobs
#[derive(Debug, Clone)]
pub struct CodecOptions {
    /// Sources above this pixel count resize with a cheaper filter
    pub very_large_pixels: u64,
    /// Maximum bytes the decoder may allocate
    pub max_decode_bytes: u64,
}

impl Default for CodecOptions {
    fn default() -> Self {
        let defaults = OptimizationConfig::default();
        Self {
            very_large_pixels: defaults.very_large_pixels,
            max_decode_bytes: defaults.max_decode_bytes,
        }
    }
}

/// Stateless image optimizer
#[derive(Debug, Clone, Default)]
pub struct ImageCodec {
    options: CodecOptions,
}

impl ImageCodec {
    pub fn new(options: CodecOptions) -> Self {
        Self { options }
    }

    pub fn from_config(config: &OptimizationConfig) -> Self {
        Self::new(CodecOptions {
            very_large_pixels: config.very_large_pixels,
            max_decode_bytes: config.max_decode_bytes,
        })
    }

    /// Read a source file and produce one variant per size tier
    #[instrument(skip(self, size_tiers), fields(tiers = size_tiers.len()))]
    pub fn optimize(
        &self,
        source_path: &Path,
        target_format: ImageFormat,
        quality: QualityTier,
        size_tiers: &[SizeTier],
    ) -> Result<VariantSet> {
        let bytes = std::fs::read(source_path).map_err(|e| PipelineError::TransientIo {
            path: source_path.to_path_buf(),
            message: e.to_string(),
        })?;
        self.optimize_bytes(&bytes, source_path, target_format, quality, size_tiers)
    }

    /// Same as [`ImageCodec::optimize`] for bytes already in memory
    pub fn optimize_bytes(
        &self,
        bytes: &[u8],
        source_label: &Path,
        target_format: ImageFormat,
        quality: QualityTier,
        size_tiers: &[SizeTier],
    ) -> Result<VariantSet> {
        let output_format = effective_format(target_format, quality)?;
        let decoded = self.decode(bytes, source_label)?;

        let pixels = decoded.image.width() as u64 * decoded.image.height() as u64;
        let filter = if pixels > self.options.very_large_pixels {
            debug!(pixels, "Very large source, using fast resampling");
            FilterType::Triangle
        } else {
            FilterType::Lanczos3
        };

        let variants = size_tiers
            .par_iter()
            .map(|tier| {
                let (width, height) = fit_within(
                    decoded.image.width(),
                    decoded.image.height(),
                    tier.max_width,
                    tier.max_height,
                );
                let resized = if (width, height) == (decoded.image.width(), decoded.image.height()) {
                    None
                } else {
                    Some(decoded.image.resize_exact(width, height, filter))
                };
                let image = resized.as_ref().unwrap_or(&decoded.image);
                let bytes = encode(image, output_format, quality, decoded.icc_profile.as_deref())?;

                Ok((
                    VariantKey::new(tier.name.clone(), output_format),
                    EncodedVariant {
                        bytes,
                        width,
                        height,
                        format: output_format,
                    },
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            source = %source_label.display(),
            format = %output_format,
            count = variants.len(),
            "Encoded variants"
        );
        Ok(variants.into_iter().collect())
    }

    fn decode(&self, bytes: &[u8], source_label: &Path) -> Result<DecodedImage> {
        let detected = detect_format(bytes).ok_or_else(|| PipelineError::UnsupportedFormat {
            format: format!("unrecognized content in {}", source_label.display()),
        })?;
        let format = to_image_format(detected).ok_or_else(|| PipelineError::UnsupportedFormat {
            format: format!("{:?} (no decoder available)", detected),
        })?;

        let mut limits = Limits::default();
        limits.max_alloc = Some(self.options.max_decode_bytes);

        let mut reader = ImageReader::with_format(Cursor::new(bytes), format);
        reader.limits(limits);

        let mut decoder = reader
            .into_decoder()
            .map_err(|e| decode_error(e, source_label))?;
        let orientation = decoder.orientation().map_err(|e| decode_error(e, source_label))?;
        let (width, height) = decoder.dimensions();
        let required = decoder.total_bytes();
        if required > self.options.max_decode_bytes {
            return Err(PipelineError::OutOfMemory {
                message: format!(
                    "{}x{} image in {} needs {} bytes, limit is {}",
                    width,
                    height,
                    source_label.display(),
                    required,
                    self.options.max_decode_bytes
                ),
            });
        }
        let icc_profile = decoder.icc_profile().unwrap_or_else(|e| {
            debug!(error = %e, "Ignoring unreadable ICC profile");
            None
        });
        let mut image = DynamicImage::from_decoder(decoder).map_err(|e| decode_error(e, source_label))?;
        image.apply_orientation(orientation);

        Ok(DecodedImage { image, icc_profile })
    }
}

struct DecodedImage {
    image: DynamicImage,
    icc_profile: Option<Vec<u8>>,
}

/// Output format actually written for a target and quality tier
pub fn effective_format(target: ImageFormat, quality: QualityTier) -> Result<ImageFormat> {
    if !target.is_encodable() {
        return Err(PipelineError::Encode {
            format: target.to_string(),
            message: "format cannot be written".to_string(),
        });
    }
    if quality.is_lossless() && !target.supports_lossless() {
        return Ok(ImageFormat::Png);
    }
    Ok(target)
}

/// Largest size within the bounds that keeps the aspect ratio, never upscaling
///
/// Zero bounds or a zero-sized source still yield at least 1x1.
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    let (width, height) = (width.max(1), height.max(1));
    let (max_width, max_height) = (max_width.max(1), max_height.max(1));
    if width <= max_width && height <= max_height {
        return (width, height);
    }

    let scale = f64::min(
        max_width as f64 / width as f64,
        max_height as f64 / height as f64,
    );
    let fitted_width = ((width as f64 * scale).round() as u32).clamp(1, max_width.min(width));
    let fitted_height = ((height as f64 * scale).round() as u32).clamp(1, max_height.min(height));
    (fitted_width, fitted_height)
}

/// Detect image format from the leading magic bytes
pub fn detect_format(bytes: &[u8]) -> Option<ImageFormat> {
    if bytes.len() < 4 {
        return None;
    }

    match &bytes[..4] {
        [0xFF, 0xD8, 0xFF, _] => return Some(ImageFormat::Jpeg),
        [0x89, 0x50, 0x4E, 0x47] => return Some(ImageFormat::Png),
        [0x47, 0x49, 0x46, 0x38] => return Some(ImageFormat::Gif),
        [0x42, 0x4D, _, _] => return Some(ImageFormat::Bmp),
        b"II*\0" | b"MM\0*" => return Some(ImageFormat::Tiff),
        _ => {}
    }

    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some(ImageFormat::WebP);
    }

    // ISO-BMFF: size (4 bytes), "ftyp", major brand
    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        return match &bytes[8..12] {
            b"heic" | b"heix" | b"hevc" | b"hevx" | b"mif1" | b"msf1" => Some(ImageFormat::Heic),
            b"avif" | b"avis" => Some(ImageFormat::Avif),
            _ => None,
        };
    }

    None
}

fn to_image_format(format: ImageFormat) -> Option<image::ImageFormat> {
    match format {
        ImageFormat::Jpeg => Some(image::ImageFormat::Jpeg),
        ImageFormat::Png => Some(image::ImageFormat::Png),
        ImageFormat::WebP => Some(image::ImageFormat::WebP),
        ImageFormat::Gif => Some(image::ImageFormat::Gif),
        ImageFormat::Bmp => Some(image::ImageFormat::Bmp),
        ImageFormat::Tiff => Some(image::ImageFormat::Tiff),
        ImageFormat::Avif | ImageFormat::Heic => None,
    }
}

fn decode_error(error: ImageError, path: &Path) -> PipelineError {
    match error {
        ImageError::Limits(e) => PipelineError::OutOfMemory {
            message: format!("{} while decoding {}", e, path.display()),
        },
        ImageError::IoError(e) => PipelineError::TransientIo {
            path: path.to_path_buf(),
            message: e.to_string(),
        },
        ImageError::Unsupported(e) => PipelineError::UnsupportedFormat {
            format: e.to_string(),
        },
        other => PipelineError::Decode {
            path: path.to_path_buf(),
            message: other.to_string(),
        },
    }
}

fn encode_error(format: ImageFormat, error: impl std::fmt::Display) -> PipelineError {
    PipelineError::Encode {
        format: format.to_string(),
        message: error.to_string(),
    }
}

fn attach_icc<E: ImageEncoder>(encoder: &mut E, icc_profile: Option<&[u8]>) {
    if let Some(profile) = icc_profile {
        if let Err(e) = encoder.set_icc_profile(profile.to_vec()) {
            // The output is then interpreted as sRGB
            warn!(error = %e, "Encoder rejected ICC profile, dropping it");
        }
    }
}

/// Encode one image in the given output format
pub fn encode(
    image: &DynamicImage,
    format: ImageFormat,
    quality: QualityTier,
    icc_profile: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let keep_alpha = format.supports_transparency() && image.color().has_alpha();

    match format {
        ImageFormat::Png => {
            let image = match image {
                DynamicImage::ImageRgb32F(_) => DynamicImage::ImageRgb16(image.to_rgb16()),
                DynamicImage::ImageRgba32F(_) => DynamicImage::ImageRgba16(image.to_rgba16()),
                _ => image.clone(),
            };
            let mut encoder =
                PngEncoder::new_with_quality(&mut buf, CompressionType::Best, PngFilter::Adaptive);
            attach_icc(&mut encoder, icc_profile);
            image
                .write_with_encoder(encoder)
                .map_err(|e| encode_error(format, e))?;
        }
        ImageFormat::Jpeg => {
            let q = quality.quality().unwrap_or(100);
            let image = match image {
                DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_) => image.clone(),
                _ => DynamicImage::ImageRgb8(image.to_rgb8()),
            };
            let mut encoder = JpegEncoder::new_with_quality(&mut buf, q);
            attach_icc(&mut encoder, icc_profile);
            image
                .write_with_encoder(encoder)
                .map_err(|e| encode_error(format, e))?;
        }
        ImageFormat::WebP if quality.is_lossless() => {
            let image = if keep_alpha {
                DynamicImage::ImageRgba8(image.to_rgba8())
            } else {
                DynamicImage::ImageRgb8(image.to_rgb8())
            };
            let mut encoder = WebPEncoder::new_lossless(&mut buf);
            attach_icc(&mut encoder, icc_profile);
            image
                .write_with_encoder(encoder)
                .map_err(|e| encode_error(format, e))?;
        }
        ImageFormat::WebP => {
            let q = quality.quality().unwrap_or(100) as f32;
            let memory = if keep_alpha {
                let rgba = image.to_rgba8();
                webp::Encoder::from_rgba(rgba.as_raw(), rgba.width(), rgba.height())
                    .encode_simple(false, q)
            } else {
                let rgb = image.to_rgb8();
                webp::Encoder::from_rgb(rgb.as_raw(), rgb.width(), rgb.height())
                    .encode_simple(false, q)
            }
            .map_err(|e| encode_error(format, format!("{:?}", e)))?;
            if icc_profile.is_some() {
                debug!("Lossy WebP output carries no ICC profile, treating as sRGB");
            }
            buf.extend_from_slice(&memory);
        }
        other => {
            return Err(encode_error(other, "format cannot be written"));
        }
    }

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, RgbImage, Rgba};
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn gradient(width: u32, height: u32) -> RgbImage {
        ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    fn tiers() -> Vec<SizeTier> {
        vec![
            SizeTier::new("small", 64, 64),
            SizeTier::new("medium", 160, 120),
            SizeTier::new("large", 1000, 1000),
        ]
    }

    fn write_source(
        dir: &Path,
        name: &str,
        image: &DynamicImage,
        format: image::ImageFormat,
    ) -> std::path::PathBuf {
        let path = dir.join(name);
        image.save_with_format(&path, format).unwrap();
        path
    }

    #[test]
    fn test_fit_within_never_upscales() {
        assert_eq!(fit_within(300, 200, 400, 400), (300, 200));
        assert_eq!(fit_within(6000, 4000, 400, 400), (400, 267));
        assert_eq!(fit_within(4000, 6000, 800, 800), (533, 800));
        assert_eq!(fit_within(10000, 1, 100, 100), (100, 1));
    }

    #[test]
    fn test_detect_format_from_magic_bytes() {
        assert_eq!(detect_format(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(ImageFormat::Jpeg));
        assert_eq!(detect_format(b"\x89PNG\r\n\x1a\n"), Some(ImageFormat::Png));
        assert_eq!(detect_format(b"RIFF\0\0\0\0WEBPVP8 "), Some(ImageFormat::WebP));
        assert_eq!(detect_format(b"\0\0\0\x18ftypheic"), Some(ImageFormat::Heic));
        assert_eq!(detect_format(b"hello world"), None);
        assert_eq!(detect_format(b"ab"), None);
    }

    #[test]
    fn test_lossless_webp_is_pixel_identical() {
        let dir = tempdir().unwrap();
        let source = DynamicImage::ImageRgb8(gradient(120, 80));
        let path = write_source(dir.path(), "flat.png", &source, image::ImageFormat::Png);

        let codec = ImageCodec::default();
        let variants = codec
            .optimize(&path, ImageFormat::WebP, QualityTier::Lossless, &tiers())
            .unwrap();

        let large = &variants[&VariantKey::new("large", ImageFormat::WebP)];
        assert_eq!((large.width, large.height), (120, 80));
        let decoded = image::load_from_memory(&large.bytes).unwrap();
        assert_eq!(decoded.to_rgb8(), source.to_rgb8());
    }

    #[test]
    fn test_lossless_forces_png_for_jpeg_target() {
        let dir = tempdir().unwrap();
        let source = DynamicImage::ImageRgb8(gradient(50, 40));
        let path = write_source(dir.path(), "photo.jpg", &source, image::ImageFormat::Jpeg);
        let decoded_source = image::open(&path).unwrap();

        let codec = ImageCodec::default();
        let variants = codec
            .optimize(&path, ImageFormat::Jpeg, QualityTier::Lossless, &tiers())
            .unwrap();

        assert!(variants.keys().all(|k| k.format == ImageFormat::Png));
        let large = &variants[&VariantKey::new("large", ImageFormat::Png)];
        let output = image::load_from_memory(&large.bytes).unwrap();
        assert_eq!(output.to_rgb8(), decoded_source.to_rgb8());
    }

    #[test]
    fn test_lossy_tiers_respect_bounds() {
        let dir = tempdir().unwrap();
        let source = DynamicImage::ImageRgb8(gradient(640, 480));
        let path = write_source(dir.path(), "wide.png", &source, image::ImageFormat::Png);

        let codec = ImageCodec::default();
        let variants = codec
            .optimize(&path, ImageFormat::WebP, QualityTier::Balanced, &tiers())
            .unwrap();

        assert_eq!(variants.len(), 3);
        for tier in tiers() {
            let variant = &variants[&VariantKey::new(tier.name.clone(), ImageFormat::WebP)];
            assert!(variant.width <= tier.max_width && variant.height <= tier.max_height);
            assert!(variant.width <= 640 && variant.height <= 480);

            let decoded = image::load_from_memory(&variant.bytes).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (variant.width, variant.height));
        }
    }

    #[test]
    fn test_alpha_survives_webp_and_is_dropped_for_jpeg() {
        let image = DynamicImage::ImageRgba8(ImageBuffer::from_pixel(10, 10, Rgba([10, 20, 30, 128])));

        let webp = encode(&image, ImageFormat::WebP, QualityTier::High, None).unwrap();
        assert!(image::load_from_memory(&webp).unwrap().color().has_alpha());

        let jpeg = encode(&image, ImageFormat::Jpeg, QualityTier::High, None).unwrap();
        assert!(!image::load_from_memory(&jpeg).unwrap().color().has_alpha());
    }

    #[test]
    fn test_exif_orientation_is_applied() {
        let dir = tempdir().unwrap();
        let source = DynamicImage::ImageRgb8(gradient(40, 20));
        let path = write_source(dir.path(), "rotated.jpg", &source, image::ImageFormat::Jpeg);

        // Splice an APP1 segment declaring orientation 6 (rotate 90° clockwise)
        let mut bytes = std::fs::read(&path).unwrap();
        let exif: [u8; 36] = [
            0xFF, 0xE1, 0x00, 0x22, b'E', b'x', b'i', b'f', 0, 0, // APP1 header
            b'M', b'M', 0x00, 0x2A, 0x00, 0x00, 0x00, 0x08, // TIFF header
            0x00, 0x01, // one IFD entry
            0x01, 0x12, 0x00, 0x03, 0x00, 0x00, 0x00, 0x01, 0x00, 0x06, 0x00, 0x00, // orientation
            0x00, 0x00, 0x00, 0x00, // next IFD
        ];
        bytes.splice(2..2, exif);
        std::fs::write(&path, &bytes).unwrap();

        let codec = ImageCodec::default();
        let variants = codec
            .optimize(&path, ImageFormat::Png, QualityTier::Lossless, &tiers())
            .unwrap();
        let large = &variants[&VariantKey::new("large", ImageFormat::Png)];
        assert_eq!((large.width, large.height), (20, 40));
    }

    #[test]
    fn test_unsupported_and_corrupt_inputs() {
        let dir = tempdir().unwrap();
        let codec = ImageCodec::default();

        let text = dir.path().join("notes.jpg");
        std::fs::write(&text, b"definitely not an image").unwrap();
        let err = codec
            .optimize(&text, ImageFormat::WebP, QualityTier::Balanced, &tiers())
            .unwrap_err();
        assert_eq!(err.error_type(), "unsupported_format");
        assert!(!err.is_retryable());

        let heic = dir.path().join("phone.heic");
        std::fs::write(&heic, b"\0\0\0\x18ftypheic\0\0\0\0mif1heic").unwrap();
        let err = codec
            .optimize(&heic, ImageFormat::WebP, QualityTier::Balanced, &tiers())
            .unwrap_err();
        assert_eq!(err.error_type(), "unsupported_format");

        let truncated = dir.path().join("truncated.png");
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(gradient(64, 64))
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes.truncate(bytes.len() / 2);
        std::fs::write(&truncated, &bytes).unwrap();
        let err = codec
            .optimize(&truncated, ImageFormat::WebP, QualityTier::Balanced, &tiers())
            .unwrap_err();
        assert!(err.is_asset_fatal() || err.is_retryable());

        let missing = dir.path().join("missing.png");
        let err = codec
            .optimize(&missing, ImageFormat::WebP, QualityTier::Balanced, &tiers())
            .unwrap_err();
        assert_eq!(err.error_type(), "transient_io");
    }

    #[test]
    fn test_decode_limit_maps_to_out_of_memory() {
        let dir = tempdir().unwrap();
        let source = DynamicImage::ImageRgb8(gradient(256, 256));
        let path = write_source(dir.path(), "big.png", &source, image::ImageFormat::Png);

        let codec = ImageCodec::new(CodecOptions {
            very_large_pixels: 1,
            max_decode_bytes: 1024,
        });
        let err = codec
            .optimize(&path, ImageFormat::WebP, QualityTier::Balanced, &tiers())
            .unwrap_err();
        assert_eq!(err.error_type(), "out_of_memory");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_decode_limit_at_exact_size_decodes() {
        let dir = tempdir().unwrap();
        let source = DynamicImage::ImageRgb8(gradient(64, 32));
        let path = write_source(dir.path(), "exact.png", &source, image::ImageFormat::Png);

        let codec = ImageCodec::new(CodecOptions {
            very_large_pixels: 1,
            max_decode_bytes: 64 * 32 * 3,
        });
        assert!(codec
            .optimize(&path, ImageFormat::WebP, QualityTier::Balanced, &tiers())
            .is_ok());
    }

    #[test]
    fn test_fit_within_tolerates_zero_bounds() {
        assert_eq!(fit_within(300, 200, 0, 400), (1, 1));
        assert_eq!(fit_within(300, 200, 0, 0), (1, 1));
        assert_eq!(fit_within(0, 200, 100, 100), (1, 100));
    }

    #[test]
    fn test_unencodable_target_is_rejected() {
        assert!(effective_format(ImageFormat::Gif, QualityTier::High).is_err());
        assert_eq!(
            effective_format(ImageFormat::WebP, QualityTier::Lossless).unwrap(),
            ImageFormat::WebP
        );
    }

    proptest! {
        #[test]
        fn prop_fit_within_respects_bounds(
            width in 1u32..20_000,
            height in 1u32..20_000,
            max_width in 1u32..4_000,
            max_height in 1u32..4_000,
        ) {
            let (w, h) = fit_within(width, height, max_width, max_height);
            prop_assert!(w >= 1 && h >= 1);
            prop_assert!(w <= max_width && h <= max_height || (w, h) == (width, height));
            prop_assert!(w <= width && h <= height);
        }
    }
}
