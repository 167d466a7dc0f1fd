//! CPU-bound preprocessing applied to each record before batching.
//!
//! The default step decodes the record's `img_data` data URL, fully decodes
//! the image (which catches truncated and corrupt payloads), shrinks it to a
//! thumbnail and re-encodes it as RGB JPEG. Records that fail are dropped by
//! the producer and counted; they never fail the batch.

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use serde_json::Value;

use crate::config::PreprocessConfig;
use crate::models::{Record, WorkItem};

/// Turns a raw [`Record`] into the [`WorkItem`] shipped to workers.
///
/// Runs on the preprocessing pool, one call per record.
pub trait Preprocess: Send + Sync {
    fn prepare(&self, record: &Record) -> Result<WorkItem>;
}

/// Short lowercase name of a supported container.
pub fn format_name(format: ImageFormat) -> Option<&'static str> {
    match format {
        ImageFormat::Jpeg => Some("jpeg"),
        ImageFormat::Png => Some("png"),
        ImageFormat::Gif => Some("gif"),
        ImageFormat::WebP => Some("webp"),
        _ => None,
    }
}

/// Decode `bytes` completely. Fails on unknown, corrupt or truncated data.
pub fn decode_image(bytes: &[u8]) -> Result<(ImageFormat, DynamicImage)> {
    let format = image::guess_format(bytes).context("unrecognized image data")?;
    if format_name(format).is_none() {
        bail!("unsupported image format {:?}", format);
    }
    let img = image::load_from_memory_with_format(bytes, format)
        .with_context(|| format!("corrupt {:?} data ({} bytes)", format, bytes.len()))?;
    Ok((format, img))
}

/// Check that `bytes` is a decodable image and name its container.
pub fn verify_image(bytes: &[u8]) -> Result<&'static str> {
    let (format, _) = decode_image(bytes)?;
    format_name(format).ok_or_else(|| anyhow!("unsupported image format {:?}", format))
}

/// Fit `img` inside `max_side`×`max_side` (never enlarging) and encode it as
/// RGB JPEG.
pub fn shrink_and_encode(img: &DynamicImage, max_side: u32, quality: u8) -> Result<Vec<u8>> {
    let resized;
    let img = if img.width() > max_side || img.height() > max_side {
        resized = img.resize(max_side, max_side, FilterType::Lanczos3);
        &resized
    } else {
        img
    };

    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(&rgb)
        .context("JPEG encoding failed")?;
    Ok(out)
}

const DATA_URL_PREFIXES: [&str; 2] = ["data:image/jpeg;base64,", "data:image/png;base64,"];

/// Decode a `data:image/…;base64,` URL into raw bytes.
pub fn decode_data_url(url: &str) -> Result<Vec<u8>> {
    let encoded = DATA_URL_PREFIXES
        .iter()
        .find_map(|prefix| url.strip_prefix(prefix))
        .ok_or_else(|| {
            let head: String = url.chars().take(15).collect();
            anyhow!("unsupported data URL: {:?}", head)
        })?;
    Ok(STANDARD.decode(encoded.trim())?)
}

/// Default preprocessing: data-URL decoding, full image decode, thumbnail.
#[derive(Debug, Clone)]
pub struct DataUrlImage {
    field: String,
    max_bytes: usize,
    thumbnail_px: u32,
    jpeg_quality: u8,
}

impl Default for DataUrlImage {
    fn default() -> Self {
        Self::from_config(&PreprocessConfig::default())
    }
}

impl DataUrlImage {
    pub fn from_config(config: &PreprocessConfig) -> Self {
        Self {
            field: config.field.clone(),
            max_bytes: config.max_bytes,
            thumbnail_px: config.thumbnail_px,
            jpeg_quality: config.jpeg_quality,
        }
    }
}

impl Preprocess for DataUrlImage {
    fn prepare(&self, record: &Record) -> Result<WorkItem> {
        let url = record
            .payload
            .get(&self.field)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("{}: missing `{}`", record.id, self.field))?;

        let data = decode_data_url(url)?;
        if data.len() > self.max_bytes {
            bail!("{}: image is {} bytes (limit {})", record.id, data.len(), self.max_bytes);
        }
        let (_, img) = decode_image(&data).with_context(|| record.id.clone())?;

        Ok(WorkItem {
            id: record.id.clone(),
            data: shrink_and_encode(&img, self.thumbnail_px, self.jpeg_quality)?,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use serde_json::json;
    use std::io::Cursor;

    fn encode(img: RgbImage, format: ImageFormat) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img).write_to(&mut buf, format).unwrap();
        buf.into_inner()
    }

    /// A real PNG of `w`×`h` whose pixels derive from `seed`.
    pub(crate) fn png_sized(seed: &[u8], w: u32, h: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(w, h, |x, y| {
            let s = seed.get(((x + y) as usize) % seed.len().max(1)).copied().unwrap_or(0);
            Rgb([s, (x * 7) as u8, (y * 13) as u8])
        });
        encode(img, ImageFormat::Png)
    }

    pub(crate) fn tiny_png(seed: &[u8]) -> Vec<u8> {
        png_sized(seed, 8, 8)
    }

    pub(crate) fn png_data_url(seed: &[u8]) -> String {
        format!("data:image/png;base64,{}", STANDARD.encode(tiny_png(seed)))
    }

    fn record(payload: serde_json::Value) -> Record {
        Record {
            id: "src_1".into(),
            content_hash: "ab".into(),
            payload: payload.as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn verifies_real_images() {
        assert_eq!(verify_image(&tiny_png(b"abc")).unwrap(), "png");
        let jpeg = encode(RgbImage::new(4, 4), ImageFormat::Jpeg);
        assert_eq!(verify_image(&jpeg).unwrap(), "jpeg");
        assert!(verify_image(b"hello").is_err());
    }

    #[test]
    fn undecodable_payloads_fail_verification() {
        // Right magic bytes and end marker, no image in between.
        assert!(verify_image(&[0xFF, 0xD8, 0xFF, 0x00, 0x13, 0x37, 0xDE, 0xAD, 0xFF, 0xD9]).is_err());

        let png = png_sized(b"pixels", 64, 64);
        assert!(verify_image(&png[..png.len() / 2]).is_err());
    }

    #[test]
    fn prepare_reencodes_as_jpeg() {
        let rec = record(json!({"_id": "src_1", "img_data": png_data_url(b"abc")}));
        let item = DataUrlImage::default().prepare(&rec).unwrap();
        assert_eq!(item.id, "src_1");

        let (format, img) = decode_image(&item.data).unwrap();
        assert_eq!(format, ImageFormat::Jpeg);
        assert_eq!((img.width(), img.height()), (8, 8));
    }

    #[test]
    fn prepare_shrinks_large_images() {
        let big = png_sized(b"wide", 640, 320);
        let url = format!("data:image/png;base64,{}", STANDARD.encode(&big));
        let rec = record(json!({"_id": "src_1", "img_data": url}));

        let item = DataUrlImage::default().prepare(&rec).unwrap();
        let (_, img) = decode_image(&item.data).unwrap();
        assert_eq!((img.width(), img.height()), (300, 150));

        let cfg = PreprocessConfig {
            thumbnail_px: 64,
            ..PreprocessConfig::default()
        };
        let item = DataUrlImage::from_config(&cfg).prepare(&rec).unwrap();
        let (_, img) = decode_image(&item.data).unwrap();
        assert_eq!((img.width(), img.height()), (64, 32));
    }

    #[test]
    fn prepare_rejects_bad_payloads() {
        let pre = DataUrlImage::default();
        assert!(pre.prepare(&record(json!({"_id": "src_1"}))).is_err());
        assert!(pre
            .prepare(&record(json!({"_id": "src_1", "img_data": "data:text/plain;base64,aGk="})))
            .is_err());
        assert!(pre
            .prepare(&record(json!({"_id": "src_1", "img_data": "data:image/png;base64,!!!"})))
            .is_err());
        let junk = format!("data:image/jpeg;base64,{}", STANDARD.encode([0xFF, 0xD8, 0xFF, 0xD9]));
        assert!(pre.prepare(&record(json!({"_id": "src_1", "img_data": junk}))).is_err());

        let small = DataUrlImage::from_config(&PreprocessConfig {
            max_bytes: 4,
            ..PreprocessConfig::default()
        });
        let rec = record(json!({"_id": "src_1", "img_data": png_data_url(b"abc")}));
        assert!(small.prepare(&rec).is_err());
    }
}
