//! Frame classification and decoding.
//!
//! Every delivered frame is classified by its declared message type and
//! payload shape into exactly one [`MessageClass`], then decoded into a
//! [`DecodedFrame`] suitable for display:
//!
//! | Class | Decoded form |
//! |-------|--------------|
//! | `Image` | PNG (base64) with dimensions and source encoding |
//! | `Text` | The string field |
//! | `Other` | Compact JSON dump |
//!
//! Decoding never fails outward: a malformed payload becomes
//! [`DecodedFrame::Undecodable`] and the subscription keeps running.
//!
//! # Supported image encodings
//!
//! Raw `sensor_msgs/Image`: `rgb8`, `bgr8`, `rgba8`, `bgra8`, `mono8`, `nv12`.
//! `sensor_msgs/CompressedImage`: any format the `image` crate reads
//! (`png`, `jpeg`).

// ============================================================================
// Imports
// ============================================================================

use std::io::Cursor;
use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as Base64Standard;
use image::{DynamicImage, GenericImageView, GrayImage, ImageFormat, RgbImage};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// `package/Type` (ROS 1) or `package/msg/Type` (ROS 2).
static DESCRIPTOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<package>[A-Za-z][A-Za-z0-9_]*)/(?:msg/)?(?P<name>[A-Za-z][A-Za-z0-9_]*)$")
        .unwrap_or_else(|e| unreachable!("descriptor pattern is valid: {e}"))
});

// ============================================================================
// MessageClass
// ============================================================================

/// Display class of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageClass {
    /// Pixel blob with encoding and dimensions.
    Image,
    /// Single text field.
    Text,
    /// Anything else, rendered as a generic dump.
    Other,
}

// ============================================================================
// DecodedFrame
// ============================================================================

/// An image converted for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedImage {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Source encoding (`rgb8`, `nv12`, `jpeg`, ...).
    pub encoding: String,
    /// PNG bytes, base64-encoded.
    pub png_base64: String,
}

/// Display form of one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DecodedFrame {
    /// Decoded image.
    Image(DecodedImage),
    /// Text payload.
    Text {
        /// The text.
        text: String,
    },
    /// Generic JSON dump.
    Dump {
        /// Compact JSON.
        json: String,
    },
    /// Payload could not be decoded for its class.
    Undecodable {
        /// Class the frame was assigned.
        class: MessageClass,
        /// Why decoding failed.
        reason: String,
    },
}

impl DecodedFrame {
    /// Returns `true` if decoding failed.
    #[inline]
    #[must_use]
    pub fn is_undecodable(&self) -> bool {
        matches!(self, Self::Undecodable { .. })
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Splits a type descriptor into `(package, name)`.
///
/// Returns `None` for descriptors that match neither ROS naming form.
#[must_use]
pub fn parse_descriptor(message_type: &str) -> Option<(&str, &str)> {
    let caps = DESCRIPTOR.captures(message_type.trim())?;
    let package = caps.name("package")?.as_str();
    let name = caps.name("name")?.as_str();
    Some((package, name))
}

/// Classifies a frame.
///
/// The declared type wins; payload shape is consulted only for unknown
/// descriptors. Total and deterministic.
#[must_use]
pub fn classify(message_type: &str, payload: &Value) -> MessageClass {
    match parse_descriptor(message_type) {
        Some(("sensor_msgs", "Image" | "CompressedImage")) => return MessageClass::Image,
        Some(("std_msgs", "String")) => return MessageClass::Text,
        _ => {}
    }

    let Some(fields) = payload.as_object() else {
        return MessageClass::Other;
    };

    if fields.contains_key("data")
        && (fields.contains_key("encoding") || fields.contains_key("format"))
    {
        return MessageClass::Image;
    }

    if fields.len() == 1 && fields.get("data").is_some_and(Value::is_string) {
        return MessageClass::Text;
    }

    MessageClass::Other
}

// ============================================================================
// Decoding
// ============================================================================

/// Decodes a frame for display.
///
/// Never fails; errors are reported as [`DecodedFrame::Undecodable`].
#[must_use]
pub fn decode(message_type: &str, payload: &Value) -> DecodedFrame {
    let class = classify(message_type, payload);

    let decoded = match class {
        MessageClass::Image => decode_image(payload).map(DecodedFrame::Image),
        MessageClass::Text => decode_text(payload).map(|text| DecodedFrame::Text { text }),
        MessageClass::Other => Ok(DecodedFrame::Dump {
            json: payload.to_string(),
        }),
    };

    decoded.unwrap_or_else(|e| {
        debug!(message_type, ?class, error = %e, "Frame undecodable");
        DecodedFrame::Undecodable {
            class,
            reason: e.to_string(),
        }
    })
}

fn decode_text(payload: &Value) -> Result<String> {
    payload
        .get("data")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::decode("text frame has no string data field"))
}

fn decode_image(payload: &Value) -> Result<DecodedImage> {
    let data = payload
        .get("data")
        .ok_or_else(|| Error::decode("image frame has no data field"))?;
    let bytes = blob_bytes(data)?;

    let encoding = payload.get("encoding").and_then(Value::as_str);
    let format = payload.get("format").and_then(Value::as_str);

    match (encoding, format) {
        (Some(encoding), _) => decode_raw(payload, encoding, &bytes),
        (None, Some(format)) => decode_compressed(format, &bytes),
        (None, None) => Err(Error::decode("image frame has no encoding")),
    }
}

/// Reads a `uint8[]` field, which rosbridge sends as base64 or as an array.
fn blob_bytes(data: &Value) -> Result<Vec<u8>> {
    match data {
        Value::String(encoded) => Base64Standard
            .decode(encoded)
            .map_err(|e| Error::decode(format!("invalid base64 image data: {e}"))),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|b| u8::try_from(b).ok())
                    .ok_or_else(|| Error::decode("image data array holds a non-byte value"))
            })
            .collect(),
        _ => Err(Error::decode("image data is neither base64 nor a byte array")),
    }
}

fn dimension(payload: &Value, key: &str) -> Result<u32> {
    payload
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .filter(|v| *v > 0)
        .ok_or_else(|| Error::decode(format!("image {key} missing or zero")))
}

fn decode_raw(payload: &Value, encoding: &str, bytes: &[u8]) -> Result<DecodedImage> {
    let width = dimension(payload, "width")?;
    let height = dimension(payload, "height")?;
    let step = payload
        .get("step")
        .and_then(Value::as_u64)
        .and_then(|s| usize::try_from(s).ok());

    let image = match encoding {
        "rgb8" => DynamicImage::ImageRgb8(packed_rgb(bytes, width, height, step, 3, [0, 1, 2])?),
        "bgr8" => DynamicImage::ImageRgb8(packed_rgb(bytes, width, height, step, 3, [2, 1, 0])?),
        "rgba8" => DynamicImage::ImageRgb8(packed_rgb(bytes, width, height, step, 4, [0, 1, 2])?),
        "bgra8" => DynamicImage::ImageRgb8(packed_rgb(bytes, width, height, step, 4, [2, 1, 0])?),
        "mono8" => DynamicImage::ImageLuma8(mono(bytes, width, height, step)?),
        "nv12" => DynamicImage::ImageRgb8(nv12_to_rgb(bytes, width, height)?),
        other => return Err(Error::decode(format!("unsupported image encoding: {other}"))),
    };

    Ok(DecodedImage {
        width,
        height,
        encoding: encoding.to_string(),
        png_base64: encode_png(&image)?,
    })
}

fn decode_compressed(format: &str, bytes: &[u8]) -> Result<DecodedImage> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| Error::decode(format!("failed to load {format} image: {e}")))?;
    let (width, height) = image.dimensions();

    Ok(DecodedImage {
        width,
        height,
        encoding: format.to_string(),
        png_base64: encode_png(&image)?,
    })
}

/// Returns the row stride and checks the buffer covers `height` rows.
fn row_stride(
    len: usize,
    width: u32,
    height: u32,
    step: Option<usize>,
    channels: usize,
) -> Result<usize> {
    let min_row = (width as usize)
        .checked_mul(channels)
        .ok_or_else(|| Error::decode("image row size overflows"))?;
    let stride = step.unwrap_or(min_row);
    if stride < min_row {
        return Err(Error::decode(format!(
            "image step {stride} shorter than row of {min_row} bytes"
        )));
    }
    let needed = stride
        .checked_mul(height as usize - 1)
        .and_then(|n| n.checked_add(min_row))
        .ok_or_else(|| Error::decode("image size overflows"))?;
    if len < needed {
        return Err(Error::decode(format!(
            "image data holds {len} bytes, expected at least {needed}"
        )));
    }
    Ok(stride)
}

fn packed_rgb(
    bytes: &[u8],
    width: u32,
    height: u32,
    step: Option<usize>,
    channels: usize,
    order: [usize; 3],
) -> Result<RgbImage> {
    let stride = row_stride(bytes.len(), width, height, step, channels)?;
    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);

    for row in bytes.chunks(stride).take(height as usize) {
        for pixel in row[..width as usize * channels].chunks_exact(channels) {
            rgb.extend(order.iter().map(|&i| pixel[i]));
        }
    }

    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| Error::decode("image buffer does not match dimensions"))
}

fn mono(bytes: &[u8], width: u32, height: u32, step: Option<usize>) -> Result<GrayImage> {
    let stride = row_stride(bytes.len(), width, height, step, 1)?;
    let mut luma = Vec::with_capacity(width as usize * height as usize);

    for row in bytes.chunks(stride).take(height as usize) {
        luma.extend_from_slice(&row[..width as usize]);
    }

    GrayImage::from_raw(width, height, luma)
        .ok_or_else(|| Error::decode("image buffer does not match dimensions"))
}

/// Converts NV12 (Y plane, then interleaved UV at half resolution) to RGB
/// using BT.601 limited-range coefficients.
fn nv12_to_rgb(bytes: &[u8], width: u32, height: u32) -> Result<RgbImage> {
    let (w, h) = (width as usize, height as usize);
    let chroma_width = w.div_ceil(2) * 2;
    let luma_len = w
        .checked_mul(h)
        .ok_or_else(|| Error::decode("nv12 size overflows"))?;
    let needed = chroma_width
        .checked_mul(h.div_ceil(2))
        .and_then(|n| n.checked_add(luma_len))
        .ok_or_else(|| Error::decode("nv12 size overflows"))?;
    if bytes.len() < needed {
        return Err(Error::decode(format!(
            "nv12 data holds {} bytes, expected at least {needed}",
            bytes.len()
        )));
    }

    let (luma, chroma) = bytes.split_at(luma_len);
    let mut rgb = Vec::with_capacity(luma_len * 3);

    for y in 0..h {
        for x in 0..w {
            let c = i32::from(luma[y * w + x]) - 16;
            let uv = (y / 2) * chroma_width + (x / 2) * 2;
            let d = i32::from(chroma[uv]) - 128;
            let e = i32::from(chroma[uv + 1]) - 128;

            rgb.push(clamp_channel((298 * c + 409 * e + 128) >> 8));
            rgb.push(clamp_channel((298 * c - 100 * d - 208 * e + 128) >> 8));
            rgb.push(clamp_channel((298 * c + 516 * d + 128) >> 8));
        }
    }

    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| Error::decode("image buffer does not match dimensions"))
}

#[inline]
fn clamp_channel(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

fn encode_png(image: &DynamicImage) -> Result<String> {
    let mut output = Cursor::new(Vec::new());
    image
        .write_to(&mut output, ImageFormat::Png)
        .map_err(|e| Error::decode(format!("failed to encode PNG: {e}")))?;
    Ok(Base64Standard.encode(output.into_inner()))
}

// ============================================================================
// Tests
// ============================================================================
