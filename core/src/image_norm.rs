//! Image normalization (component L): decode a common raster format and
//! re-encode it as PNG before sending, so the receiver always writes a single
//! known format back to its clipboard.

use image::{ImageFormat, ImageReader};
use std::io::Cursor;

/// The result of normalizing outbound image bytes: either the re-encoded PNG
/// with its dimensions, or the original bytes with the caller's declared
/// format when decoding failed.
pub enum Normalized {
    Png { width: u32, height: u32, bytes: Vec<u8> },
    Original { format: String, bytes: Vec<u8> },
}

/// Decodes `bytes` (PNG/JPEG/GIF/BMP/WEBP, guessed from content) and
/// re-encodes as PNG with default compression. Falls back to the original
/// bytes, tagged with `declared_format`, if decoding fails.
pub fn normalize_to_png(bytes: &[u8], declared_format: &str) -> Normalized {
    let Ok(reader) = ImageReader::new(Cursor::new(bytes)).with_guessed_format() else {
        return Normalized::Original { format: declared_format.to_string(), bytes: bytes.to_vec() };
    };
    let Ok(decoded) = reader.decode() else {
        return Normalized::Original { format: declared_format.to_string(), bytes: bytes.to_vec() };
    };

    let mut out = Cursor::new(Vec::new());
    if decoded.write_to(&mut out, ImageFormat::Png).is_err() {
        return Normalized::Original { format: declared_format.to_string(), bytes: bytes.to_vec() };
    }

    Normalized::Png { width: decoded.width(), height: decoded.height(), bytes: out.into_inner() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_png(w: u32, h: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(w, h, image::Rgb([10, 20, 30]));
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img).write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn valid_png_round_trips_through_normalization() {
        let bytes = make_png(4, 3);
        match normalize_to_png(&bytes, "png") {
            Normalized::Png { width, height, bytes } => {
                assert_eq!((width, height), (4, 3));
                assert!(!bytes.is_empty());
            }
            Normalized::Original { .. } => panic!("expected a decoded PNG"),
        }
    }

    #[test]
    fn garbage_bytes_fall_back_to_original() {
        let bytes = vec![0u8, 1, 2, 3, 4];
        match normalize_to_png(&bytes, "weird") {
            Normalized::Original { format, bytes: b } => {
                assert_eq!(format, "weird");
                assert_eq!(b, bytes);
            }
            Normalized::Png { .. } => panic!("garbage should not decode"),
        }
    }
}
