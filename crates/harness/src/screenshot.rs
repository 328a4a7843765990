//! In-memory screenshot captures

use chrono::{DateTime, Utc};
use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder, RgbaImage};
use sha2::{Digest, Sha256};

use crate::case::CaseId;
use crate::error::HarnessResult;

/// A decoded capture of the browser viewport
#[derive(Debug, Clone)]
pub struct Screenshot {
    /// Case the capture belongs to
    pub case: CaseId,

    /// When the capture was taken
    pub captured_at: DateTime<Utc>,

    /// RGBA pixels
    pub image: RgbaImage,
}

impl Screenshot {
    /// Decode PNG bytes returned by a driver
    pub fn from_png(case: CaseId, png: &[u8]) -> HarnessResult<Self> {
        let image = image::load_from_memory(png)?.to_rgba8();
        Ok(Self::from_image(case, image))
    }

    pub fn from_image(case: CaseId, image: RgbaImage) -> Self {
        Self {
            case,
            captured_at: Utc::now(),
            image,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn to_png(&self) -> HarnessResult<Vec<u8>> {
        encode_png(&self.image)
    }
}

/// Encode an RGBA image as PNG. Output is deterministic for identical pixels.
pub fn encode_png(image: &RgbaImage) -> HarnessResult<Vec<u8>> {
    let mut buf = Vec::new();
    let (width, height) = image.dimensions();
    PngEncoder::new(&mut buf).write_image(image.as_raw(), width, height, ColorType::Rgba8)?;
    Ok(buf)
}

/// SHA256 of encoded image bytes
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_png_encoding_is_deterministic() {
        let img = RgbaImage::from_pixel(8, 4, Rgba([10, 20, 30, 255]));
        let a = encode_png(&img).unwrap();
        let b = encode_png(&img).unwrap();
        assert_eq!(digest(&a), digest(&b));
    }

    #[test]
    fn test_from_png_keeps_dimensions() {
        let img = RgbaImage::from_pixel(5, 3, Rgba([1, 2, 3, 255]));
        let png = encode_png(&img).unwrap();
        let case = CaseId::new(["osmLayer", "draw", "firefox"]).unwrap();
        let shot = Screenshot::from_png(case.clone(), &png).unwrap();
        assert_eq!(shot.dimensions(), (5, 3));
        assert_eq!(shot.case, case);
        assert_eq!(shot.image.get_pixel(4, 2), &Rgba([1, 2, 3, 255]));
    }
}
