//! Image encoding: `DynamicImage` → PNG bytes.
//!
//! PNG is lossless, so rendered text stays crisp at any zoom level.

use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// A PNG-encoded page with its pixel dimensions.
#[derive(Debug, Clone)]
pub struct EncodedPage {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Encode a rasterised page as PNG.
pub fn encode_png(img: &DynamicImage) -> Result<EncodedPage, image::ImageError> {
    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)?;
    debug!(
        "Encoded {}x{} image → {} bytes PNG",
        img.width(),
        img.height(),
        png.len()
    );

    Ok(EncodedPage {
        png,
        width: img.width(),
        height: img.height(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn encode_small_image() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 12, Rgba([255, 0, 0, 255])));
        let page = encode_png(&img).expect("encode should succeed");
        assert_eq!((page.width, page.height), (10, 12));
        assert_eq!(&page.png[..8], b"\x89PNG\r\n\x1a\n");

        let decoded = image::load_from_memory(&page.png).expect("valid PNG");
        assert_eq!(decoded.width(), 10);
    }
}
