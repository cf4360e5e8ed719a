//! Image decoding and model input preparation.

use crate::detector::DetectionFailure;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use ndarray::{Array, Array4};

/// Grey used by YOLO letterboxing, as a fraction of full scale
const PAD_VALUE: f32 = 114.0 / 255.0;

/// Decode encoded image bytes (JPEG, PNG, ...).
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, DetectionFailure> {
    image::load_from_memory(bytes).map_err(|e| DetectionFailure::Decode(e.to_string()))
}

/// Resize keeping the aspect ratio, pad to a `size` x `size` square and lay
/// out as a `[1, 3, size, size]` RGB tensor scaled to `[0, 1]`.
pub fn letterbox(image: &DynamicImage, size: u32) -> Array4<f32> {
    let (width, height) = image.dimensions();
    let scale = (size as f32 / width.max(1) as f32).min(size as f32 / height.max(1) as f32);
    let new_width = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_height = ((height as f32 * scale).round() as u32).clamp(1, size);

    let resized = image.resize_exact(new_width, new_height, FilterType::Triangle);
    let pad_x = (size - new_width) / 2;
    let pad_y = (size - new_height) / 2;

    let side = size as usize;
    let mut array = Array::from_elem((1, 3, side, side), PAD_VALUE);

    for (x, y, pixel) in resized.pixels() {
        let (col, row) = ((x + pad_x) as usize, (y + pad_y) as usize);
        array[[0, 0, row, col]] = pixel[0] as f32 / 255.0;
        array[[0, 1, row, col]] = pixel[1] as f32 / 255.0;
        array[[0, 2, row, col]] = pixel[2] as f32 / 255.0;
    }

    array
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32, color: Rgb<u8>) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, color);
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode(b"definitely not an image"),
            Err(DetectionFailure::Decode(_))
        ));
    }

    #[test]
    fn test_letterbox_pads_wide_image() {
        let image = decode(&png(64, 32, Rgb([255, 0, 0]))).unwrap();
        let tensor = letterbox(&image, 32);

        assert_eq!(tensor.shape(), &[1, 3, 32, 32]);
        // 64x32 scales to 32x16, centred with 8 rows of padding above
        assert_eq!(tensor[[0, 0, 0, 0]], PAD_VALUE);
        assert_eq!(tensor[[0, 0, 16, 16]], 1.0);
        assert_eq!(tensor[[0, 1, 16, 16]], 0.0);
        assert_eq!(tensor[[0, 0, 31, 31]], PAD_VALUE);
    }
}
