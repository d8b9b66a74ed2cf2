use candle::{Device, Tensor};
use image::{imageops::FilterType, DynamicImage};

use crate::error::{ApiError, ClassifierError};

/// Square side the network was trained on.
pub const IMG_SIZE: u32 = 224;

/// ImageNet normalization mean values (RGB)
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet normalization std values (RGB)
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

pub fn decode_image(image_data: &[u8]) -> Result<DynamicImage, ApiError> {
    image::load_from_memory(image_data).map_err(|e| {
        tracing::error!("Image processing failed: {}", e);
        ApiError::InvalidImage(e.to_string())
    })
}

/// Converts any decoded image into a `[3, IMG_SIZE, IMG_SIZE]` normalized tensor.
pub fn preprocess_image(image: &DynamicImage) -> Result<Tensor, ClassifierError> {
    let rgb = image
        .resize_exact(IMG_SIZE, IMG_SIZE, FilterType::Triangle)
        .to_rgb8();

    let side = IMG_SIZE as usize;
    let num_pixels = side * side;
    let mut chw = vec![0.0f32; 3 * num_pixels];

    for (i, pixel) in rgb.pixels().enumerate() {
        for c in 0..3 {
            chw[c * num_pixels + i] =
                (pixel[c] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }

    Tensor::from_vec(chw, (3, side, side), &Device::Cpu)
        .map_err(|e| ClassifierError::Inference(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::IndexOp;
    use image::{GrayImage, Luma, Rgb, RgbImage, RgbaImage};

    #[test]
    fn any_mode_and_size_yields_fixed_shape() {
        let images = vec![
            DynamicImage::ImageLuma8(GrayImage::new(31, 517)),
            DynamicImage::ImageRgba8(RgbaImage::new(640, 480)),
            DynamicImage::ImageRgb8(RgbImage::new(1, 1)),
            DynamicImage::ImageRgb8(RgbImage::new(224, 224)),
        ];
        for img in images {
            let tensor = preprocess_image(&img).unwrap();
            assert_eq!(tensor.dims(), &[3, 224, 224]);
        }
    }

    #[test]
    fn normalizes_per_channel() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(50, 70, Rgb([255, 0, 128])));
        let tensor = preprocess_image(&img).unwrap();

        let r = tensor.i((0, 10, 10)).unwrap().to_scalar::<f32>().unwrap();
        let g = tensor.i((1, 100, 200)).unwrap().to_scalar::<f32>().unwrap();
        let b = tensor.i((2, 223, 0)).unwrap().to_scalar::<f32>().unwrap();

        assert!((r - (1.0 - 0.485) / 0.229).abs() < 1e-4);
        assert!((g - (0.0 - 0.456) / 0.224).abs() < 1e-4);
        assert!((b - (128.0 / 255.0 - 0.406) / 0.225).abs() < 1e-4);
    }

    #[test]
    fn grayscale_is_replicated_across_channels() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(8, 8, Luma([200])));
        let tensor = preprocess_image(&img).unwrap();
        let value = 200.0 / 255.0;
        for c in 0..3 {
            let v = tensor.i((c, 5, 5)).unwrap().to_scalar::<f32>().unwrap();
            assert!((v - (value - IMAGENET_MEAN[c]) / IMAGENET_STD[c]).abs() < 1e-4);
        }
    }

    #[test]
    fn undecodable_bytes_are_client_errors() {
        let err = decode_image(b"definitely not a png").unwrap_err();
        assert!(matches!(err, ApiError::InvalidImage(_)));
    }
}
