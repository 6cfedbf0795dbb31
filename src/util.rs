use image::{imageops, GrayImage, ImageBuffer, Pixel, Rgb, RgbImage};
use ndarray::{Array2, Array3};
use tracing::instrument;

use crate::{BoundingBox, PatchError, Result};

#[instrument(level = "debug", skip(bytes), fields(len = bytes.len()))]
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory(bytes)?;
    log::debug!("Decoded image of {}x{}", image.width(), image.height());
    Ok(image.to_rgb8())
}

/// `bbox` must already be clipped to the image.
pub(crate) fn crop<P: Pixel + 'static>(
    image: &ImageBuffer<P, Vec<P::Subpixel>>,
    bbox: BoundingBox,
) -> ImageBuffer<P, Vec<P::Subpixel>> {
    log::trace!("Slicing subimage to {bbox:?}");
    imageops::crop_imm(
        image,
        bbox.x as u32,
        bbox.y as u32,
        bbox.w as u32,
        bbox.h as u32,
    )
    .to_image()
}

pub(crate) fn ensure_same_size(image: &RgbImage, mask: &GrayImage) -> Result<()> {
    if image.dimensions() != mask.dimensions() {
        return Err(PatchError::Reconstruction(format!(
            "mask is {:?} but image is {:?}",
            mask.dimensions(),
            image.dimensions()
        )));
    }
    Ok(())
}

/// `(height, width, channel)` float view of an RGB image.
pub(crate) fn to_array(image: &RgbImage) -> Array3<f32> {
    Array3::<f32>::from_shape_fn(
        (image.height() as usize, image.width() as usize, 3),
        |(y, x, ch)| image.get_pixel(x as u32, y as u32).channels()[ch] as f32,
    )
}

pub(crate) fn from_array(data: &Array3<f32>) -> RgbImage {
    let (height, width, _) = data.dim();
    ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([0, 1, 2].map(|ch| to_u8(data[[y, x, ch]])))
    })
}

pub(crate) fn to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

pub(crate) fn samples_where(
    image: &RgbImage,
    mask: &GrayImage,
    keep: impl Fn(u8) -> bool,
) -> Array2<f32> {
    let rows = image
        .pixels()
        .zip(mask.pixels())
        .filter(|(_, m)| keep(m[0]))
        .flat_map(|(p, _)| p.0.map(f32::from))
        .collect::<Vec<_>>();
    let len = rows.len() / 3;
    Array2::from_shape_vec((len, 3), rows).unwrap_or_else(|_| Array2::zeros((0, 3)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_round_trip() {
        let image = RgbImage::from_fn(4, 3, |x, y| Rgb([x as u8 * 10, y as u8 * 20, 7]));
        let data = to_array(&image);
        assert_eq!(data.dim(), (3, 4, 3));
        assert_eq!(data[[2, 3, 0]], 30.0);
        assert_eq!(data[[2, 3, 1]], 40.0);
        assert_eq!(from_array(&data), image);
    }

    #[test]
    fn samples_follow_mask() {
        let image = RgbImage::from_fn(3, 1, |x, _| Rgb([x as u8, 0, 0]));
        let mask = GrayImage::from_raw(3, 1, vec![0, 255, 0]).unwrap();
        let background = samples_where(&image, &mask, |m| m == 0);
        assert_eq!(background.nrows(), 2);
        assert_eq!(background[[1, 0]], 2.0);
        let text = samples_where(&image, &mask, |m| m > 0);
        assert_eq!(text.nrows(), 1);
        assert_eq!(text[[0, 0]], 1.0);
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode_rgb(b"definitely not an image").unwrap_err();
        assert!(matches!(err, PatchError::Decode(_)));
    }
}
