use std::io::Cursor;

use image::{DynamicImage, GrayImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use tracing::instrument;

use crate::{
    geometry::clip_to_image,
    mask::{feather, Mask},
    util::{crop, ensure_same_size},
    BoundingBox, PatchError, Result,
};

pub const DEFAULT_FEATHER_SIGMA: f32 = 1.5;

#[instrument(level = "debug", skip(reconstructed, mask))]
pub fn build_patch(
    reconstructed: &RgbImage,
    mask: &Mask,
    bbox: BoundingBox,
    feather_sigma: Option<f32>,
) -> Result<RgbaImage> {
    ensure_same_size(reconstructed, mask)?;
    let bbox = clip_to_image(bbox, reconstructed.width(), reconstructed.height());
    if bbox.is_empty() {
        return Err(PatchError::DegenerateRegion(format!(
            "patch bbox {bbox:?} has no area"
        )));
    }

    let rgb = crop(reconstructed, bbox);
    let mut alpha = crop(mask, bbox);
    if let Some(sigma) = feather_sigma {
        alpha = feather(&alpha, sigma);
    }

    Ok(RgbaImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        Rgba([r, g, b, alpha.get_pixel(x, y)[0]])
    }))
}

pub fn encode_png(patch: &RgbaImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(patch.clone())
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|err| PatchError::Reconstruction(format!("failed to encode patch: {err}")))?;
    Ok(bytes)
}

pub fn transparent_patch(
    reconstructed: &RgbImage,
    mask: &Mask,
    bbox: BoundingBox,
    feather: bool,
) -> Result<Vec<u8>> {
    let patch = build_patch(
        reconstructed,
        mask,
        bbox,
        feather.then_some(DEFAULT_FEATHER_SIGMA),
    )?;
    encode_png(&patch)
}

/// Places `overlay` with top-left corner at `offset` and mixes it in with
/// `result = overlay * a + base * (1 - a)`, `a = alpha / 255`. Parts falling
/// outside `base` are dropped.
pub fn alpha_blend(
    base: &RgbImage,
    overlay: &RgbImage,
    alpha: &GrayImage,
    offset: (i32, i32),
) -> RgbImage {
    let mut result = base.clone();
    let (ox, oy) = offset;
    let width = overlay.width().min(alpha.width());
    let height = overlay.height().min(alpha.height());

    // Overlay-space rectangle that lands inside the base image.
    let x0 = (-ox).max(0) as i64;
    let y0 = (-oy).max(0) as i64;
    let x1 = (width as i64).min(base.width() as i64 - ox as i64);
    let y1 = (height as i64).min(base.height() as i64 - oy as i64);
    if x0 >= x1 || y0 >= y1 {
        return result;
    }

    for y in y0..y1 {
        for x in x0..x1 {
            let a = alpha.get_pixel(x as u32, y as u32)[0] as f32 / 255.0;
            let over = overlay.get_pixel(x as u32, y as u32);
            let (bx, by) = ((x + ox as i64) as u32, (y + oy as i64) as u32);
            let under = result.get_pixel(bx, by);
            let mixed = Rgb([0, 1, 2].map(|ch| {
                (over[ch] as f32 * a + under[ch] as f32 * (1.0 - a))
                    .round()
                    .clamp(0.0, 255.0) as u8
            }));
            result.put_pixel(bx, by, mixed);
        }
    }
    result
}

pub fn apply_patch(base: &RgbImage, patch: &RgbaImage, offset: (i32, i32)) -> RgbImage {
    let rgb = RgbImage::from_fn(patch.width(), patch.height(), |x, y| {
        let [r, g, b, _] = patch.get_pixel(x, y).0;
        Rgb([r, g, b])
    });
    let alpha = GrayImage::from_fn(patch.width(), patch.height(), |x, y| {
        image::Luma([patch.get_pixel(x, y)[3]])
    });
    alpha_blend(base, &rgb, &alpha, offset)
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;
    use crate::{mask::rasterize, Quad};

    #[test]
    fn alpha_equals_mask_without_feather() {
        let image = RgbImage::from_fn(50, 40, |x, y| Rgb([x as u8, y as u8, 99]));
        let mask = rasterize(&Quad::new([[10, 8], [35, 12], [33, 30], [12, 26]]), 50, 40);
        let bbox = BoundingBox::new(5, 4, 36, 30);

        let bytes = transparent_patch(&image, &mask, bbox, false).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap().to_rgba8();
        assert_eq!(decoded.dimensions(), (36, 30));
        for (x, y, px) in decoded.enumerate_pixels() {
            let (sx, sy) = (x + 5, y + 4);
            assert_eq!(px[3], mask.get_pixel(sx, sy)[0]);
            assert_eq!(&px.0[..3], &image.get_pixel(sx, sy).0[..]);
        }
    }

    #[test]
    fn feathered_alpha_ramps() {
        let image = RgbImage::new(40, 40);
        let mask = rasterize(&Quad::new([[10, 10], [29, 10], [29, 29], [10, 29]]), 40, 40);
        let patch = build_patch(&image, &mask, BoundingBox::new(0, 0, 40, 40), Some(1.5)).unwrap();
        assert!(patch.get_pixel(20, 20)[3] >= 254);
        assert_eq!(patch.get_pixel(1, 1)[3], 0);
        let edge = patch.get_pixel(10, 20)[3];
        assert!(edge > 0 && edge < 255);
    }

    #[test]
    fn patch_bbox_is_clipped() {
        let image = RgbImage::new(20, 20);
        let mask = GrayImage::new(20, 20);
        let patch = build_patch(&image, &mask, BoundingBox::new(-5, 15, 10, 10), None).unwrap();
        assert_eq!(patch.dimensions(), (5, 5));

        let err = build_patch(&image, &mask, BoundingBox::new(30, 30, 5, 5), None).unwrap_err();
        assert!(matches!(err, PatchError::DegenerateRegion(_)));
    }

    #[test]
    fn blend_mixes_by_alpha() {
        let base = RgbImage::from_pixel(10, 10, Rgb([0, 0, 0]));
        let overlay = RgbImage::from_pixel(4, 4, Rgb([200, 100, 50]));
        let mut alpha = GrayImage::from_pixel(4, 4, Luma([255]));
        alpha.put_pixel(1, 1, Luma([0]));
        alpha.put_pixel(2, 2, Luma([51]));

        let out = alpha_blend(&base, &overlay, &alpha, (3, 3));
        assert_eq!(*out.get_pixel(3, 3), Rgb([200, 100, 50]));
        assert_eq!(*out.get_pixel(4, 4), Rgb([0, 0, 0]));
        assert_eq!(*out.get_pixel(5, 5), Rgb([40, 20, 10]));
        assert_eq!(*out.get_pixel(7, 7), Rgb([0, 0, 0]));
    }

    #[test]
    fn blend_clips_partial_overlap() {
        let base = RgbImage::from_pixel(10, 10, Rgb([1, 1, 1]));
        let overlay = RgbImage::from_pixel(6, 6, Rgb([9, 9, 9]));
        let alpha = GrayImage::from_pixel(6, 6, Luma([255]));

        let out = alpha_blend(&base, &overlay, &alpha, (-3, 7));
        let painted = out.pixels().filter(|p| p[0] == 9).count();
        assert_eq!(painted, 3 * 3);
        assert_eq!(*out.get_pixel(0, 9), Rgb([9, 9, 9]));
        assert_eq!(*out.get_pixel(3, 9), Rgb([1, 1, 1]));
    }

    #[test]
    fn blend_outside_is_noop() {
        let base = RgbImage::from_fn(8, 8, |x, y| Rgb([x as u8, y as u8, 3]));
        let overlay = RgbImage::from_pixel(4, 4, Rgb([255, 255, 255]));
        let alpha = GrayImage::from_pixel(4, 4, Luma([255]));
        for offset in [(8, 0), (0, 8), (-4, 0), (-10, -10), (100, 100)] {
            assert_eq!(alpha_blend(&base, &overlay, &alpha, offset), base);
        }
    }

    #[test]
    fn applying_patch_restores_background() {
        let clean = RgbImage::from_pixel(30, 30, Rgb([240, 240, 240]));
        let mut page = clean.clone();
        let mask = rasterize(&Quad::new([[10, 12], [20, 12], [20, 17], [10, 17]]), 30, 30);
        for (x, y, m) in mask.enumerate_pixels() {
            if m[0] > 0 {
                page.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
        let bbox = BoundingBox::new(6, 8, 19, 14);
        let patch = build_patch(&clean, &mask, bbox, None).unwrap();
        assert_eq!(apply_patch(&page, &patch, (bbox.x, bbox.y)), clean);
    }
}
