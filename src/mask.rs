use image::{GrayImage, Luma};
use imageproc::{
    distance_transform::Norm,
    drawing::draw_polygon_mut,
    filter::gaussian_blur_f32,
    morphology,
    point::Point,
};
use tracing::instrument;

use crate::{geometry::quad_to_bbox, BoundingBox, Quad};

/// Single-channel raster the size of the source image; 255 marks text pixels.
pub type Mask = GrayImage;

pub const MASK_ON: u8 = 255;

/// Boundary pixels are included. Quads whose extent does not fit in `i32`
/// rasterize to an empty mask.
#[instrument(level = "trace")]
pub fn rasterize(quad: &Quad, width: u32, height: u32) -> Mask {
    let mut mask = GrayImage::new(width, height);
    if width == 0 || height == 0 {
        return mask;
    }
    if let Err(err) = quad_to_bbox(quad) {
        log::debug!("Not rasterizing: {err}");
        return mask;
    }

    // The polygon filler rejects closed rings and single points.
    let mut points: Vec<Point<i32>> = quad.points().to_vec();
    points.dedup();
    while points.len() > 1 && points.first() == points.last() {
        points.pop();
    }

    match points.as_slice() {
        [] => {}
        [p] => {
            if p.x >= 0 && p.y >= 0 && (p.x as u32) < width && (p.y as u32) < height {
                mask.put_pixel(p.x as u32, p.y as u32, Luma([MASK_ON]));
            }
        }
        poly => draw_polygon_mut(&mut mask, poly, Luma([MASK_ON])),
    }
    mask
}

// An elliptical element of diameter `kernel_size` is a Euclidean disk of half
// that radius.
fn disk_radius(kernel_size: u32) -> u8 {
    (kernel_size / 2).min(u8::MAX as u32) as u8
}

pub fn dilate(mask: &Mask, kernel_size: u32) -> Mask {
    match disk_radius(kernel_size) {
        0 => binarize(mask),
        radius => morphology::dilate(mask, Norm::L2, radius),
    }
}

pub fn erode(mask: &Mask, kernel_size: u32) -> Mask {
    match disk_radius(kernel_size) {
        0 => binarize(mask),
        radius => morphology::erode(mask, Norm::L2, radius),
    }
}

/// Erosion by a `(2 * radius + 1)` square, i.e. `radius` passes of a 3x3 box.
pub fn erode_square(mask: &Mask, radius: u8) -> Mask {
    match radius {
        0 => binarize(mask),
        radius => morphology::erode(mask, Norm::LInf, radius),
    }
}

fn binarize(mask: &Mask) -> Mask {
    let mut out = mask.clone();
    for pixel in out.pixels_mut() {
        if pixel[0] > 0 {
            pixel[0] = MASK_ON;
        }
    }
    out
}

pub fn ring(outer: &Mask, inner: &Mask) -> Mask {
    zip_with(outer, inner, |o, i| o.saturating_sub(i))
}

pub fn intersect(a: &Mask, b: &Mask) -> Mask {
    zip_with(a, b, u8::min)
}

fn zip_with(a: &Mask, b: &Mask, f: impl Fn(u8, u8) -> u8) -> Mask {
    debug_assert_eq!(a.dimensions(), b.dimensions());
    let mut out = a.clone();
    for (pixel, other) in out.pixels_mut().zip(b.pixels()) {
        pixel[0] = f(pixel[0], other[0]);
    }
    out
}

/// Band of `width` pixels straddling the mask boundary.
pub fn edge(mask: &Mask, width: u32) -> Mask {
    ring(&dilate(mask, width), &erode(mask, width))
}

pub fn feather(mask: &Mask, sigma: f32) -> Mask {
    if sigma <= 0.0 || mask.width() == 0 || mask.height() == 0 {
        return mask.clone();
    }
    gaussian_blur_f32(mask, sigma)
}

pub fn count_nonzero(mask: &Mask) -> usize {
    mask.pixels().filter(|p| p[0] > 0).count()
}

/// Tight bounding rectangle of the nonzero pixels, inclusive of both ends.
pub fn nonzero_bbox(mask: &Mask) -> Option<BoundingBox> {
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, pixel) in mask.enumerate_pixels() {
        if pixel[0] == 0 {
            continue;
        }
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }
    bounds.map(|(x0, y0, x1, y1)| {
        BoundingBox::new(x0 as i32, y0 as i32, (x1 - x0 + 1) as i32, (y1 - y0 + 1) as i32)
    })
}
