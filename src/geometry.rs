use geo::{Area, Coord, LineString, Polygon};

use crate::{BoundingBox, PatchError, Quad, Result};

pub fn quad_to_bbox(quad: &Quad) -> Result<BoundingBox> {
    let points = quad.points();
    let min_x = points.iter().map(|p| p.x).min().unwrap_or_default();
    let max_x = points.iter().map(|p| p.x).max().unwrap_or_default();
    let min_y = points.iter().map(|p| p.y).min().unwrap_or_default();
    let max_y = points.iter().map(|p| p.y).max().unwrap_or_default();

    let span = |lo: i32, hi: i32| {
        hi.checked_sub(lo).ok_or_else(|| {
            PatchError::InvalidCandidate(format!("quad {:?} is too large", quad.points()))
        })
    };
    Ok(BoundingBox::new(
        min_x,
        min_y,
        span(min_x, max_x)?,
        span(min_y, max_y)?,
    ))
}

/// The result may extend past the image origin; clip it before use. Fails
/// when the padded box leaves the `i32` coordinate range.
pub fn expand(bbox: BoundingBox, padding: u32) -> Result<BoundingBox> {
    let grown = i32::try_from(padding).ok().and_then(|p| {
        Some(BoundingBox::new(
            bbox.x.checked_sub(p)?,
            bbox.y.checked_sub(p)?,
            bbox.w.checked_add(p)?.checked_add(p)?,
            bbox.h.checked_add(p)?.checked_add(p)?,
        ))
    });
    grown.ok_or_else(|| {
        PatchError::DegenerateRegion(format!("{bbox:?} padded by {padding} is out of range"))
    })
}

/// Intersects the box with `[0, width) x [0, height)`. Boxes lying entirely
/// outside the image collapse to zero width and/or height.
pub fn clip_to_image(bbox: BoundingBox, width: u32, height: u32) -> BoundingBox {
    let width = width.min(i32::MAX as u32) as i64;
    let height = height.min(i32::MAX as u32) as i64;

    let x = (bbox.x as i64).clamp(0, width);
    let y = (bbox.y as i64).clamp(0, height);
    let x2 = bbox.right().clamp(0, width);
    let y2 = bbox.bottom().clamp(0, height);

    BoundingBox::new(
        x as i32,
        y as i32,
        (x2 - x).max(0) as i32,
        (y2 - y).max(0) as i32,
    )
}

/// Rotation of the first edge in degrees, folded into `[-90, 90]`.
pub fn angle(quad: &Quad) -> f64 {
    let [p1, p2, ..] = quad.points();
    let dx = p2.x as f64 - p1.x as f64;
    let dy = p2.y as f64 - p1.y as f64;

    let mut degrees = dy.atan2(dx).to_degrees();
    while degrees > 90.0 {
        degrees -= 180.0;
    }
    while degrees < -90.0 {
        degrees += 180.0;
    }
    degrees
}

pub(crate) fn to_geo_poly(quad: &Quad) -> Polygon<f64> {
    let points = quad
        .points()
        .iter()
        .map(|point| Coord {
            x: point.x as f64,
            y: point.y as f64,
        })
        .collect();
    Polygon::new(LineString::new(points), vec![])
}

pub fn quad_area(quad: &Quad) -> f64 {
    to_geo_poly(quad).unsigned_area()
}
