use std::{cmp::Reverse, collections::BinaryHeap, fmt, str::FromStr};

use float_ord::FloatOrd;
use image::RgbImage;
use ndarray::{Array2, Array3};
use tracing::instrument;

use crate::{
    mask::{count_nonzero, Mask},
    util::{ensure_same_size, from_array, to_array},
    PatchError, Result,
};

pub const DEFAULT_INPAINT_RADIUS: u32 = 7;

const DIFFUSION_MAX_SWEEPS: usize = 200;
const DIFFUSION_TOLERANCE: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InpaintMethod {
    #[default]
    Telea,
    Diffusion,
}

impl InpaintMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            InpaintMethod::Telea => "telea",
            InpaintMethod::Diffusion => "diffusion",
        }
    }
}

impl fmt::Display for InpaintMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InpaintMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "telea" | "auto" => Ok(InpaintMethod::Telea),
            "diffusion" | "ns" => Ok(InpaintMethod::Diffusion),
            other => Err(format!("unknown inpaint method `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flag {
    Known,
    Band,
    Inside,
}

/// Unmasked pixels are returned unchanged.
#[instrument(level = "debug", skip(image, mask))]
pub fn inpaint(
    image: &RgbImage,
    mask: &Mask,
    method: InpaintMethod,
    radius: u32,
) -> Result<RgbImage> {
    ensure_same_size(image, mask)?;
    let holes = count_nonzero(mask);
    if holes == 0 {
        return Ok(image.clone());
    }
    if holes == mask.len() {
        return Err(PatchError::Reconstruction(
            "no unmasked pixels to inpaint from".to_string(),
        ));
    }

    let mut pixels = to_array(image);
    telea(&mut pixels, mask, radius.max(1));
    if method == InpaintMethod::Diffusion {
        relax(&mut pixels, mask);
    }
    log::trace!("Inpainted {holes} pixels with {method} (radius {radius})");
    Ok(from_array(&pixels))
}

const NEIGHBOURS: [(isize, isize); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];

fn offset(y: usize, x: usize, dy: isize, dx: isize, h: usize, w: usize) -> Option<(usize, usize)> {
    let ny = y.checked_add_signed(dy)?;
    let nx = x.checked_add_signed(dx)?;
    (ny < h && nx < w).then_some((ny, nx))
}

struct Field {
    flags: Array2<Flag>,
    arrival: Array2<f32>,
    radius: usize,
}

impl Field {
    fn dims(&self) -> (usize, usize) {
        self.flags.dim()
    }

    fn known_arrival(&self, y: usize, x: usize, dy: isize, dx: isize) -> Option<f32> {
        let (h, w) = self.dims();
        let (ny, nx) = offset(y, x, dy, dx, h, w)?;
        (self.flags[[ny, nx]] != Flag::Inside).then(|| self.arrival[[ny, nx]])
    }

    fn solve_arrival(&self, y: usize, x: usize) -> f32 {
        let mut best = f32::MAX;
        for dy in [-1, 1] {
            for dx in [-1, 1] {
                let vertical = self.known_arrival(y, x, dy, 0);
                let horizontal = self.known_arrival(y, x, 0, dx);
                best = best.min(eikonal(vertical, horizontal));
            }
        }
        best
    }

    fn arrival_gradient(&self, y: usize, x: usize) -> (f32, f32) {
        let centre = self.arrival[[y, x]];
        let axis = |d1: (isize, isize), d2: (isize, isize)| {
            match (
                self.known_arrival(y, x, d1.0, d1.1),
                self.known_arrival(y, x, d2.0, d2.1),
            ) {
                (Some(lo), Some(hi)) => (hi - lo) * 0.5,
                (Some(lo), None) => centre - lo,
                (None, Some(hi)) => hi - centre,
                (None, None) => 0.0,
            }
        };
        (axis((-1, 0), (1, 0)), axis((0, -1), (0, 1)))
    }
}

fn eikonal(a: Option<f32>, b: Option<f32>) -> f32 {
    match (a, b) {
        (Some(t1), Some(t2)) => {
            let diff = t1 - t2;
            if diff * diff >= 2.0 {
                return 1.0 + t1.min(t2);
            }
            let r = (2.0 - diff * diff).sqrt();
            let s = (t1 + t2 - r) * 0.5;
            if s >= t1 && s >= t2 {
                s
            } else {
                s + r
            }
        }
        (Some(t), None) | (None, Some(t)) => 1.0 + t,
        (None, None) => f32::MAX,
    }
}

#[instrument(level = "trace", skip(pixels, mask))]
fn telea(pixels: &mut Array3<f32>, mask: &Mask, radius: u32) {
    let (h, w, _) = pixels.dim();
    let mut field = Field {
        flags: Array2::from_shape_fn((h, w), |(y, x)| {
            if mask.get_pixel(x as u32, y as u32)[0] > 0 {
                Flag::Inside
            } else {
                Flag::Known
            }
        }),
        arrival: Array2::zeros((h, w)),
        radius: radius as usize,
    };

    let mut heap = BinaryHeap::new();
    for y in 0..h {
        for x in 0..w {
            if field.flags[[y, x]] != Flag::Known {
                continue;
            }
            let touches_hole = NEIGHBOURS.iter().any(|&(dy, dx)| {
                offset(y, x, dy, dx, h, w).is_some_and(|(ny, nx)| field.flags[[ny, nx]] == Flag::Inside)
            });
            if touches_hole {
                field.flags[[y, x]] = Flag::Band;
                heap.push(Reverse((FloatOrd(0.0f32), y, x)));
            }
        }
    }

    while let Some(Reverse((_, y, x))) = heap.pop() {
        field.flags[[y, x]] = Flag::Known;
        for (dy, dx) in NEIGHBOURS {
            let Some((ny, nx)) = offset(y, x, dy, dx, h, w) else {
                continue;
            };
            if field.flags[[ny, nx]] != Flag::Inside {
                continue;
            }
            let arrival = field.solve_arrival(ny, nx);
            field.arrival[[ny, nx]] = arrival;
            fill_pixel(pixels, &field, ny, nx);
            field.flags[[ny, nx]] = Flag::Band;
            heap.push(Reverse((FloatOrd(arrival), ny, nx)));
        }
    }
}

fn fill_pixel(pixels: &mut Array3<f32>, field: &Field, y: usize, x: usize) {
    let (h, w) = field.dims();
    let radius = field.radius as isize;
    let (grad_ty, grad_tx) = field.arrival_gradient(y, x);
    let arrival = field.arrival[[y, x]];

    let mut acc = [0.0f32; 3];
    let mut weight_sum = 0.0f32;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if (dy == 0 && dx == 0) || dy * dy + dx * dx > radius * radius {
                continue;
            }
            let Some((qy, qx)) = offset(y, x, dy, dx, h, w) else {
                continue;
            };
            if field.flags[[qy, qx]] == Flag::Inside {
                continue;
            }
            // Vector from the source pixel q to the target pixel p.
            let (ry, rx) = (-dy as f32, -dx as f32);
            let len2 = ry * ry + rx * rx;
            let direction = ((ry * grad_ty + rx * grad_tx).abs() / len2.sqrt()).max(1e-6);
            let distance = 1.0 / len2;
            let level = 1.0 / (1.0 + (field.arrival[[qy, qx]] - arrival).abs());
            let weight = direction * distance * level;

            for (ch, acc) in acc.iter_mut().enumerate() {
                let (gy, gx) = colour_gradient(pixels, field, qy, qx, ch);
                *acc += weight * (pixels[[qy, qx, ch]] + gy * ry + gx * rx);
            }
            weight_sum += weight;
        }
    }

    if weight_sum > 0.0 {
        for (ch, acc) in acc.into_iter().enumerate() {
            pixels[[y, x, ch]] = (acc / weight_sum).clamp(0.0, 255.0);
        }
    }
}

fn colour_gradient(pixels: &Array3<f32>, field: &Field, y: usize, x: usize, ch: usize) -> (f32, f32) {
    let (h, w) = field.dims();
    let sample = |dy: isize, dx: isize| {
        offset(y, x, dy, dx, h, w)
            .filter(|&(ny, nx)| field.flags[[ny, nx]] != Flag::Inside)
            .map(|(ny, nx)| pixels[[ny, nx, ch]])
    };
    let centre = pixels[[y, x, ch]];
    let axis = |lo: Option<f32>, hi: Option<f32>| match (lo, hi) {
        (Some(lo), Some(hi)) => (hi - lo) * 0.5,
        (Some(lo), None) => centre - lo,
        (None, Some(hi)) => hi - centre,
        (None, None) => 0.0,
    };
    (
        axis(sample(-1, 0), sample(1, 0)),
        axis(sample(0, -1), sample(0, 1)),
    )
}

#[instrument(level = "trace", skip(pixels, mask))]
fn relax(pixels: &mut Array3<f32>, mask: &Mask) {
    let (h, w, _) = pixels.dim();
    let holes = mask
        .enumerate_pixels()
        .filter(|(_, _, p)| p[0] > 0)
        .map(|(x, y, _)| (y as usize, x as usize))
        .collect::<Vec<_>>();

    for sweep in 0..DIFFUSION_MAX_SWEEPS {
        let mut max_change = 0.0f32;
        for &(y, x) in &holes {
            for ch in 0..3 {
                let (sum, count) = NEIGHBOURS
                    .iter()
                    .filter_map(|&(dy, dx)| offset(y, x, dy, dx, h, w))
                    .fold((0.0f32, 0.0f32), |(sum, count), (ny, nx)| {
                        (sum + pixels[[ny, nx, ch]], count + 1.0)
                    });
                if count == 0.0 {
                    continue;
                }
                let value = sum / count;
                max_change = max_change.max((value - pixels[[y, x, ch]]).abs());
                pixels[[y, x, ch]] = value;
            }
        }
        if max_change < DIFFUSION_TOLERANCE {
            log::trace!("Diffusion converged after {} sweeps", sweep + 1);
            break;
        }
    }
}
