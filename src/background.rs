use std::{fmt, str::FromStr};

use image::{Rgb, RgbImage};
use nalgebra::{Matrix2, Vector2};
use ndarray::{ArrayView2, Axis};
use serde_json::json;
use tracing::instrument;

use crate::{
    inpaint::{inpaint, InpaintMethod, DEFAULT_INPAINT_RADIUS},
    mask::Mask,
    util::{ensure_same_size, samples_where, to_array},
    DebugInfo, PatchError, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FillMode {
    #[default]
    Auto,
    Solid,
    Gradient,
    Inpaint,
}

impl FillMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FillMode::Auto => "auto",
            FillMode::Solid => "solid",
            FillMode::Gradient => "gradient",
            FillMode::Inpaint => "inpaint",
        }
    }
}

impl fmt::Display for FillMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FillMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "auto" => Ok(FillMode::Auto),
            "solid" => Ok(FillMode::Solid),
            "gradient" => Ok(FillMode::Gradient),
            "inpaint" => Ok(FillMode::Inpaint),
            other => Err(format!("unknown fill mode `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GradientDirection {
    Horizontal,
    Vertical,
}

impl GradientDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            GradientDirection::Horizontal => "horizontal",
            GradientDirection::Vertical => "vertical",
        }
    }

    fn axis(self) -> Axis {
        match self {
            // Column index varies along the width axis of a (h, w) grid.
            GradientDirection::Horizontal => Axis(1),
            GradientDirection::Vertical => Axis(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackgroundModel {
    Solid {
        color: [u8; 3],
    },
    Gradient {
        direction: GradientDirection,
        start_color: [u8; 3],
        end_color: [u8; 3],
        fit_error: f32,
    },
    Inpainted {
        method: InpaintMethod,
        radius: u32,
    },
}

impl BackgroundModel {
    pub fn name(&self) -> &'static str {
        match self {
            BackgroundModel::Solid { .. } => "solid",
            BackgroundModel::Gradient { .. } => "gradient",
            BackgroundModel::Inpainted { .. } => "inpaint",
        }
    }

    pub fn record(&self, debug_info: &mut DebugInfo) {
        debug_info.insert("bg_model".into(), json!(self.name()));
        match self {
            BackgroundModel::Solid { color } => {
                debug_info.insert("solid_color".into(), json!(color));
            }
            BackgroundModel::Gradient {
                direction,
                start_color,
                end_color,
                fit_error,
            } => {
                debug_info.insert(
                    "gradient_params".into(),
                    json!({
                        "direction": direction.as_str(),
                        "start_color": start_color,
                        "end_color": end_color,
                        "mae": fit_error,
                    }),
                );
            }
            BackgroundModel::Inpainted { method, radius } => {
                debug_info.insert("inpaint_method".into(), json!(method.as_str()));
                debug_info.insert("inpaint_radius".into(), json!(radius));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackgroundConfig {
    pub solid_std_threshold: f32,
    pub gradient_mae_threshold: f32,
    /// Gradient fitting needs strictly more background pixels than this.
    pub min_background_pixels: usize,
    pub gradient_edge_span: usize,
    pub inpaint_method: InpaintMethod,
    pub inpaint_radius: u32,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            solid_std_threshold: 10.0,
            gradient_mae_threshold: 15.0,
            min_background_pixels: 100,
            gradient_edge_span: 5,
            inpaint_method: InpaintMethod::default(),
            inpaint_radius: DEFAULT_INPAINT_RADIUS,
        }
    }
}

pub fn solid_color(samples: ArrayView2<f32>, threshold: f32) -> Option<[u8; 3]> {
    let mean = samples.mean_axis(Axis(0))?;
    let std = samples.std_axis(Axis(0), 0.0);
    log::debug!("Background std-dev per channel: {std}");
    if std.iter().all(|&s| s < threshold) {
        Some([0, 1, 2].map(|ch| mean[ch] as u8))
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientFit {
    pub direction: GradientDirection,
    pub start_color: [u8; 3],
    pub end_color: [u8; 3],
    pub mae: f32,
}

struct Profile {
    /// `(position, channel sums, pixel count)` for positions holding background.
    positions: Vec<(usize, [f64; 3], usize)>,
    /// `(slope, intercept)` per channel.
    lines: [(f64, f64); 3],
}

impl Profile {
    fn predict(&self, ch: usize, position: usize) -> f64 {
        let (slope, intercept) = self.lines[ch];
        slope * position as f64 + intercept
    }

    fn span_mean(&self, positions: impl Iterator<Item = usize>) -> [u8; 3] {
        let mut sums = [0.0f64; 3];
        let mut count = 0usize;
        for i in positions {
            let (_, s, n) = self.positions[i];
            for ch in 0..3 {
                sums[ch] += s[ch];
            }
            count += n;
        }
        sums.map(|s| (s / count.max(1) as f64) as u8)
    }
}

/// Least-squares line through `(x, y)` points; `None` when x has no spread.
fn fit_line(points: impl Iterator<Item = (f64, f64)>) -> Option<(f64, f64)> {
    let (mut n, mut sx, mut sy, mut sxx, mut sxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for (x, y) in points {
        n += 1.0;
        sx += x;
        sy += y;
        sxx += x * x;
        sxy += x * y;
    }
    let normal = Matrix2::new(sxx, sx, sx, n);
    let solution = normal.lu().solve(&Vector2::new(sxy, sy))?;
    solution
        .iter()
        .all(|v| v.is_finite())
        .then(|| (solution[0], solution[1]))
}

fn profile(roi: &RgbImage, mask: &Mask, direction: GradientDirection) -> Option<Profile> {
    let pixels = to_array(roi);
    let axis = direction.axis();
    let len = pixels.len_of(axis);

    let mut positions = Vec::with_capacity(len);
    for position in 0..len {
        let lane = pixels.index_axis(axis, position);
        let mut sums = [0.0f64; 3];
        let mut count = 0usize;
        for (i, px) in lane.outer_iter().enumerate() {
            let (x, y) = match direction {
                GradientDirection::Horizontal => (position, i),
                GradientDirection::Vertical => (i, position),
            };
            if mask.get_pixel(x as u32, y as u32)[0] > 0 {
                continue;
            }
            for ch in 0..3 {
                sums[ch] += px[ch] as f64;
            }
            count += 1;
        }
        if count > 0 {
            positions.push((position, sums, count));
        }
    }
    if positions.len() < 2 {
        return None;
    }

    let mut lines = [(0.0, 0.0); 3];
    for (ch, line) in lines.iter_mut().enumerate() {
        *line = fit_line(
            positions
                .iter()
                .map(|&(p, sums, count)| (p as f64, sums[ch] / count as f64)),
        )?;
    }
    Some(Profile { positions, lines })
}

/// Mean absolute error of the profile's lines against every background pixel.
fn profile_mae(roi: &RgbImage, mask: &Mask, direction: GradientDirection, profile: &Profile) -> f64 {
    let mut total = 0.0f64;
    let mut count = 0usize;
    for (x, y, px) in roi.enumerate_pixels() {
        if mask.get_pixel(x, y)[0] > 0 {
            continue;
        }
        let position = match direction {
            GradientDirection::Horizontal => x,
            GradientDirection::Vertical => y,
        } as usize;
        for ch in 0..3 {
            total += (px[ch] as f64 - profile.predict(ch, position)).abs();
        }
        count += 3;
    }
    if count == 0 {
        f64::INFINITY
    } else {
        total / count as f64
    }
}

#[instrument(level = "trace", skip(roi, mask))]
pub fn fit_gradient(
    roi: &RgbImage,
    mask: &Mask,
    mae_threshold: f32,
    edge_span: usize,
) -> Option<GradientFit> {
    let fits = [GradientDirection::Horizontal, GradientDirection::Vertical].map(|direction| {
        let profile = profile(roi, mask, direction);
        let mae = profile
            .as_ref()
            .map_or(f64::INFINITY, |p| profile_mae(roi, mask, direction, p));
        (direction, profile, mae)
    });
    log::debug!(
        "Gradient fit MAE: horizontal={:.2}, vertical={:.2}",
        fits[0].2,
        fits[1].2
    );

    let [horizontal, vertical] = fits;
    let (direction, profile, mae) = if horizontal.2 < vertical.2 {
        horizontal
    } else {
        vertical
    };
    if !(mae < mae_threshold as f64) {
        return None;
    }
    let profile = profile?;

    let span = edge_span.clamp(1, profile.positions.len());
    let last = profile.positions.len();
    Some(GradientFit {
        direction,
        start_color: profile.span_mean(0..span),
        end_color: profile.span_mean(last - span..last),
        mae: mae as f32,
    })
}

#[instrument(level = "debug", skip(roi, mask, config))]
pub fn classify_background(
    roi: &RgbImage,
    mask: &Mask,
    mode: FillMode,
    config: &BackgroundConfig,
) -> BackgroundModel {
    let background = samples_where(roi, mask, |m| m == 0);

    if matches!(mode, FillMode::Auto | FillMode::Solid) {
        if let Some(color) = solid_color(background.view(), config.solid_std_threshold) {
            log::debug!("Background model: solid {color:?}");
            return BackgroundModel::Solid { color };
        }
    }

    if matches!(mode, FillMode::Auto | FillMode::Gradient)
        && background.nrows() > config.min_background_pixels
    {
        if let Some(fit) = fit_gradient(
            roi,
            mask,
            config.gradient_mae_threshold,
            config.gradient_edge_span,
        ) {
            log::debug!("Background model: gradient {fit:?}");
            return BackgroundModel::Gradient {
                direction: fit.direction,
                start_color: fit.start_color,
                end_color: fit.end_color,
                fit_error: fit.mae,
            };
        }
    }

    log::debug!("Background model: inpaint ({})", config.inpaint_method);
    BackgroundModel::Inpainted {
        method: config.inpaint_method,
        radius: config.inpaint_radius,
    }
}

pub fn solid_fill(width: u32, height: u32, color: [u8; 3]) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb(color))
}

pub fn gradient_fill(
    width: u32,
    height: u32,
    direction: GradientDirection,
    start_color: [u8; 3],
    end_color: [u8; 3],
) -> RgbImage {
    let lerp = |position: u32, len: u32| {
        let t = position as f32 / len.saturating_sub(1).max(1) as f32;
        Rgb([0, 1, 2].map(|ch| {
            (start_color[ch] as f32 * (1.0 - t) + end_color[ch] as f32 * t) as u8
        }))
    };
    RgbImage::from_fn(width, height, |x, y| match direction {
        GradientDirection::Horizontal => lerp(x, width),
        GradientDirection::Vertical => lerp(y, height),
    })
}

/// Analytic fill for the whole ROI, or `None` for models that need inpainting.
pub fn generate_fill(width: u32, height: u32, model: &BackgroundModel) -> Option<RgbImage> {
    match *model {
        BackgroundModel::Solid { color } => Some(solid_fill(width, height, color)),
        BackgroundModel::Gradient {
            direction,
            start_color,
            end_color,
            ..
        } => Some(gradient_fill(width, height, direction, start_color, end_color)),
        BackgroundModel::Inpainted { .. } => None,
    }
}

/// Rebuilds the masked pixels of `roi` according to `model`. Background
/// pixels are returned as they were.
#[instrument(level = "debug", skip(roi, mask))]
pub fn reconstruct(roi: &RgbImage, mask: &Mask, model: &BackgroundModel) -> Result<RgbImage> {
    ensure_same_size(roi, mask)?;
    if let BackgroundModel::Inpainted { method, radius } = *model {
        return inpaint(roi, mask, method, radius);
    }
    let fill = generate_fill(roi.width(), roi.height(), model).ok_or_else(|| {
        PatchError::Reconstruction(format!("no analytic fill for {} model", model.name()))
    })?;

    let mut filled = roi.clone();
    for ((out, fill), m) in filled.pixels_mut().zip(fill.pixels()).zip(mask.pixels()) {
        if m[0] > 0 {
            *out = *fill;
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use image::{GrayImage, Luma};

    use super::*;

    fn centre_mask(w: u32, h: u32, margin: u32) -> Mask {
        GrayImage::from_fn(w, h, |x, y| {
            let inside = x >= margin && x < w - margin && y >= margin && y < h - margin;
            Luma([if inside { 255 } else { 0 }])
        })
    }

    fn with_text(mut roi: RgbImage, mask: &Mask) -> RgbImage {
        for (x, y, m) in mask.enumerate_pixels() {
            if m[0] > 0 {
                roi.put_pixel(x, y, Rgb([10, 10, 10]));
            }
        }
        roi
    }

    #[test]
    fn solid_background_is_detected() {
        let mask = centre_mask(40, 30, 8);
        let roi = with_text(RgbImage::from_pixel(40, 30, Rgb([250, 248, 240])), &mask);
        let model = classify_background(&roi, &mask, FillMode::Auto, &BackgroundConfig::default());
        assert_eq!(model, BackgroundModel::Solid { color: [250, 248, 240] });

        let filled = reconstruct(&roi, &mask, &model).unwrap();
        assert!(filled.pixels().all(|p| *p == Rgb([250, 248, 240])));
    }

    #[test]
    fn noisy_solid_background_uses_mean() {
        let mask = centre_mask(40, 30, 8);
        let roi = RgbImage::from_fn(40, 30, |x, y| {
            let jitter = ((x + y) % 2) as u8 * 4;
            Rgb([100 + jitter, 150 + jitter, 200 + jitter])
        });
        let roi = with_text(roi, &mask);
        match classify_background(&roi, &mask, FillMode::Auto, &BackgroundConfig::default()) {
            BackgroundModel::Solid { color } => {
                assert!((101..=103).contains(&color[0]), "{color:?}");
                assert!((151..=153).contains(&color[1]), "{color:?}");
            }
            other => panic!("expected solid, got {other:?}"),
        }
    }

    #[test]
    fn horizontal_ramp_is_a_gradient() {
        let mask = centre_mask(120, 40, 12);
        let ramp = RgbImage::from_fn(120, 40, |x, _| Rgb([(x * 2) as u8, 80, 255 - (x * 2) as u8]));
        let roi = with_text(ramp.clone(), &mask);
        let model = classify_background(&roi, &mask, FillMode::Auto, &BackgroundConfig::default());
        let BackgroundModel::Gradient {
            direction,
            start_color,
            end_color,
            fit_error,
        } = model
        else {
            panic!("expected gradient, got {model:?}");
        };
        assert_eq!(direction, GradientDirection::Horizontal);
        assert!(fit_error < 1.0);
        assert_eq!(start_color, [4, 80, 251]);
        assert_eq!(end_color, [234, 80, 21]);

        let filled = reconstruct(&roi, &mask, &model).unwrap();
        for (x, y, m) in mask.enumerate_pixels() {
            let got = filled.get_pixel(x, y);
            let want = ramp.get_pixel(x, y);
            if m[0] == 0 {
                assert_eq!(got, roi.get_pixel(x, y));
            } else {
                for ch in 0..3 {
                    assert!((got[ch] as i32 - want[ch] as i32).abs() <= 8);
                }
            }
        }
    }

    #[test]
    fn vertical_ramp_is_a_gradient() {
        let mask = centre_mask(60, 100, 15);
        let roi = with_text(
            RgbImage::from_fn(60, 100, |_, y| Rgb([40 + y as u8 * 2; 3])),
            &mask,
        );
        let model = classify_background(&roi, &mask, FillMode::Auto, &BackgroundConfig::default());
        assert!(matches!(
            model,
            BackgroundModel::Gradient {
                direction: GradientDirection::Vertical,
                ..
            }
        ));
    }

    #[test]
    fn texture_falls_back_to_inpaint() {
        let mask = centre_mask(64, 64, 16);
        let roi = RgbImage::from_fn(64, 64, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        let model = classify_background(&roi, &mask, FillMode::Auto, &BackgroundConfig::default());
        assert_eq!(
            model,
            BackgroundModel::Inpainted {
                method: InpaintMethod::Telea,
                radius: DEFAULT_INPAINT_RADIUS
            }
        );
    }

    #[test]
    fn forced_modes_skip_branches() {
        let mask = centre_mask(40, 30, 8);
        let roi = RgbImage::from_pixel(40, 30, Rgb([9, 9, 9]));
        let config = BackgroundConfig::default();

        let forced = classify_background(&roi, &mask, FillMode::Inpaint, &config);
        assert_eq!(forced.name(), "inpaint");

        // A flat background is also a perfect (zero-slope) gradient.
        let gradient = classify_background(&roi, &mask, FillMode::Gradient, &config);
        assert_eq!(gradient.name(), "gradient");
    }

    #[test]
    fn gradient_needs_enough_background() {
        let mask = centre_mask(12, 12, 2);
        let roi = RgbImage::from_fn(12, 12, |x, _| Rgb([(x * 20) as u8; 3]));
        let config = BackgroundConfig::default();
        let model = classify_background(&roi, &mask, FillMode::Gradient, &config);
        assert_eq!(model.name(), "inpaint");

        let relaxed = BackgroundConfig {
            min_background_pixels: 10,
            ..config
        };
        let model = classify_background(&roi, &mask, FillMode::Gradient, &relaxed);
        assert_eq!(model.name(), "gradient");
    }

    #[test]
    fn thresholds_are_configurable() {
        let mask = centre_mask(40, 30, 8);
        let roi = RgbImage::from_fn(40, 30, |x, _| Rgb([100 + (x % 2) as u8 * 30; 3]));
        let strict = BackgroundConfig::default();
        assert_ne!(classify_background(&roi, &mask, FillMode::Solid, &strict).name(), "solid");

        let loose = BackgroundConfig {
            solid_std_threshold: 20.0,
            ..strict
        };
        assert_eq!(classify_background(&roi, &mask, FillMode::Solid, &loose).name(), "solid");
    }

    #[test]
    fn records_debug_parameters() {
        let mut debug_info = DebugInfo::new();
        BackgroundModel::Gradient {
            direction: GradientDirection::Vertical,
            start_color: [1, 2, 3],
            end_color: [4, 5, 6],
            fit_error: 0.5,
        }
        .record(&mut debug_info);
        assert_eq!(debug_info["bg_model"], "gradient");
        assert_eq!(debug_info["gradient_params"]["direction"], "vertical");
        assert_eq!(debug_info["gradient_params"]["start_color"], json!([1, 2, 3]));
    }

    #[test]
    fn line_fit_recovers_slope() {
        let (slope, intercept) = fit_line((0..10).map(|x| (x as f64, 3.0 * x as f64 + 2.0))).unwrap();
        assert!((slope - 3.0).abs() < 1e-9);
        assert!((intercept - 2.0).abs() < 1e-9);
        assert!(fit_line([(1.0, 1.0), (1.0, 2.0)].into_iter()).is_none());
    }
}
