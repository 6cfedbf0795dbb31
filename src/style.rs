use std::{fmt, str::FromStr};

use float_ord::FloatOrd;
use image::RgbImage;
use serde_json::json;
use tracing::instrument;

use crate::{
    mask::{self, count_nonzero, erode_square, nonzero_bbox, rasterize, Mask},
    BoundingBox, Candidate, Color, DebugInfo, FontWeight, Result, StyleOptions, TextStyle,
};

/// Returned when the mask selects no pixels at all.
pub const DEFAULT_TEXT_COLOR: Color = Color::rgb(30, 30, 30);

pub const MIN_FONT_SIZE: u32 = 12;
pub const MAX_FONT_SIZE: u32 = 500;

/// Below this many samples the eroded stroke core is ignored.
const MIN_CORE_SAMPLES: usize = 10;
const KMEANS_MAX_CLUSTERS: usize = 3;
const KMEANS_MAX_ITERATIONS: usize = 100;
const KMEANS_EPSILON: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ColorMethod {
    #[default]
    KMeans,
    Median,
    Mean,
    Edge,
}

impl ColorMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ColorMethod::KMeans => "kmeans",
            ColorMethod::Median => "median",
            ColorMethod::Mean => "mean",
            ColorMethod::Edge => "edge",
        }
    }
}

impl fmt::Display for ColorMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColorMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "kmeans" => Ok(ColorMethod::KMeans),
            "median" => Ok(ColorMethod::Median),
            "mean" => Ok(ColorMethod::Mean),
            "edge" => Ok(ColorMethod::Edge),
            other => Err(format!("unknown color method `{other}`")),
        }
    }
}

type Sample = [f32; 3];

fn collect_samples(image: &RgbImage, mask: &Mask) -> Vec<Sample> {
    image
        .pixels()
        .zip(mask.pixels())
        .filter(|(_, m)| m[0] > 0)
        .map(|(p, _)| p.0.map(f32::from))
        .collect()
}

/// Pixels of the eroded mask, or of the full mask if erosion leaves too few.
fn core_samples(image: &RgbImage, mask: &Mask, erosion: u8, all: &[Sample]) -> Vec<Sample> {
    let core = collect_samples(image, &erode_square(mask, erosion));
    if core.len() < MIN_CORE_SAMPLES {
        all.to_vec()
    } else {
        core
    }
}

fn to_color(sample: Sample) -> Color {
    let [r, g, b] = sample.map(|c| c.clamp(0.0, 255.0) as u8);
    Color::rgb(r, g, b)
}

#[instrument(level = "debug", skip(image, mask))]
pub fn estimate_color(image: &RgbImage, mask: &Mask, method: ColorMethod) -> Color {
    let samples = collect_samples(image, mask);
    if samples.is_empty() {
        return DEFAULT_TEXT_COLOR;
    }

    let colour = match method {
        ColorMethod::KMeans => {
            let core = core_samples(image, mask, 2, &samples);
            let k = core.len().min(KMEANS_MAX_CLUSTERS);
            if k >= 2 {
                dominant_cluster(&core, k)
            } else {
                channel_median(&core)
            }
        }
        ColorMethod::Edge => channel_median(&core_samples(image, mask, 6, &samples)),
        ColorMethod::Median => channel_median(&trim_luminance(&samples)),
        ColorMethod::Mean => channel_mean(&samples),
    };
    log::debug!("Estimated text colour {colour:?} with {method}");
    to_color(colour)
}

fn dist2(a: &Sample, b: &Sample) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn nearest(sample: &Sample, centres: &[Sample]) -> (usize, f32) {
    centres
        .iter()
        .enumerate()
        .map(|(i, c)| (i, dist2(sample, c)))
        .min_by_key(|&(_, d)| FloatOrd(d))
        .unwrap_or((0, 0.0))
}

/// Centre of the most populated cluster after Lloyd iterations. Seeding is
/// deterministic: the sample nearest the mean, then repeatedly the sample
/// farthest from all chosen centres.
fn dominant_cluster(samples: &[Sample], k: usize) -> Sample {
    let mean = channel_mean(samples);
    let Some(first) = samples.iter().min_by_key(|s| FloatOrd(dist2(s, &mean))) else {
        return mean;
    };
    let mut centres = vec![*first];
    while centres.len() < k {
        let next = samples
            .iter()
            .max_by_key(|s| FloatOrd(nearest(s, &centres).1))
            .copied()
            .unwrap_or(mean);
        centres.push(next);
    }

    let mut labels = vec![0usize; samples.len()];
    for iteration in 0..KMEANS_MAX_ITERATIONS {
        for (label, sample) in labels.iter_mut().zip(samples) {
            *label = nearest(sample, &centres).0;
        }

        let mut sums = vec![[0.0f32; 3]; k];
        let mut counts = vec![0usize; k];
        for (&label, sample) in labels.iter().zip(samples) {
            for ch in 0..3 {
                sums[label][ch] += sample[ch];
            }
            counts[label] += 1;
        }

        let mut shift = 0.0f32;
        for ((centre, sum), &count) in centres.iter_mut().zip(&sums).zip(&counts) {
            if count == 0 {
                continue;
            }
            let updated = sum.map(|s| s / count as f32);
            shift = shift.max(dist2(centre, &updated).sqrt());
            *centre = updated;
        }
        if shift < KMEANS_EPSILON {
            log::trace!("k-means converged after {} iterations", iteration + 1);
            break;
        }
    }

    let mut counts = vec![0usize; k];
    for sample in samples {
        counts[nearest(sample, &centres).0] += 1;
    }
    let largest = counts
        .iter()
        .enumerate()
        .max_by_key(|&(i, &count)| (count, std::cmp::Reverse(i)))
        .map_or(0, |(i, _)| i);
    centres[largest]
}

fn channel_mean(samples: &[Sample]) -> Sample {
    let n = samples.len().max(1) as f32;
    let mut sums = [0.0f32; 3];
    for sample in samples {
        for ch in 0..3 {
            sums[ch] += sample[ch];
        }
    }
    sums.map(|s| s / n)
}

fn median(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_unstable_by_key(|v| FloatOrd(*v));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

fn channel_median(samples: &[Sample]) -> Sample {
    [0, 1, 2].map(|ch| median(&mut samples.iter().map(|s| s[ch]).collect::<Vec<_>>()))
}

fn percentile(sorted: &[f32], q: f32) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = q / 100.0 * (sorted.len() - 1) as f32;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f32)
}

fn luminance(sample: &Sample) -> f32 {
    0.299 * sample[0] + 0.587 * sample[1] + 0.114 * sample[2]
}

/// Drops samples outside the 20th–80th luminance percentile, unless that
/// leaves too few to work with.
fn trim_luminance(samples: &[Sample]) -> Vec<Sample> {
    let mut lum = samples.iter().map(luminance).collect::<Vec<_>>();
    lum.sort_unstable_by_key(|v| FloatOrd(*v));
    let (low, high) = (percentile(&lum, 20.0), percentile(&lum, 80.0));

    let kept = samples
        .iter()
        .filter(|s| (low..=high).contains(&luminance(s)))
        .copied()
        .collect::<Vec<_>>();
    if kept.len() > MIN_CORE_SAMPLES {
        kept
    } else {
        samples.to_vec()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SizeInput<'a> {
    pub bbox: BoundingBox,
    pub text: &'a str,
    pub confidence: f32,
    pub mask: Option<&'a Mask>,
}

pub trait FontSizeStrategy: Sync {
    fn name(&self) -> &'static str;

    /// `None` when the strategy cannot judge this input.
    fn estimate(&self, input: &SizeInput<'_>) -> Option<u32>;
}

fn clamp_size(size: f32) -> u32 {
    (size.max(0.0) as u32).clamp(MIN_FONT_SIZE, MAX_FONT_SIZE)
}

fn has_full_block_glyphs(text: &str) -> bool {
    text.chars().any(|c| ('\u{4e00}'..='\u{9fff}').contains(&c))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PixelProjection;

impl PixelProjection {
    const BODY_DENSITY: f32 = 0.3;
    const CAP_RATIO_FULL_BLOCK: f32 = 0.75;
    const CAP_RATIO_LATIN: f32 = 0.68;
}

impl FontSizeStrategy for PixelProjection {
    fn name(&self) -> &'static str {
        "pixel"
    }

    fn estimate(&self, input: &SizeInput<'_>) -> Option<u32> {
        let mask = input.mask?;
        let bbox = input.bbox;
        if bbox.h <= 0 || mask.width() == 0 || mask.height() == 0 {
            return None;
        }

        let x0 = bbox.x.clamp(0, mask.width() as i32 - 1) as u32;
        let y0 = bbox.y.clamp(0, mask.height() as i32 - 1) as u32;
        let x1 = (x0 as i64 + bbox.w as i64).min(mask.width() as i64) as u32;
        let y1 = (y0 as i64 + bbox.h as i64).min(mask.height() as i64) as u32;
        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        let projection = (y0..y1)
            .map(|y| (x0..x1).filter(|&x| mask.get_pixel(x, y)[0] > 0).count())
            .collect::<Vec<_>>();
        let peak = projection.iter().copied().max().unwrap_or(0);
        if peak == 0 {
            return None;
        }
        let body_rows = projection
            .iter()
            .filter(|&&count| count as f32 / peak as f32 > Self::BODY_DENSITY)
            .count();
        if body_rows == 0 {
            return None;
        }

        let cap_ratio = if has_full_block_glyphs(input.text) {
            Self::CAP_RATIO_FULL_BLOCK
        } else {
            Self::CAP_RATIO_LATIN
        };
        Some(clamp_size(body_rows as f32 / cap_ratio))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptiveHeuristic;

impl FontSizeStrategy for AdaptiveHeuristic {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn estimate(&self, input: &SizeInput<'_>) -> Option<u32> {
        let height = input.bbox.h;
        if height <= 0 {
            return None;
        }

        let letters = input.text.chars().filter(|c| c.is_alphabetic());
        let has_upper = letters.clone().any(char::is_uppercase);
        let has_lower = letters.clone().any(char::is_lowercase);
        let base = if has_full_block_glyphs(input.text) {
            0.80
        } else if has_upper && !has_lower {
            0.70
        } else if has_lower && !has_upper {
            // descenders take up part of the box
            0.85
        } else {
            0.75
        };

        let height_adjust = match height {
            h if h < 20 => 1.05,
            h if h < 40 => 1.0,
            h if h < 60 => 0.97,
            _ => 0.94,
        };

        let confidence_adjust = if input.confidence < 0.7 {
            0.95
        } else if input.confidence < 0.85 {
            0.98
        } else {
            1.0
        };

        Some(clamp_size(
            height as f32 * base * height_adjust * confidence_adjust,
        ))
    }
}

/// `bbox height * ratio`; always answers.
#[derive(Debug, Clone, Copy)]
pub struct FixedRatio(pub f32);

impl Default for FixedRatio {
    fn default() -> Self {
        FixedRatio(0.75)
    }
}

impl FontSizeStrategy for FixedRatio {
    fn name(&self) -> &'static str {
        "simple"
    }

    fn estimate(&self, input: &SizeInput<'_>) -> Option<u32> {
        Some(clamp_size(input.bbox.h as f32 * self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FontSizeMethod {
    #[default]
    Auto,
    Pixel,
    Adaptive,
    Simple,
}

const AUTO_CHAIN: &[&dyn FontSizeStrategy] = &[&PixelProjection, &AdaptiveHeuristic, &FixedRatio(0.75)];
const PIXEL_CHAIN: &[&dyn FontSizeStrategy] = &[&PixelProjection, &FixedRatio(0.75)];
const ADAPTIVE_CHAIN: &[&dyn FontSizeStrategy] = &[&AdaptiveHeuristic, &FixedRatio(0.75)];
const SIMPLE_CHAIN: &[&dyn FontSizeStrategy] = &[&FixedRatio(0.75)];

impl FontSizeMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            FontSizeMethod::Auto => "auto",
            FontSizeMethod::Pixel => "pixel",
            FontSizeMethod::Adaptive => "adaptive",
            FontSizeMethod::Simple => "simple",
        }
    }

    pub fn chain(self) -> &'static [&'static dyn FontSizeStrategy] {
        match self {
            FontSizeMethod::Auto => AUTO_CHAIN,
            FontSizeMethod::Pixel => PIXEL_CHAIN,
            FontSizeMethod::Adaptive => ADAPTIVE_CHAIN,
            FontSizeMethod::Simple => SIMPLE_CHAIN,
        }
    }
}

impl fmt::Display for FontSizeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FontSizeMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "auto" => Ok(FontSizeMethod::Auto),
            "pixel" => Ok(FontSizeMethod::Pixel),
            "adaptive" => Ok(FontSizeMethod::Adaptive),
            "simple" => Ok(FontSizeMethod::Simple),
            other => Err(format!("unknown font size method `{other}`")),
        }
    }
}

pub fn estimate_font_size(
    input: &SizeInput<'_>,
    chain: &[&dyn FontSizeStrategy],
) -> (u32, &'static str) {
    for strategy in chain {
        match strategy.estimate(input) {
            Some(size) => return (size, strategy.name()),
            None => log::debug!("Font size strategy `{}` not applicable", strategy.name()),
        }
    }
    let fallback = FixedRatio::default();
    (fallback.estimate(input).unwrap_or(MIN_FONT_SIZE), fallback.name())
}

/// Stroke weight from how much of its own bounding rectangle the mask fills.
pub fn estimate_font_weight(mask: &Mask) -> FontWeight {
    let Some(bounds) = nonzero_bbox(mask) else {
        return FontWeight::Normal;
    };
    let fill_ratio = count_nonzero(mask) as f64 / bounds.area() as f64;
    if fill_ratio > 0.5 {
        FontWeight::Bold
    } else if fill_ratio > 0.35 {
        FontWeight::Semibold
    } else {
        FontWeight::Normal
    }
}

fn text_preview(text: &str) -> String {
    const PREVIEW_CHARS: usize = 20;
    if text.chars().count() > PREVIEW_CHARS {
        format!("{}...", text.chars().take(PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

/// Mean colour of the band just outside the text, if any.
fn surrounding_color(image: &RgbImage, mask: &Mask) -> Option<[u8; 3]> {
    let band = mask::ring(&mask::dilate(mask, 5), mask);
    let samples = collect_samples(image, &band);
    (!samples.is_empty()).then(|| to_color(channel_mean(&samples)).to_rgb())
}

#[instrument(level = "debug", skip(image, candidate), fields(text = %candidate.text))]
pub fn estimate_style(
    image: &RgbImage,
    candidate: &Candidate,
    options: &StyleOptions,
) -> Result<TextStyle> {
    let quad = candidate.quad()?;
    let bbox = candidate.bbox()?;
    let mask = rasterize(&quad, image.width(), image.height());

    let color = estimate_color(image, &mask, options.color_method);
    let input = SizeInput {
        bbox,
        text: &candidate.text,
        confidence: candidate.confidence,
        mask: Some(&mask),
    };
    let (font_size, size_method) = estimate_font_size(&input, options.font_size_method.chain());
    let font_weight = estimate_font_weight(&mask);
    log::debug!("Font size {font_size}px via {size_method}, weight {font_weight:?}");

    let mut style = TextStyle::new(color, font_size, font_weight);
    if options.debug {
        let mut debug = DebugInfo::new();
        debug.insert("color_rgb".into(), json!(color.to_rgb()));
        debug.insert("color_method".into(), json!(options.color_method.as_str()));
        debug.insert("font_size_method".into(), json!(size_method));
        debug.insert("sample_count".into(), json!(count_nonzero(&mask)));
        debug.insert("text_preview".into(), json!(text_preview(&candidate.text)));
        if let Some(background) = surrounding_color(image, &mask) {
            debug.insert("background_rgb".into(), json!(background));
        }
        style.debug = Some(debug);
    }
    Ok(style)
}
