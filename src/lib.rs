pub mod background;
pub mod compose;
mod error;
pub mod geometry;
pub mod inpaint;
pub mod mask;
mod result;
pub mod style;
pub mod util;

use image::RgbImage;
use rayon::prelude::*;
use serde_json::json;
use tracing::instrument;

pub use background::{BackgroundConfig, BackgroundModel, FillMode, GradientDirection};
pub use compose::{alpha_blend, transparent_patch, DEFAULT_FEATHER_SIGMA};
pub use error::*;
pub use inpaint::InpaintMethod;
pub use result::*;
pub use style::{estimate_style, ColorMethod, FontSizeMethod};

use background::{classify_background, reconstruct};
use compose::{build_patch, encode_png};
use geometry::{angle, clip_to_image, expand, quad_area};
use mask::{count_nonzero, edge, intersect, rasterize};
use util::{crop, decode_rgb};

pub struct PatchEngineBuilder {
    background: BackgroundConfig,
    feather_sigma: f32,
}

impl PatchEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn solid_std_threshold(mut self, threshold: f32) -> Self {
        self.background.solid_std_threshold = threshold;
        self
    }

    pub fn gradient_mae_threshold(mut self, threshold: f32) -> Self {
        self.background.gradient_mae_threshold = threshold;
        self
    }

    pub fn min_background_pixels(mut self, pixels: usize) -> Self {
        self.background.min_background_pixels = pixels;
        self
    }

    pub fn gradient_edge_span(mut self, span: usize) -> Self {
        self.background.gradient_edge_span = span;
        self
    }

    pub fn inpaint_method(mut self, method: InpaintMethod) -> Self {
        self.background.inpaint_method = method;
        self
    }

    pub fn inpaint_radius(mut self, radius: u32) -> Self {
        self.background.inpaint_radius = radius;
        self
    }

    pub fn feather_sigma(mut self, sigma: f32) -> Self {
        self.feather_sigma = sigma;
        self
    }

    #[instrument(skip(self), level = "debug")]
    pub fn build(self) -> PatchEngine {
        log::debug!("Background thresholds: {:?}", self.background);
        PatchEngine {
            background: self.background,
            feather_sigma: self.feather_sigma,
        }
    }
}

impl Default for PatchEngineBuilder {
    fn default() -> Self {
        Self {
            background: BackgroundConfig::default(),
            feather_sigma: DEFAULT_FEATHER_SIGMA,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatchEngine {
    background: BackgroundConfig,
    feather_sigma: f32,
}

impl Default for PatchEngine {
    fn default() -> Self {
        PatchEngineBuilder::default().build()
    }
}

impl PatchEngine {
    pub fn background_config(&self) -> &BackgroundConfig {
        &self.background
    }

    /// Decodes `image_bytes` and builds a transparent background patch for
    /// `candidate`. Never fails: errors are reported through the result.
    #[instrument(skip(self, image_bytes, candidate), fields(mode = %options.mode))]
    pub fn generate_patch(
        &self,
        image_bytes: &[u8],
        candidate: &Candidate,
        options: &PatchOptions,
    ) -> PatchResult {
        match decode_rgb(image_bytes) {
            Ok(image) => self.generate_patch_for_image(&image, candidate, options),
            Err(err) => {
                log::debug!("{err}");
                PatchResult::failed(err, BoundingBox::default(), options.debug_info())
            }
        }
    }

    #[instrument(skip(self, image, candidate), level = "debug")]
    pub fn generate_patch_for_image(
        &self,
        image: &RgbImage,
        candidate: &Candidate,
        options: &PatchOptions,
    ) -> PatchResult {
        let mut debug_info = options.debug_info();
        let mut bbox = BoundingBox::default();
        match self.patch(image, candidate, options, &mut bbox, &mut debug_info) {
            Ok(bytes) => PatchResult::succeeded(bytes, bbox, debug_info),
            Err(err) => {
                log::debug!("Patch for {bbox:?} failed: {err}");
                PatchResult::failed(err, bbox, debug_info)
            }
        }
    }

    /// Patches every candidate of one image. The image is decoded once and
    /// the candidates are processed in parallel; results keep input order.
    #[instrument(skip_all, fields(candidates = candidates.len()))]
    pub fn generate_patches(
        &self,
        image_bytes: &[u8],
        candidates: &[Candidate],
        options: &PatchOptions,
    ) -> Vec<PatchResult> {
        let image = match decode_rgb(image_bytes) {
            Ok(image) => image,
            Err(err) => {
                return candidates
                    .iter()
                    .map(|_| {
                        PatchResult::failed(err.clone(), BoundingBox::default(), options.debug_info())
                    })
                    .collect()
            }
        };
        candidates
            .par_iter()
            .map(|candidate| self.generate_patch_for_image(&image, candidate, options))
            .collect()
    }

    pub fn estimate_style(
        &self,
        image: &RgbImage,
        candidate: &Candidate,
        options: &StyleOptions,
    ) -> Result<TextStyle> {
        estimate_style(image, candidate, options)
    }

    /// `bbox` is updated as soon as the final region is known so failures
    /// still report it.
    fn patch(
        &self,
        image: &RgbImage,
        candidate: &Candidate,
        options: &PatchOptions,
        bbox: &mut BoundingBox,
        debug_info: &mut DebugInfo,
    ) -> Result<Vec<u8>> {
        let quad = candidate.quad()?;
        let original = candidate.bbox()?;
        debug_info.insert("bbox_orig".into(), json!(original));
        debug_info.insert("angle_deg".into(), json!(angle(&quad)));
        debug_info.insert("quad_area".into(), json!(quad_area(&quad)));

        let padding = options.padding;
        *bbox = clip_to_image(expand(original, padding)?, image.width(), image.height());
        debug_info.insert("bbox_final".into(), json!(*bbox));
        log::debug!("Working region {original:?} -> {bbox:?}");
        if bbox.is_empty() {
            return Err(PatchError::DegenerateRegion(format!(
                "{original:?} padded by {padding} has no area inside the {}x{} image",
                image.width(),
                image.height()
            )));
        }

        let mask = rasterize(&quad, image.width(), image.height());
        let roi = crop(image, *bbox);
        let roi_mask = crop(&mask, *bbox);
        debug_info.insert("mask_pixels".into(), json!(count_nonzero(&roi_mask)));

        let model = classify_background(&roi, &roi_mask, options.mode, &self.background);
        model.record(debug_info);
        let mut reconstructed = reconstruct(&roi, &roi_mask, &model)?;

        if let Some(width) = options.edge_blend {
            if !matches!(model, BackgroundModel::Inpainted { .. }) {
                reconstructed = self.blend_seam(&reconstructed, &roi_mask, width)?;
                debug_info.insert("edge_blend".into(), json!(width));
            }
        }

        #[cfg(feature = "debug")]
        dump_debug_images(*bbox, &roi, &roi_mask, &reconstructed);

        let local = BoundingBox::new(0, 0, bbox.w, bbox.h);
        let sigma = options.feather.then_some(self.feather_sigma);
        let patch = build_patch(&reconstructed, &roi_mask, local, sigma)?;
        encode_png(&patch)
    }

    /// Re-inpaints the inner `width` band of the mask so an analytic fill
    /// meets the surrounding texture without a hard seam.
    fn blend_seam(&self, filled: &RgbImage, mask: &mask::Mask, width: u32) -> Result<RgbImage> {
        let band = intersect(&edge(mask, width), mask);
        if count_nonzero(&band) == 0 {
            return Ok(filled.clone());
        }
        log::trace!("Blending {} seam pixels", count_nonzero(&band));
        inpaint::inpaint(
            filled,
            &band,
            self.background.inpaint_method,
            self.background.inpaint_radius,
        )
    }
}

pub fn generate_patch(
    image_bytes: &[u8],
    candidate: &Candidate,
    options: &PatchOptions,
) -> PatchResult {
    PatchEngine::default().generate_patch(image_bytes, candidate, options)
}

#[cfg(feature = "debug")]
fn dump_debug_images(
    bbox: BoundingBox,
    roi: &RgbImage,
    roi_mask: &mask::Mask,
    reconstructed: &RgbImage,
) {
    let dir = std::path::Path::new("debug_patches");
    if let Err(err) = std::fs::create_dir_all(dir) {
        log::warn!("Can't create {dir:?}: {err}");
        return;
    }
    let stem = format!("{}_{}_{}x{}", bbox.x, bbox.y, bbox.w, bbox.h);
    let saved = roi
        .save(dir.join(format!("{stem}_roi.png")))
        .and_then(|_| roi_mask.save(dir.join(format!("{stem}_mask.png"))))
        .and_then(|_| reconstructed.save(dir.join(format!("{stem}_reconstructed.png"))));
    if let Err(err) = saved {
        log::warn!("Failed to save debug images for {stem}: {err}");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchOptions {
    pub padding: u32,
    pub mode: FillMode,
    /// Echoed into `debug_info`; does not change behaviour.
    pub algo_version: String,
    pub feather: bool,
    /// Re-inpaint a band of this width along the inside of the mask edge
    /// after a solid or gradient fill.
    pub edge_blend: Option<u32>,
}

impl PatchOptions {
    fn debug_info(&self) -> DebugInfo {
        let mut debug_info = DebugInfo::new();
        debug_info.insert("mode".into(), json!(self.mode.as_str()));
        debug_info.insert("algo_version".into(), json!(self.algo_version));
        debug_info.insert("padding_px".into(), json!(self.padding));
        debug_info
    }
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            padding: 8,
            mode: FillMode::Auto,
            algo_version: "v1".to_string(),
            feather: true,
            edge_blend: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StyleOptions {
    pub color_method: ColorMethod,
    pub font_size_method: FontSizeMethod,
    pub debug: bool,
}
