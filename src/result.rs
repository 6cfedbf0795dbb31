use imageproc::point::Point;
use serde::{Deserialize, Serialize, Serializer};

use crate::{geometry, PatchError, Result};

pub type DebugInfo = serde_json::Map<String, serde_json::Value>;

/// Axis-aligned integer rectangle. After clipping `w` and `h` are never negative,
/// but either may be zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl BoundingBox {
    pub const fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }

    pub fn area(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.w as u64 * self.h as u64
        }
    }

    pub fn right(&self) -> i64 {
        self.x as i64 + self.w as i64
    }

    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.h as i64
    }
}

/// The four corners of a detected text region, in OCR order. The first edge
/// (points 0 → 1) is the text baseline direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quad(pub [Point<i32>; 4]);

impl Quad {
    pub fn new(points: [[i32; 2]; 4]) -> Self {
        Self(points.map(|[x, y]| Point::new(x, y)))
    }

    pub fn points(&self) -> &[Point<i32>; 4] {
        &self.0
    }
}

impl TryFrom<&[[i32; 2]]> for Quad {
    type Error = PatchError;

    fn try_from(points: &[[i32; 2]]) -> Result<Self> {
        let points: [[i32; 2]; 4] = points.try_into().map_err(|_| {
            PatchError::InvalidCandidate(format!(
                "quad must have exactly 4 points, got {}",
                points.len()
            ))
        })?;
        let quad = Quad::new(points);
        geometry::quad_to_bbox(&quad)?;
        Ok(quad)
    }
}

fn default_confidence() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub quad: Vec<[i32; 2]>,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
    #[serde(default)]
    pub text: String,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

impl Candidate {
    pub fn new(quad: [[i32; 2]; 4]) -> Self {
        Self {
            quad: quad.to_vec(),
            bbox: None,
            text: String::new(),
            confidence: default_confidence(),
        }
    }

    pub fn with_bbox(mut self, bbox: BoundingBox) -> Self {
        self.bbox = Some(bbox);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>, confidence: f32) -> Self {
        self.text = text.into();
        self.confidence = confidence;
        self
    }

    pub fn quad(&self) -> Result<Quad> {
        Quad::try_from(self.quad.as_slice())
    }

    /// The explicit bbox if one was supplied, otherwise the one spanned by the quad.
    pub fn bbox(&self) -> Result<BoundingBox> {
        match self.bbox {
            Some(bbox) => Ok(bbox),
            None => geometry::quad_to_bbox(&self.quad()?),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatchResult {
    pub success: bool,
    /// Lossless RGBA PNG, present iff `success`.
    pub image_bytes: Option<Vec<u8>>,
    pub bbox: BoundingBox,
    pub debug_info: DebugInfo,
    pub error: Option<PatchError>,
}

impl PatchResult {
    pub(crate) fn succeeded(image_bytes: Vec<u8>, bbox: BoundingBox, debug_info: DebugInfo) -> Self {
        Self {
            success: true,
            image_bytes: Some(image_bytes),
            bbox,
            debug_info,
            error: None,
        }
    }

    pub(crate) fn failed(error: PatchError, bbox: BoundingBox, debug_info: DebugInfo) -> Self {
        Self {
            success: false,
            image_bytes: None,
            bbox,
            debug_info,
            error: Some(error),
        }
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    pub fn to_rgb(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }

    /// CSS `rgba()` notation with the alpha written as a fraction.
    pub fn to_css(self) -> String {
        format!(
            "rgba({},{},{},{:.2})",
            self.r,
            self.g,
            self.b,
            self.a as f32 / 255.0
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FontWeight {
    Normal = 400,
    Semibold = 600,
    Bold = 700,
}

impl FontWeight {
    pub fn value(self) -> u16 {
        self as u16
    }
}

impl Serialize for FontWeight {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.value())
    }
}

fn serialize_fill<S: Serializer>(color: &Color, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&color.to_css())
}

pub const DEFAULT_FONT_FAMILY: &str = "System";
pub const DEFAULT_LINE_HEIGHT: f64 = 1.2;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextStyle {
    pub font_family: String,
    pub font_size: u32,
    pub font_weight: FontWeight,
    #[serde(rename = "fill", serialize_with = "serialize_fill")]
    pub color: Color,
    pub letter_spacing: f64,
    pub line_height: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugInfo>,
}

impl TextStyle {
    pub fn new(color: Color, font_size: u32, font_weight: FontWeight) -> Self {
        Self {
            font_family: DEFAULT_FONT_FAMILY.to_string(),
            font_size,
            font_weight,
            color,
            letter_spacing: 0.0,
            line_height: DEFAULT_LINE_HEIGHT,
            debug: None,
        }
    }

    pub fn fill(&self) -> String {
        self.color.to_css()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_requires_four_points() {
        let points = [[0, 0], [10, 0], [10, 10]];
        let err = Quad::try_from(&points[..]).unwrap_err();
        assert!(matches!(err, PatchError::InvalidCandidate(_)));

        let points = [[i32::MIN, 0], [i32::MAX, 0], [i32::MAX, 10], [i32::MIN, 10]];
        let err = Quad::try_from(&points[..]).unwrap_err();
        assert!(matches!(err, PatchError::InvalidCandidate(_)));
    }

    #[test]
    fn candidate_parses_api_shape() {
        let candidate: Candidate = serde_json::from_str(
            r#"{"quad": [[120,80],[540,80],[540,144],[120,144]],
                "bbox": {"x": 120, "y": 80, "w": 420, "h": 64},
                "text": "Hello"}"#,
        )
        .unwrap();
        assert_eq!(candidate.bbox, Some(BoundingBox::new(120, 80, 420, 64)));
        assert_eq!(candidate.confidence, 1.0);
        assert_eq!(candidate.quad().unwrap().points()[2], Point::new(540, 144));
    }

    #[test]
    fn candidate_bbox_falls_back_to_quad() {
        let candidate = Candidate::new([[5, 7], [25, 7], [25, 19], [5, 19]]);
        assert_eq!(candidate.bbox().unwrap(), BoundingBox::new(5, 7, 20, 12));
    }

    #[test]
    fn style_serializes_like_the_api_expects() {
        let style = TextStyle::new(Color::rgb(30, 30, 30), 32, FontWeight::Semibold);
        let json = serde_json::to_value(&style).unwrap();
        assert_eq!(json["fontFamily"], "System");
        assert_eq!(json["fontSize"], 32);
        assert_eq!(json["fontWeight"], 600);
        assert_eq!(json["fill"], "rgba(30,30,30,1.00)");
        assert_eq!(json["letterSpacing"], 0.0);
        assert!(json.get("debug").is_none());
    }
}
