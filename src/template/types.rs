use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tolerance for floating-point noise at the unit-square edges.
const UNIT_EPSILON: f32 = 1e-4;

// ═══════════════════════════════════════════════════════════
// Geometry
// ═══════════════════════════════════════════════════════════

/// Which side of the paper form a field lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageSide {
    Front,
    Back,
}

impl PageSide {
    pub const ALL: [PageSide; 2] = [PageSide::Front, PageSide::Back];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Front => "front",
            Self::Back => "back",
        }
    }
}

impl fmt::Display for PageSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PageSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "front" => Ok(Self::Front),
            "back" => Ok(Self::Back),
            other => Err(format!("unknown page side: {other}")),
        }
    }
}

/// Normalized rectangle in page coordinates, `[0,1]` on both axes.
///
/// Used both for template field regions and for bounding boxes reported
/// by the vision service.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Absolute pixel rectangle, always at least 1×1 and inside the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Finite, positive-size and contained in the unit square.
    pub fn is_valid(&self) -> bool {
        let finite = [self.x, self.y, self.width, self.height]
            .iter()
            .all(|v| v.is_finite());
        finite
            && self.x >= 0.0
            && self.y >= 0.0
            && self.width > 0.0
            && self.height > 0.0
            && self.x + self.width <= 1.0 + UNIT_EPSILON
            && self.y + self.height <= 1.0 + UNIT_EPSILON
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Inclusive point containment.
    pub fn contains_point(&self, px: f32, py: f32) -> bool {
        px >= self.x && px <= self.x + self.width && py >= self.y && py <= self.y + self.height
    }

    /// Grow by `margin` on every side, clamped to the unit square.
    pub fn expanded(&self, margin: f32) -> Region {
        let x0 = (self.x - margin).max(0.0);
        let y0 = (self.y - margin).max(0.0);
        let x1 = (self.x + self.width + margin).min(1.0);
        let y1 = (self.y + self.height + margin).min(1.0);
        Region::new(x0, y0, (x1 - x0).max(0.0), (y1 - y0).max(0.0))
    }

    /// Round every coordinate to `decimals` places.
    pub fn rounded(&self, decimals: u32) -> Region {
        let factor = 10f32.powi(decimals as i32);
        let round = |v: f32| (v * factor).round() / factor;
        Region::new(
            round(self.x),
            round(self.y),
            round(self.width),
            round(self.height),
        )
    }

    /// Euclidean distance between the two region centers.
    pub fn center_distance(&self, other: &Region) -> f32 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }

    /// Map to an absolute pixel rectangle on a `width`×`height` image.
    ///
    /// Coordinates are floored; the result is clamped to at least 1×1 and
    /// to the image bounds. Returns `None` for a zero-sized image.
    pub fn to_pixel_rect(&self, width: u32, height: u32) -> Option<PixelRect> {
        if width == 0 || height == 0 {
            return None;
        }
        let to_px = |v: f32, dim: u32| -> u32 {
            let scaled = (v.max(0.0) * dim as f32).floor();
            (scaled as u32).min(dim)
        };

        let x = to_px(self.x, width).min(width - 1);
        let y = to_px(self.y, height).min(height - 1);
        let w = to_px(self.width, width).max(1).min(width - x);
        let h = to_px(self.height, height).max(1).min(height - y);

        Some(PixelRect {
            x,
            y,
            width: w,
            height: h,
        })
    }
}

// ═══════════════════════════════════════════════════════════
// Field definitions
// ═══════════════════════════════════════════════════════════

/// How a field's value is read off the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionKind {
    TextRegion,
    CheckboxSingle,
    CheckboxMulti,
    CheckboxWithText,
    CheckboxMultiWithText,
    CheckboxNested,
    CheckboxMatrix,
    Signature,
}

impl ExtractionKind {
    /// Whether a natural-language query answer can stand in for this field.
    pub fn supports_query(&self) -> bool {
        matches!(self, Self::TextRegion)
    }

    pub fn is_mark(&self) -> bool {
        !matches!(self, Self::TextRegion)
    }
}

/// Validator selector for the correction layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SemanticType {
    Date,
    Phone,
    HealthId,
    ControlNumber,
    Categorical,
    Place,
    Facility,
    Age,
    Sex,
}

/// One checkbox within a composite field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckboxOption {
    /// Value reported when this option is checked.
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
    /// Free-text area read only when the box is checked ("Other: ____").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_region: Option<Region>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_pattern: Option<String>,
    /// Dependent fields extracted only under a checked parent.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sub_fields: BTreeMap<String, FieldDefinition>,
}

/// A matrix row: either an option list or a checkbox paired with a date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixSection {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<CheckboxOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkbox: Option<Region>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_region: Option<Region>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub label: String,
    pub method: ExtractionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
    /// Regex the extracted text is expected to match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Natural-language question; its presence makes the field query-eligible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Declared query aliases, tried before any generated spelling.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_type: Option<SemanticType>,
    /// Canonical values for `categorical` fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<CheckboxOption>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sections: Vec<MatrixSection>,
}

impl FieldDefinition {
    /// Plain text field with a region.
    pub fn text(label: &str, region: Region) -> Self {
        Self {
            label: label.to_string(),
            method: ExtractionKind::TextRegion,
            region: Some(region),
            pattern: None,
            query: None,
            aliases: Vec::new(),
            semantic_type: None,
            allowed_values: Vec::new(),
            required: false,
            options: Vec::new(),
            sections: Vec::new(),
        }
    }

    /// The field's region if it is present and well-formed.
    pub fn usable_region(&self) -> Option<Region> {
        self.region.filter(Region::is_valid)
    }
}

// ═══════════════════════════════════════════════════════════
// Template document
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageTemplate {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDefinition>,
}

/// Field names the cross-field rules read. Defaults match the
/// conventional names used by the bundled templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossFieldNames {
    pub birth_date: String,
    pub test_date: String,
    pub previous_test_date: String,
    pub age: String,
    pub sex: String,
    pub pregnant: String,
}

impl Default for CrossFieldNames {
    fn default() -> Self {
        Self {
            birth_date: "birth_date".into(),
            test_date: "test_date".into(),
            previous_test_date: "previous_test_date".into(),
            age: "age".into(),
            sex: "sex".into(),
            pregnant: "is_pregnant".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationRules {
    pub cross_field: bool,
    pub names: CrossFieldNames,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            cross_field: true,
            names: CrossFieldNames::default(),
        }
    }
}

/// Versioned field-definition document for one form type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormTemplate {
    pub template_id: String,
    pub name: String,
    /// Semantic version; the patch component is bumped on every save.
    pub version: String,
    #[serde(default)]
    pub calibration_count: u32,
    #[serde(default)]
    pub last_calibrated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pages: BTreeMap<PageSide, PageTemplate>,
    #[serde(default)]
    pub validation: ValidationRules,
}

impl FormTemplate {
    pub fn new(template_id: &str, name: &str) -> Self {
        Self {
            template_id: template_id.to_string(),
            name: name.to_string(),
            version: "1.0.0".to_string(),
            calibration_count: 0,
            last_calibrated: None,
            pages: BTreeMap::new(),
            validation: ValidationRules::default(),
        }
    }

    pub fn page(&self, side: PageSide) -> Option<&PageTemplate> {
        self.pages.get(&side)
    }

    pub fn field(&self, side: PageSide, name: &str) -> Option<&FieldDefinition> {
        self.pages.get(&side).and_then(|p| p.fields.get(name))
    }

    pub fn field_mut(&mut self, side: PageSide, name: &str) -> Option<&mut FieldDefinition> {
        self.pages.get_mut(&side).and_then(|p| p.fields.get_mut(name))
    }

    /// Insert a field, creating the page entry when needed.
    pub fn insert_field(&mut self, side: PageSide, name: &str, field: FieldDefinition) {
        self.pages
            .entry(side)
            .or_default()
            .fields
            .insert(name.to_string(), field);
    }

    /// Names of required fields across both pages.
    pub fn required_fields(&self) -> Vec<(PageSide, String)> {
        self.pages
            .iter()
            .flat_map(|(side, page)| {
                page.fields
                    .iter()
                    .filter(|(_, f)| f.required)
                    .map(move |(name, _)| (*side, name.clone()))
            })
            .collect()
    }

    /// Every declared region that is malformed, as `(page, field)` pairs.
    pub fn invalid_regions(&self) -> Vec<(PageSide, String)> {
        let mut bad = Vec::new();
        for (side, page) in &self.pages {
            for (name, field) in &page.fields {
                let own = field.region.is_some_and(|r| !r.is_valid());
                let nested = field
                    .options
                    .iter()
                    .filter_map(|o| o.region)
                    .chain(field.sections.iter().filter_map(|s| s.checkbox))
                    .any(|r| !r.is_valid());
                if own || nested {
                    bad.push((*side, name.clone()));
                }
            }
        }
        bad
    }
}

/// Bump the patch component of a `major.minor.patch` version string.
/// Unparseable versions restart at `1.0.1`.
pub fn bump_patch_version(version: &str) -> String {
    let parts: Vec<u64> = version
        .split('.')
        .map(|p| p.trim().parse::<u64>())
        .collect::<Result<_, _>>()
        .unwrap_or_default();
    match parts.as_slice() {
        [major, minor, patch] => format!("{major}.{minor}.{}", patch + 1),
        _ => "1.0.1".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_validity() {
        assert!(Region::new(0.1, 0.1, 0.2, 0.05).is_valid());
        assert!(Region::new(0.0, 0.0, 1.0, 1.0).is_valid());
        assert!(!Region::new(0.9, 0.1, 0.2, 0.05).is_valid());
        assert!(!Region::new(-0.1, 0.1, 0.2, 0.05).is_valid());
        assert!(!Region::new(0.1, 0.1, 0.0, 0.05).is_valid());
        assert!(!Region::new(f32::NAN, 0.1, 0.2, 0.05).is_valid());
    }

    #[test]
    fn expanded_region_clamped_to_unit_square() {
        let r = Region::new(0.01, 0.5, 0.2, 0.1).expanded(0.02);
        assert!(r.x.abs() < f32::EPSILON);
        assert!((r.y - 0.48).abs() < 1e-6);
        assert!((r.width - 0.23).abs() < 1e-6);
        assert!((r.height - 0.14).abs() < 1e-6);

        let edge = Region::new(0.9, 0.95, 0.1, 0.05).expanded(0.05);
        assert!((edge.x + edge.width - 1.0).abs() < 1e-6);
        assert!((edge.y + edge.height - 1.0).abs() < 1e-6);
    }

    #[test]
    fn rounding_to_three_decimals() {
        let r = Region::new(0.12345, 0.67891, 0.1, 0.0504).rounded(3);
        assert!((r.x - 0.123).abs() < 1e-6);
        assert!((r.y - 0.679).abs() < 1e-6);
        assert!((r.height - 0.050).abs() < 1e-6);
    }

    #[test]
    fn center_distance_symmetric_and_zero_on_same_center() {
        let a = Region::new(0.1, 0.1, 0.2, 0.2);
        let b = Region::new(0.4, 0.5, 0.2, 0.2);
        assert!((a.center_distance(&b) - b.center_distance(&a)).abs() < f32::EPSILON);
        assert!((a.center_distance(&b) - 0.5).abs() < 1e-6);

        let same_center = Region::new(0.15, 0.15, 0.1, 0.1);
        assert!(a.center_distance(&same_center).abs() < 1e-6);
    }

    #[test]
    fn pixel_rect_floors_and_clamps() {
        let rect = Region::new(0.105, 0.2, 0.0001, 0.5)
            .to_pixel_rect(100, 200)
            .unwrap();
        assert_eq!(rect.x, 10);
        assert_eq!(rect.y, 40);
        assert_eq!(rect.width, 1, "Tiny width clamps to one pixel");
        assert_eq!(rect.height, 100);

        let overflow = Region::new(0.99, 0.99, 0.5, 0.5).to_pixel_rect(100, 100).unwrap();
        assert_eq!(overflow.x + overflow.width, 100);
        assert_eq!(overflow.y + overflow.height, 100);

        assert!(Region::new(0.1, 0.1, 0.1, 0.1).to_pixel_rect(0, 10).is_none());
    }

    #[test]
    fn version_bump() {
        assert_eq!(bump_patch_version("1.2.3"), "1.2.4");
        assert_eq!(bump_patch_version("2.0.9"), "2.0.10");
        assert_eq!(bump_patch_version("garbage"), "1.0.1");
    }

    #[test]
    fn extraction_kind_kebab_case() {
        let json = serde_json::to_string(&ExtractionKind::CheckboxMultiWithText).unwrap();
        assert_eq!(json, "\"checkbox-multi-with-text\"");
        let kind: ExtractionKind = serde_json::from_str("\"text-region\"").unwrap();
        assert_eq!(kind, ExtractionKind::TextRegion);
    }

    #[test]
    fn template_json_shape() {
        let mut template = FormTemplate::new("hts-form", "HTS Form");
        let mut field = FieldDefinition::text("Last name", Region::new(0.1, 0.2, 0.3, 0.04));
        field.required = true;
        template.insert_field(PageSide::Front, "last_name", field);

        let json = serde_json::to_string(&template).unwrap();
        assert!(json.contains("\"front\""));
        assert!(json.contains("\"text-region\""));

        let back: FormTemplate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, template);
        assert_eq!(
            back.required_fields(),
            vec![(PageSide::Front, "last_name".to_string())]
        );
    }

    #[test]
    fn invalid_regions_reported() {
        let mut template = FormTemplate::new("t", "T");
        template.insert_field(
            PageSide::Back,
            "broken",
            FieldDefinition::text("Broken", Region::new(0.8, 0.8, 0.5, 0.5)),
        );
        template.insert_field(
            PageSide::Back,
            "fine",
            FieldDefinition::text("Fine", Region::new(0.1, 0.1, 0.1, 0.1)),
        );
        assert_eq!(
            template.invalid_regions(),
            vec![(PageSide::Back, "broken".to_string())]
        );
        assert!(template.field(PageSide::Back, "broken").unwrap().usable_region().is_none());
    }
}
