//! The unit of work: one (source raster, target tile) pair.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Category whose values are class labels and must not be interpolated.
const CATEGORICAL_CATEGORY: &str = "geomorphon";

/// Errors for a malformed descriptor. Fatal to that task only.
#[derive(Debug, Error, PartialEq)]
pub enum DescriptorError {
    #[error("descriptor has an empty {0}")]
    EmptyField(&'static str),

    #[error("bounding box has non-finite coordinates: {0}")]
    NonFiniteBounds(BoundingBox),

    #[error("bounding box is degenerate (min >= max): {0}")]
    DegenerateBounds(BoundingBox),

    #[error("cannot parse bounding box '{0}': expected four numbers")]
    UnparsableBounds(String),

    #[error("{field} '{value}' must be a single path segment")]
    NotASegment { field: &'static str, value: String },
}

/// Check that `value` names exactly one entry inside a directory.
fn single_segment(field: &'static str, value: &str) -> Result<(), DescriptorError> {
    if value == "." || value == ".." || value.contains(['/', '\\']) {
        return Err(DescriptorError::NotASegment {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Spatial extent `[min_x, min_y, max_x, max_y]` in the target CRS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    /// Bounds as `[min_x, min_y, max_x, max_y]`.
    pub fn as_array(&self) -> [f64; 4] {
        [self.min_x, self.min_y, self.max_x, self.max_y]
    }

    /// Check the extent is finite and non-empty on both axes.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.as_array().iter().any(|v| !v.is_finite()) {
            return Err(DescriptorError::NonFiniteBounds(*self));
        }
        if self.min_x >= self.max_x || self.min_y >= self.max_y {
            return Err(DescriptorError::DegenerateBounds(*self));
        }
        Ok(())
    }
}

impl From<[f64; 4]> for BoundingBox {
    fn from(b: [f64; 4]) -> Self {
        Self::new(b[0], b[1], b[2], b[3])
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {}", self.min_x, self.min_y, self.max_x, self.max_y)
    }
}

impl FromStr for BoundingBox {
    type Err = DescriptorError;

    /// Parse the catalog's textual form: four numbers separated by
    /// whitespace and/or commas, optionally wrapped in brackets.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches(['[', '(']).trim_end_matches([']', ')']);
        let values: Vec<f64> = trimmed
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|part| !part.is_empty())
            .map(|part| part.parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|_| DescriptorError::UnparsableBounds(s.to_string()))?;

        match values.as_slice() {
            [min_x, min_y, max_x, max_y] => Ok(Self::new(*min_x, *min_y, *max_x, *max_y)),
            _ => Err(DescriptorError::UnparsableBounds(s.to_string())),
        }
    }
}

/// Pixel interpolation policy handed to the warp tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResamplingMethod {
    /// Majority value of contributing pixels, for class-valued rasters.
    Mode,
    /// Cubic spline interpolation, for continuous rasters.
    CubicSpline,
}

impl ResamplingMethod {
    /// Select the method for a variable category.
    ///
    /// Categories form an open set; anything that is not known to be
    /// categorical is treated as continuous.
    pub fn for_category(category: &str) -> Self {
        match category {
            CATEGORICAL_CATEGORY => ResamplingMethod::Mode,
            _ => ResamplingMethod::CubicSpline,
        }
    }

    /// Name understood by `gdalwarp -r`.
    pub fn as_gdal_str(&self) -> &'static str {
        match self {
            ResamplingMethod::Mode => "mode",
            ResamplingMethod::CubicSpline => "cubicspline",
        }
    }
}

impl fmt::Display for ResamplingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_gdal_str())
    }
}

/// One source raster to be warped into one target tile.
///
/// Immutable after the catalog materializes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Source raster file name; its leading `_`-delimited token is the variable category
    pub file_name: String,

    /// Remotely readable reference to the source raster
    pub source_path: String,

    /// Target extent used for `-te`
    pub bbox: BoundingBox,

    /// Tile identifier in the source tiling scheme
    pub source_tile_id: String,

    /// Tile identifier in the destination tiling scheme
    pub target_tile_id: String,
}

impl TaskDescriptor {
    pub fn new(
        file_name: impl Into<String>,
        source_path: impl Into<String>,
        bbox: BoundingBox,
        source_tile_id: impl Into<String>,
        target_tile_id: impl Into<String>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            source_path: source_path.into(),
            bbox,
            source_tile_id: source_tile_id.into(),
            target_tile_id: target_tile_id.into(),
        }
    }

    /// The thematic variable encoded in the file name.
    pub fn variable_category(&self) -> &str {
        self.file_name.split('_').next().unwrap_or_default()
    }

    pub fn resampling_method(&self) -> ResamplingMethod {
        ResamplingMethod::for_category(self.variable_category())
    }

    /// Reject descriptors that cannot produce a well-defined artifact.
    ///
    /// The file name and both tile ids become path segments of the local
    /// output and the object key, so each must stay a single segment.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.file_name.trim().is_empty() {
            return Err(DescriptorError::EmptyField("file_name"));
        }
        if self.source_path.trim().is_empty() {
            return Err(DescriptorError::EmptyField("source_path"));
        }
        if self.source_tile_id.trim().is_empty() {
            return Err(DescriptorError::EmptyField("source_tile_id"));
        }
        if self.target_tile_id.trim().is_empty() {
            return Err(DescriptorError::EmptyField("target_tile_id"));
        }
        single_segment("file_name", &self.file_name)?;
        single_segment("source_tile_id", &self.source_tile_id)?;
        single_segment("target_tile_id", &self.target_tile_id)?;
        self.bbox.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(file_name: &str) -> TaskDescriptor {
        TaskDescriptor::new(
            file_name,
            "http://example.com/src.tif",
            BoundingBox::new(10.0, 20.0, 11.0, 21.0),
            "T001",
            "EXTRACONT_05",
        )
    }

    #[test]
    fn test_variable_category_is_leading_token() {
        assert_eq!(descriptor("geomorphon_xyz.tif").variable_category(), "geomorphon");
        assert_eq!(descriptor("slope_edtm_m_30m.tif").variable_category(), "slope");
        assert_eq!(descriptor("noseparator.tif").variable_category(), "noseparator.tif");
    }

    #[test]
    fn test_resampling_method_by_category() {
        assert_eq!(descriptor("geomorphon_xyz.tif").resampling_method(), ResamplingMethod::Mode);
        assert_eq!(descriptor("slope_xyz.tif").resampling_method(), ResamplingMethod::CubicSpline);
        assert_eq!(descriptor("brandnew_xyz.tif").resampling_method(), ResamplingMethod::CubicSpline);
        assert_eq!(ResamplingMethod::Mode.as_gdal_str(), "mode");
        assert_eq!(ResamplingMethod::CubicSpline.to_string(), "cubicspline");
    }

    #[test]
    fn test_validate_rejects_empty_fields() {
        assert_eq!(
            descriptor("").validate(),
            Err(DescriptorError::EmptyField("file_name"))
        );

        let mut d = descriptor("slope.tif");
        d.target_tile_id = "  ".to_string();
        assert_eq!(d.validate(), Err(DescriptorError::EmptyField("target_tile_id")));
    }

    #[test]
    fn test_validate_rejects_names_that_leave_their_folder() {
        for name in ["/etc/slope_abs.tif", "../../slope_up.tif", "..", ".", "a\\b.tif", "sub/slope.tif"] {
            assert_eq!(
                descriptor(name).validate(),
                Err(DescriptorError::NotASegment {
                    field: "file_name",
                    value: name.to_string(),
                }),
                "{} was accepted",
                name
            );
        }

        let mut d = descriptor("slope.tif");
        d.source_tile_id = "../T001".to_string();
        assert!(matches!(
            d.validate(),
            Err(DescriptorError::NotASegment { field: "source_tile_id", .. })
        ));

        let mut d = descriptor("slope.tif");
        d.target_tile_id = "EU/01".to_string();
        assert!(matches!(
            d.validate(),
            Err(DescriptorError::NotASegment { field: "target_tile_id", .. })
        ));
    }

    #[test]
    fn test_validate_accepts_unusual_but_single_segment_names() {
        for name in ["slope_a#1.tif", "slope q?.tif", "slope%20.tif", "..slope.tif", "slope..tif"] {
            assert!(descriptor(name).validate().is_ok(), "{} was rejected", name);
        }
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        let mut d = descriptor("slope.tif");
        d.bbox = BoundingBox::new(11.0, 20.0, 10.0, 21.0);
        assert!(matches!(d.validate(), Err(DescriptorError::DegenerateBounds(_))));

        d.bbox = BoundingBox::new(f64::NAN, 20.0, 11.0, 21.0);
        assert!(matches!(d.validate(), Err(DescriptorError::NonFiniteBounds(_))));

        assert!(descriptor("slope.tif").validate().is_ok());
    }

    #[test]
    fn test_bbox_parse_forms() {
        let expected = BoundingBox::new(10.0, 20.0, 11.0, 21.0);
        assert_eq!("10 20 11 21".parse::<BoundingBox>().unwrap(), expected);
        assert_eq!("10,20,11,21".parse::<BoundingBox>().unwrap(), expected);
        assert_eq!("[10.0, 20.0, 11.0, 21.0]".parse::<BoundingBox>().unwrap(), expected);
        assert_eq!(" (10, 20, 11, 21) ".parse::<BoundingBox>().unwrap(), expected);
    }

    #[test]
    fn test_bbox_parse_invalid() {
        assert!("10 20 11".parse::<BoundingBox>().is_err());
        assert!("a b c d".parse::<BoundingBox>().is_err());
        assert!("".parse::<BoundingBox>().is_err());
    }

    #[test]
    fn test_bbox_display_matches_te_argument_order() {
        let bbox = BoundingBox::new(-10.5, 20.0, -9.5, 21.0);
        assert_eq!(bbox.to_string(), "-10.5 20 -9.5 21");
    }
}
