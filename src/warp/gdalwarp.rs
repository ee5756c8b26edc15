//! `gdalwarp` argument construction.
//!
//! ## Fixed output grid
//!
//! Every output tile is WGS84 longitude/latitude at 0.00025° per pixel,
//! clipped to the task's bounding box. These are not configurable; only the
//! GeoTIFF storage options and GDAL cache size come from [`WarpConfig`].

use crate::config::WarpConfig;
use crate::task::TaskDescriptor;
use std::path::Path;

/// Output CRS handed to `-t_srs`.
pub const TARGET_SRS: &str = "+proj=longlat +datum=WGS84 +no_defs +type=crs";

/// Output pixel size in degrees, both axes.
pub const TARGET_RESOLUTION_DEG: f64 = 0.00025;

/// A fully specified external process invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct WarpCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl WarpCommand {
    /// Render as a shell-like string for logs.
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        for arg in &self.args {
            if arg.contains(' ') {
                parts.push(format!("\"{}\"", arg));
            } else {
                parts.push(arg.clone());
            }
        }
        parts.join(" ")
    }
}

/// Turn a catalog source path into something GDAL can stream from.
///
/// Remote rasters are read through GDAL's virtual file systems rather than
/// downloaded first.
///
/// # Returns
/// `/vsicurl/` for `http(s)://` URLs, `/vsis3/` for `s3://` URIs, and the
/// path unchanged otherwise (local files or paths already prefixed).
pub fn source_reference(source_path: &str) -> String {
    if source_path.starts_with("/vsi") {
        source_path.to_string()
    } else if let Some(rest) = source_path.strip_prefix("s3://") {
        format!("/vsis3/{}", rest)
    } else if source_path.starts_with("http://") || source_path.starts_with("https://") {
        format!("/vsicurl/{}", source_path)
    } else {
        source_path.to_string()
    }
}

/// Build the `gdalwarp` invocation for one task.
///
/// The target CRS, pixel size, extent and resampling method are fixed by the
/// descriptor; `config` only contributes storage and performance options.
///
/// # Arguments
/// * `config` - Executable, cache, tiling and compression settings
/// * `descriptor` - Source raster, extent and variable category
/// * `output` - Task-unique local output file
pub fn build_warp_command(config: &WarpConfig, descriptor: &TaskDescriptor, output: &Path) -> WarpCommand {
    let resolution = TARGET_RESOLUTION_DEG.to_string();
    let bbox = descriptor.bbox;

    let mut args: Vec<String> = vec![
        "-overwrite".into(),
        "-of".into(),
        "GTiff".into(),
        "-t_srs".into(),
        TARGET_SRS.into(),
        "-tr".into(),
        resolution.clone(),
        resolution,
        "-r".into(),
        descriptor.resampling_method().as_gdal_str().into(),
        "-te".into(),
        bbox.min_x.to_string(),
        bbox.min_y.to_string(),
        bbox.max_x.to_string(),
        bbox.max_y.to_string(),
        "--config".into(),
        "GDAL_CACHEMAX".into(),
        config.cache_max_mb.to_string(),
    ];

    let mut creation_options = vec![
        format!("BLOCKXSIZE={}", config.block_size),
        format!("BLOCKYSIZE={}", config.block_size),
        "TILED=YES".to_string(),
        format!("COMPRESS={}", config.compress),
        format!("PREDICTOR={}", config.predictor),
        format!("NUM_THREADS={}", config.num_threads),
    ];
    if config.big_tiff {
        creation_options.push("BIGTIFF=YES".to_string());
    }
    if config.sparse_ok {
        creation_options.push("SPARSE_OK=TRUE".to_string());
    }
    for option in creation_options {
        args.push("-co".into());
        args.push(option);
    }

    args.push(source_reference(&descriptor.source_path));
    args.push(output.to_string_lossy().into_owned());

    WarpCommand {
        program: config.gdalwarp_bin.clone(),
        args,
    }
}
