//! Load the task catalog and turn it into a shuffled, de-duplicated task list.
//!
//! The catalog is an already-materialized table with one row per
//! (source file, target tile) pair. GeoJSON feature collections, plain JSON
//! record arrays and (Geo)Parquet are accepted, from local disk or `s3://`.

use crate::config::{CatalogConfig, StoreConfig};
use crate::remote::identity::tile_folder;
use crate::remote::store::{create_s3_store, parse_s3_uri};
use crate::task::{BoundingBox, ResamplingMethod, TaskDescriptor};
use anyhow::{Context, Result};
use arrow::array::{Array, Float64Array, LargeStringArray, StringArray};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use object_store::{ObjectStore, ObjectStoreExt};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

const FILE_NAME_COLUMNS: &[&str] = &["file_name", "filename", "name"];
const FILE_PATH_COLUMNS: &[&str] = &["file_path", "path", "url", "source_path"];
const BBOX_COLUMNS: &[&str] = &["bbox", "bounds", "extent"];
const SOURCE_TILE_COLUMNS: &[&str] = &["source_tile_id", "TILE", "tile"];
const TARGET_TILE_COLUMNS: &[&str] = &["target_tile_id", "EQUI7_TILE", "equi7_tile"];

/// A catalog row that could not become a descriptor.
#[derive(Debug, Clone)]
pub struct RejectedRow {
    /// Zero-based row index in the catalog
    pub row: usize,

    /// Why the row was rejected
    pub reason: String,
}

/// Materialized task list.
#[derive(Debug, Default)]
pub struct Catalog {
    tasks: Vec<TaskDescriptor>,
    rejected: Vec<RejectedRow>,
    duplicates_dropped: usize,
}

impl Catalog {
    pub fn new(tasks: Vec<TaskDescriptor>) -> Self {
        Self {
            tasks,
            ..Default::default()
        }
    }

    /// Load the catalog named by the configuration.
    pub async fn load(config: &CatalogConfig, store: &StoreConfig) -> Result<Self> {
        tracing::info!("Loading task catalog from {}", config.path);

        let bytes = if config.path.starts_with("s3://") {
            let (bucket, key) = parse_s3_uri(&config.path)?;
            let s3 = create_s3_store(bucket, store)?;
            read_object(s3, key).await?
        } else {
            let data = tokio::fs::read(&config.path)
                .await
                .with_context(|| format!("Failed to read catalog file: {}", config.path))?;
            Bytes::from(data)
        };

        let catalog = if is_parquet(&config.path) {
            Self::from_parquet_bytes(bytes)?
        } else {
            Self::from_json_bytes(&bytes)?
        };

        tracing::info!(
            "Loaded {} tasks from catalog ({} rejected rows)",
            catalog.tasks.len(),
            catalog.rejected.len()
        );

        Ok(catalog)
    }

    /// Parse a GeoJSON feature collection or a JSON array of records.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes).context("Catalog is not valid JSON")?;

        let rows: Vec<(Option<&Map<String, Value>>, Option<&Value>)> = match &value {
            Value::Object(obj) if obj.contains_key("features") => obj["features"]
                .as_array()
                .context("'features' must be an array")?
                .iter()
                .map(|feature| {
                    let props = feature.get("properties").and_then(Value::as_object);
                    (props, feature.get("bbox"))
                })
                .collect(),
            Value::Array(records) => records.iter().map(|r| (r.as_object(), None)).collect(),
            _ => anyhow::bail!("Catalog must be a FeatureCollection or an array of records"),
        };

        let mut catalog = Catalog::default();
        for (row, (props, feature_bbox)) in rows.into_iter().enumerate() {
            let Some(props) = props else {
                catalog.reject(row, "row has no properties object".to_string());
                continue;
            };
            match descriptor_from_json(props, feature_bbox) {
                Ok(descriptor) => catalog.tasks.push(descriptor),
                Err(e) => catalog.reject(row, e.to_string()),
            }
        }

        Ok(catalog)
    }

    /// Parse a Parquet or GeoParquet table.
    pub fn from_parquet_bytes(bytes: Bytes) -> Result<Self> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)?;
        let reader = builder.build()?;

        let mut catalog = Catalog::default();
        for batch_result in reader {
            let batch = batch_result?;
            catalog.extract_tasks_from_batch(&batch)?;
        }

        Ok(catalog)
    }

    /// Extract tasks from a record batch.
    fn extract_tasks_from_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        let schema = batch.schema();
        let row_offset = self.tasks.len() + self.rejected.len();

        let file_names = get_string_values(batch.column(find_column(&schema, FILE_NAME_COLUMNS)?))?;
        let file_paths = get_string_values(batch.column(find_column(&schema, FILE_PATH_COLUMNS)?))?;
        let source_tiles = get_string_values(batch.column(find_column(&schema, SOURCE_TILE_COLUMNS)?))?;
        let target_tiles = get_string_values(batch.column(find_column(&schema, TARGET_TILE_COLUMNS)?))?;

        // Either a textual bbox column or four numeric bound columns
        let bboxes: Vec<Result<BoundingBox, String>> = match find_column(&schema, BBOX_COLUMNS) {
            Ok(col) => get_string_values(batch.column(col))?
                .iter()
                .map(|s| s.parse::<BoundingBox>().map_err(|e| e.to_string()))
                .collect(),
            Err(_) => {
                let min_x = get_f64_values(batch.column(find_column(&schema, &["min_x", "minx", "xmin"])?))?;
                let min_y = get_f64_values(batch.column(find_column(&schema, &["min_y", "miny", "ymin"])?))?;
                let max_x = get_f64_values(batch.column(find_column(&schema, &["max_x", "maxx", "xmax"])?))?;
                let max_y = get_f64_values(batch.column(find_column(&schema, &["max_y", "maxy", "ymax"])?))?;
                (0..batch.num_rows())
                    .map(|i| Ok(BoundingBox::new(min_x[i], min_y[i], max_x[i], max_y[i])))
                    .collect()
            }
        };

        for (i, bbox) in bboxes.into_iter().enumerate() {
            match bbox {
                Ok(bbox) => self.tasks.push(TaskDescriptor::new(
                    file_names[i].clone(),
                    file_paths[i].clone(),
                    bbox,
                    source_tiles[i].clone(),
                    target_tiles[i].clone(),
                )),
                Err(reason) => self.reject(row_offset + i, reason),
            }
        }

        Ok(())
    }

    fn reject(&mut self, row: usize, reason: String) {
        tracing::warn!(row, %reason, "Rejected catalog row");
        self.rejected.push(RejectedRow { row, reason });
    }

    /// Shuffle the task order.
    ///
    /// Independently started runs pick different orders so they do not all
    /// start on the same tasks. A fixed seed gives a reproducible order.
    pub fn shuffle(&mut self, seed: Option<u64>) {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        self.tasks.shuffle(&mut rng);
    }

    /// Drop descriptors that would produce the same artifact as an earlier one.
    ///
    /// Returns the number dropped.
    pub fn deduplicate(&mut self) -> usize {
        let mut seen = HashSet::with_capacity(self.tasks.len());
        let before = self.tasks.len();
        self.tasks
            .retain(|d| seen.insert((tile_folder(d), d.file_name.clone())));
        let dropped = before - self.tasks.len();
        self.duplicates_dropped += dropped;

        if dropped > 0 {
            tracing::info!("Dropped {} duplicate tasks", dropped);
        }
        dropped
    }

    /// Shuffle then de-duplicate according to the configuration.
    pub fn prepare(&mut self, config: &CatalogConfig) {
        self.shuffle(config.seed);
        if config.deduplicate {
            self.deduplicate();
        }
    }

    pub fn tasks(&self) -> &[TaskDescriptor] {
        &self.tasks
    }

    pub fn into_tasks(self) -> Vec<TaskDescriptor> {
        self.tasks
    }

    pub fn rejected(&self) -> &[RejectedRow] {
        &self.rejected
    }

    pub fn duplicates_dropped(&self) -> usize {
        self.duplicates_dropped
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Counts describing the work in the catalog.
    pub fn summary(&self) -> CatalogSummary {
        let mut categories = BTreeMap::new();
        let mut folders = HashSet::new();
        let mut categorical = 0;
        for task in &self.tasks {
            *categories.entry(task.variable_category().to_string()).or_insert(0) += 1;
            folders.insert(tile_folder(task));
            if task.resampling_method() == ResamplingMethod::Mode {
                categorical += 1;
            }
        }

        CatalogSummary {
            tasks: self.tasks.len(),
            rejected: self.rejected.len(),
            duplicates_dropped: self.duplicates_dropped,
            tile_folders: folders.len(),
            categorical,
            categories,
        }
    }
}

/// Counts describing a catalog.
#[derive(Debug, Default)]
pub struct CatalogSummary {
    pub tasks: usize,
    pub rejected: usize,
    pub duplicates_dropped: usize,

    /// Distinct output folders
    pub tile_folders: usize,

    /// Tasks resampled with the categorical method
    pub categorical: usize,

    /// Tasks per variable category
    pub categories: BTreeMap<String, usize>,
}

impl std::fmt::Display for CatalogSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Tasks: {}", self.tasks)?;
        writeln!(f, "Rejected rows: {}", self.rejected)?;
        writeln!(f, "Duplicates dropped: {}", self.duplicates_dropped)?;
        writeln!(f, "Output tile folders: {}", self.tile_folders)?;
        writeln!(
            f,
            "Resampling: {} mode, {} cubicspline",
            self.categorical,
            self.tasks - self.categorical
        )?;
        write!(f, "Categories:")?;
        for (category, count) in &self.categories {
            write!(f, "\n  {:<24} {}", category, count)?;
        }
        Ok(())
    }
}

fn is_parquet(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.ends_with(".parquet") || lower.ends_with(".geoparquet")
}

async fn read_object(store: Arc<dyn ObjectStore>, key: &str) -> Result<Bytes> {
    let path = object_store::path::Path::from(key);
    let bytes = store
        .get(&path)
        .await
        .with_context(|| format!("Failed to fetch catalog object {}", key))?
        .bytes()
        .await?;
    Ok(bytes)
}

fn json_field<'a>(props: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| props.get(*name))
}

fn json_string(props: &Map<String, Value>, names: &[&str]) -> String {
    match json_field(props, names) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn bbox_from_json(value: &Value) -> Result<BoundingBox> {
    match value {
        Value::String(s) => Ok(s.parse::<BoundingBox>()?),
        Value::Array(items) => {
            let coords: Vec<f64> = items.iter().filter_map(Value::as_f64).collect();
            match coords.as_slice() {
                [min_x, min_y, max_x, max_y] if items.len() == 4 => {
                    Ok(BoundingBox::new(*min_x, *min_y, *max_x, *max_y))
                }
                _ => anyhow::bail!("bbox array must hold four numbers, got {}", value),
            }
        }
        other => anyhow::bail!("unsupported bbox value: {}", other),
    }
}

fn descriptor_from_json(
    props: &Map<String, Value>,
    feature_bbox: Option<&Value>,
) -> Result<TaskDescriptor> {
    let bbox_value = json_field(props, BBOX_COLUMNS)
        .filter(|v| !v.is_null())
        .or(feature_bbox)
        .context("row has no bbox")?;

    Ok(TaskDescriptor::new(
        json_string(props, FILE_NAME_COLUMNS),
        json_string(props, FILE_PATH_COLUMNS),
        bbox_from_json(bbox_value)?,
        json_string(props, SOURCE_TILE_COLUMNS),
        json_string(props, TARGET_TILE_COLUMNS),
    ))
}

/// Find a column by checking multiple possible names.
fn find_column(schema: &SchemaRef, names: &[&str]) -> Result<usize> {
    for name in names {
        if let Some((idx, _)) = schema.column_with_name(name) {
            return Ok(idx);
        }
    }
    anyhow::bail!("Could not find column with any of these names: {:?}", names)
}

/// Get string values from an array. Nulls become empty strings so the
/// descriptor fails validation for that task only.
fn get_string_values(array: &Arc<dyn Array>) -> Result<Vec<String>> {
    let value_or_empty = |is_null: bool, value: String| if is_null { String::new() } else { value };

    if let Some(arr) = array.as_any().downcast_ref::<StringArray>() {
        Ok((0..arr.len()).map(|i| value_or_empty(arr.is_null(i), arr.value(i).to_string())).collect())
    } else if let Some(arr) = array.as_any().downcast_ref::<LargeStringArray>() {
        Ok((0..arr.len()).map(|i| value_or_empty(arr.is_null(i), arr.value(i).to_string())).collect())
    } else if let Some(arr) = array.as_any().downcast_ref::<arrow::array::Int64Array>() {
        Ok((0..arr.len()).map(|i| value_or_empty(arr.is_null(i), arr.value(i).to_string())).collect())
    } else if let Some(arr) = array.as_any().downcast_ref::<arrow::array::Int32Array>() {
        Ok((0..arr.len()).map(|i| value_or_empty(arr.is_null(i), arr.value(i).to_string())).collect())
    } else {
        anyhow::bail!("Expected string or integer column, got {}", array.data_type())
    }
}

/// Get f64 values from an array (handles f32 and f64).
fn get_f64_values(array: &Arc<dyn Array>) -> Result<Vec<f64>> {
    if let Some(arr) = array.as_any().downcast_ref::<Float64Array>() {
        Ok((0..arr.len()).map(|i| if arr.is_null(i) { f64::NAN } else { arr.value(i) }).collect())
    } else if let Some(arr) = array.as_any().downcast_ref::<arrow::array::Float32Array>() {
        Ok((0..arr.len()).map(|i| if arr.is_null(i) { f64::NAN } else { arr.value(i) as f64 }).collect())
    } else {
        anyhow::bail!("Expected float array")
    }
}
