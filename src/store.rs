use crate::metadata::*;
use anyhow::{Context, Result};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::debug;
use zarrs::array::Array;
use zarrs_filesystem::FilesystemStore;

type ZarrsArray = Arc<Array<FilesystemStore>>;

pub struct ZarrStore {
    path: PathBuf,
    /// zarrs handles per variable, opened on first read. `None` records an
    /// array zarrs could not open, so later reads go straight to raw chunks.
    arrays: RwLock<HashMap<String, Option<ZarrsArray>>>,
}

impl ZarrStore {
    /// Open a Zarr store rooted at a directory path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            return Err(anyhow::anyhow!("Path does not exist: {}", path.display()));
        }

        if !path.is_dir() {
            return Err(anyhow::anyhow!(
                "Path is not a directory: {}",
                path.display()
            ));
        }

        Ok(Self {
            path,
            arrays: RwLock::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load metadata from the Zarr store, attempting consolidated read first
    pub fn load_metadata(&self) -> Result<StoreMetadata> {
        match self.load_consolidated_metadata() {
            Ok(metadata) => {
                debug!(path = %self.path.display(), "loaded consolidated metadata");
                Ok(metadata)
            }
            Err(e) => {
                debug!(path = %self.path.display(), "consolidated metadata unavailable ({e:#}), scanning");
                self.load_hierarchical_metadata()
            }
        }
    }

    fn load_consolidated_metadata(&self) -> Result<StoreMetadata> {
        let zmetadata_path = self.path.join(".zmetadata");

        let data = fs::read(&zmetadata_path).with_context(|| {
            format!(
                "No consolidated metadata found at '{}'",
                zmetadata_path.display()
            )
        })?;

        let consolidated: ConsolidatedMetadata = serde_json::from_slice(&data).with_context(|| {
            format!(
                "Invalid consolidated metadata JSON format at '{}'",
                zmetadata_path.display()
            )
        })?;

        let mut metadata = StoreMetadata::new();
        for (key, value) in &consolidated.metadata {
            if key == ".zattrs" {
                metadata.global_attributes = serde_json::from_value(value.clone()).unwrap_or_default();
                continue;
            }

            // Only arrays directly under the root group take part in a dataset.
            let Some(name) = key.strip_suffix("/.zarray") else {
                continue;
            };
            if name.contains('/') {
                continue;
            }

            let zarray: ZArrayMetadata = serde_json::from_value(value.clone())
                .with_context(|| format!("Failed to parse .zarray for {}", name))?;
            let attributes = consolidated
                .metadata
                .get(&format!("{}/.zattrs", name))
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();

            metadata
                .variables
                .insert(name.to_string(), variable_from_zarray(name, zarray, attributes));
        }

        metadata.infer_dimensions();
        Ok(metadata)
    }

    fn load_hierarchical_metadata(&self) -> Result<StoreMetadata> {
        let mut metadata = StoreMetadata::new();

        let entries = fs::read_dir(&self.path)
            .with_context(|| format!("Failed to read directory: {}", self.path.display()))?;

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let entry_path = entry.path();
            if name.starts_with('.') || !entry_path.is_dir() {
                continue;
            }

            let zarray_path = entry_path.join(".zarray");
            if !zarray_path.exists() {
                continue;
            }

            let array_data = fs::read(&zarray_path).with_context(|| {
                format!(
                    "Failed to read .zarray for variable '{}' at '{}'",
                    name,
                    zarray_path.display()
                )
            })?;
            let zarray: ZArrayMetadata = serde_json::from_slice(&array_data).with_context(|| {
                format!(
                    "Invalid .zarray JSON format for variable '{}' at '{}'",
                    name,
                    zarray_path.display()
                )
            })?;

            let attributes = read_attributes(&entry_path.join(".zattrs"));
            metadata
                .variables
                .insert(name.clone(), variable_from_zarray(&name, zarray, attributes));
        }

        if metadata.variables.is_empty() {
            return Err(anyhow::anyhow!(
                "No Zarr arrays found in '{}'. The directory must contain .zarray or .zmetadata files to be a valid Zarr store.",
                self.path.display()
            ));
        }

        metadata.global_attributes = read_attributes(&self.path.join(".zattrs"));
        metadata.infer_dimensions();

        Ok(metadata)
    }

    /// Read a hyper-rectangular subset of a variable as f64 values in C order.
    ///
    /// `ranges` holds one half-open range per dimension; an empty slice reads a
    /// scalar.
    pub fn read_array_subset_f64(&self, variable: &Variable, ranges: &[Range<u64>]) -> Result<Vec<f64>> {
        if ranges.len() != variable.shape.len() {
            return Err(anyhow::anyhow!(
                "Variable '{}' has {} dimensions but {} ranges were requested",
                variable.name,
                variable.shape.len(),
                ranges.len()
            ));
        }
        for (range, &size) in ranges.iter().zip(&variable.shape) {
            if range.start > range.end || range.end > size {
                return Err(anyhow::anyhow!(
                    "Range {:?} is out of bounds for variable '{}' (size {})",
                    range,
                    variable.name,
                    size
                ));
            }
        }

        self.read_with_zarrs(variable, ranges).or_else(|e| {
            debug!(variable = %variable.name, "zarrs read failed ({e:#}), trying raw chunks");
            self.read_uncompressed(variable, ranges)
        })
    }

    /// The zarrs handle for `name`, opening it on first use.
    fn zarrs_array(&self, name: &str) -> Result<Option<ZarrsArray>> {
        if let Some(cached) = self.arrays.read().map_err(poisoned)?.get(name) {
            return Ok(cached.clone());
        }

        let opened = FilesystemStore::new(&self.path)
            .map_err(|e| anyhow::anyhow!("Failed to create zarrs FilesystemStore: {}", e))
            .and_then(|store| {
                let array_path = format!("/{name}");
                Array::open(Arc::new(store), &array_path)
                    .map_err(|e| anyhow::anyhow!("Failed to open array '{}': {}", array_path, e))
            });
        let handle = match opened {
            Ok(array) => Some(Arc::new(array)),
            Err(e) => {
                debug!(variable = %name, "zarrs cannot open array ({e:#})");
                None
            }
        };

        let mut arrays = self.arrays.write().map_err(poisoned)?;
        Ok(arrays.entry(name.to_string()).or_insert(handle).clone())
    }

    fn read_with_zarrs(&self, variable: &Variable, ranges: &[Range<u64>]) -> Result<Vec<f64>> {
        use zarrs::array::ArrayBytes;
        use zarrs::array_subset::ArraySubset;

        let array = self
            .zarrs_array(&variable.name)?
            .ok_or_else(|| anyhow::anyhow!("Array '{}' is not readable by zarrs", variable.name))?;

        let subset = ArraySubset::new_with_ranges(ranges);
        let array_bytes = array
            .retrieve_array_subset(&subset)
            .map_err(|e| anyhow::anyhow!("Failed to read array data: {}", e))?;

        let bytes: &[u8] = match &array_bytes {
            ArrayBytes::Fixed(data) => data.as_ref(),
            ArrayBytes::Variable(data, _offsets) => data.as_ref(),
        };

        // zarrs hands back decoded elements in native byte order.
        decode_elements(bytes, &variable.dtype, cfg!(target_endian = "big"))
    }

    /// Read uncompressed C-order chunk files directly. Missing chunks read as
    /// the array's fill value.
    fn read_uncompressed(&self, variable: &Variable, ranges: &[Range<u64>]) -> Result<Vec<f64>> {
        if let Some(compressor) = &variable.compressor {
            return Err(anyhow::anyhow!(
                "Variable '{}' uses compression ('{}'), which could not be handled by the zarrs crate",
                variable.name,
                compressor
            ));
        }
        if !variable.filters.is_empty() {
            return Err(anyhow::anyhow!(
                "Variable '{}' uses filters ({}), which require the zarrs crate",
                variable.name,
                variable.filters.join(", ")
            ));
        }
        if variable.order != "C" {
            return Err(anyhow::anyhow!(
                "Variable '{}' uses '{}' order; only C order chunks can be read directly",
                variable.name,
                variable.order
            ));
        }

        let out_shape: Vec<u64> = ranges.iter().map(|r| r.end - r.start).collect();
        let total: u64 = out_shape.iter().product();
        let mut out = vec![variable.fill_value_f64(); total as usize];
        if total == 0 {
            return Ok(out);
        }

        let chunk_shape: Vec<u64> = variable.chunks.iter().map(|&c| c.max(1)).collect();
        let chunk_strides = strides(&chunk_shape);
        let out_strides = strides(&out_shape);
        let big_endian = variable.dtype.starts_with('>');
        let separator = variable.dimension_separator.as_deref().unwrap_or(".");

        let chunk_grid: Vec<Range<u64>> = ranges
            .iter()
            .zip(&chunk_shape)
            .map(|(r, &c)| r.start / c..(r.end - 1) / c + 1)
            .collect();

        let mut failure: Option<anyhow::Error> = None;
        for_each_index(&chunk_grid, |chunk_idx| {
            if failure.is_some() {
                return;
            }

            let key = if chunk_idx.is_empty() {
                "0".to_string()
            } else {
                chunk_idx
                    .iter()
                    .map(|i| i.to_string())
                    .collect::<Vec<_>>()
                    .join(separator)
            };
            let chunk_path = self.path.join(&variable.name).join(&key);
            if !chunk_path.exists() {
                return;
            }

            let values = match fs::read(&chunk_path)
                .with_context(|| format!("Failed to read chunk file: {}", chunk_path.display()))
                .and_then(|bytes| decode_elements(&bytes, &variable.dtype, big_endian))
            {
                Ok(values) => values,
                Err(e) => {
                    failure = Some(e);
                    return;
                }
            };

            let region: Vec<Range<u64>> = chunk_idx
                .iter()
                .zip(&chunk_shape)
                .zip(ranges)
                .map(|((&ci, &c), r)| {
                    let origin = ci * c;
                    origin.max(r.start)..(origin + c).min(r.end)
                })
                .collect();

            for_each_index(&region, |idx| {
                let mut src = 0u64;
                let mut dst = 0u64;
                for d in 0..idx.len() {
                    src += (idx[d] - chunk_idx[d] * chunk_shape[d]) * chunk_strides[d];
                    dst += (idx[d] - ranges[d].start) * out_strides[d];
                }
                if let Some(v) = values.get(src as usize) {
                    out[dst as usize] = *v;
                }
            });
        });

        match failure {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }
}

fn read_attributes(path: &Path) -> HashMap<String, AttributeValue> {
    match fs::read(path) {
        Ok(data) => serde_json::from_slice(&data).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

fn variable_from_zarray(
    name: &str,
    zarray: ZArrayMetadata,
    attributes: HashMap<String, AttributeValue>,
) -> Variable {
    let compressor = zarray
        .compressor
        .as_ref()
        .and_then(|c| c.get("id"))
        .and_then(|id| id.as_str())
        .map(|s| s.to_string());

    let filters = zarray
        .filters
        .as_ref()
        .map(|f| {
            f.iter()
                .filter_map(|filter| filter.get("id").and_then(|id| id.as_str().map(|s| s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let fill_value = zarray
        .fill_value
        .as_ref()
        .map(|fv| serde_json::from_value(fv.clone()).unwrap_or(AttributeValue::Null));

    Variable {
        name: name.to_string(),
        dtype: zarray.dtype,
        shape: zarray.shape,
        chunks: zarray.chunks,
        compressor,
        fill_value,
        order: zarray.order,
        filters,
        dimension_separator: zarray.dimension_separator,
        attributes,
        // filled in by infer_dimensions
        dimensions: vec![],
    }
}

/// Whether values of this dtype can be converted to f64.
pub fn supports_dtype(dtype: &str) -> bool {
    matches!(
        dtype.trim_start_matches(['<', '>', '|', '=']),
        "f4" | "f8" | "i1" | "i2" | "i4" | "i8" | "u1" | "u2" | "u4" | "u8"
    )
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow::anyhow!("zarrs array cache lock poisoned")
}

/// Convert raw element bytes to f64 according to a Zarr v2 dtype string.
fn decode_elements(bytes: &[u8], dtype: &str, big_endian: bool) -> Result<Vec<f64>> {
    let mut reader = Cursor::new(bytes);

    macro_rules! read_all {
        ($width:expr, $read:ident) => {{
            let count = bytes.len() / $width;
            let mut data = Vec::with_capacity(count);
            for _ in 0..count {
                let value = if big_endian {
                    reader.$read::<BigEndian>()?
                } else {
                    reader.$read::<LittleEndian>()?
                };
                data.push(value as f64);
            }
            data
        }};
    }

    let data = match dtype.trim_start_matches(['<', '>', '|', '=']) {
        "f8" => read_all!(8, read_f64),
        "f4" => read_all!(4, read_f32),
        "i8" => read_all!(8, read_i64),
        "i4" => read_all!(4, read_i32),
        "i2" => read_all!(2, read_i16),
        "u8" => read_all!(8, read_u64),
        "u4" => read_all!(4, read_u32),
        "u2" => read_all!(2, read_u16),
        "i1" => bytes.iter().map(|&b| b as i8 as f64).collect(),
        "u1" => bytes.iter().map(|&b| b as f64).collect(),
        _ => {
            return Err(anyhow::anyhow!("Unsupported dtype: {}", dtype));
        }
    };

    Ok(data)
}

/// Row-major strides for a shape.
pub(crate) fn strides(shape: &[u64]) -> Vec<u64> {
    let mut out = vec![1u64; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        out[d] = out[d + 1] * shape[d + 1];
    }
    out
}

/// Visit every multi-index inside `ranges` in C order. Empty `ranges` visits
/// the single scalar index once; any empty range visits nothing.
pub(crate) fn for_each_index(ranges: &[Range<u64>], mut f: impl FnMut(&[u64])) {
    if ranges.iter().any(|r| r.start >= r.end) {
        return;
    }

    let mut idx: Vec<u64> = ranges.iter().map(|r| r.start).collect();
    loop {
        f(&idx);

        let mut d = idx.len();
        loop {
            if d == 0 {
                return;
            }
            d -= 1;
            idx[d] += 1;
            if idx[d] < ranges[d].end {
                break;
            }
            idx[d] = ranges[d].start;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_array(root: &Path, name: &str, shape: &[u64], chunks: &[u64], separator: Option<&str>) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();

        let mut zarray = serde_json::json!({
            "zarr_format": 2,
            "shape": shape,
            "chunks": chunks,
            "dtype": "<f8",
            "compressor": null,
            "fill_value": -1.0,
            "order": "C",
            "filters": null
        });
        if let Some(sep) = separator {
            zarray["dimension_separator"] = serde_json::json!(sep);
        }
        fs::write(dir.join(".zarray"), serde_json::to_vec(&zarray).unwrap()).unwrap();
        fs::write(
            dir.join(".zattrs"),
            serde_json::to_vec(&serde_json::json!({"_ARRAY_DIMENSIONS": ["y", "x"]})).unwrap(),
        )
        .unwrap();
    }

    fn write_chunk(root: &Path, name: &str, key: &str, values: &[f64]) {
        let path = root.join(name).join(key);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_store_open_rejects_missing_path() {
        assert!(ZarrStore::open("/nonexistent/store.zarr").is_err());
    }

    #[test]
    fn test_hierarchical_metadata_root_arrays() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".zgroup"), r#"{"zarr_format": 2}"#).unwrap();
        fs::write(dir.path().join(".zattrs"), r#"{"title": "demo"}"#).unwrap();
        write_array(dir.path(), "grid", &[2, 3], &[2, 3], None);

        let store = ZarrStore::open(dir.path()).unwrap();
        let metadata = store.load_metadata().unwrap();
        assert_eq!(metadata.variables.len(), 1);
        assert_eq!(metadata.variables["grid"].dimension_names(), vec!["y", "x"]);
        assert_eq!(
            metadata.global_attributes.get("title").and_then(AttributeValue::as_str),
            Some("demo")
        );
    }

    #[test]
    fn test_empty_directory_is_not_a_store() {
        let dir = TempDir::new().unwrap();
        let store = ZarrStore::open(dir.path()).unwrap();
        assert!(store.load_metadata().is_err());
    }

    #[test]
    fn test_read_subset_across_chunks_with_missing_chunk() {
        let dir = TempDir::new().unwrap();
        write_array(dir.path(), "grid", &[4, 4], &[2, 2], None);
        // chunk (0,0) holds 0..4, chunk (0,1) holds 10..14, chunk (1,1) is missing
        write_chunk(dir.path(), "grid", "0.0", &[0.0, 1.0, 2.0, 3.0]);
        write_chunk(dir.path(), "grid", "0.1", &[10.0, 11.0, 12.0, 13.0]);
        write_chunk(dir.path(), "grid", "1.0", &[20.0, 21.0, 22.0, 23.0]);

        let store = ZarrStore::open(dir.path()).unwrap();
        let metadata = store.load_metadata().unwrap();
        let var = &metadata.variables["grid"];

        let values = store.read_array_subset_f64(var, &[1..3, 1..4]).unwrap();
        assert_eq!(values, vec![3.0, 12.0, 13.0, 21.0, -1.0, -1.0]);
    }

    #[test]
    fn test_zarrs_array_opened_once_per_variable() {
        let dir = TempDir::new().unwrap();
        write_array(dir.path(), "grid", &[2, 2], &[1, 2], None);
        write_chunk(dir.path(), "grid", "0.0", &[1.0, 2.0]);
        write_chunk(dir.path(), "grid", "1.0", &[3.0, 4.0]);

        let store = ZarrStore::open(dir.path()).unwrap();
        let metadata = store.load_metadata().unwrap();
        let var = &metadata.variables["grid"];
        assert_eq!(store.read_array_subset_f64(var, &[0..1, 0..2]).unwrap(), vec![1.0, 2.0]);
        assert_eq!(store.read_array_subset_f64(var, &[1..2, 0..2]).unwrap(), vec![3.0, 4.0]);

        let first = store.zarrs_array("grid").unwrap();
        let second = store.zarrs_array("grid").unwrap();
        match (first, second) {
            (Some(a), Some(b)) => assert!(Arc::ptr_eq(&a, &b)),
            (None, None) => {}
            other => panic!("cache changed between reads: {:?}", (other.0.is_some(), other.1.is_some())),
        }
        assert_eq!(store.arrays.read().unwrap().len(), 1);
    }

    #[test]
    fn test_read_nested_separator() {
        let dir = TempDir::new().unwrap();
        write_array(dir.path(), "grid", &[2, 2], &[1, 2], Some("/"));
        write_chunk(dir.path(), "grid", "0/0", &[1.0, 2.0]);
        write_chunk(dir.path(), "grid", "1/0", &[3.0, 4.0]);

        let store = ZarrStore::open(dir.path()).unwrap();
        let metadata = store.load_metadata().unwrap();
        let values = store
            .read_array_subset_f64(&metadata.variables["grid"], &[0..2, 0..2])
            .unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_out_of_bounds_range_is_rejected() {
        let dir = TempDir::new().unwrap();
        write_array(dir.path(), "grid", &[2, 2], &[2, 2], None);
        let store = ZarrStore::open(dir.path()).unwrap();
        let metadata = store.load_metadata().unwrap();
        assert!(store
            .read_array_subset_f64(&metadata.variables["grid"], &[0..3, 0..2])
            .is_err());
    }

    #[test]
    fn test_decode_elements_by_dtype() {
        assert_eq!(
            decode_elements(&[1, 0, 0, 0, 255, 255, 255, 255], "<i4", false).unwrap(),
            vec![1.0, -1.0]
        );
        assert_eq!(decode_elements(&[0, 2], ">u2", true).unwrap(), vec![2.0]);
        assert_eq!(decode_elements(&[255], "|i1", false).unwrap(), vec![-1.0]);
        assert!(decode_elements(&[0; 4], "<U1", false).is_err());
        assert!(!supports_dtype("|S4"));
    }

    #[test]
    fn test_for_each_index_visits_c_order() {
        let mut seen = Vec::new();
        for_each_index(&[0..2, 5..7], |idx| seen.push(idx.to_vec()));
        assert_eq!(seen, vec![vec![0, 5], vec![0, 6], vec![1, 5], vec![1, 6]]);

        let mut scalar = 0;
        for_each_index(&[], |_| scalar += 1);
        assert_eq!(scalar, 1);
        assert_eq!(strides(&[2, 3, 4]), vec![12, 4, 1]);
    }
}
