//! Opened datasets and the storage seam behind them.

use crate::error::{ExtractError, Result};
use crate::metadata::{AttributeValue, StoreMetadata, Variable};
use crate::store::{self, ZarrStore};
use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use std::path::Path;

/// Storage behind a [`Dataset`]: metadata plus subset reads of raw values.
pub trait GridSource: Send {
    fn metadata(&self) -> &StoreMetadata;

    /// Read `variable` over one half-open range per dimension, in C order.
    fn read(&self, variable: &str, ranges: &[Range<u64>]) -> Result<Vec<f64>>;
}

/// A Zarr v2 store on disk.
pub struct ZarrSource {
    store: ZarrStore,
    metadata: StoreMetadata,
}

impl ZarrSource {
    pub fn open(path: &Path) -> Result<Self> {
        let store = ZarrStore::open(path).map_err(|e| ExtractError::open(path, format!("{e:#}")))?;
        let metadata = store
            .load_metadata()
            .map_err(|e| ExtractError::open(path, format!("{e:#}")))?;
        Ok(Self { store, metadata })
    }
}

impl GridSource for ZarrSource {
    fn metadata(&self) -> &StoreMetadata {
        &self.metadata
    }

    fn read(&self, variable: &str, ranges: &[Range<u64>]) -> Result<Vec<f64>> {
        let var = self
            .metadata
            .variables
            .get(variable)
            .ok_or_else(|| ExtractError::MissingVariable(variable.to_string()))?;
        self.store
            .read_array_subset_f64(var, ranges)
            .map_err(|e| ExtractError::read(variable, format!("{e:#}")))
    }
}

/// In-memory dataset, mostly for tests and callers that already hold arrays.
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    metadata: StoreMetadata,
    data: HashMap<String, Vec<f64>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable with its values in C order.
    pub fn with_variable(mut self, variable: Variable, values: Vec<f64>) -> Self {
        self.data.insert(variable.name.clone(), values);
        self.metadata.variables.insert(variable.name.clone(), variable);
        self.metadata.infer_dimensions();
        self
    }

    /// Add a float64 variable over the named dimensions.
    pub fn with_array(self, name: &str, dims: &[(&str, u64)], values: Vec<f64>) -> Self {
        self.with_variable(Variable::new(name, "<f8", dims), values)
    }

    /// Add a 1-D dimension coordinate named like its dimension.
    pub fn with_coord(self, name: &str, values: Vec<f64>) -> Self {
        let len = values.len() as u64;
        self.with_array(name, &[(name, len)], values)
    }

    pub fn with_attr(mut self, variable: &str, key: &str, value: AttributeValue) -> Self {
        if let Some(var) = self.metadata.variables.get_mut(variable) {
            var.attributes.insert(key.to_string(), value);
        }
        self
    }

    pub fn with_global_attr(mut self, key: &str, value: AttributeValue) -> Self {
        self.metadata.global_attributes.insert(key.to_string(), value);
        self
    }
}

impl GridSource for MemorySource {
    fn metadata(&self) -> &StoreMetadata {
        &self.metadata
    }

    fn read(&self, variable: &str, ranges: &[Range<u64>]) -> Result<Vec<f64>> {
        let var = self
            .metadata
            .variables
            .get(variable)
            .ok_or_else(|| ExtractError::MissingVariable(variable.to_string()))?;
        let data = &self.data[variable];

        if ranges.len() != var.shape.len()
            || ranges.iter().zip(&var.shape).any(|(r, &n)| r.start > r.end || r.end > n)
        {
            return Err(ExtractError::read(variable, format!("ranges {ranges:?} out of bounds")));
        }

        let strides = store::strides(&var.shape);
        let mut out = Vec::new();
        store::for_each_index(ranges, |idx| {
            let offset: u64 = idx.iter().zip(&strides).map(|(i, s)| i * s).sum();
            out.push(data.get(offset as usize).copied().unwrap_or(f64::NAN));
        });
        Ok(out)
    }
}

/// An opened dataset. Values are read on demand; the handle releases its
/// storage when dropped.
pub struct Dataset {
    name: String,
    source: Box<dyn GridSource>,
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("name", &self.name)
            .field("variables", &self.metadata().variables.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Open a Zarr store as a dataset.
pub fn open_dataset(path: &Path) -> Result<Dataset> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    Ok(Dataset::new(name, ZarrSource::open(path)?))
}

impl Dataset {
    pub fn new(name: impl Into<String>, source: impl GridSource + 'static) -> Self {
        Self {
            name: name.into(),
            source: Box::new(source),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> &StoreMetadata {
        self.source.metadata()
    }

    pub fn variable(&self, name: &str) -> Result<&Variable> {
        self.metadata()
            .variables
            .get(name)
            .ok_or_else(|| ExtractError::MissingVariable(name.to_string()))
    }

    pub fn coordinate_names(&self) -> BTreeSet<String> {
        self.metadata().coordinate_names()
    }

    pub fn has_coord(&self, name: &str) -> bool {
        self.coordinate_names().contains(name)
    }

    /// Dimension names in order of first appearance.
    pub fn dimension_names(&self) -> Vec<String> {
        self.metadata().dimension_order.clone()
    }

    pub fn dimension_size(&self, name: &str) -> Option<u64> {
        self.metadata().dimension_size(name)
    }

    pub fn data_variable_names(&self) -> Vec<String> {
        self.metadata().data_variable_names()
    }

    pub fn shape_of(&self, name: &str) -> Result<Vec<u64>> {
        Ok(self.variable(name)?.shape.clone())
    }

    pub fn attr_string(&self, variable: &str, key: &str) -> Option<String> {
        self.metadata()
            .variables
            .get(variable)
            .and_then(|v| v.attr_string(key))
            .map(str::to_string)
    }

    /// Read raw values: no masking, no scaling.
    pub fn read_raw(&self, name: &str, ranges: &[Range<u64>]) -> Result<Vec<f64>> {
        let var = self.variable(name)?;
        if !store::supports_dtype(&var.dtype) {
            return Err(ExtractError::UnsupportedDtype {
                variable: name.to_string(),
                dtype: var.dtype.clone(),
            });
        }
        self.source.read(name, ranges)
    }

    /// Read values with missing-value masking (to NaN) and
    /// `scale_factor`/`add_offset` applied.
    pub fn read_values(&self, name: &str, ranges: &[Range<u64>]) -> Result<Vec<f64>> {
        let mut values = self.read_raw(name, ranges)?;
        let var = self.variable(name)?;

        let mut missing = var.missing_values();
        if !var.is_integer() {
            let fill = var.fill_value_f64();
            if !fill.is_nan() {
                missing.push(fill);
            }
        }
        let scale = var.attributes.get("scale_factor").and_then(AttributeValue::as_f64);
        let offset = var.attributes.get("add_offset").and_then(AttributeValue::as_f64);

        for v in values.iter_mut() {
            if missing.contains(v) {
                *v = f64::NAN;
                continue;
            }
            if let Some(scale) = scale {
                *v *= scale;
            }
            if let Some(offset) = offset {
                *v += offset;
            }
        }
        Ok(values)
    }

    /// Read a whole variable.
    pub fn read_all(&self, name: &str) -> Result<Vec<f64>> {
        let ranges: Vec<Range<u64>> = self.shape_of(name)?.into_iter().map(|n| 0..n).collect();
        self.read_values(name, &ranges)
    }
}
