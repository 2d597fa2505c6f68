use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Represents a dimension of a variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub size: u64,
}

/// Represents an attribute in Zarr metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Number(f64),
    Integer(i64),
    Boolean(bool),
    Array(Vec<AttributeValue>),
    Object(HashMap<String, AttributeValue>),
    Null,
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            AttributeValue::Integer(i) => Some(*i as f64),
            // Zarr v2 encodes non-finite fill values as strings.
            AttributeValue::String(s) => match s.as_str() {
                "NaN" => Some(f64::NAN),
                "Infinity" => Some(f64::INFINITY),
                "-Infinity" => Some(f64::NEG_INFINITY),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Represents a Zarr variable/array
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<u64>,
    pub chunks: Vec<u64>,
    pub compressor: Option<String>,
    pub fill_value: Option<AttributeValue>,
    pub order: String,
    pub filters: Vec<String>,
    pub dimension_separator: Option<String>,
    pub attributes: HashMap<String, AttributeValue>,
    pub dimensions: Vec<Dimension>,
}

impl Variable {
    /// Build an uncompressed, single-chunk variable description.
    pub fn new(name: impl Into<String>, dtype: impl Into<String>, dims: &[(&str, u64)]) -> Self {
        let shape: Vec<u64> = dims.iter().map(|(_, size)| *size).collect();
        let mut attributes = HashMap::new();
        attributes.insert(
            "_ARRAY_DIMENSIONS".to_string(),
            AttributeValue::Array(
                dims.iter()
                    .map(|(name, _)| AttributeValue::String((*name).to_string()))
                    .collect(),
            ),
        );

        Self {
            name: name.into(),
            dtype: dtype.into(),
            chunks: shape.clone(),
            shape,
            compressor: None,
            fill_value: None,
            order: "C".to_string(),
            filters: vec![],
            dimension_separator: None,
            attributes,
            dimensions: dims
                .iter()
                .map(|(name, size)| Dimension {
                    name: (*name).to_string(),
                    size: *size,
                })
                .collect(),
        }
    }

    pub fn dimension_names(&self) -> Vec<&str> {
        self.dimensions.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn attr_string(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(AttributeValue::as_str)
    }

    /// Values that mark missing data (`_FillValue`, `missing_value`, array fill value).
    pub fn missing_values(&self) -> Vec<f64> {
        let mut out: Vec<f64> = Vec::new();

        if let Some(v) = self.attributes.get("_FillValue") {
            push_missing_values_attr(&mut out, v);
        }

        if let Some(v) = self.attributes.get("missing_value") {
            push_missing_values_attr(&mut out, v);
        }

        out.sort_by(|a, b| a.total_cmp(b));
        out.dedup();
        out
    }

    pub fn fill_value_f64(&self) -> f64 {
        self.fill_value
            .as_ref()
            .and_then(AttributeValue::as_f64)
            .unwrap_or(f64::NAN)
    }

    /// Whether the dtype holds integers (affects how values are displayed).
    pub fn is_integer(&self) -> bool {
        matches!(
            self.dtype.trim_start_matches(['<', '>', '|', '=']),
            "i1" | "i2" | "i4" | "i8" | "u1" | "u2" | "u4" | "u8"
        )
    }

    /// Whether stored values are CF-packed (`scale_factor`/`add_offset`),
    /// so decoded values are no longer of the storage dtype.
    pub fn is_packed(&self) -> bool {
        self.attributes.contains_key("scale_factor") || self.attributes.contains_key("add_offset")
    }
}

fn push_missing_values_attr(out: &mut Vec<f64>, value: &AttributeValue) {
    match value {
        AttributeValue::Array(values) => {
            for v in values {
                push_missing_values_attr(out, v);
            }
        }
        other => {
            if let Some(v) = other.as_f64().filter(|v| !v.is_nan()) {
                out.push(v);
            }
        }
    }
}

/// Dimension information across the entire store
#[derive(Debug, Clone)]
pub struct DimensionInfo {
    pub name: String,
    pub length: u64,
    pub appearances: Vec<(String, u64)>, // (variable_name, size) pairs
}

/// Root metadata structure for a Zarr store
#[derive(Debug, Default, Clone)]
pub struct StoreMetadata {
    pub global_attributes: HashMap<String, AttributeValue>,
    pub variables: BTreeMap<String, Variable>,
    pub dimensions: BTreeMap<String, DimensionInfo>,
    /// Dimension names in order of first appearance.
    pub dimension_order: Vec<String>,
}

impl StoreMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variables(variables: impl IntoIterator<Item = Variable>) -> Self {
        let mut metadata = Self::new();
        for var in variables {
            metadata.variables.insert(var.name.clone(), var);
        }
        metadata.infer_dimensions();
        metadata
    }

    /// Infer dimensions from all variables and attach them to each variable
    pub fn infer_dimensions(&mut self) {
        let mut dimension_map: BTreeMap<String, Vec<(String, u64)>> = BTreeMap::new();
        let mut order: Vec<String> = Vec::new();

        for (var_name, variable) in &self.variables {
            let dim_names = extract_dimension_names(variable);

            for (i, &size) in variable.shape.iter().enumerate() {
                let dim_name = dim_names
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| format!("dim_{}", i));

                if !order.contains(&dim_name) {
                    order.push(dim_name.clone());
                }

                dimension_map
                    .entry(dim_name)
                    .or_default()
                    .push((var_name.clone(), size));
            }
        }

        self.dimensions = dimension_map
            .into_iter()
            .map(|(name, appearances)| {
                let length = appearances.iter().map(|(_, size)| *size).max().unwrap_or(0);
                (
                    name.clone(),
                    DimensionInfo {
                        name,
                        length,
                        appearances,
                    },
                )
            })
            .collect();
        self.dimension_order = order;

        for variable in self.variables.values_mut() {
            let dim_names = extract_dimension_names(variable);
            variable.dimensions = variable
                .shape
                .iter()
                .enumerate()
                .map(|(i, &size)| Dimension {
                    name: dim_names
                        .get(i)
                        .cloned()
                        .unwrap_or_else(|| format!("dim_{}", i)),
                    size,
                })
                .collect();
        }
    }

    pub fn dimension_size(&self, name: &str) -> Option<u64> {
        self.dimensions.get(name).map(|d| d.length)
    }

    /// Coordinate variables: 1-D variables named like their dimension, plus
    /// anything listed in a `coordinates` attribute.
    pub fn coordinate_names(&self) -> BTreeSet<String> {
        let mut coords: BTreeSet<String> = self
            .variables
            .values()
            .filter(|var| var.dimensions.len() == 1 && var.dimensions[0].name == var.name)
            .map(|var| var.name.clone())
            .collect();

        let listed = self
            .variables
            .values()
            .filter_map(|var| var.attr_string("coordinates"))
            .chain(
                self.global_attributes
                    .get("coordinates")
                    .and_then(AttributeValue::as_str),
            );

        for names in listed {
            for name in names.split_whitespace() {
                if self.variables.contains_key(name) {
                    coords.insert(name.to_string());
                }
            }
        }

        coords
    }

    /// Data variables: everything that is not a coordinate, a bounds variable
    /// or a grid-mapping container.
    pub fn data_variable_names(&self) -> Vec<String> {
        let coords = self.coordinate_names();

        let mut auxiliary: BTreeSet<&str> = BTreeSet::new();
        for var in self.variables.values() {
            if let Some(bounds) = var.attr_string("bounds") {
                auxiliary.insert(bounds);
            }
            if let Some(gm) = var.attr_string("grid_mapping") {
                auxiliary.insert(gm);
            }
        }

        self.variables
            .values()
            .filter(|var| !coords.contains(&var.name))
            .filter(|var| !auxiliary.contains(var.name.as_str()))
            .filter(|var| !var.attributes.contains_key("grid_mapping_name"))
            .filter(|var| !var.shape.is_empty())
            .map(|var| var.name.clone())
            .collect()
    }
}

/// Extract dimension names from _ARRAY_DIMENSIONS attribute or generate defaults
pub fn extract_dimension_names(variable: &Variable) -> Vec<String> {
    if let Some(AttributeValue::Array(dims)) = variable.attributes.get("_ARRAY_DIMENSIONS") {
        dims.iter()
            .filter_map(|val| match val {
                AttributeValue::String(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    } else {
        (0..variable.shape.len())
            .map(|i| format!("dim_{}", i))
            .collect()
    }
}

/// Raw Zarr array metadata from .zarray file
#[derive(Debug, Deserialize)]
pub struct ZArrayMetadata {
    pub zarr_format: u8,
    pub shape: Vec<u64>,
    pub chunks: Vec<u64>,
    pub dtype: String,
    pub compressor: Option<serde_json::Value>,
    pub fill_value: Option<serde_json::Value>,
    pub order: String,
    pub filters: Option<Vec<serde_json::Value>>,
    pub dimension_separator: Option<String>,
}

/// Consolidated metadata from .zmetadata file
#[derive(Debug, Deserialize)]
pub struct ConsolidatedMetadata {
    pub zarr_consolidated_format: u8,
    pub metadata: HashMap<String, serde_json::Value>,
}
