//! Flattening a selected dataset into a rectangular table.

use crate::calendar::{AxisTime, TimeAxisValues};
use crate::dataset::Dataset;
use crate::error::{ExtractError, Result};
use crate::spatial::SpatialSelection;
use crate::store::{self, for_each_index};
use crate::time_range;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::ops::Range;
use tracing::{debug, warn};

/// Block size, in selected positions, used when reading the spatial
/// dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSizes {
    pub lat: usize,
    pub lon: usize,
}

impl Default for ChunkSizes {
    fn default() -> Self {
        Self { lat: 100, lon: 100 }
    }
}

impl ChunkSizes {
    pub fn validate(&self) -> Result<()> {
        if self.lat == 0 || self.lon == 0 {
            return Err(ExtractError::InvalidParameter(
                "chunk sizes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Float(Vec<f64>),
    Int(Vec<i64>),
    /// Gregorian timestamps.
    Timestamp(Vec<Option<NaiveDateTime>>),
    /// Values in a non-Gregorian calendar.
    CalendarTime(Vec<Option<AxisTime>>),
    Text(Vec<String>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Float(v) => v.len(),
            Column::Int(v) => v.len(),
            Column::Timestamp(v) => v.len(),
            Column::CalendarTime(v) => v.len(),
            Column::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<(String, Column)>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, column: Column) {
        self.columns.push((name.into(), column));
    }

    pub fn row_count(&self) -> usize {
        self.columns.first().map_or(0, |(_, c)| c.len())
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    /// Rename the latitude and longitude columns to `lat` and `lon`.
    pub fn rename_spatial(&mut self, lat_name: &str, lon_name: &str) {
        for (name, _) in self.columns.iter_mut() {
            if name.as_str() == lat_name {
                *name = "lat".to_string();
            } else if name.as_str() == lon_name {
                *name = "lon".to_string();
            }
        }
    }

    /// Keep the requested columns that exist, in the requested order. When
    /// none of them exist the table is left alone. Returns how many columns
    /// were kept.
    pub fn project(&mut self, wanted: &[String]) -> usize {
        let mut seen = HashSet::new();
        let order: Vec<usize> = wanted
            .iter()
            .filter(|w| seen.insert(w.as_str()))
            .filter_map(|w| self.columns.iter().position(|(n, _)| n == w))
            .collect();
        if order.is_empty() {
            return 0;
        }

        let mut slots: Vec<Option<(String, Column)>> = std::mem::take(&mut self.columns).into_iter().map(Some).collect();
        self.columns = order.iter().filter_map(|&i| slots[i].take()).collect();
        self.columns.len()
    }

    /// Turn calendar-typed columns into text. Returns how many were
    /// converted.
    pub fn stringify_calendar_columns(&mut self) -> usize {
        let mut converted = 0;
        for (_, column) in self.columns.iter_mut() {
            if let Column::CalendarTime(values) = column {
                let text = values
                    .iter()
                    .map(|v| v.map(|t| t.to_string()).unwrap_or_default())
                    .collect();
                *column = Column::Text(text);
                converted += 1;
            }
        }
        converted
    }
}

/// Which positions of the dataset to keep.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub spatial: SpatialSelection,
    /// Kept positions along non-spatial dimensions (time slice, band filter).
    /// Dimensions not listed keep every position.
    pub dim_index: BTreeMap<String, Vec<usize>>,
}

impl Selection {
    pub fn new(spatial: SpatialSelection) -> Self {
        Self {
            spatial,
            dim_index: BTreeMap::new(),
        }
    }

    fn positions(&self, ds: &Dataset, dim: &str) -> Vec<usize> {
        if let Some(index) = self.spatial.index_for(dim) {
            return index.to_vec();
        }
        if let Some(index) = self.dim_index.get(dim) {
            return index.clone();
        }
        (0..ds.dimension_size(dim).unwrap_or(0) as usize).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaterializePlan {
    pub time_name: Option<String>,
    pub band_name: Option<String>,
    pub chunks: ChunkSizes,
}

/// Index dimensions in row order: spatial, time, band, then the rest.
fn index_dims(ds: &Dataset, selection: &Selection, plan: &MaterializePlan, data_vars: &[String]) -> Vec<String> {
    let mut dims: Vec<String> = selection.spatial.dims().into_iter().map(str::to_string).collect();

    let dims_of = |name: &str| -> Vec<String> {
        ds.variable(name)
            .map(|v| v.dimension_names().into_iter().map(str::to_string).collect())
            .unwrap_or_default()
    };

    if let Some(time) = &plan.time_name {
        dims.extend(dims_of(time));
    }
    if let Some(band) = &plan.band_name {
        if ds.variable(band).is_ok() {
            dims.extend(dims_of(band));
        } else {
            dims.push(band.clone());
        }
    }
    let order = ds.dimension_names();
    for dim in order {
        if data_vars.iter().any(|v| dims_of(v).contains(&dim)) {
            dims.push(dim);
        }
    }

    let mut seen = HashSet::new();
    dims.retain(|d| seen.insert(d.clone()));
    dims
}

/// Read a variable at the selected positions of each of its dimensions, in
/// the variable's own dimension order. Spatial dimensions are read in blocks.
fn read_selected(
    ds: &Dataset,
    name: &str,
    positions: &[Vec<usize>],
    block_sizes: &[usize],
) -> Result<Vec<f64>> {
    let counts: Vec<u64> = positions.iter().map(|p| p.len() as u64).collect();
    let total: u64 = counts.iter().product();
    let mut out = vec![f64::NAN; total as usize];
    if total == 0 {
        return Ok(out);
    }
    let out_strides = store::strides(&counts);

    let block_counts: Vec<Range<u64>> = positions
        .iter()
        .zip(block_sizes)
        .map(|(p, &b)| 0..p.len().div_ceil(b) as u64)
        .collect();

    let mut failure = None;
    for_each_index(&block_counts, |block| {
        if failure.is_some() {
            return;
        }

        // Selected positions covered by this block, per dimension.
        let spans: Vec<Range<usize>> = block
            .iter()
            .zip(positions)
            .zip(block_sizes)
            .map(|((&b, p), &size)| {
                let start = b as usize * size;
                start..(start + size).min(p.len())
            })
            .collect();
        let ranges: Vec<Range<u64>> = spans
            .iter()
            .zip(positions)
            .map(|(span, p)| {
                let slice = &p[span.clone()];
                let lo = slice.iter().copied().min().unwrap_or(0) as u64;
                let hi = slice.iter().copied().max().unwrap_or(0) as u64;
                lo..hi + 1
            })
            .collect();

        let dense = match ds.read_values(name, &ranges) {
            Ok(values) => values,
            Err(e) => {
                failure = Some(e);
                return;
            }
        };
        let dense_shape: Vec<u64> = ranges.iter().map(|r| r.end - r.start).collect();
        let dense_strides = store::strides(&dense_shape);

        let local: Vec<Range<u64>> = spans.iter().map(|s| s.start as u64..s.end as u64).collect();
        for_each_index(&local, |idx| {
            let mut src = 0u64;
            let mut dst = 0u64;
            for d in 0..idx.len() {
                let pos = positions[d][idx[d] as usize] as u64;
                src += (pos - ranges[d].start) * dense_strides[d];
                dst += idx[d] * out_strides[d];
            }
            out[dst as usize] = dense[src as usize];
        });
    });

    match failure {
        Some(e) => Err(e),
        None => Ok(out),
    }
}

/// Spread values laid out over `var_dims` across every row of the table.
fn broadcast<T: Copy>(values: &[T], var_dims: &[String], index_dims: &[String], counts: &[usize]) -> Vec<T> {
    let var_counts: Vec<u64> = var_dims
        .iter()
        .map(|d| index_dims.iter().position(|i| i == d).map_or(1, |p| counts[p] as u64))
        .collect();
    let var_strides = store::strides(&var_counts);
    // Stride of each index dimension inside the variable, zero if absent.
    let strides: Vec<u64> = index_dims
        .iter()
        .map(|d| var_dims.iter().position(|v| v == d).map_or(0, |p| var_strides[p]))
        .collect();

    let ranges: Vec<Range<u64>> = counts.iter().map(|&c| 0..c as u64).collect();
    let mut out = Vec::with_capacity(counts.iter().product());
    if values.is_empty() {
        return out;
    }
    for_each_index(&ranges, |idx| {
        let offset: u64 = idx.iter().zip(&strides).map(|(i, s)| i * s).sum();
        out.push(values[offset as usize]);
    });
    out
}

/// Integer columns only for unpacked integer variables whose decoded values
/// are all whole numbers.
fn numeric_column(ds: &Dataset, name: &str, values: Vec<f64>) -> Column {
    let integer = ds.variable(name).is_ok_and(|v| v.is_integer() && !v.is_packed());
    if integer && values.iter().all(|v| v.is_finite() && v.fract() == 0.0) {
        Column::Int(values.into_iter().map(|v| v as i64).collect())
    } else {
        Column::Float(values)
    }
}

/// Build the table for a selection: one column per index dimension, then
/// auxiliary coordinates, then data variables, with one row per combination
/// of selected index positions.
pub fn materialize(ds: &Dataset, selection: &Selection, plan: &MaterializePlan) -> Result<Table> {
    plan.chunks.validate()?;

    let mut data_vars = Vec::new();
    for name in ds.data_variable_names() {
        let var = ds.variable(&name)?;
        if store::supports_dtype(&var.dtype) {
            data_vars.push(name);
        } else {
            warn!(dataset = ds.name(), variable = %name, dtype = %var.dtype, "dropping variable with unsupported dtype");
        }
    }

    let dims = index_dims(ds, selection, plan, &data_vars);
    let positions: BTreeMap<&str, Vec<usize>> = dims
        .iter()
        .map(|d| (d.as_str(), selection.positions(ds, d)))
        .collect();
    let counts: Vec<usize> = dims.iter().map(|d| positions[d.as_str()].len()).collect();
    debug!(dataset = ds.name(), ?dims, ?counts, "materializing");

    let spatial_dims = selection.spatial.dims();
    let block_size = |dim: &str, n: usize| -> usize {
        match spatial_dims.iter().position(|d| *d == dim) {
            Some(0) => plan.chunks.lat,
            Some(_) => plan.chunks.lon,
            None => n.max(1),
        }
    };

    let read_var = |name: &str| -> Result<(Vec<String>, Vec<f64>)> {
        let var_dims: Vec<String> = ds
            .variable(name)?
            .dimension_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let var_positions: Vec<Vec<usize>> = var_dims
            .iter()
            .map(|d| positions.get(d.as_str()).cloned().unwrap_or_else(|| selection.positions(ds, d)))
            .collect();
        let blocks: Vec<usize> = var_dims
            .iter()
            .zip(&var_positions)
            .map(|(d, p)| block_size(d, p.len()))
            .collect();
        let values = read_selected(ds, name, &var_positions, &blocks)?;
        Ok((var_dims, values))
    };

    let time_axis: Option<(String, TimeAxisValues)> = match &plan.time_name {
        Some(name) => match time_range::read_time_axis(ds, name) {
            Ok(values) => Some((name.clone(), values)),
            Err(e) => {
                warn!(dataset = ds.name(), axis = %name, "time values left undecoded: {e}");
                None
            }
        },
        None => None,
    };

    let coords = ds.coordinate_names();
    let mut table = Table::new();

    let push_coord = |table: &mut Table, name: &str, var_dims: Vec<String>, values: Vec<f64>| {
        let column = match &time_axis {
            Some((time_name, axis)) if time_name == name && var_dims.len() == 1 => {
                let kept = axis.select(&positions[var_dims[0].as_str()]);
                match kept {
                    TimeAxisValues::Timestamps(v) => Column::Timestamp(broadcast(&v, &var_dims, &dims, &counts)),
                    TimeAxisValues::Calendar(v) => Column::CalendarTime(broadcast(&v, &var_dims, &dims, &counts)),
                }
            }
            _ => numeric_column(ds, name, broadcast(&values, &var_dims, &dims, &counts)),
        };
        table.push(name, column);
    };

    for dim in &dims {
        if coords.contains(dim) && ds.variable(dim).is_ok_and(|v| v.dimension_names() == [dim.as_str()]) {
            let (var_dims, values) = read_var(dim)?;
            push_coord(&mut table, dim, var_dims, values);
        } else {
            let index = positions[dim.as_str()].iter().map(|&p| p as i64).collect::<Vec<_>>();
            table.push(dim.clone(), Column::Int(broadcast(&index, std::slice::from_ref(dim), &dims, &counts)));
        }
    }

    for name in &coords {
        if dims.contains(name) {
            continue;
        }
        let Ok(var) = ds.variable(name) else { continue };
        let fits = var.dimension_names().iter().all(|d| dims.iter().any(|i| i == d));
        if !fits || !store::supports_dtype(&var.dtype) {
            continue;
        }
        let (var_dims, values) = read_var(name)?;
        push_coord(&mut table, name, var_dims, values);
    }

    // Cells of a 2-D grid outside the box read as missing.
    let outside: Option<Vec<bool>> = match &selection.spatial {
        SpatialSelection::Paired { mask, .. } => {
            let inner: usize = counts[2..].iter().product();
            Some((0..mask.len() * inner).map(|r| !mask[r / inner]).collect())
        }
        _ => None,
    };

    for name in &data_vars {
        let (var_dims, values) = read_var(name)?;
        let mut values = broadcast(&values, &var_dims, &dims, &counts);
        let spatial = selection.spatial.dims();
        if let Some(outside) = &outside {
            if spatial.iter().all(|d| var_dims.iter().any(|v| v == d)) {
                for (v, &out) in values.iter_mut().zip(outside) {
                    if out {
                        *v = f64::NAN;
                    }
                }
            }
        }
        table.push(name.clone(), numeric_column(ds, name, values));
    }

    Ok(table)
}
