//! Resolving which variables play the latitude, longitude, time and band roles.

use crate::dataset::Dataset;
use tracing::warn;

pub const LAT_CANDIDATES: [&str; 3] = ["lat", "latitude", "y"];
pub const LON_CANDIDATES: [&str; 3] = ["lon", "longitude", "x"];
pub const TIME_CANDIDATES: [&str; 5] = ["time", "valid_time", "Time", "times", "date"];
pub const BAND_CANDIDATES: [&str; 7] = ["band", "bands", "band_index", "bnd", "bnds", "layer", "level"];

/// Names that look like bands but hold cell bounds.
pub const BOUNDS_EXCLUSIONS: [&str; 4] = ["bnds", "time_bnds", "lat_bnds", "lon_bnds"];

/// Substrings that mark a band-like axis when no candidate matches exactly.
pub const BAND_SUBSTRINGS: [&str; 3] = ["band", "layer", "level"];

/// A band axis needs at least this many values.
pub const MIN_BAND_CARDINALITY: u64 = 3;

/// Columns offered for projection after lat, lon and time.
const LAYER_COLUMN_CANDIDATES: [&str; 4] = ["band", "bands", "level", "depth"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisRole {
    Latitude,
    Longitude,
    Time,
    Band,
}

impl AxisRole {
    pub fn candidates(self) -> &'static [&'static str] {
        match self {
            AxisRole::Latitude => &LAT_CANDIDATES,
            AxisRole::Longitude => &LON_CANDIDATES,
            AxisRole::Time => &TIME_CANDIDATES,
            AxisRole::Band => &BAND_CANDIDATES,
        }
    }
}

/// Coordinate and dimension names of a dataset with their sizes, in dataset
/// order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AxisNames {
    pub coords: Vec<(String, u64)>,
    pub dims: Vec<(String, u64)>,
}

impl AxisNames {
    pub fn from_dataset(ds: &Dataset) -> Self {
        let metadata = ds.metadata();
        let coords = ds
            .coordinate_names()
            .into_iter()
            .map(|name| {
                let size = metadata.variables[&name].shape.iter().product();
                (name, size)
            })
            .collect();
        let dims = metadata
            .dimension_order
            .iter()
            .map(|name| (name.clone(), metadata.dimension_size(name).unwrap_or(0)))
            .collect();
        Self { coords, dims }
    }

    fn coord_size(&self, name: &str) -> Option<u64> {
        self.coords.iter().find(|(n, _)| n == name).map(|(_, s)| *s)
    }

    fn dim_size(&self, name: &str) -> Option<u64> {
        self.dims.iter().find(|(n, _)| n == name).map(|(_, s)| *s)
    }
}

fn is_bounds_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    BOUNDS_EXCLUSIONS.contains(&lower.as_str())
}

/// Pick the variable playing `role`, or `None`.
///
/// Latitude, longitude and time match candidate names exactly against the
/// coordinates, first candidate wins. Band also falls back to dimensions and
/// then to a case-insensitive substring search, and never returns a bounds
/// axis or one with fewer than [`MIN_BAND_CARDINALITY`] values.
pub fn resolve_axis_name(role: AxisRole, names: &AxisNames) -> Option<String> {
    if role != AxisRole::Band {
        return role
            .candidates()
            .iter()
            .find(|cand| names.coord_size(cand).is_some())
            .map(|cand| cand.to_string());
    }

    let usable = |name: &str, size: u64| size >= MIN_BAND_CARDINALITY && !is_bounds_name(name);

    for cand in BAND_CANDIDATES {
        if names.coord_size(cand).is_some_and(|size| usable(cand, size)) {
            return Some(cand.to_string());
        }
    }

    for cand in BAND_CANDIDATES {
        if names.dim_size(cand).is_some_and(|size| usable(cand, size)) {
            return Some(cand.to_string());
        }
    }

    names
        .coords
        .iter()
        .chain(&names.dims)
        .find(|(name, size)| {
            let lower = name.to_lowercase();
            BAND_SUBSTRINGS.iter().any(|s| lower.contains(s)) && usable(name, *size)
        })
        .map(|(name, _)| name.clone())
}

pub fn resolve_axis(ds: &Dataset, role: AxisRole) -> Option<String> {
    resolve_axis_name(role, &AxisNames::from_dataset(ds))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedAxes {
    pub lat: Option<String>,
    pub lon: Option<String>,
    pub time: Option<String>,
    pub band: Option<String>,
}

pub fn resolve_axes(ds: &Dataset) -> ResolvedAxes {
    let names = AxisNames::from_dataset(ds);
    ResolvedAxes {
        lat: resolve_axis_name(AxisRole::Latitude, &names),
        lon: resolve_axis_name(AxisRole::Longitude, &names),
        time: resolve_axis_name(AxisRole::Time, &names),
        band: resolve_axis_name(AxisRole::Band, &names),
    }
}

/// A discovered band axis with its values rendered as labels.
#[derive(Debug, Clone, PartialEq)]
pub struct BandAxis {
    pub name: String,
    pub values: Vec<String>,
}

/// Render a numeric axis value as a label. Whole numbers print without a
/// decimal point.
pub fn format_label(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Find the band axis and its values. A bare dimension yields positions
/// `0..n`.
pub fn discover_band(ds: &Dataset) -> Option<BandAxis> {
    let name = resolve_axis(ds, AxisRole::Band)?;

    let values = if ds.has_coord(&name) {
        match ds.read_all(&name) {
            Ok(values) => values.into_iter().map(format_label).collect(),
            Err(e) => {
                warn!(axis = %name, "could not read band values: {e}");
                return None;
            }
        }
    } else {
        (0..ds.dimension_size(&name).unwrap_or(0))
            .map(|i| i.to_string())
            .collect()
    };

    Some(BandAxis { name, values })
}

/// Columns a caller can project onto: `lat`, `lon`, the time axis, the first
/// layer-like axis, then the data variables. No duplicates.
pub fn detect_columns(ds: &Dataset) -> Vec<String> {
    let mut columns = vec!["lat".to_string(), "lon".to_string()];

    if let Some(time) = resolve_axis(ds, AxisRole::Time) {
        columns.push(time);
    }

    let coords = ds.coordinate_names();
    let dims = ds.dimension_names();
    if let Some(layer) = LAYER_COLUMN_CANDIDATES
        .iter()
        .find(|cand| coords.contains(**cand) || dims.iter().any(|d| d.as_str() == **cand))
    {
        columns.push(layer.to_string());
    }

    columns.extend(ds.data_variable_names());

    let mut seen = std::collections::HashSet::new();
    columns.retain(|c| seen.insert(c.clone()));
    columns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::MemorySource;

    fn names(coords: &[(&str, u64)], dims: &[(&str, u64)]) -> AxisNames {
        AxisNames {
            coords: coords.iter().map(|(n, s)| (n.to_string(), *s)).collect(),
            dims: dims.iter().map(|(n, s)| (n.to_string(), *s)).collect(),
        }
    }

    #[test]
    fn test_first_candidate_wins() {
        let n = names(&[("latitude", 10), ("lat", 10), ("x", 5)], &[]);
        assert_eq!(resolve_axis_name(AxisRole::Latitude, &n), Some("lat".to_string()));
        assert_eq!(resolve_axis_name(AxisRole::Longitude, &n), Some("x".to_string()));
        assert_eq!(resolve_axis_name(AxisRole::Time, &n), None);
    }

    #[test]
    fn test_time_candidates_are_case_sensitive() {
        let n = names(&[("Time", 4)], &[]);
        assert_eq!(resolve_axis_name(AxisRole::Time, &n), Some("Time".to_string()));
        let n = names(&[("TIME", 4)], &[]);
        assert_eq!(resolve_axis_name(AxisRole::Time, &n), None);
    }

    #[test]
    fn test_band_excludes_bounds_and_small_axes() {
        let n = names(&[("lat_bnds", 10)], &[("bnds", 2), ("lat_bnds", 10)]);
        assert_eq!(resolve_axis_name(AxisRole::Band, &n), None);

        let n = names(&[("band", 2)], &[("band", 2)]);
        assert_eq!(resolve_axis_name(AxisRole::Band, &n), None);

        let n = names(&[("bnds", 5)], &[]);
        assert_eq!(resolve_axis_name(AxisRole::Band, &n), None);
    }

    #[test]
    fn test_band_falls_back_to_dims_then_substrings() {
        let n = names(&[], &[("band", 4)]);
        assert_eq!(resolve_axis_name(AxisRole::Band, &n), Some("band".to_string()));

        let n = names(&[("soil_Layer", 4)], &[("pressure_level", 6)]);
        assert_eq!(resolve_axis_name(AxisRole::Band, &n), Some("soil_Layer".to_string()));

        let n = names(&[], &[("pressure_level", 6)]);
        assert_eq!(resolve_axis_name(AxisRole::Band, &n), Some("pressure_level".to_string()));
    }

    #[test]
    fn test_discover_band_values() {
        let ds = Dataset::new(
            "mem",
            MemorySource::new()
                .with_coord("band", vec![1.0, 2.0, 3.0])
                .with_array("v", &[("band", 3), ("x", 1)], vec![0.0; 3]),
        );
        let band = discover_band(&ds).unwrap();
        assert_eq!(band.name, "band");
        assert_eq!(band.values, vec!["1", "2", "3"]);

        let ds = Dataset::new(
            "mem",
            MemorySource::new().with_array("v", &[("layer", 4)], vec![0.0; 4]),
        );
        assert_eq!(discover_band(&ds).unwrap().values, vec!["0", "1", "2", "3"]);
    }

    #[test]
    fn test_detect_columns() {
        let ds = Dataset::new(
            "mem",
            MemorySource::new()
                .with_coord("time", vec![0.0, 1.0])
                .with_coord("latitude", vec![0.0, 1.0])
                .with_coord("longitude", vec![0.0, 1.0])
                .with_coord("depth", vec![5.0])
                .with_array(
                    "lat",
                    &[("time", 2), ("depth", 1), ("latitude", 2), ("longitude", 2)],
                    vec![0.0; 8],
                )
                .with_array(
                    "sst",
                    &[("time", 2), ("depth", 1), ("latitude", 2), ("longitude", 2)],
                    vec![0.0; 8],
                ),
        );
        assert_eq!(detect_columns(&ds), vec!["lat", "lon", "time", "depth", "sst"]);
    }

    #[test]
    fn test_format_label() {
        assert_eq!(format_label(3.0), "3");
        assert_eq!(format_label(-2.0), "-2");
        assert_eq!(format_label(2.5), "2.5");
        assert_eq!(format_label(f64::NAN), "NaN");
    }
}
