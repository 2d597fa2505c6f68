//! Bounding-box selection of grid points.

use crate::axes::{self, AxisRole, BandAxis};
use crate::dataset::{self, Dataset};
use crate::error::{ExtractError, Result};
use crate::sink;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

/// Points shown in a preview table.
pub const PREVIEW_DISPLAY_LIMIT: usize = 200;
/// Points handed to a map view.
pub const MAP_SAMPLE_LIMIT: usize = 5000;
pub const MAP_SAMPLE_SEED: u64 = 1;
/// Rectilinear grids with more nodes than this are summarised instead of
/// enumerated.
pub const LARGE_GRID_THRESHOLD: usize = 5_000_000;
/// Side of the corner block sampled from a large grid.
pub const LARGE_GRID_SAMPLE_SIDE: usize = 50;

/// Inclusive latitude/longitude box. Longitudes are compared as given; there
/// is no wraparound at the antimeridian.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl BoundingBox {
    pub fn new(lat_min: f64, lat_max: f64, lon_min: f64, lon_max: f64) -> Result<Self> {
        let bbox = Self {
            lat_min,
            lat_max,
            lon_min,
            lon_max,
        };
        bbox.validate()?;
        Ok(bbox)
    }

    pub fn validate(&self) -> Result<()> {
        let all = [self.lat_min, self.lat_max, self.lon_min, self.lon_max];
        if all.iter().any(|v| !v.is_finite()) {
            return Err(ExtractError::InvalidParameter(
                "bounding box values must be finite".to_string(),
            ));
        }
        if self.lat_min > self.lat_max || self.lon_min > self.lon_max {
            return Err(ExtractError::InvalidParameter(format!(
                "bounding box minimum exceeds maximum (lat {}..{}, lon {}..{})",
                self.lat_min, self.lat_max, self.lon_min, self.lon_max
            )));
        }
        Ok(())
    }

    pub fn contains_lat(&self, lat: f64) -> bool {
        lat >= self.lat_min && lat <= self.lat_max
    }

    pub fn contains_lon(&self, lon: f64) -> bool {
        lon >= self.lon_min && lon <= self.lon_max
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        self.contains_lat(lat) && self.contains_lon(lon)
    }
}

/// Parses `lat_min,lat_max,lon_min,lon_max`.
impl FromStr for BoundingBox {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            ExtractError::InvalidParameter(format!(
                "'{s}' is not a bounding box; expected LAT_MIN,LAT_MAX,LON_MIN,LON_MAX"
            ))
        };
        let values = s
            .split(',')
            .map(|part| part.trim().parse::<f64>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>>>()?;
        match values[..] {
            [lat_min, lat_max, lon_min, lon_max] => Self::new(lat_min, lat_max, lon_min, lon_max),
            _ => Err(invalid()),
        }
    }
}

/// A coordinate variable's values with its shape (one or two dimensions).
#[derive(Debug, Clone, PartialEq)]
pub struct CoordArray {
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

impl CoordArray {
    pub fn one_d(dim: &str, values: Vec<f64>) -> Self {
        Self {
            dims: vec![dim.to_string()],
            shape: vec![values.len()],
            values,
        }
    }

    pub fn two_d(dims: [&str; 2], rows: usize, cols: usize, values: Vec<f64>) -> Self {
        Self {
            dims: dims.iter().map(|d| d.to_string()).collect(),
            shape: vec![rows, cols],
            values,
        }
    }

    pub fn read(ds: &Dataset, name: &str) -> Result<Self> {
        let var = ds.variable(name)?;
        Ok(Self {
            dims: var.dimension_names().into_iter().map(str::to_string).collect(),
            shape: var.shape.iter().map(|&n| n as usize).collect(),
            values: ds.read_all(name)?,
        })
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GridLayout {
    /// Independent 1-D latitude and longitude axes.
    Rectilinear,
    /// Latitude and longitude given per cell by equal-shape 2-D arrays.
    Curvilinear,
    /// 1-D latitude and longitude sharing one dimension (stations).
    Points,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GridPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Grid points inside a bounding box.
///
/// `full` is `None` when the grid was too large to enumerate; `count` is
/// exact either way.
#[derive(Debug, Clone, PartialEq)]
pub struct GridPointSet {
    pub layout: GridLayout,
    pub count: usize,
    pub full: Option<Vec<GridPoint>>,
    pub display: Vec<GridPoint>,
    pub map_sample: Vec<GridPoint>,
}

impl GridPointSet {
    fn enumerated(layout: GridLayout, points: Vec<GridPoint>) -> Self {
        let display = points.iter().take(PREVIEW_DISPLAY_LIMIT).copied().collect();
        let map_sample = map_sample(&points);
        Self {
            layout,
            count: points.len(),
            full: Some(points),
            display,
            map_sample,
        }
    }
}

/// At most [`MAP_SAMPLE_LIMIT`] points drawn with a fixed seed, kept in source
/// order.
pub fn map_sample(points: &[GridPoint]) -> Vec<GridPoint> {
    if points.len() <= MAP_SAMPLE_LIMIT {
        return points.to_vec();
    }
    let mut rng = StdRng::seed_from_u64(MAP_SAMPLE_SEED);
    let mut picked = rand::seq::index::sample(&mut rng, points.len(), MAP_SAMPLE_LIMIT).into_vec();
    picked.sort_unstable();
    picked.into_iter().map(|i| points[i]).collect()
}

/// Select the grid points inside `bbox`.
pub fn filter_points(lat: &CoordArray, lon: &CoordArray, bbox: &BoundingBox) -> Result<GridPointSet> {
    match (lat.ndim(), lon.ndim()) {
        (2, 2) => {
            if lat.shape != lon.shape {
                return Err(ExtractError::InvalidGrid(format!(
                    "2-D latitude {:?} and longitude {:?} have different shapes",
                    lat.shape, lon.shape
                )));
            }
            let points = lat
                .values
                .iter()
                .zip(&lon.values)
                .filter(|(la, lo)| bbox.contains(**la, **lo))
                .map(|(&lat, &lon)| GridPoint { lat, lon })
                .collect();
            Ok(GridPointSet::enumerated(GridLayout::Curvilinear, points))
        }
        (1, 1) if lat.dims[0] == lon.dims[0] => {
            if lat.values.len() != lon.values.len() {
                return Err(ExtractError::InvalidGrid(format!(
                    "latitude and longitude share dimension '{}' but differ in length",
                    lat.dims[0]
                )));
            }
            let mut points: Vec<GridPoint> = lat
                .values
                .iter()
                .zip(&lon.values)
                .filter(|(la, lo)| bbox.contains(**la, **lo))
                .map(|(&lat, &lon)| GridPoint { lat, lon })
                .collect();
            // same order as the extracted rows
            points.sort_by(|a, b| a.lat.total_cmp(&b.lat).then(a.lon.total_cmp(&b.lon)));
            Ok(GridPointSet::enumerated(GridLayout::Points, points))
        }
        (1, 1) => {
            let lat_in: Vec<f64> = lat.values.iter().copied().filter(|v| bbox.contains_lat(*v)).collect();
            let lon_in: Vec<f64> = lon.values.iter().copied().filter(|v| bbox.contains_lon(*v)).collect();

            if lat.values.len().saturating_mul(lon.values.len()) > LARGE_GRID_THRESHOLD {
                debug!(
                    lat = lat.values.len(),
                    lon = lon.values.len(),
                    "large rectilinear grid, sampling a corner block"
                );
                let side_lat = &lat_in[..lat_in.len().min(LARGE_GRID_SAMPLE_SIDE)];
                let side_lon = &lon_in[..lon_in.len().min(LARGE_GRID_SAMPLE_SIDE)];
                let sample: Vec<GridPoint> = side_lat
                    .iter()
                    .flat_map(|&lat| side_lon.iter().map(move |&lon| GridPoint { lat, lon }))
                    .take(PREVIEW_DISPLAY_LIMIT)
                    .collect();

                return Ok(GridPointSet {
                    layout: GridLayout::Rectilinear,
                    count: lat_in.len() * lon_in.len(),
                    full: None,
                    map_sample: sample.clone(),
                    display: sample,
                });
            }

            let points = lat_in
                .iter()
                .flat_map(|&lat| lon_in.iter().map(move |&lon| GridPoint { lat, lon }))
                .collect();
            Ok(GridPointSet::enumerated(GridLayout::Rectilinear, points))
        }
        (a, b) => Err(ExtractError::InvalidGrid(format!(
            "latitude has {a} dimensions and longitude has {b}; expected both 1-D or both 2-D"
        ))),
    }
}

/// The variables playing the latitude and longitude roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpatialAxes {
    pub lat: String,
    pub lon: String,
}

impl SpatialAxes {
    pub fn resolve(ds: &Dataset) -> Option<Self> {
        Some(Self {
            lat: axes::resolve_axis(ds, AxisRole::Latitude)?,
            lon: axes::resolve_axis(ds, AxisRole::Longitude)?,
        })
    }
}

pub fn filter_bbox(ds: &Dataset, axes: &SpatialAxes, bbox: &BoundingBox) -> Result<GridPointSet> {
    let lat = CoordArray::read(ds, &axes.lat)?;
    let lon = CoordArray::read(ds, &axes.lon)?;
    filter_points(&lat, &lon, bbox)
}

/// Index selection over the spatial dimensions of a dataset, used to slice
/// every variable for extraction.
#[derive(Debug, Clone, PartialEq)]
pub enum SpatialSelection {
    /// Separate latitude and longitude dimensions, each sorted ascending and
    /// cut to the box.
    Rectilinear {
        lat_dim: String,
        lon_dim: String,
        lat_index: Vec<usize>,
        lon_index: Vec<usize>,
    },
    /// Latitude and longitude share one dimension (scattered points).
    Points { dim: String, index: Vec<usize> },
    /// 2-D coordinates over (row, col). Rows and columns with no point in the
    /// box are dropped; `mask` marks, row-major over the kept block, which
    /// cells lie inside.
    Paired {
        row_dim: String,
        col_dim: String,
        rows: Vec<usize>,
        cols: Vec<usize>,
        mask: Vec<bool>,
    },
}

impl SpatialSelection {
    /// Spatial dimensions in output order.
    pub fn dims(&self) -> Vec<&str> {
        match self {
            SpatialSelection::Rectilinear { lat_dim, lon_dim, .. } => vec![lat_dim.as_str(), lon_dim.as_str()],
            SpatialSelection::Points { dim, .. } => vec![dim.as_str()],
            SpatialSelection::Paired { row_dim, col_dim, .. } => vec![row_dim.as_str(), col_dim.as_str()],
        }
    }

    /// Selected positions along a spatial dimension.
    pub fn index_for(&self, dim: &str) -> Option<&[usize]> {
        match self {
            SpatialSelection::Rectilinear {
                lat_dim,
                lon_dim,
                lat_index,
                lon_index,
            } => {
                if dim == lat_dim {
                    Some(lat_index.as_slice())
                } else if dim == lon_dim {
                    Some(lon_index.as_slice())
                } else {
                    None
                }
            }
            SpatialSelection::Points { dim: d, index } => (d == dim).then_some(index.as_slice()),
            SpatialSelection::Paired {
                row_dim,
                col_dim,
                rows,
                cols,
                ..
            } => {
                if dim == row_dim {
                    Some(rows.as_slice())
                } else if dim == col_dim {
                    Some(cols.as_slice())
                } else {
                    None
                }
            }
        }
    }

    /// Number of latitude (and longitude) values left after filtering. Fewer
    /// than two means there is nothing worth extracting.
    pub fn node_counts(&self) -> (usize, usize) {
        match self {
            SpatialSelection::Rectilinear {
                lat_index, lon_index, ..
            } => (lat_index.len(), lon_index.len()),
            SpatialSelection::Points { index, .. } => (index.len(), index.len()),
            SpatialSelection::Paired { rows, cols, .. } => (rows.len() * cols.len(), rows.len() * cols.len()),
        }
    }

    pub fn is_sufficient(&self) -> bool {
        let (lat, lon) = self.node_counts();
        lat >= 2 && lon >= 2
    }
}

fn ascending_order(values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap_or_else(|| nan_last(values[a], values[b])));
    order
}

fn nan_last(a: f64, b: f64) -> Ordering {
    a.is_nan().cmp(&b.is_nan())
}

/// Work out which spatial positions to extract.
pub fn select_spatial(ds: &Dataset, axes: &SpatialAxes, bbox: &BoundingBox) -> Result<SpatialSelection> {
    let lat = CoordArray::read(ds, &axes.lat)?;
    let lon = CoordArray::read(ds, &axes.lon)?;
    select_from_coords(&lat, &lon, bbox)
}

pub fn select_from_coords(lat: &CoordArray, lon: &CoordArray, bbox: &BoundingBox) -> Result<SpatialSelection> {
    match (lat.ndim(), lon.ndim()) {
        (1, 1) if lat.dims[0] == lon.dims[0] => {
            if lat.values.len() != lon.values.len() {
                return Err(ExtractError::InvalidGrid(format!(
                    "latitude and longitude share dimension '{}' but differ in length",
                    lat.dims[0]
                )));
            }
            let mut index: Vec<usize> = (0..lat.values.len()).collect();
            index.sort_by(|&a, &b| {
                lat.values[a]
                    .total_cmp(&lat.values[b])
                    .then(lon.values[a].total_cmp(&lon.values[b]))
            });
            index.retain(|&i| bbox.contains(lat.values[i], lon.values[i]));
            Ok(SpatialSelection::Points {
                dim: lat.dims[0].clone(),
                index,
            })
        }
        (1, 1) => {
            let lat_index = ascending_order(&lat.values)
                .into_iter()
                .filter(|&i| bbox.contains_lat(lat.values[i]))
                .collect::<Vec<_>>();
            let lon_index = ascending_order(&lon.values)
                .into_iter()
                .filter(|&i| bbox.contains_lon(lon.values[i]))
                .collect::<Vec<_>>();

            // No cell survives if either axis is empty.
            let (lat_index, lon_index) = if lat_index.is_empty() || lon_index.is_empty() {
                (Vec::new(), Vec::new())
            } else {
                (lat_index, lon_index)
            };

            Ok(SpatialSelection::Rectilinear {
                lat_dim: lat.dims[0].clone(),
                lon_dim: lon.dims[0].clone(),
                lat_index,
                lon_index,
            })
        }
        (2, 2) => {
            if lat.shape != lon.shape || lat.dims != lon.dims {
                return Err(ExtractError::InvalidGrid(format!(
                    "2-D latitude {:?} and longitude {:?} do not share a grid",
                    lat.dims, lon.dims
                )));
            }
            let (nrows, ncols) = (lat.shape[0], lat.shape[1]);
            let inside: Vec<bool> = lat
                .values
                .iter()
                .zip(&lon.values)
                .map(|(&la, &lo)| bbox.contains(la, lo))
                .collect();

            let rows: Vec<usize> = (0..nrows)
                .filter(|&r| inside[r * ncols..(r + 1) * ncols].iter().any(|&b| b))
                .collect();
            let cols: Vec<usize> = (0..ncols)
                .filter(|&c| (0..nrows).any(|r| inside[r * ncols + c]))
                .collect();
            let mask = rows
                .iter()
                .flat_map(|&r| cols.iter().map(move |&c| (r, c)))
                .map(|(r, c)| inside[r * ncols + c])
                .collect();

            Ok(SpatialSelection::Paired {
                row_dim: lat.dims[0].clone(),
                col_dim: lat.dims[1].clone(),
                rows,
                cols,
                mask,
            })
        }
        (a, b) => Err(ExtractError::InvalidGrid(format!(
            "latitude has {a} dimensions and longitude has {b}; expected both 1-D or both 2-D"
        ))),
    }
}

/// What a preview of one dataset found.
#[derive(Debug, Clone)]
pub struct GridPreview {
    pub source: PathBuf,
    pub axes: SpatialAxes,
    pub point_set: GridPointSet,
    /// Columns available for projection.
    pub columns: Vec<String>,
    pub variables: Vec<String>,
    pub band: Option<BandAxis>,
}

/// Open a dataset and preview the grid points inside `bbox`.
pub fn preview(path: &Path, bbox: &BoundingBox) -> Result<GridPreview> {
    bbox.validate()?;
    let ds = dataset::open_dataset(path)?;

    let axes = SpatialAxes::resolve(&ds)
        .ok_or_else(|| ExtractError::InvalidGrid("could not find lat/lon coordinates in the dataset".to_string()))?;
    let point_set = filter_bbox(&ds, &axes, bbox)?;
    info!(
        dataset = ds.name(),
        points = point_set.count,
        layout = ?point_set.layout,
        "grid preview"
    );

    Ok(GridPreview {
        source: path.to_path_buf(),
        columns: axes::detect_columns(&ds),
        variables: ds.data_variable_names(),
        band: axes::discover_band(&ds),
        axes,
        point_set,
    })
}

/// Which point list an export wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridExportSource {
    Full(usize),
    Sample(usize),
}

/// Write the previewed points as `lat,lon` CSV, preferring the full set.
pub fn export_grid_csv(preview: &GridPreview, path: &Path) -> Result<GridExportSource> {
    let (points, source) = match &preview.point_set.full {
        Some(full) => (full.as_slice(), GridExportSource::Full(full.len())),
        None => (
            preview.point_set.display.as_slice(),
            GridExportSource::Sample(preview.point_set.display.len()),
        ),
    };

    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["lat", "lon"])?;
    for p in points {
        writer.write_record([sink::float_text(p.lat), sink::float_text(p.lon)])?;
    }
    writer.flush()?;
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(lat_min: f64, lat_max: f64, lon_min: f64, lon_max: f64) -> BoundingBox {
        BoundingBox::new(lat_min, lat_max, lon_min, lon_max).unwrap()
    }

    #[test]
    fn test_rectilinear_single_point() {
        let lat = CoordArray::one_d("lat", vec![10.0, 20.0, 30.0]);
        let lon = CoordArray::one_d("lon", vec![100.0, 110.0, 120.0]);
        let set = filter_points(&lat, &lon, &bbox(15.0, 25.0, 105.0, 115.0)).unwrap();

        assert_eq!(set.layout, GridLayout::Rectilinear);
        assert_eq!(set.count, 1);
        assert_eq!(set.full, Some(vec![GridPoint { lat: 20.0, lon: 110.0 }]));
    }

    #[test]
    fn test_curvilinear_pairs_not_outer_product() {
        // A rotated 2x2 grid: the outer product of in-range values would
        // include (1, 11), which is not a grid node.
        let lat = CoordArray::two_d(["y", "x"], 2, 2, vec![0.0, 1.0, 1.0, 2.0]);
        let lon = CoordArray::two_d(["y", "x"], 2, 2, vec![10.0, 11.0, 9.0, 10.0]);
        let set = filter_points(&lat, &lon, &bbox(0.5, 1.5, 8.0, 10.5)).unwrap();

        assert_eq!(set.layout, GridLayout::Curvilinear);
        assert_eq!(set.full, Some(vec![GridPoint { lat: 1.0, lon: 9.0 }]));
    }

    #[test]
    fn test_station_layout_agrees_with_selection() {
        let lat = CoordArray::one_d("station", vec![30.0, 10.0, 20.0]);
        let lon = CoordArray::one_d("station", vec![120.0, 100.0, 110.0]);
        let bbox = bbox(0.0, 40.0, 90.0, 130.0);

        let set = filter_points(&lat, &lon, &bbox).unwrap();
        assert_eq!(set.layout, GridLayout::Points);
        assert_eq!(set.count, 3);
        assert_eq!(
            set.full,
            Some(vec![
                GridPoint { lat: 10.0, lon: 100.0 },
                GridPoint { lat: 20.0, lon: 110.0 },
                GridPoint { lat: 30.0, lon: 120.0 },
            ])
        );

        let selection = select_from_coords(&lat, &lon, &bbox).unwrap();
        assert_eq!(selection.node_counts(), (set.count, set.count));
        assert_eq!(selection.index_for("station"), Some(&[1, 2, 0][..]));
    }

    #[test]
    fn test_mismatched_curvilinear_shapes() {
        let lat = CoordArray::two_d(["y", "x"], 2, 2, vec![0.0; 4]);
        let lon = CoordArray::two_d(["y", "x"], 1, 4, vec![0.0; 4]);
        assert!(matches!(
            filter_points(&lat, &lon, &bbox(0.0, 1.0, 0.0, 1.0)),
            Err(ExtractError::InvalidGrid(_))
        ));
    }

    #[test]
    fn test_large_rectilinear_grid_is_summarised() {
        let lat = CoordArray::one_d("lat", (0..2500).map(|i| i as f64 * 0.01).collect());
        let lon = CoordArray::one_d("lon", (0..2500).map(|i| i as f64 * 0.01).collect());
        let set = filter_points(&lat, &lon, &bbox(0.0, 9.995, 0.0, 4.995)).unwrap();

        assert!(set.full.is_none());
        assert_eq!(set.count, 1000 * 500);
        assert_eq!(set.display.len(), PREVIEW_DISPLAY_LIMIT);
        // first 200 pairs of the 50x50 corner block: 4 latitudes x 50 longitudes
        assert_eq!(set.display[0], GridPoint { lat: 0.0, lon: 0.0 });
        assert_eq!(set.display[50].lat, 0.01);
    }

    #[test]
    fn test_map_sample_is_capped_and_reproducible() {
        let points: Vec<GridPoint> = (0..12_000)
            .map(|i| GridPoint {
                lat: i as f64,
                lon: 0.0,
            })
            .collect();
        let a = map_sample(&points);
        let b = map_sample(&points);
        assert_eq!(a.len(), MAP_SAMPLE_LIMIT);
        assert_eq!(a, b);
        assert!(a.windows(2).all(|w| w[0].lat < w[1].lat));

        assert_eq!(map_sample(&points[..10]).len(), 10);
    }

    #[test]
    fn test_bbox_validation() {
        assert!(BoundingBox::new(10.0, 0.0, 0.0, 1.0).is_err());
        assert!(BoundingBox::new(0.0, f64::NAN, 0.0, 1.0).is_err());
        let b = bbox(-10.0, 10.0, -20.0, 20.0);
        assert!(b.contains(10.0, -20.0));
        assert!(!b.contains(10.1, 0.0));
        assert!(!b.contains(f64::NAN, 0.0));
    }

    #[test]
    fn test_bbox_from_str() {
        let b: BoundingBox = "-10, 10,95.5,120".parse().unwrap();
        assert_eq!(b, bbox(-10.0, 10.0, 95.5, 120.0));
        assert!("1,2,3".parse::<BoundingBox>().is_err());
        assert!("a,2,3,4".parse::<BoundingBox>().is_err());
        assert!("5,0,0,1".parse::<BoundingBox>().is_err());
    }

    #[test]
    fn test_select_rectilinear_sorts_axes() {
        let lat = CoordArray::one_d("lat", vec![30.0, 20.0, 10.0, 0.0]);
        let lon = CoordArray::one_d("lon", vec![100.0, 110.0, 120.0]);
        let sel = select_from_coords(&lat, &lon, &bbox(5.0, 25.0, 100.0, 115.0)).unwrap();
        assert_eq!(
            sel,
            SpatialSelection::Rectilinear {
                lat_dim: "lat".to_string(),
                lon_dim: "lon".to_string(),
                lat_index: vec![2, 1],
                lon_index: vec![0, 1],
            }
        );
        assert!(sel.is_sufficient());
    }

    #[test]
    fn test_select_empty_axis_drops_everything() {
        let lat = CoordArray::one_d("lat", vec![10.0, 20.0]);
        let lon = CoordArray::one_d("lon", vec![100.0, 110.0]);
        let sel = select_from_coords(&lat, &lon, &bbox(10.0, 20.0, 0.0, 1.0)).unwrap();
        assert_eq!(sel.node_counts(), (0, 0));
        assert!(!sel.is_sufficient());
    }

    #[test]
    fn test_select_paired_drops_empty_rows_and_cols() {
        // 3x3 grid, only cells (1,1) and (1,2) inside
        let lat = CoordArray::two_d(["y", "x"], 3, 3, vec![0.0, 0.0, 0.0, 5.0, 5.0, 5.0, 9.0, 9.0, 9.0]);
        let lon = CoordArray::two_d(["y", "x"], 3, 3, vec![0.0, 5.0, 6.0, 0.0, 5.0, 6.0, 0.0, 5.0, 6.0]);
        let sel = select_from_coords(&lat, &lon, &bbox(4.0, 6.0, 4.0, 7.0)).unwrap();
        assert_eq!(
            sel,
            SpatialSelection::Paired {
                row_dim: "y".to_string(),
                col_dim: "x".to_string(),
                rows: vec![1],
                cols: vec![1, 2],
                mask: vec![true, true],
            }
        );
        assert!(sel.is_sufficient());
    }

    #[test]
    fn test_export_grid_csv() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("grid.csv");
        let lat = CoordArray::one_d("lat", vec![1.0, 2.0]);
        let lon = CoordArray::one_d("lon", vec![3.5]);
        let preview = GridPreview {
            source: PathBuf::from("a.zarr"),
            axes: SpatialAxes {
                lat: "lat".to_string(),
                lon: "lon".to_string(),
            },
            point_set: filter_points(&lat, &lon, &bbox(0.0, 5.0, 0.0, 5.0)).unwrap(),
            columns: vec![],
            variables: vec![],
            band: None,
        };
        assert_eq!(export_grid_csv(&preview, &out).unwrap(), GridExportSource::Full(2));
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "lat,lon\n1.0,3.5\n2.0,3.5\n");
    }
}
