#![allow(dead_code)]

use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};

/// Writes uncompressed Zarr v2 stores, one chunk per array.
pub struct StoreBuilder {
    root: PathBuf,
}

impl StoreBuilder {
    pub fn create(root: &Path) -> Self {
        fs::create_dir_all(root).unwrap();
        fs::write(root.join(".zgroup"), r#"{"zarr_format": 2}"#).unwrap();
        fs::write(root.join(".zattrs"), r#"{"Conventions": "CF-1.8"}"#).unwrap();
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn array(self, name: &str, dims: &[(&str, usize)], values: &[f64], attrs: Value) -> Self {
        let shape: Vec<usize> = dims.iter().map(|(_, n)| *n).collect();
        assert_eq!(shape.iter().product::<usize>(), values.len(), "bad fixture for {name}");

        let dir = self.root.join(name);
        fs::create_dir_all(&dir).unwrap();
        let zarray = json!({
            "zarr_format": 2,
            "shape": shape,
            "chunks": shape,
            "dtype": "<f8",
            "compressor": null,
            "fill_value": "NaN",
            "order": "C",
            "filters": null
        });
        fs::write(dir.join(".zarray"), zarray.to_string()).unwrap();

        let mut zattrs = attrs;
        zattrs["_ARRAY_DIMENSIONS"] = json!(dims.iter().map(|(d, _)| *d).collect::<Vec<_>>());
        fs::write(dir.join(".zattrs"), zattrs.to_string()).unwrap();

        let key = if dims.is_empty() {
            "0".to_string()
        } else {
            vec!["0"; dims.len()].join(".")
        };
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        fs::write(dir.join(key), bytes).unwrap();
        self
    }

    pub fn coord(self, name: &str, values: &[f64], attrs: Value) -> Self {
        self.array(name, &[(name, values.len())], values, attrs)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }
}

/// A daily `tas(time, lat, lon)` store on a 3 x 3 grid, time offsets
/// `days since 2001-01-01` in `calendar`.
pub fn climate_store(path: &Path, calendar: &str, offsets: &[f64]) -> PathBuf {
    let lat = [10.0, 20.0, 30.0];
    let lon = [100.0, 110.0, 120.0];
    let tas: Vec<f64> = (0..offsets.len() * 9).map(|i| 270.0 + i as f64).collect();

    StoreBuilder::create(path)
        .coord(
            "time",
            offsets,
            json!({"units": "days since 2001-01-01", "calendar": calendar, "standard_name": "time"}),
        )
        .coord("lat", &lat, json!({"units": "degrees_north"}))
        .coord("lon", &lon, json!({"units": "degrees_east"}))
        .array(
            "tas",
            &[("time", offsets.len()), ("lat", 3), ("lon", 3)],
            &tas,
            json!({"units": "K", "long_name": "Near-Surface Air Temperature"}),
        )
        .path()
        .to_path_buf()
}

/// A `<root>/<folder>/<name>.zarr` layout with one climate store per entry.
pub fn data_root(root: &Path, entries: &[(&str, &str, &str, &[f64])]) -> Vec<PathBuf> {
    entries
        .iter()
        .map(|(folder, name, calendar, offsets)| climate_store(&root.join(folder).join(name), calendar, offsets))
        .collect()
}
