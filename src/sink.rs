//! Output format selection and table writers.

use crate::error::Result;
use crate::table::{Column, Table};
use chrono::{NaiveDate, NaiveDateTime};
use rust_xlsxwriter::{Format, Workbook};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Tables with more rows than this go to delimited text instead of a
/// spreadsheet.
pub const SPREADSHEET_ROW_LIMIT: usize = 1_000_000;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const SPREADSHEET_DATE_FORMAT: &str = "yyyy-mm-dd hh:mm:ss";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SinkFormat {
    Spreadsheet,
    DelimitedText,
}

impl SinkFormat {
    pub fn for_rows(rows: usize) -> Self {
        if rows > SPREADSHEET_ROW_LIMIT {
            SinkFormat::DelimitedText
        } else {
            SinkFormat::Spreadsheet
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            SinkFormat::Spreadsheet => "xlsx",
            SinkFormat::DelimitedText => "csv",
        }
    }
}

/// Output folder for a source: `save_root` joined with the name of the
/// folder the source sits in.
pub fn output_dir(save_root: &Path, source: &Path) -> PathBuf {
    match source.parent().and_then(Path::file_name) {
        Some(folder) => save_root.join(folder),
        None => save_root.to_path_buf(),
    }
}

pub fn source_stem(source: &Path) -> String {
    source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

pub fn output_path(save_root: &Path, source: &Path, format: SinkFormat) -> PathBuf {
    output_dir(save_root, source).join(format!("{}.{}", source_stem(source), format.extension()))
}

/// An output already written for `source`, in either format.
pub fn existing_output(save_root: &Path, source: &Path) -> Option<PathBuf> {
    [SinkFormat::Spreadsheet, SinkFormat::DelimitedText]
        .into_iter()
        .map(|format| output_path(save_root, source, format))
        .find(|path| path.exists())
}

pub fn write_table(table: &Table, path: &Path, format: SinkFormat) -> Result<()> {
    match format {
        SinkFormat::Spreadsheet => write_spreadsheet(table, path),
        SinkFormat::DelimitedText => write_delimited(table, path),
    }
}

/// Excel serial day number (1900 date system). Only dates after the
/// phantom 1900-02-29 map cleanly.
fn excel_serial(ts: &NaiveDateTime) -> Option<f64> {
    let first_clean = NaiveDate::from_ymd_opt(1900, 3, 1)?.and_hms_opt(0, 0, 0)?;
    if *ts < first_clean {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let elapsed = *ts - epoch;
    Some(elapsed.num_seconds() as f64 / 86_400.0)
}

fn write_spreadsheet(table: &Table, path: &Path) -> Result<()> {
    let mut workbook = Workbook::new();
    let date_format = Format::new().set_num_format(SPREADSHEET_DATE_FORMAT);
    let worksheet = workbook.add_worksheet();

    for (col, (name, column)) in table.columns.iter().enumerate() {
        let col = col as u16;
        worksheet.write_string(0, col, name)?;

        match column {
            Column::Float(values) => {
                for (row, v) in values.iter().enumerate() {
                    if v.is_finite() {
                        worksheet.write_number(row as u32 + 1, col, *v)?;
                    }
                }
            }
            Column::Int(values) => {
                for (row, v) in values.iter().enumerate() {
                    worksheet.write_number(row as u32 + 1, col, *v as f64)?;
                }
            }
            Column::Timestamp(values) => {
                for (row, v) in values.iter().enumerate() {
                    let Some(ts) = v else { continue };
                    match excel_serial(ts) {
                        Some(serial) => {
                            worksheet.write_number_with_format(row as u32 + 1, col, serial, &date_format)?;
                        }
                        None => {
                            worksheet.write_string(row as u32 + 1, col, ts.format(TIMESTAMP_FORMAT).to_string())?;
                        }
                    }
                }
            }
            Column::CalendarTime(values) => {
                for (row, v) in values.iter().enumerate() {
                    if let Some(t) = v {
                        worksheet.write_string(row as u32 + 1, col, t.to_string())?;
                    }
                }
            }
            Column::Text(values) => {
                for (row, v) in values.iter().enumerate() {
                    if !v.is_empty() {
                        worksheet.write_string(row as u32 + 1, col, v)?;
                    }
                }
            }
        }
    }

    workbook.save(path)?;
    Ok(())
}

/// Text for a float cell: shortest round-trip digits, always with a decimal
/// point so readers keep the column floating point. NaN is empty.
pub fn float_text(v: f64) -> String {
    if v.is_nan() { String::new() } else { format!("{v:?}") }
}

fn cell_text(column: &Column, row: usize) -> String {
    match column {
        Column::Float(v) => float_text(v[row]),
        Column::Int(v) => v[row].to_string(),
        Column::Timestamp(v) => v[row]
            .map(|ts| ts.format(TIMESTAMP_FORMAT).to_string())
            .unwrap_or_default(),
        Column::CalendarTime(v) => v[row].map(|t| t.to_string()).unwrap_or_default(),
        Column::Text(v) => v[row].clone(),
    }
}

fn write_delimited(table: &Table, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(table.column_names())?;

    let mut record = Vec::with_capacity(table.columns.len());
    for row in 0..table.row_count() {
        record.clear();
        record.extend(table.columns.iter().map(|(_, c)| cell_text(c, row)));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_table() -> Table {
        let mut table = Table::new();
        table.push("lat", Column::Float(vec![10.0, 10.5]));
        table.push(
            "time",
            Column::Timestamp(vec![
                NaiveDate::from_ymd_opt(2000, 1, 1).and_then(|d| d.and_hms_opt(0, 0, 0)),
                None,
            ]),
        );
        table.push("band", Column::Int(vec![1, 2]));
        table.push("tas", Column::Float(vec![f64::NAN, 280.25]));
        table
    }

    #[test]
    fn test_format_switches_above_row_limit() {
        assert_eq!(SinkFormat::for_rows(1_000_000), SinkFormat::Spreadsheet);
        assert_eq!(SinkFormat::for_rows(1_000_001), SinkFormat::DelimitedText);
        assert_eq!(SinkFormat::for_rows(0), SinkFormat::Spreadsheet);
    }

    #[test]
    fn test_output_paths_mirror_source_folder() {
        let source = Path::new("/data/Root/ModelA/tas_day.zarr");
        let root = Path::new("/out");
        assert_eq!(
            output_path(root, source, SinkFormat::Spreadsheet),
            PathBuf::from("/out/ModelA/tas_day.xlsx")
        );
        assert_eq!(
            output_path(root, source, SinkFormat::DelimitedText),
            PathBuf::from("/out/ModelA/tas_day.csv")
        );
    }

    #[test]
    fn test_existing_output_checks_both_extensions() {
        let dir = TempDir::new().unwrap();
        let source = Path::new("/data/Root/ModelA/tas.zarr");
        assert_eq!(existing_output(dir.path(), source), None);

        std::fs::create_dir_all(dir.path().join("ModelA")).unwrap();
        std::fs::write(dir.path().join("ModelA/tas.csv"), "").unwrap();
        assert_eq!(
            existing_output(dir.path(), source),
            Some(dir.path().join("ModelA/tas.csv"))
        );
    }

    #[test]
    fn test_write_delimited() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv");
        write_table(&sample_table(), &path, SinkFormat::DelimitedText).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "lat,time,band,tas\n10.0,2000-01-01 00:00:00,1,\n10.5,,2,280.25\n"
        );
    }

    #[test]
    fn test_float_text_keeps_decimal_point() {
        assert_eq!(float_text(10.0), "10.0");
        assert_eq!(float_text(-0.5), "-0.5");
        assert_eq!(float_text(285.49), "285.49");
        assert_eq!(float_text(f64::NAN), "");
    }

    #[test]
    fn test_write_spreadsheet() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.xlsx");
        write_table(&sample_table(), &path, SinkFormat::Spreadsheet).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        // xlsx files are zip archives
        assert_eq!(&bytes[..2], b"PK");
    }

    #[test]
    fn test_excel_serial() {
        let ts = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap().and_hms_opt(12, 0, 0).unwrap();
        assert_eq!(excel_serial(&ts), Some(36526.5));
        let early = NaiveDate::from_ymd_opt(1850, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        assert_eq!(excel_serial(&early), None);
    }
}
