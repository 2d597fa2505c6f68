use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use grid_extract::axes::{self, ResolvedAxes};
use grid_extract::batch::{BatchRunner, BatchSummary, ExtractParams};
use grid_extract::calendar::CivilDate;
use grid_extract::dataset::{self, Dataset};
use grid_extract::discover;
use grid_extract::events::ExtractEvent;
use grid_extract::extract::{FileOutcome, TimeWindow};
use grid_extract::spatial::{self, BoundingBox, GridExportSource, GridPreview};
use grid_extract::table::ChunkSizes;
use grid_extract::time_range::{self, OverlapStatus};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "grid-extract")]
#[command(version)]
#[command(about = "Extract bounding-box and time-window subsets of gridded Zarr datasets into tables")]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Show debug diagnostics on stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// List dataset folders under a data root (<root>/<folder>/<name>.zarr)
    List {
        root: PathBuf,
    },
    /// Show a dataset's dimensions, variables and detected axes
    Inspect {
        path: PathBuf,
    },
    /// Report each dataset's time range and the range common to all of them
    TimeRange {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
    /// Preview the grid nodes inside a bounding box
    Preview {
        path: PathBuf,

        /// Bounding box as LAT_MIN,LAT_MAX,LON_MIN,LON_MAX
        #[arg(long, allow_hyphen_values = true)]
        bbox: BoundingBox,

        /// Write the nodes inside the box to a lat,lon CSV file
        #[arg(long, value_name = "FILE")]
        export_csv: Option<PathBuf>,
    },
    /// Extract bounding-box subsets to spreadsheet or CSV files
    Extract(ExtractArgs),
}

#[derive(Args)]
struct ExtractArgs {
    /// Datasets to extract
    #[arg(required_unless_present = "params")]
    inputs: Vec<PathBuf>,

    /// Read all extraction parameters from a JSON file instead of flags
    #[arg(long, value_name = "FILE", conflicts_with_all = ["inputs", "bbox"])]
    params: Option<PathBuf>,

    /// Bounding box as LAT_MIN,LAT_MAX,LON_MIN,LON_MAX
    #[arg(long, allow_hyphen_values = true, required_unless_present = "params")]
    bbox: Option<BoundingBox>,

    /// First day to keep (YYYY-MM-DD, inclusive)
    #[arg(long, requires = "end")]
    start: Option<CivilDate>,

    /// Last day to keep (YYYY-MM-DD, inclusive)
    #[arg(long, requires = "start")]
    end: Option<CivilDate>,

    /// Keep only this band/level value
    #[arg(long)]
    band: Option<String>,

    /// Columns to keep, comma separated
    #[arg(long, value_delimiter = ',')]
    columns: Vec<String>,

    /// Latitude positions read per block
    #[arg(long, env = "GRID_EXTRACT_CHUNK_LAT", default_value_t = 100)]
    chunk_lat: usize,

    /// Longitude positions read per block
    #[arg(long, env = "GRID_EXTRACT_CHUNK_LON", default_value_t = 100)]
    chunk_lon: usize,

    /// Re-extract datasets whose output already exists
    #[arg(long)]
    no_skip_existing: bool,

    /// Output root (default: <data root>/Extracted)
    #[arg(long, env = "GRID_EXTRACT_SAVE_ROOT")]
    save_root: Option<PathBuf>,
}

impl ExtractArgs {
    fn into_params(self) -> anyhow::Result<ExtractParams> {
        if let Some(path) = &self.params {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read parameters from '{}'", path.display()))?;
            let params: ExtractParams = serde_json::from_str(&text)
                .with_context(|| format!("Invalid parameters file '{}'", path.display()))?;
            return Ok(params);
        }

        let bbox = self
            .bbox
            .ok_or_else(|| anyhow::anyhow!("--bbox is required"))?;
        let time_window = match (self.start, self.end) {
            (Some(start), Some(end)) => Some(TimeWindow::new(start, end)?),
            _ => None,
        };

        Ok(ExtractParams {
            inputs: self.inputs,
            save_root: self.save_root,
            bbox,
            time_window,
            band_filter: self.band,
            columns: self.columns,
            chunks: ChunkSizes {
                lat: self.chunk_lat,
                lon: self.chunk_lon,
            },
            skip_existing: !self.no_skip_existing,
        })
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{} {}", "Error:".red().bold(), e);

        for cause in e.chain().skip(1) {
            eprintln!("  Caused by: {}", cause);
        }

        process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    // event log lines are printed to stdout already
    let default = if verbose {
        "grid_extract=debug,grid_extract::events=off"
    } else {
        "grid_extract=warn,grid_extract::events=off"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.no_color {
        colored::control::set_override(false);
    }
    init_tracing(cli.verbose);

    match cli.command {
        Command::List { root } => list(&root),
        Command::Inspect { path } => inspect(&path),
        Command::TimeRange { inputs } => print_time_ranges(&inputs),
        Command::Preview {
            path,
            bbox,
            export_csv,
        } => preview(&path, &bbox, export_csv.as_deref()),
        Command::Extract(args) => extract(args.into_params()?).await,
    }
}

fn list(root: &std::path::Path) -> anyhow::Result<()> {
    let folders = discover::scan_data_root(root)
        .with_context(|| format!("Failed to scan data root '{}'", root.display()))?;

    if folders.is_empty() {
        println!("No datasets found under {}", root.display());
        return Ok(());
    }

    for folder in &folders {
        println!("{}/", folder.name.green().bold());
        for dataset in &folder.datasets {
            let name = dataset.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            println!("    {}", name.cyan());
        }
    }
    Ok(())
}

fn inspect(path: &std::path::Path) -> anyhow::Result<()> {
    let ds = dataset::open_dataset(path)?;
    let metadata = ds.metadata();

    println!("{} {} {{", "zarr".blue(), ds.name().bold());

    println!("{}", "dimensions:".green());
    for name in &metadata.dimension_order {
        if let Some(size) = ds.dimension_size(name) {
            println!("    {} = {} ;", name.cyan(), size.to_string().yellow());
        }
    }

    println!("{}", "variables:".green());
    for variable in metadata.variables.values() {
        let dims = variable
            .dimension_names()
            .iter()
            .map(|d| d.cyan().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "    {} {}({}) ;",
            map_dtype(&variable.dtype).magenta(),
            variable.name.cyan(),
            dims
        );
        let mut attrs: Vec<_> = variable
            .attributes
            .iter()
            .filter(|(key, _)| key.as_str() != "_ARRAY_DIMENSIONS")
            .collect();
        attrs.sort_by_key(|(key, _)| key.as_str());
        for (key, value) in attrs {
            let shown = match value.as_str() {
                Some(s) => format!("\"{s}\"").red().to_string(),
                None => serde_json::to_string(value).unwrap_or_default().yellow().to_string(),
            };
            println!("        {}:{} = {} ;", variable.name.cyan(), key.yellow(), shown);
        }
    }

    print_axes(&ds, &axes::resolve_axes(&ds));
    println!("}}");
    Ok(())
}

fn print_axes(ds: &Dataset, resolved: &ResolvedAxes) {
    let show = |role: &str, name: &Option<String>| match name {
        Some(name) => println!("    // {role}: {}", name.cyan()),
        None => println!("    // {role}: <none detected>"),
    };

    println!("{}", "// detected axes:".dimmed());
    show("latitude", &resolved.lat);
    show("longitude", &resolved.lon);
    show("time", &resolved.time);
    show("band", &resolved.band);

    if let Some(band) = axes::discover_band(ds) {
        println!("    // band values: {}", band.values.join(", ").yellow());
    }
    if let Some((start, end)) = time_range::time_range(ds) {
        println!("    // time range: {} to {}", start.to_string().yellow(), end.to_string().yellow());
    }
    println!("    // columns: {}", axes::detect_columns(ds).join(", ").cyan());
}

fn map_dtype(dtype: &str) -> &str {
    match dtype.trim_start_matches(['<', '>', '|', '=']) {
        "i1" => "byte",
        "i2" => "short",
        "i4" => "int",
        "i8" => "int64",
        "u1" => "ubyte",
        "u2" => "ushort",
        "u4" => "uint",
        "u8" => "uint64",
        "f4" => "float",
        "f8" => "double",
        "b1" => "bool",
        s if s.starts_with('S') || s.starts_with('U') => "char",
        _ => dtype,
    }
}

fn print_time_ranges(inputs: &[PathBuf]) -> anyhow::Result<()> {
    for input in inputs {
        match time_range::per_file_range(input) {
            Some((start, end)) => println!("{}: {} to {}", input.display(), start, end),
            None => println!("{}: {}", input.display(), "no time axis".dimmed()),
        }
    }

    let overlap = time_range::overlap(inputs);
    match (overlap.status, overlap.window()) {
        (OverlapStatus::Common, Some((start, end))) => {
            println!("{} {} to {}", "Common range:".green().bold(), start, end);
        }
        (OverlapStatus::Disjoint, _) => {
            println!("{}", "The datasets share no common date range.".yellow());
        }
        _ => println!("{}", "No dataset has a readable time axis.".yellow()),
    }
    Ok(())
}

fn preview(path: &std::path::Path, bbox: &BoundingBox, export_csv: Option<&std::path::Path>) -> anyhow::Result<()> {
    let preview = spatial::preview(path, bbox)
        .with_context(|| format!("Failed to preview '{}'", path.display()))?;
    print_preview(&preview);

    if let Some(out) = export_csv {
        let written = spatial::export_grid_csv(&preview, out)
            .with_context(|| format!("Failed to write '{}'", out.display()))?;
        match written {
            GridExportSource::Full(n) => println!("Wrote {n} points to {}", out.display()),
            GridExportSource::Sample(n) => {
                println!("Wrote {n} sampled points to {} (grid too large to enumerate)", out.display())
            }
        }
    }
    Ok(())
}

fn print_preview(preview: &GridPreview) {
    let set = &preview.point_set;
    println!(
        "{} {} ({:?}, lat='{}', lon='{}')",
        "Grid points in box:".green().bold(),
        set.count.to_string().yellow(),
        set.layout,
        preview.axes.lat,
        preview.axes.lon
    );
    if set.full.is_none() {
        println!("{}", "Grid too large to enumerate; showing a corner sample.".dimmed());
    }

    println!("{:>12} {:>12}", "lat".bold(), "lon".bold());
    for p in &set.display {
        println!("{:>12} {:>12}", p.lat, p.lon);
    }
    if set.count > set.display.len() {
        println!("{}", format!("... {} more", set.count - set.display.len()).dimmed());
    }

    println!("Variables: {}", preview.variables.join(", ").cyan());
    println!("Columns: {}", preview.columns.join(", ").cyan());
    if let Some(band) = &preview.band {
        println!("Band '{}': {}", band.name, band.values.join(", "));
    }
}

async fn extract(params: ExtractParams) -> anyhow::Result<()> {
    params.validate()?;

    let mut handle = BatchRunner::new().submit(params)?;
    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("{}", "Cancelling after the current file...".yellow());
                handle.cancel();
            }
        }
    }

    let summary = handle.join().await?;
    print_summary(&summary);
    Ok(())
}

fn print_event(event: &ExtractEvent) {
    match event {
        ExtractEvent::Log(message) if message.starts_with("Error processing") => {
            println!("{}", message.red());
        }
        ExtractEvent::Log(message) => println!("{message}"),
        ExtractEvent::Progress(p) => println!("{}", format!("[{p:>3}%]").dimmed()),
        ExtractEvent::Busy(_) | ExtractEvent::Finished(_) => {}
    }
}

fn print_summary(summary: &BatchSummary) {
    println!(
        "{} {} written, {} skipped, {} failed",
        "Summary:".bold(),
        summary.written.to_string().green(),
        summary.skipped.to_string().yellow(),
        summary.failed.to_string().red()
    );
    for record in &summary.records {
        if let FileOutcome::Written { path, rows, .. } = &record.outcome {
            println!("    {} ({rows} rows)", path.display());
        }
    }
}
