use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use ppscan_core::pipeline::ManualCalibration;
use ppscan_core::{
    ColorMode, Connection, DriverConfig, PortSpec, ScanParameters, ScanRequest, ScannerModel,
    Session, TransportMode,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Parallel-port CCD scanner driver", long_about = None)]
struct Args {
    /// Driver configuration (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Port device path or hex I/O address (e.g. /dev/parport0, 0x378)
    #[arg(long, global = true)]
    port: Option<String>,

    /// Skip model detection and assume this model
    #[arg(long, global = true)]
    model: Option<ScannerModel>,

    /// Force a transfer mode (ps2, byte, epp8, epp32, ecp)
    #[arg(long, global = true)]
    mode: Option<TransportMode>,

    /// Park the head during initialization
    #[arg(long, global = true)]
    recover: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect the scanner and report chip, transfer mode and model
    Probe,
    /// Scan a window to an image file (PNG or PNM by extension)
    Scan(ScanArgs),
    /// Switch the lamp
    Lamp {
        #[arg(value_enum)]
        state: LampState,
    },
    /// Return the head to home
    Park,
    /// Report whether the scanner is busy
    Status,
}

#[derive(clap::Args, Debug)]
struct ScanArgs {
    /// Left edge in sensor pixels (CCD resolution)
    #[arg(long, default_value_t = 0)]
    x: u32,
    /// Top edge in motor lines at CCD resolution
    #[arg(long, default_value_t = 0)]
    y: u32,
    /// Width at CCD resolution (defaults to the full bed)
    #[arg(long)]
    width: Option<u32>,
    /// Height at CCD resolution (defaults to the full bed)
    #[arg(long)]
    height: Option<u32>,
    #[arg(long, default_value_t = 150)]
    dpi: u16,
    /// lineart, gray or color
    #[arg(long, default_value = "gray")]
    color: ColorMode,
    /// Manual gain codes, one or three comma-separated values
    #[arg(long, value_delimiter = ',')]
    gain: Vec<u8>,
    /// Manual offset codes, one or three comma-separated values
    #[arg(long, value_delimiter = ',')]
    offset: Vec<u8>,
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LampState {
    On,
    Off,
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    info!(port = %config.port, "Starting ppscan...");

    match args.command {
        Command::Probe => {
            let mut connection = Connection::attach_with(&config)?;
            let model = connection.probe_model()?;
            let report = connection.report();
            println!("port:   {}", connection.port_name());
            println!("chip:   {}", report.family);
            println!("mode:   {}", report.mode);
            let passed: Vec<String> = report.modes_passed.iter().map(|m| m.to_string()).collect();
            println!("passed: {}", passed.join(", "));
            println!("model:  {}", model);
        }
        Command::Scan(scan) => run_scan(&config, scan)?,
        Command::Lamp { state } => {
            let mut session = Session::open(Connection::attach_with(&config)?)?;
            session.set_lamp(matches!(state, LampState::On))?;
            // Dropped without close so the lamp stays as requested.
            println!("lamp {}", if session.lamp_on() { "on" } else { "off" });
        }
        Command::Park => {
            let mut session = Session::open(Connection::attach_with(&config)?)?;
            session.park()?;
            session.park_wait()?;
            session.close()?;
        }
        Command::Status => {
            let mut session = Session::open(Connection::attach_with(&config)?)?;
            println!("model:  {}", session.model());
            println!("status: {}", session.status()?);
            println!("lamp:   {}", if session.lamp_on() { "on" } else { "off" });
            println!("head:   {}", session.head_position());
        }
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<DriverConfig> {
    let mut config = match &args.config {
        Some(path) => DriverConfig::load_from_file(path)?,
        None => DriverConfig::default(),
    };
    if let Some(port) = &args.port {
        config.port = PortSpec::parse(port);
    }
    if args.model.is_some() {
        config.model = args.model;
    }
    if args.mode.is_some() {
        config.force_mode = args.mode;
    }
    config.recover |= args.recover;
    Ok(config)
}

fn expand_codes(codes: &[u8], what: &str) -> Result<[u8; 3]> {
    match *codes {
        [v] => Ok([v; 3]),
        [r, g, b] => Ok([r, g, b]),
        _ => bail!("--{} takes one or three values, got {}", what, codes.len()),
    }
}

fn run_scan(config: &DriverConfig, scan: ScanArgs) -> Result<()> {
    let mut session = Session::open(Connection::attach_with(config)?)?;
    let model = session.model();

    let mut request = ScanRequest::new(
        scan.x,
        scan.y,
        scan.width.unwrap_or(model.width_units().saturating_sub(scan.x)),
        scan.height.unwrap_or(model.height_units().saturating_sub(scan.y)),
        scan.dpi,
        scan.color,
    );
    if !scan.gain.is_empty() || !scan.offset.is_empty() {
        if scan.gain.is_empty() || scan.offset.is_empty() {
            bail!("manual calibration needs both --gain and --offset");
        }
        request.manual = Some(ManualCalibration {
            gains: expand_codes(&scan.gain, "gain")?,
            offsets: expand_codes(&scan.offset, "offset")?,
        });
    }

    let params = session.start_scan(&request)?;
    info!(
        width = params.target_width,
        height = params.target_height,
        dpi = params.dpi,
        mode = %params.mode,
        "Scanning"
    );

    let expected = params.bytes_per_line * params.target_height;
    let mut data = Vec::with_capacity(expected);
    while data.len() < expected {
        let block = session.read_block(config.buffer_size, params.target_width, params.dpi, false)?;
        if block.is_empty() {
            break;
        }
        data.extend(block);
    }
    session.close()?;

    if data.len() < expected {
        bail!("scan ended early: {} of {} bytes", data.len(), expected);
    }
    data.truncate(expected);
    write_image(&scan.output, &params, data)?;
    info!(path = %scan.output.display(), "Wrote image");
    Ok(())
}

/// Lineart rows are packed MSB first with 1 = black.
fn unpack_lineart(data: &[u8], params: &ScanParameters) -> Vec<u8> {
    let mut out = Vec::with_capacity(params.target_width * params.target_height);
    for row in data.chunks(params.bytes_per_line) {
        for x in 0..params.target_width {
            let bit = row[x / 8] & (0x80 >> (x % 8));
            out.push(if bit != 0 { 0 } else { 255 });
        }
    }
    out
}

fn write_image(path: &Path, params: &ScanParameters, data: Vec<u8>) -> Result<()> {
    let width = params.target_width as u32;
    let height = params.target_height as u32;
    let (pixels, color) = match params.mode {
        ColorMode::Color => (data, image::ColorType::Rgb8),
        ColorMode::Gray => (data, image::ColorType::L8),
        ColorMode::Lineart => (unpack_lineart(&data, params), image::ColorType::L8),
    };
    image::save_buffer(path, &pixels, width, height, color)
        .with_context(|| format!("failed to write {}", path.display()))
}
