//! fdmlink command line tool
//!
//! Lists printer ports, streams G-code files, sends raw commands and
//! inspects firmware releases and images.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fdmlink::{
    init_logging, list_ports, needs_update, Config, FirmwareImage, FirmwareVersion,
    GithubReleaseSource, MachineFamily, PrinterEvent, PrinterState, ProgressInfo, ReleaseSource,
    UsbPrinter,
};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// How often print progress is reported
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// How long `send` keeps the port open for answers
const SEND_SETTLE: Duration = Duration::from_millis(1500);

#[derive(Parser, Debug)]
#[command(
    name = "fdmlink",
    version,
    about = "USB host for fused-deposition 3D printers"
)]
struct Cli {
    /// Configuration file (.toml or .json); defaults to the platform config directory
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List serial ports a printer may be attached to
    Ports,

    /// Stream a G-code file and wait until the print finishes
    Print {
        /// G-code file
        #[arg(value_name = "FILE")]
        gcode: PathBuf,
        /// Serial port, overriding the configured one
        #[arg(long, short)]
        port: Option<String>,
        /// Estimated print time in seconds, used for the remaining-time figure
        #[arg(long, value_name = "SECS")]
        estimate: Option<u64>,
    },

    /// Send raw commands to the printer
    Send {
        /// Commands, one per argument
        #[arg(required = true, value_name = "LINE")]
        lines: Vec<String>,
        /// Serial port, overriding the configured one
        #[arg(long, short)]
        port: Option<String>,
    },

    /// Firmware releases and images
    Firmware {
        #[command(subcommand)]
        cmd: FirmwareCmd,
    },

    /// Configuration file management
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
}

#[derive(Subcommand, Debug)]
enum FirmwareCmd {
    /// Look up the latest release for a printer family
    Check {
        /// Family tag (e.g. bcn3dsigmax); defaults to the configured family
        #[arg(long)]
        family: Option<String>,
        /// Installed version to compare against
        #[arg(long)]
        current: Option<String>,
    },
    /// Parse an Intel HEX image and report what it contains
    Verify {
        /// Image file
        #[arg(value_name = "HEX")]
        image: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCmd {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_path()?,
    };

    match cli.cmd {
        Cmd::Ports => cmd_ports(),
        Cmd::Print {
            gcode,
            port,
            estimate,
        } => {
            let config = Config::load_or_default(&config_path)?;
            cmd_print(&config, &gcode, port.as_deref(), estimate)
        }
        Cmd::Send { lines, port } => {
            let config = Config::load_or_default(&config_path)?;
            cmd_send(&config, &lines, port.as_deref())
        }
        Cmd::Firmware { cmd } => match cmd {
            FirmwareCmd::Check { family, current } => {
                let config = Config::load_or_default(&config_path)?;
                cmd_firmware_check(&config, family.as_deref(), current.as_deref())
            }
            FirmwareCmd::Verify { image } => cmd_firmware_verify(&image),
        },
        Cmd::Config { cmd } => match cmd {
            ConfigCmd::Init { force } => cmd_config_init(&config_path, force),
            ConfigCmd::Show => {
                let config = Config::load_or_default(&config_path)?;
                print!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
        },
    }
}

fn cmd_ports() -> Result<()> {
    let ports = list_ports()?;
    if ports.is_empty() {
        println!("No printer ports found");
    }
    for port in ports {
        match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => println!(
                "{}\t{}\t{:04x}:{:04x}",
                port.port_name, port.description, vid, pid
            ),
            _ => println!("{}\t{}", port.port_name, port.description),
        }
    }
    Ok(())
}

fn open_printer(config: &Config, port: Option<&str>) -> Result<UsbPrinter> {
    let printer = config.printer_builder(port).build()?;
    if printer.connection().params().port.is_empty() {
        bail!("no serial port configured; pass --port");
    }
    printer
        .connect_blocking()
        .with_context(|| format!("connecting to {}", printer.connection().params().port))?;
    tracing::info!("Connected to {}", printer.connection().params().port);
    Ok(printer)
}

fn cmd_print(config: &Config, gcode: &Path, port: Option<&str>, estimate: Option<u64>) -> Result<()> {
    let program = std::fs::read_to_string(gcode)
        .with_context(|| format!("reading {}", gcode.display()))?;
    let printer = open_printer(config, port)?;
    let mut events = printer.events().receiver();
    printer.start_print([program], estimate.map(Duration::from_secs))?;

    let mut last_report = Instant::now();
    loop {
        thread::sleep(Duration::from_millis(200));
        while let Ok(event) = events.try_recv() {
            match event {
                PrinterEvent::ProgressChanged(progress)
                    if last_report.elapsed() >= PROGRESS_INTERVAL =>
                {
                    report_progress(&progress);
                    last_report = Instant::now();
                }
                PrinterEvent::StateChanged { to, .. } => tracing::debug!("Printer {}", to),
                _ => {}
            }
        }
        match printer.state() {
            PrinterState::Printing | PrinterState::Paused => {}
            PrinterState::Connected => {
                println!("Print finished");
                break;
            }
            PrinterState::Error => {
                let message = printer.error_message().unwrap_or_default();
                printer.close();
                bail!("print stopped: {}", message);
            }
            PrinterState::Closed | PrinterState::Connecting => {
                bail!("connection lost during print");
            }
        }
    }

    printer.close();
    Ok(())
}

fn report_progress(progress: &ProgressInfo) {
    match progress.remaining {
        Some(remaining) => println!(
            "{:5.1}%  {} s left",
            progress.fraction() * 100.0,
            remaining.as_secs()
        ),
        None => println!("{:5.1}%", progress.fraction() * 100.0),
    }
}

fn cmd_send(config: &Config, lines: &[String], port: Option<&str>) -> Result<()> {
    let printer = open_printer(config, port)?;
    for line in lines {
        printer.send_command(line)?;
    }
    thread::sleep(SEND_SETTLE);

    if let Some(version) = printer.firmware_version() {
        println!("Firmware {}", version);
    }
    let temperatures = printer.temperatures();
    if let Some(bed) = temperatures.bed {
        println!("Bed {:.1}", bed.measured);
    }
    for (index, reading) in temperatures.hotends.iter().enumerate() {
        if let Some(reading) = reading {
            println!("T{} {:.1}", index, reading.measured);
        }
    }

    let message = printer.error_message();
    printer.close();
    match message {
        Some(message) => bail!("printer reported: {}", message),
        None => Ok(()),
    }
}

fn cmd_firmware_check(config: &Config, family: Option<&str>, current: Option<&str>) -> Result<()> {
    let family = match family {
        Some(tag) => MachineFamily::from_tag(tag),
        None => config
            .machine
            .family()
            .context("no family configured; pass --family")?,
    };

    let source = GithubReleaseSource::new(config.firmware.clone())?;
    let release = source.latest(&family)?;
    println!("Latest {} firmware: {}", family, release.version);
    if let Some(asset) = &release.asset_name {
        println!("Image: {}", asset);
    }

    if let Some(current) = current {
        let current = FirmwareVersion::parse(current)?;
        if needs_update(Some(&current), &release.version) {
            println!("Update available: {} -> {}", current, release.version);
        } else {
            println!("{} is up to date", current);
        }
    }
    Ok(())
}

fn cmd_firmware_verify(image: &Path) -> Result<()> {
    let firmware = FirmwareImage::load(image)?;
    println!("{}", image.display());
    println!("  size:    {} bytes", firmware.len());
    println!("  start:   0x{:04x}", firmware.start_address());
    match firmware.family() {
        Some(family) => println!("  family:  {}", family),
        None => println!("  family:  unknown"),
    }
    Ok(())
}

fn cmd_config_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists; pass --force to overwrite", path.display());
    }
    Config::default().save_to_file(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_print_arguments() {
        let cli = Cli::try_parse_from([
            "fdmlink", "--config", "p.toml", "print", "part.gcode", "--port", "COM3", "--estimate",
            "600",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("p.toml")));
        match cli.cmd {
            Cmd::Print {
                gcode,
                port,
                estimate,
            } => {
                assert_eq!(gcode, PathBuf::from("part.gcode"));
                assert_eq!(port.as_deref(), Some("COM3"));
                assert_eq!(estimate, Some(600));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_send_requires_a_line() {
        assert!(Cli::try_parse_from(["fdmlink", "send"]).is_err());
    }

    #[test]
    fn test_verify_reports_unreadable_image() {
        assert!(cmd_firmware_verify(Path::new("/nonexistent/bcn3dsigma.hex")).is_err());
    }

    #[test]
    fn test_config_init_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        cmd_config_init(&path, false).unwrap();
        assert!(cmd_config_init(&path, false).is_err());
        cmd_config_init(&path, true).unwrap();
        assert!(Config::load_from_file(&path).is_ok());
    }
}
