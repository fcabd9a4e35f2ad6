use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use clap_derive::{Parser, Subcommand};
use log::{error, info};

use altair_periph::config::MachineConfig;
use altair_periph::error::{Error, Result};
use altair_periph::io::hdsk::format;
use altair_periph::io::hdsk::HardDisk;
use altair_periph::io::sio::{Console, NullConsole, TerminalConsole};
use altair_periph::io::tape::frame::{self, FrameKind};
use altair_periph::vm::runtime::Machine;

#[derive(Parser, Debug)]
#[command(name = "altair-periph", about = "Altair 8800 peripheral simulator")]
struct CLI {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wire up the machine described by a JSON file and serve its devices
    Serve {
        /// Machine description (e.g. --config altair.json); defaults apply without one
        #[arg(long)]
        config: Option<PathBuf>,
        /// Milliseconds between device polls
        #[arg(long, default_value_t = 1)]
        period: u64,
        /// Load the hard disk boot loader before serving
        #[arg(long)]
        boot: bool,
    },
    /// Show the format, geometry and parameter block picked for a disk image
    HdskInfo {
        image: PathBuf,
        /// Force a format by name prefix (e.g. --format EZ80FL)
        #[arg(long)]
        format: Option<String>,
    },
    /// List the frames of a tape image
    TapeDump { image: PathBuf },
}

fn serve(config: Option<PathBuf>, period: u64, boot: bool) -> Result<()> {
    let config = match config {
        Some(path) => MachineConfig::load(&path)?,
        None => MachineConfig::default(),
    };
    let console: Box<dyn Console> = if config.console.telnet_port.is_some() {
        Box::new(NullConsole)
    } else {
        Box::new(TerminalConsole::new(config.console.stop_char))
    };
    let mut machine = Machine::from_config(&config, console)?;
    if boot {
        let start = machine.boot()?;
        info!("Boot loader at {:04X}h", start);
    }
    machine.run(Duration::from_millis(period))
}

fn hdsk_info(image: PathBuf, format_name: Option<String>) -> Result<()> {
    let mut hdsk = HardDisk::new();
    hdsk.attach(0, &image, true)?;
    if let Some(name) = format_name {
        hdsk.set_format(0, &name)?;
    }
    let Some(unit) = hdsk.unit(0) else {
        return Ok(());
    };
    println!("image:    {}", image.display());
    println!("capacity: {} bytes", unit.capacity());
    println!("format:   {}", unit.format_name());
    println!("geometry: {}", unit.geometry());
    if let Some(dpb) = format::by_name(unit.format_name()).map(|i| format::FORMATS[i].dpb_bytes()) {
        let hex: Vec<String> = dpb.iter().map(|b| format!("{:02X}", b)).collect();
        println!("DPB:      {}", hex.join(" "));
    }
    Ok(())
}

fn tape_dump(image: PathBuf) -> Result<()> {
    let mut file = File::open(&image).map_err(|source| Error::Open { path: image.clone(), source })?;
    let frames = frame::scan(&mut file)?;
    let mut records = 0;
    let mut marks = 0;
    for f in &frames {
        match f.kind {
            FrameKind::Mark => {
                marks += 1;
                println!("{:>10}  tape mark", f.offset);
            }
            FrameKind::Record { len, flagged } => {
                records += 1;
                println!("{:>10}  record {:>6} bytes{}", f.offset, len, if flagged { " (error)" } else { "" });
            }
            FrameKind::Damaged { len } => println!("{:>10}  damaged record claiming {} bytes", f.offset, len),
        }
    }
    println!("{} records, {} tape marks", records, marks);
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = CLI::parse();

    let result = match args.command {
        Command::Serve { config, period, boot } => serve(config, period, boot),
        Command::HdskInfo { image, format } => hdsk_info(image, format),
        Command::TapeDump { image } => tape_dump(image),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("altair-periph: {}", e);
            ExitCode::FAILURE
        }
    }
}
