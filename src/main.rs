//! Webcam-handler binary: run one command against a capture node.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use webcam_handler::protocol::ReplyData;
use webcam_handler::{
    CaptureDevice, CaptureWorker, CommandKind, CommandProtocol, HandlerConfig, LogSink,
    ResultSink,
};

#[derive(Parser)]
#[command(name = "webcam-handler")]
#[command(about = "Drive a V4L2 webcam through the command protocol")]
#[command(version)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Capture node, overrides the configuration
    #[arg(short, long)]
    device: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture frames and write them to the snapshot directory
    Snapshot {
        /// Number of snapshots to take
        #[arg(short = 'n', long, default_value = "1")]
        count: u32,
    },

    /// Read the frame rate from the hardware
    GetFrameRate,

    /// Set the frame rate
    SetFrameRate {
        /// Frames per second
        fps: f64,
    },

    /// Print parameter values
    DumpParameter {
        /// Parameter id, all parameters if omitted
        id: Option<u8>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG controls verbosity, e.g. RUST_LOG=webcam_handler=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => HandlerConfig::load(path)?,
        None => HandlerConfig::default(),
    };
    if let Some(device) = cli.device {
        config.device_path = device;
    }
    config.validate()?;

    let request = config.format_request()?;
    let options = config.open_options();
    let path = config.device_path.clone();
    let worker = CaptureWorker::spawn(
        move || CaptureDevice::open(&path, &request, &options),
        config.snapshot_writer(),
    )?;
    let mut protocol = CommandProtocol::new(worker, config.initial_frame_rate);
    let mut sink = LogSink;
    let period = config.tick_period();

    match cli.command {
        Commands::Snapshot { count } => {
            for _ in 0..count {
                if let ReplyData::Snapshot(info) = run_command(
                    &mut protocol,
                    &mut sink,
                    CommandKind::Snapshot,
                    &[],
                    period,
                )? {
                    println!("{}", info.path.display());
                }
            }
        }
        Commands::GetFrameRate => {
            run_command(&mut protocol, &mut sink, CommandKind::GetFrameRate, &[], period)?;
            println!("{}", protocol.frame_rate());
        }
        Commands::SetFrameRate { fps } => {
            run_command(
                &mut protocol,
                &mut sink,
                CommandKind::SetFrameRate,
                &fps.to_ne_bytes(),
                period,
            )?;
            println!("{}", protocol.frame_rate());
        }
        Commands::DumpParameter { id: Some(id) } => {
            println!("0x{id:02x} = {}", protocol.dump_parameter(id)?);
        }
        Commands::DumpParameter { id: None } => {
            for (id, value) in protocol.dump_parameters() {
                println!("0x{:02x} {id:?} = {value}", id.id());
            }
        }
    }

    protocol.close();
    Ok(())
}

/// Submit one command and tick until it completes.
fn run_command<S: ResultSink>(
    protocol: &mut CommandProtocol,
    sink: &mut S,
    kind: CommandKind,
    payload: &[u8],
    period: Duration,
) -> webcam_handler::Result<ReplyData> {
    protocol.submit(kind, payload)?;
    loop {
        if let Some(result) = protocol.tick() {
            sink.publish(&result);
            return result.outcome;
        }
        thread::sleep(period);
    }
}
