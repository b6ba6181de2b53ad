// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use loopcam::config::Settings;
use loopcam::constants::{self, DEFAULT_BUFFER_FRAMES, DEFAULT_DEVICE_INDEX, DEFAULT_DEVICE_LABEL};
use loopcam::control::PipelineChanges;
use loopcam::errors::AppResult;
use loopcam::logging::{self, LogBus};
use loopcam::media::PixelFormat;
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "loopcam")]
#[command(about = "Supervised virtual camera on a v4l2loopback device")]
#[command(version = constants::app_info::version())]
struct Cli {
    /// Loopback device index (/dev/videoN)
    #[arg(short, long, global = true, default_value_t = DEFAULT_DEVICE_INDEX)]
    device: u32,

    /// Directory holding device records, locks and control sockets
    #[arg(long, global = true, env = "LOOPCAM_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Settings file (default: $XDG_CONFIG_HOME/loopcam/settings.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor for the device in the foreground
    Daemon,

    /// Create the loopback device and register it for boot
    Provision {
        /// Card label shown to applications
        #[arg(short, long, default_value = DEFAULT_DEVICE_LABEL)]
        label: String,

        /// Frames buffered between capture and device write
        #[arg(short, long, default_value_t = DEFAULT_BUFFER_FRAMES)]
        buffers: u32,
    },

    /// Remove the loopback device and its boot registration
    Deprovision,

    /// Start the pipeline
    Start,

    /// Stop the pipeline
    Stop,

    /// Stop and start the pipeline with the saved config
    Restart,

    /// Show the service state
    Status {
        /// Print a JSON snapshot
        #[arg(long)]
        json: bool,
    },

    /// Follow the pipeline log (Ctrl-C detaches)
    Logs {
        /// Lines of history to replay first
        #[arg(short = 'n', long)]
        lines: Option<usize>,
    },

    /// Start the pipeline at boot
    Enable,

    /// Do not start the pipeline at boot
    Disable,

    /// Check the device node and its capabilities
    Test,

    /// Change the pipeline config; without flags opens $VISUAL/$EDITOR
    Edit {
        #[arg(long)]
        width: Option<u32>,

        #[arg(long)]
        height: Option<u32>,

        /// Frames per second
        #[arg(long)]
        fps: Option<u32>,

        /// Output pixel format (I420, NV12, YUYV, RGB24)
        #[arg(long)]
        format: Option<PixelFormat>,

        #[arg(long)]
        flip_horizontal: Option<bool>,

        #[arg(long)]
        flip_vertical: Option<bool>,
    },

    /// Print the build version
    Version,
}

fn main() {
    let cli = Cli::parse();

    let code = match run(cli) {
        Ok(()) => constants::exit_codes::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> AppResult<()> {
    if let Commands::Version = cli.command {
        cli::version();
        return Ok(());
    }

    let settings = Settings::load(cli.settings.as_deref())?;
    let bus = match cli.command {
        Commands::Daemon => {
            let bus = LogBus::new(settings.log_history);
            logging::init("info", Some(bus.clone()));
            Some(bus)
        }
        _ => {
            logging::init("warn", None);
            None
        }
    };

    let ctx = cli::CliContext {
        state_dir: settings.resolve_state_dir(cli.state_dir),
        settings,
        index: cli.device,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        match cli.command {
            Commands::Daemon => match bus {
                Some(bus) => cli::daemon(&ctx, bus).await,
                None => Ok(()),
            },
            Commands::Provision { label, buffers } => cli::provision(&ctx, label, buffers).await,
            Commands::Deprovision => cli::deprovision(&ctx).await,
            Commands::Start => cli::start(&ctx).await,
            Commands::Stop => cli::stop(&ctx).await,
            Commands::Restart => cli::restart(&ctx).await,
            Commands::Status { json } => cli::status(&ctx, json).await,
            Commands::Logs { lines } => cli::logs(&ctx, lines).await,
            Commands::Enable => cli::set_enabled(&ctx, true).await,
            Commands::Disable => cli::set_enabled(&ctx, false).await,
            Commands::Test => cli::test(&ctx),
            Commands::Edit {
                width,
                height,
                fps,
                format,
                flip_horizontal,
                flip_vertical,
            } => {
                let changes = PipelineChanges {
                    width,
                    height,
                    frame_rate: fps,
                    pixel_format: format,
                    flip_horizontal,
                    flip_vertical,
                };
                cli::edit(&ctx, changes).await
            }
            Commands::Version => {
                cli::version();
                Ok(())
            }
        }
    })
}
