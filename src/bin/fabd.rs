//! fabd - Fabrication Daemon
//!
//! Streams a build file to a serial machine controller, captures it to a file,
//! saves it to the controller's card, or plays a build stored there.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fabd::json_output::{self, output};
use fabd::loopback;
use fabd::{
    run_job, AutoPrompt, BuildJob, BuildRunner, ConsolePrompt, DaemonConfig, Device, Direct, FabError, GCodeSource,
    LinkRegistry, OperatorPrompt, PrinterOptions, ProgressMonitor, SerialDevice, SerialLink, SimulationDevice, Tick,
    ToLocalFile, ToRemoteFile, UsingRemoteFile, VirtualPrinter,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn, Level};

#[derive(Parser)]
#[command(name = "fabd")]
#[command(about = "Fabrication daemon - streams builds to serial machine controllers")]
#[command(version)]
struct Args {
    /// Path to the daemon configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON events on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TargetArg {
    Machine,
    LocalFile,
    RemoteFile,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a build file
    Build {
        /// Build file, one instruction per line
        file: PathBuf,

        /// Where the build goes
        #[arg(short, long, value_enum, default_value = "machine")]
        target: TargetArg,

        /// Output path (local-file) or card file name (remote-file)
        #[arg(short, long)]
        output: Option<String>,

        /// Drive an in-process virtual printer instead of the configured port
        #[arg(long = "virtual")]
        virtual_printer: bool,

        /// Mirror the build onto a preview simulator
        #[arg(long)]
        simulate: bool,

        /// Run against the simulator only, nothing is sent
        #[arg(long)]
        dry_run: bool,

        /// Continue past optional halts without asking
        #[arg(short, long)]
        yes: bool,
    },
    /// Play a build stored on the controller's card
    Play {
        /// File name on the card
        name: String,

        #[arg(long = "virtual")]
        virtual_printer: bool,
    },
    /// List serial ports
    Ports,
}

impl Args {
    fn get_config_path(&self) -> String {
        self.config
            .clone()
            .or_else(|| std::env::var("FABD_CONFIG").ok())
            .unwrap_or_else(|| "config/default_config.yaml".to_string())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Ports = args.command {
        return list_ports(args.json);
    }

    let config_path = args.get_config_path();
    info!("Using config: {}", config_path);
    let config = DaemonConfig::load_from_path(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    let cancel = Arc::new(AtomicBool::new(false));
    let signal_cancel = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping build");
            signal_cancel.store(true, Ordering::Release);
        }
    });

    let json = args.json;
    let task = tokio::task::spawn_blocking(move || execute(args.command, config, json, &cancel));
    task.await.context("Build task panicked")?
}

fn execute(command: Commands, config: DaemonConfig, json: bool, cancel: &AtomicBool) -> Result<()> {
    let registry = LinkRegistry::new();
    let job_id = json_output::new_job_id();

    let (mut job, source, _printer) = match command {
        Commands::Build { file, target, output, virtual_printer, simulate, dry_run, yes } => {
            let build = config.build();
            let source = GCodeSource::from_path(&file)
                .with_context(|| format!("Failed to read build file {}", file.display()))?
                .bracketed(&build.warmup, &build.cooldown);
            let label = source.name().to_string();
            let prompt: Box<dyn OperatorPrompt> =
                if yes { Box::new(AutoPrompt::new(true)) } else { Box::new(ConsolePrompt) };
            let preview = (simulate || build.simulate()).then(|| SimulationDevice::new(config.machine.clone()));

            if dry_run {
                let runner = BuildRunner::new(SimulationDevice::new(config.machine.clone()), source, prompt);
                let job: Box<dyn BuildJob> = Box::new(Direct::new(runner));
                (job, label, None)
            } else if target == TargetArg::LocalFile {
                let path = output.map(PathBuf::from).unwrap_or_else(|| file.with_extension("capture.gcode"));
                let device = SerialDevice::offline(config.machine.clone())?;
                let runner = with_preview(BuildRunner::new(device, source, prompt), preview);
                let job: Box<dyn BuildJob> = Box::new(ToLocalFile::new(runner, &path)?);
                (job, label, None)
            } else {
                let (device, printer) = connect(&config, &registry, virtual_printer)?;
                let runner = with_preview(BuildRunner::new(device, source, prompt), preview);
                let job: Box<dyn BuildJob> = match target {
                    TargetArg::RemoteFile => {
                        let name = output.unwrap_or_else(|| remote_name(&file));
                        Box::new(ToRemoteFile::new(runner, &name)?)
                    }
                    _ => Box::new(Direct::new(runner)),
                };
                (job, label, printer)
            }
        }
        Commands::Play { name, virtual_printer } => {
            let (device, printer) = connect(&config, &registry, virtual_printer)?;
            let job: Box<dyn BuildJob> = Box::new(UsingRemoteFile::new(device, &name)?);
            (job, name, printer)
        }
        Commands::Ports => bail!("ports does not run a job"),
    };

    if json {
        output::job_started(&job_id, job.target(), &source, job.lines_total());
    }

    let mut monitor = ProgressMonitor::new(2, true, 3);
    let interval = config.build().tick_interval();
    let result = run_job(job.as_mut(), interval, cancel, |status, tick| {
        if let Tick::Halted { signal, continued } = tick {
            if json {
                output::halt_reached(&job_id, signal, *continued);
            }
        }
        if monitor.should_output(status) {
            if json {
                monitor.output_json(&job_id, status);
            } else {
                monitor.output_log(status);
            }
        }
    });

    match result {
        Ok(report) => {
            if json {
                output::job_finished(&job_id, &source, &report);
            }
            match &report.halt {
                Some(signal) => info!("Build ended: {}", signal),
                None => info!("Build finished in {:.1}s", report.elapsed.as_secs_f64()),
            }
            Ok(())
        }
        Err(FabError::Cancelled) => {
            if json {
                output::job_cancelled(&job_id, job.target(), &source);
            }
            info!("Build cancelled");
            Ok(())
        }
        Err(e) => {
            error!("Build failed: {}", e);
            if json {
                output::job_failed(&job_id, &e.to_string());
            }
            Err(e.into())
        }
    }
}

fn with_preview<D: Device>(runner: BuildRunner<D>, preview: Option<SimulationDevice>) -> BuildRunner<D> {
    match preview {
        Some(simulator) => runner.with_simulation(simulator),
        None => runner,
    }
}

/// Open the configured port, or a loopback wired to a virtual printer
fn connect(
    config: &DaemonConfig,
    registry: &LinkRegistry,
    virtual_printer: bool,
) -> Result<(SerialDevice, Option<VirtualPrinter>)> {
    let (link, printer) = if virtual_printer {
        let (host, far) = loopback::pair(config.link.reader_poll());
        let printer = VirtualPrinter::spawn(far, PrinterOptions::default()).context("Failed to start virtual printer")?;
        let link = SerialLink::attach("virtual", Box::new(host.try_clone()), Box::new(host), &config.link, registry)?;
        (link, Some(printer))
    } else {
        let link = SerialLink::open(&config.link, registry).context("Failed to open serial link")?;
        (link, None)
    };

    let device = SerialDevice::connect(config.machine.clone(), link)
        .with_context(|| format!("Failed to connect to {}", config.machine.name))?;
    Ok((device, printer))
}

/// Card file names are short, keep the stem
fn remote_name(file: &Path) -> String {
    let stem = file.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_else(|| "build".to_string());
    let short: String = stem.chars().filter(|c| c.is_ascii_alphanumeric()).take(8).collect();
    format!("{}.g", short.to_lowercase())
}

fn list_ports(json: bool) -> Result<()> {
    let ports = fabd::scan_ports(&LinkRegistry::new()).context("Failed to scan serial ports")?;
    if json {
        println!("{}", serde_json::to_string(&ports)?);
        return Ok(());
    }
    if ports.is_empty() {
        info!("No serial ports found");
    }
    for port in ports {
        println!(
            "{}{}{}{}",
            port.name,
            port.alias.map(|a| format!(" ({})", a)).unwrap_or_default(),
            port.description.map(|d| format!(" - {}", d)).unwrap_or_default(),
            if port.available { "" } else { " [in use]" }
        );
    }
    Ok(())
}
