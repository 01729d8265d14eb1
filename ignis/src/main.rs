use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use ignis_core::catalog::{DeviceCatalog, SystemCatalog};
use ignis_core::device::DeviceDescriptor;
use ignis_core::engine::{Event, Outcome, WriteEngine};
use ignis_core::error::EngineError;
use ignis_core::plan::{ImagePlanner, WriteOptions, WritePlan};
use ignis_core::source;
use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use std::io::{IsTerminal, stdout};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

#[derive(Parser)]
#[command(name = "ignis")]
#[command(about = "Create bootable USB drives from ISO/IMG images", version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an image to a removable drive interactively
    Write {
        /// Image file to write (.iso/.img, optionally .gz/.xz/.zst)
        #[arg(required = true)]
        image: PathBuf,

        /// Reserve a persistence partition after the image
        #[arg(short, long)]
        persistence: bool,

        /// Add the image after existing content instead of overwriting
        #[arg(short, long)]
        multi_boot: bool,

        /// Patch install-time hardware-requirement checks (ISO images only)
        #[arg(short, long)]
        bypass_checks: bool,
    },
    /// List available removable devices
    List,
}

/// On Unix, disables `ECHOCTL` so a Ctrl+C cancellation does not smear `^C`
/// over the progress bar. The original terminal state is restored on drop.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }

            let Ok(original_termios) = Termios::from_fd(fd) else {
                return Self {
                    original_termios: None,
                };
            };
            let mut new_termios = original_termios;
            new_termios.c_lflag &= !ECHOCTL;
            Self {
                original_termios: tcsetattr(fd, TCSANOW, &new_termios)
                    .is_ok()
                    .then_some(original_termios),
            }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            let fd = stdout().as_raw_fd();
            tcsetattr(fd, TCSANOW, original_termios).ok();
        }
    }
}

/// Presents an interactive menu for the user to select a target device.
fn select_device(devices: &[DeviceDescriptor], prompt: &str) -> Result<DeviceDescriptor> {
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn build_plan(
    catalog: &dyn DeviceCatalog,
    image: &std::path::Path,
    device: &DeviceDescriptor,
    options: WriteOptions,
) -> Result<WritePlan> {
    let planner = ImagePlanner::new();

    // Multi-boot planning places the new image after whatever the drive
    // already holds, so the existing layout is scanned first.
    let existing = if options.multi_boot {
        let mut target = catalog.open_target(&device.id)?;
        planner
            .scan_existing_layout(&mut *target)
            .context("cannot scan the drive's existing layout")?
    } else {
        Vec::new()
    };

    planner
        .build_plan(image, device, options, &existing)
        .context("cannot plan this write")
}

fn run_write(
    catalog: Arc<SystemCatalog>,
    image: PathBuf,
    options: WriteOptions,
    interrupted: Arc<AtomicBool>,
) -> Result<()> {
    let devices = catalog.list_removable_devices()?;
    let device = select_device(&devices, "Select the target device to WRITE to")?;

    println!(
        "{} This will erase all data on '{}' ({:.1} GB).",
        style("WARNING:").red().bold(),
        device.display_label,
        device.capacity_gb(),
    );
    println!("  Device: {}", style(&device.id).cyan());
    println!("  Image:  {}", style(image.display()).cyan());
    if options.persistence {
        println!("  Option: {}", style("persistence partition").cyan());
    }
    if options.multi_boot {
        println!("  Option: {}", style("multi-boot layout").cyan());
    }
    if options.boot_requirement_bypass {
        println!("  Option: {}", style("boot-requirement bypass").cyan());
    }
    println!();

    if !confirm_operation("Are you sure you want to proceed?")? {
        println!("Write operation cancelled.");
        return Ok(());
    }
    println!();

    // Compressed sources are expanded to a temp file first; the spinner
    // covers that stage. `prepared` owns the temp file and must outlive the
    // session.
    let decompress_pb = ProgressBar::new_spinner();
    decompress_pb.set_prefix("Prepare");
    decompress_pb.set_style(
        ProgressStyle::default_spinner()
            .template("{prefix:12} [{elapsed_precise}] {spinner} {bytes} {msg}")
            .unwrap(),
    );
    let prepared = source::prepare_source(&image, &interrupted, |bytes| {
        decompress_pb.set_position(bytes);
    })
    .context("cannot prepare the source image")?;
    decompress_pb.finish_and_clear();

    let plan = build_plan(&*catalog, prepared.path(), &device, options)?;
    let total_bytes = plan.total_planned_bytes();

    let engine = WriteEngine::new(catalog);
    let session = engine.execute(plan)?;

    let pb = ProgressBar::new(total_bytes);
    pb.set_prefix("Writing");
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{prefix:12} [{elapsed_precise}] [{bar:40.green/black}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}",
            )
            .unwrap()
            .progress_chars("■ "),
    );

    let mut cancel_requested = false;
    loop {
        if interrupted.load(Ordering::SeqCst) && !cancel_requested {
            session.request_cancel();
            cancel_requested = true;
            pb.set_message("Cancelling...");
        }
        match session.events().recv_timeout(Duration::from_millis(100)) {
            Ok(Event::Progress {
                bytes_written,
                message,
                ..
            }) => {
                pb.set_position(bytes_written);
                if !cancel_requested {
                    pb.set_message(message);
                }
            }
            Ok(Event::Finished(_)) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    match session.wait() {
        Outcome::Completed => {
            pb.finish_with_message("Done.");
            println!(
                "\n✨ Successfully flashed {} with {}.",
                style(&device.id).cyan(),
                style(image.display()).cyan()
            );
            Ok(())
        }
        Outcome::Cancelled => {
            pb.finish_and_clear();
            println!(
                "{} Write cancelled. The drive holds a partial image and is \
                 not bootable until a full write succeeds.",
                style("Aborted:").yellow().bold()
            );
            Ok(())
        }
        Outcome::Failed(EngineError::VerificationMismatch { region_index, offset }) => {
            pb.finish_and_clear();
            bail!(
                "verification failed in region {region_index} at offset {offset}; \
                 the drive's content must be treated as untrusted"
            );
        }
        Outcome::Failed(e) => {
            pb.finish_and_clear();
            Err(e).context("write failed; the drive is in an undefined state")
        }
    }
}

fn run_list(catalog: &SystemCatalog) -> Result<()> {
    let devices = catalog.list_removable_devices()?;
    if devices.is_empty() {
        println!("No removable devices found.");
        return Ok(());
    }

    println!("Found {} removable device(s):", devices.len());
    println!("\n  {:<14} {:<12} {:<24} {}", "DEVICE", "LABEL", "MODEL", "SIZE");
    println!("  {:-<14} {:-<12} {:-<24} {:-<10}", "", "", "", "");
    for device in devices {
        println!(
            "  {:<14} {:<12} {:<24} {:>6.1} GB",
            device.id,
            device.display_label,
            device.model,
            device.capacity_gb(),
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    TermLogger::init(level, Config::default(), TerminalMode::Stderr, ColorChoice::Auto).ok();

    // Dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    // Ctrl+C requests cooperative cancellation rather than killing the
    // process mid-write.
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })?;

    let catalog = Arc::new(SystemCatalog::new());

    match cli.command {
        Commands::Write {
            image,
            persistence,
            multi_boot,
            bypass_checks,
        } => {
            let options = WriteOptions {
                persistence,
                multi_boot,
                boot_requirement_bypass: bypass_checks,
            };
            run_write(catalog, image, options, interrupted)
        }
        Commands::List => run_list(&catalog),
    }
}
