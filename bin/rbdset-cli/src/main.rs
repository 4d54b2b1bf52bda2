//! rbdset - Operator CLI for the RBD layer store
//!
//! Opens the device set under `--home`, runs one command and exits. Mounts
//! taken by `mount` outlive the process until `unmount` or `cleanup`.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rbdset::{BackendKind, RbdConfig, RbdDriver, RbdSet, SizeRequest, parse_size};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "rbdset")]
#[command(about = "RBD layer store CLI")]
#[command(version)]
struct Args {
    /// Home directory of the device set
    #[arg(long, env = "RBDSET_HOME", default_value = "/var/lib/rbdset")]
    home: PathBuf,

    /// Storage option (`rbd.<key>=<value>`), repeatable
    #[arg(short = 'o', long = "option")]
    options: Vec<String>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a layer
    Create {
        /// Layer ID
        id: String,
        /// Parent layer ID
        #[arg(short, long)]
        parent: Option<String>,
        /// Size of a base layer (e.g. 10G)
        #[arg(short, long)]
        size: Option<String>,
    },
    /// Remove a layer
    Remove {
        /// Layer ID
        id: String,
    },
    /// Mount a layer and print its rootfs path
    Mount {
        /// Layer ID
        id: String,
        /// SELinux mount label
        #[arg(short, long, default_value = "")]
        label: String,
    },
    /// Unmount a layer
    Unmount {
        /// Layer ID
        id: String,
    },
    /// Check if a layer exists
    Exists {
        /// Layer ID
        id: String,
    },
    /// Show layer details
    Inspect {
        /// Layer ID
        id: String,
    },
    /// List all layers
    List,
    /// Show device set status
    Status,
    /// Unmount every layer and shut the device set down
    Cleanup,
}

fn format_size(bytes: u64) -> String {
    const TIB: u64 = 1024 * 1024 * 1024 * 1024;
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;

    if bytes >= TIB && bytes.is_multiple_of(TIB) {
        format!("{} TiB", bytes / TIB)
    } else if bytes >= GIB && bytes.is_multiple_of(GIB) {
        format!("{} GiB", bytes / GIB)
    } else if bytes >= MIB && bytes.is_multiple_of(MIB) {
        format!("{} MiB", bytes / MIB)
    } else {
        format!("{bytes} B")
    }
}

/// The in-process cluster does not outlive one command, so its images
/// would be gone by the next run and every stored layer dropped.
fn check_backend(options: &[String]) -> Result<()> {
    let config = RbdConfig::from_options(options).context("invalid storage options")?;
    if config.backend == BackendKind::Memory {
        bail!("the memory backend cannot be used from the command line");
    }
    Ok(())
}

fn open(args: &Args, initialize: bool) -> Result<RbdDriver> {
    check_backend(&args.options)?;
    let set = RbdSet::new(&args.home, initialize, &args.options)
        .with_context(|| format!("failed to open device set at {}", args.home.display()))?;
    let report = set.reconcile_report();
    if !report.is_clean() {
        info!("Startup reconciliation: {:?}", report);
    }
    Ok(RbdDriver::with_set(set))
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let initialize = matches!(args.command, Commands::Create { .. });
    let driver = open(&args, initialize)?;

    match &args.command {
        Commands::Create { id, parent, size } => {
            let size = match size {
                Some(s) => SizeRequest::Exact(parse_size(s)?),
                None => SizeRequest::Default,
            };
            driver
                .set()
                .add_device_with_size(id, parent.as_deref(), size)
                .with_context(|| format!("failed to create layer {id}"))?;
            let meta = driver.set().export_device_metadata(id)?;
            println!("Layer created successfully!");
            println!();
            println!("Layer ID:  {id}");
            println!("Parent:    {}", parent.as_deref().unwrap_or("-"));
            println!("Image:     {}", meta.name);
            println!("Size:      {}", format_size(meta.size_bytes));
            println!("Device ID: {}", meta.device_id);
        }
        Commands::Remove { id } => {
            driver
                .remove(id)
                .with_context(|| format!("failed to remove layer {id}"))?;
            println!("Layer {id} removed");
        }
        Commands::Mount { id, label } => {
            let rootfs = driver
                .get(id, label)
                .with_context(|| format!("failed to mount layer {id}"))?;
            println!("{}", rootfs.display());
        }
        Commands::Unmount { id } => {
            driver
                .put(id)
                .with_context(|| format!("failed to unmount layer {id}"))?;
            println!("Layer {id} unmounted");
        }
        Commands::Exists { id } => {
            let exists = driver.exists(id);
            println!("{exists}");
            if !exists {
                std::process::exit(1);
            }
        }
        Commands::Inspect { id } => {
            let metadata = driver.metadata(id)?;
            let device = driver
                .set()
                .list_devices()
                .into_iter()
                .find(|d| &d.id == id)
                .with_context(|| format!("layer {id} disappeared"))?;
            let details = serde_json::json!({
                "id": device.id,
                "parent": device.parent_id,
                "image": device.block_ref.to_string(),
                "size_bytes": device.size_bytes,
                "mount_path": device.mount_path,
                "mount_count": device.mount_count,
                "device_path": device.device_path,
                "formatted": device.formatted,
                "created_at": device.created_at,
                "metadata": metadata,
            });
            println!("{}", serde_json::to_string_pretty(&details)?);
        }
        Commands::List => {
            let devices = driver.set().list_devices();
            println!("Layers");
            println!("======");
            if devices.is_empty() {
                println!("No layers found");
            } else {
                println!(
                    "{:<6} {:<40} {:<40} {:<12} {:<8}",
                    "ID", "LAYER", "PARENT", "SIZE", "MOUNTED"
                );
                println!("{}", "-".repeat(110));
                for device in devices {
                    println!(
                        "{:<6} {:<40} {:<40} {:<12} {:<8}",
                        device.numeric_id,
                        device.id,
                        device.parent_id.as_deref().unwrap_or("-"),
                        format_size(device.size_bytes),
                        if device.is_mounted() { "yes" } else { "no" },
                    );
                }
            }
        }
        Commands::Status => {
            println!("Driver: {}", driver.name());
            for (key, value) in driver.status() {
                println!("{key}: {value}");
            }
            let report = driver.set().reconcile_report();
            if !report.is_clean() {
                println!();
                println!("Reconciliation");
                println!("{}", serde_json::to_string_pretty(report)?);
            }
        }
        Commands::Cleanup => {
            driver.cleanup().context("shutdown incomplete")?;
            println!("Device set shut down");
        }
    }

    Ok(())
}
