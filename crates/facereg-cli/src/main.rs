use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facereg_core::{DescriptorStore, DEFAULT_DESCRIPTOR_DIM};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facereg", about = "Face registration and recognition CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a face under a name
    Register {
        /// Person's name; prompted for when omitted
        #[arg(short, long)]
        label: Option<String>,
        /// JSON file holding one descriptor (an array of numbers)
        #[arg(short, long, conflicts_with = "current", required_unless_present = "current")]
        descriptor: Option<PathBuf>,
        /// Use the best face of the daemon's latest frame
        #[arg(long)]
        current: bool,
    },
    /// Classify a descriptor against the registered faces
    Classify {
        /// JSON file holding one descriptor
        #[arg(short, long)]
        descriptor: PathBuf,
    },
    /// Download every registered face as JSON
    Export {
        #[arg(short, long, default_value = "labeledFaceDescriptors.json")]
        output: PathBuf,
    },
    /// Remove every registered face
    Clear,
    /// List registered labels
    List,
    /// Show daemon status
    Status,
    /// Validate an exported descriptor file without contacting the daemon
    Inspect {
        file: PathBuf,
        /// Expected descriptor length
        #[arg(long, default_value_t = DEFAULT_DESCRIPTOR_DIM)]
        dim: usize,
    },
}

#[zbus::proxy(
    interface = "org.facereg.Registry1",
    default_service = "org.facereg.Registry1",
    default_path = "/org/facereg/Registry1"
)]
trait Registry {
    async fn register_face(&self, label: &str, descriptor: Vec<f64>) -> zbus::Result<String>;
    async fn register_current_face(&self, label: &str) -> zbus::Result<String>;
    async fn classify(&self, descriptor: Vec<f64>) -> zbus::Result<String>;
    async fn export_all(&self) -> zbus::Result<String>;
    async fn clear_all(&self) -> zbus::Result<()>;
    async fn list_labels(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Inspect { file, dim } = &cli.command {
        return inspect(file, *dim);
    }

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = RegistryProxy::new(&conn)
        .await
        .context("is faceregd running?")?;

    match cli.command {
        Commands::Register {
            label,
            descriptor,
            current: _,
        } => {
            // Read the descriptor first so a bad file fails before prompting.
            let descriptor = descriptor.as_deref().map(read_descriptor).transpose()?;
            let label = match label {
                Some(label) => label,
                None => prompt_label(&mut std::io::stdin().lock(), &mut std::io::stdout())?,
            };
            let set = match descriptor {
                Some(d) => proxy.register_face(&label, d).await?,
                None => proxy.register_current_face(&label).await?,
            };
            tracing::debug!(set = %set, "registered");
            println!("{} has been registered!", label.trim());
        }
        Commands::Classify { descriptor } => {
            let descriptor = read_descriptor(&descriptor)?;
            println!("{}", proxy.classify(descriptor).await?);
        }
        Commands::Export { output } => {
            let json = proxy.export_all().await?;
            std::fs::write(&output, json)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Exported to {}", output.display());
        }
        Commands::Clear => {
            proxy.clear_all().await?;
            println!("All registered faces cleared");
        }
        Commands::List => {
            let labels: serde_json::Value = serde_json::from_str(&proxy.list_labels().await?)?;
            print_labels(&labels);
        }
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Inspect { .. } => unreachable!("handled before connecting"),
    }

    Ok(())
}

/// Read one descriptor: a JSON array of numbers.
fn read_descriptor(path: &Path) -> Result<Vec<f64>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading descriptor file {}", path.display()))?;
    let descriptor: Vec<f64> = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a JSON array of numbers", path.display()))?;
    if descriptor.is_empty() {
        bail!("{} holds an empty descriptor", path.display());
    }
    Ok(descriptor)
}

/// Ask for the person's name on `out`, reading the answer from `input`.
fn prompt_label(input: &mut impl BufRead, out: &mut impl Write) -> Result<String> {
    write!(out, "Enter the person's name: ")?;
    out.flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;
    let label = line.trim();
    if label.is_empty() {
        bail!("Name is required.");
    }
    Ok(label.to_string())
}

fn inspect(file: &Path, dim: usize) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let store = DescriptorStore::load(Some(&text), dim)?;
    println!(
        "{}: {} labels, {} descriptors",
        file.display(),
        store.len(),
        store.descriptor_count()
    );
    for set in store.iter() {
        println!("  {:<24} {}", set.label, set.descriptors.len());
    }
    Ok(())
}

fn print_labels(labels: &serde_json::Value) {
    let entries = labels.as_array().map(Vec::as_slice).unwrap_or_default();
    if entries.is_empty() {
        println!("No faces registered");
        return;
    }
    for entry in entries {
        println!(
            "{:<24} {}",
            entry["label"].as_str().unwrap_or("?"),
            entry["descriptors"].as_u64().unwrap_or(0)
        );
    }
}
