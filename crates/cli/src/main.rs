use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use ipnetwork::IpNetwork;
use stevedore_core::{Assembly, Settings};
use stevedore_ipam::IpAllocator;
use stevedore_provision::{resolve_endpoint, PollOutcome, ProviderKind, Provisioner};
use stevedore_runtime::{ContainerRuntime, DockerRuntime};
use stevedore_store::{SqliteStore, Store};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "stevectl", version, about = "Stevedore container provisioning CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a container from an assembly document
    Create {
        /// Path to the assembly JSON
        file: PathBuf,
        /// Assembly id passed through to logs and records
        #[arg(long = "id", default_value = "")]
        id: String,
        /// Account the assembly belongs to
        #[arg(long = "account", default_value = "")]
        account: String,
        /// Treat the assembly as a standalone instance
        #[arg(long = "instance", action = ArgAction::SetTrue)]
        instance: bool,
        /// Block until the container reports running (or the poll deadline)
        #[arg(long = "wait", action = ArgAction::SetTrue)]
        wait: bool,
    },
    /// Kill and discard the assembly's container
    Delete {
        file: PathBuf,
        #[arg(long = "id", default_value = "")]
        id: String,
    },
    /// Stop the assembly's container with the usual grace period
    Stop {
        file: PathBuf,
        #[arg(long = "id", default_value = "")]
        id: String,
    },
    /// Restart the assembly's container
    Restart {
        file: PathBuf,
        #[arg(long = "id", default_value = "")]
        id: String,
    },
    /// Report the runtime state of the assembly's container
    Status {
        file: PathBuf,
    },
    /// Seed the allocation cursor for the configured subnet
    InitSubnet,
}

fn init_tracing() {
    let env = std::env::var("STEVEDORE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STEVEDORE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid STEVEDORE_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_assembly(path: &PathBuf) -> Result<Assembly> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading assembly {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing assembly {}", path.display()))
}

fn open_store() -> Result<Arc<dyn Store>> {
    Ok(Arc::new(SqliteStore::open_default()?))
}

fn provisioner(settings: Settings, store: Arc<dyn Store>) -> Result<Arc<dyn Provisioner>> {
    Ok(ProviderKind::Docker.resolve(settings, store)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let settings = Settings::from_env();

    match cli.command {
        Commands::Create { file, id, account, instance, wait } => {
            let assembly = load_assembly(&file)?;
            let p = provisioner(settings, open_store()?)?;
            let mut outcome = p.create(&assembly, &id, instance, &account).await?;
            // without --wait the handle is dropped and the poller runs detached
            let ready = match outcome.readiness.take() {
                Some(handle) if wait => handle.wait().await,
                _ => None,
            };
            match cli.output {
                Output::Human => {
                    println!("container {} ({})", outcome.container_id, outcome.container_name);
                    println!("endpoint  {}", outcome.endpoint);
                    if let Some(ip) = &outcome.ip {
                        println!("ip        {}", ip);
                    }
                    match ready {
                        Some(PollOutcome::Ready) => println!("state     running"),
                        Some(PollOutcome::TimedOut) => println!("state     not running (deadline)"),
                        None => {}
                    }
                }
                Output::Json => {
                    let doc = serde_json::json!({
                        "containerId": outcome.container_id,
                        "containerName": outcome.container_name,
                        "endpoint": outcome.endpoint,
                        "ip": outcome.ip,
                        "ready": ready.map(|o| matches!(o, PollOutcome::Ready)),
                    });
                    println!("{}", serde_json::to_string_pretty(&doc)?);
                }
            }
        }
        Commands::Delete { file, id } => {
            let assembly = load_assembly(&file)?;
            let p = provisioner(settings, open_store()?)?;
            p.delete(&assembly, &id).await?;
            println!("deleted");
        }
        Commands::Stop { file, id } => {
            let assembly = load_assembly(&file)?;
            let p = provisioner(settings, open_store()?)?;
            p.stop(&assembly, &id).await?;
            println!("stopped");
        }
        Commands::Restart { file, id } => {
            let assembly = load_assembly(&file)?;
            let p = provisioner(settings, open_store()?)?;
            p.restart(&assembly, &id).await?;
            println!("restarted");
        }
        Commands::Status { file } => {
            let assembly = load_assembly(&file)?;
            let (endpoint, _) = resolve_endpoint(&settings, &assembly)?;
            let component = assembly.head()?;
            let container_id = stevedore_core::require(&component.outputs, "id")?;
            let runtime = DockerRuntime::default();
            let state = runtime.inspect(&endpoint, container_id).await?;
            match cli.output {
                Output::Human => println!("{} {:?}", container_id, state),
                Output::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "containerId": container_id,
                        "state": state,
                    }))?
                ),
            }
        }
        Commands::InitSubnet => {
            let subnet: IpNetwork = settings
                .subnet()?
                .parse()
                .with_context(|| "parsing STEVEDORE_SUBNET")?;
            let allocator = IpAllocator::new(open_store()?, subnet);
            if allocator.seed()? {
                println!("seeded cursor for {}", subnet);
            } else {
                println!("cursor already present; left untouched");
            }
        }
    }
    Ok(())
}
