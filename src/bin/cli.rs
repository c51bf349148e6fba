use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cloudaudit::cloud::snapshot::{InventorySnapshot, SnapshotConnector};
use cloudaudit::config::{Config, DEFAULT_CONFIG_FILE};
use cloudaudit::error::AuditError;
use cloudaudit::federation::StaticTrustBroker;
use cloudaudit::inspect::ItemStatus;
use cloudaudit::output::OutputFormat;
use cloudaudit::store::memory::InMemoryTable;
use cloudaudit::{InspectionService, InspectionStatus, StartRequest};

#[derive(Parser)]
#[command(
    name = "cloudaudit",
    about = "Security inspection orchestrator for cloud accounts",
    version,
    author
)]
struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect an account from an offline inventory snapshot
    Inspect {
        /// Inventory snapshot (JSON)
        #[arg(long, short = 's')]
        snapshot: PathBuf,

        /// Role to federate into
        #[arg(long, env = "CLOUDAUDIT_ROLE")]
        role: String,

        /// Customer the results are recorded under
        #[arg(long, default_value = "local")]
        customer: String,

        /// Service type (storage, compute, identity, all)
        #[arg(long, default_value = "all")]
        service: String,

        /// Items to inspect; all supported items when omitted
        #[arg(long, value_delimiter = ',')]
        items: Vec<String>,

        /// Config file path
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Output format (console, json)
        #[arg(long, short = 'f', default_value = "console")]
        format: String,

        /// Write output to file instead of stdout
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,

        /// Print progress updates to stderr
        #[arg(long)]
        progress: bool,
    },

    /// List registered inspectors and their items
    ListInspectors {
        /// Output format (table, json)
        #[arg(long, short = 'f', default_value = "table")]
        format: String,
    },

    /// Generate a starter .cloudaudit.toml config file
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
}

struct InspectArgs {
    snapshot: PathBuf,
    role: String,
    customer: String,
    service: String,
    items: Vec<String>,
    config: Option<PathBuf>,
    format: String,
    output: Option<PathBuf>,
    progress: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Inspect {
            snapshot,
            role,
            customer,
            service,
            items,
            config,
            format,
            output,
            progress,
        } => {
            cmd_inspect(InspectArgs {
                snapshot,
                role,
                customer,
                service,
                items,
                config,
                format,
                output,
                progress,
            })
            .await
        }
        Commands::ListInspectors { format } => cmd_list_inspectors(format),
        Commands::Init { force } => cmd_init(force),
    };

    match result {
        Ok(exit_code) => process::exit(exit_code),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(e.exit_code());
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "cloudaudit=debug" } else { "cloudaudit=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn offline_service(config: &Config, snapshot: InventorySnapshot) -> InspectionService {
    let lifetime = chrono::Duration::from_std(config.federation.session_duration())
        .unwrap_or_else(|_| chrono::Duration::hours(1));
    InspectionService::from_config(
        config,
        Arc::new(StaticTrustBroker::new(lifetime)),
        Arc::new(SnapshotConnector::new(snapshot)),
        Arc::new(InMemoryTable::new()),
    )
}

async fn cmd_inspect(args: InspectArgs) -> Result<i32, AuditError> {
    let format = OutputFormat::from_str_lenient(&args.format).unwrap_or_else(|| {
        eprintln!("Warning: unknown format '{}', using console", args.format);
        OutputFormat::Console
    });

    let config_path = args
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = Config::load(&config_path)?;
    let snapshot = InventorySnapshot::load(&args.snapshot)?;
    let service = offline_service(&config, snapshot);

    let id = service
        .start(
            &args.customer,
            StartRequest {
                service_type: args.service,
                role_identifier: args.role,
                selected_items: args.items,
            },
        )
        .await?;

    if args.progress {
        // Attaching after start may miss the earliest events.
        if let Ok(mut subscription) = service.broadcaster().subscribe(id) {
            tokio::spawn(async move {
                while let Some(event) = subscription.events.recv().await {
                    eprintln!("[{:>3}%] {}", event.percent, event.step);
                }
            });
        }
    }

    let inspection = service.wait(id).await?;
    let rendered = cloudaudit::render_report(&inspection, format)?;

    match args.output {
        Some(out) => std::fs::write(&out, &rendered)?,
        None => print!("{}", rendered),
    }

    // Exit code: 0 = completed with no failing item, 1 otherwise
    let failing = inspection
        .results
        .iter()
        .any(|r| r.status == ItemStatus::Fail);
    Ok(if inspection.status == InspectionStatus::Completed && !failing {
        0
    } else {
        1
    })
}

fn cmd_list_inspectors(format_str: String) -> Result<i32, AuditError> {
    let service = offline_service(&Config::default(), InventorySnapshot::default());
    let catalog = service.list_inspectors();

    match format_str.as_str() {
        "json" => {
            let json = serde_json::to_string_pretty(&catalog)?;
            println!("{}", json);
        }
        _ => {
            println!(
                "{:<10} {:<8} {:<22} {:<10} {:<16} TITLE",
                "SERVICE", "VERSION", "ITEM", "RISK", "CATEGORY"
            );
            println!("{}", "-".repeat(90));
            for info in &catalog {
                for item in &info.items {
                    println!(
                        "{:<10} {:<8} {:<22} {:<10} {:<16} {}",
                        info.service_type.to_string(),
                        info.version,
                        item.id,
                        item.default_risk.to_string(),
                        item.category,
                        item.title,
                    );
                }
            }
        }
    }

    Ok(0)
}

fn cmd_init(force: bool) -> Result<i32, AuditError> {
    let path = PathBuf::from(DEFAULT_CONFIG_FILE);

    if path.exists() && !force {
        eprintln!("{DEFAULT_CONFIG_FILE} already exists. Use --force to overwrite.");
        return Ok(1);
    }

    std::fs::write(&path, Config::starter_toml())?;
    println!("Created {DEFAULT_CONFIG_FILE}");

    Ok(0)
}
