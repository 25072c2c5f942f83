use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dpg_core::CompanyProfile;
use dpg_engine::{BudgetGate, DelegateConfig, Dispatcher, Engine, HttpDelegate, RuleTables};
use dpg_store::{ensure_shadow_id, FileStore, RoadmapStore};
use dpg_sync::{sorted_view, SortBy};

#[derive(Debug, Parser)]
#[command(name = "dpg-cli")]
#[command(about = "DewPoint opportunity engine command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Generate opportunities for a company profile and print them as JSON.
    Generate {
        /// Path to a company profile JSON file.
        #[arg(long)]
        profile: PathBuf,
        /// Optional rule-table YAML overriding the built-in catalog.
        #[arg(long)]
        rules: Option<PathBuf>,
        /// Route through the HTTP generation delegate instead of the
        /// deterministic engine, falling back on failure.
        #[arg(long)]
        delegate: bool,
    },
    /// Run the lead server.
    Serve,
    /// Print the locally cached roadmap.
    Roadmap {
        /// Directory holding the client-side store files.
        #[arg(long, default_value = ".dpg")]
        data_dir: PathBuf,
        #[arg(long, value_enum, default_value_t = SortArg::Newest)]
        sort: SortArg,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SortArg {
    Roi,
    Department,
    Newest,
}

impl From<SortArg> for SortBy {
    fn from(value: SortArg) -> Self {
        match value {
            SortArg::Roi => SortBy::Roi,
            SortArg::Department => SortBy::Department,
            SortArg::Newest => SortBy::Newest,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate {
            profile,
            rules,
            delegate,
        } => {
            let raw = std::fs::read_to_string(&profile)
                .with_context(|| format!("reading profile {}", profile.display()))?;
            let profile: CompanyProfile =
                serde_json::from_str(&raw).context("parsing company profile")?;
            let tables = match rules {
                Some(path) => RuleTables::from_path(&path)
                    .with_context(|| format!("loading rule tables {}", path.display()))?,
                None => RuleTables::default(),
            };
            let engine = Engine::new(tables);
            let dispatcher = if delegate {
                let http = HttpDelegate::new(DelegateConfig::from_env())?;
                Dispatcher::with_delegate(engine, Arc::new(http), BudgetGate::from_env())
            } else {
                Dispatcher::deterministic(engine)
            };
            let opportunities = dispatcher.generate(&profile).await;
            println!("{}", serde_json::to_string_pretty(&opportunities)?);
        }
        Commands::Serve => {
            dpg_web::serve_from_env().await?;
        }
        Commands::Roadmap { data_dir, sort } => {
            let store = Arc::new(FileStore::new(&data_dir));
            let shadow_id = ensure_shadow_id(store.as_ref()).await?;
            let roadmap = RoadmapStore::new(store);
            roadmap.hydrate().await?;
            let view = sorted_view(&roadmap.snapshot().await, sort.into());
            eprintln!("shadow id: {shadow_id}");
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
    }

    Ok(())
}
