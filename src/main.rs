mod cache;
mod config;
mod directory;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use clap::{Args as ClapArgs, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cache::{CacheResult, CustomerCache, LocalStore, NoopStore, SqliteStore};
use config::Config;
use directory::{CustomerDraft, CustomerRecord, DirectoryClient};

#[derive(Parser, Debug)]
#[command(name = "crmcache")]
#[command(about = "Local customer cache for the delivery CRM")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/crmcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Skip the background freshness check
  #[arg(long)]
  no_sync: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Replace the local cache with the directory's customer list
  Sync,
  /// Show cached customers
  List {
    /// Include inactive customers
    #[arg(short, long)]
    all: bool,
  },
  /// Search by name, phone, whatsapp, house number or address
  Search { query: String },
  /// Fetch a customer's live balance
  Balance { id: String },
  /// Re-fetch one customer into the cache
  Refresh { id: String },
  /// Show cache state
  Status,
  /// Create a customer on the directory
  Add(CustomerFields),
  /// Update a customer on the directory
  Update {
    id: String,
    #[command(flatten)]
    fields: CustomerFields,
    /// Mark the customer inactive
    #[arg(long, conflicts_with = "activate")]
    deactivate: bool,
    /// Mark the customer active
    #[arg(long)]
    activate: bool,
  },
}

#[derive(ClapArgs, Debug, Default)]
struct CustomerFields {
  #[arg(long)]
  name: Option<String>,
  #[arg(long)]
  phone: Option<String>,
  #[arg(long)]
  whatsapp: Option<String>,
  #[arg(long)]
  house_no: Option<String>,
  #[arg(long)]
  street_no: Option<String>,
  #[arg(long)]
  area: Option<String>,
  #[arg(long)]
  city: Option<String>,
  #[arg(long)]
  address: Option<String>,
  #[arg(long)]
  bottle_count: Option<i64>,
  #[arg(long)]
  avg_days_to_refill: Option<i64>,
}

impl CustomerFields {
  fn into_draft(self) -> CustomerDraft {
    CustomerDraft {
      name: self.name,
      phone: self.phone,
      whatsapp: self.whatsapp,
      house_no: self.house_no,
      street_no: self.street_no,
      area: self.area,
      city: self.city,
      address: self.address,
      bottle_count: self.bottle_count,
      avg_days_to_refill: self.avg_days_to_refill,
      is_active: None,
    }
  }
}

/// Initialize the tracing subscriber.
///
/// Use RUST_LOG to control the level (e.g. RUST_LOG=crmcache=debug).
/// The returned guard flushes the log file on drop.
fn init_tracing(log_file: Option<&PathBuf>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

  match log_file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Log file path has no file name: {}", path.display()))?;
      std::fs::create_dir_all(&dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

      let appender = tracing_appender::rolling::never(dir, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(filter)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
      Ok(None)
    }
  }
}

fn open_store(config: &Config) -> Arc<dyn LocalStore> {
  if !config.cache.enabled {
    return Arc::new(NoopStore);
  }
  let store = match &config.cache.path {
    Some(path) => SqliteStore::at(path),
    None => SqliteStore::open_default(),
  };
  if !store.is_available() {
    warn!("No persistent storage available; running without a local cache");
    return Arc::new(NoopStore);
  }
  info!(path = ?store.path(), "Using local customer store");
  Arc::new(store)
}

fn format_time(at: Option<DateTime<Utc>>) -> String {
  at.map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
    .unwrap_or_else(|| "never".to_string())
}

fn print_customers(result: &CacheResult<Vec<CustomerRecord>>) {
  for customer in &result.data {
    let status = if customer.is_active { "" } else { " [inactive]" };
    println!("{:<26} {}{}", customer.id, customer.label(), status);
  }
  println!("-- {} customer(s) from {}", result.data.len(), result.source.label());
  if result.is_degraded() {
    eprintln!("warning: directory unreachable, results may be incomplete");
  }
}

/// When a command runs the freshness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
  Skip,
  /// Sync first: the command prints the working set and it is empty
  Before,
  Background,
}

fn freshness_for(command: &Command, no_sync: bool, cached: usize) -> Freshness {
  if no_sync {
    return Freshness::Skip;
  }
  let shows_working_set = match command {
    Command::List { .. } => true,
    Command::Search { query } => query.trim().is_empty(),
    _ => return Freshness::Skip,
  };
  if shows_working_set && cached == 0 {
    Freshness::Before
  } else {
    Freshness::Background
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_tracing(config.log_file.as_ref())?;

  let client = DirectoryClient::new(&config.directory)?;
  let cache = CustomerCache::new(client, open_store(&config)).with_policy(config.cache.policy());
  cache.mount();

  // Reads go through the freshness policy. A background check finishes
  // before exit so whatever it fetched reaches the store.
  let background = match freshness_for(&args.command, args.no_sync, cache.customers().len()) {
    Freshness::Skip => None,
    Freshness::Before => {
      cache.ensure_fresh().await;
      None
    }
    Freshness::Background => {
      let cache = cache.clone();
      Some(tokio::spawn(async move { cache.ensure_fresh().await }))
    }
  };

  run(&cache, args.command).await?;

  if let Some(handle) = background {
    if let Ok(true) = handle.await {
      info!(customers = cache.customers().len(), "Background sync finished");
    }
  }

  Ok(())
}

async fn run(cache: &CustomerCache<DirectoryClient>, command: Command) -> Result<()> {
  match command {
    Command::Sync => {
      let report = cache.sync_customers().await?;
      println!(
        "Synced {} customer(s) at {}{}",
        report.customers,
        format_time(Some(report.synced_at)),
        if report.persisted { "" } else { " (not persisted)" }
      );
    }
    Command::List { all } => {
      let mut result = cache.search_customers("").await;
      if !all {
        result.data.retain(|c| c.is_active);
      }
      print_customers(&result);
    }
    Command::Search { query } => {
      let result = cache.search_customers(&query).await;
      print_customers(&result);
    }
    Command::Balance { id } => {
      let result = cache.get_customer_balance(&id).await;
      let name = cache.customer(&id).map(|c| c.name).unwrap_or_else(|| id.clone());
      println!("{}: {:.2} ({})", name, result.data, result.source.label());
      if result.is_degraded() {
        eprintln!("warning: directory unreachable, showing last known balance");
      }
    }
    Command::Refresh { id } => match cache.refresh_customer(&id).await {
      Some(customer) => println!("Refreshed {}", customer.label()),
      None => println!("Could not refresh {}; cached copy kept", id),
    },
    Command::Status => {
      let policy = cache.policy();
      let stored = cache
        .stored_count()
        .map(|n| n.to_string())
        .unwrap_or_else(|| "-".to_string());
      println!("phase:        {:?}", cache.phase());
      println!("loading:      {}", cache.is_loading());
      println!("syncing:      {}", cache.is_syncing());
      println!("persistent:   {}", cache.is_persistent());
      println!("in memory:    {}", cache.customers().len());
      println!("stored:       {}", stored);
      println!("last sync:    {}", format_time(cache.last_sync()));
      println!("needs sync:   {}", cache.needs_sync());
      println!(
        "policy:       trust {}s, min query {} chars, resync after {}m",
        policy.trust_window.num_seconds(),
        policy.min_query_len,
        policy.resync_after.num_minutes()
      );
    }
    Command::Add(fields) => {
      let draft = fields.into_draft();
      if !draft.is_complete() {
        return Err(eyre!("--name and --phone are required"));
      }
      let created = cache.create_customer(&draft).await?;
      println!("Created {} {}", created.id, created.label());
    }
    Command::Update {
      id,
      fields,
      deactivate,
      activate,
    } => {
      let mut draft = fields.into_draft();
      if deactivate {
        draft.is_active = Some(false);
      } else if activate {
        draft.is_active = Some(true);
      }
      if draft.is_empty() {
        return Err(eyre!("Nothing to update"));
      }
      let updated = cache.update_customer(&id, &draft).await?;
      println!("Updated {} {}", updated.id, updated.label());
    }
  }

  Ok(())
}
