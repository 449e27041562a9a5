// src/main.rs
//
// -----------------------------------------------------------------------------
// cbperf - Couchbase workload driver & data utility CLI
// -----------------------------------------------------------------------------

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dotenvy::dotenv;
use tokio::runtime::Builder as RtBuilder;
use tracing::{info, warn};

use cbperf::cluster::{ConnectOptions, Keyspace, Session};
use cbperf::config::{Config, Overrides};
use cbperf::constants::{INDEX_CREATE_TIMEOUT, MIN_BUCKET_QUOTA_MB};
use cbperf::driver::{RunContext, RunSettings, StatusVector};
use cbperf::error::ErrorKind;
use cbperf::export::{ExportFilter, ExportFormat, Exporter};
use cbperf::import::{import_table, CsvSource, TableSource};
use cbperf::inventory::{bucket_quota, Inventory, Variables};
use cbperf::loader::{self, LoadOptions};
use cbperf::provision::Provisioner;
use cbperf::retry::retry_with_backoff;

/// Schema used by `load --file`
const EXTERNAL_FILE_SCHEMA: &str = "external_file";
const DEFAULT_BUCKET: &str = "cbperf";
const DEFAULT_ID_FIELD: &str = "record_id";

// -----------------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------------
#[derive(Parser)]
#[command(name = "cbperf", version, about = "Couchbase workload driver: provisioning, bulk load, ramp tests, import/export")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v info, -vv debug, -vvv trace); overrides CB_PERF_DEBUG_LEVEL
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

/// Connection and sizing flags shared by every command. `-h` is the host,
/// so help is `--help` only.
#[derive(Args, Debug, Clone, Default)]
struct Common {
    /// Cluster host, IP, SRV domain, or couchbase[s]:// connect string
    #[arg(short = 'h', long = "host")]
    host: Option<String>,
    #[arg(short = 'u', long = "user")]
    user: Option<String>,
    #[arg(short = 'p', long = "password")]
    password: Option<String>,
    #[arg(short = 'b', long = "bucket")]
    bucket: Option<String>,
    #[arg(short = 's', long = "scope")]
    scope: Option<String>,
    #[arg(short = 'c', long = "collection")]
    collection: Option<String>,
    /// Use TLS (certificates are not verified)
    #[arg(long)]
    tls: bool,
    /// Dial nodes by their alternate (external) addresses
    #[arg(long)]
    external: bool,
    #[arg(long)]
    threads: Option<usize>,
    /// Operation count for the mixed step after a load
    #[arg(long)]
    ops: Option<u64>,
    #[arg(long = "replica")]
    replica: Option<u32>,
    /// Inventory file (default: CBPERF_SCHEMA_FILE, then the bundled inventory)
    #[arg(long = "schema-file", value_name = "PATH")]
    schema_file: Option<PathBuf>,
    /// YAML configuration file (default: CBPERF_CONFIG_FILE, then ~/.cbperf/config.yaml)
    #[arg(long = "config", value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the cluster host map and optionally service health
    ///
    /// Examples:
    ///   cbperf list -h cb.example.com
    ///   cbperf list -h cb.example.com --ping
    ///   cbperf list -h 10.0.0.5 --test     (exit 2 when unhealthy)
    #[command(disable_help_flag = true)]
    List {
        #[command(flatten)]
        common: Common,
        /// Wait until query and index services answer
        #[arg(long)]
        wait: bool,
        /// Print per-endpoint diagnostics
        #[arg(long)]
        ping: bool,
        /// Exit with status 2 unless every service is healthy
        #[arg(long)]
        test: bool,
    },
    /// List the schemas in the inventory
    ///
    /// Examples:
    ///   cbperf schema
    ///   cbperf schema --schema-file my_inventory.json
    #[command(disable_help_flag = true)]
    Schema {
        #[command(flatten)]
        common: Common,
    },
    /// Drop every bucket a schema references
    ///
    /// Examples:
    ///   cbperf clean -h cb.example.com --schema employee_demo
    #[command(disable_help_flag = true)]
    Clean {
        #[command(flatten)]
        common: Common,
        #[arg(long, default_value = "default")]
        schema: String,
    },
    /// Provision a schema and bulk-load it, or ingest JSON from stdin
    ///
    /// Examples:
    ///   cbperf load -h cb.example.com --schema default --count 30
    ///   cbperf load -h cb.example.com --schema profile_demo --ops 100000
    ///   cbperf load -h cb.example.com --file order.json -b orders --id order_id
    ///   cbperf load -h cb.example.com --schema default --ramp
    ///   cat docs.json | cbperf load -h cb.example.com -b demo -c people
    #[command(disable_help_flag = true)]
    Load {
        #[command(flatten)]
        common: Common,
        #[arg(long, conflicts_with = "file")]
        schema: Option<String>,
        /// JSON document template loaded through the external_file schema
        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,
        /// Id field for --file templates, or the key field of streamed input
        #[arg(long)]
        id: Option<String>,
        /// Records per collection
        #[arg(long)]
        count: Option<u64>,
        #[arg(long = "batch-size")]
        batch_size: Option<u64>,
        /// Percentage of writes in the mixed step
        #[arg(long = "write-percent")]
        write_percent: Option<u32>,
        /// Random record selection in the mixed step
        #[arg(long)]
        random: bool,
        /// Ramp workers after loading until the cluster breaks or --thread-max is hit
        #[arg(long)]
        ramp: bool,
        #[arg(long = "thread-max")]
        thread_max: Option<usize>,
        /// Issue each batch one operation at a time
        #[arg(long)]
        serial: bool,
        /// Skip the bandwidth probe and keep configured batch sizes
        #[arg(long = "no-probe")]
        no_probe: bool,
    },
    /// Print documents by key (`%N` reads key 1, 2, ... until a miss) or all of a collection
    ///
    /// Examples:
    ///   cbperf get -h cb.example.com -b pillowfight -k pillowfight:%N
    ///   cbperf get -h cb.example.com -b sample_app -s profiles -c user_data -k user_data:1
    ///   cbperf get -h cb.example.com -b sample_app -s profiles -c user_data
    #[command(disable_help_flag = true)]
    Get {
        #[command(flatten)]
        common: Common,
        #[arg(short = 'k', long = "key")]
        key: Option<String>,
    },
    /// Export collections to one file per keyspace
    ///
    /// Examples:
    ///   cbperf export csv -h cb.example.com --directory /tmp/out
    ///   cbperf export json -h cb.example.com -b sample_app -c "user_*" --directory /tmp/out
    #[command(disable_help_flag = true)]
    Export {
        #[command(flatten)]
        common: Common,
        #[arg(value_enum)]
        format: FormatArg,
        #[arg(long, default_value = ".")]
        directory: PathBuf,
    },
    /// Import a CSV table into a collection, keyed 1, 2, ...
    ///
    /// Examples:
    ///   cbperf import -h cb.example.com --file customers.csv -b crm -s sales -c customers
    #[command(disable_help_flag = true)]
    Import {
        #[command(flatten)]
        common: Common,
        #[arg(long, value_name = "PATH")]
        file: PathBuf,
        /// Maximum in-flight upserts
        #[arg(long = "batch-size", default_value_t = 100)]
        batch_size: usize,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Csv,
    Json,
}

impl From<FormatArg> for ExportFormat {
    fn from(f: FormatArg) -> Self {
        match f {
            FormatArg::Csv => ExportFormat::Csv,
            FormatArg::Json => ExportFormat::Json,
        }
    }
}

fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    cbperf::logging::init(cli.verbose).context("Failed to initialize logging")?;

    match cli.command {
        Commands::List { common, wait, ping, test } => list_cmd(&common, wait, ping, test),
        Commands::Schema { common } => schema_cmd(&common),
        Commands::Clean { common, schema } => clean_cmd(&common, &schema),
        Commands::Load {
            common,
            schema,
            file,
            id,
            count,
            batch_size,
            write_percent,
            random,
            ramp,
            thread_max,
            serial,
            no_probe,
        } => {
            let overrides = Overrides {
                record_count: count,
                batch_size,
                write_percent,
                thread_max,
                random_keys: random,
                serial_batches: serial,
                skip_probe: no_probe,
                ..common.overrides()
            };
            load_cmd(&common, overrides, schema, file, id, ramp)
        }
        Commands::Get { common, key } => get_cmd(&common, key.as_deref()),
        Commands::Export { common, format, directory } => export_cmd(&common, format.into(), &directory),
        Commands::Import { common, file, batch_size } => import_cmd(&common, &file, batch_size),
    }
}

// -----------------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------------
impl Common {
    fn overrides(&self) -> Overrides {
        Overrides {
            host: self.host.clone(),
            username: self.user.clone(),
            password: self.password.clone(),
            tls: self.tls,
            external: self.external,
            threads: self.threads,
            replicas: self.replica,
            ..Default::default()
        }
    }

    /// `-b/-s/-c` as a keyspace; scope and collection default to `_default`.
    fn keyspace(&self, default_bucket: Option<&str>) -> Result<Keyspace> {
        let Some(bucket) = self.bucket.as_deref().or(default_bucket) else {
            bail!("a bucket is required (-b/--bucket)");
        };
        let mut ks = Keyspace::bucket_only(bucket);
        if let Some(scope) = &self.scope {
            ks.scope = scope.clone();
        }
        if let Some(collection) = &self.collection {
            ks.collection = collection.clone();
        }
        Ok(ks)
    }
}

fn load_config(common: &Common, overrides: &Overrides) -> Result<Config> {
    let mut cfg = Config::load(common.config.as_deref()).context("Failed to load configuration")?;
    cfg.apply(overrides);
    cfg.validate().context("Invalid configuration")?;
    Ok(cfg)
}

async fn connect(cfg: &Config) -> Result<Session> {
    let opts = ConnectOptions::from_config(&cfg.cluster, cfg.retry.policy());
    info!("connecting to {}", opts.connect_string());
    Session::connect(&opts)
        .await
        .with_context(|| format!("Cannot connect to {}", opts.connect_string()))
}

/// First Ctrl-C raises the stop flag; a second one exits.
fn watch_interrupt(status: Arc<StatusVector>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; stopping workers (Ctrl-C again to quit)");
            status.stop();
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        }
    });
}

// -----------------------------------------------------------------------------
// Commands
// -----------------------------------------------------------------------------
fn list_cmd(common: &Common, wait: bool, ping: bool, test: bool) -> Result<()> {
    let cfg = load_config(common, &common.overrides())?;
    let rt = RtBuilder::new_multi_thread().enable_all().build()?;

    let healthy: Result<bool> = rt.block_on(async {
        let session = match connect(&cfg).await {
            Ok(s) => s,
            Err(e) if test => {
                eprintln!("Cluster not healthy: {:#}", e);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let info = session.info();
        println!("=== Cluster {} (version {}) ===", info.rally_host, info.version());
        if !info.srv_targets.is_empty() {
            println!("SRV targets: {}", info.srv_targets.join(", "));
        }
        println!("Memory quota: {} MiB", info.memory_quota_mb);
        println!("{:<32} {:<32} {:<28} {:<24} OS", "Host", "External", "Services", "Version");
        for [host, external, services, version, os] in info.host_map() {
            println!("{:<32} {:<32} {:<28} {:<24} {}", host, external, services, version, os);
        }

        if wait {
            let policy = cfg.retry.policy().allow(&[
                ErrorKind::QueryService,
                ErrorKind::ViewService,
                ErrorKind::HealthCheck,
            ]);
            retry_with_backoff("wait for services", &policy, || session.health_check(false))
                .await
                .context("Services did not become ready")?;
            println!("All services ready");

            if common.bucket.is_some() {
                let ks = common.keyspace(None)?;
                session
                    .watch_indexes(&ks, &[], INDEX_CREATE_TIMEOUT)
                    .await
                    .with_context(|| format!("Indexes on {} did not come online", ks))?;
                println!("Indexes on {} online", ks);
            }
        }

        let report = session.health_check(false).await;
        if ping {
            let endpoints = match &report {
                Ok(r) => r.endpoints.clone(),
                Err(_) => session.api().ping().await.map(|r| r.endpoints).unwrap_or_default(),
            };
            println!("\n=== Endpoint diagnostics ===");
            for e in endpoints {
                println!(
                    "{:<10} {:<40} {:>9.3}ms  {}",
                    e.service.label(),
                    e.endpoint,
                    e.latency.as_secs_f64() * 1000.0,
                    e.error.as_deref().unwrap_or("OK")
                );
            }
        }
        match report {
            Ok(_) => Ok(true),
            Err(e) if test => {
                eprintln!("Cluster not healthy: {}", e);
                Ok(false)
            }
            Err(e) => {
                warn!("health check: {}", e);
                Ok(true)
            }
        }
    });

    if !healthy? {
        std::process::exit(2);
    }
    Ok(())
}

fn schema_cmd(common: &Common) -> Result<()> {
    let inv = Inventory::resolve(common.schema_file.as_deref()).context("Failed to read inventory")?;
    for (name, raw) in inv.entries() {
        println!("{}", name);
        for b in &raw.buckets {
            for s in &b.scopes {
                for c in &s.collections {
                    println!("    {}.{}.{}", b.name, s.name, c.name);
                }
            }
        }
        for r in &raw.rules {
            println!("    rule {} ({}): {} -> {}", r.name, r.kind, r.primary_key, r.foreign_key);
        }
    }
    Ok(())
}

fn clean_cmd(common: &Common, schema: &str) -> Result<()> {
    let cfg = load_config(common, &common.overrides())?;
    let inv = Inventory::resolve(common.schema_file.as_deref()).context("Failed to read inventory")?;
    let vars = Variables {
        bucket: common.bucket.clone(),
        ..Default::default()
    };
    let schema = inv
        .build(schema, &vars)
        .with_context(|| format!("Failed to build schema {}", schema))?;

    let rt = RtBuilder::new_multi_thread().enable_all().build()?;
    rt.block_on(async {
        let session = connect(&cfg).await?;
        let dropped = Provisioner::new(&session, cfg.run.record_count, cfg.run.replicas)
            .clean(&schema)
            .await?;
        if dropped.is_empty() {
            println!("Nothing to clean for schema {}", schema.name);
        } else {
            println!("Dropped buckets: {}", dropped.join(", "));
        }
        Ok(())
    })
}

fn load_cmd(
    common: &Common,
    overrides: Overrides,
    schema: Option<String>,
    file: Option<PathBuf>,
    id: Option<String>,
    ramp: bool,
) -> Result<()> {
    let cfg = load_config(common, &overrides)?;
    let stream = schema.is_none() && file.is_none() && !std::io::stdin().is_terminal();

    // resolve the schema before touching the cluster
    let built = if stream {
        None
    } else {
        let inv = Inventory::resolve(common.schema_file.as_deref()).context("Failed to read inventory")?;
        let (name, vars) = match &file {
            Some(path) => (
                EXTERNAL_FILE_SCHEMA.to_string(),
                Variables {
                    file: Some(path.display().to_string()),
                    id_field: Some(id.clone().unwrap_or_else(|| DEFAULT_ID_FIELD.to_string())),
                    bucket: Some(common.bucket.clone().unwrap_or_else(|| DEFAULT_BUCKET.to_string())),
                },
            ),
            None => (schema.clone().unwrap_or_else(|| "default".to_string()), Variables::default()),
        };
        Some(
            inv.build(&name, &vars)
                .with_context(|| format!("Failed to build schema {}", name))?,
        )
    };

    let rt = RtBuilder::new_multi_thread().enable_all().build()?;
    rt.block_on(async {
        let session = connect(&cfg).await?;

        let Some(schema) = built else {
            let ks = common.keyspace(None)?;
            let quota = bucket_quota(&ks.bucket, MIN_BUCKET_QUOTA_MB, session.info().memory_quota_mb);
            Provisioner::new(&session, 0, cfg.run.replicas)
                .ensure_keyspace(&ks, quota)
                .await?;
            let n = loader::load_from_stream(&session, &ks, id.as_deref(), cfg.run.threads, tokio::io::stdin()).await?;
            println!("Inserted {} documents into {}", n, ks);
            return Ok(());
        };

        let status = Arc::new(StatusVector::new());
        watch_interrupt(status.clone());
        let ctx = RunContext::new(session, RunSettings::from_config(&cfg.run).with_progress(true), status);
        let opts = LoadOptions::from_config(&cfg.run)
            .with_operations(common.ops.unwrap_or(0))
            .with_ramp(ramp);

        let report = loader::load_from_inventory(&ctx, &schema, &opts).await?;
        let p = &report.provisioned;
        if !p.is_empty() {
            println!(
                "Provisioned {} buckets, {} scopes, {} collections, {} indexes",
                p.buckets_created.len(),
                p.scopes_created.len(),
                p.collections_created.len(),
                p.indexes_requested
            );
        }
        for step in &report.steps {
            step.summary.print(&format!("{} {}", step.label, step.keyspace));
        }
        if report.linked > 0 {
            println!("Linked {} documents", report.linked);
        }
        if report.failed() {
            bail!("load of schema {} did not complete", schema.name);
        }
        Ok(())
    })
}

fn get_cmd(common: &Common, key: Option<&str>) -> Result<()> {
    let cfg = load_config(common, &common.overrides())?;
    let ks = common.keyspace(None)?;
    let rt = RtBuilder::new_multi_thread().enable_all().build()?;
    rt.block_on(async {
        let session = connect(&cfg).await?;
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let n = match key {
            Some(k) => loader::read_by_key(&session, &ks, k, &mut out).await?,
            None => loader::read_by_scan(&session, &ks, &mut out).await?,
        };
        info!("printed {} documents", n);
        Ok(())
    })
}

fn export_cmd(common: &Common, format: ExportFormat, directory: &Path) -> Result<()> {
    let cfg = load_config(common, &common.overrides())?;
    let filter = ExportFilter {
        bucket: common.bucket.clone(),
        scope: common.scope.clone(),
        collection: common.collection.clone(),
    };
    let rt = RtBuilder::new_multi_thread().enable_all().build()?;
    rt.block_on(async {
        let session = connect(&cfg).await?;
        let files = Exporter::new(directory, format).export(&session, &filter).await?;
        for f in &files {
            println!("{}", f.display());
        }
        println!("\nExported {} keyspaces to {}", files.len(), directory.display());
        Ok(())
    })
}

fn import_cmd(common: &Common, file: &Path, batch_size: usize) -> Result<()> {
    let cfg = load_config(common, &common.overrides())?;
    let mut source = CsvSource::open(file).with_context(|| format!("Failed to open {}", file.display()))?;
    let table = source.schema().name.clone();
    let ks = common.keyspace(Some(table.as_str()))?;
    let rt = RtBuilder::new_multi_thread().enable_all().build()?;
    rt.block_on(async {
        let session = connect(&cfg).await?;
        let rows = import_table(&session, &mut source, &ks, batch_size, cfg.run.replicas).await?;
        println!("Imported {} rows from {} into {}", rows, file.display(), ks);
        Ok(())
    })
}
