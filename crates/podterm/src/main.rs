use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use podterm::api::{self, AppState};
use podterm::cluster::{ClusterConnector, ClusterRepository, KubeConnector, NewCluster, PortForwardRegistry};
use podterm::db::Database;
use podterm::ephemeral::{
    DEFAULT_SERVER_VERSION_REGEX, EphemeralContainerRepository, EphemeralContainerService,
};
use podterm::exec::TerminalHub;
use podterm::session::{
    IdleWatchdog, StatusReconciler, TerminalAccessRepository, TerminalService, TerminalSettings,
};
use podterm::templates::TemplateRepository;

const APP_NAME: &str = "podterm";

/// How long background tasks get to finish after shutdown is requested.
const TASK_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

#[tokio::main]
async fn async_cluster(ctx: RuntimeContext, cmd: ClusterCommand) -> Result<()> {
    handle_cluster(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {:#?}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_serve(ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Cluster { command } => async_cluster(ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "podterm - debug pods and pod terminals for Kubernetes clusters.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve(ServeCommand),
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Manage cluster credentials
    Cluster {
        #[command(subcommand)]
        command: ClusterCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Serve options. Each one falls back to the config file when not given.
#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,
    /// Seconds between pod status reconciliations
    #[arg(long, env = "TERMINAL_POD_STATUS_SYNC_TIME_IN_SECS")]
    status_sync_secs: Option<u64>,
    /// Minutes without terminal input before a session is disconnected
    #[arg(long, env = "TERMINAL_POD_INACTIVE_DURATION_IN_MINS")]
    inactive_duration_mins: Option<u64>,
    /// Live sessions allowed per user
    #[arg(long, env = "MAX_SESSION_PER_USER")]
    max_sessions_per_user: Option<usize>,
    /// Server versions that support ephemeral containers
    #[arg(long, env = "EPHEMERAL_SERVER_VERSION_REGEX")]
    server_version_regex: Option<String>,
    /// Sessions checked concurrently per reconciler batch
    #[arg(long, env = "BATCH_SIZE")]
    batch_size: Option<usize>,
    /// Seconds a reconciler batch may take
    #[arg(long, env = "TIMEOUT_IN_SECONDS")]
    batch_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Subcommand)]
enum ClusterCommand {
    /// Register a cluster
    Add(ClusterAddCommand),
    /// List registered clusters
    List,
    /// Remove a cluster by id
    Remove {
        id: i64,
    },
}

#[derive(Debug, Clone, Args)]
struct ClusterAddCommand {
    /// Display name
    #[arg(long)]
    name: String,
    /// API server URL
    #[arg(long)]
    server_url: String,
    /// Service account bearer token
    #[arg(long, env = "PODTERM_CLUSTER_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// Base64 encoded CA bundle
    #[arg(long)]
    certificate_authority_data: Option<String>,
    /// Skip TLS verification of the API server
    #[arg(long)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let mut paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&mut paths, &common)?;
        let paths = paths.apply_overrides(&config)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("podterm={level},tower_http={level}"))
        });

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_ansi(!disable_color))
                .try_init()
                .ok();
        }

        // Services log through the `log` facade.
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        if self.common.dry_run {
            info!(
                "dry-run: would ensure data dir {} and state dir {}",
                self.paths.data_dir.display(),
                self.paths.state_dir.display()
            );
            return Ok(());
        }

        fs::create_dir_all(&self.paths.data_dir).with_context(|| {
            format!("creating data directory {}", self.paths.data_dir.display())
        })?;
        fs::create_dir_all(&self.paths.state_dir).with_context(|| {
            format!(
                "creating state directory {}",
                self.paths.state_dir.display()
            )
        })?;
        Ok(())
    }

    fn database_path(&self) -> PathBuf {
        self.paths.data_dir.join("podterm.db")
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
    state_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
            state_dir: default_state_dir()?,
        })
    }

    fn apply_overrides(mut self, cfg: &AppConfig) -> Result<Self> {
        if let Some(ref data_override) = cfg.paths.data_dir {
            self.data_dir = expand_str_path(data_override)?;
        }
        if let Some(ref state_override) = cfg.paths.state_dir {
            self.state_dir = expand_str_path(state_override)?;
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    logging: LoggingConfig,
    paths: PathsConfig,
    server: ServerConfig,
    terminal: TerminalConfig,
    ephemeral: EphemeralConfig,
    batch: BatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
    file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PathsConfig {
    data_dir: Option<String>,
    state_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ServerConfig {
    host: String,
    port: u16,
    /// Browser origins allowed by CORS. Empty mirrors the request origin.
    allowed_origins: Vec<String>,
    /// Interface port-forward listeners bind to.
    port_forward_host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            allowed_origins: Vec::new(),
            port_forward_host: "127.0.0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct TerminalConfig {
    status_sync_secs: u64,
    inactive_duration_mins: u64,
    max_sessions_per_user: usize,
    /// How long an exec session waits for its browser to bind.
    bind_timeout_secs: u64,
    cluster_timeout_secs: u64,
    default_namespace: String,
    /// How often idle sessions are looked for. Defaults to the status sync period.
    idle_check_secs: Option<u64>,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            status_sync_secs: 30,
            inactive_duration_mins: 10,
            max_sessions_per_user: 3,
            bind_timeout_secs: 60,
            cluster_timeout_secs: 5,
            default_namespace: "default".to_string(),
            idle_check_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct EphemeralConfig {
    server_version_regex: String,
}

impl Default for EphemeralConfig {
    fn default() -> Self {
        Self {
            server_version_regex: DEFAULT_SERVER_VERSION_REGEX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct BatchConfig {
    batch_size: usize,
    timeout_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            timeout_secs: 5,
        }
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !cmd.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else {
                println!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

async fn handle_cluster(ctx: &RuntimeContext, command: ClusterCommand) -> Result<()> {
    let database = Database::new(&ctx.database_path()).await?;
    let repo = ClusterRepository::new(database.pool().clone());

    match command {
        ClusterCommand::Add(cmd) => {
            if ctx.common.dry_run {
                info!("dry-run: would register cluster {} at {}", cmd.name, cmd.server_url);
                return Ok(());
            }
            let record = repo
                .create(&NewCluster {
                    name: cmd.name,
                    server_url: cmd.server_url,
                    bearer_token: cmd.token,
                    certificate_authority_data: cmd.certificate_authority_data,
                    insecure_skip_tls_verify: cmd.insecure_skip_tls_verify,
                })
                .await?;
            if ctx.common.json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                println!("Registered cluster {} ({})", record.id, record.name);
            }
        }
        ClusterCommand::List => {
            let clusters = repo.list().await?;
            if ctx.common.json {
                println!("{}", serde_json::to_string_pretty(&clusters)?);
            } else if clusters.is_empty() {
                println!("No clusters registered");
            } else {
                for cluster in clusters {
                    println!("{:>4}  {:<24} {}", cluster.id, cluster.name, cluster.server_url);
                }
            }
        }
        ClusterCommand::Remove { id } => {
            if ctx.common.dry_run {
                info!("dry-run: would remove cluster {}", id);
                return Ok(());
            }
            if !repo.delete(id).await? {
                return Err(anyhow!("cluster {id} not found"));
            }
            println!("Removed cluster {id}");
        }
    }
    Ok(())
}

/// Resolve terminal settings: flags and their environment variables win over the file.
fn terminal_settings(config: &AppConfig, cmd: &ServeCommand) -> TerminalSettings {
    let status_sync_secs = cmd
        .status_sync_secs
        .unwrap_or(config.terminal.status_sync_secs)
        .max(1);
    let inactive_mins = cmd
        .inactive_duration_mins
        .unwrap_or(config.terminal.inactive_duration_mins);
    TerminalSettings {
        max_sessions_per_user: cmd
            .max_sessions_per_user
            .unwrap_or(config.terminal.max_sessions_per_user),
        default_namespace: config.terminal.default_namespace.clone(),
        status_sync_interval: Duration::from_secs(status_sync_secs),
        idle_budget: Duration::from_secs(inactive_mins * 60),
        cluster_timeout: Duration::from_secs(config.terminal.cluster_timeout_secs),
        batch_size: cmd.batch_size.unwrap_or(config.batch.batch_size).max(1),
        batch_timeout: Duration::from_secs(
            cmd.batch_timeout_secs.unwrap_or(config.batch.timeout_secs),
        ),
        ..TerminalSettings::default()
    }
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    info!("Starting podterm server...");

    let db_path = ctx.database_path();
    info!("Database path: {}", db_path.display());
    let database = Database::new(&db_path).await?;
    let pool = database.pool().clone();

    let settings = terminal_settings(&ctx.config, &cmd);
    let connector: Arc<dyn ClusterConnector> = Arc::new(KubeConnector::new(
        ClusterRepository::new(pool.clone()),
        settings.cluster_timeout,
    ));
    let hub = Arc::new(TerminalHub::new(Duration::from_secs(
        ctx.config.terminal.bind_timeout_secs,
    )));

    let terminal = Arc::new(TerminalService::new(
        settings.clone(),
        Arc::clone(&connector),
        TerminalAccessRepository::new(pool.clone()),
        TemplateRepository::new(pool.clone()),
        Arc::clone(&hub),
    ));
    let version_regex = cmd
        .server_version_regex
        .clone()
        .unwrap_or_else(|| ctx.config.ephemeral.server_version_regex.clone());
    let ephemeral = Arc::new(EphemeralContainerService::new(
        Arc::clone(&connector),
        EphemeralContainerRepository::new(pool.clone()),
        &version_regex,
    )?);

    match terminal.sync_running_instances().await {
        Ok(count) => info!("Restored {} live terminal session(s)", count),
        Err(e) => warn!("Failed to restore terminal sessions: {}", e),
    }

    let shutdown = CancellationToken::new();
    let reconciler = Arc::new(StatusReconciler::new(Arc::clone(&terminal))).spawn(shutdown.clone());
    let idle_check = ctx
        .config
        .terminal
        .idle_check_secs
        .map(Duration::from_secs)
        .unwrap_or(settings.status_sync_interval);
    let watchdog =
        Arc::new(IdleWatchdog::new(Arc::clone(&terminal))).spawn(idle_check, shutdown.clone());

    let port_forwards = PortForwardRegistry::new(ctx.config.server.port_forward_host.clone());
    let state = AppState::new(
        Arc::clone(&terminal),
        ephemeral,
        Arc::clone(&connector),
        port_forwards.clone(),
    );
    let app = api::create_router(state, &ctx.config.server.allowed_origins);

    let host = cmd.host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = cmd.port.unwrap_or(ctx.config.server.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("invalid address")?;

    info!("Listening on http://{}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;

    let shutdown_signal = {
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            info!("Shutdown signal received, closing terminals...");
            shutdown.cancel();
            let closed = hub.close_all();
            let forwards = port_forwards.stop_all();
            info!(
                "Closed {} exec session(s) and {} port-forward(s)",
                closed, forwards
            );
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("running server")?;

    shutdown.cancel();
    for (name, task) in [("reconciler", reconciler), ("watchdog", watchdog)] {
        if tokio::time::timeout(TASK_SHUTDOWN_GRACE, task).await.is_err() {
            warn!("{} did not stop within {:?}", name, TASK_SHUTDOWN_GRACE);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn load_or_init_config(paths: &mut AppPaths, common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()?;

    let mut config: AppConfig = built.try_deserialize()?;

    if let Some(ref file) = config.logging.file {
        let expanded = expand_str_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
    }

    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    format!("# Configuration for {APP_NAME}\n# File: {}\n\n", path.display())
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::data_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::state_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("state").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine state directory"))
}

fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase()
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}, state: {}",
            self.config_file.display(),
            self.data_dir.display(),
            self.state_dir.display()
        )
    }
}
