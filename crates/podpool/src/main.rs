use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info, warn};
use serde::{Deserialize, Serialize};

use podpool::filler::PoolFiller;
use podpool::reaper::Reaper;
use podpool::{ClusterPool, PoolConfig, PoolState, SpawnReason};

const APP_NAME: &str = "podpool";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, command: PoolCommand) -> Result<()> {
    handle_pool(&ctx, command).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("config file: {}", ctx.paths.config_file.display());

    match cli.command {
        Command::Pool(command) => async_main(ctx, command),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Session pod pool manager.",
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
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk or on the backend
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Assume "yes" for interactive prompts
    #[arg(short = 'y', long = "yes", global = true)]
    assume_yes: bool,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(flatten)]
    Pool(PoolCommand),
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Commands that talk to the backend.
#[derive(Debug, Subcommand)]
enum PoolCommand {
    /// Run the fill and reap loops until interrupted
    Serve,
    /// List managed pods
    List,
    /// Acquire a pod, claiming a standby pod when possible
    Acquire {
        /// Environment id (defaults to the configured default)
        environment: Option<String>,
    },
    /// Spawn a standby pod
    Spawn {
        /// Environment id (defaults to the configured default)
        environment: Option<String>,
        /// Wait until the pod is running
        #[arg(long)]
        wait: bool,
    },
    /// Print the URL of a running pod
    Resolve { pod: String },
    /// Print the phase of a pod
    Status { pod: String },
    /// Delete a pod
    Stop { pod: String },
    /// Run one fill tick
    Fill,
    /// Run one reap tick
    Reap,
    /// Check that the backend is reachable
    Health,
}

impl PoolCommand {
    /// What the command would change on the backend, if anything.
    fn mutation(&self) -> Option<String> {
        match self {
            PoolCommand::Acquire { environment } => Some(format!(
                "acquire a pod of {}",
                environment.as_deref().unwrap_or("the default environment")
            )),
            PoolCommand::Spawn { .. } => Some("spawn a standby pod".to_string()),
            PoolCommand::Stop { pod } => Some(format!("delete pod {pod}")),
            PoolCommand::Fill => Some("fill the standby pool".to_string()),
            PoolCommand::Reap => Some("reap finished and overdue pods".to_string()),
            PoolCommand::Serve
            | PoolCommand::List
            | PoolCommand::Resolve { .. }
            | PoolCommand::Status { .. }
            | PoolCommand::Health => None,
        }
    }
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

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&paths, &common)?;
        Ok(Self {
            common,
            paths,
            config,
        })
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

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("podpool={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
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
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // The library logs through the log facade
        let mut builder = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(self.config.logging.level.as_str()),
        );
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

    /// Print `value` as JSON or YAML when requested, else the human form.
    fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce() -> String) -> Result<()> {
        let output = if self.common.json {
            serde_json::to_string_pretty(value).context("serializing output to JSON")?
        } else if self.common.yaml {
            serde_yaml::to_string(value).context("serializing output to YAML")?
        } else {
            human()
        };
        println!("{output}");
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
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

        Ok(Self { config_file })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    logging: LoggingConfig,
    pool: PoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

async fn handle_pool(ctx: &RuntimeContext, command: PoolCommand) -> Result<()> {
    if ctx.common.dry_run
        && let Some(action) = command.mutation()
    {
        info!("dry-run: would {action}");
        return Ok(());
    }

    let pool = Arc::new(
        ClusterPool::connect(ctx.config.pool.clone()).context("connecting to backend")?,
    );

    match command {
        PoolCommand::Serve => handle_serve(pool).await,
        PoolCommand::List => {
            let pods = pool.list().await.context("listing pods")?.sorted();
            ctx.emit(&pods, || {
                pods.iter()
                    .map(|pod| {
                        format!(
                            "{}\t{}\t{}\t{}\t{}",
                            pod.id,
                            pod.phase,
                            pod.pool().map(|p| p.to_string()).unwrap_or_default(),
                            pod.environment().unwrap_or_default(),
                            pod.url().unwrap_or_default()
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        PoolCommand::Acquire { environment } => {
            let pod = pool
                .acquire(environment.as_deref())
                .await
                .context("acquiring pod")?;
            ctx.emit(&pod, || pod.id.clone())
        }
        PoolCommand::Spawn { environment, wait } => {
            let pod = pool
                .spawn(
                    environment.as_deref(),
                    PoolState::Standby,
                    SpawnReason::Filling,
                    wait,
                )
                .await
                .context("spawning pod")?;
            ctx.emit(&pod, || pod.id.clone())
        }
        PoolCommand::Resolve { pod } => {
            let url = pool.resolve(&pod).await.context("resolving pod")?;
            ctx.emit(&url, || url.clone())
        }
        PoolCommand::Status { pod } => {
            let phase = pool.status(&pod).await.context("fetching pod status")?;
            ctx.emit(&phase, || phase.to_string())
        }
        PoolCommand::Stop { pod } => {
            pool.stop(&pod).await;
            Ok(())
        }
        PoolCommand::Fill => {
            let report = PoolFiller::new(pool).tick().await.context("filling pool")?;
            ctx.emit(&report, || {
                format!(
                    "standby {}/{}, spawned {}, failed {}",
                    report.actual,
                    report.desired,
                    report.spawned.len(),
                    report.failed
                )
            })
        }
        PoolCommand::Reap => {
            let report = Reaper::new(pool).tick().await.context("reaping pods")?;
            ctx.emit(&report, || {
                format!(
                    "deleted {}, over time limit {}, failed {}",
                    report.deleted.len(),
                    report.expired.len(),
                    report.failed
                )
            })
        }
        PoolCommand::Health => {
            let version = pool.health().await.context("checking backend health")?;
            ctx.emit(&version, || format!("{} backend ok: {}", pool.backend().name(), version))
        }
    }
}

async fn handle_serve(pool: Arc<ClusterPool>) -> Result<()> {
    match pool.health().await {
        Ok(version) => info!("{} backend ok: {}", pool.backend().name(), version),
        Err(e) => warn!("{} backend not healthy yet: {}", pool.backend().name(), e),
    }

    let scheduler = pool.start();
    shutdown_signal().await?;
    info!("Shutdown signal received, stopping pool loops...");
    scheduler.stop().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .context("installing Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("installing signal handler")?
            .recv()
            .await;
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => result,
        result = terminate => result,
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    // load_or_init_config creates the file on first run, so only an explicit
    // overwrite is meaningful here
    if ctx.paths.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        info!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        );
        return Ok(());
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
        ConfigCommand::Show => ctx.emit(&ctx.config, || format!("{:#?}", ctx.config)),
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

fn load_or_init_config(paths: &AppPaths, common: &CommonOpts) -> Result<AppConfig> {
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

    load_config(&paths.config_file, &env_prefix())
}

/// Layer the config file and `<PREFIX>__SECTION__KEY` variables over the defaults.
fn load_config(path: &Path, env_prefix: &str) -> Result<AppConfig> {
    let built = Config::builder()
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("loading config from {}", path.display()))?;

    let mut config: AppConfig = built
        .try_deserialize()
        .context("parsing configuration")?;

    let kubernetes = &mut config.pool.kubernetes;
    for file in [&mut kubernetes.token_file, &mut kubernetes.ca_file]
        .into_iter()
        .flatten()
    {
        *file = expand_str_path(file)?.display().to_string();
    }

    config.pool.validate().context("validating pool configuration")?;
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
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push_str("# Environment overrides: ");
    buffer.push_str(&env_prefix());
    buffer.push_str("__POOL__STANDBY_SIZE=4\n");
    buffer.push('\n');
    buffer
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
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn env_prefix() -> String {
    APP_NAME.to_uppercase().replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        write_default_config(&path).unwrap();

        let body = fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("# Configuration for podpool"));

        let config = load_config(&path, "PODPOOL_TEST_ROUND_TRIP").unwrap();
        assert_eq!(config.pool.standby_size, 10);
        assert_eq!(config.pool.environments.len(), 3);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_file_and_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[pool]\nstandby_size = 4\ndefault_environment = \"alpine\"\n\n[pool.kubernetes]\ntoken_file = \"~/token\"\n",
        )
        .unwrap();

        // SAFETY: the variable name is unique to this test
        unsafe { env::set_var("PODPOOL_TEST_OVERRIDES__POOL__REAP_INTERVAL_SECS", "5") };
        let config = load_config(&path, "PODPOOL_TEST_OVERRIDES").unwrap();
        unsafe { env::remove_var("PODPOOL_TEST_OVERRIDES__POOL__REAP_INTERVAL_SECS") };

        assert_eq!(config.pool.standby_size, 4);
        assert_eq!(config.pool.default_environment, "alpine");
        assert_eq!(config.pool.reap_interval_secs, 5);
        assert_eq!(config.pool.fill_interval_secs, 30);
        let token_file = config.pool.kubernetes.token_file.unwrap();
        assert!(!token_file.starts_with('~'));
    }

    #[test]
    fn test_invalid_default_environment_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[pool]\ndefault_environment = \"python\"\n").unwrap();
        assert!(load_config(&path, "PODPOOL_TEST_INVALID").is_err());
    }

    #[test]
    fn test_cli_parses_pool_commands() {
        let cli = Cli::try_parse_from(["podpool", "--json", "acquire", "alpine"]).unwrap();
        assert!(cli.common.json);
        assert!(matches!(
            cli.command,
            Command::Pool(PoolCommand::Acquire { environment: Some(ref env) }) if env == "alpine"
        ));

        let cli = Cli::try_parse_from(["podpool", "-vv", "serve"]).unwrap();
        assert_eq!(cli.common.verbose, 2);
        assert!(matches!(cli.command, Command::Pool(PoolCommand::Serve)));
    }

    #[test]
    fn test_dry_run_covers_every_mutating_command() {
        for args in [
            vec!["acquire"],
            vec!["spawn", "alpine"],
            vec!["stop", "session-1"],
            vec!["fill"],
            vec!["reap"],
        ] {
            let cli = Cli::try_parse_from(
                ["podpool", "--dry-run"].into_iter().chain(args.iter().copied()),
            )
            .unwrap();
            assert!(cli.common.dry_run);
            let Command::Pool(command) = cli.command else {
                panic!("not a pool command: {args:?}");
            };
            assert!(command.mutation().is_some(), "{args:?} is not guarded");
        }

        for args in ["list", "health", "serve"] {
            let cli = Cli::try_parse_from(["podpool", args]).unwrap();
            let Command::Pool(command) = cli.command else {
                panic!("not a pool command: {args}");
            };
            assert!(command.mutation().is_none());
        }
    }
}
