//! shellcp - copy files to a host through nothing but a remote shell
//!
//! Every remote command goes through `--exec` (default `sh,-c`), e.g.
//! `--exec ssh,deploy@build01` or a WinRM runner with `--dialect powershell`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use shellcp::error::ResourceLeak;
use shellcp::logger::{Logger, NoopLogger, TextLogger};
use shellcp::{Client, ClientConfig, Dialect, ProcessHost};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Copy files to a remote host over a command channel")]
struct Args {
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Launcher that runs one remote command, comma separated (`ssh,host`)
    #[arg(long, global = true, value_delimiter = ',', default_value = "sh,-c")]
    exec: Vec<String>,

    /// Remote shell family: posix or powershell
    #[arg(long, global = true)]
    dialect: Option<Dialect>,

    /// Show remote stderr and debug logs
    #[arg(long, global = true)]
    debug: bool,

    /// Append transfer events to this file
    #[arg(long = "log-file", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy a local file or directory to a remote path
    Copy {
        local: PathBuf,
        remote: String,
        /// Send directory contents file by file instead of one zip
        #[arg(long)]
        direct: bool,
        /// Show a progress bar
        #[arg(long)]
        progress: bool,
    },
    /// List a remote directory
    List {
        remote: String,
        #[arg(long)]
        json: bool,
    },
    /// Show what the remote host reports about its limits
    Probe {
        #[arg(long)]
        json: bool,
    },
}

/// Feeds chunk events to a progress bar, then to the wrapped logger.
struct ProgressLogger {
    bar: ProgressBar,
    inner: Arc<dyn Logger>,
}

impl ProgressLogger {
    fn new(inner: Arc<dyn Logger>) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg} {bytes} ({bytes_per_sec})")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar, inner }
    }
}

impl Logger for ProgressLogger {
    fn start_transfer(&self, dst: &str) {
        self.bar.set_message(dst.to_string());
        self.inner.start_transfer(dst);
    }
    fn chunk_sent(&self, dst: &str, sequence: u64, bytes: u64) {
        self.bar.inc(bytes);
        self.inner.chunk_sent(dst, sequence, bytes);
    }
    fn transfer_done(&self, dst: &str, bytes: u64, chunks: u64) {
        self.inner.transfer_done(dst, bytes, chunks);
    }
    fn leak(&self, leak: &ResourceLeak) {
        self.bar.suspend(|| eprintln!("warning: {leak}"));
        self.inner.leak(leak);
    }
    fn error(&self, context: &str, path: &str, msg: &str) {
        self.inner.error(context, path, msg);
    }
    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        self.bar.finish_and_clear();
        self.inner.done(files, bytes, seconds);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(dialect) = args.dialect {
        config.dialect = dialect;
    }
    config.debug |= args.debug;

    let file_logger: Arc<dyn Logger> = match &args.log_file {
        Some(p) => Arc::new(
            TextLogger::new(p).with_context(|| format!("opening log file {}", p.display()))?,
        ),
        None => Arc::new(NoopLogger),
    };

    let host = ProcessHost::new(args.exec.iter().cloned()).context("invalid --exec launcher")?;

    match args.command {
        Command::Copy {
            local,
            remote,
            direct,
            progress,
        } => {
            if direct {
                config.archive_directories = false;
            }
            let logger: Arc<dyn Logger> = if progress {
                Arc::new(ProgressLogger::new(file_logger))
            } else {
                file_logger
            };
            let client = Client::new(host, config).with_logger(logger);

            let token = client.cancellation_token();
            ctrlc::set_handler(move || {
                if token.is_cancelled() {
                    // second Ctrl-C: 128 + SIGINT
                    std::process::exit(130);
                }
                eprintln!("\nInterrupted; stopping after the current command (Ctrl-C again to quit)");
                token.cancel();
            })
            .context("installing Ctrl-C handler")?;

            let stats = client
                .copy(&local, &remote)
                .await
                .with_context(|| format!("copying {} to {remote}", local.display()))?;
            println!(
                "Copied {} file(s), {} bytes in {} chunk(s) in {:.2}s",
                stats.files,
                stats.bytes,
                stats.chunks,
                stats.elapsed.as_secs_f64()
            );
        }
        Command::List { remote, json } => {
            let client = Client::new(host, config).with_logger(file_logger);
            let items = client
                .list(&remote)
                .await
                .with_context(|| format!("listing {remote}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else {
                for item in items {
                    println!(
                        "{}  {:>12}  {}  {}",
                        if item.is_dir { 'd' } else { '-' },
                        item.size,
                        item.modified.to_rfc3339(),
                        item.name
                    );
                }
            }
        }
        Command::Probe { json } => {
            let client = Client::new(host, config).with_logger(file_logger);
            let snapshot = client.capabilities().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(snapshot)?);
            } else {
                let w = &snapshot.winrm;
                println!("version:                {}", snapshot.powershell.version);
                println!("execution policy:       {}", snapshot.powershell.execution_policy);
                println!("max envelope (KiB):     {}", w.max_envelope_size_kb);
                println!("max timeout (ms):       {}", w.max_timeout_ms);
                println!("max ops per user:       {}", w.service.max_concurrent_operations_per_user);
                println!("max shells per user:    {}", w.winrs.max_shells_per_user);
                println!("max processes/shell:    {}", w.winrs.max_processes_per_shell);
                println!("chunk size (bytes):     {}", client.chunk_size().await?);
            }
        }
    }

    Ok(())
}
