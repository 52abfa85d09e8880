//! sandboxctl - operator CLI for a remote development sandbox.
//!
//! Usage:
//!   sandboxctl run playbook.toml             # inspect, patch, restart, verify
//!   sandboxctl exec -- 'ls -la ~/'           # one-off command
//!   sandboxctl status --ports 3000,3001      # processes, ports, preview links
//!   sandboxctl serve [--port 8080]           # local sandbox service

use clap::{Parser, Subcommand};
use sandboxctl::client::{resolve_path, ExecOptions, RemoteSandbox, Sandbox, ServiceClient};
use sandboxctl::config::{Credential, Playbook, Settings, DEFAULT_API_URL};
use sandboxctl::http_server;
use sandboxctl::sandbox::Limits;
use sandboxctl::shell;
use sandboxctl::state::{AppState, ServiceConfig};
use sandboxctl::workflow::{self, RunOptions};
use sandboxctl::{Error, Result};
use std::collections::HashMap;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, Level};

#[derive(Parser, Debug)]
#[command(name = "sandboxctl")]
#[command(about = "Patch and verify a remote development sandbox")]
struct Args {
    /// Sandbox service base URL
    #[arg(long, env = "SANDBOX_API_URL", global = true)]
    api_url: Option<String>,

    /// API key for the sandbox service
    #[arg(long, env = "SANDBOX_API_KEY", global = true, hide_env_values = true)]
    api_key: Option<String>,

    /// Sandbox identifier
    #[arg(long = "sandbox", env = "SANDBOX_ID", global = true)]
    sandbox_id: Option<String>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a playbook: inspect, write files, restart services, verify
    Run {
        playbook: PathBuf,

        /// Skip expected-file checks, probes and port listing
        #[arg(long)]
        no_verify: bool,
    },
    /// Run one shell command in the sandbox
    Exec {
        /// Working directory inside the sandbox
        #[arg(long)]
        cwd: Option<String>,

        /// Timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Command and arguments, joined with spaces
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Show matching processes, listening ports and preview links
    Status {
        /// Process patterns to look for
        #[arg(long = "pattern", default_values = ["node", "next"])]
        patterns: Vec<String>,

        /// Ports to check
        #[arg(long, value_delimiter = ',', default_values = ["3000", "3001"])]
        ports: Vec<u16>,
    },
    /// Print the last lines of a log file
    Logs {
        path: String,

        #[arg(short = 'n', long, default_value = "20")]
        lines: usize,
    },
    /// Copy a local file into the sandbox and read it back
    Push {
        local: PathBuf,
        remote: String,

        /// Stream through a shell heredoc instead of the file API
        #[arg(long)]
        heredoc: bool,
    },
    /// Print a file from the sandbox
    Cat { path: String },
    /// Check that paths exist in the sandbox
    CheckFiles {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Print preview links for ports
    Urls {
        #[arg(required = true)]
        ports: Vec<u16>,
    },
    /// List sandboxes known to the service
    List,
    /// Delete a sandbox, its files and its processes
    Delete { id: String },
    /// Check that the sandbox service is up
    Health,
    /// Create a sandbox and print its id
    Create {
        /// Label as key=value
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,
    },
    /// Start the local sandbox service
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        bind: IpAddr,

        /// Directory holding sandbox directories
        #[arg(long)]
        root: Option<PathBuf>,

        /// Host used in preview links
        #[arg(long, default_value = "127.0.0.1")]
        public_host: String,

        /// Remove sandboxes idle for this many seconds
        #[arg(long)]
        idle_ttl_secs: Option<u64>,

        /// Maximum number of open files per command
        #[arg(long, default_value = "4096")]
        nofile: u64,

        /// Maximum file size in KB
        #[arg(long, default_value = "1048576")]
        fsize: u64,
    },
}

fn parse_label(value: &str) -> std::result::Result<(String, String), String> {
    let (key, val) = value
        .split_once('=')
        .ok_or_else(|| format!("label '{value}' is not key=value"))?;
    if key.is_empty() {
        return Err(format!("label '{value}' has an empty key"));
    }
    Ok((key.to_string(), val.to_string()))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else if matches!(args.command, Commands::Serve { .. }) {
        Level::INFO
    } else {
        Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match dispatch(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::from(2)
        }
    }
}

async fn dispatch(args: Args) -> Result<ExitCode> {
    let Args {
        api_url,
        api_key,
        sandbox_id,
        command,
        ..
    } = args;

    match command {
        Commands::Run {
            playbook,
            no_verify,
        } => {
            let playbook = Playbook::load(&playbook)?;
            let settings =
                Settings::resolve(api_url, api_key, sandbox_id, Some(&playbook.sandbox))?;
            let sandbox = RemoteSandbox::connect(&settings).await?;
            let options = RunOptions {
                skip_verify: no_verify,
            };
            let report = workflow::run(&sandbox, &playbook, &options).await;
            print!("{}", report.render());
            Ok(verdict(report.verified()))
        }
        Commands::Create { labels } => {
            let service = service_client(api_url, api_key)?;
            let info = service
                .create_sandbox(labels.into_iter().collect::<HashMap<_, _>>())
                .await?;
            println!("{}", info.id);
            Ok(ExitCode::SUCCESS)
        }
        Commands::List => {
            let service = service_client(api_url, api_key)?;
            for info in service.list_sandboxes().await? {
                println!(
                    "{}\t{}\tage {}s\tidle {}s",
                    info.id, info.state, info.age_secs, info.idle_secs
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Delete { id } => {
            let service = service_client(api_url, api_key)?;
            service.delete_sandbox(&id).await?;
            println!("deleted {id}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Health => {
            let service = service_client(api_url, api_key)?;
            let health = service.health().await?;
            println!(
                "{} ({}): {} sandbox(es)",
                health.status, health.service, health.sandboxes
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Serve {
            port,
            bind,
            root,
            public_host,
            idle_ttl_secs,
            nofile,
            fsize,
        } => {
            let root = root.unwrap_or_else(|| std::env::temp_dir().join("sandboxctl"));
            std::fs::create_dir_all(&root)?;
            let state = AppState::new(ServiceConfig {
                root,
                public_host,
                api_key: Credential::from_input(api_key),
                limits: Limits {
                    nofile,
                    fsize_kb: fsize,
                },
                idle_ttl: idle_ttl_secs.map(Duration::from_secs),
            });
            http_server::run_server(SocketAddr::new(bind, port), state).await?;
            Ok(ExitCode::SUCCESS)
        }
        other => {
            let settings = Settings::resolve(api_url, api_key, sandbox_id, None)?;
            let sandbox = RemoteSandbox::connect(&settings).await?;
            session_command(&sandbox, other).await
        }
    }
}

fn service_client(api_url: Option<String>, api_key: Option<String>) -> Result<ServiceClient> {
    let api_url = api_url.unwrap_or_else(|| DEFAULT_API_URL.to_string());
    ServiceClient::new(&api_url, Credential::from_input(api_key))
}

fn verdict(passed: bool) -> ExitCode {
    if passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Commands that operate on an established session.
async fn session_command(sandbox: &RemoteSandbox, command: Commands) -> Result<ExitCode> {
    let mut stdout = std::io::stdout().lock();
    match command {
        Commands::Exec {
            cwd,
            timeout,
            command,
        } => {
            let options = ExecOptions {
                cwd,
                timeout: timeout.map(Duration::from_secs),
                ..ExecOptions::default()
            };
            let result = sandbox.exec(&command.join(" "), &options).await?;
            stdout.write_all(result.output.as_bytes())?;
            Ok(ExitCode::from(u8::try_from(result.exit_code).unwrap_or(1)))
        }
        Commands::Status { patterns, ports } => {
            let options = ExecOptions::default();
            for pattern in &patterns {
                let listing = sandbox.exec(&shell::list_matching(pattern), &options).await?;
                if listing.success() {
                    writeln!(stdout, "processes matching '{pattern}':\n{}", listing.output)?;
                } else {
                    writeln!(stdout, "no processes matching '{pattern}'")?;
                }
            }
            let listening = sandbox.exec(&shell::listening_ports(&ports), &options).await?;
            if listening.success() {
                writeln!(stdout, "listening:\n{}", listening.output)?;
            } else {
                writeln!(stdout, "nothing listening on {ports:?}")?;
            }
            for port in ports {
                match sandbox.preview_url(port).await {
                    Ok(url) => writeln!(stdout, "port {port}: {url}")?,
                    Err(e) => writeln!(stdout, "port {port}: no preview link ({e})")?,
                }
            }
            Ok(verdict(listening.success()))
        }
        Commands::Logs { path, lines } => {
            let result = sandbox
                .exec(&shell::tail_log(&path, lines), &ExecOptions::default())
                .await?;
            stdout.write_all(result.output.as_bytes())?;
            Ok(verdict(result.success()))
        }
        Commands::Push {
            local,
            remote,
            heredoc,
        } => {
            let content = std::fs::read(&local)?;
            if heredoc {
                let text = String::from_utf8(content.clone()).map_err(|_| {
                    Error::Config(format!(
                        "{} is not UTF-8; push without --heredoc",
                        local.display()
                    ))
                })?;
                let result = sandbox
                    .exec(&shell::heredoc_write(&remote, &text), &ExecOptions::default())
                    .await?;
                if !result.success() {
                    writeln!(
                        stdout,
                        "write failed (exit {}):\n{}",
                        result.exit_code, result.output
                    )?;
                    return Ok(ExitCode::FAILURE);
                }
            } else {
                let path = resolve_path(sandbox, &remote).await?;
                sandbox.write_file(&path, &content).await?;
            }
            let path = resolve_path(sandbox, &remote).await?;
            let read_back = sandbox.read_file(&path).await?;
            if read_back == content {
                writeln!(stdout, "wrote {} bytes to {path}", content.len())?;
                Ok(ExitCode::SUCCESS)
            } else {
                writeln!(
                    stdout,
                    "content mismatch at {path}: wrote {} bytes, read back {}",
                    content.len(),
                    read_back.len()
                )?;
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Cat { path } => {
            let path = resolve_path(sandbox, &path).await?;
            let content = sandbox.read_file(&path).await?;
            stdout.write_all(&content)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::CheckFiles { paths } => {
            let mut missing = 0;
            for path in &paths {
                let result = sandbox
                    .exec(&shell::path_exists(path), &ExecOptions::default())
                    .await?;
                if result.success() {
                    writeln!(stdout, "EXISTS: {path}")?;
                } else {
                    missing += 1;
                    writeln!(stdout, "MISSING: {path}")?;
                }
            }
            Ok(verdict(missing == 0))
        }
        Commands::Urls { ports } => {
            let mut failed = false;
            for port in ports {
                match sandbox.preview_url(port).await {
                    Ok(url) => writeln!(stdout, "port {port}: {url}")?,
                    Err(e) => {
                        failed = true;
                        writeln!(stdout, "port {port}: {e}")?;
                    }
                }
            }
            Ok(verdict(!failed))
        }
        Commands::Run { .. }
        | Commands::Create { .. }
        | Commands::List
        | Commands::Delete { .. }
        | Commands::Health
        | Commands::Serve { .. } => {
            Err(Error::Config("command does not take a session".to_string()))
        }
    }
}
