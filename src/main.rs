//! fsguard - directory monitor with modification-spike alerts and snapshot restore
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon on a directory
//! sudo fsguard start --dir /srv/share
//!
//! # Review what happened
//! fsguard events --limit 20
//! fsguard alerts
//!
//! # Answer an alert
//! fsguard confirm 1        # it was me
//! fsguard not-me 1         # it was not; then `fsguard restore <event>`
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use dialoguer::{Confirm, Password};
use fsguard::config::{Config, ConfigOverrides};
use fsguard::orchestrator::Command;
use fsguard::{crypt, daemon};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "fsguard")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/fsguard/config.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the fsguard daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(long)]
        foreground: bool,

        #[command(flatten)]
        overrides: ConfigOverrides,
    },

    /// Stop the fsguard daemon
    Stop,

    /// Check daemon status
    Status,

    /// List recent events, newest first
    Events {
        /// Number of events to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// List unresolved alerts
    Alerts,

    /// Mark an event as your own change and accept it
    Ignore {
        /// Event id
        event: u64,
    },

    /// Restore an event's file from snapshot
    Restore {
        /// Event id
        event: u64,
    },

    /// Accept changes as legitimate and update their snapshots
    Confirm {
        /// Alert id whose files to accept
        #[arg(required_unless_present = "path", conflicts_with = "path")]
        alert: Option<u64>,

        /// Files to accept instead of an alert
        #[arg(long, num_args = 1..)]
        path: Vec<PathBuf>,
    },

    /// Report that you did not cause an alert
    NotMe {
        /// Alert id
        alert: u64,
    },

    /// Discard all snapshots and take new ones from the current files
    Refresh {
        /// Don't ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// View daemon or audit logs
    Logs {
        /// Show the CSV audit log instead of the daemon log
        #[arg(long)]
        audit: bool,

        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,

        /// Follow log output
        #[arg(short, long)]
        follow: bool,
    },

    /// Show configuration
    Config,

    /// Encrypt a file with a password
    Encrypt {
        file: PathBuf,

        #[arg(long, env = "FSGUARD_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Decrypt a file produced by `encrypt`
    Decrypt {
        file: PathBuf,

        #[arg(long, env = "FSGUARD_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
}

fn setup_logging(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread().enable_all().build()?)
}

/// Ask a yes/no question on the terminal, defaulting to no
fn confirm(question: &str) -> anyhow::Result<bool> {
    Confirm::new()
        .with_prompt(question)
        .default(false)
        .interact()
        .context("prompt failed")
}

/// Use the given password, or read one without echo. New passwords are asked
/// for twice.
fn password(given: Option<String>, new: bool) -> anyhow::Result<String> {
    if let Some(p) = given {
        return Ok(p);
    }
    let prompt = Password::new().with_prompt("Password");
    let prompt = if new {
        prompt.with_confirmation("Repeat password", "Passwords do not match")
    } else {
        prompt
    };
    prompt.interact().context("prompt failed")
}

fn send(config: &Config, command: Command) -> anyhow::Result<()> {
    let reply = runtime()?.block_on(daemon::send_command(config, command))?;
    daemon::print_reply(&reply);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    // Load configuration
    let mut config = Config::load(&cli.config).unwrap_or_else(|e| {
        if cli.config.exists() {
            error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
        info!("Using default configuration");
        Config::default()
    });

    match cli.command {
        Commands::Start {
            foreground,
            overrides,
        } => {
            config.apply(&overrides);
            // Validate while still attached to the terminal
            let settings = config.validate().context("invalid configuration")?;
            if daemon::is_running(&config) {
                anyhow::bail!("fsguard is already running");
            }

            info!("Starting fsguard daemon...");
            if !foreground {
                // The runtime must not exist yet when the process forks
                daemon::daemonize(&config)?;
            }
            runtime()?.block_on(daemon::run(config, settings))?;
        }

        Commands::Stop => {
            info!("Stopping fsguard daemon...");
            runtime()?.block_on(daemon::stop(&config))?;
        }

        Commands::Status => {
            runtime()?.block_on(daemon::status(&config))?;
        }

        Commands::Events { limit } => send(&config, Command::Events { limit })?,

        Commands::Alerts => send(&config, Command::Alerts)?,

        Commands::Ignore { event } => send(&config, Command::Ignore(event))?,

        Commands::Restore { event } => send(&config, Command::Restore(event))?,

        Commands::Confirm { alert, path } => match alert {
            Some(alert) => send(&config, Command::ConfirmAlert(alert))?,
            None => send(&config, Command::ConfirmBurst(path))?,
        },

        Commands::NotMe { alert } => send(&config, Command::ReportNotMe(alert))?,

        Commands::Refresh { yes } => {
            if !yes && !confirm("This deletes all existing snapshots and copies the current files. Continue?")? {
                println!("Aborted");
                return Ok(());
            }
            send(&config, Command::Refresh)?;
        }

        Commands::Logs {
            audit,
            lines,
            follow,
        } => {
            runtime()?.block_on(daemon::show_logs(&config, audit, lines, follow))?;
        }

        Commands::Config => {
            println!("{}", serde_yaml::to_string(&config)?);
        }

        Commands::Encrypt { file, password: given } => {
            let output = crypt::encrypt(&file, &password(given, true)?)?;
            println!("Encrypted to {}", output.display());
        }

        Commands::Decrypt { file, password: given } => {
            let output = crypt::decrypt(&file, &password(given, false)?)?;
            println!("Decrypted to {}", output.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_given_password_skips_prompt() {
        assert_eq!(password(Some("pw".into()), true).unwrap(), "pw");
        assert_eq!(password(Some(String::new()), false).unwrap(), "");
    }

    #[test]
    fn test_refresh_yes_flag() {
        let cli = Cli::try_parse_from(["fsguard", "refresh", "--yes"]).unwrap();
        assert!(matches!(cli.command, Commands::Refresh { yes: true }));
        let cli = Cli::try_parse_from(["fsguard", "refresh"]).unwrap();
        assert!(matches!(cli.command, Commands::Refresh { yes: false }));
    }

    #[test]
    fn test_decrypt_takes_password_flag() {
        let cli = Cli::try_parse_from(["fsguard", "decrypt", "a.enc", "--password", "pw"]).unwrap();
        match cli.command {
            Commands::Decrypt { file, password } => {
                assert_eq!(file, PathBuf::from("a.enc"));
                assert_eq!(password.as_deref(), Some("pw"));
            }
            _ => panic!("expected decrypt"),
        }
    }
}
