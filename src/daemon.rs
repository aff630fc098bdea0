//! Daemon management for fsguard
//!
//! The daemon owns the watcher and the orchestrator. Operator commands reach
//! it over a unix socket as length-prefixed JSON frames (`u32` little-endian
//! length, then the body), one request and one reply per connection.

use crate::config::{AlertConfig, Config, Settings};
use crate::orchestrator::{Command, Notification, Reply, Request, Status};
use crate::response::send_alert;
use crate::{Guard, GuardHandle};
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Largest IPC frame accepted
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Run the daemon until a signal arrives or monitoring fails.
///
/// Must be called inside the tokio runtime, after any daemonizing.
pub async fn run(config: Config, settings: Settings) -> anyhow::Result<()> {
    write_pid_file(&config.daemon.pid_file)?;

    // Setup signal handlers
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    let handle = match Guard::new(settings.clone()).start().await {
        Ok(handle) => handle,
        Err(e) => {
            cleanup(&config);
            return Err(e.context("cannot start monitoring"));
        }
    };
    let GuardHandle {
        commands: cmd_tx,
        notifications,
        mut monitoring,
    } = handle;

    // Create Unix socket for IPC
    let _ = std::fs::remove_file(&config.daemon.socket);
    let listener = match UnixListener::bind(&config.daemon.socket) {
        Ok(listener) => listener,
        Err(e) => {
            cleanup(&config);
            return Err(anyhow::Error::new(e).context(format!("cannot bind {:?}", config.daemon.socket)));
        }
    };

    info!("fsguard daemon started, listening on {:?}", config.daemon.socket);

    tokio::spawn(forward_notifications(
        notifications,
        settings.monitor_root.clone(),
        config.alerts.clone(),
    ));

    // Main event loop
    let result = loop {
        tokio::select! {
            // Handle incoming IPC commands
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let commands = cmd_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, commands).await {
                            warn!("IPC client error: {}", e);
                        }
                    });
                }
                Err(e) => warn!("Failed to accept IPC connection: {}", e),
            },

            // Handle SIGTERM
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break Ok(());
            }

            // Handle SIGINT
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
                break Ok(());
            }

            // Monitoring only ends on a fatal error
            finished = &mut monitoring => {
                break match finished {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => {
                        error!("Monitoring halted: {}", e);
                        Err(anyhow::Error::new(e).context("monitoring halted"))
                    }
                    Err(e) => Err(anyhow::Error::new(e).context("monitoring task panicked")),
                };
            }
        }
    };

    // Cleanup
    cleanup(&config);

    result
}

async fn forward_notifications(
    mut notifications: mpsc::UnboundedReceiver<Notification>,
    root: PathBuf,
    alerts: AlertConfig,
) {
    while let Some(notification) = notifications.recv().await {
        match notification {
            Notification::Event(event) => {
                let path = event.primary_path().map(|p| p.display().to_string()).unwrap_or_default();
                match event.dest_path {
                    Some(ref dest) if event.source_path.is_some() => {
                        info!("#{} {:?}: {} -> {}", event.id, event.kind, path, dest.display())
                    }
                    _ => info!("#{} {:?}: {}", event.id, event.kind, path),
                }
            }
            Notification::Alert(alert) => {
                warn!(
                    "ALERT #{}: {} modifications in window across {} files",
                    alert.id,
                    alert.count,
                    alert.paths.len()
                );
                if let Err(e) = send_alert(&alert, &root, &alerts).await {
                    warn!("Failed to deliver alert #{}: {}", alert.id, e);
                }
            }
        }
    }
}

async fn handle_client(mut stream: UnixStream, commands: mpsc::Sender<Request>) -> anyhow::Result<()> {
    let command: Command = read_frame(&mut stream).await?;
    debug!("IPC command: {:?}", command);

    let (reply_tx, reply_rx) = oneshot::channel();
    let reply = match commands
        .send(Request {
            command,
            reply: reply_tx,
        })
        .await
    {
        Ok(()) => reply_rx
            .await
            .unwrap_or_else(|_| Reply::Error("monitoring has stopped".into())),
        Err(_) => Reply::Error("monitoring has stopped".into()),
    };

    write_frame(&mut stream, &reply).await
}

/// Write one length-prefixed JSON frame
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(value)?;
    let len = u32::try_from(bytes.len()).context("frame too large")?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame
pub async fn read_frame<R, T>(reader: &mut R) -> anyhow::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame of {} bytes exceeds limit", len);
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Detach from the terminal. Must run before the tokio runtime is built.
pub fn daemonize(config: &Config) -> anyhow::Result<()> {
    use daemonize::Daemonize;

    if let Some(parent) = config.daemon.log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let stdout = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.daemon.log_file)
        .with_context(|| format!("cannot open log file {:?}", config.daemon.log_file))?;
    let stderr = stdout.try_clone()?;

    let daemonize = Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr);

    daemonize.start()?;

    Ok(())
}

/// Stop the fsguard daemon
pub async fn stop(config: &Config) -> anyhow::Result<()> {
    if !is_running(config) {
        println!("fsguard is not running");
        return Ok(());
    }

    let pid = nix::unistd::Pid::from_raw(read_pid_file(&config.daemon.pid_file)?);

    // Send SIGTERM
    nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM)?;

    println!("Sent shutdown signal to fsguard (PID {})", pid);

    // Wait for process to exit
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if !is_running(config) {
            println!("fsguard stopped");
            return Ok(());
        }
    }

    warn!("fsguard did not stop gracefully, sending SIGKILL");
    nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL)?;
    cleanup(config);

    Ok(())
}

/// Check daemon status
pub async fn status(config: &Config) -> anyhow::Result<()> {
    if !is_running(config) {
        println!("fsguard is not running");
        return Ok(());
    }

    // Connect to daemon and get status
    match send_command(config, Command::Status).await {
        Ok(reply) => print_reply(&reply),
        Err(e) => println!("fsguard is running but not responding: {}", e),
    }

    Ok(())
}

/// Send a command to the running daemon and wait for its reply
pub async fn send_command(config: &Config, command: Command) -> anyhow::Result<Reply> {
    let mut stream = UnixStream::connect(&config.daemon.socket)
        .await
        .with_context(|| format!("cannot reach daemon at {:?}", config.daemon.socket))?;

    write_frame(&mut stream, &command).await?;
    read_frame(&mut stream).await
}

/// Show daemon or audit logs
pub async fn show_logs(config: &Config, audit: bool, lines: usize, follow: bool) -> anyhow::Result<()> {
    let log_path = if audit {
        &config.audit_log
    } else {
        &config.daemon.log_file
    };

    if !log_path.exists() {
        println!("No log file found at {:?}", log_path);
        return Ok(());
    }

    if follow {
        // Use tail -f equivalent
        let mut cmd = tokio::process::Command::new("tail")
            .args(["-f", "-n", &lines.to_string()])
            .arg(log_path)
            .spawn()?;

        cmd.wait().await?;
    } else {
        // Just print last N lines
        let output = tokio::process::Command::new("tail")
            .args(["-n", &lines.to_string()])
            .arg(log_path)
            .output()
            .await?;

        print!("{}", String::from_utf8_lossy(&output.stdout));
    }

    Ok(())
}

// Helper functions

fn write_pid_file(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let pid = std::process::id();
    std::fs::write(path, pid.to_string()).with_context(|| format!("cannot write {:?}", path))?;
    Ok(())
}

fn read_pid_file(path: &Path) -> anyhow::Result<i32> {
    let content = std::fs::read_to_string(path)?;
    let pid: i32 = content.trim().parse()?;
    Ok(pid)
}

/// Whether the pid file names a live process
pub fn is_running(config: &Config) -> bool {
    match read_pid_file(&config.daemon.pid_file) {
        // Check if process exists
        Ok(pid) => Path::new(&format!("/proc/{}", pid)).exists(),
        Err(_) => false,
    }
}

fn cleanup(config: &Config) {
    let _ = std::fs::remove_file(&config.daemon.pid_file);
    let _ = std::fs::remove_file(&config.daemon.socket);
}

/// Print a daemon reply for the operator
pub fn print_reply(reply: &Reply) {
    match reply {
        Reply::Error(e) => println!("Error: {}", e),
        Reply::Ignored {
            event,
            snapshot,
            snapshot_error,
        } => {
            println!("Event #{} marked as yours", event);
            if let Some(slot) = snapshot {
                println!("Snapshot updated: {}", slot.display());
            }
            if let Some(e) = snapshot_error {
                println!("Snapshot not updated: {}", e);
            }
        }
        Reply::Restored { path, duplicate } => {
            println!("Restored {}", path.display());
            println!("Duplicate saved to {}", duplicate.display());
        }
        Reply::PartiallyRestored { path, error } => {
            println!("Restored {}", path.display());
            println!("But the duplicate could not be saved: {}", error);
        }
        Reply::NoSnapshot { path, expected } => {
            println!("No snapshot found for {}", path.display());
            if let Some(expected) = expected {
                println!("Expected at: {}", expected.display());
            }
        }
        Reply::RestoreFailed { path, error } => {
            println!("Restore failed for {}: {}", path.display(), error);
            println!("The file's current content is unknown; retry the restore.");
        }
        Reply::Confirmed(report) => {
            println!("Updated snapshots for {} files", report.updated.len());
            for path in &report.skipped {
                println!("  skipped (no longer exists): {}", path.display());
            }
            for (path, e) in &report.failed {
                println!("  failed: {}: {}", path.display(), e);
            }
        }
        Reply::NotMe { alert, inspect } => {
            println!("Alert #{} recorded as not your activity", alert);
            match inspect {
                Some(event) => println!(
                    "Most recent affected event: #{} {:?} {} (restore with `fsguard restore {}`)",
                    event.id,
                    event.kind,
                    event.primary_path().map(|p| p.display().to_string()).unwrap_or_default(),
                    event.id
                ),
                None => println!("No affected events remain in history"),
            }
        }
        Reply::Refreshed(report) => {
            println!(
                "Snapshot rebuilt: {} files copied, {} failed",
                report.copied, report.failed
            );
        }
        Reply::Status(status) => print_status(status),
        Reply::Events(events) => {
            if events.is_empty() {
                println!("No events recorded");
            }
            for event in events {
                let dest = event
                    .dest_path
                    .as_ref()
                    .map(|d| format!(" -> {}", d.display()))
                    .unwrap_or_default();
                println!(
                    "#{:<6} {}  {:<8} {}{}",
                    event.id,
                    event.ingested_at.format("%Y-%m-%d %H:%M:%S"),
                    format!("{:?}", event.kind).to_lowercase(),
                    event.primary_path().map(|p| p.display().to_string()).unwrap_or_default(),
                    dest
                );
            }
        }
        Reply::Alerts(alerts) => {
            if alerts.is_empty() {
                println!("No pending alerts");
            }
            for alert in alerts {
                println!(
                    "Alert #{} at {}: {} modifications, {} files",
                    alert.id,
                    alert.raised_at.format("%Y-%m-%d %H:%M:%S"),
                    alert.count,
                    alert.paths.len()
                );
                for path in &alert.paths {
                    println!("  - {}", path.display());
                }
            }
        }
    }
}

fn print_status(status: &Status) {
    println!("fsguard Status");
    println!("───────────────────────────────");
    println!("Status:          ● Running");
    println!("PID:             {}", status.pid);
    println!("Monitored root:  {:?}", status.monitor_root);
    println!("Snapshots:       {:?}", status.snapshot_dir);
    println!("Audit log:       {:?}", status.audit_log);
    println!("Events seen:     {}", status.events_ingested);
    println!("In history:      {}", status.history_len);
    println!("In spike window: {}", status.window_count);
    println!("Pending alerts:  {}", status.pending_alerts);
    if let Some(at) = status.last_alert_at {
        println!("Last alert:      {}", at.to_rfc3339());
    }
    println!("Audit records:   {}", status.audit_records);
}
