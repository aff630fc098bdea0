//! Alert notifications for modification spikes

use crate::config::AlertConfig;
use crate::detector::AlertPayload;
use std::path::Path;
use tracing::{info, warn};

/// Paths listed in a notification before the rest is summarized
const MAX_LISTED_PATHS: usize = 10;

/// Send alert through configured channels
pub async fn send_alert(alert: &AlertPayload, root: &Path, config: &AlertConfig) -> anyhow::Result<()> {
    // Desktop notification
    if config.desktop {
        if let Err(e) = send_desktop_notification(alert, root) {
            warn!("Failed to send desktop notification: {}", e);
        }
    }

    // Webhook
    if let Some(ref url) = config.webhook {
        if let Err(e) = send_webhook(alert, url).await {
            warn!("Failed to send webhook: {}", e);
        }
    }

    Ok(())
}

/// Human-readable alert text, paths shown relative to `root`
pub fn summary(alert: &AlertPayload, root: &Path) -> String {
    let mut body = format!(
        "Alert #{}: {} modifications detected in the spike window.\nRecent files:\n",
        alert.id, alert.count
    );
    for path in alert.paths.iter().take(MAX_LISTED_PATHS) {
        let shown = path.strip_prefix(root).unwrap_or(path);
        body.push_str(&format!("  {}\n", shown.display()));
    }
    if alert.paths.len() > MAX_LISTED_PATHS {
        body.push_str(&format!("  ... and {} more\n", alert.paths.len() - MAX_LISTED_PATHS));
    }
    body.push_str(&format!(
        "Run `fsguard confirm {0}` if this was you, or `fsguard not-me {0}` otherwise.",
        alert.id
    ));
    body
}

/// Send desktop notification
fn send_desktop_notification(alert: &AlertPayload, root: &Path) -> anyhow::Result<()> {
    notify_rust::Notification::new()
        .summary("⚠️ Possible mass file modification")
        .body(&summary(alert, root))
        .icon("dialog-warning")
        .urgency(notify_rust::Urgency::Critical)
        .timeout(notify_rust::Timeout::Never)
        .show()?;

    info!("Sent desktop notification for alert #{}", alert.id);

    Ok(())
}

/// Send webhook notification
#[cfg(feature = "reqwest")]
async fn send_webhook(alert: &AlertPayload, url: &str) -> anyhow::Result<()> {
    let payload = serde_json::json!({
        "alert_id": alert.id,
        "raised_at": alert.raised_at.to_rfc3339(),
        "count": alert.count,
        "paths": alert.paths,
    });

    let client = reqwest::Client::new();
    client
        .post(url)
        .json(&payload)
        .send()
        .await?
        .error_for_status()?;

    info!("Sent webhook notification to {}", url);

    Ok(())
}

#[cfg(not(feature = "reqwest"))]
async fn send_webhook(_alert: &AlertPayload, _url: &str) -> anyhow::Result<()> {
    warn!("Webhook support not compiled in (requires 'reqwest' feature)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    fn alert_with(n: usize) -> AlertPayload {
        AlertPayload {
            id: 3,
            raised_at: Utc::now(),
            count: n,
            paths: (0..n).map(|i| PathBuf::from(format!("/srv/share/f{}.txt", i))).collect(),
        }
    }

    #[test]
    fn test_summary_lists_relative_paths() {
        let text = summary(&alert_with(2), Path::new("/srv/share"));
        assert!(text.contains("Alert #3: 2 modifications"));
        assert!(text.contains("  f0.txt\n"));
        assert!(text.contains("  f1.txt\n"));
        assert!(!text.contains("/srv/share/f0.txt"));
        assert!(!text.contains("more"));
    }

    #[test]
    fn test_summary_truncates_long_lists() {
        let text = summary(&alert_with(14), Path::new("/srv/share"));
        assert!(text.contains("  f9.txt\n"));
        assert!(!text.contains("  f10.txt\n"));
        assert!(text.contains("... and 4 more"));
    }

    #[tokio::test]
    async fn test_disabled_channels_do_nothing() {
        let config = AlertConfig {
            desktop: false,
            webhook: None,
        };
        send_alert(&alert_with(1), Path::new("/srv/share"), &config)
            .await
            .unwrap();
    }
}
