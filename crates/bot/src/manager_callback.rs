//! The bot manager callback (§6): on exit, POST
//! `{connection_id, exit_code, reason, error_details?}` to the manager URL
//! supplied at launch. Best-effort — the bot is exiting regardless of
//! whether this call succeeds, so failures are logged, never retried.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct BotExitReport<'a> {
    pub connection_id: &'a str,
    pub exit_code: i32,
    pub reason: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<&'a str>,
}

/// Exit codes per §6: 0 normal/self-initiated leave, 130/143
/// signal-driven shutdown, 2 admission failure, other non-zero fatal.
pub mod exit_code {
    pub const NORMAL: i32 = 0;
    pub const SIGINT: i32 = 130;
    pub const SIGTERM: i32 = 143;
    pub const ADMISSION_FAILURE: i32 = 2;
    pub const FATAL: i32 = 1;
}

pub async fn notify_manager(callback_url: &Option<String>, report: &BotExitReport<'_>) {
    let Some(url) = callback_url else {
        tracing::debug!("no BOT_MANAGER_CALLBACK_URL configured, skipping exit callback");
        return;
    };

    let client = reqwest::Client::new();
    match client.post(url).json(report).send().await {
        Ok(response) if response.status().is_success() => {
            tracing::info!(url, exit_code = report.exit_code, "bot manager callback delivered");
        }
        Ok(response) => {
            tracing::warn!(url, status = %response.status(), "bot manager callback rejected, exiting anyway");
        }
        Err(err) => {
            tracing::warn!(url, error = %err, "bot manager callback failed, exiting anyway");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_report_omits_error_details_when_absent() {
        let report = BotExitReport { connection_id: "c1", exit_code: exit_code::SIGINT, reason: "shutdown signal", error_details: None };
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("error_details").is_none());
    }

    #[tokio::test]
    async fn missing_callback_url_is_a_no_op() {
        let report = BotExitReport { connection_id: "c1", exit_code: exit_code::NORMAL, reason: "left meeting", error_details: None };
        notify_manager(&None, &report).await;
    }
}
