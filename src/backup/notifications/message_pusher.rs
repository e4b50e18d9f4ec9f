use crate::backup::function_path;
use crate::backup::notifications::webhook::check_status;
use crate::backup::notifications::Notification;
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::run_result::{format_size, RunResult, RunState};
use crate::backup::validate::{validate_http_url, validate_non_empty_secret};
use bon::Builder;
use function_name::named;
use getset::Getters;
use humantime_serde::re::humantime::format_duration;
use itertools::Itertools;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt::Write;
use std::time::Duration;
use validator::Validate;

fn default_username() -> String {
    "admin".to_string()
}

/// A Message Pusher instance, which fans the summary out to its own channels.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct MessagePusherNotificationConfig {
    /// Base URL, `/push/{username}` is appended
    #[validate(custom(function = validate_http_url))]
    #[builder(into)]
    url: String,
    #[validate(custom(function = validate_non_empty_secret))]
    #[builder(into)]
    token: RedactedString,
    #[serde(default = "default_username")]
    #[builder(default = default_username(), into)]
    username: String,
    #[builder(into)]
    channel: Option<String>,
}

#[skip_serializing_none]
#[derive(Serialize)]
struct PushMessage<'a> {
    title: &'static str,
    description: String,
    content: String,
    token: &'a str,
    channel: Option<&'a str>,
}

impl MessagePusherNotificationConfig {
    pub fn push_url(&self) -> String {
        format!("{}/push/{}", self.url.trim_end_matches('/'), self.username)
    }
}

fn status_text(result: &RunResult) -> &'static str {
    match (result.state, result.status()) {
        (RunState::Completed, _) => "all succeeded",
        (_, "failed") => "all failed",
        _ => "partially succeeded",
    }
}

/// Markdown report of the run.
fn render_markdown(result: &RunResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "## Database backup report\n");
    let _ = writeln!(out, "**Status**: {}", status_text(result));
    let _ = writeln!(
        out,
        "**Started**: {}",
        result.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    let _ = writeln!(
        out,
        "**Finished**: {}",
        result.finished_at.format("%Y-%m-%d %H:%M:%S")
    );
    let _ = writeln!(
        out,
        "**Duration**: {}\n",
        format_duration(Duration::from_secs(result.duration().as_secs()))
    );

    let archived = result
        .adapters
        .iter()
        .filter_map(|a| a.archive.as_ref().map(|r| (a, r)))
        .collect_vec();
    if !archived.is_empty() {
        let _ = writeln!(out, "### Succeeded");
        for (adapter, archive) in archived {
            let _ = writeln!(
                out,
                "- **{}**: {} ({})",
                adapter.kind,
                archive.remote_path,
                format_size(archive.size)
            );
            let _ = writeln!(
                out,
                "  - databases: {}",
                adapter
                    .databases
                    .iter()
                    .filter(|d| d.is_success())
                    .map(|d| d.name.as_str())
                    .join(", ")
            );
        }
        let _ = writeln!(out);
    }

    let failures = result
        .adapters
        .iter()
        .flat_map(|a| {
            a.databases
                .iter()
                .filter_map(move |d| {
                    d.outcome
                        .as_ref()
                        .err()
                        .map(|e| format!("- **{}/{}**: {e}", a.kind, d.name))
                })
                .chain(
                    a.stage_failure
                        .iter()
                        .map(move |f| format!("- **{}**: {} failed: {}", a.kind, f.stage, f.message)),
                )
        })
        .collect_vec();
    if !failures.is_empty() {
        let _ = writeln!(out, "### Failed");
        for line in failures {
            let _ = writeln!(out, "{line}");
        }
    }
    out
}

impl Notification for MessagePusherNotificationConfig {
    #[named]
    fn notify(&self, result: &RunResult) -> Result<()> {
        let url = self.push_url();
        tracing::info!("Pushing run summary to {url}");
        let message = PushMessage {
            title: "Database backup",
            description: format!("Backup {}", status_text(result)),
            content: render_markdown(result),
            token: self.token.inner(),
            channel: self.channel.as_deref().filter(|c| !c.is_empty()),
        };

        Client::new()
            .post(&url)
            .json(&message)
            .send()
            .map_err(Error::from)
            .and_then(|response| check_status(&url, response))
            .add_msg(format!("Message Pusher notification to {url} failed"))
            .add_fn_name(function_path!())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::run_result::testing::sample;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn notify(config: MessagePusherNotificationConfig) -> Result<()> {
        tokio::task::spawn_blocking(move || config.notify(&sample()))
            .await
            .unwrap()
    }

    async fn push_server(push_path: &str, status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(push_path))
            .respond_with(ResponseTemplate::new(status).set_body_string("{\"success\":true}"))
            .expect(1)
            .mount(&server)
            .await;
        server
    }

    async fn pushed_body(server: &MockServer) -> serde_json::Value {
        let requests = server.received_requests().await.unwrap();
        serde_json::from_slice(&requests[0].body).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_push_payload() {
        let server = push_server("/push/admin", 200).await;
        let config = MessagePusherNotificationConfig::builder()
            .url(format!("{}/", server.uri()))
            .token("t0ken")
            .channel("ops".to_string())
            .build();
        notify(config).await.unwrap();

        let body = pushed_body(&server).await;
        assert_eq!(body["title"], "Database backup");
        assert_eq!(body["description"], "Backup partially succeeded");
        assert_eq!(body["token"], "t0ken");
        assert_eq!(body["channel"], "ops");

        let content = body["content"].as_str().unwrap();
        assert!(content.contains("- **postgresql**: s3:postgresql/20250314_020005.zip (1.5 KiB)"));
        assert!(content.contains("  - databases: app"));
        assert!(content.contains("- **postgresql/audit**:"));
        assert!(content.contains("- **redis**: upload failed: quota exceeded"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_channel_omitted_when_unset() {
        let server = push_server("/push/bot", 200).await;
        let config: MessagePusherNotificationConfig = serde_yml::from_str(&format!(
            "{{url: '{}', token: abc, username: bot}}",
            server.uri()
        ))
        .unwrap();
        notify(config).await.unwrap();

        let body = pushed_body(&server).await;
        assert!(body.get("channel").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rejected_push_is_an_error() {
        let server = push_server("/push/admin", 401).await;
        let config = MessagePusherNotificationConfig::builder()
            .url(server.uri())
            .token("wrong")
            .build();
        let err = notify(config).await.unwrap_err();
        assert!(matches!(
            err.root_cause(),
            Error::WebhookStatus { status: 401, .. }
        ));
    }

    #[test]
    fn test_token_required_and_redacted() {
        let config: MessagePusherNotificationConfig =
            serde_yml::from_str("{url: 'https://push.example.com', token: ''}").unwrap();
        assert!(config.validate().is_err());

        let config = MessagePusherNotificationConfig::builder()
            .url("https://push.example.com")
            .token("hunter2")
            .build();
        assert!(!format!("{config:?}").contains("hunter2"));
        assert!(!serde_yml::to_string(&config).unwrap().contains("hunter2"));
    }
}
