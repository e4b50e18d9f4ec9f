use crate::backup::function_path;
use crate::backup::notifications::Notification;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::run_result::{format_size, RunResult};
use crate::backup::validate::validate_http_url;
use bon::Builder;
use function_name::named;
use getset::{CopyGetters, Getters};
use humantime_serde::re::humantime::format_duration;
use reqwest::blocking::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::time::Duration;
use validator::Validate;

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum HttpMethod {
    #[default]
    #[serde(rename = "POST", alias = "post")]
    Post,
    #[serde(rename = "GET", alias = "get")]
    Get,
}

/// Generic HTTP endpoint receiving the run summary.
///
/// `POST` sends the full JSON payload, `GET` sends the headline fields as
/// query parameters.
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters, CopyGetters)]
#[serde(deny_unknown_fields)]
pub struct WebhookNotificationConfig {
    #[validate(custom(function = validate_http_url))]
    #[builder(into)]
    #[getset(get = "pub")]
    url: String,
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub")]
    method: HttpMethod,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    #[builder(default = default_timeout())]
    #[getset(get_copy = "pub")]
    timeout: Duration,
}

#[skip_serializing_none]
#[derive(Serialize, Debug)]
pub(crate) struct WebhookPayload {
    status: &'static str,
    start_time: String,
    end_time: String,
    duration: String,
    adapters: Vec<AdapterPayload>,
}

#[skip_serializing_none]
#[derive(Serialize, Debug)]
struct AdapterPayload {
    kind: String,
    succeeded: Vec<String>,
    failed: Vec<FailurePayload>,
    archive: Option<String>,
    archive_size: Option<String>,
    stage_failure: Option<String>,
    retention_deleted: Vec<String>,
}

#[derive(Serialize, Debug)]
struct FailurePayload {
    database: String,
    reason: &'static str,
    error: String,
}

impl WebhookPayload {
    pub(crate) fn from_result(result: &RunResult) -> Self {
        Self {
            status: result.status(),
            start_time: result.started_at.to_rfc3339(),
            end_time: result.finished_at.to_rfc3339(),
            duration: format_duration(Duration::from_secs(result.duration().as_secs()))
                .to_string(),
            adapters: result
                .adapters
                .iter()
                .map(|a| AdapterPayload {
                    kind: a.kind.clone(),
                    succeeded: a
                        .databases
                        .iter()
                        .filter(|d| d.is_success())
                        .map(|d| d.name.clone())
                        .collect(),
                    failed: a
                        .databases
                        .iter()
                        .filter_map(|d| {
                            d.outcome.as_ref().err().map(|e| FailurePayload {
                                database: d.name.clone(),
                                reason: e.label(),
                                error: e.to_string(),
                            })
                        })
                        .collect(),
                    archive: a.archive.as_ref().map(|r| r.remote_path.clone()),
                    archive_size: a.archive.as_ref().map(|r| format_size(r.size)),
                    stage_failure: a
                        .stage_failure
                        .as_ref()
                        .map(|f| format!("{} failed: {}", f.stage, f.message)),
                    retention_deleted: a.retention_deleted.clone(),
                })
                .collect(),
        }
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        let succeeded: usize = self.adapters.iter().map(|a| a.succeeded.len()).sum();
        let failed: usize = self.adapters.iter().map(|a| a.failed.len()).sum();
        vec![
            ("status", self.status.to_string()),
            ("start_time", self.start_time.clone()),
            ("end_time", self.end_time.clone()),
            ("duration", self.duration.clone()),
            ("succeeded", succeeded.to_string()),
            ("failed", failed.to_string()),
        ]
    }
}

/// Turns a non 2xx answer into [`Error::WebhookStatus`].
pub(crate) fn check_status(url: &str, response: Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        tracing::info!("Notification accepted by {url} with {status}");
        Ok(())
    } else {
        let body = response.text().unwrap_or_default();
        Err(Error::webhook_status(url, status.as_u16(), body))
    }
}

impl Notification for WebhookNotificationConfig {
    #[named]
    fn notify(&self, result: &RunResult) -> Result<()> {
        tracing::info!("Sending webhook notification to {}", self.url);
        let payload = WebhookPayload::from_result(result);
        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(Error::from)
            .add_fn_name(function_path!())?;

        let request = match self.method {
            HttpMethod::Post => client.post(&self.url).json(&payload),
            HttpMethod::Get => client.get(&self.url).query(&payload.query()),
        };
        request
            .send()
            .map_err(Error::from)
            .and_then(|response| check_status(&self.url, response))
            .add_msg(format!("Webhook notification to {} failed", self.url))
            .add_fn_name(function_path!())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::run_result::testing::sample;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn notify(config: WebhookNotificationConfig) -> Result<()> {
        tokio::task::spawn_blocking(move || config.notify(&sample()))
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_post_sends_json_summary() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let config = WebhookNotificationConfig::builder()
            .url(format!("{}/hook", server.uri()))
            .build();
        notify(config).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["status"], "partial_success");
        assert_eq!(body["duration"], "1m 5s");
        let pg = &body["adapters"][0];
        assert_eq!(pg["kind"], "postgresql");
        assert_eq!(pg["succeeded"], serde_json::json!(["app"]));
        assert_eq!(pg["failed"][0]["database"], "audit");
        assert_eq!(pg["failed"][0]["reason"], "engine");
        assert_eq!(pg["archive"], "s3:postgresql/20250314_020005.zip");
        assert!(pg.get("stage_failure").is_none());
        assert_eq!(body["adapters"][1]["stage_failure"], "upload failed: quota exceeded");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_get_sends_query_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .and(query_param("status", "partial_success"))
            .and(query_param("succeeded", "1"))
            .and(query_param("failed", "1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let config: WebhookNotificationConfig =
            serde_yml::from_str(&format!("{{url: '{}/ping', method: get}}", server.uri())).unwrap();
        notify(config).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert!(requests[0].body.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_non_2xx_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("exploded"))
            .expect(1)
            .mount(&server)
            .await;

        let config = WebhookNotificationConfig::builder().url(server.uri()).build();
        let err = notify(config).await.unwrap_err();
        match err.root_cause() {
            Error::WebhookStatus { status, body, .. } => {
                assert_eq!(*status, 500);
                assert_eq!(body, "exploded");
            }
            e => panic!("unexpected {e:?}"),
        }
    }

    #[test]
    fn test_validation() {
        let config: WebhookNotificationConfig =
            serde_yml::from_str("url: https://hooks.example.com/x").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.method(), HttpMethod::Post);
        assert_eq!(config.timeout(), Duration::from_secs(30));

        let config: WebhookNotificationConfig = serde_yml::from_str("url: not a url").unwrap();
        assert!(config.validate().is_err());
    }
}
