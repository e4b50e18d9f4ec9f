use crate::backup::notifications::message_pusher::MessagePusherNotificationConfig;
use crate::backup::notifications::smtp::SmtpNotificationConfig;
use crate::backup::notifications::webhook::WebhookNotificationConfig;
use crate::backup::result_error::result::Result;
use crate::backup::run_result::RunResult;
use derive_more::From;
use serde::{Deserialize, Serialize};
use std::result;
use validator::{Validate, ValidationErrors};

pub mod message_pusher;
pub mod smtp;
pub mod webhook;

#[derive(Clone, From, Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum NotificationConfig {
    Webhook(WebhookNotificationConfig),
    MessagePusher(MessagePusherNotificationConfig),
    Smtp(SmtpNotificationConfig),
}

impl Validate for NotificationConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            Self::Webhook(inner) => inner.validate(),
            Self::MessagePusher(inner) => inner.validate(),
            Self::Smtp(inner) => inner.validate(),
        }
    }
}

impl Notification for NotificationConfig {
    fn notify(&self, result: &RunResult) -> Result<()> {
        match self {
            Self::Webhook(inner) => inner.notify(result),
            Self::MessagePusher(inner) => inner.notify(result),
            Self::Smtp(inner) => inner.notify(result),
        }
    }
}

/// Delivers the outcome of a finished run. Called once per run, never retried.
pub trait Notification: Send + Sync {
    fn notify(&self, result: &RunResult) -> Result<()>;
}
