use crate::backup::function_path;
use crate::backup::notifications::Notification;
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::run_result::RunResult;
use bon::Builder;
use function_name::named;
use getset::Getters;
use itertools::Itertools;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Plain-text summary mail after every run.
///
/// Credentials are kept in `RedactedString` so they never show up in logs.
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct SmtpNotificationConfig {
    /// `host` or `host:port`
    #[builder(into)]
    host: String,
    #[builder(into)]
    smtp_mode: SmtpMode,
    #[builder(into)]
    from: Mailbox,
    #[validate(length(min = 1))]
    #[builder(into)]
    to: Vec<Mailbox>,
    #[builder(into)]
    username: String,
    #[builder(into)]
    password: RedactedString,
}

/// - `Unsecured`: plain text, for relays on a trusted network
/// - `Ssl`: TLS from the first byte
/// - `StartTls`: plain text upgraded to TLS
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SmtpMode {
    Unsecured,
    Ssl,
    StartTls,
}

impl SmtpNotificationConfig {
    fn transport(&self) -> Result<SmtpTransport> {
        let (host, port) = match self.host.rsplit_once(':') {
            Some((h, p)) => match p.parse::<u16>() {
                Ok(port) => (h, Some(port)),
                Err(_) => (self.host.as_str(), None),
            },
            None => (self.host.as_str(), None),
        };

        let builder = match self.smtp_mode {
            SmtpMode::Unsecured => Ok(SmtpTransport::builder_dangerous(host)),
            SmtpMode::Ssl => SmtpTransport::relay(host),
            SmtpMode::StartTls => SmtpTransport::starttls_relay(host),
        }
        .map_err(Error::from)
        .add_msg(format!(
            "Failed to build smtp client for host: {:?} with mode {:?}",
            self.host, self.smtp_mode
        ))?;

        let builder = match port {
            Some(port) => builder.port(port),
            None => builder,
        };
        let creds = Credentials::new(self.username.clone(), self.password.inner().to_string());
        Ok(builder.credentials(creds).build())
    }

    fn message(&self, result: &RunResult) -> Result<Message> {
        self.to
            .iter()
            .fold(Message::builder(), |email, send_to| {
                email.to(send_to.clone())
            })
            .from(self.from.clone())
            .subject(result.title())
            .header(ContentType::TEXT_PLAIN)
            .body(result.to_string())
            .map_err(Error::from)
            .add_msg(format!(
                "Fail to build notification email from {:?} to {:?}",
                self.from, self.to
            ))
    }
}

impl Notification for SmtpNotificationConfig {
    #[named]
    fn notify(&self, result: &RunResult) -> Result<()> {
        tracing::info!(
            "Started smtp email notification from {:?} to {:?}",
            self.from,
            self.to
        );
        let email = self.message(result).add_fn_name(function_path!())?;

        let mailer = self.transport().add_fn_name(function_path!())?;

        tracing::info!("Sending email...");
        let response = mailer
            .send(&email)
            .map_err(Error::from)
            .add_fn_name(function_path!())?;
        if response.is_positive() {
            Ok(())
        } else {
            let error_vec = response
                .message()
                .map(|m| Error::smtp_send_error(m.to_owned()))
                .collect_vec();
            Err(Error::lots_of_error(error_vec))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::run_result::testing::sample;

    fn config(host: String, to: Vec<Mailbox>) -> SmtpNotificationConfig {
        SmtpNotificationConfig::builder()
            .host(host)
            .smtp_mode(SmtpMode::Unsecured)
            .from("backup@example.com".parse::<Mailbox>().unwrap())
            .to(to)
            .username("backup")
            .password("testpass")
            .build()
    }

    #[test]
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    fn test_smtp_notification_send() {
        let server = maik::MockServer::builder()
            .no_verify_credentials()
            .assert_after_n_emails(1)
            .build();
        server.start();
        let config = config(
            format!("{}:{}", server.host(), server.port()),
            vec!["ops@example.com".parse::<Mailbox>().unwrap()],
        );

        let result = config.notify(&sample());
        assert!(result.is_ok(), "{result:?}");

        let assertion = maik::MailAssertion::new()
            .sender_is("backup@example.com")
            .recipients_are(["ops@example.com"]);
        assert!(server.assert(assertion));
    }

    #[test]
    fn test_message_carries_run_title_and_summary() {
        let config = config(
            "smtp.example.com".into(),
            vec![
                "ops@example.com".parse::<Mailbox>().unwrap(),
                "dba@example.com".parse::<Mailbox>().unwrap(),
            ],
        );
        let result = sample();
        let message = config.message(&result).unwrap();
        let formatted = String::from_utf8(message.formatted()).unwrap();

        assert!(formatted.contains(&format!("Subject: {}", result.title())));
        assert!(formatted.contains("To: ops@example.com, dba@example.com"));
        assert!(formatted.contains("Content-Type: text/plain"));
        assert!(formatted.contains("postgresql: 1 succeeded, 1 failed"));
    }

    #[test]
    fn test_unreachable_server_is_an_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = config(
            format!("127.0.0.1:{port}"),
            vec!["ops@example.com".parse::<Mailbox>().unwrap()],
        );
        assert!(config.notify(&sample()).is_err());
    }

    #[test]
    fn test_smtp_notification_validation() {
        let valid = config(
            "smtp.example.com".into(),
            vec!["ops@example.com".parse::<Mailbox>().unwrap()],
        );
        assert!(valid.validate().is_ok());
        assert!(!format!("{valid:?}").contains("testpass"));

        let invalid = config("smtp.example.com".into(), vec![]);
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_smtp_mode_serialization() {
        for (mode, expected) in [
            (SmtpMode::Unsecured, "\"Unsecured\""),
            (SmtpMode::Ssl, "\"Ssl\""),
            (SmtpMode::StartTls, "\"StartTls\""),
        ] {
            let serialized = serde_json::to_string(&mode).unwrap();
            assert_eq!(serialized, expected);
            let deserialized: SmtpMode = serde_json::from_str(&serialized).unwrap();
            assert_eq!(deserialized, mode);
        }
    }
}
