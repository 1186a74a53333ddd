//! SMTP email notifier for file-notifiable errors.

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{error, info, warn};

use tabload_core::{retry, LoadError, RetryPolicy};

/// Renders and sends the fixed failure-email template.
#[derive(Debug, Clone)]
pub struct EmailNotifier {
    smtp_host: Option<String>,
    smtp_port: u16,
    smtp_user: Option<String>,
    smtp_password: Option<String>,
    from_email: Option<String>,
    data_team_email: Option<String>,
    policy: RetryPolicy,
}

impl EmailNotifier {
    pub fn new(
        smtp_host: Option<String>,
        smtp_port: u16,
        smtp_user: Option<String>,
        smtp_password: Option<String>,
        from_email: Option<String>,
        data_team_email: Option<String>,
    ) -> Self {
        Self {
            smtp_host,
            smtp_port,
            smtp_user,
            smtp_password,
            from_email,
            data_team_email,
            policy: RetryPolicy::default(),
        }
    }

    /// Send the failure notification for one file. Returns whether a
    /// message was actually delivered; an unconfigured transport or a
    /// non-notifiable error is a no-op.
    pub async fn notify_failure(
        &self,
        source_filename: &str,
        error: &LoadError,
        log_id: Option<i64>,
        recipients: &[String],
    ) -> bool {
        let Some(body) = error.email_body() else {
            return false;
        };
        let Some(host) = &self.smtp_host else {
            warn!("SMTP_HOST not configured, skipping email notification");
            return false;
        };
        let Some(from) = &self.from_email else {
            warn!("FROM_EMAIL not configured, skipping email notification");
            return false;
        };
        if recipients.is_empty() {
            return false;
        }

        let message = match self.build_message(from, recipients, source_filename, error, log_id, &body) {
            Ok(message) => message,
            Err(e) => {
                error!(file = source_filename, error = %e, "could not build notification email");
                return false;
            }
        };
        let transport = match self.build_transport(host) {
            Ok(transport) => transport,
            Err(e) => {
                error!(error = %e, "could not build smtp transport");
                return false;
            }
        };

        let outcome = retry(self.policy, "email notification", || {
            let transport = transport.clone();
            let message = message.clone();
            async move {
                transport
                    .send(message)
                    .await
                    .map_err(|e| LoadError::storage("sending notification email", e))
            }
        })
        .await;

        match outcome {
            Ok(_) => {
                info!(
                    file = source_filename,
                    recipients = recipients.len(),
                    "sent failure notification email"
                );
                true
            }
            Err(e) => {
                error!(file = source_filename, error = %e, "failed to send notification email after retries");
                false
            }
        }
    }

    fn build_message(
        &self,
        from: &str,
        recipients: &[String],
        source_filename: &str,
        error: &LoadError,
        log_id: Option<i64>,
        body: &str,
    ) -> Result<Message, LoadError> {
        let subject = format!(
            "FileLoader Failed: {source_filename} - {}",
            error.display_kind()
        );
        let log_ref = match log_id {
            Some(id) => id.to_string(),
            None => "N/A".to_string(),
        };
        let mut text = format!(
            "File Processing Failure Notification\n\n\
             File: {source_filename}\n\
             Error Type: {}\n\
             Log ID: {log_ref}\n\n\
             Error Details:\n{body}",
            error.display_kind()
        );
        if let Some(id) = log_id {
            text.push_str(&format!(
                "\n\nData Team can reference log_id={id} for more details."
            ));
        }

        let mut builder = Message::builder()
            .from(from.parse().map_err(|e| {
                LoadError::Config(format!("invalid FROM_EMAIL address {from}: {e}"))
            })?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN);
        for recipient in recipients {
            builder = builder.to(recipient.parse().map_err(|e| {
                LoadError::Config(format!("invalid recipient address {recipient}: {e}"))
            })?);
        }
        if let Some(cc) = &self.data_team_email {
            builder = builder.cc(cc.parse().map_err(|e| {
                LoadError::Config(format!("invalid DATA_TEAM_EMAIL address {cc}: {e}"))
            })?);
        }
        builder
            .body(text)
            .map_err(|e| LoadError::Config(format!("could not build email: {e}")))
    }

    /// SMTPS on port 465, STARTTLS with credentials otherwise, plain
    /// submission when no credentials are configured.
    fn build_transport(
        &self,
        host: &str,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, LoadError> {
        let credentials = match (&self.smtp_user, &self.smtp_password) {
            (Some(user), Some(password)) => {
                Some(Credentials::new(user.clone(), password.clone()))
            }
            _ => None,
        };
        let builder = if self.smtp_port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .map_err(|e| LoadError::Config(format!("invalid smtp relay {host}: {e}")))?
        } else if credentials.is_some() {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|e| LoadError::Config(format!("invalid smtp relay {host}: {e}")))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        };
        let builder = builder.port(self.smtp_port);
        let builder = match credentials {
            Some(credentials) => builder.credentials(credentials),
            None => builder,
        };
        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_transport_is_a_quiet_no_op() {
        let notifier = EmailNotifier::new(None, 587, None, None, None, None);
        let delivered = notifier
            .notify_failure(
                "sales.csv",
                &LoadError::MissingHeader {
                    source_filename: "sales.csv".into(),
                },
                Some(1),
                &["team@example.com".into()],
            )
            .await;
        assert!(!delivered);
    }

    #[tokio::test]
    async fn non_notifiable_errors_produce_no_email() {
        let notifier = EmailNotifier::new(
            Some("smtp.example.com".into()),
            587,
            None,
            None,
            Some("loader@example.com".into()),
            None,
        );
        let delivered = notifier
            .notify_failure(
                "sales.csv",
                &LoadError::storage("read", "timeout"),
                Some(1),
                &["team@example.com".into()],
            )
            .await;
        assert!(!delivered);
    }
}
