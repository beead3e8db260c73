use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::messaging::{HandlerError, MessageHandler};
use crate::metrics::Metrics;
use crate::topics::Topic;
use crate::utils::{retry_on_transient, IsTransient, RetryConfig, RetryResult};

// ============================================================================
// Notification Dispatch
// ============================================================================
//
// Consumes notification topics and sends one email per delivery. There is no
// dedupe ledger: a redelivered message sends its email again (at-least-once
// side effect). Transient send failures are retried in-process first, then
// surface as transient handler errors so the broker redelivers a bounded
// number of times.
//
//   AUTH_NOTIFICATION_USER_CREATED          → Registration Successful
//   PAYMENT_NOTIFICATION.PAYMENT_INITIATED  → Payment Initiated
//   PAYMENT_NOTIFICATION.PAYMENT_COMPLETED  → Payment Successful
//   PAYMENT_NOTIFICATION.PAYMENT_FAILED     → Payment Failed
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmailError {
    #[error("email relay unavailable: {0}")]
    Unavailable(String),

    #[error("email rejected: {0}")]
    Rejected(String),
}

impl IsTransient for EmailError {
    fn is_transient(&self) -> bool {
        matches!(self, EmailError::Unavailable(_))
    }
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, email: &Email) -> Result<(), EmailError>;
}

/// Writes emails to the log instead of sending them.
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, email: &Email) -> Result<(), EmailError> {
        tracing::info!(to = %email.to, subject = %email.subject, "📧 Email (log only)");
        tracing::debug!(html = %email.html, "Email body");
        Ok(())
    }
}

/// Posts emails as JSON to an HTTP mail relay.
pub struct HttpEmailSender {
    endpoint: String,
    from: String,
    http: reqwest::Client,
}

impl HttpEmailSender {
    pub fn new(endpoint: impl Into<String>, from: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            endpoint: endpoint.into(),
            from: from.into(),
            http: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    async fn send(&self, email: &Email) -> Result<(), EmailError> {
        let payload = serde_json::json!({
            "from": self.from,
            "to": email.to,
            "subject": email.subject,
            "html": email.html,
        });

        let resp = self
            .http
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| EmailError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        tracing::warn!(status = %status, body = %body, "Mail relay returned non-success");
        if status.is_server_error() || status.as_u16() == 429 {
            Err(EmailError::Unavailable(format!("relay returned {}", status)))
        } else {
            Err(EmailError::Rejected(format!("relay returned {}", status)))
        }
    }
}

// ============================================================================
// Payloads and templates
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
struct Recipient {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    firstname: String,
    #[serde(default)]
    lastname: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentNotice {
    #[serde(flatten)]
    recipient: Recipient,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    amount: Option<f64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

/// Build the email for a notification topic from its JSON body.
pub fn render(topic: Topic, body: &[u8]) -> Result<Email, HandlerError> {
    match topic {
        Topic::NotificationUserCreated => {
            let recipient: Recipient = parse(body)?;
            let html = format!(
                "<h1>Registration Successful</h1>\n\
                 <p>Dear {} {},</p>\n\
                 <p>Thank you for registering with our service.</p>\n\
                 <p>Best regards</p>\n\
                 <p>Team</p>",
                escape(&recipient.firstname),
                escape(&recipient.lastname),
            );
            email_for(recipient, "Registration Successful", html)
        }
        Topic::NotificationPaymentInitiated => payment_email(
            parse(body)?,
            "Payment Initiated",
            "We have initiated your payment of",
            |notice| notice.title.as_deref(),
        ),
        Topic::NotificationPaymentCompleted => payment_email(
            parse(body)?,
            "Payment Successful",
            "We have received your payment of",
            |notice| notice.title.as_deref(),
        ),
        Topic::NotificationPaymentFailed => payment_email(
            parse(body)?,
            "Payment Failed",
            "We have failed to receive your payment of",
            |notice| notice.order_id.as_deref(),
        ),
        other => Err(HandlerError::Permanent(format!("topic {} has no email template", other))),
    }
}

fn parse<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, HandlerError> {
    serde_json::from_slice(body).map_err(|e| HandlerError::Malformed(e.to_string()))
}

fn payment_email(
    notice: PaymentNotice,
    subject: &str,
    lead: &str,
    order_label: impl Fn(&PaymentNotice) -> Option<&str>,
) -> Result<Email, HandlerError> {
    let amount = notice.amount.map(|a| a.to_string()).unwrap_or_default();
    let html = format!(
        "<h1>{subject}</h1>\n\
         <p>Dear {} {},</p>\n\
         <p>{lead} {} {} for order {}</p>\n\
         <p>Best regards</p>\n\
         <p>Team</p>",
        escape(&notice.recipient.firstname),
        escape(&notice.recipient.lastname),
        escape(&amount),
        escape(notice.currency.as_deref().unwrap_or("")),
        escape(order_label(&notice).unwrap_or("")),
    );
    email_for(notice.recipient, subject, html)
}

fn email_for(recipient: Recipient, subject: &str, html: String) -> Result<Email, HandlerError> {
    let to = recipient
        .email
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .ok_or_else(|| HandlerError::Malformed("missing recipient email".to_string()))?;

    if !is_plausible_address(&to) {
        return Err(HandlerError::Permanent(format!("invalid recipient `{}`", to)));
    }

    Ok(Email {
        to,
        subject: subject.to_string(),
        html,
    })
}

fn is_plausible_address(address: &str) -> bool {
    match address.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !address.contains(char::is_whitespace),
        None => false,
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

// ============================================================================
// Dispatcher
// ============================================================================

pub struct NotificationDispatcher {
    sender: Arc<dyn EmailSender>,
    retry: RetryConfig,
    metrics: Option<Arc<Metrics>>,
}

impl NotificationDispatcher {
    pub fn new(sender: Arc<dyn EmailSender>, retry: RetryConfig) -> Self {
        Self {
            sender,
            retry,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn record(&self, subject: &str, sent: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_email(subject, sent);
        }
    }
}

#[async_trait]
impl MessageHandler for NotificationDispatcher {
    async fn handle(&self, topic: Topic, body: &[u8]) -> Result<(), HandlerError> {
        let email = render(topic, body)?;

        let sender = self.sender.clone();
        let result = retry_on_transient(self.retry.clone(), |_| {
            let sender = sender.clone();
            let email = email.clone();
            async move { sender.send(&email).await }
        })
        .await;

        match result {
            RetryResult::Success(()) => {
                tracing::info!(topic = %topic, to = %email.to, subject = %email.subject, "📧 Notification sent");
                self.record(&email.subject, true);
                Ok(())
            }
            RetryResult::Failed(e) => {
                self.record(&email.subject, false);
                Err(HandlerError::Transient(e.to_string()))
            }
            RetryResult::PermanentFailure(e) => {
                self.record(&email.subject, false);
                Err(HandlerError::Permanent(e.to_string()))
            }
        }
    }
}
