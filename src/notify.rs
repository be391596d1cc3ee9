//! Run notifications by email through the SendGrid v3 API.
//!
//! Sending is best effort: a missing API key or recipient disables it, and
//! delivery failures are logged without failing the run.

use crate::config::EmailConfig;
use crate::error::EtlError;
use crate::scrapers::Source;
use chrono::NaiveDate;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

const SENDGRID_URL: &str = "https://api.sendgrid.com/v3";

/// Subject and plain-text body of one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub body: String,
}

impl Message {
    /// Summary of a single-day run.
    pub fn daily(source: Source, day: NaiveDate, documents: usize, store: &str) -> Self {
        Self {
            subject: format!("[{}] Daily ETL executed", source.name()),
            body: format!(
                "Daily ETL executed\n- Date: {day}\n- Documents loaded: {documents}\n- Database used: {store}\n"
            ),
        }
    }

    /// Summary of a date-range load.
    pub fn range(source: Source, start: NaiveDate, end: NaiveDate, documents: usize, store: &str) -> Self {
        Self {
            subject: format!("[{}] Load ETL executed", source.name()),
            body: format!(
                "Load ETL executed\n- Date start: {start}\n- Date end: {end}\n- Documents loaded: {documents}\n- Database used: {store}\n"
            ),
        }
    }
}

#[derive(Serialize)]
struct Address<'a> {
    email: &'a str,
}

#[derive(Serialize)]
struct Personalization<'a> {
    to: [Address<'a>; 1],
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    value: &'a str,
}

#[derive(Serialize)]
struct MailRequest<'a> {
    personalizations: [Personalization<'a>; 1],
    from: Address<'a>,
    subject: &'a str,
    content: [Content<'a>; 1],
}

#[derive(Debug, Clone)]
pub struct Notifier {
    client: reqwest::Client,
    base_url: String,
    admin_email: Option<String>,
    api_key: Option<String>,
}

impl Notifier {
    pub fn new(config: &EmailConfig) -> Result<Self, EtlError> {
        Self::with_base_url(config, SENDGRID_URL)
    }

    pub fn with_base_url(config: &EmailConfig, base_url: &str) -> Result<Self, EtlError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| EtlError::Config(format!("cannot build SendGrid client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            admin_email: config.admin_email.clone(),
            api_key: config.sendgrid_api_key.clone(),
        })
    }

    /// Mail `message` to the admin address, from that same address.
    /// Returns whether SendGrid accepted it.
    #[instrument(level = "info", skip_all, fields(subject = %message.subject))]
    pub async fn send(&self, message: &Message) -> bool {
        let (Some(admin), Some(key)) = (&self.admin_email, &self.api_key) else {
            warn!("Email notification disabled: admin_email or SendGrid API key not set");
            return false;
        };

        let request = MailRequest {
            personalizations: [Personalization {
                to: [Address { email: admin }],
            }],
            from: Address { email: admin },
            subject: &message.subject,
            content: [Content {
                kind: "text/plain",
                value: &message.body,
            }],
        };
        let url = format!("{}/mail/send", self.base_url);
        match self.client.post(&url).bearer_auth(key).json(&request).send().await {
            Ok(response) if response.status().is_success() => {
                info!(status = %response.status(), "Notification sent");
                true
            }
            Ok(response) => {
                error!(status = %response.status(), "SendGrid rejected the notification");
                false
            }
            Err(e) => {
                error!(error = %e, "Failed to send notification");
                false
            }
        }
    }
}
