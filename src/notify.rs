//! Outbound notifications to the chat front end.
use anyhow::Result;
use async_trait::async_trait;
use teloxide::prelude::*;
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    ReloginRequired {
        pairing_id: i64,
        source: String,
        destination: String,
    },
    SustainedFailure {
        pairing_id: i64,
        source: String,
        failures: u32,
        last_error: String,
    },
    AutoPaused {
        pairing_id: i64,
        source: String,
        failures: u32,
    },
}

impl Notification {
    pub fn text(&self) -> String {
        match self {
            Notification::ReloginRequired {
                pairing_id,
                source,
                destination,
            } => format!(
                "Login expired for pairing #{} ({} -> {}). Reposting is suspended until you log in again.",
                pairing_id, source, destination
            ),
            Notification::SustainedFailure {
                pairing_id,
                source,
                failures,
                last_error,
            } => format!(
                "Reposting from {} (pairing #{}) has failed {} times in a row. Last error: {}",
                source, pairing_id, failures, last_error
            ),
            Notification::AutoPaused {
                pairing_id,
                source,
                failures,
            } => format!(
                "Pairing #{} ({}) was paused after {} consecutive failures. Resume it once the account is healthy.",
                pairing_id, source, failures
            ),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `notification` to the chat of `tg_user_id`.
    async fn notify(&self, tg_user_id: i64, notification: Notification) -> Result<()>;
}

/// Sends notifications as plain Telegram messages.
#[derive(Clone)]
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    #[instrument(skip(self, notification))]
    async fn notify(&self, tg_user_id: i64, notification: Notification) -> Result<()> {
        self.bot
            .send_message(ChatId(tg_user_id), notification.text())
            .await?;
        Ok(())
    }
}
