//! Outbound chat messages.
use crate::prompts;
use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::ChatId;
use tracing::debug;

/// Interactive options attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt {
    ReminderChoice { appointment_id: i64 },
    SurveyRating { appointment_id: i64 },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str, prompt: Option<Prompt>) -> Result<()>;
}

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
    async fn send(&self, chat_id: i64, text: &str, prompt: Option<Prompt>) -> Result<()> {
        let request = self.bot.send_message(ChatId(chat_id), text);
        match prompt {
            Some(prompt) => request.reply_markup(prompts::keyboard_for(prompt)).await,
            None => request.await,
        }
        .with_context(|| format!("failed to send message to chat {chat_id}"))?;
        debug!(chat_id, ?prompt, "message sent");
        Ok(())
    }
}
