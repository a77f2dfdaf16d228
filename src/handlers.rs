use crate::db;
use crate::lifecycle::Lifecycle;
use crate::messages::{self, Templates};
use crate::prompts::{self, CallbackAction, MenuItem};
use anyhow::Result;
use std::sync::Arc;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use teloxide::types::User;
use teloxide::utils::command::BotCommands;
use tracing::{error, info, instrument, warn};

#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "lowercase", description = "Доступные команды:")]
pub enum Command {
    #[command(description = "регистрация и привязка телефона")]
    Start,
    #[command(description = "главное меню")]
    Menu,
    #[command(description = "справка")]
    Help,
}

/// Update routing: commands, shared contacts, inline button presses, menu
/// buttons, anything else.
pub fn schema() -> UpdateHandler<anyhow::Error> {
    dptree::entry()
        .branch(
            Update::filter_message()
                .filter_command::<Command>()
                .endpoint(command_handler),
        )
        .branch(
            Update::filter_message()
                .filter(|msg: Message| msg.contact().is_some())
                .endpoint(contact_handler),
        )
        .branch(Update::filter_callback_query().endpoint(callback_handler))
        .branch(
            Update::filter_message()
                .filter_map(|msg: Message| msg.text().and_then(MenuItem::from_label))
                .endpoint(menu_handler),
        )
        .branch(Update::filter_message().endpoint(fallback_handler))
}

async fn command_handler(
    bot: Bot,
    msg: Message,
    cmd: Command,
    lifecycle: Arc<Lifecycle>,
) -> Result<()> {
    if let Err(err) = handle_command(&bot, &lifecycle, &msg, cmd).await {
        report_failure(&bot, &lifecycle, msg.chat.id, &err).await;
    }
    Ok(())
}

async fn contact_handler(bot: Bot, msg: Message, lifecycle: Arc<Lifecycle>) -> Result<()> {
    if let Err(err) = handle_contact(&bot, &lifecycle, &msg).await {
        report_failure(&bot, &lifecycle, msg.chat.id, &err).await;
    }
    Ok(())
}

async fn callback_handler(bot: Bot, q: CallbackQuery, lifecycle: Arc<Lifecycle>) -> Result<()> {
    if let Err(err) = handle_callback(&bot, &lifecycle, &q).await {
        let chat_id = q
            .message
            .as_ref()
            .map(|m| m.chat.id)
            .unwrap_or(ChatId(q.from.id.0 as i64));
        report_failure(&bot, &lifecycle, chat_id, &err).await;
    }
    Ok(())
}

async fn menu_handler(
    bot: Bot,
    msg: Message,
    item: MenuItem,
    lifecycle: Arc<Lifecycle>,
) -> Result<()> {
    if let Err(err) = bot
        .send_message(msg.chat.id, menu_reply(lifecycle.templates(), item))
        .reply_markup(prompts::main_menu_keyboard())
        .await
    {
        warn!(?err, ?item, "failed to answer menu button");
    }
    Ok(())
}

/// Text sent for a main menu button.
pub fn menu_reply(templates: &Templates, item: MenuItem) -> String {
    match item {
        MenuItem::Book => messages::BOOKING_INFO.to_string(),
        MenuItem::Promotions => templates.promotions(),
        MenuItem::Prices => messages::PRICES.to_string(),
        MenuItem::Help => templates.help(),
        MenuItem::Contacts => templates.contacts(),
    }
}

async fn fallback_handler(bot: Bot, msg: Message, lifecycle: Arc<Lifecycle>) -> Result<()> {
    let _ = bot
        .send_message(msg.chat.id, lifecycle.templates().help())
        .await;
    Ok(())
}

async fn register(lifecycle: &Lifecycle, user: &User) -> Result<i64> {
    db::get_or_create_user(
        lifecycle.pool(),
        user.id.0 as i64,
        user.username.as_deref(),
        Some(user.first_name.as_str()),
        user.last_name.as_deref(),
    )
    .await
}

#[instrument(skip_all)]
async fn handle_command(bot: &Bot, lifecycle: &Lifecycle, msg: &Message, cmd: Command) -> Result<()> {
    match cmd {
        Command::Start => {
            let Some(user) = msg.from() else {
                return Ok(());
            };
            let user_id = register(lifecycle, user).await?;
            info!(user_id, "user started the bot");
            bot.send_message(msg.chat.id, lifecycle.templates().welcome(&user.first_name))
                .reply_markup(prompts::share_phone_keyboard())
                .await?;
        }
        Command::Menu => {
            bot.send_message(msg.chat.id, lifecycle.templates().menu())
                .reply_markup(prompts::main_menu_keyboard())
                .await?;
        }
        Command::Help => {
            bot.send_message(msg.chat.id, lifecycle.templates().help())
                .await?;
        }
    }
    Ok(())
}

#[instrument(skip_all)]
async fn handle_contact(bot: &Bot, lifecycle: &Lifecycle, msg: &Message) -> Result<()> {
    let (Some(user), Some(contact)) = (msg.from(), msg.contact()) else {
        return Ok(());
    };
    // only the sender's own number may be linked
    if contact.user_id != Some(user.id) {
        bot.send_message(msg.chat.id, messages::FOREIGN_CONTACT)
            .reply_markup(prompts::share_phone_keyboard())
            .await?;
        return Ok(());
    }
    let user_id = register(lifecycle, user).await?;
    let reply = match lifecycle
        .link_user_phone(user_id, &contact.phone_number)
        .await?
    {
        Some(linked) => messages::phone_saved(linked),
        None => messages::PHONE_UNREADABLE.to_string(),
    };
    bot.send_message(msg.chat.id, reply)
        .reply_markup(prompts::main_menu_keyboard())
        .await?;
    Ok(())
}

#[instrument(skip_all)]
async fn handle_callback(bot: &Bot, lifecycle: &Lifecycle, q: &CallbackQuery) -> Result<()> {
    if let Err(err) = bot.answer_callback_query(q.id.clone()).await {
        warn!(?err, "failed to answer callback query");
    }
    let Some(data) = q.data.as_deref() else {
        return Ok(());
    };
    let Some(reply) = resolve_callback(lifecycle, q.from.id.0 as i64, data).await? else {
        warn!(data, "unknown callback data");
        return Ok(());
    };
    match &q.message {
        Some(message) => {
            bot.edit_message_text(message.chat.id, message.id, reply)
                .await?;
        }
        None => {
            bot.send_message(ChatId(q.from.id.0 as i64), reply).await?;
        }
    }
    Ok(())
}

/// Apply a button press and return the text that replaces the prompt.
/// `None` for callback data this bot never issued.
pub async fn resolve_callback(
    lifecycle: &Lifecycle,
    telegram_id: i64,
    data: &str,
) -> Result<Option<String>> {
    let reply = match CallbackAction::parse(data) {
        Some(CallbackAction::Reminder {
            answer,
            appointment_id,
        }) => lifecycle
            .answer_reminder(telegram_id, answer, appointment_id)
            .await?
            .text()
            .to_string(),
        Some(CallbackAction::Survey {
            rating,
            appointment_id,
        }) => lifecycle
            .answer_survey(telegram_id, rating, appointment_id)
            .await?
            .text(),
        None => return Ok(None),
    };
    Ok(Some(reply))
}

/// Generic apology to the user plus a note to the admins.
async fn report_failure(bot: &Bot, lifecycle: &Lifecycle, chat_id: ChatId, err: &anyhow::Error) {
    error!(?err, "failed to handle update");
    if let Err(send_err) = bot.send_message(chat_id, messages::GENERIC_ERROR).await {
        warn!(?send_err, "failed to send error notice");
    }
    lifecycle
        .notify_admins(&format!("❌ Ошибка в боте: {err:#}"))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn templates() -> Templates {
        Templates::new("Uclinic", FixedOffset::east_opt(3 * 3600).unwrap())
    }

    #[test]
    fn menu_buttons_resolve_to_their_sections() {
        let t = templates();
        let reply = |label: &str| menu_reply(&t, MenuItem::from_label(label).unwrap());

        assert!(reply("📅 Записаться").starts_with("📅 Запись на приём"));
        assert!(reply("📋 Акции").contains("Акции и спецпредложения Uclinic"));
        assert!(reply("💰 Цены").contains("u-clinic.ru/price"));
        assert_eq!(reply("❓ Помощь"), t.help());
        assert!(reply("📞 Контакты").contains("Режим работы"));
    }

    #[test]
    fn menu_command_is_parsed() {
        assert!(matches!(
            Command::parse("/menu", "clinic_bot"),
            Ok(Command::Menu)
        ));
    }
}
