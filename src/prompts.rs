//! Keyboards: inline prompts with their callback data, plus the reply menus.
//!
//! Buttons carry the appointment id (`reminder_confirm:42`, `survey_5:42`).
//! The id-less forms are still accepted for buttons sent by older releases.
use crate::model::ReminderAnswer;
use crate::notify::Prompt;
use once_cell::sync::Lazy;
use regex::Regex;
use teloxide::types::{
    ButtonRequest, InlineKeyboardButton, InlineKeyboardMarkup, KeyboardButton, KeyboardMarkup,
};

static REMINDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^reminder_(confirm|cancel)(?::(\d+))?$").expect("valid reminder callback regex")
});
static SURVEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^survey_([1-5])(?::(\d+))?$").expect("valid survey callback regex")
});

pub const SHARE_PHONE_LABEL: &str = "📱 Поделиться номером телефона";

/// Buttons of the main reply keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuItem {
    Book,
    Promotions,
    Prices,
    Help,
    Contacts,
}

impl MenuItem {
    const ROWS: [&'static [MenuItem]; 3] = [
        &[MenuItem::Book],
        &[MenuItem::Promotions, MenuItem::Prices],
        &[MenuItem::Help, MenuItem::Contacts],
    ];

    pub fn label(self) -> &'static str {
        match self {
            MenuItem::Book => "📅 Записаться",
            MenuItem::Promotions => "📋 Акции",
            MenuItem::Prices => "💰 Цены",
            MenuItem::Help => "❓ Помощь",
            MenuItem::Contacts => "📞 Контакты",
        }
    }

    /// Menu item for a text message, if it is one of the button labels.
    pub fn from_label(text: &str) -> Option<Self> {
        let text = text.trim();
        Self::ROWS
            .iter()
            .flat_map(|row| row.iter().copied())
            .find(|item| item.label() == text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Reminder {
        answer: ReminderAnswer,
        appointment_id: Option<i64>,
    },
    Survey {
        rating: u8,
        appointment_id: Option<i64>,
    },
}

impl CallbackAction {
    pub fn parse(data: &str) -> Option<Self> {
        if let Some(caps) = REMINDER_RE.captures(data) {
            let answer = match &caps[1] {
                "confirm" => ReminderAnswer::Confirmed,
                _ => ReminderAnswer::Cancelled,
            };
            return Some(CallbackAction::Reminder {
                answer,
                appointment_id: caps.get(2).and_then(|m| m.as_str().parse().ok()),
            });
        }
        let caps = SURVEY_RE.captures(data)?;
        Some(CallbackAction::Survey {
            rating: caps[1].parse().ok()?,
            appointment_id: caps.get(2).and_then(|m| m.as_str().parse().ok()),
        })
    }
}

pub fn reminder_data(answer: ReminderAnswer, appointment_id: i64) -> String {
    let choice = match answer {
        ReminderAnswer::Cancelled => "cancel",
        _ => "confirm",
    };
    format!("reminder_{choice}:{appointment_id}")
}

pub fn survey_data(rating: u8, appointment_id: i64) -> String {
    format!("survey_{rating}:{appointment_id}")
}

pub fn reminder_keyboard(appointment_id: i64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback(
            "✅ Да, приду",
            reminder_data(ReminderAnswer::Confirmed, appointment_id),
        ),
        InlineKeyboardButton::callback(
            "❌ Нет, не получается",
            reminder_data(ReminderAnswer::Cancelled, appointment_id),
        ),
    ]])
}

pub fn survey_keyboard(appointment_id: i64) -> InlineKeyboardMarkup {
    let row = (1..=5u8)
        .map(|rating| {
            let label = if rating == 5 {
                "5 ⭐".to_string()
            } else {
                rating.to_string()
            };
            InlineKeyboardButton::callback(label, survey_data(rating, appointment_id))
        })
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(vec![row])
}

pub fn keyboard_for(prompt: Prompt) -> InlineKeyboardMarkup {
    match prompt {
        Prompt::ReminderChoice { appointment_id } => reminder_keyboard(appointment_id),
        Prompt::SurveyRating { appointment_id } => survey_keyboard(appointment_id),
    }
}

/// Reply keyboard asking the user to share their own contact.
pub fn share_phone_keyboard() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![vec![
        KeyboardButton::new(SHARE_PHONE_LABEL).request(ButtonRequest::Contact)
    ]])
}

pub fn main_menu_keyboard() -> KeyboardMarkup {
    KeyboardMarkup::new(MenuItem::ROWS.iter().map(|row| {
        row.iter()
            .map(|item| KeyboardButton::new(item.label()))
            .collect::<Vec<_>>()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use teloxide::types::InlineKeyboardButtonKind;

    fn callback_payloads(markup: &InlineKeyboardMarkup) -> Vec<String> {
        markup
            .inline_keyboard
            .iter()
            .flatten()
            .filter_map(|b| match &b.kind {
                InlineKeyboardButtonKind::CallbackData(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn parses_callback_data_with_and_without_appointment() {
        assert_eq!(
            CallbackAction::parse("reminder_confirm:42"),
            Some(CallbackAction::Reminder {
                answer: ReminderAnswer::Confirmed,
                appointment_id: Some(42)
            })
        );
        assert_eq!(
            CallbackAction::parse("reminder_cancel"),
            Some(CallbackAction::Reminder {
                answer: ReminderAnswer::Cancelled,
                appointment_id: None
            })
        );
        assert_eq!(
            CallbackAction::parse("survey_5:7"),
            Some(CallbackAction::Survey {
                rating: 5,
                appointment_id: Some(7)
            })
        );
        assert_eq!(
            CallbackAction::parse("survey_3"),
            Some(CallbackAction::Survey {
                rating: 3,
                appointment_id: None
            })
        );
    }

    #[test]
    fn rejects_unknown_callback_data() {
        assert_eq!(CallbackAction::parse("survey_6:1"), None);
        assert_eq!(CallbackAction::parse("survey_0"), None);
        assert_eq!(CallbackAction::parse("reminder_maybe:1"), None);
        assert_eq!(CallbackAction::parse("reminder_confirm:abc"), None);
    }

    #[test]
    fn every_menu_button_maps_back_to_its_item() {
        let markup = main_menu_keyboard();
        let labels: Vec<&str> = markup
            .keyboard
            .iter()
            .flatten()
            .map(|b| b.text.as_str())
            .collect();
        assert_eq!(
            labels,
            vec!["📅 Записаться", "📋 Акции", "💰 Цены", "❓ Помощь", "📞 Контакты"]
        );
        for label in labels {
            let item = MenuItem::from_label(label).expect("label is known");
            assert_eq!(item.label(), label);
        }
        assert_eq!(MenuItem::from_label(" 💰 Цены \n"), Some(MenuItem::Prices));
        assert_eq!(MenuItem::from_label("Цены"), None);
        assert_eq!(MenuItem::from_label(SHARE_PHONE_LABEL), None);
    }

    #[test]
    fn keyboards_round_trip_through_parser() {
        let reminder = callback_payloads(&reminder_keyboard(9));
        assert_eq!(reminder, vec!["reminder_confirm:9", "reminder_cancel:9"]);

        let survey = callback_payloads(&keyboard_for(Prompt::SurveyRating { appointment_id: 9 }));
        assert_eq!(survey.len(), 5);
        for (idx, data) in survey.iter().enumerate() {
            assert_eq!(
                CallbackAction::parse(data),
                Some(CallbackAction::Survey {
                    rating: idx as u8 + 1,
                    appointment_id: Some(9)
                })
            );
        }
    }
}
