//! User-facing texts.
use crate::model::Appointment;
use anyhow::{Context, Result};
use chrono::FixedOffset;
use reqwest::Url;

const YANDEX_MAPS_URL: &str = "https://yandex.ru/maps/";

pub const GENERIC_ERROR: &str =
    "Извините, произошла ошибка. Пожалуйста, попробуйте позже или обратитесь к администратору.";

/// Rating buckets. The thresholds decide the follow-up, not just the wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatingTier {
    Excellent,
    Good,
    Neutral,
    Poor,
}

impl RatingTier {
    pub fn from_rating(rating: u8) -> Self {
        match rating {
            r if r >= 5 => RatingTier::Excellent,
            4 => RatingTier::Good,
            3 => RatingTier::Neutral,
            _ => RatingTier::Poor,
        }
    }
}

/// Renders texts for one clinic in its local time.
#[derive(Debug, Clone)]
pub struct Templates {
    clinic: String,
    local: FixedOffset,
}

impl Templates {
    pub fn new(clinic: impl Into<String>, local: FixedOffset) -> Self {
        Self {
            clinic: clinic.into(),
            local,
        }
    }

    pub fn clinic(&self) -> &str {
        &self.clinic
    }

    fn date_time(&self, appointment: &Appointment) -> (String, String) {
        let local = appointment.appointment_date.with_timezone(&self.local);
        (
            local.format("%d.%m.%Y").to_string(),
            local.format("%H:%M").to_string(),
        )
    }

    fn details(appointment: &Appointment, out: &mut String) {
        if let Some(doctor) = &appointment.doctor_name {
            out.push_str(&format!("👩‍⚕️ Врач: {doctor}\n"));
        }
        if let Some(procedure) = &appointment.procedure_name {
            out.push_str(&format!("💆 Процедура: {procedure}\n"));
        }
    }

    pub fn booking(&self, appointment: &Appointment) -> String {
        let (date, time) = self.date_time(appointment);
        let mut text = format!(
            "📅 Вы записаны в {}!\n\nДата: {date}\nВремя: {time}\n",
            self.clinic
        );
        Self::details(appointment, &mut text);
        text.push_str("\nМы напомним вам за 24 часа до визита! ⏰");
        text
    }

    pub fn reminder(&self, appointment: &Appointment) -> String {
        let (date, time) = self.date_time(appointment);
        let mut text = format!("⏰ Напоминание о записи\n\nЗавтра, {date} в {time}\n");
        Self::details(appointment, &mut text);
        text.push_str("\nПожалуйста, подтвердите, что вы придёте:");
        text
    }

    pub fn survey(&self, procedure_name: Option<&str>) -> String {
        let question = match procedure_name {
            Some(procedure) => format!("Как вам процедура \"{procedure}\"?"),
            None => "Как вам ваше посещение?".to_string(),
        };
        format!(
            "Спасибо, что выбрали {}! 💙\n\nМы были бы рады узнать ваше мнение о посещении.\n\n{question}\n\nОцените от 1 до 5:",
            self.clinic
        )
    }

    pub fn welcome(&self, first_name: &str) -> String {
        format!(
            "Здравствуйте, {first_name}! 👋\n\nЭто бот клиники {}. Здесь вы будете получать \
             подтверждения записи, напоминания за 24 часа до визита и короткий опрос после процедуры.\n\n\
             Чтобы мы нашли ваши записи, поделитесь номером телефона кнопкой ниже.",
            self.clinic
        )
    }

    pub fn help(&self) -> String {
        format!(
            "ℹ️ Бот клиники {}\n\n\
             • присылает подтверждение записи;\n\
             • напоминает о визите за 24 часа;\n\
             • через 3 дня после визита просит оценить процедуру.\n\n\
             Команды:\n/start — регистрация и привязка номера телефона\n/menu — главное меню\n/help — эта справка",
            self.clinic
        )
    }

    pub fn menu(&self) -> String {
        format!("📋 Главное меню {}\n\nВыберите нужный раздел:", self.clinic)
    }

    pub fn promotions(&self) -> String {
        format!(
            "🎁 Акции и спецпредложения {}\n\n\
             Следите за нашими акциями и не упустите выгодные предложения!\n\n\
             📌 Всегда актуальная информация на сайте:\nu-clinic.ru/promo\n\n\
             Акции могут обновляться. Проверяйте регулярно!",
            self.clinic
        )
    }

    pub fn contacts(&self) -> String {
        format!(
            "📞 Контактная информация\n\nКлиника экспертной косметологии {}\n\n\
             📍 Адрес:\nг. Тверь, ул. Примерная, д. 123\n\n\
             📱 Телефон:\n+7 (XXX) XXX-XX-XX\n\n\
             ✉️ Email:\ninfo@uclinic.ru\n\n\
             🌐 Сайт:\nu-clinic.ru\n\n\
             ⏰ Режим работы:\nПн-Сб: 09:00 - 21:00\nВс: 10:00 - 20:00",
            self.clinic
        )
    }

    pub fn admin_low_rating(&self, appointment: &Appointment, rating: u8) -> String {
        let (date, time) = self.date_time(appointment);
        format!(
            "⚠️ Низкая оценка {rating}/5\n\nСделка: {}\nВизит: {date} {time}\nПроцедура: {}\nТелефон: {}",
            appointment.bitrix24_deal_id,
            appointment.procedure_name.as_deref().unwrap_or("—"),
            appointment.phone_number.as_deref().unwrap_or("—"),
        )
    }
}

pub fn survey_thanks(tier: RatingTier) -> &'static str {
    match tier {
        RatingTier::Excellent => {
            "Спасибо за высокую оценку! ⭐⭐⭐⭐⭐\n\nМы были бы очень благодарны, если бы вы оставили отзыв в Яндекс.Картах!"
        }
        RatingTier::Good => "Спасибо за вашу оценку! Рады, что вам понравилось! 😊",
        RatingTier::Neutral => {
            "Спасибо за обратную связь! Мы всегда работаем над улучшением сервиса."
        }
        RatingTier::Poor => {
            "Спасибо за честную оценку. Мы сожалеем, что не оправдали ваших ожиданий. \
             Наша команда обязательно свяжется с вами для решения вопроса."
        }
    }
}

pub fn survey_thanks_with_link(link: &Url) -> String {
    format!(
        "{}\n\nОставить отзыв в Яндекс.Картах: {link}",
        survey_thanks(RatingTier::Excellent)
    )
}

pub const REMINDER_CONFIRMED: &str = "✅ Спасибо за подтверждение! Ждём вас в назначенное время.";
pub const REMINDER_CANCELLED: &str =
    "❌ Поняли. Запись отменена.\n\nЕсли хотите записаться на другое время, свяжитесь с нами.";
pub const REMINDER_NOT_FOUND: &str = "Не найдена запись для подтверждения.";
pub const REMINDER_ALREADY_ANSWERED: &str = "Вы уже ответили на это напоминание. Спасибо!";
pub const SURVEY_NOT_FOUND: &str = "Не найдена запись для опроса.";
pub const SURVEY_ALREADY_ANSWERED: &str = "Вы уже ответили на этот опрос. Спасибо!";
pub const USER_NOT_FOUND: &str = "Пользователь не найден. Отправьте /start, чтобы зарегистрироваться.";
pub const FOREIGN_CONTACT: &str = "Пожалуйста, поделитесь своим номером с помощью кнопки ниже.";
pub const PHONE_UNREADABLE: &str = "Не удалось распознать номер телефона. Попробуйте ещё раз.";

pub const BOOKING_INFO: &str = "📅 Запись на приём\n\n\
     Для записи на приём свяжитесь с нами:\n📞 +7 (XXX) XXX-XX-XX\n✉️ info@uclinic.ru\n\n\
     После записи мы пришлём подтверждение в этот чат.";
pub const PRICES: &str = "💰 Прайс-лист услуг\n\n\
     Полный прайс-лист наших услуг доступен на сайте:\nu-clinic.ru/price\n\n\
     Для уточнения стоимости конкретной процедуры свяжитесь с администратором.";

pub fn phone_saved(linked: usize) -> String {
    match linked {
        0 => "Спасибо! Номер сохранён. Мы пришлём уведомление, как только появится запись.".to_string(),
        n => format!("Спасибо! Номер сохранён. Найдено записей: {n}."),
    }
}

/// Yandex Maps review link with a prefilled text.
pub fn review_link(organization: &str, procedure_name: Option<&str>) -> Result<Url> {
    let prefill = match procedure_name.filter(|p| !p.trim().is_empty()) {
        Some(procedure) => {
            format!("Я прошла процедуру {procedure} и мне очень понравилось! Рекомендую!")
        }
        None => "Я была в клинике и мне очень понравилось! Рекомендую!".to_string(),
    };
    Url::parse_with_params(
        YANDEX_MAPS_URL,
        &[
            ("text", organization),
            ("add-review", "true"),
            ("review-text", prefill.as_str()),
        ],
    )
    .context("failed to build review link")
}
