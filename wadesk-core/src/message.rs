use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::template::TemplateCatalog;

pub const MIN_PHONE_DIGITS: usize = 10;
pub const MAX_PHONE_DIGITS: usize = 15;
pub const MAX_SENT_LOG: usize = 10;
pub const SCHEDULE_DATE_FORMAT: &str = "%Y-%m-%d";
pub const SCHEDULE_TIME_FORMAT: &str = "%H:%M";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("must be connected to WhatsApp to send messages")]
    NotConnected,
    #[error("recipient phone number is required")]
    MissingRecipient,
    #[error("display name is required")]
    MissingDisplayName,
    #[error("phone number must have between 10 and 15 digits (got {0})")]
    PhoneLength(usize),
    #[error("no template selected")]
    MissingTemplate,
    #[error("unknown template {0}")]
    UnknownTemplate(String),
    #[error("date and time are required")]
    MissingSchedule,
    #[error("invalid date or time: {0}")]
    InvalidSchedule(String),
    #[error("an image attachment is required")]
    MissingAttachment,
    #[error("attachment must be an image (got {0})")]
    NotAnImage(String),
    #[error("attachment is empty")]
    EmptyAttachment,
}

/// Strips everything but ASCII digits and checks the 10–15 digit range.
pub fn normalize_phone(input: &str) -> Result<String, ValidationError> {
    if input.trim().is_empty() {
        return Err(ValidationError::MissingRecipient);
    }
    let digits: String = input.chars().filter(char::is_ascii_digit).collect();
    if !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits.len()) {
        return Err(ValidationError::PhoneLength(digits.len()));
    }
    Ok(digits)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    fn check(&self) -> Result<(), ValidationError> {
        if !self.content_type.trim().to_ascii_lowercase().starts_with("image/") {
            return Err(ValidationError::NotAnImage(self.content_type.clone()));
        }
        if self.bytes.is_empty() {
            return Err(ValidationError::EmptyAttachment);
        }
        Ok(())
    }
}

/// Which optional inputs a form variant insists on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormRequirements {
    #[serde(default)]
    pub require_schedule: bool,
    #[serde(default)]
    pub require_attachment: bool,
}

/// Uncommitted operator input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageDraft {
    pub recipient: String,
    pub template_id: String,
    pub display_name: String,
    pub date: String,
    pub time: String,
    pub attachment: Option<Attachment>,
}

impl MessageDraft {
    pub fn new(default_template: Option<&str>) -> Self {
        Self {
            template_id: default_template.unwrap_or_default().to_owned(),
            ..Self::default()
        }
    }

    pub fn reset(&mut self, default_template: Option<&str>) {
        *self = Self::new(default_template);
    }

    /// Rendered text of the selected template, once a name is typed.
    pub fn preview(&self, catalog: &TemplateCatalog) -> Option<String> {
        let name = self.display_name.trim();
        if name.is_empty() {
            return None;
        }
        catalog
            .get(&self.template_id)
            .map(|template| template.preview(name))
    }

    pub fn validate(
        &self,
        catalog: &TemplateCatalog,
        requirements: FormRequirements,
    ) -> Result<OutgoingMessage, ValidationError> {
        if self.recipient.trim().is_empty() {
            return Err(ValidationError::MissingRecipient);
        }
        let display_name = self.display_name.trim();
        if display_name.is_empty() {
            return Err(ValidationError::MissingDisplayName);
        }
        let recipient = normalize_phone(&self.recipient)?;

        if self.template_id.trim().is_empty() {
            return Err(ValidationError::MissingTemplate);
        }
        let template = catalog
            .get(&self.template_id)
            .ok_or_else(|| ValidationError::UnknownTemplate(self.template_id.clone()))?;

        let (date, time) = self.schedule(requirements.require_schedule)?;

        match &self.attachment {
            Some(attachment) => attachment.check()?,
            None if requirements.require_attachment => {
                return Err(ValidationError::MissingAttachment);
            }
            None => {}
        }

        Ok(OutgoingMessage {
            recipient,
            template_id: template.id.clone(),
            template_name: template.name.clone(),
            display_name: display_name.to_owned(),
            date,
            time,
            attachment: self.attachment.clone(),
            preview: template.preview(display_name),
        })
    }

    fn schedule(&self, required: bool) -> Result<(Option<String>, Option<String>), ValidationError> {
        let date = self.date.trim();
        let time = self.time.trim();
        if date.is_empty() && time.is_empty() {
            if required {
                return Err(ValidationError::MissingSchedule);
            }
            return Ok((None, None));
        }
        if date.is_empty() || time.is_empty() {
            return Err(ValidationError::MissingSchedule);
        }
        NaiveDate::parse_from_str(date, SCHEDULE_DATE_FORMAT)
            .map_err(|err| ValidationError::InvalidSchedule(format!("{date}: {err}")))?;
        NaiveTime::parse_from_str(time, SCHEDULE_TIME_FORMAT)
            .map_err(|err| ValidationError::InvalidSchedule(format!("{time}: {err}")))?;
        Ok((Some(date.to_owned()), Some(time.to_owned())))
    }
}

/// A draft that passed validation and is ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub recipient: String,
    pub template_id: String,
    pub template_name: String,
    pub display_name: String,
    pub date: Option<String>,
    pub time: Option<String>,
    pub attachment: Option<Attachment>,
    pub preview: String,
}

/// Success body of `POST /send-message`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default, alias = "messagePreview")]
    pub preview: Option<String>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SentMessage {
    pub recipient: String,
    pub template: String,
    pub sent_at: DateTime<Utc>,
    pub message_id: Option<String>,
    pub preview: String,
}

impl SentMessage {
    pub fn from_receipt(message: &OutgoingMessage, receipt: SendReceipt, now: DateTime<Utc>) -> Self {
        Self {
            recipient: message.recipient.clone(),
            template: message.template_name.clone(),
            sent_at: receipt.sent_at.unwrap_or(now),
            message_id: receipt.message_id,
            preview: receipt.preview.unwrap_or_else(|| message.preview.clone()),
        }
    }
}

/// Most recent sends, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SentLog {
    entries: Vec<SentMessage>,
}

impl SentLog {
    pub fn record(&mut self, message: SentMessage) {
        self.entries.insert(0, message);
        self.entries.truncate(MAX_SENT_LOG);
    }

    pub fn entries(&self) -> &[SentMessage] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn draft() -> MessageDraft {
        MessageDraft {
            recipient: "+51 987 654 321".to_owned(),
            template_id: "2".to_owned(),
            display_name: " Rosa ".to_owned(),
            ..MessageDraft::default()
        }
    }

    fn png() -> Attachment {
        Attachment {
            file_name: "promo.png".to_owned(),
            content_type: "image/png".to_owned(),
            bytes: vec![0x89, b'P', b'N', b'G'],
        }
    }

    #[test]
    fn phone_length_bounds() {
        assert_eq!(normalize_phone("123"), Err(ValidationError::PhoneLength(3)));
        assert_eq!(normalize_phone("12345678901").as_deref(), Ok("12345678901"));
        assert_eq!(
            normalize_phone("1234567890123456"),
            Err(ValidationError::PhoneLength(16))
        );
        assert_eq!(normalize_phone("(+51) 987-654-321").as_deref(), Ok("51987654321"));
        assert_eq!(normalize_phone("   "), Err(ValidationError::MissingRecipient));
    }

    #[test]
    fn validate_normalizes_and_renders_preview() {
        let catalog = TemplateCatalog::builtin();
        let message = draft()
            .validate(&catalog, FormRequirements::default())
            .unwrap();
        assert_eq!(message.recipient, "51987654321");
        assert_eq!(message.display_name, "Rosa");
        assert_eq!(message.template_name, "Social media management");
        assert!(message.preview.starts_with("Hi Rosa!"));
        assert_eq!(message.date, None);
    }

    #[test]
    fn required_fields_are_checked_in_order() {
        let catalog = TemplateCatalog::builtin();
        let mut input = draft();
        input.recipient.clear();
        input.display_name.clear();
        assert_eq!(
            input.validate(&catalog, FormRequirements::default()),
            Err(ValidationError::MissingRecipient)
        );
        input.recipient = "123".to_owned();
        assert_eq!(
            input.validate(&catalog, FormRequirements::default()),
            Err(ValidationError::MissingDisplayName)
        );
    }

    #[test]
    fn unknown_template_is_rejected() {
        let mut input = draft();
        input.template_id = "99".to_owned();
        assert_eq!(
            input.validate(&TemplateCatalog::builtin(), FormRequirements::default()),
            Err(ValidationError::UnknownTemplate("99".to_owned()))
        );
    }

    #[test]
    fn scheduled_variant_requires_valid_date_and_time() {
        let catalog = TemplateCatalog::builtin();
        let requirements = FormRequirements {
            require_schedule: true,
            require_attachment: false,
        };
        let mut input = draft();
        assert_eq!(
            input.validate(&catalog, requirements),
            Err(ValidationError::MissingSchedule)
        );
        input.date = "2025-02-30".to_owned();
        input.time = "09:30".to_owned();
        assert!(matches!(
            input.validate(&catalog, requirements),
            Err(ValidationError::InvalidSchedule(_))
        ));
        input.date = "2025-02-28".to_owned();
        let message = input.validate(&catalog, requirements).unwrap();
        assert_eq!(message.date.as_deref(), Some("2025-02-28"));
        assert_eq!(message.time.as_deref(), Some("09:30"));
    }

    #[test]
    fn attachment_rules() {
        let catalog = TemplateCatalog::builtin();
        let requirements = FormRequirements {
            require_schedule: false,
            require_attachment: true,
        };
        let mut input = draft();
        assert_eq!(
            input.validate(&catalog, requirements),
            Err(ValidationError::MissingAttachment)
        );

        input.attachment = Some(Attachment {
            content_type: "application/pdf".to_owned(),
            ..png()
        });
        assert_eq!(
            input.validate(&catalog, FormRequirements::default()),
            Err(ValidationError::NotAnImage("application/pdf".to_owned()))
        );

        input.attachment = Some(png());
        assert!(input.validate(&catalog, requirements).is_ok());
    }

    #[test]
    fn preview_needs_a_name() {
        let catalog = TemplateCatalog::builtin();
        let mut input = draft();
        assert!(input.preview(&catalog).is_some());
        input.display_name = "  ".to_owned();
        assert_eq!(input.preview(&catalog), None);
    }

    #[test]
    fn sent_log_keeps_ten_newest() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let message = draft()
            .validate(&TemplateCatalog::builtin(), FormRequirements::default())
            .unwrap();
        let mut log = SentLog::default();
        for index in 0..12 {
            let receipt = SendReceipt {
                message_id: Some(format!("msg-{index}")),
                ..SendReceipt::default()
            };
            log.record(SentMessage::from_receipt(&message, receipt, now));
        }
        assert_eq!(log.len(), MAX_SENT_LOG);
        assert_eq!(log.entries()[0].message_id.as_deref(), Some("msg-11"));
        assert_eq!(log.entries()[9].message_id.as_deref(), Some("msg-2"));
        assert_eq!(log.entries()[0].preview, message.preview);
        assert_eq!(log.entries()[0].sent_at, now);
    }

    #[test]
    fn receipt_accepts_legacy_preview_key() {
        let receipt: SendReceipt = serde_json::from_str(
            r#"{"messageId":"abc","messagePreview":"hello","sentAt":"2025-03-01T12:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(receipt.message_id.as_deref(), Some("abc"));
        assert_eq!(receipt.preview.as_deref(), Some("hello"));
        assert!(receipt.sent_at.is_some());
    }
}
