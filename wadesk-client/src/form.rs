use chrono::Utc;
use tracing::{info, warn};
use wadesk_core::{
    Attachment, FormRequirements, MessageDraft, SentMessage, Template, TemplateCatalog,
    ValidationError,
};

use crate::{api::MessageBackend, error::ClientError};

/// Message submission form: a draft, the template catalog it draws from and
/// the outcome of the last submission.
#[derive(Debug, Clone)]
pub struct MessageForm {
    draft: MessageDraft,
    catalog: TemplateCatalog,
    requirements: FormRequirements,
    error: Option<String>,
    success: Option<String>,
}

impl MessageForm {
    pub fn with_builtin_catalog(requirements: FormRequirements) -> Self {
        Self::new(TemplateCatalog::builtin(), requirements)
    }

    /// Starts empty; submission stays disabled until [`MessageForm::load_catalog`] succeeds.
    pub fn with_dynamic_catalog(requirements: FormRequirements) -> Self {
        Self::new(TemplateCatalog::pending(), requirements)
    }

    fn new(catalog: TemplateCatalog, requirements: FormRequirements) -> Self {
        Self {
            draft: MessageDraft::new(catalog.default_id()),
            catalog,
            requirements,
            error: None,
            success: None,
        }
    }

    pub async fn load_catalog(&mut self, backend: &dyn MessageBackend) -> Result<(), ClientError> {
        match backend.templates().await {
            Ok(templates) => {
                info!(count = templates.len(), "loaded message templates");
                self.set_catalog(templates);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "failed to load message templates");
                self.error = Some(format!("could not load templates: {err}"));
                Err(err)
            }
        }
    }

    /// Installs a backend catalog; keeps the selection if it still exists.
    pub fn set_catalog(&mut self, templates: Vec<Template>) {
        self.catalog = TemplateCatalog::dynamic(templates);
        if self.catalog.get(&self.draft.template_id).is_none() {
            self.draft.template_id = self.catalog.default_id().unwrap_or_default().to_owned();
        }
    }

    pub fn set_recipient(&mut self, recipient: impl Into<String>) {
        self.draft.recipient = recipient.into();
    }

    pub fn set_display_name(&mut self, name: impl Into<String>) {
        self.draft.display_name = name.into();
    }

    pub fn select_template(&mut self, id: impl Into<String>) {
        self.draft.template_id = id.into();
    }

    pub fn set_schedule(&mut self, date: impl Into<String>, time: impl Into<String>) {
        self.draft.date = date.into();
        self.draft.time = time.into();
    }

    pub fn set_attachment(&mut self, attachment: Option<Attachment>) {
        self.draft.attachment = attachment;
    }

    pub fn draft(&self) -> &MessageDraft {
        &self.draft
    }

    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    pub fn requirements(&self) -> FormRequirements {
        self.requirements
    }

    pub fn preview(&self) -> Option<String> {
        self.draft.preview(&self.catalog)
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn success(&self) -> Option<&str> {
        self.success.as_deref()
    }

    /// A dynamic catalog that has not arrived yet.
    pub fn is_loading_catalog(&self) -> bool {
        self.catalog.is_empty()
    }

    pub fn can_submit(&self, connected: bool) -> bool {
        connected && !self.catalog.is_empty()
    }

    /// Validates and sends the draft exactly once. On success the form is
    /// reset; on failure the draft is kept and the error recorded.
    pub async fn submit(
        &mut self,
        backend: &dyn MessageBackend,
        connected: bool,
    ) -> Result<SentMessage, ClientError> {
        self.error = None;
        self.success = None;

        if !connected {
            return Err(self.fail(ValidationError::NotConnected.into()));
        }
        if self.catalog.is_empty() {
            return Err(self.fail(ValidationError::MissingTemplate.into()));
        }
        let message = match self.draft.validate(&self.catalog, self.requirements) {
            Ok(message) => message,
            Err(err) => return Err(self.fail(err.into())),
        };

        match backend.send_message(&message).await {
            Ok(receipt) => {
                let sent = SentMessage::from_receipt(&message, receipt, Utc::now());
                info!(
                    recipient = %sent.recipient,
                    template = %sent.template,
                    message_id = ?sent.message_id,
                    "message sent"
                );
                self.draft.reset(self.catalog.default_id());
                self.success = Some(format!("Message sent to {}", sent.recipient));
                Ok(sent)
            }
            Err(err) => {
                warn!(recipient = %message.recipient, error = %err, "message send failed");
                Err(self.fail(err))
            }
        }
    }

    fn fail(&mut self, err: ClientError) -> ClientError {
        self.error = Some(err.to_string());
        err
    }
}
