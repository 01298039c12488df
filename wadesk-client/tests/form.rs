use std::{
    collections::BTreeMap,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use wadesk_client::{ClientError, MessageBackend, MessageForm};
use wadesk_core::{
    Attachment, FieldError, FormRequirements, OutgoingMessage, SendReceipt, SentLog, Template,
    ValidationError,
};

#[derive(Default)]
struct FakeMessages {
    templates: Vec<Template>,
    reject: Option<Vec<FieldError>>,
    sent: Mutex<Vec<OutgoingMessage>>,
    calls: AtomicUsize,
}

#[async_trait]
impl MessageBackend for FakeMessages {
    async fn templates(&self) -> Result<Vec<Template>, ClientError> {
        Ok(self.templates.clone())
    }

    async fn send_message(&self, message: &OutgoingMessage) -> Result<SendReceipt, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(errors) = &self.reject {
            return Err(ClientError::Rejected(errors.clone()));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(SendReceipt {
            message_id: Some("wamid-1".to_owned()),
            preview: None,
            sent_at: None,
        })
    }
}

fn png() -> Attachment {
    Attachment {
        file_name: "flyer.png".to_owned(),
        content_type: "image/png".to_owned(),
        bytes: vec![1, 2, 3],
    }
}

fn filled(form: &mut MessageForm) {
    form.set_recipient("+1 (555) 010-9999");
    form.set_display_name("Ana");
    form.select_template("3");
}

#[tokio::test]
async fn successful_submission_resets_form_and_logs_once() {
    let backend = FakeMessages::default();
    let mut form = MessageForm::with_builtin_catalog(FormRequirements {
        require_schedule: false,
        require_attachment: true,
    });
    filled(&mut form);
    form.set_attachment(Some(png()));
    assert!(form.requirements().require_attachment);
    assert!(form.preview().unwrap().starts_with("Hi Ana!"));

    let sent = form.submit(&backend, true).await.unwrap();
    assert_eq!(sent.recipient, "15550109999");
    assert_eq!(sent.template, "Digital marketing");
    assert_eq!(sent.message_id.as_deref(), Some("wamid-1"));
    assert!(sent.preview.starts_with("Hi Ana!"));

    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    let outgoing = backend.sent.lock().unwrap()[0].clone();
    assert_eq!(outgoing.attachment, Some(png()));

    assert_eq!(form.draft().recipient, "");
    assert_eq!(form.draft().display_name, "");
    assert_eq!(form.draft().attachment, None);
    assert_eq!(form.draft().template_id, "1");
    assert_eq!(form.success(), Some("Message sent to 15550109999"));
    assert_eq!(form.error(), None);

    let mut log = SentLog::default();
    log.record(sent);
    assert_eq!(log.len(), 1);
}

#[tokio::test]
async fn rejected_submission_keeps_the_draft() {
    let backend = FakeMessages {
        reject: Some(vec![FieldError {
            field: "recipient".to_owned(),
            message: "not on WhatsApp".to_owned(),
        }]),
        ..FakeMessages::default()
    };
    let mut form = MessageForm::with_builtin_catalog(FormRequirements::default());
    filled(&mut form);

    let err = form.submit(&backend, true).await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected(_)));
    assert_eq!(form.error(), Some("recipient: not on WhatsApp"));
    assert_eq!(form.draft().display_name, "Ana");
    assert_eq!(form.draft().template_id, "3");
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalid_input_never_reaches_the_backend() {
    let backend = FakeMessages::default();
    let mut form = MessageForm::with_builtin_catalog(FormRequirements::default());
    filled(&mut form);
    form.set_recipient("123");

    let err = form.submit(&backend, true).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Invalid(ValidationError::PhoneLength(3))
    ));

    form.set_recipient("15550109999");
    let err = form.submit(&backend, false).await.unwrap_err();
    assert!(matches!(err, ClientError::Invalid(ValidationError::NotConnected)));
    assert!(!form.can_submit(false));

    assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    assert_eq!(form.draft().recipient, "15550109999");
}

#[tokio::test]
async fn dynamic_catalog_gates_submission_until_loaded() {
    let backend = FakeMessages {
        templates: vec![
            Template {
                id: "welcome".to_owned(),
                name: "Welcome".to_owned(),
                messages: BTreeMap::from([("1".to_owned(), "Hola {nombre}".to_owned())]),
            },
            Template {
                id: "follow-up".to_owned(),
                name: "Follow-up".to_owned(),
                messages: BTreeMap::new(),
            },
        ],
        ..FakeMessages::default()
    };
    let mut form = MessageForm::with_dynamic_catalog(FormRequirements::default());
    assert!(form.is_loading_catalog());
    assert!(!form.can_submit(true));
    form.set_recipient("15550109999");
    form.set_display_name("Luis");
    assert!(form.submit(&backend, true).await.is_err());

    form.load_catalog(&backend).await.unwrap();
    assert!(!form.is_loading_catalog());
    assert!(form.can_submit(true));
    assert_eq!(form.draft().template_id, "welcome");
    assert_eq!(form.preview().as_deref(), Some("Hola Luis"));

    let sent = form.submit(&backend, true).await.unwrap();
    assert_eq!(sent.template, "Welcome");
    assert_eq!(form.draft().template_id, "welcome");
}
