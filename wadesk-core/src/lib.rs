//! Domain logic for the wadesk operator console: status reconciliation,
//! countdown helpers, message drafts and the backend wire shapes.

pub mod countdown;
pub mod message;
pub mod notice;
pub mod status;
pub mod template;
pub mod wire;

pub use countdown::{TimeBand, format_time, remaining_seconds};
pub use message::{
    Attachment, FormRequirements, MessageDraft, OutgoingMessage, SendReceipt, SentLog,
    SentMessage, ValidationError, normalize_phone,
};
pub use notice::{Notification, NotificationLog, Severity};
pub use status::{
    ApplyOutcome, ConnectionStatus, CountdownAction, Phase, PullTicket, QrData, QrSnapshot,
    StatusPayload, StatusView, Tick,
};
pub use template::{CatalogSource, Template, TemplateCatalog};
pub use wire::{
    Ack, AuthStatus, AuthStatusResponse, ErrorBody, FieldError, FrameError, QrRequestResponse,
    decode_frame, describe_field_errors, encode_frame,
};
