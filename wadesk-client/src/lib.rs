//! Async runtime for the wadesk console: backend HTTP client, push channel,
//! status synchronizer and the message submission form.

pub mod api;
pub mod config;
pub mod console;
pub mod error;
pub mod form;
pub mod push;
pub mod render;
pub mod sync;
pub mod timer;

pub use api::{BackendClient, MessageBackend, Session, StatusBackend};
pub use config::{ConfigError, ConsoleConfig, FormSettings, load_config, load_config_from_path};
pub use console::{ConsoleCommand, SendRequest, parse_command, submit_and_record};
pub use error::ClientError;
pub use form::MessageForm;
pub use push::{
    DisconnectReason, PushConnector, PushEvent, PushSink, ReconnectPolicy, WsPushConnector,
};
pub use sync::{ConsoleView, SyncSettings, Synchronizer};
pub use timer::TaskHandle;
