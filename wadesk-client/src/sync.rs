//! Status synchronizer.
//!
//! One task owns every piece of mutable console state. User calls, push
//! events, timer ticks and finished HTTP requests all reach it as
//! [`Command`]s over a single channel, and each processed command publishes
//! a fresh [`ConsoleView`] on a `watch` channel.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use wadesk_core::{
    Ack, AuthStatus, AuthStatusResponse, CountdownAction, Notification, NotificationLog, Phase,
    PullTicket, QrRequestResponse, SentLog, SentMessage, Severity, StatusPayload, StatusView,
    Tick,
};

use crate::{
    api::{Session, StatusBackend},
    config::millis,
    error::ClientError,
    push::{PushConnector, PushEvent, PushSink},
    timer::{self, TaskHandle},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Delay between opening the push channel and the first pull.
    #[serde(with = "millis")]
    pub initial_pull_delay: Duration,
    #[serde(with = "millis")]
    pub countdown_period: Duration,
    #[serde(with = "millis")]
    pub qr_poll_interval: Duration,
    /// Polling started by a QR request gives up after this long.
    #[serde(with = "millis")]
    pub qr_poll_ceiling: Duration,
    #[serde(with = "millis")]
    pub notification_ttl: Duration,
    #[serde(with = "millis")]
    pub auth_reset_refresh_delay: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            initial_pull_delay: Duration::from_secs(1),
            countdown_period: Duration::from_secs(1),
            qr_poll_interval: Duration::from_secs(2),
            qr_poll_ceiling: Duration::from_secs(30),
            notification_ttl: Duration::from_secs(5),
            auth_reset_refresh_delay: Duration::from_secs(1),
        }
    }
}

impl SyncSettings {
    fn poll_ticks(&self) -> u64 {
        let interval = self.qr_poll_interval.as_millis().max(1);
        u64::try_from(self.qr_poll_ceiling.as_millis() / interval)
            .unwrap_or(u64::MAX)
            .max(1)
    }
}

/// Snapshot published after every state change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsoleView {
    pub status: StatusView,
    pub notifications: Vec<Notification>,
    /// Newest first.
    pub sent: Vec<SentMessage>,
    pub push_connected: bool,
    /// A backend request is in flight.
    pub loading: bool,
    /// QR polling is active.
    pub polling: bool,
    pub countdown_active: bool,
    /// Result of the last auth-status check.
    pub auth: Option<AuthStatus>,
    pub last_error: Option<String>,
}

impl ConsoleView {
    pub fn phase(&self) -> Phase {
        self.status.phase()
    }

    /// Messages may only be sent while connected with a live session.
    pub fn can_send(&self) -> bool {
        self.status.status.is_connected && !self.status.session_expired
    }
}

#[derive(Debug)]
pub(crate) enum Command {
    Initialize,
    Refresh,
    RequestQr,
    ExpireQr,
    CheckAuth,
    ResetAuth,
    RecordSent(SentMessage),
    Dismiss(u64),
    Reauthenticate(String),
    Teardown,
    Push { channel: u64, event: PushEvent },
    Completed { epoch: u64, outcome: Outcome },
    TimedRefresh { epoch: u64 },
    CountdownTick { timer: u64 },
    PollTick { poll: u64 },
    PollFinished { poll: u64 },
    NoticeExpired(u64),
}

#[derive(Debug)]
pub(crate) enum Outcome {
    Pulled {
        ticket: PullTicket,
        announce: bool,
        result: Result<StatusPayload, ClientError>,
    },
    QrRequested {
        ticket: PullTicket,
        result: Result<QrRequestResponse, ClientError>,
    },
    QrExpired(Result<Ack, ClientError>),
    AuthChecked(Result<AuthStatusResponse, ClientError>),
    AuthReset(Result<Ack, ClientError>),
    Polled {
        poll: u64,
        ticket: PullTicket,
        result: Result<StatusPayload, ClientError>,
    },
}

/// Handle to the running synchronizer. Dropping it stops the actor and
/// every timer and connection it owns.
#[derive(Debug)]
pub struct Synchronizer {
    cmd_tx: mpsc::UnboundedSender<Command>,
    view_rx: watch::Receiver<ConsoleView>,
    _task: TaskHandle,
}

impl Synchronizer {
    /// Starts the actor. Must be called from within a tokio runtime.
    pub fn spawn(
        backend: Arc<dyn StatusBackend>,
        connector: Arc<dyn PushConnector>,
        session: Arc<Session>,
        settings: SyncSettings,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(ConsoleView::default());
        let actor = Actor {
            backend,
            connector,
            session,
            settings,
            tx: cmd_tx.clone(),
            view_tx,
            status: StatusView::new(),
            notices: NotificationLog::default(),
            sent: SentLog::default(),
            push_connected: false,
            auth: None,
            last_error: None,
            epoch: 0,
            in_flight: 0,
            channel: 0,
            push: None,
            pending_refresh: Vec::new(),
            countdown: None,
            countdown_id: 0,
            poll: None,
            poll_id: 0,
            notice_timers: HashMap::new(),
        };
        let task = TaskHandle::spawn(actor.run(cmd_rx));
        Self {
            cmd_tx,
            view_rx,
            _task: task,
        }
    }

    /// Opens the push channel and schedules the first pull. No-op while open.
    pub fn initialize(&self) {
        self.send(Command::Initialize);
    }

    pub fn request_status_refresh(&self) {
        self.send(Command::Refresh);
    }

    pub fn request_new_qr(&self) {
        self.send(Command::RequestQr);
    }

    /// Asks the backend to invalidate the QR. Local state follows the next update.
    pub fn expire_qr_manually(&self) {
        self.send(Command::ExpireQr);
    }

    pub fn check_auth_status(&self) {
        self.send(Command::CheckAuth);
    }

    pub fn reset_auth(&self) {
        self.send(Command::ResetAuth);
    }

    pub fn record_sent(&self, message: SentMessage) {
        self.send(Command::RecordSent(message));
    }

    pub fn dismiss_notification(&self, id: u64) {
        self.send(Command::Dismiss(id));
    }

    pub fn reauthenticate(&self, token: impl Into<String>) {
        self.send(Command::Reauthenticate(token.into()));
    }

    /// Closes the push channel and stops every timer. Repeatable.
    pub fn teardown(&self) {
        self.send(Command::Teardown);
    }

    /// Pulls status and resolves once the pull has been applied or has failed.
    pub async fn refresh_and_wait(&self) -> ConsoleView {
        self.run_to_idle(Command::Refresh).await
    }

    /// Requests a new QR and resolves once one is on screen, the request
    /// fails, or the bounded poll gives up.
    pub async fn request_new_qr_and_wait(&self) -> ConsoleView {
        self.run_to_idle(Command::RequestQr).await
    }

    /// Suited to one-shot use: changes from a live push channel can end the wait early.
    async fn run_to_idle(&self, command: Command) -> ConsoleView {
        let mut rx = self.view_rx.clone();
        rx.mark_unchanged();
        self.send(command);
        loop {
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
            let view = rx.borrow_and_update().clone();
            let qr_shown = view.status.qr.is_some() && !view.loading;
            if qr_shown || (!view.loading && !view.polling) {
                return view;
            }
        }
    }

    pub fn view(&self) -> ConsoleView {
        self.view_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConsoleView> {
        self.view_rx.clone()
    }

    fn send(&self, command: Command) {
        if self.cmd_tx.send(command).is_err() {
            debug!("synchronizer already stopped");
        }
    }
}

struct Actor {
    backend: Arc<dyn StatusBackend>,
    connector: Arc<dyn PushConnector>,
    session: Arc<Session>,
    settings: SyncSettings,
    tx: mpsc::UnboundedSender<Command>,
    view_tx: watch::Sender<ConsoleView>,

    status: StatusView,
    notices: NotificationLog,
    sent: SentLog,
    push_connected: bool,
    auth: Option<AuthStatus>,
    last_error: Option<String>,

    /// Bumped on teardown; request results from an older epoch are dropped.
    epoch: u64,
    in_flight: usize,
    channel: u64,
    push: Option<TaskHandle>,
    pending_refresh: Vec<TaskHandle>,
    countdown: Option<TaskHandle>,
    countdown_id: u64,
    poll: Option<TaskHandle>,
    poll_id: u64,
    notice_timers: HashMap<u64, TaskHandle>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
            self.publish();
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Initialize => self.initialize(),
            Command::Refresh => self.pull(true),
            Command::RequestQr => self.request_qr(),
            Command::ExpireQr => {
                self.spawn_request(|backend| async move {
                    Outcome::QrExpired(backend.expire_qr().await)
                });
            }
            Command::CheckAuth => {
                self.spawn_request(|backend| async move {
                    Outcome::AuthChecked(backend.auth_status().await)
                });
            }
            Command::ResetAuth => {
                self.spawn_request(|backend| async move {
                    Outcome::AuthReset(backend.reset_auth().await)
                });
            }
            Command::RecordSent(message) => {
                let text = format!("Message sent to {}", message.recipient);
                self.sent.record(message);
                self.notify(text, Severity::Success);
            }
            Command::Dismiss(id) => {
                self.notices.dismiss(id);
                self.notice_timers.remove(&id);
            }
            Command::Reauthenticate(token) => {
                info!("re-authenticating");
                self.session.reauthenticate(token);
                self.status.clear_session_expired();
                self.last_error = None;
                self.teardown();
                self.initialize();
            }
            Command::Teardown => self.teardown(),
            Command::Push { channel, event } => {
                if channel == self.channel && self.push.is_some() {
                    self.on_push(event);
                } else {
                    debug!(channel, "dropping event from a closed push channel");
                }
            }
            Command::Completed { epoch, outcome } => {
                if epoch != self.epoch {
                    debug!(epoch, "dropping result that finished after teardown");
                    return;
                }
                self.in_flight = self.in_flight.saturating_sub(1);
                self.on_outcome(outcome);
            }
            Command::TimedRefresh { epoch } => {
                if epoch == self.epoch {
                    self.pull(false);
                }
            }
            Command::CountdownTick { timer } => {
                if timer == self.countdown_id && self.countdown.is_some() {
                    self.on_countdown_tick();
                }
            }
            Command::PollTick { poll } => {
                if self.poll_active(poll) {
                    let ticket = self.status.begin_pull();
                    self.spawn_request(move |backend| async move {
                        Outcome::Polled {
                            poll,
                            ticket,
                            result: backend.fetch_status().await,
                        }
                    });
                }
            }
            Command::PollFinished { poll } => {
                if self.poll_active(poll) {
                    debug!(poll, "QR polling gave up");
                    self.stop_polling();
                }
            }
            Command::NoticeExpired(id) => {
                self.notices.expire(id);
                self.notice_timers.remove(&id);
            }
        }
    }

    fn initialize(&mut self) {
        if self.push.as_ref().is_some_and(|push| !push.is_finished()) {
            debug!("push channel already open");
            return;
        }
        self.channel += 1;
        info!(channel = self.channel, "opening push channel");
        let sink = PushSink::new(self.tx.clone(), self.channel);
        self.push = Some(self.connector.open(sink));
        self.schedule_refresh(self.settings.initial_pull_delay);
    }

    fn teardown(&mut self) {
        self.epoch += 1;
        self.in_flight = 0;
        if let Some(mut push) = self.push.take() {
            info!(channel = self.channel, "closing push channel");
            push.cancel();
        }
        self.pending_refresh.clear();
        self.stop_countdown();
        self.stop_polling();
        for (id, _) in self.notice_timers.drain() {
            self.notices.expire(id);
        }
        self.push_connected = false;
    }

    fn pull(&mut self, announce: bool) {
        let ticket = self.status.begin_pull();
        self.spawn_request(move |backend| async move {
            Outcome::Pulled {
                ticket,
                announce,
                result: backend.fetch_status().await,
            }
        });
    }

    fn request_qr(&mut self) {
        let ticket = self.status.begin_pull();
        self.spawn_request(move |backend| async move {
            Outcome::QrRequested {
                ticket,
                result: backend.request_qr().await,
            }
        });
    }

    fn schedule_refresh(&mut self, delay: Duration) {
        let tx = self.tx.clone();
        let epoch = self.epoch;
        self.pending_refresh.retain(|handle| !handle.is_finished());
        self.pending_refresh.push(timer::after(delay, move || {
            let _ = tx.send(Command::TimedRefresh { epoch });
        }));
    }

    fn spawn_request<F, Fut>(&mut self, request: F)
    where
        F: FnOnce(Arc<dyn StatusBackend>) -> Fut,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        self.in_flight += 1;
        let epoch = self.epoch;
        let tx = self.tx.clone();
        let future = request(Arc::clone(&self.backend));
        tokio::spawn(async move {
            let outcome = future.await;
            let _ = tx.send(Command::Completed { epoch, outcome });
        });
    }

    fn on_outcome(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Pulled {
                ticket,
                announce,
                result,
            } => match result {
                Ok(payload) => {
                    if self.apply_pulled(ticket, &payload) && announce {
                        self.notify("Status refreshed", Severity::Info);
                    }
                }
                Err(err) => self.report_failure("status refresh", err),
            },
            Outcome::QrRequested { ticket, result } => match result {
                Ok(response) => self.on_qr_requested(ticket, response),
                Err(err) => self.report_failure("QR request", err),
            },
            Outcome::QrExpired(result) => match result {
                Ok(ack) if ack.success => {
                    let text = ack.message.unwrap_or_else(|| "QR code expired".to_owned());
                    self.notify(text, Severity::Success);
                }
                Ok(ack) => {
                    let text = ack
                        .message
                        .unwrap_or_else(|| "QR code could not be expired".to_owned());
                    self.notify(text, Severity::Warning);
                }
                Err(err) => self.report_failure("QR expire", err),
            },
            Outcome::AuthChecked(result) => match result {
                Ok(response) => {
                    let size = response
                        .auth_status
                        .as_ref()
                        .and_then(|auth| auth.details.as_ref())
                        .and_then(|details| details.size);
                    let text = match (&response.auth_status, size) {
                        (Some(auth), Some(size)) if auth.exists => {
                            format!("Stored session found ({size} bytes)")
                        }
                        (Some(auth), None) if auth.exists => "Stored session found".to_owned(),
                        (Some(_), _) => "No stored session".to_owned(),
                        (None, _) => response
                            .message
                            .clone()
                            .unwrap_or_else(|| "Auth status unavailable".to_owned()),
                    };
                    self.auth = response.auth_status;
                    self.notify(text, Severity::Info);
                }
                Err(err) => self.report_failure("auth status", err),
            },
            Outcome::AuthReset(result) => match result {
                Ok(ack) if ack.success => {
                    let text = ack
                        .message
                        .unwrap_or_else(|| "Stored session cleared".to_owned());
                    self.notify(text, Severity::Success);
                    self.auth = None;
                    self.schedule_refresh(self.settings.auth_reset_refresh_delay);
                }
                Ok(ack) => {
                    let text = ack.message.unwrap_or_else(|| "Auth reset failed".to_owned());
                    self.notify(text, Severity::Warning);
                }
                Err(err) => self.report_failure("auth reset", err),
            },
            Outcome::Polled {
                poll,
                ticket,
                result,
            } => self.on_polled(poll, ticket, result),
        }
    }

    fn on_qr_requested(&mut self, ticket: PullTicket, response: QrRequestResponse) {
        if let Some(current) = &response.current_status {
            self.apply_pulled(ticket, current);
        }
        if response.is_processing() {
            let text = response
                .message
                .unwrap_or_else(|| "Generating a new QR code".to_owned());
            self.notify(text, Severity::Info);
            self.start_polling();
        } else if response.success && response.current_status.is_some() {
            let text = response
                .message
                .unwrap_or_else(|| "New QR code requested".to_owned());
            self.notify(text, Severity::Success);
        } else if response.success {
            warn!("QR request accepted without a current status");
            self.notify(
                "QR requested, but current status unavailable",
                Severity::Warning,
            );
        } else {
            let text = response
                .message
                .unwrap_or_else(|| "QR request was refused".to_owned());
            self.notify(text, Severity::Warning);
        }
    }

    fn on_polled(
        &mut self,
        poll: u64,
        ticket: PullTicket,
        result: Result<StatusPayload, ClientError>,
    ) {
        let active = self.poll_active(poll);
        match result {
            Ok(payload) if carries_qr(&payload) => {
                self.apply_pulled(ticket, &payload);
                if active {
                    self.stop_polling();
                    self.notify("New QR code ready", Severity::Success);
                }
            }
            Ok(_) => {}
            Err(err) => {
                if active {
                    self.stop_polling();
                }
                self.report_failure("QR poll", err);
            }
        }
    }

    fn on_push(&mut self, event: PushEvent) {
        match event {
            PushEvent::Connected => {
                self.push_connected = true;
                self.notify("Connected to status updates", Severity::Success);
            }
            PushEvent::Reconnected { attempt } => {
                self.push_connected = true;
                self.notify(format!("Reconnected after {attempt} attempt(s)"), Severity::Success);
                self.pull(false);
            }
            PushEvent::Disconnected(reason) => {
                self.push_connected = false;
                self.notify(format!("Disconnected: {}", reason.describe()), Severity::Warning);
            }
            PushEvent::ConnectFailed(message) => {
                self.push_connected = false;
                self.last_error = Some(message.clone());
                self.notify(format!("Status channel error: {message}"), Severity::Error);
            }
            PushEvent::ReconnectFailed => {
                self.push_connected = false;
                self.notices.push_persistent(
                    "Could not reconnect to status updates; refresh to retry",
                    Severity::Error,
                );
            }
            PushEvent::AuthRejected => {
                self.push_connected = false;
                self.expire_session(ClientError::Unauthorized.to_string());
            }
            PushEvent::Status(payload) => {
                let outcome = self.status.apply_push(&payload, Utc::now());
                if outcome.discarded {
                    debug!(version = ?payload.version, "discarding stale push update");
                } else if outcome.logged_out {
                    warn!("backend reports the WhatsApp session logged out");
                    self.stop_countdown();
                    self.stop_polling();
                    self.notices.push_persistent(
                        "WhatsApp session logged out. Request a new QR code to link again.",
                        Severity::Error,
                    );
                } else {
                    self.apply_countdown(outcome.countdown);
                }
            }
        }
    }

    /// Returns whether the payload was applied.
    fn apply_pulled(&mut self, ticket: PullTicket, payload: &StatusPayload) -> bool {
        let outcome = self.status.apply_pull(ticket, payload, Utc::now());
        if outcome.discarded {
            debug!("discarding pull that raced a push update");
            return false;
        }
        self.last_error = None;
        self.apply_countdown(outcome.countdown);
        true
    }

    fn apply_countdown(&mut self, action: CountdownAction) {
        match action {
            CountdownAction::Start(remaining) => {
                debug!(remaining, "starting QR countdown");
                self.start_countdown();
            }
            CountdownAction::Stop => self.stop_countdown(),
            CountdownAction::Unchanged => {}
        }
    }

    fn start_countdown(&mut self) {
        self.stop_countdown();
        self.countdown_id += 1;
        let timer = self.countdown_id;
        let tx = self.tx.clone();
        self.countdown = Some(timer::every(self.settings.countdown_period, move || {
            tx.send(Command::CountdownTick { timer }).is_ok()
        }));
    }

    fn stop_countdown(&mut self) {
        if let Some(mut countdown) = self.countdown.take() {
            countdown.cancel();
        }
    }

    fn on_countdown_tick(&mut self) {
        match self.status.tick() {
            Tick::Running(_) => {}
            Tick::Expired => {
                info!("QR code expired locally");
                self.stop_countdown();
                self.notify("QR code expired", Severity::Warning);
            }
            Tick::Idle => self.stop_countdown(),
        }
    }

    fn start_polling(&mut self) {
        self.stop_polling();
        self.poll_id += 1;
        let poll = self.poll_id;
        let limit = self.settings.poll_ticks();
        let tx = self.tx.clone();
        let mut ticks: u64 = 0;
        info!(poll, limit, "polling for a new QR code");
        self.poll = Some(timer::every(self.settings.qr_poll_interval, move || {
            ticks += 1;
            if tx.send(Command::PollTick { poll }).is_err() {
                return false;
            }
            if ticks >= limit {
                let _ = tx.send(Command::PollFinished { poll });
                return false;
            }
            true
        }));
    }

    fn stop_polling(&mut self) {
        if let Some(mut poll) = self.poll.take() {
            poll.cancel();
        }
    }

    fn poll_active(&self, poll: u64) -> bool {
        poll == self.poll_id && self.poll.is_some()
    }

    fn report_failure(&mut self, context: &str, err: ClientError) {
        if err.is_auth() {
            self.expire_session(err.to_string());
            return;
        }
        warn!(context, error = %err, "backend call failed");
        let text = format!("{context} failed: {err}");
        self.last_error = Some(text.clone());
        self.notify(text, Severity::Error);
    }

    fn expire_session(&mut self, reason: String) {
        self.session.expire();
        self.last_error = Some(reason);
        if self.status.session_expired {
            return;
        }
        warn!("session expired; waiting for a new token");
        self.status.mark_session_expired();
        self.notices
            .push_persistent("Session expired. Sign in again to continue.", Severity::Error);
    }

    fn notify(&mut self, message: impl Into<String>, severity: Severity) {
        let id = self.notices.push(message, severity);
        let tx = self.tx.clone();
        self.notice_timers.insert(
            id,
            timer::after(self.settings.notification_ttl, move || {
                let _ = tx.send(Command::NoticeExpired(id));
            }),
        );
        // Evicted notices leave their timers behind.
        let live: Vec<u64> = self.notices.entries().iter().map(|n| n.id).collect();
        self.notice_timers.retain(|id, _| live.contains(id));
    }

    fn publish(&self) {
        let next = ConsoleView {
            status: self.status.clone(),
            notifications: self.notices.entries().to_vec(),
            sent: self.sent.entries().to_vec(),
            push_connected: self.push_connected,
            loading: self.in_flight > 0,
            polling: self.poll.is_some(),
            countdown_active: self.countdown.is_some(),
            auth: self.auth.clone(),
            last_error: self.last_error.clone(),
        };
        self.view_tx.send_if_modified(|view| {
            if *view == next {
                false
            } else {
                *view = next;
                true
            }
        });
    }
}

/// A poll only ends once the backend both flags an active QR and ships its image.
fn carries_qr(payload: &StatusPayload) -> bool {
    payload.has_active_qr
        && payload
            .qr_data
            .as_ref()
            .and_then(|qr| qr.image.as_deref())
            .is_some_and(|image| !image.is_empty())
}
