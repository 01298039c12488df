use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::countdown::remaining_seconds;

/// Status shape shared by `GET /status` responses and push events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_connected: bool,
    #[serde(default, rename = "hasActiveQR", deserialize_with = "null_as_default")]
    pub has_active_qr: bool,
    #[serde(default)]
    pub qr_data: Option<QrData>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub connection_state: Map<String, Value>,
    /// Only honoured on push events.
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_logged_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrData {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Backends send `null` where a field is unknown; treat it like a missing key.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Accepts RFC 3339 strings or epoch milliseconds.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Millis(i64),
        Float(f64),
    }

    let raw = Option::<Raw>::deserialize(deserializer)?;
    Ok(match raw {
        None => None,
        Some(Raw::Text(text)) => DateTime::parse_from_rfc3339(text.trim())
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        Some(Raw::Millis(ms)) => Utc.timestamp_millis_opt(ms).single(),
        Some(Raw::Float(ms)) => Utc.timestamp_millis_opt(ms as i64).single(),
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStatus {
    pub has_active_qr: bool,
    pub is_connected: bool,
    pub qr_info: Option<QrData>,
    pub connection_state: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrSnapshot {
    pub image: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownAction {
    Start(u64),
    Stop,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub countdown: CountdownAction,
    pub logged_out: bool,
    pub discarded: bool,
}

impl ApplyOutcome {
    fn discarded() -> Self {
        Self {
            countdown: CountdownAction::Unchanged,
            logged_out: false,
            discarded: true,
        }
    }
}

/// Marks the moment a pull was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullTicket(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Running(u64),
    Expired,
    Idle,
}

/// What an operator should be looking at right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    SessionExpired,
    Connected,
    AwaitingScan,
    Disconnected,
}

/// Local reconciliation of pulls, push events and the countdown.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusView {
    pub status: ConnectionStatus,
    pub qr: Option<QrSnapshot>,
    pub remaining_secs: u64,
    pub session_expired: bool,
    pushes_applied: u64,
    version: Option<u64>,
}

impl StatusView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_pull(&self) -> PullTicket {
        PullTicket(self.pushes_applied)
    }

    pub fn apply_push(&mut self, payload: &StatusPayload, now: DateTime<Utc>) -> ApplyOutcome {
        if payload.is_logged_out {
            self.reset_logged_out();
            self.pushes_applied = self.pushes_applied.saturating_add(1);
            self.note_version(payload.version);
            return ApplyOutcome {
                countdown: CountdownAction::Stop,
                logged_out: true,
                discarded: false,
            };
        }

        if self.is_stale_version(payload.version) {
            return ApplyOutcome::discarded();
        }

        self.pushes_applied = self.pushes_applied.saturating_add(1);
        self.merge(payload, now)
    }

    pub fn apply_pull(
        &mut self,
        ticket: PullTicket,
        payload: &StatusPayload,
        now: DateTime<Utc>,
    ) -> ApplyOutcome {
        // A push landed while this pull was in flight; the push is newer.
        if ticket.0 != self.pushes_applied || self.is_stale_version(payload.version) {
            return ApplyOutcome::discarded();
        }
        self.merge(payload, now)
    }

    /// One countdown step. Clears the QR exactly once when reaching zero.
    pub fn tick(&mut self) -> Tick {
        if self.remaining_secs == 0 {
            return Tick::Idle;
        }
        self.remaining_secs -= 1;
        if self.remaining_secs == 0 {
            self.qr = None;
            Tick::Expired
        } else {
            Tick::Running(self.remaining_secs)
        }
    }

    pub fn mark_session_expired(&mut self) {
        self.session_expired = true;
    }

    pub fn clear_session_expired(&mut self) {
        self.session_expired = false;
    }

    pub fn phase(&self) -> Phase {
        if self.session_expired {
            Phase::SessionExpired
        } else if self.status.is_connected {
            Phase::Connected
        } else if self.qr.is_some() {
            Phase::AwaitingScan
        } else {
            Phase::Disconnected
        }
    }

    fn merge(&mut self, payload: &StatusPayload, now: DateTime<Utc>) -> ApplyOutcome {
        self.note_version(payload.version);
        self.status = ConnectionStatus {
            has_active_qr: payload.has_active_qr,
            is_connected: payload.is_connected,
            qr_info: payload.qr_data.clone(),
            connection_state: payload.connection_state.clone(),
        };
        self.session_expired = false;

        let snapshot = payload.qr_data.as_ref().and_then(|qr| {
            let image = qr.image.as_ref().filter(|image| !image.is_empty())?;
            Some((image.clone(), qr.expires_at, qr.created_at))
        });

        let countdown = match snapshot {
            Some((image, Some(expires_at), created_at)) => {
                let remaining = remaining_seconds(expires_at, now);
                if remaining > 0 {
                    self.qr = Some(QrSnapshot {
                        image,
                        expires_at,
                        created_at,
                    });
                    self.remaining_secs = remaining;
                    CountdownAction::Start(remaining)
                } else {
                    self.clear_qr();
                    CountdownAction::Stop
                }
            }
            // An image without an expiry is already unusable.
            Some((_, None, _)) | None => {
                self.clear_qr();
                CountdownAction::Stop
            }
        };

        ApplyOutcome {
            countdown,
            logged_out: false,
            discarded: false,
        }
    }

    fn reset_logged_out(&mut self) {
        let mut connection_state = Map::new();
        connection_state.insert("status".to_owned(), Value::String("logged_out".to_owned()));
        self.status = ConnectionStatus {
            has_active_qr: false,
            is_connected: false,
            qr_info: None,
            connection_state,
        };
        self.clear_qr();
    }

    fn clear_qr(&mut self) {
        self.qr = None;
        self.remaining_secs = 0;
    }

    fn is_stale_version(&self, incoming: Option<u64>) -> bool {
        matches!((incoming, self.version), (Some(incoming), Some(applied)) if incoming < applied)
    }

    fn note_version(&mut self, incoming: Option<u64>) {
        if let Some(incoming) = incoming {
            self.version = Some(self.version.map_or(incoming, |applied| applied.max(incoming)));
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn qr_payload(expires_in_ms: i64) -> StatusPayload {
        StatusPayload {
            has_active_qr: true,
            qr_data: Some(QrData {
                image: Some("data:image/png;base64,AAAA".to_owned()),
                expires_at: Some(now() + Duration::milliseconds(expires_in_ms)),
                created_at: Some(now()),
            }),
            ..StatusPayload::default()
        }
    }

    #[test]
    fn payload_accepts_string_and_millis_timestamps() {
        let text = r#"{
            "isConnected": false,
            "hasActiveQR": true,
            "qrData": {
                "image": "data:image/png;base64,AAAA",
                "expiresAt": "2025-03-01T12:01:00Z",
                "createdAt": 1740830400000
            },
            "connectionState": {"status": "qr"}
        }"#;
        let payload: StatusPayload = serde_json::from_str(text).unwrap();
        let qr = payload.qr_data.unwrap();
        assert_eq!(qr.expires_at, Some(now() + Duration::seconds(60)));
        assert_eq!(qr.created_at, Some(now()));
        assert!(payload.has_active_qr);
        assert_eq!(payload.connection_state["status"], "qr");
    }

    #[test]
    fn null_fields_read_as_defaults() {
        let text = r#"{
            "isConnected": null,
            "hasActiveQR": null,
            "qrData": null,
            "connectionState": null,
            "isLoggedOut": null,
            "version": null
        }"#;
        let payload: StatusPayload = serde_json::from_str(text).unwrap();
        assert_eq!(payload, StatusPayload::default());

        let qr: QrData =
            serde_json::from_str(r#"{"image":null,"expiresAt":null,"createdAt":null}"#).unwrap();
        assert_eq!(qr, QrData::default());
    }

    #[test]
    fn empty_object_is_a_disconnected_payload() {
        let payload: StatusPayload = serde_json::from_str("{}").unwrap();
        assert_eq!(payload, StatusPayload::default());
    }

    #[test]
    fn qr_push_starts_countdown_with_floored_seconds() {
        let mut view = StatusView::new();
        let outcome = view.apply_push(&qr_payload(59_999), now());
        assert_eq!(outcome.countdown, CountdownAction::Start(59));
        assert_eq!(view.remaining_secs, 59);
        assert!(view.qr.is_some());
        assert_eq!(view.phase(), Phase::AwaitingScan);
    }

    #[test]
    fn expired_qr_is_cleared_immediately() {
        let mut view = StatusView::new();
        let outcome = view.apply_push(&qr_payload(-5_000), now());
        assert_eq!(outcome.countdown, CountdownAction::Stop);
        assert!(view.qr.is_none());
        assert_eq!(view.remaining_secs, 0);
        // The raw payload is still recorded verbatim.
        assert!(view.status.has_active_qr);
    }

    #[test]
    fn sub_second_remainder_counts_as_expired() {
        let mut view = StatusView::new();
        let outcome = view.apply_push(&qr_payload(999), now());
        assert_eq!(outcome.countdown, CountdownAction::Stop);
        assert!(view.qr.is_none());
    }

    #[test]
    fn payload_without_image_clears_existing_qr() {
        let mut view = StatusView::new();
        view.apply_push(&qr_payload(30_000), now());

        let connected = StatusPayload {
            is_connected: true,
            ..StatusPayload::default()
        };
        let outcome = view.apply_push(&connected, now());
        assert_eq!(outcome.countdown, CountdownAction::Stop);
        assert!(view.qr.is_none());
        assert_eq!(view.phase(), Phase::Connected);
    }

    #[test]
    fn logged_out_push_overrides_everything_else() {
        let mut view = StatusView::new();
        view.apply_push(&qr_payload(30_000), now());

        let mut payload = qr_payload(30_000);
        payload.is_connected = true;
        payload.is_logged_out = true;
        let outcome = view.apply_push(&payload, now());

        assert!(outcome.logged_out);
        assert_eq!(outcome.countdown, CountdownAction::Stop);
        assert!(!view.status.is_connected);
        assert!(!view.status.has_active_qr);
        assert!(view.status.qr_info.is_none());
        assert!(view.qr.is_none());
        assert_eq!(view.status.connection_state["status"], "logged_out");
    }

    #[test]
    fn logged_out_flag_is_ignored_on_pull() {
        let mut view = StatusView::new();
        let mut payload = qr_payload(30_000);
        payload.is_logged_out = true;
        let ticket = view.begin_pull();
        let outcome = view.apply_pull(ticket, &payload, now());
        assert!(!outcome.logged_out);
        assert!(view.qr.is_some());
    }

    #[test]
    fn pull_issued_before_a_push_is_discarded() {
        let mut view = StatusView::new();
        let ticket = view.begin_pull();

        let connected = StatusPayload {
            is_connected: true,
            ..StatusPayload::default()
        };
        view.apply_push(&connected, now());

        let outcome = view.apply_pull(ticket, &qr_payload(30_000), now());
        assert!(outcome.discarded);
        assert!(view.status.is_connected);
        assert!(view.qr.is_none());
    }

    #[test]
    fn older_version_is_discarded() {
        let mut view = StatusView::new();
        let mut newer = qr_payload(30_000);
        newer.version = Some(7);
        view.apply_push(&newer, now());

        let older = StatusPayload {
            is_connected: true,
            version: Some(6),
            ..StatusPayload::default()
        };
        assert!(view.apply_push(&older, now()).discarded);
        assert!(!view.status.is_connected);

        let same = StatusPayload {
            is_connected: true,
            version: Some(7),
            ..StatusPayload::default()
        };
        assert!(!view.apply_push(&same, now()).discarded);
        assert!(view.status.is_connected);
    }

    #[test]
    fn countdown_expires_exactly_once() {
        let mut view = StatusView::new();
        view.apply_push(&qr_payload(3_000), now());

        assert_eq!(view.tick(), Tick::Running(2));
        assert_eq!(view.tick(), Tick::Running(1));
        assert_eq!(view.tick(), Tick::Expired);
        assert!(view.qr.is_none());
        assert_eq!(view.tick(), Tick::Idle);
        assert_eq!(view.tick(), Tick::Idle);
        assert_eq!(view.remaining_secs, 0);
    }

    #[test]
    fn successful_update_clears_session_expired() {
        let mut view = StatusView::new();
        view.mark_session_expired();
        assert_eq!(view.phase(), Phase::SessionExpired);
        let ticket = view.begin_pull();
        view.apply_pull(ticket, &StatusPayload::default(), now());
        assert_eq!(view.phase(), Phase::Disconnected);
    }
}
