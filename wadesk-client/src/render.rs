use std::fmt::Write as _;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use wadesk_core::{Phase, Severity, TimeBand, format_time};

use crate::sync::ConsoleView;

/// Plain-text rendering of the console for terminal output.
pub fn render_view(view: &ConsoleView) -> String {
    let mut out = String::new();

    let phase = match view.phase() {
        Phase::SessionExpired => "session expired, sign in again",
        Phase::Connected => "connected",
        Phase::AwaitingScan => "waiting for QR scan",
        Phase::Disconnected => "disconnected",
    };
    let _ = writeln!(out, "whatsapp: {phase}");
    if let Some(state) = view
        .status
        .status
        .connection_state
        .get("status")
        .and_then(|value| value.as_str())
    {
        let _ = writeln!(out, "state:    {state}");
    }
    let _ = writeln!(
        out,
        "push:     {}",
        if view.push_connected { "live" } else { "offline" }
    );

    if view.status.qr.is_some() {
        let (clock, band) = format_time(view.status.remaining_secs);
        let marker = match band {
            TimeBand::Normal => "",
            TimeBand::Warning => " (expiring soon)",
            TimeBand::Critical => " (about to expire)",
        };
        let _ = writeln!(out, "qr:       expires in {clock}{marker}");
    }
    if view.polling {
        let _ = writeln!(out, "qr:       generating...");
    }
    if view.loading {
        let _ = writeln!(out, "          (request in flight)");
    }

    if let Some(auth) = &view.auth {
        let stored = if auth.exists { "present" } else { "absent" };
        let _ = writeln!(out, "auth:     stored session {stored}");
    }

    for notice in &view.notifications {
        let tag = match notice.severity {
            Severity::Info => "info",
            Severity::Success => "ok",
            Severity::Warning => "warn",
            Severity::Error => "error",
        };
        let _ = writeln!(out, "[{tag}] #{} {}", notice.id, notice.message);
    }

    if !view.sent.is_empty() {
        let _ = writeln!(out, "sent:");
        for sent in &view.sent {
            let _ = writeln!(
                out,
                "  {} {} ({})",
                sent.sent_at.format("%H:%M:%S"),
                sent.recipient,
                sent.template
            );
        }
    }

    out
}

/// Splits a `data:<mime>;base64,<payload>` URI into its MIME type and bytes.
pub fn decode_data_uri(uri: &str) -> Option<(String, Vec<u8>)> {
    let rest = uri.trim().strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let mime = header.strip_suffix(";base64")?;
    let bytes = STANDARD.decode(payload.trim()).ok()?;
    Some((mime.to_owned(), bytes))
}
