use serde::Serialize;

/// Upper bound so a flapping push channel cannot grow the log without limit.
pub const MAX_NOTIFICATIONS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: u64,
    pub message: String,
    pub severity: Severity,
    /// Persistent notices stay until dismissed explicitly.
    pub persistent: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationLog {
    next_id: u64,
    entries: Vec<Notification>,
}

impl NotificationLog {
    pub fn push(&mut self, message: impl Into<String>, severity: Severity) -> u64 {
        self.insert(message.into(), severity, false)
    }

    pub fn push_persistent(&mut self, message: impl Into<String>, severity: Severity) -> u64 {
        self.insert(message.into(), severity, true)
    }

    /// Removes a notice; unknown ids are ignored.
    pub fn dismiss(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.entries.len() != before
    }

    /// Auto-expiry path: leaves persistent notices in place.
    pub fn expire(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id || entry.persistent);
        self.entries.len() != before
    }

    pub fn entries(&self) -> &[Notification] {
        &self.entries
    }

    fn insert(&mut self, message: String, severity: Severity, persistent: bool) -> u64 {
        self.next_id = self.next_id.wrapping_add(1);
        let id = self.next_id;
        if self.entries.len() >= MAX_NOTIFICATIONS {
            // Oldest transient notice goes first; persistent ones are kept if possible.
            let victim = self
                .entries
                .iter()
                .position(|entry| !entry.persistent)
                .unwrap_or(0);
            self.entries.remove(victim);
        }
        self.entries.push(Notification {
            id,
            message,
            severity,
            persistent,
        });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let mut log = NotificationLog::default();
        let a = log.push("a", Severity::Info);
        let b = log.push("b", Severity::Info);
        assert!(b > a);
        assert_eq!(log.entries().len(), 2);
    }

    #[test]
    fn expire_keeps_persistent_entries() {
        let mut log = NotificationLog::default();
        let transient = log.push("refreshed", Severity::Info);
        let alert = log.push_persistent("logged out", Severity::Error);

        assert!(log.expire(transient));
        assert!(!log.expire(alert));
        assert_eq!(log.entries().len(), 1);
        assert!(log.dismiss(alert));
        assert!(log.entries().is_empty());
        assert!(!log.dismiss(alert));
    }

    #[test]
    fn overflow_drops_oldest_transient() {
        let mut log = NotificationLog::default();
        let alert = log.push_persistent("logged out", Severity::Error);
        for index in 0..MAX_NOTIFICATIONS {
            log.push(format!("notice {index}"), Severity::Info);
        }
        assert_eq!(log.entries().len(), MAX_NOTIFICATIONS);
        assert_eq!(log.entries()[0].id, alert);
        assert_eq!(log.entries()[1].message, "notice 1");
    }
}
