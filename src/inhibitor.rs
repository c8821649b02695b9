//! Inhibitor records.
//!
//! An inhibitor is an application's standing objection to one or more
//! session transitions. The caller holds on to the random cookie and
//! presents it to withdraw the inhibitor later.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Which transitions an inhibitor blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InhibitFlags(pub u32);

impl InhibitFlags {
    pub const LOGOUT: Self = Self(1 << 0);
    pub const SWITCH_USER: Self = Self(1 << 1);
    pub const SUSPEND: Self = Self(1 << 2);
    pub const IDLE: Self = Self(1 << 3);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Human-readable list of the blocked transitions, for log lines.
    pub fn describe(self) -> String {
        let named = [
            (Self::LOGOUT, "logout"),
            (Self::SWITCH_USER, "switch-user"),
            (Self::SUSPEND, "suspend"),
            (Self::IDLE, "idle"),
        ];
        let parts: Vec<&str> = named
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if parts.is_empty() {
            "nothing".to_string()
        } else {
            parts.join(", ")
        }
    }
}

impl std::ops::BitOr for InhibitFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inhibitor {
    pub id: String,
    pub app_id: String,
    /// Set when the inhibitor belongs to a registered client; such
    /// inhibitors die with the client.
    pub client_id: Option<String>,
    pub reason: String,
    pub flags: InhibitFlags,
    pub toplevel_xid: u32,
    pub cookie: u32,
}

static NEXT_INHIBITOR: AtomicU64 = AtomicU64::new(1);

impl Inhibitor {
    pub fn new(
        app_id: String,
        client_id: Option<String>,
        reason: String,
        flags: InhibitFlags,
        toplevel_xid: u32,
    ) -> Self {
        let n = NEXT_INHIBITOR.fetch_add(1, Ordering::Relaxed);
        Self {
            id: format!("/org/mate/SessionManager/Inhibitor{}", n),
            app_id,
            client_id,
            reason,
            flags,
            toplevel_xid,
            cookie: generate_cookie(),
        }
    }
}

/// Random non-zero cookie; zero is reserved as "no cookie".
fn generate_cookie() -> u32 {
    let mut rng = rand::thread_rng();
    loop {
        let cookie: u32 = rng.gen();
        if cookie != 0 {
            return cookie;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inhibitors_get_distinct_ids_and_nonzero_cookies() {
        let a = Inhibitor::new(
            "gedit.desktop".to_string(),
            None,
            "Saving".to_string(),
            InhibitFlags::LOGOUT,
            0,
        );
        let b = Inhibitor::new(
            "gedit.desktop".to_string(),
            None,
            "Saving".to_string(),
            InhibitFlags::LOGOUT,
            0,
        );
        assert_ne!(a.id, b.id);
        assert_ne!(a.cookie, 0);
        assert_ne!(b.cookie, 0);
    }

    #[test]
    fn flags_combine_and_contain() {
        let flags = InhibitFlags::LOGOUT | InhibitFlags::IDLE;
        assert!(flags.contains(InhibitFlags::LOGOUT));
        assert!(flags.contains(InhibitFlags::IDLE));
        assert!(!flags.contains(InhibitFlags::SUSPEND));
    }

    #[test]
    fn describe_names_the_blocked_transitions() {
        assert_eq!(
            (InhibitFlags::LOGOUT | InhibitFlags::SUSPEND).describe(),
            "logout, suspend"
        );
        assert_eq!(InhibitFlags::SWITCH_USER.describe(), "switch-user");
        assert_eq!(InhibitFlags::default().describe(), "nothing");
    }
}
