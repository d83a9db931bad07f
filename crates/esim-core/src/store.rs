use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

pub const DEFAULT_CODE_RETENTION: Duration = Duration::from_secs(600);

/// Opaque, non-blank activation credential. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct ActivationCode(String);

impl ActivationCode {
    /// Returns `None` for empty or whitespace-only input. The value is kept
    /// verbatim otherwise.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.trim().is_empty() {
            None
        } else {
            Some(Self(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn char_len(&self) -> usize {
        self.0.chars().count()
    }
}

impl fmt::Debug for ActivationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActivationCode(<{} chars>)", self.char_len())
    }
}

struct Pending {
    code: ActivationCode,
    stored_at: Instant,
}

/// Single-slot handoff for the pending activation code.
///
/// Last write wins. Each call is atomic on its own; callers keep at most one
/// installation in flight. A code older than the retention window reads as
/// absent.
pub struct ActivationCodeStore {
    slot: Mutex<Option<Pending>>,
    retention: Option<Duration>,
}

impl Default for ActivationCodeStore {
    fn default() -> Self {
        Self::new(Some(DEFAULT_CODE_RETENTION))
    }
}

impl ActivationCodeStore {
    /// `None` keeps codes until they are cleared or replaced.
    pub fn new(retention: Option<Duration>) -> Self {
        Self {
            slot: Mutex::new(None),
            retention,
        }
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention
    }

    pub fn set(&self, code: ActivationCode) {
        *self.lock() = Some(Pending {
            code,
            stored_at: Instant::now(),
        });
    }

    /// Copies the pending code out. Never mutates the slot.
    pub fn get(&self) -> Option<ActivationCode> {
        let slot = self.lock();
        let pending = slot.as_ref()?;
        if self.expired(pending) {
            return None;
        }
        Some(pending.code.clone())
    }

    /// Returns whether a code was present.
    pub fn clear(&self) -> bool {
        self.lock().take().is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_none()
    }

    /// Drops an expired code. Returns whether anything was removed.
    pub fn sweep_expired(&self) -> bool {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|pending| self.expired(pending)) {
            *slot = None;
            true
        } else {
            false
        }
    }

    fn expired(&self, pending: &Pending) -> bool {
        match self.retention {
            Some(retention) => pending.stored_at.elapsed() >= retention,
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Pending>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
