//! Single-slot backup of a player's live pose during a rewind
//!
//! A backup is taken at most once per level time. Several shooters in the
//! same frame may each rewind the same bystander; only the first save
//! captures the true live pose and later saves are no-ops. A restore copies
//! the pose back and clears the slot, so a second restore does nothing.
//!
//! Finding a backup from an earlier frame means some rewind was never
//! restored. That is a bug elsewhere, so debug builds stop right there.
//!
//! The scope guard that pairs saves with restores is
//! `antilag::HistoricalWindow`.

use crate::history::Pose;
use log::error;

#[derive(Debug, Clone, Default)]
pub struct BackupSlot {
    pose: Pose,
    /// Level time the backup was taken at; `None` when empty
    saved_at: Option<i32>,
}

impl BackupSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when a backup taken during frame `now` is waiting to be restored
    pub fn is_held(&self, now: i32) -> bool {
        self.saved_at == Some(now)
    }

    pub fn saved_at(&self) -> Option<i32> {
        self.saved_at
    }

    /// Captures `live` unless a backup already exists for `now`.
    ///
    /// Returns true when this call took the backup.
    pub fn save_if_absent(&mut self, live: &Pose, now: i32) -> bool {
        match self.saved_at {
            Some(time) if time == now => false,
            Some(stale) => {
                debug_assert!(
                    false,
                    "stale pose backup from t={} found at t={}: a rewind was never restored",
                    stale, now
                );
                error!(
                    "stale pose backup from t={} found at t={}, overwriting",
                    stale, now
                );
                self.capture(live, now);
                true
            }
            None => {
                self.capture(live, now);
                true
            }
        }
    }

    fn capture(&mut self, live: &Pose, now: i32) {
        self.pose = *live;
        self.saved_at = Some(now);
    }

    /// Puts the backed-up pose back onto `live` if it was taken during `now`.
    pub fn restore(&mut self, live: &mut Pose, now: i32) -> bool {
        if !self.is_held(now) {
            return false;
        }
        *live = self.pose;
        self.saved_at = None;
        true
    }

    /// Drops any backup without restoring it. Used when a player's state is
    /// rebuilt from scratch (respawn, disconnect).
    pub fn clear(&mut self) {
        self.saved_at = None;
    }
}
