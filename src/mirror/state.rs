use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of an [`AsyncMirror`](super::AsyncMirror).
///
/// ```text
/// Uninitialized ──▶ Syncing ──▶ Ready
///                      │
///                      └──────▶ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MirrorState {
    /// Constructed, initial crawl not started.
    Uninitialized = 0,
    /// Initial crawl of the remote in progress.
    Syncing = 1,
    /// Serving calls; replay worker running.
    Ready = 2,
    /// Initial crawl failed. Terminal.
    Failed = 3,
}

impl MirrorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => MirrorState::Uninitialized,
            1 => MirrorState::Syncing,
            2 => MirrorState::Ready,
            _ => MirrorState::Failed,
        }
    }
}

impl fmt::Display for MirrorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MirrorState::Uninitialized => "uninitialized",
            MirrorState::Syncing => "syncing",
            MirrorState::Ready => "ready",
            MirrorState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Atomic holder for a [`MirrorState`].
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: MirrorState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> MirrorState {
        MirrorState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: MirrorState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to`; fails with the actual state otherwise.
    pub(crate) fn transition(&self, from: MirrorState, to: MirrorState) -> Result<(), MirrorState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(MirrorState::from_u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_from_expected_state() {
        let cell = StateCell::new(MirrorState::Uninitialized);
        assert!(cell.transition(MirrorState::Uninitialized, MirrorState::Syncing).is_ok());
        assert_eq!(
            cell.transition(MirrorState::Uninitialized, MirrorState::Syncing),
            Err(MirrorState::Syncing)
        );
        cell.set(MirrorState::Ready);
        assert_eq!(cell.get(), MirrorState::Ready);
        assert_eq!(cell.get().to_string(), "ready");
    }
}
