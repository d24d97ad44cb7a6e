//! Local and global sequence number assignment.
//!
//! The sequencer is fed actions in the agreed transport order. Every member
//! of a primary view starts from the same base seqno (agreed through the
//! quorum decision) and counts the same `Tordered` actions, so global seqnos
//! are identical everywhere without further communication.

use crate::types::{ActionType, Seqno};

/// Assigns sequence numbers to delivered actions.
#[derive(Debug, Clone)]
pub struct Sequencer {
    /// Last local seqno handed to the application.
    last_local: Seqno,

    /// Last global seqno ordered in the current history.
    last_global: Seqno,

    /// Global seqnos are only assigned while primary.
    primary: bool,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    /// Creates a sequencer with no actions delivered.
    pub fn new() -> Self {
        Self {
            last_local: Seqno::NIL,
            last_global: Seqno::NIL,
            primary: false,
        }
    }

    /// Creates a sequencer resuming a history that ended at `last_global`.
    ///
    /// No global seqnos are assigned until a primary view is installed.
    pub fn resume(last_global: Seqno) -> Self {
        Self {
            last_global,
            ..Self::new()
        }
    }

    /// Enters a primary view whose history ends at `base`.
    pub fn set_primary(&mut self, base: Seqno) {
        self.primary = true;
        self.last_global = base;
    }

    /// Enters a non-primary view. The last global seqno is kept.
    pub fn set_non_primary(&mut self) {
        self.primary = false;
    }

    /// Returns true if global seqnos are currently assigned.
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// Assigns the global seqno of an ordered action, if it gets one.
    pub fn assign_global(&mut self, act_type: ActionType) -> Option<Seqno> {
        if !self.primary || act_type != ActionType::Tordered {
            return None;
        }
        self.last_global = self.last_global.next();
        Some(self.last_global)
    }

    /// Assigns the next local seqno.
    ///
    /// Called exactly once per action surfaced to the application.
    pub fn next_local(&mut self) -> Seqno {
        self.last_local = self.last_local.next();
        self.last_local
    }

    /// Returns the last global seqno ordered.
    pub fn last_global(&self) -> Seqno {
        self.last_global
    }

    /// Returns the last local seqno handed out.
    pub fn last_local(&self) -> Seqno {
        self.last_local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_seqnos_are_gap_free() {
        let mut seq = Sequencer::new();
        for expected in 1..=100 {
            assert_eq!(seq.next_local(), Seqno::new(expected));
        }
    }

    #[test]
    fn global_only_for_tordered_in_primary() {
        let mut seq = Sequencer::new();
        assert_eq!(seq.assign_global(ActionType::Tordered), None);

        seq.set_primary(Seqno::new(10));
        assert_eq!(seq.assign_global(ActionType::Tordered), Some(Seqno::new(11)));
        assert_eq!(seq.assign_global(ActionType::Conf), None);
        assert_eq!(seq.assign_global(ActionType::CommitCut), None);
        assert_eq!(seq.assign_global(ActionType::Tordered), Some(Seqno::new(12)));

        seq.set_non_primary();
        assert_eq!(seq.assign_global(ActionType::Tordered), None);
        assert_eq!(seq.last_global(), Seqno::new(12));
    }

    #[test]
    fn resume_keeps_position_until_primary() {
        let mut seq = Sequencer::resume(Seqno::new(40));
        assert_eq!(seq.last_global(), Seqno::new(40));
        assert_eq!(seq.assign_global(ActionType::Tordered), None);
        seq.set_primary(Seqno::new(40));
        assert_eq!(seq.assign_global(ActionType::Tordered), Some(Seqno::new(41)));
    }

    #[test]
    fn primary_base_resets_global() {
        let mut seq = Sequencer::new();
        seq.set_primary(Seqno::new(3));
        seq.assign_global(ActionType::Tordered);
        seq.set_primary(Seqno::new(50));
        assert_eq!(seq.assign_global(ActionType::Tordered), Some(Seqno::new(51)));
        assert_eq!(seq.last_local(), Seqno::NIL);
    }
}
