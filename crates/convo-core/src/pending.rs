// Two-phase operation tracking.
//
// An operation is applied locally first and remembers how to undo itself.
// The network phase then either commits it or rolls it back. At most one
// operation per tracker may be in flight.

use crate::error::ChatError;

/// Tracks one in-flight operation. `S` is the rollback state captured when
/// the operation began.
#[derive(Debug)]
pub struct PendingOp<S> {
    label: &'static str,
    rollback: Option<S>,
}

impl<S> PendingOp<S> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            rollback: None,
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn is_pending(&self) -> bool {
        self.rollback.is_some()
    }

    /// Enter the pending phase, holding `rollback` until the outcome is known.
    pub fn begin(&mut self, rollback: S) -> Result<(), ChatError> {
        if self.is_pending() {
            return Err(ChatError::Busy(self.label));
        }
        self.rollback = Some(rollback);
        Ok(())
    }

    /// The network phase succeeded. Returns the discarded rollback state.
    pub fn commit(&mut self) -> Option<S> {
        self.rollback.take()
    }

    /// The network phase failed. Returns the rollback state to restore, or
    /// `None` if nothing was in flight.
    pub fn roll_back(&mut self) -> Option<S> {
        self.rollback.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_then_commit() {
        let mut op = PendingOp::new("send");
        op.begin("draft".to_string()).unwrap();
        assert!(op.is_pending());
        assert_eq!(op.commit().as_deref(), Some("draft"));
        assert!(!op.is_pending());
    }

    #[test]
    fn roll_back_returns_captured_state() {
        let mut op = PendingOp::new("edit");
        op.begin(7u32).unwrap();
        assert_eq!(op.roll_back(), Some(7));
        assert!(!op.is_pending());
    }

    #[test]
    fn second_begin_while_pending_is_busy() {
        let mut op = PendingOp::new("send");
        op.begin(1u8).unwrap();
        let err = op.begin(2u8).unwrap_err();
        assert!(matches!(err, ChatError::Busy("send")));
        // The original rollback state survives.
        assert_eq!(op.roll_back(), Some(1));
    }

    #[test]
    fn finishing_without_begin_is_a_no_op() {
        let mut op: PendingOp<()> = PendingOp::new("clear");
        assert_eq!(op.commit(), None);

        op.begin(()).unwrap();
        op.commit();
        assert_eq!(op.roll_back(), None);
    }

    #[test]
    fn can_begin_again_after_finish() {
        let mut op = PendingOp::new("delete");
        op.begin("a").unwrap();
        op.roll_back();
        op.begin("b").unwrap();
        assert_eq!(op.commit(), Some("b"));
    }
}
