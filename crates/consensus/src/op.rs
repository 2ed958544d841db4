//! Log operations and the apply step.
//!
//! Everything the cluster agrees on travels through the replicated log as a
//! [`LogCommand`]. Applying a committed command mutates the local pin state
//! and yields an [`Effect`] for the pin tracker, emitted asynchronously by
//! the driver.

use crate::error::{ConsensusError, ConsensusResult};
use capstan_core::PinCid;
use capstan_state::{PinState, StateError};
use serde::{Deserialize, Serialize};

/// Kind of pin operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOpKind {
    Pin,
    Unpin,
}

/// A pin or unpin command over one CID.
///
/// Frozen once in the log. The CID travels in its canonical string form;
/// ordering across CIDs is log order, not submission order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOp {
    pub kind: LogOpKind,
    pub cid: String,
}

impl LogOp {
    pub fn pin(cid: &PinCid) -> Self {
        Self {
            kind: LogOpKind::Pin,
            cid: cid.to_string(),
        }
    }

    pub fn unpin(cid: &PinCid) -> Self {
        Self {
            kind: LogOpKind::Unpin,
            cid: cid.to_string(),
        }
    }
}

/// A replicated log command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogCommand {
    /// Appended by a fresh leader so entries from earlier terms become
    /// committable. Applies without effect.
    Noop,
    /// A pin or unpin operation.
    Op(LogOp),
    /// Cluster-wide restore from the embedded snapshot bytes. Ordered in
    /// the log like any other command so all peers converge.
    Rollback(Vec<u8>),
}

impl LogCommand {
    pub fn encode(&self) -> ConsensusResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ConsensusError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> ConsensusResult<Self> {
        bincode::deserialize(bytes).map_err(|e| ConsensusError::Codec(e.to_string()))
    }
}

/// The follow-up work an applied command asks of the pin tracker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    Track(PinCid),
    Untrack(PinCid),
    None,
}

/// Apply a committed command payload to the state.
///
/// Soft failures (unpin of an absent CID, an undecodable future command)
/// succeed without effect: the log is authoritative and replays must be
/// idempotent. A hard failure leaves the state untouched and is escalated
/// to the rollback protocol by the caller. In every non-error path the
/// state's version advances to `index`.
pub fn apply(payload: &[u8], state: &mut dyn PinState, index: u64) -> ConsensusResult<Effect> {
    let command = match LogCommand::decode(payload) {
        Ok(command) => command,
        Err(e) => {
            tracing::error!(index, error = %e, "unknown log command, ignoring");
            state.set_version(index);
            return Ok(Effect::None);
        }
    };

    let effect = match command {
        LogCommand::Noop => Effect::None,
        LogCommand::Op(op) => {
            let cid = PinCid::decode(&op.cid)?;
            match op.kind {
                LogOpKind::Pin => {
                    state.add(&cid)?;
                    Effect::Track(cid)
                }
                LogOpKind::Unpin => match state.remove(&cid) {
                    Ok(()) => Effect::Untrack(cid),
                    Err(StateError::NotPinned(_)) => {
                        tracing::debug!(index, cid = %cid, "unpin of absent cid, already applied");
                        Effect::None
                    }
                    Err(e) => return Err(e.into()),
                },
            }
        }
        LogCommand::Rollback(bytes) => {
            state.restore(&bytes)?;
            Effect::None
        }
    };

    state.set_version(index);
    Ok(effect)
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_state::MemPinState;

    fn cid(n: u8) -> PinCid {
        PinCid::from_raw_data(&[n])
    }

    fn encoded(command: &LogCommand) -> Vec<u8> {
        command.encode().unwrap()
    }

    #[test]
    fn pin_adds_and_emits_track() {
        let mut state = MemPinState::new();
        let c = cid(1);
        let payload = encoded(&LogCommand::Op(LogOp::pin(&c)));

        let effect = apply(&payload, &mut state, 1).unwrap();
        assert_eq!(effect, Effect::Track(c));
        assert!(state.has(&c));
        assert_eq!(state.version(), 1);
    }

    #[test]
    fn replayed_pin_is_idempotent_but_reemits_track() {
        let mut state = MemPinState::new();
        let c = cid(2);
        let payload = encoded(&LogCommand::Op(LogOp::pin(&c)));

        apply(&payload, &mut state, 1).unwrap();
        let effect = apply(&payload, &mut state, 2).unwrap();

        // At-least-once: the second apply emits Track again.
        assert_eq!(effect, Effect::Track(c));
        assert_eq!(state.list().len(), 1);
        assert_eq!(state.version(), 2);
    }

    #[test]
    fn unpin_removes_and_emits_untrack() {
        let mut state = MemPinState::new();
        let c = cid(3);
        apply(&encoded(&LogCommand::Op(LogOp::pin(&c))), &mut state, 1).unwrap();

        let effect = apply(&encoded(&LogCommand::Op(LogOp::unpin(&c))), &mut state, 2).unwrap();
        assert_eq!(effect, Effect::Untrack(c));
        assert!(!state.has(&c));
    }

    #[test]
    fn unpin_of_absent_is_soft_success() {
        let mut state = MemPinState::new();
        let payload = encoded(&LogCommand::Op(LogOp::unpin(&cid(4))));

        let effect = apply(&payload, &mut state, 1).unwrap();
        assert_eq!(effect, Effect::None);
        assert_eq!(state.version(), 1);
    }

    #[test]
    fn undecodable_command_is_skipped() {
        let mut state = MemPinState::new();
        let effect = apply(b"\xff\xff\xff\xff", &mut state, 1).unwrap();
        assert_eq!(effect, Effect::None);
        assert_eq!(state.version(), 1);
    }

    #[test]
    fn rollback_restores_and_advances_version() {
        let mut state = MemPinState::new();
        for n in 0..3u8 {
            apply(
                &encoded(&LogCommand::Op(LogOp::pin(&cid(n)))),
                &mut state,
                u64::from(n) + 1,
            )
            .unwrap();
        }
        let snapshot = state.snapshot().unwrap();
        apply(&encoded(&LogCommand::Op(LogOp::pin(&cid(9)))), &mut state, 4).unwrap();

        let effect = apply(&encoded(&LogCommand::Rollback(snapshot)), &mut state, 5).unwrap();
        assert_eq!(effect, Effect::None);
        assert!(!state.has(&cid(9)));
        assert_eq!(state.list().len(), 3);
        // The rollback entry's own index wins over the snapshot's.
        assert_eq!(state.version(), 5);
    }

    #[test]
    fn rollback_of_foreign_bytes_is_a_hard_failure() {
        let mut state = MemPinState::new();
        let err = apply(
            &encoded(&LogCommand::Rollback(b"junk".to_vec())),
            &mut state,
            1,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConsensusError::State(StateError::TypeMismatch(_))
        ));
    }
}
