//! Upload state machine.
//!
//! ```text
//! Planning -> Uploading[0..n] -> Committing(Tree -> Commit -> Ref) -> Published
//!                                     ^                  |
//!                                     +---- Rebased -----+
//! ```
//!
//! Every remote call moves the machine one step, so a retry re-enters the
//! same state and cancellation always has a defined position. Only the
//! `Ref` step makes anything visible to readers.

use std::fmt;

use chunkstash_transfer::TransferPhase;

/// Sub-step of the publish transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStep {
    Tree,
    Commit,
    Ref,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    Planning,
    /// `next` objects of `total` have been stored.
    Uploading { next: usize, total: usize },
    Committing(PublishStep),
    Published { commit_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    Planned { objects: usize },
    ObjectStored { index: usize },
    TreeCreated,
    CommitCreated,
    /// The ref moved under us; rebuild on the new base.
    Rebased,
    RefUpdated { commit_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid upload transition from {from} on {event:?}")]
pub struct InvalidTransition {
    pub from: UploadState,
    pub event: UploadEvent,
}

impl UploadState {
    /// Applies `event`, returning the next state.
    pub fn apply(self, event: UploadEvent) -> Result<Self, InvalidTransition> {
        use UploadEvent as E;
        use UploadState as S;

        let next = match (&self, &event) {
            (S::Planning, E::Planned { objects }) if *objects > 0 => S::Uploading {
                next: 0,
                total: *objects,
            },
            (S::Uploading { next, total }, E::ObjectStored { index }) if index == next => {
                if index + 1 == *total {
                    S::Committing(PublishStep::Tree)
                } else {
                    S::Uploading {
                        next: index + 1,
                        total: *total,
                    }
                }
            }
            (S::Committing(PublishStep::Tree), E::TreeCreated) => S::Committing(PublishStep::Commit),
            (S::Committing(PublishStep::Commit), E::CommitCreated) => S::Committing(PublishStep::Ref),
            (S::Committing(PublishStep::Ref), E::Rebased) => S::Committing(PublishStep::Tree),
            (S::Committing(PublishStep::Ref), E::RefUpdated { commit_id }) => S::Published {
                commit_id: commit_id.clone(),
            },
            _ => return Err(InvalidTransition { from: self, event }),
        };
        Ok(next)
    }

    /// Advances in place.
    pub fn advance(&mut self, event: UploadEvent) -> Result<(), InvalidTransition> {
        let current = std::mem::replace(self, UploadState::Planning);
        match current.apply(event) {
            Ok(next) => {
                *self = next;
                Ok(())
            }
            Err(e) => {
                *self = e.from.clone();
                Err(e)
            }
        }
    }

    /// Progress phase this state reports under.
    pub fn phase(&self) -> TransferPhase {
        match self {
            Self::Planning => TransferPhase::Planning,
            Self::Uploading { .. } => TransferPhase::Uploading,
            Self::Committing(_) => TransferPhase::Committing,
            Self::Published { .. } => TransferPhase::Done,
        }
    }

    pub fn is_published(&self) -> bool {
        matches!(self, Self::Published { .. })
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Planning => f.write_str("planning"),
            Self::Uploading { next, total } => write!(f, "uploading[{next}/{total}]"),
            Self::Committing(step) => write!(f, "committing({step:?})"),
            Self::Published { commit_id } => write!(f, "published({commit_id})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut state = UploadState::Planning;
        state.advance(UploadEvent::Planned { objects: 2 }).unwrap();
        assert_eq!(state, UploadState::Uploading { next: 0, total: 2 });
        state.advance(UploadEvent::ObjectStored { index: 0 }).unwrap();
        state.advance(UploadEvent::ObjectStored { index: 1 }).unwrap();
        assert_eq!(state, UploadState::Committing(PublishStep::Tree));
        state.advance(UploadEvent::TreeCreated).unwrap();
        state.advance(UploadEvent::CommitCreated).unwrap();
        state
            .advance(UploadEvent::RefUpdated {
                commit_id: "c1".into(),
            })
            .unwrap();
        assert!(state.is_published());
        assert_eq!(state.phase(), TransferPhase::Done);
    }

    #[test]
    fn chunks_must_arrive_in_order() {
        let mut state = UploadState::Planning;
        state.advance(UploadEvent::Planned { objects: 3 }).unwrap();
        let err = state
            .advance(UploadEvent::ObjectStored { index: 1 })
            .unwrap_err();
        assert_eq!(err.from, UploadState::Uploading { next: 0, total: 3 });
        // State is unchanged after a rejected event.
        assert_eq!(state, UploadState::Uploading { next: 0, total: 3 });
    }

    #[test]
    fn cannot_publish_before_all_chunks() {
        let state = UploadState::Uploading { next: 1, total: 3 };
        assert!(state.apply(UploadEvent::TreeCreated).is_err());
    }

    #[test]
    fn rebase_returns_to_tree_step() {
        let state = UploadState::Committing(PublishStep::Ref);
        assert_eq!(
            state.apply(UploadEvent::Rebased).unwrap(),
            UploadState::Committing(PublishStep::Tree)
        );
    }

    #[test]
    fn empty_plan_is_rejected() {
        assert!(
            UploadState::Planning
                .apply(UploadEvent::Planned { objects: 0 })
                .is_err()
        );
    }
}
