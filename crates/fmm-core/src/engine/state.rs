//! Engine lifecycle state machine.
//!
//! `New -> Prepared -> Running -> Completed`. `Prepared` is reached once
//! groups/handles are built and neighbour precomputation is complete;
//! `Completed` implies every worker has joined — partial state from an
//! aborted run is never observable.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    New,
    Prepared,
    Running,
    Completed,
}

impl EngineState {
    pub fn can_transition_to(self, next: EngineState) -> bool {
        matches!(
            (self, next),
            (EngineState::New, EngineState::Prepared)
                | (EngineState::Prepared, EngineState::Running)
                | (EngineState::Running, EngineState::Completed)
        )
    }
}

/// A guard around [`EngineState`] that rejects illegal transitions, shared
/// by all four engines so each only has to call `advance`.
#[derive(Debug, Clone, Copy)]
pub struct Lifecycle {
    state: EngineState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Lifecycle {
            state: EngineState::New,
        }
    }
}

impl Lifecycle {
    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn advance(&mut self, next: EngineState) -> crate::error::FmmResult<()> {
        if self.state.can_transition_to(next) {
            log::debug!("engine state {:?} -> {:?}", self.state, next);
            self.state = next;
            Ok(())
        } else {
            Err(crate::error::FmmError::assertion(format!(
                "illegal engine transition {:?} -> {:?}",
                self.state, next
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_follows_happy_path() {
        let mut lifecycle = Lifecycle::default();
        lifecycle.advance(EngineState::Prepared).unwrap();
        lifecycle.advance(EngineState::Running).unwrap();
        lifecycle.advance(EngineState::Completed).unwrap();
        assert_eq!(lifecycle.state(), EngineState::Completed);
    }

    #[test]
    fn lifecycle_rejects_skipping_prepared() {
        let mut lifecycle = Lifecycle::default();
        assert!(lifecycle.advance(EngineState::Running).is_err());
    }
}
