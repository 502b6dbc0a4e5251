//! The realtime-vs-legacy decision, made explicit.
//!
//! Fallback is a single-shot, one-directional move: a session that entered
//! realtime may drop to the legacy pipeline once, and only while no realtime
//! audio has been delivered yet. "Fallback already attempted" is a state,
//! not a flag buried in control flow.

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    Realtime,
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    /// Bridge is connecting/configuring; no audio delivered yet.
    TryingRealtime,
    /// Realtime audio has reached the client. No way back.
    RealtimeActive,
    LegacyActive,
    Closed,
}

#[derive(Debug)]
pub struct FallbackController {
    state: PipelineState,
    fallback_used: bool,
}

impl FallbackController {
    pub fn new() -> Self {
        Self {
            state: PipelineState::Init,
            fallback_used: false,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Leave `Init` according to the student's engine selection.
    pub fn start(&mut self, mode: PipelineMode) -> Result<PipelineState, SessionError> {
        if self.state != PipelineState::Init {
            return Err(SessionError::Transition("start outside Init"));
        }
        self.state = match mode {
            PipelineMode::Realtime => PipelineState::TryingRealtime,
            PipelineMode::Legacy => PipelineState::LegacyActive,
        };
        Ok(self.state)
    }

    /// First realtime audio byte has been forwarded to the client.
    pub fn realtime_serving(&mut self) -> Result<(), SessionError> {
        match self.state {
            PipelineState::TryingRealtime => {
                self.state = PipelineState::RealtimeActive;
                Ok(())
            }
            PipelineState::RealtimeActive => Ok(()),
            _ => Err(SessionError::Transition(
                "realtime_serving outside TryingRealtime",
            )),
        }
    }

    /// Single-shot demotion to the legacy pipeline. Permitted only from
    /// `TryingRealtime`: once realtime audio is flowing, failures terminate
    /// the session instead of risking audio double-delivery.
    pub fn fall_back(&mut self) -> Result<(), SessionError> {
        if self.fallback_used {
            return Err(SessionError::Transition("fallback already attempted"));
        }
        match self.state {
            PipelineState::TryingRealtime => {
                self.state = PipelineState::LegacyActive;
                self.fallback_used = true;
                Ok(())
            }
            PipelineState::RealtimeActive => Err(SessionError::Transition(
                "no downgrade after realtime audio started",
            )),
            _ => Err(SessionError::Transition("fallback outside TryingRealtime")),
        }
    }

    /// Disconnect or explicit end, valid from every state.
    pub fn close(&mut self) {
        self.state = PipelineState::Closed;
    }
}

impl Default for FallbackController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipelineState::*;

    fn controller_in(state: PipelineState) -> FallbackController {
        let mut c = FallbackController::new();
        match state {
            Init => {}
            TryingRealtime => {
                c.start(PipelineMode::Realtime).unwrap();
            }
            RealtimeActive => {
                c.start(PipelineMode::Realtime).unwrap();
                c.realtime_serving().unwrap();
            }
            LegacyActive => {
                c.start(PipelineMode::Legacy).unwrap();
            }
            Closed => {
                c.close();
            }
        }
        c
    }

    const ALL_STATES: [PipelineState; 5] =
        [Init, TryingRealtime, RealtimeActive, LegacyActive, Closed];

    #[test]
    fn exhaustive_transition_table() {
        for state in ALL_STATES {
            // start is only legal from Init.
            let mut c = controller_in(state);
            assert_eq!(
                c.start(PipelineMode::Realtime).is_ok(),
                state == Init,
                "start from {state:?}"
            );

            // realtime_serving is legal from TryingRealtime (and idempotent
            // in RealtimeActive).
            let mut c = controller_in(state);
            assert_eq!(
                c.realtime_serving().is_ok(),
                matches!(state, TryingRealtime | RealtimeActive),
                "realtime_serving from {state:?}"
            );

            // fall_back is only legal from TryingRealtime.
            let mut c = controller_in(state);
            assert_eq!(
                c.fall_back().is_ok(),
                state == TryingRealtime,
                "fall_back from {state:?}"
            );

            // close is legal from every state.
            let mut c = controller_in(state);
            c.close();
            assert_eq!(c.state(), Closed);
        }
    }

    #[test]
    fn fallback_happens_at_most_once_per_session() {
        let mut c = controller_in(TryingRealtime);
        c.fall_back().unwrap();
        assert_eq!(c.state(), LegacyActive);
        assert!(c.fall_back().is_err());
    }

    #[test]
    fn realtime_active_never_downgrades() {
        let mut c = controller_in(RealtimeActive);
        assert!(c.fall_back().is_err());
        assert_eq!(c.state(), RealtimeActive);
    }

    #[test]
    fn legacy_engine_goes_straight_to_legacy_active() {
        let mut c = FallbackController::new();
        assert_eq!(c.start(PipelineMode::Legacy).unwrap(), LegacyActive);
    }
}
