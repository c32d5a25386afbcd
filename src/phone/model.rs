/// Call State Machine - Stateright Model
/// Exhaustively checks the call flows the phone facade implements:
/// outbound DIALING -> RINGING -> ANSWERED -> ENDED and the inbound
/// RINGING -> ANSWERED path, with BUSY/CANCELED/ERROR exits.
///
/// Run with: cargo test --release call_model -- --nocapture

use stateright::*;

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum ModelCallState {
    Dialing,
    Ringing,
    Answered,
    Ended,
    Busy,
    Canceled,
    Error,
}

impl ModelCallState {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            ModelCallState::Ended
                | ModelCallState::Busy
                | ModelCallState::Canceled
                | ModelCallState::Error
        )
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum CallAction {
    // Responses to our INVITE
    Receive180,
    Receive200,
    Receive486,
    Receive487,
    ReceiveErrorStatus,
    InviteTimeout,
    // Peer and application actions
    PeerBye,
    PeerCancel,
    AppAnswer,
    AppHangup,
}

/// A call plus its media session, as the model checker sees it.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct CallModel {
    pub state: ModelCallState,
    pub inbound: bool,
    pub media_active: bool,
}

#[derive(Clone)]
pub struct CallChecker {
    pub inbound: bool,
}

impl Model for CallChecker {
    type State = CallModel;
    type Action = CallAction;

    fn init_states(&self) -> Vec<Self::State> {
        vec![CallModel {
            state: if self.inbound {
                ModelCallState::Ringing
            } else {
                ModelCallState::Dialing
            },
            inbound: self.inbound,
            media_active: false,
        }]
    }

    fn actions(&self, state: &Self::State, actions: &mut Vec<Self::Action>) {
        match state.state {
            ModelCallState::Dialing => {
                actions.push(CallAction::Receive180);
                actions.push(CallAction::Receive200);
                actions.push(CallAction::Receive486);
                actions.push(CallAction::Receive487);
                actions.push(CallAction::ReceiveErrorStatus);
                actions.push(CallAction::InviteTimeout);
            }
            ModelCallState::Ringing => {
                if state.inbound {
                    actions.push(CallAction::AppAnswer);
                    actions.push(CallAction::PeerCancel);
                } else {
                    actions.push(CallAction::Receive200);
                    actions.push(CallAction::Receive486);
                    actions.push(CallAction::ReceiveErrorStatus);
                }
            }
            ModelCallState::Answered => {
                actions.push(CallAction::AppHangup);
                actions.push(CallAction::PeerBye);
            }
            _ => {
                // Terminal states take no actions
            }
        }
    }

    fn next_state(&self, state: &Self::State, action: Self::Action) -> Option<Self::State> {
        let mut next = state.clone();

        match action {
            CallAction::Receive180 => {
                if state.state == ModelCallState::Dialing {
                    next.state = ModelCallState::Ringing;
                }
            }
            CallAction::Receive200 => {
                if matches!(
                    state.state,
                    ModelCallState::Dialing | ModelCallState::Ringing
                ) && !state.inbound
                {
                    next.state = ModelCallState::Answered;
                    next.media_active = true;
                }
            }
            CallAction::AppAnswer => {
                if state.state == ModelCallState::Ringing && state.inbound {
                    next.state = ModelCallState::Answered;
                    next.media_active = true;
                }
            }
            CallAction::Receive486 => {
                if !state.state.is_terminal() {
                    next.state = ModelCallState::Busy;
                    next.media_active = false;
                }
            }
            CallAction::Receive487 | CallAction::PeerCancel => {
                if !state.state.is_terminal() {
                    next.state = ModelCallState::Canceled;
                    next.media_active = false;
                }
            }
            CallAction::ReceiveErrorStatus | CallAction::InviteTimeout => {
                if !state.state.is_terminal() {
                    next.state = ModelCallState::Error;
                    next.media_active = false;
                }
            }
            CallAction::AppHangup | CallAction::PeerBye => {
                if state.state == ModelCallState::Answered {
                    next.state = ModelCallState::Ended;
                    next.media_active = false;
                }
            }
        }

        Some(next)
    }

    fn properties(&self) -> Vec<Property<Self>> {
        vec![
            // Safety: media only runs while the call is answered
            Property::always("media_only_when_answered", |_, state: &CallModel| {
                !state.media_active || state.state == ModelCallState::Answered
            }),
            // Safety: terminal states never keep media alive
            Property::always("terminal_releases_media", |_, state: &CallModel| {
                !state.state.is_terminal() || !state.media_active
            }),
            // Liveness: every call eventually reaches a terminal state
            Property::eventually("call_terminates", |_, state: &CallModel| {
                state.state.is_terminal()
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stateright::Checker;

    #[test]
    fn call_model_check_outbound() {
        let checker = CallChecker { inbound: false }.checker().spawn_bfs().join();
        println!("States explored: {}", checker.unique_state_count());
        checker.assert_properties();
    }

    #[test]
    fn call_model_check_inbound() {
        let checker = CallChecker { inbound: true }.checker().spawn_bfs().join();
        checker.assert_properties();
    }

    #[test]
    fn call_model_outbound_happy_path() {
        let model = CallChecker { inbound: false };

        let mut state = model.init_states()[0].clone();
        assert_eq!(state.state, ModelCallState::Dialing);

        state = model.next_state(&state, CallAction::Receive180).unwrap();
        assert_eq!(state.state, ModelCallState::Ringing);

        state = model.next_state(&state, CallAction::Receive200).unwrap();
        assert_eq!(state.state, ModelCallState::Answered);
        assert!(state.media_active);

        state = model.next_state(&state, CallAction::AppHangup).unwrap();
        assert_eq!(state.state, ModelCallState::Ended);
        assert!(!state.media_active);
    }

    #[test]
    fn call_model_inbound_cancel_path() {
        let model = CallChecker { inbound: true };

        let mut state = model.init_states()[0].clone();
        assert_eq!(state.state, ModelCallState::Ringing);

        state = model.next_state(&state, CallAction::PeerCancel).unwrap();
        assert_eq!(state.state, ModelCallState::Canceled);
        assert!(!state.media_active);
    }

    #[test]
    fn call_model_busy_path() {
        let model = CallChecker { inbound: false };

        let mut state = model.init_states()[0].clone();
        state = model.next_state(&state, CallAction::Receive486).unwrap();
        assert_eq!(state.state, ModelCallState::Busy);
    }
}
