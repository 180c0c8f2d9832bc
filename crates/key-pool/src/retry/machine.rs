//! Retry state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! The executor in `retry/mod.rs` performs the calls, marks keys exhausted
//! and sleeps as each action requires.

use std::time::Duration;

use provider::FailureKind;

use super::RetryPolicy;

/// Where a logical invocation currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// About to call (or calling) the external service
    Attempt,
    /// Sleeping before the next attempt
    BackoffWait,
    /// Previous key hit its quota; next attempt uses a fresh key
    RotateKey,
    /// Budgets on the primary model are spent; one attempt on the fallback
    ModelFallback,
    /// Terminal: payload returned
    Success,
    /// Terminal: typed failure returned
    FatalFailure,
}

/// Which model identifier the next call should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelChoice {
    Primary,
    Fallback,
}

/// Counters for one logical invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub phase: Phase,
    pub model: ModelChoice,
    /// External calls made so far
    pub calls: u32,
    /// Quota failures on the primary model
    pub key_rotations: u32,
    /// Transient failures on the primary model
    pub transient_retries: u32,
    /// Times the whole pool was found cooling down
    pub pool_waits: u32,
}

impl RetryState {
    pub fn start() -> Self {
        Self {
            phase: Phase::Attempt,
            model: ModelChoice::Primary,
            calls: 0,
            key_rotations: 0,
            transient_retries: 0,
            pool_waits: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Success | Phase::FatalFailure)
    }
}

/// What happened on the last step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryEvent {
    /// The external call returned text
    Succeeded,
    /// The external call failed and was classified
    CallFailed(FailureKind),
    /// The rotation manager had no usable key; soonest expiry is `retry_after` away
    PoolExhausted { retry_after: Duration },
}

/// What the executor should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Obtain a key and call the external service
    Call,
    /// Sleep, then obtain a key and call
    Sleep(Duration),
    /// Hand the payload to the caller
    Return,
    /// Hand the last failure to the caller
    Fail,
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(
    state: RetryState,
    event: RetryEvent,
    policy: &RetryPolicy,
) -> (RetryState, RetryAction) {
    let mut next = state;

    match event {
        RetryEvent::Succeeded => {
            next.calls += 1;
            next.phase = Phase::Success;
            (next, RetryAction::Return)
        }

        RetryEvent::CallFailed(FailureKind::QuotaExceeded) => {
            next.calls += 1;
            if state.model == ModelChoice::Fallback {
                return fail(next);
            }
            next.key_rotations += 1;
            if next.key_rotations < policy.max_key_rotations {
                next.phase = Phase::RotateKey;
                (next, RetryAction::Call)
            } else {
                fall_back(next, policy)
            }
        }

        RetryEvent::CallFailed(FailureKind::Transient) => {
            next.calls += 1;
            if state.model == ModelChoice::Fallback {
                return fail(next);
            }
            next.transient_retries += 1;
            if next.transient_retries <= policy.max_transient_retries {
                next.phase = Phase::BackoffWait;
                let delay = policy.backoff.delay(next.transient_retries);
                (next, RetryAction::Sleep(delay))
            } else {
                fall_back(next, policy)
            }
        }

        RetryEvent::CallFailed(FailureKind::Fatal) => {
            next.calls += 1;
            fail(next)
        }

        RetryEvent::PoolExhausted { retry_after } => {
            next.pool_waits += 1;
            if next.pool_waits <= policy.max_pool_waits {
                next.phase = Phase::BackoffWait;
                (next, RetryAction::Sleep(retry_after))
            } else {
                fail(next)
            }
        }
    }
}

fn fall_back(mut state: RetryState, policy: &RetryPolicy) -> (RetryState, RetryAction) {
    if policy.fallback_model.is_some() {
        state.phase = Phase::ModelFallback;
        state.model = ModelChoice::Fallback;
        (state, RetryAction::Call)
    } else {
        fail(state)
    }
}

fn fail(mut state: RetryState) -> (RetryState, RetryAction) {
    state.phase = Phase::FatalFailure;
    (state, RetryAction::Fail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(
        policy: &RetryPolicy,
        events: impl IntoIterator<Item = RetryEvent>,
    ) -> (RetryState, RetryAction) {
        let mut state = RetryState::start();
        let mut action = RetryAction::Call;
        for event in events {
            assert!(!state.is_terminal(), "event after terminal state: {event:?}");
            (state, action) = handle_event(state, event, policy);
        }
        (state, action)
    }

    const QUOTA: RetryEvent = RetryEvent::CallFailed(FailureKind::QuotaExceeded);
    const TRANSIENT: RetryEvent = RetryEvent::CallFailed(FailureKind::Transient);
    const FATAL: RetryEvent = RetryEvent::CallFailed(FailureKind::Fatal);

    #[test]
    fn success_returns() {
        let (state, action) = drive(&RetryPolicy::orchestration(), [RetryEvent::Succeeded]);
        assert_eq!(state.phase, Phase::Success);
        assert_eq!(action, RetryAction::Return);
        assert_eq!(state.calls, 1);
    }

    #[test]
    fn quota_rotates_without_sleeping() {
        let (state, action) = drive(&RetryPolicy::primary(None), [QUOTA]);
        assert_eq!(state.phase, Phase::RotateKey);
        assert_eq!(action, RetryAction::Call);
        assert_eq!(state.key_rotations, 1);
    }

    #[test]
    fn quota_budget_without_fallback_fails() {
        let (state, action) = drive(&RetryPolicy::primary(None), [QUOTA, QUOTA, QUOTA]);
        assert_eq!(state.phase, Phase::FatalFailure);
        assert_eq!(action, RetryAction::Fail);
        assert_eq!(state.calls, 3);
    }

    #[test]
    fn quota_budget_with_fallback_switches_model_once() {
        let policy = RetryPolicy::primary(Some("gemini-fallback".into()));
        let (state, action) = drive(&policy, [QUOTA, QUOTA, QUOTA]);
        assert_eq!(state.phase, Phase::ModelFallback);
        assert_eq!(state.model, ModelChoice::Fallback);
        assert_eq!(action, RetryAction::Call);

        let (state, action) = handle_event(state, QUOTA, &policy);
        assert_eq!(state.phase, Phase::FatalFailure);
        assert_eq!(action, RetryAction::Fail);
        assert_eq!(state.calls, 4);
    }

    #[test]
    fn fallback_transient_failure_is_final() {
        let policy = RetryPolicy::primary(Some("fb".into()));
        let (state, action) = drive(&policy, [QUOTA, QUOTA, QUOTA, TRANSIENT]);
        assert_eq!(state.phase, Phase::FatalFailure);
        assert_eq!(action, RetryAction::Fail);
    }

    #[test]
    fn transient_sleeps_with_growing_backoff() {
        let policy = RetryPolicy::primary(None);
        let (state, action) = drive(&policy, [TRANSIENT]);
        assert_eq!(state.phase, Phase::BackoffWait);
        assert_eq!(action, RetryAction::Sleep(Duration::from_secs(10)));

        let (_, action) = handle_event(state, TRANSIENT, &policy);
        assert_eq!(action, RetryAction::Sleep(Duration::from_secs(30)));
    }

    #[test]
    fn transient_budget_exhausted_fails() {
        let (state, action) = drive(
            &RetryPolicy::orchestration(),
            [TRANSIENT, TRANSIENT, TRANSIENT],
        );
        assert_eq!(state.phase, Phase::FatalFailure);
        assert_eq!(action, RetryAction::Fail);
        assert_eq!(state.transient_retries, 3);
    }

    #[test]
    fn fatal_fails_immediately() {
        let (state, action) = drive(&RetryPolicy::primary(Some("fb".into())), [FATAL]);
        assert_eq!(state.phase, Phase::FatalFailure);
        assert_eq!(action, RetryAction::Fail);
        assert_eq!(state.key_rotations, 0);
        assert_eq!(state.model, ModelChoice::Primary);
    }

    #[test]
    fn pool_exhaustion_waits_reported_time_within_budget() {
        let policy = RetryPolicy::orchestration();
        let wait = RetryEvent::PoolExhausted {
            retry_after: Duration::from_secs(17),
        };
        let (state, action) = drive(&policy, [wait]);
        assert_eq!(action, RetryAction::Sleep(Duration::from_secs(17)));
        assert_eq!(state.calls, 0, "waiting is not a call");

        let (state, action) = drive(&policy, std::iter::repeat_n(wait, 6));
        assert_eq!(state.phase, Phase::FatalFailure);
        assert_eq!(action, RetryAction::Fail);
    }

    #[test]
    fn primary_policy_surfaces_pool_exhaustion() {
        let (_, action) = drive(
            &RetryPolicy::primary(None),
            [RetryEvent::PoolExhausted {
                retry_after: Duration::from_secs(3),
            }],
        );
        assert_eq!(action, RetryAction::Fail);
    }

    #[test]
    fn calls_are_bounded_for_any_failure_sequence() {
        let policy = RetryPolicy::primary(Some("fb".into()));
        let bound = policy.max_calls();
        let kinds = [QUOTA, TRANSIENT];

        // Every mix of quota/transient failures of length up to 8
        for mask in 0u32..(1 << 8) {
            let mut state = RetryState::start();
            for i in 0..8 {
                let event = kinds[((mask >> i) & 1) as usize];
                let (next, action) = handle_event(state, event, &policy);
                state = next;
                if action == RetryAction::Fail {
                    break;
                }
            }
            assert!(state.calls <= bound, "mask {mask:08b}: {} calls", state.calls);
        }
    }
}
