use serde_json::json;

use vigil_core::protocol::{AckStatus, EventKind, LeaseRef};

use super::types::{DrainTarget, Effect, Input, TransitionError, WorkerState};

/// Worker lifecycle with a bound on consecutive pipeline faults.
#[derive(Debug, Clone)]
pub struct WorkerMachine {
    state: WorkerState,
    consecutive_faults: u32,
    max_consecutive_faults: u32,
}

impl WorkerMachine {
    pub const fn new(max_consecutive_faults: u32) -> Self {
        Self {
            state: WorkerState::Init,
            consecutive_faults: 0,
            max_consecutive_faults,
        }
    }

    pub const fn state(&self) -> &WorkerState {
        &self.state
    }

    pub const fn consecutive_faults(&self) -> u32 {
        self.consecutive_faults
    }

    /// Apply one input. Unlisted `(state, input)` pairs are rejected and
    /// leave the machine untouched.
    #[allow(clippy::too_many_lines)]
    pub fn apply(&mut self, input: Input) -> Result<Vec<Effect>, TransitionError> {
        let rejected = TransitionError {
            state: self.state.name(),
            input: input.name(),
        };

        let (next, effects) = match (&self.state, input) {
            (WorkerState::Init, Input::Registered) => (WorkerState::Registered, vec![]),
            (WorkerState::Registered, Input::Idle) => (WorkerState::Idle, vec![]),

            (WorkerState::Registered | WorkerState::Idle, Input::Start(intent)) => {
                let lease = intent.lease();
                (
                    WorkerState::Starting {
                        lease: lease.clone(),
                        intent_id: intent.intent_id.clone(),
                    },
                    vec![Effect::StartPipeline(intent), Effect::ArmReadinessTimer(lease)],
                )
            }

            // Redelivered START for the pair already being served.
            (
                WorkerState::Starting { lease, .. } | WorkerState::Reconnecting { lease, .. },
                Input::Start(intent),
            ) if intent.lease() == *lease => return Ok(vec![]),
            (WorkerState::Running { lease }, Input::Start(intent)) if intent.lease() == *lease => {
                return Ok(vec![Effect::Ack {
                    intent_id: intent.intent_id,
                    lease: lease.clone(),
                    status: AckStatus::Ok,
                    detail: "already running".into(),
                }]);
            }

            (WorkerState::Starting { lease, intent_id }, Input::PipelineReady) => {
                self.consecutive_faults = 0;
                (
                    WorkerState::Running {
                        lease: lease.clone(),
                    },
                    vec![
                        Effect::CancelReadinessTimer,
                        Effect::Emit {
                            lease: lease.clone(),
                            kind: EventKind::PipelineReady,
                            payload: json!({ "detail": "pipeline ready" }),
                        },
                        Effect::Ack {
                            intent_id: intent_id.clone(),
                            lease: lease.clone(),
                            status: AckStatus::Ok,
                            detail: String::new(),
                        },
                    ],
                )
            }

            (WorkerState::Starting { lease, intent_id }, Input::ReadinessTimeout(timed_out))
                if timed_out == *lease =>
            {
                let reason = "pipeline readiness timeout".to_string();
                (
                    WorkerState::Error {
                        reason: reason.clone(),
                    },
                    vec![
                        Effect::StopPipeline,
                        Effect::Emit {
                            lease: lease.clone(),
                            kind: EventKind::PipelineError,
                            payload: json!({ "detail": reason, "fatal": true }),
                        },
                        Effect::Ack {
                            intent_id: intent_id.clone(),
                            lease: lease.clone(),
                            status: AckStatus::Failed,
                            detail: reason,
                        },
                    ],
                )
            }

            (WorkerState::Running { lease }, Input::TransientFault { detail }) => (
                WorkerState::Reconnecting {
                    lease: lease.clone(),
                    attempt: 0,
                },
                vec![
                    Effect::Emit {
                        lease: lease.clone(),
                        kind: EventKind::Reconnecting,
                        payload: json!({ "detail": detail, "attempt": 0 }),
                    },
                    Effect::ScheduleRetry {
                        lease: lease.clone(),
                        attempt: 0,
                    },
                ],
            ),

            (WorkerState::Reconnecting { lease, .. }, Input::Recovered) => (
                WorkerState::Running {
                    lease: lease.clone(),
                },
                vec![Effect::Emit {
                    lease: lease.clone(),
                    kind: EventKind::Recovered,
                    payload: json!({ "detail": "stream recovered" }),
                }],
            ),

            (WorkerState::Reconnecting { lease, attempt }, Input::RetryFailed { detail }) => {
                let attempt = attempt.saturating_add(1);
                (
                    WorkerState::Reconnecting {
                        lease: lease.clone(),
                        attempt,
                    },
                    vec![
                        Effect::Emit {
                            lease: lease.clone(),
                            kind: EventKind::Reconnecting,
                            payload: json!({ "detail": detail, "attempt": attempt }),
                        },
                        Effect::ScheduleRetry {
                            lease: lease.clone(),
                            attempt,
                        },
                    ],
                )
            }

            (WorkerState::Reconnecting { lease, .. }, Input::RetriesExhausted { detail }) => (
                WorkerState::Draining {
                    then: DrainTarget::Stopped,
                },
                vec![
                    Effect::StopPipeline,
                    Effect::ReleaseLease {
                        lease: lease.clone(),
                        reason: format!("reconnect retries exhausted: {detail}"),
                    },
                    Effect::FinishDrain,
                ],
            ),

            (
                WorkerState::Starting { lease, .. }
                | WorkerState::Running { lease }
                | WorkerState::Reconnecting { lease, .. },
                Input::Stop(stop),
            ) if stop.generation == lease.generation && stop.camera_id == lease.camera_id => (
                WorkerState::Draining {
                    then: DrainTarget::Idle,
                },
                vec![
                    Effect::CancelReadinessTimer,
                    Effect::StopPipeline,
                    Effect::Ack {
                        intent_id: stop.intent_id,
                        lease: lease.clone(),
                        status: AckStatus::Ok,
                        detail: String::new(),
                    },
                    Effect::FinishDrain,
                ],
            ),

            (WorkerState::Draining { .. }, Input::Drain(drain)) => (
                WorkerState::Draining {
                    then: DrainTarget::Stopped,
                },
                vec![drain_ack(drain.intent_id)],
            ),
            (state, Input::Drain(drain)) if *state != WorkerState::Stopped => {
                let mut effects = Vec::new();
                if state.lease().is_some() {
                    effects.push(Effect::CancelReadinessTimer);
                    effects.push(Effect::StopPipeline);
                }
                effects.push(drain_ack(drain.intent_id));
                effects.push(Effect::FinishDrain);
                (
                    WorkerState::Draining {
                        then: DrainTarget::Stopped,
                    },
                    effects,
                )
            }

            (WorkerState::Draining { then }, Input::Drained) => (
                match then {
                    DrainTarget::Idle => WorkerState::Idle,
                    DrainTarget::Stopped => WorkerState::Stopped,
                },
                vec![],
            ),

            (
                state @ (WorkerState::Starting { lease, .. }
                | WorkerState::Running { lease }
                | WorkerState::Reconnecting { lease, .. }),
                Input::UnrecoverableFault { detail },
            ) => {
                self.consecutive_faults = self.consecutive_faults.saturating_add(1);
                let fatal = self.consecutive_faults >= self.max_consecutive_faults;
                let mut effects = vec![Effect::CancelReadinessTimer, Effect::StopPipeline];
                if let WorkerState::Starting { intent_id, .. } = state {
                    effects.push(Effect::Ack {
                        intent_id: intent_id.clone(),
                        lease: lease.clone(),
                        status: AckStatus::Failed,
                        detail: detail.clone(),
                    });
                }
                effects.push(Effect::Emit {
                    lease: lease.clone(),
                    kind: EventKind::PipelineError,
                    payload: json!({
                        "detail": detail,
                        "fatal": fatal,
                        "consecutive_faults": self.consecutive_faults,
                    }),
                });
                let next = if fatal {
                    WorkerState::Error { reason: detail }
                } else {
                    WorkerState::Idle
                };
                (next, effects)
            }

            // A newer generation owns the camera: stop without releasing.
            (
                WorkerState::Starting { lease, .. }
                | WorkerState::Running { lease }
                | WorkerState::Reconnecting { lease, .. },
                Input::Invalidated(notice),
            ) if notice.camera_id == lease.camera_id
                && notice.stale_generation == lease.generation =>
            {
                (
                    WorkerState::Idle,
                    vec![Effect::CancelReadinessTimer, Effect::StopPipeline],
                )
            }
            (
                state @ (WorkerState::Draining { .. } | WorkerState::Stopped | WorkerState::Error { .. }),
                Input::Invalidated(_),
            ) => (state.clone(), vec![Effect::StopPipeline]),

            (WorkerState::Error { .. }, Input::Clear) => {
                self.consecutive_faults = 0;
                (WorkerState::Idle, vec![])
            }

            _ => return Err(rejected),
        };

        self.state = next;
        Ok(effects)
    }
}

/// Drain intents are worker-wide and carry no camera binding.
fn drain_ack(intent_id: String) -> Effect {
    Effect::Ack {
        intent_id,
        lease: LeaseRef::new(String::new(), 0),
        status: AckStatus::Ok,
        detail: String::new(),
    }
}
