use crate::{
    AuxCondition, CoreError, EventSink, GuestIntrospection, PowerControl, PowerState,
    ProbeOutcome, ProbePolicy, VmIdentity, WaitEvent, WaitLimit, WaitOutcome, WaitSpec,
};
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    BaseState,
    AuxConditions,
    Satisfied,
}

struct Progress {
    state: PowerState,
    elapsed: Duration,
    polls: u32,
    satisfied: BTreeSet<AuxCondition>,
    guest_ip: Option<String>,
}

impl Progress {
    fn new() -> Self {
        Self {
            state: PowerState::Unknown,
            elapsed: Duration::ZERO,
            polls: 1,
            satisfied: BTreeSet::new(),
            guest_ip: None,
        }
    }

    fn pending(&self, spec: &WaitSpec, phase: Phase) -> Vec<String> {
        let mut pending = Vec::new();
        if phase == Phase::BaseState {
            pending.push(format!("power state {}", spec.target()));
        }
        pending.extend(
            spec.conditions()
                .iter()
                .filter(|c| !self.satisfied.contains(c))
                .map(|c| c.label().to_string()),
        );
        pending
    }
}

/// Polls a VM at a fixed cadence until its power state matches the target
/// and every requested guest condition has latched.
///
/// Guest conditions are only probed once the power state matched; from then
/// on the power state is not read again. A latched condition is never probed
/// again, and conditions are probed in `AuxCondition` order, so a later one
/// is not looked at while an earlier one is still pending.
pub struct WaitEngine<'a, P: ?Sized, G: ?Sized> {
    power: &'a P,
    guest: &'a G,
    events: &'a dyn EventSink,
}

impl<'a, P, G> WaitEngine<'a, P, G>
where
    P: PowerControl + ?Sized,
    G: GuestIntrospection + ?Sized,
{
    pub fn new(power: &'a P, guest: &'a G, events: &'a dyn EventSink) -> Self {
        Self {
            power,
            guest,
            events,
        }
    }

    /// Block until `spec` holds for `vm`.
    ///
    /// # Errors
    /// Returns `CoreError::InvalidSpec` for an inconsistent spec,
    /// `CoreError::Timeout` when the spec's limit runs out, and
    /// `CoreError::Probe` when a probe fails under `ProbePolicy::Escalate`.
    pub async fn wait(&self, vm: &VmIdentity, spec: &WaitSpec) -> Result<WaitOutcome, CoreError> {
        spec.validate()?;

        let mut progress = Progress::new();
        let mut phase = Phase::BaseState;

        loop {
            let next = match phase {
                Phase::BaseState => self.poll_base_state(vm, spec, &mut progress).await,
                Phase::AuxConditions => self.poll_conditions(vm, spec, &mut progress).await?,
                Phase::Satisfied => {
                    self.events.emit(&WaitEvent::Satisfied {
                        vm: vm.clone(),
                        state: progress.state,
                        elapsed: progress.elapsed,
                    });
                    return Ok(WaitOutcome {
                        final_state: progress.state,
                        elapsed: progress.elapsed,
                        polls: progress.polls,
                        satisfied: progress.satisfied,
                        guest_ip: progress.guest_ip,
                        vm: vm.clone(),
                    });
                }
            };

            match next {
                Some(advanced) => phase = advanced,
                None => self.pace(vm, spec, &mut progress, phase).await?,
            }
        }
    }

    async fn poll_base_state(
        &self,
        vm: &VmIdentity,
        spec: &WaitSpec,
        progress: &mut Progress,
    ) -> Option<Phase> {
        match self.power.power_state(vm).await {
            Ok(state) => {
                progress.state = state;
                self.events.emit(&WaitEvent::StatePolled {
                    vm: vm.clone(),
                    state,
                    elapsed: progress.elapsed,
                });
                if state == spec.target() {
                    return Some(if spec.conditions().is_empty() {
                        Phase::Satisfied
                    } else {
                        Phase::AuxConditions
                    });
                }
            }
            Err(e) => {
                progress.state = PowerState::Unknown;
                self.events.emit(&WaitEvent::StatePollFailed {
                    vm: vm.clone(),
                    cause: e.to_string(),
                });
            }
        }
        None
    }

    async fn poll_conditions(
        &self,
        vm: &VmIdentity,
        spec: &WaitSpec,
        progress: &mut Progress,
    ) -> Result<Option<Phase>, CoreError> {
        for &condition in spec.conditions() {
            if progress.satisfied.contains(&condition) {
                continue;
            }

            let outcome = match condition {
                AuxCondition::GuestIpAssigned => self.guest.guest_ip(vm).await,
                AuxCondition::GuestCustomizationComplete => {
                    self.guest.customization_marker(vm).await
                }
            };

            match outcome {
                ProbeOutcome::Ready(value) if !value.trim().is_empty() => {
                    if condition == AuxCondition::GuestIpAssigned {
                        progress.guest_ip = Some(value.trim().to_string());
                    }
                    progress.satisfied.insert(condition);
                    self.events.emit(&WaitEvent::ConditionLatched {
                        vm: vm.clone(),
                        condition,
                        elapsed: progress.elapsed,
                    });
                }
                ProbeOutcome::Ready(_) | ProbeOutcome::NotYet => break,
                ProbeOutcome::Failed(cause) => match spec.probe_policy() {
                    ProbePolicy::Retry => {
                        self.events.emit(&WaitEvent::ProbeFailed {
                            vm: vm.clone(),
                            condition,
                            cause,
                        });
                        break;
                    }
                    ProbePolicy::Escalate => {
                        return Err(CoreError::Probe {
                            vm: vm.clone(),
                            condition,
                            cause,
                        });
                    }
                },
            }
        }

        if progress.satisfied.len() == spec.conditions().len() {
            Ok(Some(Phase::Satisfied))
        } else {
            Ok(None)
        }
    }

    async fn pace(
        &self,
        vm: &VmIdentity,
        spec: &WaitSpec,
        progress: &mut Progress,
        phase: Phase,
    ) -> Result<(), CoreError> {
        let interval = spec.interval().as_duration();
        let exhausted = match spec.limit() {
            WaitLimit::Unbounded => false,
            WaitLimit::Duration(max) => progress.elapsed + interval > max,
            WaitLimit::Polls(max) => progress.polls >= max,
        };
        if exhausted {
            return Err(CoreError::Timeout {
                vm: vm.clone(),
                waited: progress.elapsed,
                pending: progress.pending(spec, phase),
            });
        }

        tokio::time::sleep(interval).await;
        progress.elapsed += interval;
        progress.polls += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingSink, ScriptedPlane};
    use crate::{NullSink, PollInterval};
    use tokio::time::Instant;

    fn web01() -> VmIdentity {
        VmIdentity::new("vm-1", "web01", "vc1")
    }

    fn spec(target: PowerState, secs: u64) -> WaitSpec {
        WaitSpec::new(target, PollInterval::from_secs(secs).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_power_on_then_ip() {
        let plane = ScriptedPlane::single(web01())
            .with_states(vec![
                PowerState::PoweredOff,
                PowerState::PoweredOff,
                PowerState::PoweredOn,
            ])
            .with_ips(vec![
                ProbeOutcome::NotYet,
                ProbeOutcome::Ready("10.0.0.7".into()),
            ]);
        let engine = WaitEngine::new(&plane, &plane, &NullSink);
        let started = Instant::now();

        let outcome = engine
            .wait(
                &web01(),
                &spec(PowerState::PoweredOn, 5).with_condition(AuxCondition::GuestIpAssigned),
            )
            .await
            .unwrap();

        assert_eq!(outcome.final_state, PowerState::PoweredOn);
        assert_eq!(
            outcome.satisfied,
            BTreeSet::from([AuxCondition::GuestIpAssigned])
        );
        assert_eq!(outcome.elapsed, Duration::from_secs(15));
        assert_eq!(outcome.polls, 4);
        assert_eq!(outcome.guest_ip.as_deref(), Some("10.0.0.7"));
        assert_eq!(started.elapsed(), Duration::from_secs(15));
        assert_eq!(ScriptedPlane::count(&plane.state_polls), 3);
        assert_eq!(ScriptedPlane::count(&plane.ip_probes), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_without_sleeping_when_already_there() {
        let plane = ScriptedPlane::single(web01()).with_states(vec![PowerState::PoweredOff]);
        let engine = WaitEngine::new(&plane, &plane, &NullSink);
        let started = Instant::now();

        let outcome = engine
            .wait(&web01(), &spec(PowerState::PoweredOff, 5))
            .await
            .unwrap();

        assert_eq!(outcome.final_state, PowerState::PoweredOff);
        assert_eq!(outcome.elapsed, Duration::ZERO);
        assert_eq!(outcome.polls, 1);
        assert!(outcome.satisfied.is_empty());
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(ScriptedPlane::count(&plane.ip_probes), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_customization_waits_for_ip() {
        let plane = ScriptedPlane::single(web01())
            .with_states(vec![PowerState::PoweredOn])
            .with_ips(vec![
                ProbeOutcome::NotYet,
                ProbeOutcome::NotYet,
                ProbeOutcome::Ready("10.0.0.7".into()),
            ])
            .with_markers(vec![ProbeOutcome::Ready("done".into())]);
        let sink = RecordingSink::default();
        let engine = WaitEngine::new(&plane, &plane, &sink);

        let outcome = engine
            .wait(
                &web01(),
                &spec(PowerState::PoweredOn, 1)
                    .with_condition(AuxCondition::GuestCustomizationComplete)
                    .with_condition(AuxCondition::GuestIpAssigned),
            )
            .await
            .unwrap();

        assert_eq!(
            outcome.satisfied,
            BTreeSet::from([
                AuxCondition::GuestIpAssigned,
                AuxCondition::GuestCustomizationComplete
            ])
        );
        assert_eq!(ScriptedPlane::count(&plane.state_polls), 1);
        assert_eq!(ScriptedPlane::count(&plane.ip_probes), 3);
        assert_eq!(ScriptedPlane::count(&plane.marker_probes), 1);

        let latched: Vec<_> = sink
            .snapshot()
            .into_iter()
            .filter_map(|e| match e {
                WaitEvent::ConditionLatched { condition, .. } => Some(condition),
                _ => None,
            })
            .collect();
        assert_eq!(
            latched,
            vec![
                AuxCondition::GuestIpAssigned,
                AuxCondition::GuestCustomizationComplete
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_latched_ip_is_not_probed_again() {
        let plane = ScriptedPlane::single(web01())
            .with_states(vec![PowerState::PoweredOn])
            .with_ips(vec![
                ProbeOutcome::Ready("10.0.0.7".into()),
                ProbeOutcome::failed("agent gone"),
            ])
            .with_markers(vec![
                ProbeOutcome::NotYet,
                ProbeOutcome::failed("exec failed"),
                ProbeOutcome::Ready("done".into()),
            ]);
        let engine = WaitEngine::new(&plane, &plane, &NullSink);

        let outcome = engine
            .wait(
                &web01(),
                &spec(PowerState::PoweredOn, 2)
                    .with_condition(AuxCondition::GuestIpAssigned)
                    .with_condition(AuxCondition::GuestCustomizationComplete),
            )
            .await
            .unwrap();

        assert!(outcome.satisfied.contains(&AuxCondition::GuestIpAssigned));
        assert_eq!(outcome.guest_ip.as_deref(), Some("10.0.0.7"));
        assert_eq!(ScriptedPlane::count(&plane.ip_probes), 1);
        assert_eq!(ScriptedPlane::count(&plane.marker_probes), 3);
        assert_eq!(outcome.elapsed, Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_is_retried_by_default() {
        let plane = ScriptedPlane::single(web01())
            .with_states(vec![PowerState::PoweredOn])
            .with_ips(vec![
                ProbeOutcome::failed("connection refused"),
                ProbeOutcome::Ready(String::new()),
                ProbeOutcome::Ready("fd00::7".into()),
            ]);
        let sink = RecordingSink::default();
        let engine = WaitEngine::new(&plane, &plane, &sink);

        let outcome = engine
            .wait(
                &web01(),
                &spec(PowerState::PoweredOn, 3).with_condition(AuxCondition::GuestIpAssigned),
            )
            .await
            .unwrap();

        assert_eq!(outcome.guest_ip.as_deref(), Some("fd00::7"));
        assert_eq!(outcome.elapsed, Duration::from_secs(6));
        assert!(sink.snapshot().iter().any(|e| matches!(
            e,
            WaitEvent::ProbeFailed { cause, .. } if cause == "connection refused"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_escalates_when_asked() {
        let plane = ScriptedPlane::single(web01())
            .with_states(vec![PowerState::PoweredOn])
            .with_ips(vec![ProbeOutcome::failed("no guest agent")]);
        let engine = WaitEngine::new(&plane, &plane, &NullSink);

        let err = engine
            .wait(
                &web01(),
                &spec(PowerState::PoweredOn, 5)
                    .with_condition(AuxCondition::GuestIpAssigned)
                    .with_probe_policy(ProbePolicy::Escalate),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CoreError::Probe {
                condition: AuxCondition::GuestIpAssigned,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_limit_times_out() {
        let plane = ScriptedPlane::single(web01()).with_states(vec![PowerState::PoweredOn]);
        let engine = WaitEngine::new(&plane, &plane, &NullSink);

        let err = engine
            .wait(
                &web01(),
                &spec(PowerState::PoweredOff, 5)
                    .with_limit(WaitLimit::Duration(Duration::from_secs(10))),
            )
            .await
            .unwrap_err();

        let CoreError::Timeout {
            vm,
            waited,
            pending,
        } = err
        else {
            panic!("expected timeout");
        };
        assert_eq!(vm, web01());
        assert_eq!(waited, Duration::from_secs(10));
        assert_eq!(pending, vec!["power state PoweredOff".to_string()]);
        assert_eq!(ScriptedPlane::count(&plane.state_polls), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_limit_times_out_on_pending_condition() {
        let plane = ScriptedPlane::single(web01())
            .with_states(vec![PowerState::PoweredOn])
            .with_ips(vec![ProbeOutcome::NotYet]);
        let engine = WaitEngine::new(&plane, &plane, &NullSink);

        let err = engine
            .wait(
                &web01(),
                &spec(PowerState::PoweredOn, 1)
                    .with_condition(AuxCondition::GuestIpAssigned)
                    .with_limit(WaitLimit::Polls(3)),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CoreError::Timeout { ref pending, .. } if pending == &vec!["guest IP assigned".to_string()]
        ));
        assert_eq!(ScriptedPlane::count(&plane.ip_probes), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_query_errors_are_retried() {
        let plane = ScriptedPlane::single(web01()).with_state_results(vec![
            Err("qmp socket busy".into()),
            Ok(PowerState::PoweredOn),
        ]);
        let sink = RecordingSink::default();
        let engine = WaitEngine::new(&plane, &plane, &sink);

        let outcome = engine
            .wait(&web01(), &spec(PowerState::PoweredOn, 5))
            .await
            .unwrap();

        assert_eq!(outcome.elapsed, Duration::from_secs(5));
        assert!(matches!(
            sink.snapshot().first(),
            Some(WaitEvent::StatePollFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_spec_is_rejected_before_polling() {
        let plane = ScriptedPlane::single(web01());
        let engine = WaitEngine::new(&plane, &plane, &NullSink);

        let err = engine
            .wait(
                &web01(),
                &spec(PowerState::PoweredOff, 5).with_condition(AuxCondition::GuestIpAssigned),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::InvalidSpec(_)));
        assert_eq!(ScriptedPlane::count(&plane.state_polls), 0);
    }
}
