use crate::{AuxCondition, PowerState, VmIdentity};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowerCommand {
    Shutdown,
    Start,
}

/// Progress notifications emitted while driving a VM to a target state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitEvent {
    Resolved {
        vm: VmIdentity,
        candidates: usize,
    },
    AlreadyInState {
        vm: VmIdentity,
        state: PowerState,
    },
    CommandSent {
        vm: VmIdentity,
        command: PowerCommand,
    },
    StatePolled {
        vm: VmIdentity,
        state: PowerState,
        elapsed: Duration,
    },
    StatePollFailed {
        vm: VmIdentity,
        cause: String,
    },
    ConditionLatched {
        vm: VmIdentity,
        condition: AuxCondition,
        elapsed: Duration,
    },
    ProbeFailed {
        vm: VmIdentity,
        condition: AuxCondition,
        cause: String,
    },
    Satisfied {
        vm: VmIdentity,
        state: PowerState,
        elapsed: Duration,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &WaitEvent);
}

impl<F> EventSink for F
where
    F: Fn(&WaitEvent) + Send + Sync,
{
    fn emit(&self, event: &WaitEvent) {
        self(event);
    }
}

/// Forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &WaitEvent) {
        match event {
            WaitEvent::Resolved { vm, candidates } if *candidates > 1 => {
                info!("{candidates} VMs match '{}', using {vm}", vm.name);
            }
            WaitEvent::Resolved { vm, .. } => debug!("Resolved {vm}"),
            WaitEvent::AlreadyInState { vm, state } => {
                warn!("VM {vm} is already {state}, nothing to do");
            }
            WaitEvent::CommandSent { vm, command } => match command {
                PowerCommand::Shutdown => info!("Requested guest shutdown of {vm}"),
                PowerCommand::Start => info!("Requested power on of {vm}"),
            },
            WaitEvent::StatePolled { vm, state, elapsed } => {
                debug!("{vm} is {state} after {}s", elapsed.as_secs());
            }
            WaitEvent::StatePollFailed { vm, cause } => {
                warn!("Failed to query power state of {vm}: {cause}");
            }
            WaitEvent::ConditionLatched {
                vm,
                condition,
                elapsed,
            } => info!("{vm}: {condition} after {}s", elapsed.as_secs()),
            WaitEvent::ProbeFailed {
                vm,
                condition,
                cause,
            } => debug!("{vm}: probe for {condition} failed: {cause}"),
            WaitEvent::Satisfied { vm, state, elapsed } => {
                info!("{vm} reached {state} in {}s", elapsed.as_secs());
            }
        }
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &WaitEvent) {}
}
