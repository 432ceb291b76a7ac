use crate::{
    CoreError, EventSink, PowerCommand, PowerControl, PowerState, VmIdentity, WaitEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartRequest {
    Sent,
    AlreadyOn,
}

/// Ask the guest to shut down without waiting for it.
///
/// The request is sent whatever the current state is; a VM that is already
/// off is left to the control plane to ignore.
///
/// # Errors
/// Propagates `CoreError` from the control plane when the request fails.
pub async fn request_stop<P>(
    power: &P,
    vm: &VmIdentity,
    events: &dyn EventSink,
) -> Result<(), CoreError>
where
    P: PowerControl + ?Sized,
{
    power.issue_shutdown(vm).await?;
    events.emit(&WaitEvent::CommandSent {
        vm: vm.clone(),
        command: PowerCommand::Shutdown,
    });
    Ok(())
}

/// Power the VM on unless it is already running.
///
/// # Errors
/// Propagates `CoreError` from the state query or the start request.
pub async fn request_start<P>(
    power: &P,
    vm: &VmIdentity,
    events: &dyn EventSink,
) -> Result<StartRequest, CoreError>
where
    P: PowerControl + ?Sized,
{
    let state = power.power_state(vm).await?;
    if state == PowerState::PoweredOn {
        events.emit(&WaitEvent::AlreadyInState {
            vm: vm.clone(),
            state,
        });
        return Ok(StartRequest::AlreadyOn);
    }

    power.issue_start(vm).await?;
    events.emit(&WaitEvent::CommandSent {
        vm: vm.clone(),
        command: PowerCommand::Start,
    });
    Ok(StartRequest::Sent)
}
