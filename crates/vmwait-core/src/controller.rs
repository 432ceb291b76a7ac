use crate::{
    AuxCondition, CoreError, EventSink, GuestIntrospection, IdentitySource, Inventory, PollInterval,
    PowerControl, PowerState, ProbePolicy, StartRequest, TracingSink, VmIdentity, WaitEngine,
    WaitLimit, WaitOutcome, WaitSpec, request_start, request_stop, resolve_identity,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitOptions {
    pub interval: PollInterval,
    pub limit: WaitLimit,
    pub probe_policy: ProbePolicy,
}

impl WaitOptions {
    fn spec(&self, target: PowerState) -> WaitSpec {
        WaitSpec::new(target, self.interval)
            .with_limit(self.limit)
            .with_probe_policy(self.probe_policy)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    pub wait: WaitOptions,
    pub wait_for_ip: bool,
    pub wait_for_customization: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowerOutcome {
    /// The command was sent and the wait completed.
    Reached(WaitOutcome),
    /// Nothing was sent because the VM was already in the requested state.
    AlreadyInState { vm: VmIdentity, state: PowerState },
}

impl PowerOutcome {
    #[must_use]
    pub fn vm(&self) -> &VmIdentity {
        match self {
            PowerOutcome::Reached(outcome) => &outcome.vm,
            PowerOutcome::AlreadyInState { vm, .. } => vm,
        }
    }

    #[must_use]
    pub fn into_wait_outcome(self) -> Option<WaitOutcome> {
        match self {
            PowerOutcome::Reached(outcome) => Some(outcome),
            PowerOutcome::AlreadyInState { .. } => None,
        }
    }
}

/// Resolves a VM, sends one power command and waits for it to take effect.
pub struct PowerController<'a> {
    inventory: &'a dyn Inventory,
    power: &'a dyn PowerControl,
    guest: &'a dyn GuestIntrospection,
    events: &'a dyn EventSink,
}

impl<'a> PowerController<'a> {
    pub fn new(
        inventory: &'a dyn Inventory,
        power: &'a dyn PowerControl,
        guest: &'a dyn GuestIntrospection,
    ) -> Self {
        Self {
            inventory,
            power,
            guest,
            events: &TracingSink,
        }
    }

    #[must_use]
    pub fn with_events(mut self, events: &'a dyn EventSink) -> Self {
        self.events = events;
        self
    }

    /// Request a guest shutdown and wait until the VM is powered off.
    ///
    /// # Errors
    /// Returns `CoreError::NotFound` if the VM cannot be resolved, the control
    /// plane error if the shutdown request fails, and any error from
    /// `WaitEngine::wait`.
    pub async fn stop_and_wait(
        &self,
        source: IdentitySource,
        options: &WaitOptions,
    ) -> Result<PowerOutcome, CoreError> {
        let spec = options.spec(PowerState::PoweredOff);
        spec.validate()?;

        let vm = resolve_identity(self.inventory, source, self.events).await?;
        request_stop(self.power, &vm, self.events).await?;

        let outcome = self.engine().wait(&vm, &spec).await?;
        Ok(PowerOutcome::Reached(outcome))
    }

    /// Power the VM on and wait until it runs and the requested guest
    /// conditions hold. A VM that is already on is left alone.
    ///
    /// # Errors
    /// Returns `CoreError::NotFound` if the VM cannot be resolved, the control
    /// plane error if the start request fails, and any error from
    /// `WaitEngine::wait`.
    pub async fn start_and_wait(
        &self,
        source: IdentitySource,
        options: &StartOptions,
    ) -> Result<PowerOutcome, CoreError> {
        let mut spec = options.wait.spec(PowerState::PoweredOn);
        if options.wait_for_ip {
            spec = spec.with_condition(AuxCondition::GuestIpAssigned);
        }
        if options.wait_for_customization {
            spec = spec.with_condition(AuxCondition::GuestCustomizationComplete);
        }
        spec.validate()?;

        let vm = resolve_identity(self.inventory, source, self.events).await?;
        if request_start(self.power, &vm, self.events).await? == StartRequest::AlreadyOn {
            return Ok(PowerOutcome::AlreadyInState {
                vm,
                state: PowerState::PoweredOn,
            });
        }

        let outcome = self.engine().wait(&vm, &spec).await?;
        Ok(PowerOutcome::Reached(outcome))
    }

    fn engine(&self) -> WaitEngine<'a, dyn PowerControl + 'a, dyn GuestIntrospection + 'a> {
        WaitEngine::new(self.power, self.guest, self.events)
    }
}
