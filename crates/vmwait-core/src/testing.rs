use crate::{
    CoreError, EventSink, GuestIntrospection, Inventory, PowerControl, PowerState, ProbeOutcome,
    VmIdentity, WaitEvent,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Replays a queue of answers; the last answer repeats once the queue drains.
struct Script<T: Clone> {
    queue: Mutex<VecDeque<T>>,
    fallback: T,
}

impl<T: Clone> Script<T> {
    fn new(fallback: T) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback,
        }
    }

    fn set(&mut self, answers: Vec<T>) {
        if let Some(last) = answers.last() {
            self.fallback = last.clone();
        }
        self.queue = Mutex::new(answers.into());
    }

    fn next(&self) -> T {
        let mut queue = self.queue.lock().unwrap();
        queue.pop_front().unwrap_or_else(|| self.fallback.clone())
    }
}

pub(crate) struct ScriptedPlane {
    vms: Vec<VmIdentity>,
    states: Script<Result<PowerState, String>>,
    ips: Script<ProbeOutcome<String>>,
    markers: Script<ProbeOutcome<String>>,
    pub starts: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub state_polls: AtomicUsize,
    pub ip_probes: AtomicUsize,
    pub marker_probes: AtomicUsize,
    pub commanded: Mutex<Vec<String>>,
}

impl ScriptedPlane {
    pub fn new(vms: Vec<VmIdentity>) -> Self {
        Self {
            vms,
            states: Script::new(Ok(PowerState::Unknown)),
            ips: Script::new(ProbeOutcome::NotYet),
            markers: Script::new(ProbeOutcome::NotYet),
            starts: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            state_polls: AtomicUsize::new(0),
            ip_probes: AtomicUsize::new(0),
            marker_probes: AtomicUsize::new(0),
            commanded: Mutex::new(Vec::new()),
        }
    }

    pub fn single(vm: VmIdentity) -> Self {
        Self::new(vec![vm])
    }

    pub fn with_states(mut self, states: Vec<PowerState>) -> Self {
        self.states.set(states.into_iter().map(Ok).collect());
        self
    }

    pub fn with_state_results(mut self, states: Vec<Result<PowerState, String>>) -> Self {
        self.states.set(states);
        self
    }

    pub fn with_ips(mut self, ips: Vec<ProbeOutcome<String>>) -> Self {
        self.ips.set(ips);
        self
    }

    pub fn with_markers(mut self, markers: Vec<ProbeOutcome<String>>) -> Self {
        self.markers.set(markers);
        self
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Inventory for ScriptedPlane {
    async fn resolve_by_name(
        &self,
        name: &str,
        server: &str,
    ) -> Result<Vec<VmIdentity>, CoreError> {
        if !self.vms.iter().any(|vm| vm.server == server) {
            return Err(CoreError::NotFound(format!("unknown server '{server}'")));
        }
        Ok(self
            .vms
            .iter()
            .filter(|vm| vm.server == server && vm.name == name)
            .cloned()
            .collect())
    }

    async fn resolve_by_handle(&self, handle: &str) -> Result<VmIdentity, CoreError> {
        self.vms
            .iter()
            .find(|vm| vm.handle() == handle)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(handle.to_string()))
    }
}

#[async_trait]
impl PowerControl for ScriptedPlane {
    async fn issue_shutdown(&self, vm: &VmIdentity) -> Result<(), CoreError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.commanded.lock().unwrap().push(vm.id.clone());
        Ok(())
    }

    async fn issue_start(&self, vm: &VmIdentity) -> Result<(), CoreError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.commanded.lock().unwrap().push(vm.id.clone());
        Ok(())
    }

    async fn power_state(&self, _vm: &VmIdentity) -> Result<PowerState, CoreError> {
        self.state_polls.fetch_add(1, Ordering::SeqCst);
        self.states.next().map_err(CoreError::ControlPlane)
    }
}

#[async_trait]
impl GuestIntrospection for ScriptedPlane {
    async fn guest_ip(&self, _vm: &VmIdentity) -> ProbeOutcome<String> {
        self.ip_probes.fetch_add(1, Ordering::SeqCst);
        self.ips.next()
    }

    async fn customization_marker(&self, _vm: &VmIdentity) -> ProbeOutcome<String> {
        self.marker_probes.fetch_add(1, Ordering::SeqCst);
        self.markers.next()
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    pub events: Mutex<Vec<WaitEvent>>,
}

impl RecordingSink {
    pub fn snapshot(&self) -> Vec<WaitEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &WaitEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
