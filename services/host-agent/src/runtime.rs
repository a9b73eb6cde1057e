//! Guest runtime interface and mock implementation.
//!
//! The runtime abstracts guest lifecycle operations so the reconciler can be
//! exercised without a hypervisor. A mock implementation is provided for
//! testing and development.

use std::collections::HashSet;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;
use vmfleet_reconcile::{RunningGuest, SlotDefinition};

/// Guest runtime interface.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Bring up the guest for a desired slot. Returns the hypervisor pid.
    async fn start_guest(&self, slot: &SlotDefinition) -> Result<u32>;

    /// Take down a running guest.
    async fn stop_guest(&self, guest: &RunningGuest) -> Result<()>;
}

/// A call made against [`MockRuntime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Start(u32),
    Stop(u32),
}

/// Mock runtime for testing and development.
#[derive(Debug, Default)]
pub struct MockRuntime {
    calls: Mutex<Vec<RuntimeCall>>,
    failing_slots: Mutex<HashSet<u32>>,
    next_pid: Mutex<u32>,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self {
            next_pid: Mutex::new(1000),
            ..Default::default()
        }
    }

    /// Make starts and stops on `slot` fail.
    pub fn fail_slot(&self, slot: u32) {
        self.failing_slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(slot);
    }

    /// Calls made so far, in order.
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, call: RuntimeCall, slot: u32) -> Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
        if self
            .failing_slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&slot)
        {
            anyhow::bail!("Mock runtime configured to fail slot {slot}");
        }
        Ok(())
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn start_guest(&self, slot: &SlotDefinition) -> Result<u32> {
        self.record(RuntimeCall::Start(slot.slot), slot.slot)?;

        let mut next = self.next_pid.lock().unwrap_or_else(|e| e.into_inner());
        *next += 1;
        info!(
            agent_id = %slot.agent_id,
            slot = slot.slot,
            pid = *next,
            "[MOCK] Started guest"
        );
        Ok(*next)
    }

    async fn stop_guest(&self, guest: &RunningGuest) -> Result<()> {
        self.record(RuntimeCall::Stop(guest.slot), guest.slot)?;
        info!(
            agent_id = %guest.agent_id,
            slot = guest.slot,
            pid = guest.pid,
            "[MOCK] Stopped guest"
        );
        Ok(())
    }
}
