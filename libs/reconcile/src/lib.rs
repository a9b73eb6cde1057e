//! Reconciliation primitives for the host fleet.
//!
//! This library holds the data model shared by the host agent and the pure
//! diff that turns desired state into start/stop work:
//!
//! - **Desired state**: enabled [`SlotDefinition`] rows for this host.
//! - **Running state**: [`RunningGuest`] entries recovered from the process table.
//! - **Plan**: the slots to start and the guests to stop.
//!
//! # Invariants
//!
//! - Planning is pure and deterministic given the same inputs
//! - A converged host produces an empty plan (idempotent reconciliation)
//! - A slot present on both sides never appears in the plan under [`MatchKey::Slot`]

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Separator between agent id and slot in a [`GuestIdentity`].
pub const IDENTITY_DELIMITER: char = 'Z';

/// Identity parsing and construction errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// Agent id is empty.
    #[error("agent id is empty")]
    EmptyAgent,

    /// Agent id contains the identity delimiter and could not round-trip.
    #[error("agent id {0:?} contains the delimiter 'Z'")]
    AgentContainsDelimiter(String),

    /// Identity string does not have exactly one delimiter.
    #[error("malformed guest identity {0:?}")]
    Malformed(String),

    /// Slot part is not a non-negative decimal integer.
    #[error("invalid slot in guest identity {0:?}")]
    InvalidSlot(String),
}

/// The `<agent_id>Z<slot>` string a guest is known by end to end.
///
/// It is passed to the hypervisor as `--id` and echoed back by the guest's
/// control-plane status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GuestIdentity {
    agent_id: String,
    slot: u32,
}

impl GuestIdentity {
    /// Build an identity, rejecting agent ids that would not round-trip.
    pub fn new(agent_id: impl Into<String>, slot: u32) -> Result<Self, IdentityError> {
        let agent_id = agent_id.into();
        if agent_id.is_empty() {
            return Err(IdentityError::EmptyAgent);
        }
        if agent_id.contains(IDENTITY_DELIMITER) {
            return Err(IdentityError::AgentContainsDelimiter(agent_id));
        }
        Ok(Self { agent_id, slot })
    }

    /// Agent id part.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Slot part.
    pub fn slot(&self) -> u32 {
        self.slot
    }
}

impl fmt::Display for GuestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.agent_id, IDENTITY_DELIMITER, self.slot)
    }
}

impl FromStr for GuestIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(IDENTITY_DELIMITER);
        let (Some(agent), Some(slot), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(IdentityError::Malformed(s.to_string()));
        };

        // u32::from_str accepts a leading '+', which would not round-trip.
        if slot.is_empty() || !slot.bytes().all(|b| b.is_ascii_digit()) {
            return Err(IdentityError::InvalidSlot(s.to_string()));
        }
        let slot = slot
            .parse::<u32>()
            .map_err(|_| IdentityError::InvalidSlot(s.to_string()))?;

        Self::new(agent, slot)
    }
}

/// One row of the desired-state table for this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDefinition {
    /// Opaque agent identity (typically a UUID).
    pub agent_id: String,
    /// Slot on this host; the reconciliation key.
    pub slot: u32,
    /// Base image the agent's disk is cloned from.
    pub image_name: String,
    /// Whether the slot should be running.
    pub enabled: bool,
}

impl SlotDefinition {
    /// Identity the guest for this slot runs under.
    pub fn identity(&self) -> Result<GuestIdentity, IdentityError> {
        GuestIdentity::new(self.agent_id.clone(), self.slot)
    }
}

/// A hypervisor process found in the process table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningGuest {
    /// OS process id.
    pub pid: u32,
    /// Agent id parsed from the process's `--id`.
    pub agent_id: String,
    /// Slot parsed from the process's `--id`.
    pub slot: u32,
}

impl RunningGuest {
    /// Build from a parsed identity.
    pub fn from_identity(pid: u32, identity: GuestIdentity) -> Self {
        Self {
            pid,
            agent_id: identity.agent_id,
            slot: identity.slot,
        }
    }

    /// The `<agent>Z<slot>` string for status reporting.
    pub fn identity_string(&self) -> String {
        format!("{}{}{}", self.agent_id, IDENTITY_DELIMITER, self.slot)
    }
}

/// How running guests are matched to desired slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchKey {
    /// Match on slot number alone. An agent change on a slot goes unnoticed.
    #[default]
    Slot,

    /// Match on `(agent_id, slot)`. A guest running the wrong agent on a
    /// desired slot is stopped, and the replacement starts next cycle.
    AgentAndSlot,
}

impl FromStr for MatchKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "slot" => Ok(Self::Slot),
            "agent-slot" => Ok(Self::AgentAndSlot),
            other => Err(format!(
                "unknown match key {other:?}, expected \"slot\" or \"agent-slot\""
            )),
        }
    }
}

/// A unit of reconciliation work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Bring a desired slot up.
    Start(SlotDefinition),
    /// Take an undesired guest down.
    Stop(RunningGuest),
}

impl Task {
    /// Slot the task acts on.
    pub fn slot(&self) -> u32 {
        match self {
            Self::Start(def) => def.slot,
            Self::Stop(guest) => guest.slot,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start(def) => write!(f, "NEED TO START SLOT {}", def.slot),
            Self::Stop(guest) => write!(f, "NEED TO STOP SLOT {}", guest.slot),
        }
    }
}

/// Output of [`plan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Desired slots with no matching guest.
    pub to_start: Vec<SlotDefinition>,
    /// Running guests with no matching desired slot.
    pub to_stop: Vec<RunningGuest>,
    /// Slots whose start waits for a replaced guest to go away.
    pub deferred: Vec<u32>,
    /// Slots that appeared more than once in the desired set; the first row won.
    pub duplicate_slots: Vec<u32>,
}

impl ReconcilePlan {
    /// True when there is nothing to start or stop.
    pub fn is_converged(&self) -> bool {
        self.to_start.is_empty() && self.to_stop.is_empty()
    }

    /// All tasks, starts first.
    pub fn tasks(&self) -> Vec<Task> {
        self.to_start
            .iter()
            .cloned()
            .map(Task::Start)
            .chain(self.to_stop.iter().cloned().map(Task::Stop))
            .collect()
    }
}

/// Diff desired slots against running guests.
///
/// Disabled definitions are treated as absent. Output order follows input
/// order so repeated runs over the same inputs produce the same plan.
pub fn plan(desired: &[SlotDefinition], running: &[RunningGuest], key: MatchKey) -> ReconcilePlan {
    let mut result = ReconcilePlan::default();

    let mut by_slot: HashMap<u32, &SlotDefinition> = HashMap::new();
    let mut ordered = Vec::new();
    for def in desired.iter().filter(|d| d.enabled) {
        if by_slot.contains_key(&def.slot) {
            if !result.duplicate_slots.contains(&def.slot) {
                result.duplicate_slots.push(def.slot);
            }
            continue;
        }
        by_slot.insert(def.slot, def);
        ordered.push(def);
    }

    let running_slots: HashSet<u32> = running.iter().map(|g| g.slot).collect();

    for guest in running {
        let keep = match (by_slot.get(&guest.slot), key) {
            (None, _) => false,
            (Some(_), MatchKey::Slot) => true,
            (Some(def), MatchKey::AgentAndSlot) => def.agent_id == guest.agent_id,
        };
        if !keep {
            result.to_stop.push(guest.clone());
        }
    }

    for def in ordered {
        if !running_slots.contains(&def.slot) {
            result.to_start.push(def.clone());
            continue;
        }
        if key == MatchKey::AgentAndSlot {
            let matched = running
                .iter()
                .any(|g| g.slot == def.slot && g.agent_id == def.agent_id);
            if !matched {
                result.deferred.push(def.slot);
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::collection::btree_map;
    use proptest::prelude::*;

    fn def(agent: &str, slot: u32) -> SlotDefinition {
        SlotDefinition {
            agent_id: agent.to_string(),
            slot,
            image_name: "base".to_string(),
            enabled: true,
        }
    }

    fn guest(pid: u32, agent: &str, slot: u32) -> RunningGuest {
        RunningGuest {
            pid,
            agent_id: agent.to_string(),
            slot,
        }
    }

    #[test]
    fn test_identity_format_and_parse() {
        let id = GuestIdentity::new("3f2a-77", 12).unwrap();
        assert_eq!(id.to_string(), "3f2a-77Z12");

        let parsed: GuestIdentity = "3f2a-77Z12".parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.agent_id(), "3f2a-77");
        assert_eq!(parsed.slot(), 12);
    }

    #[test]
    fn test_identity_rejects_bad_input() {
        assert_eq!(
            "abc".parse::<GuestIdentity>(),
            Err(IdentityError::Malformed("abc".to_string()))
        );
        assert!(matches!(
            "aZbZ3".parse::<GuestIdentity>(),
            Err(IdentityError::Malformed(_))
        ));
        assert!(matches!(
            "agentZ".parse::<GuestIdentity>(),
            Err(IdentityError::InvalidSlot(_))
        ));
        assert!(matches!(
            "agentZ-1".parse::<GuestIdentity>(),
            Err(IdentityError::InvalidSlot(_))
        ));
        assert!(matches!(
            "agentZ+1".parse::<GuestIdentity>(),
            Err(IdentityError::InvalidSlot(_))
        ));
        assert_eq!("Z4".parse::<GuestIdentity>(), Err(IdentityError::EmptyAgent));
        assert!(matches!(
            GuestIdentity::new("aZb", 1),
            Err(IdentityError::AgentContainsDelimiter(_))
        ));
    }

    #[test]
    fn test_task_lines() {
        assert_eq!(Task::Start(def("a", 3)).to_string(), "NEED TO START SLOT 3");
        assert_eq!(Task::Stop(guest(10, "a", 4)).to_string(), "NEED TO STOP SLOT 4");
    }

    #[test]
    fn test_match_key_parse() {
        assert_eq!("slot".parse::<MatchKey>().unwrap(), MatchKey::Slot);
        assert_eq!(
            "agent-slot".parse::<MatchKey>().unwrap(),
            MatchKey::AgentAndSlot
        );
        assert!("agent".parse::<MatchKey>().is_err());
    }

    #[test]
    fn test_convergence_start() {
        let plan = plan(&[def("a", 3)], &[], MatchKey::Slot);
        assert_eq!(plan.tasks(), vec![Task::Start(def("a", 3))]);
    }

    #[test]
    fn test_convergence_stop() {
        let plan = plan(&[], &[guest(42, "a", 3)], MatchKey::Slot);
        assert_eq!(plan.tasks(), vec![Task::Stop(guest(42, "a", 3))]);
    }

    #[test]
    fn test_converged_host_is_noop() {
        let desired = vec![def("a", 1), def("b", 2)];
        let running = vec![guest(10, "a", 1), guest(11, "b", 2)];
        assert!(plan(&desired, &running, MatchKey::Slot).is_converged());
        assert!(plan(&desired, &running, MatchKey::AgentAndSlot).is_converged());
    }

    #[test]
    fn test_disabled_rows_are_not_desired() {
        let mut disabled = def("a", 1);
        disabled.enabled = false;
        let plan = plan(&[disabled], &[guest(10, "a", 1)], MatchKey::Slot);
        assert!(plan.to_start.is_empty());
        assert_eq!(plan.to_stop, vec![guest(10, "a", 1)]);
    }

    #[test]
    fn test_duplicate_desired_slot_first_wins() {
        let plan = plan(&[def("a", 5), def("b", 5)], &[], MatchKey::Slot);
        assert_eq!(plan.to_start, vec![def("a", 5)]);
        assert_eq!(plan.duplicate_slots, vec![5]);
    }

    #[test]
    fn test_agent_change_ignored_by_slot_key() {
        let plan = plan(&[def("new", 2)], &[guest(10, "old", 2)], MatchKey::Slot);
        assert!(plan.is_converged());
    }

    #[test]
    fn test_agent_change_replaced_by_agent_key() {
        let plan = plan(
            &[def("new", 2)],
            &[guest(10, "old", 2)],
            MatchKey::AgentAndSlot,
        );
        assert_eq!(plan.to_stop, vec![guest(10, "old", 2)]);
        assert!(plan.to_start.is_empty());
        assert_eq!(plan.deferred, vec![2]);

        // Once the old guest is gone the new agent starts.
        let next = plan_after_stop(&[def("new", 2)]);
        assert_eq!(next.to_start, vec![def("new", 2)]);
    }

    fn plan_after_stop(desired: &[SlotDefinition]) -> ReconcilePlan {
        plan(desired, &[], MatchKey::AgentAndSlot)
    }

    #[test]
    fn test_slot_definition_deserializes() {
        let json = r#"{"agent_id":"a1","slot":9,"image_name":"py311","enabled":true}"#;
        let parsed: SlotDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.slot, 9);
        assert_eq!(parsed.identity().unwrap().to_string(), "a1Z9");
    }

    fn desired_strategy() -> impl Strategy<Value = Vec<SlotDefinition>> {
        btree_map(0u32..64, "[a-f0-9]{1,8}", 0..16).prop_map(|m| {
            m.into_iter()
                .map(|(slot, agent)| def(&agent, slot))
                .collect()
        })
    }

    fn running_strategy() -> impl Strategy<Value = Vec<RunningGuest>> {
        btree_map(0u32..64, "[a-f0-9]{1,8}", 0..16).prop_map(|m| {
            m.into_iter()
                .enumerate()
                .map(|(i, (slot, agent))| guest(1000 + i as u32, &agent, slot))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn diff_matches_set_definition(desired in desired_strategy(), running in running_strategy()) {
            let plan = plan(&desired, &running, MatchKey::Slot);

            let expected_start: Vec<_> = desired
                .iter()
                .filter(|d| !running.iter().any(|r| r.slot == d.slot))
                .cloned()
                .collect();
            let expected_stop: Vec<_> = running
                .iter()
                .filter(|r| !desired.iter().any(|d| d.slot == r.slot))
                .cloned()
                .collect();

            prop_assert_eq!(&plan.to_start, &expected_start);
            prop_assert_eq!(&plan.to_stop, &expected_stop);

            for task in plan.tasks() {
                let in_both = desired.iter().any(|d| d.slot == task.slot())
                    && running.iter().any(|r| r.slot == task.slot());
                prop_assert!(!in_both);
            }
        }

        #[test]
        fn applying_plan_converges(desired in desired_strategy(), running in running_strategy()) {
            let first = plan(&desired, &running, MatchKey::Slot);

            let mut after: Vec<RunningGuest> = running
                .iter()
                .filter(|r| !first.to_stop.contains(r))
                .cloned()
                .collect();
            after.extend(first.to_start.iter().map(|d| guest(9000 + d.slot, &d.agent_id, d.slot)));

            prop_assert!(plan(&desired, &after, MatchKey::Slot).is_converged());
        }

        #[test]
        fn identity_round_trips(agent in "[a-zA-Y0-9-]{1,40}", slot in any::<u32>()) {
            let id = GuestIdentity::new(agent.clone(), slot).unwrap();
            let parsed: GuestIdentity = id.to_string().parse().unwrap();
            prop_assert_eq!(parsed.agent_id(), agent.as_str());
            prop_assert_eq!(parsed.slot(), slot);
        }
    }
}
