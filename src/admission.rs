//! Room admission: who is waiting, who has been let in. Only the host's
//! client holds a populated waiting list; it is the sole authority on
//! approval. A participant goes WAITING -> APPROVED, or is removed outright
//! when it disconnects.

use std::collections::HashMap;

use crate::signaling::ParticipantInfo;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAdmission {
    pub connection_id: String,
    pub participant: ParticipantInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionState {
    Waiting,
    Approved,
}

#[derive(Debug, Default)]
pub struct AdmissionControl {
    waiting: Vec<PendingAdmission>,
    approved: HashMap<String, ParticipantInfo>,
}

impl AdmissionControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// A join request arrived: the participant enters WAITING. Returns false
    /// when it is already waiting or already approved, so replayed requests
    /// never duplicate an entry.
    pub fn request(&mut self, connection_id: &str, participant: ParticipantInfo) -> bool {
        if self.approved.contains_key(connection_id) {
            return false;
        }
        if self.waiting.iter().any(|w| w.connection_id == connection_id) {
            return false;
        }
        self.waiting.push(PendingAdmission {
            connection_id: connection_id.to_owned(),
            participant,
        });
        true
    }

    /// Host approval: WAITING -> APPROVED. Yields the entry exactly once;
    /// approving an unknown or already-approved id yields nothing.
    pub fn approve(&mut self, connection_id: &str) -> Option<PendingAdmission> {
        let idx = self.waiting.iter().position(|w| w.connection_id == connection_id)?;
        let entry = self.waiting.remove(idx);
        self.approved.insert(entry.connection_id.clone(), entry.participant.clone());
        Some(entry)
    }

    /// Disconnect notice: the participant leaves every tracked list,
    /// whatever state it was in.
    pub fn disconnected(&mut self, connection_id: &str) {
        self.waiting.retain(|w| w.connection_id != connection_id);
        self.approved.remove(connection_id);
    }

    pub fn state_of(&self, connection_id: &str) -> Option<AdmissionState> {
        if self.approved.contains_key(connection_id) {
            return Some(AdmissionState::Approved);
        }
        if self.waiting.iter().any(|w| w.connection_id == connection_id) {
            return Some(AdmissionState::Waiting);
        }
        None
    }

    pub fn waiting(&self) -> &[PendingAdmission] {
        &self.waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(name: &str) -> ParticipantInfo {
        ParticipantInfo { name: name.into(), email: format!("{name}@example.com") }
    }

    #[test]
    fn request_enters_waiting_once() {
        let mut admission = AdmissionControl::new();
        assert!(admission.request("c1", participant("p1")));
        assert!(!admission.request("c1", participant("p1")));
        assert_eq!(admission.waiting().len(), 1);
        assert_eq!(admission.state_of("c1"), Some(AdmissionState::Waiting));
    }

    #[test]
    fn approve_moves_to_approved_exactly_once() {
        let mut admission = AdmissionControl::new();
        admission.request("c1", participant("p1"));

        let entry = admission.approve("c1").expect("first approval yields the entry");
        assert_eq!(entry.connection_id, "c1");
        assert!(admission.waiting().is_empty());
        assert_eq!(admission.state_of("c1"), Some(AdmissionState::Approved));

        assert!(admission.approve("c1").is_none());
    }

    #[test]
    fn approve_unknown_id_yields_nothing() {
        let mut admission = AdmissionControl::new();
        assert!(admission.approve("ghost").is_none());
    }

    #[test]
    fn approved_participant_cannot_reenter_waiting() {
        let mut admission = AdmissionControl::new();
        admission.request("c1", participant("p1"));
        admission.approve("c1");
        assert!(!admission.request("c1", participant("p1")));
        assert!(admission.waiting().is_empty());
    }

    #[test]
    fn disconnect_removes_from_any_state() {
        let mut admission = AdmissionControl::new();
        admission.request("c1", participant("p1"));
        admission.request("c2", participant("p2"));
        admission.approve("c2");

        admission.disconnected("c1");
        admission.disconnected("c2");
        assert!(admission.waiting().is_empty());
        assert_eq!(admission.state_of("c1"), None);
        assert_eq!(admission.state_of("c2"), None);

        // and the id may request again from scratch
        assert!(admission.request("c1", participant("p1")));
    }
}
