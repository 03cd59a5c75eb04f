use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub struct FaultInjectionPolicy {
    pub id: u64,
    pub fault: Fault,
    /// The percentage of calls, within 0..=100, that the fault applies to.
    pub percent: f64,
    /// Lanes the fault is limited to. When empty, it applies to all calls.
    pub lanes: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    Delay(Duration),
    Abort { code: String, message: String },
}

/// Credentials attached to outbound calls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthPolicy {
    Token { key: String, value: String },
}

// === impl FaultInjectionPolicy ===

impl FaultInjectionPolicy {
    pub fn applies_to(&self, lane: Option<&str>) -> bool {
        if self.lanes.is_empty() {
            return true;
        }
        lane.map_or(false, |l| self.lanes.iter().any(|x| x == l))
    }
}
