//! Session liveness as seen by a data node.
//!
//! Every successful session sync or publisher write renews the session's
//! lease; sessions that stop renewing are reported expired so their
//! publishers can be reaped.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::core::now_ms;

pub struct SessionLeaseManager {
    lease: Duration,
    renewals: Mutex<HashMap<String, u64>>,
}

impl SessionLeaseManager {
    pub fn new(lease: Duration) -> Self {
        Self {
            lease,
            renewals: Mutex::new(HashMap::new()),
        }
    }

    pub fn renew(&self, session_ip: &str) {
        self.renewals
            .lock()
            .expect("session leases")
            .insert(session_ip.to_string(), now_ms());
    }

    pub fn remove(&self, session_ip: &str) {
        self.renewals.lock().expect("session leases").remove(session_ip);
    }

    /// Sessions whose lease has lapsed.
    pub fn expired(&self) -> Vec<String> {
        let deadline = now_ms().saturating_sub(self.lease.as_millis() as u64);
        let renewals = self.renewals.lock().expect("session leases");
        renewals
            .iter()
            .filter(|(_, renewed)| **renewed < deadline)
            .map(|(ip, _)| ip.clone())
            .collect()
    }

    pub fn live(&self) -> Vec<String> {
        let deadline = now_ms().saturating_sub(self.lease.as_millis() as u64);
        let renewals = self.renewals.lock().expect("session leases");
        renewals
            .iter()
            .filter(|(_, renewed)| **renewed >= deadline)
            .map(|(ip, _)| ip.clone())
            .collect()
    }
}
