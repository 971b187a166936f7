//! Process-wide port claims
//!
//! The OS lock taken when a serial port is opened only guards against other processes. A
//! [`PortClaim`] makes the same guarantee inside this process, including for channels that
//! are not serial ports.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, OnceLock};

use tracing::debug;

use super::KarbonError;

fn claimed() -> MutexGuard<'static, HashSet<String>> {
    static CLAIMED: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    CLAIMED
        .get_or_init(|| Mutex::new(HashSet::new()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Exclusive hold on a port name, released on drop
#[derive(Debug)]
pub struct PortClaim {
    name: String,
}

impl PortClaim {
    /// Claim `name`, failing with [`KarbonError::PortBusy`] if it is already held
    pub fn acquire(name: &str) -> Result<Self, KarbonError> {
        if !claimed().insert(name.to_string()) {
            return Err(KarbonError::PortBusy(name.to_string()));
        }
        debug!("Claimed port {}", name);
        Ok(Self {
            name: name.to_string(),
        })
    }

    /// Check whether some session in this process holds `name`
    pub fn is_claimed(name: &str) -> bool {
        claimed().contains(name)
    }
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        claimed().remove(&self.name);
        debug!("Released port {}", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let name = "claim-test-port";
        let first = PortClaim::acquire(name).unwrap();
        assert!(PortClaim::is_claimed(name));
        assert!(matches!(PortClaim::acquire(name), Err(KarbonError::PortBusy(_))));

        drop(first);
        assert!(!PortClaim::is_claimed(name));
        assert!(PortClaim::acquire(name).is_ok());
    }
}
