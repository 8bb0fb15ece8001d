//! Port allocation for web services

use std::collections::HashSet;

use crate::errors::DeployerError;

/// First port at or above `start` not in `used`.
///
/// There is no reservation beyond the service rows themselves; concurrent
/// allocations in one environment are prevented by deployment admission.
pub fn next_free_port(start: u16, used: &HashSet<u16>) -> Result<u16, DeployerError> {
    (start..=u16::MAX)
        .find(|port| !used.contains(port))
        .ok_or_else(|| DeployerError::ConfigError(format!("No free port at or above {}", start)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fills_first_gap() {
        let used: HashSet<u16> = [8000, 8001, 8003].into_iter().collect();
        assert_eq!(next_free_port(8000, &used).unwrap(), 8002);
    }

    #[test]
    fn test_start_port_when_unused() {
        assert_eq!(next_free_port(9000, &HashSet::new()).unwrap(), 9000);
    }

    #[test]
    fn test_ports_below_start_are_ignored() {
        let used: HashSet<u16> = [7999, 8000].into_iter().collect();
        assert_eq!(next_free_port(8000, &used).unwrap(), 8001);
    }

    #[test]
    fn test_exhausted_range() {
        let used: HashSet<u16> = [u16::MAX - 1, u16::MAX].into_iter().collect();
        assert!(next_free_port(u16::MAX - 1, &used).is_err());
    }
}
