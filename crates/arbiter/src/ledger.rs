//! Resource ledger: in-flight counts and ceilings per (resource, class).
//!
//! The ledger is single-owner state. Every mutation takes `&mut self`, so a
//! capacity check and the increment that follows it can never interleave with
//! another caller's; the arbiter service owns the only instance.

use std::collections::HashMap;
use std::fmt;

use crate::bridge::protocol::{OperationClass, ResourceKey};
use crate::config::QuotaConfig;
use crate::error::ArbiterError;

/// Identity of one quota bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QuotaKey {
    pub resource: ResourceKey,
    pub class: OperationClass,
}

impl QuotaKey {
    pub fn new(resource: impl Into<ResourceKey>, class: impl Into<OperationClass>) -> Self {
        Self {
            resource: resource.into(),
            class: class.into(),
        }
    }
}

impl fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource, self.class)
    }
}

pub struct Ledger {
    quotas: QuotaConfig,
    /// Only non-zero counts are stored.
    in_flight: HashMap<QuotaKey, u32>,
}

impl Ledger {
    pub fn new(quotas: QuotaConfig) -> Self {
        Self {
            quotas,
            in_flight: HashMap::new(),
        }
    }

    /// Configured ceiling; 0 means unlimited.
    pub fn limit(&self, key: &QuotaKey) -> u32 {
        self.quotas.limit_for(&key.resource, &key.class)
    }

    pub fn in_flight(&self, key: &QuotaKey) -> u32 {
        self.in_flight.get(key).copied().unwrap_or(0)
    }

    /// Whether `weight` more units fit under the ceiling.
    pub fn has_capacity(&self, key: &QuotaKey, weight: u32) -> bool {
        let limit = self.limit(key);
        limit == 0
            || self
                .in_flight(key)
                .checked_add(weight)
                .is_some_and(|total| total <= limit)
    }

    /// Whether `weight` units could ever fit, even with nothing in flight.
    pub fn can_ever_fit(&self, key: &QuotaKey, weight: u32) -> bool {
        let limit = self.limit(key);
        limit == 0 || weight <= limit
    }

    /// Check capacity and take `weight` units in the same step.
    pub fn try_increment(&mut self, key: &QuotaKey, weight: u32) -> bool {
        if !self.has_capacity(key, weight) {
            return false;
        }
        self.add(key, weight);
        true
    }

    /// Take `weight` units. The caller must have just confirmed capacity.
    pub fn increment(&mut self, key: &QuotaKey, weight: u32) {
        if !self.has_capacity(key, weight) {
            debug_assert!(false, "increment without capacity on {key}");
            tracing::error!(
                %key,
                weight,
                in_flight = self.in_flight(key),
                limit = self.limit(key),
                "Bug: ledger incremented past its limit"
            );
        }
        self.add(key, weight);
    }

    /// Return `weight` units. Returns the remaining count.
    ///
    /// Fails without touching the count when fewer than `weight` units are held.
    pub fn decrement(&mut self, key: &QuotaKey, weight: u32) -> Result<u32, ArbiterError> {
        let Some(count) = self.in_flight.get_mut(key).filter(|count| **count >= weight) else {
            return Err(ArbiterError::CapacityUnderflow {
                resource: key.resource.clone(),
                class: key.class.clone(),
            });
        };

        *count -= weight;
        let remaining = *count;
        if remaining == 0 {
            self.in_flight.remove(key);
        }
        Ok(remaining)
    }

    /// Set one ceiling. Holders above a lowered limit keep their grants.
    pub fn configure(&mut self, resource: ResourceKey, class: OperationClass, limit: u32) {
        self.quotas.set_limit(resource, class, limit);
    }

    /// Swap the whole quota table (hot reload). Counts are untouched.
    pub fn replace_quotas(&mut self, quotas: QuotaConfig) {
        self.quotas = quotas;
    }

    pub fn quotas(&self) -> &QuotaConfig {
        &self.quotas
    }

    /// Non-zero entries.
    pub fn entries(&self) -> impl Iterator<Item = (&QuotaKey, u32)> {
        self.in_flight.iter().map(|(key, count)| (key, *count))
    }

    pub fn total_in_flight(&self) -> u64 {
        self.in_flight.values().map(|&count| u64::from(count)).sum()
    }

    fn add(&mut self, key: &QuotaKey, weight: u32) {
        if weight == 0 {
            return;
        }
        let count = self.in_flight.entry(key.clone()).or_insert(0);
        *count = count.saturating_add(weight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_a_read() -> QuotaKey {
        QuotaKey::new("hostA", "read")
    }

    fn ledger_with_limit(limit: u32) -> Ledger {
        Ledger::new(QuotaConfig::default().with_limit(
            ResourceKey::new("hostA"),
            OperationClass::read(),
            limit,
        ))
    }

    #[test]
    fn try_increment_stops_at_limit() {
        let mut ledger = ledger_with_limit(2);
        let key = host_a_read();

        assert!(ledger.try_increment(&key, 1));
        assert!(ledger.try_increment(&key, 1));
        assert!(!ledger.try_increment(&key, 1));
        assert_eq!(ledger.in_flight(&key), 2);
        assert!(!ledger.has_capacity(&key, 1));
    }

    #[test]
    fn zero_limit_is_unlimited() {
        let mut ledger = ledger_with_limit(0);
        let key = host_a_read();

        for _ in 0..1000 {
            assert!(ledger.try_increment(&key, 1));
        }
        assert_eq!(ledger.in_flight(&key), 1000);
    }

    #[test]
    fn decrement_restores_exact_state() {
        let mut ledger = ledger_with_limit(1);
        let key = host_a_read();

        assert!(ledger.try_increment(&key, 1));
        assert_eq!(ledger.decrement(&key, 1), Ok(0));
        assert_eq!(ledger.in_flight(&key), 0);
        assert_eq!(ledger.entries().count(), 0);
        assert!(ledger.has_capacity(&key, 1));
    }

    #[test]
    fn decrement_at_zero_underflows() {
        let mut ledger = ledger_with_limit(1);
        let key = host_a_read();

        let err = ledger.decrement(&key, 1).unwrap_err();
        assert!(matches!(err, ArbiterError::CapacityUnderflow { .. }));
        assert_eq!(ledger.in_flight(&key), 0);
    }

    #[test]
    fn classes_are_independent() {
        let mut ledger = Ledger::new(
            QuotaConfig::default()
                .with_limit(ResourceKey::new("hostA"), OperationClass::read(), 1)
                .with_limit(ResourceKey::new("hostA"), OperationClass::write(), 1),
        );

        assert!(ledger.try_increment(&QuotaKey::new("hostA", "read"), 1));
        assert!(ledger.try_increment(&QuotaKey::new("hostA", "write"), 1));
        assert!(!ledger.try_increment(&QuotaKey::new("hostA", "read"), 1));
    }

    #[test]
    fn lowering_limit_grandfathers_holders() {
        let mut ledger = ledger_with_limit(3);
        let key = host_a_read();
        for _ in 0..3 {
            assert!(ledger.try_increment(&key, 1));
        }

        ledger.configure(ResourceKey::new("hostA"), OperationClass::read(), 1);
        assert_eq!(ledger.in_flight(&key), 3);
        assert!(!ledger.has_capacity(&key, 1));

        assert_eq!(ledger.decrement(&key, 1), Ok(2));
        assert_eq!(ledger.decrement(&key, 1), Ok(1));
        assert!(!ledger.has_capacity(&key, 1));
        assert_eq!(ledger.decrement(&key, 1), Ok(0));
        assert!(ledger.has_capacity(&key, 1));
    }

    #[test]
    fn replace_quotas_keeps_counts() {
        let mut ledger = ledger_with_limit(1);
        let key = host_a_read();
        assert!(ledger.try_increment(&key, 1));

        ledger.replace_quotas(QuotaConfig::default());
        assert_eq!(ledger.in_flight(&key), 1);
        assert_eq!(ledger.limit(&key), 0);
        assert!(ledger.has_capacity(&key, 1));
    }

    #[test]
    fn total_in_flight_sums_entries() {
        let mut ledger = Ledger::new(QuotaConfig::default());
        ledger.increment(&QuotaKey::new("hostA", "read"), 1);
        ledger.increment(&QuotaKey::new("hostB", "read"), 1);
        ledger.increment(&QuotaKey::new("hostB", "read"), 1);
        assert_eq!(ledger.total_in_flight(), 3);
    }

    #[test]
    fn weighted_units_fill_the_ceiling() {
        let mut ledger = ledger_with_limit(10);
        let key = host_a_read();

        assert!(ledger.try_increment(&key, 6));
        assert!(!ledger.try_increment(&key, 5));
        assert!(ledger.try_increment(&key, 4));
        assert_eq!(ledger.in_flight(&key), 10);

        assert_eq!(ledger.decrement(&key, 6), Ok(4));
        assert!(ledger.has_capacity(&key, 6));
        assert!(!ledger.has_capacity(&key, 7));
    }

    #[test]
    fn weighted_decrement_never_goes_below_zero() {
        let mut ledger = ledger_with_limit(10);
        let key = host_a_read();
        assert!(ledger.try_increment(&key, 3));

        let err = ledger.decrement(&key, 4).unwrap_err();
        assert!(matches!(err, ArbiterError::CapacityUnderflow { .. }));
        assert_eq!(ledger.in_flight(&key), 3);
    }

    #[test]
    fn weight_above_limit_never_fits() {
        let ledger = ledger_with_limit(4);
        let key = host_a_read();

        assert!(ledger.can_ever_fit(&key, 4));
        assert!(!ledger.can_ever_fit(&key, 5));
        assert!(!ledger.has_capacity(&key, 5));
        assert!(ledger_with_limit(0).can_ever_fit(&key, u32::MAX));
    }

    #[test]
    fn quota_key_display() {
        assert_eq!(host_a_read().to_string(), "hostA/read");
    }
}
