use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{ConfigurationError, ServiceError};
use crate::subscription::{CloseReason, Subscription, SubscriptionId};

/// What is left of a subscription that closed with nobody listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tombstone {
    pub(crate) reason: CloseReason,
    pub(crate) sequence_number: u32,
}

/// The subscriptions owned by one session.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionManager {
    subscriptions: BTreeMap<SubscriptionId, Arc<Subscription>>,
    tombstones: HashMap<SubscriptionId, Tombstone>,
}

impl SubscriptionManager {
    pub(crate) fn insert(&mut self, subscription: Arc<Subscription>, max: usize) -> Result<(), ConfigurationError> {
        if self.subscriptions.len() >= max {
            return Err(ConfigurationError::TooManySubscriptions { max });
        }
        self.subscriptions.insert(subscription.id(), subscription);
        Ok(())
    }

    pub(crate) fn get(&self, id: SubscriptionId) -> Result<Arc<Subscription>, ServiceError> {
        self.subscriptions
            .get(&id)
            .cloned()
            .ok_or(ServiceError::SubscriptionNotFound { id })
    }

    pub(crate) fn remove(&mut self, id: SubscriptionId) -> Result<Arc<Subscription>, ServiceError> {
        self.subscriptions
            .remove(&id)
            .ok_or(ServiceError::SubscriptionNotFound { id })
    }

    /// Records a closed subscription so the next publish request for it learns why.
    pub(crate) fn bury(&mut self, id: SubscriptionId, tombstone: Tombstone) {
        self.tombstones.insert(id, tombstone);
    }

    pub(crate) fn take_tombstone(&mut self, id: SubscriptionId) -> Option<Tombstone> {
        self.tombstones.remove(&id)
    }

    /// Removes every subscription and tombstone, returning the live subscriptions.
    pub(crate) fn drain(&mut self) -> Vec<Arc<Subscription>> {
        self.tombstones.clear();
        std::mem::take(&mut self.subscriptions).into_values().collect()
    }

    pub(crate) fn ids(&self) -> Vec<SubscriptionId> {
        self.subscriptions.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::server::SessionId;
    use crate::subscription::SubscriptionParameters;

    fn sub(id: u32) -> Arc<Subscription> {
        let params = SubscriptionParameters {
            publishing_interval: Duration::from_millis(100),
            ..SubscriptionParameters::default()
        };
        Arc::new(Subscription::new(SubscriptionId::new(id), SessionId::new(), params))
    }

    #[test]
    fn insert_enforces_limit() {
        let mut m = SubscriptionManager::default();
        m.insert(sub(1), 2).unwrap();
        m.insert(sub(2), 2).unwrap();
        assert_eq!(m.insert(sub(3), 2), Err(ConfigurationError::TooManySubscriptions { max: 2 }));
        assert_eq!(m.ids(), vec![SubscriptionId::new(1), SubscriptionId::new(2)]);
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let mut m = SubscriptionManager::default();
        let id = SubscriptionId::new(9);
        assert_eq!(m.get(id).unwrap_err(), ServiceError::SubscriptionNotFound { id });
        assert!(m.remove(id).is_err());
    }

    #[test]
    fn tombstone_is_taken_once() {
        let mut m = SubscriptionManager::default();
        let id = SubscriptionId::new(4);
        m.bury(
            id,
            Tombstone {
                reason: CloseReason::Expired,
                sequence_number: 3,
            },
        );
        assert_eq!(m.take_tombstone(id).map(|t| t.reason), Some(CloseReason::Expired));
        assert!(m.take_tombstone(id).is_none());
    }

    #[test]
    fn drain_empties_everything() {
        let mut m = SubscriptionManager::default();
        m.insert(sub(1), 10).unwrap();
        m.bury(
            SubscriptionId::new(2),
            Tombstone {
                reason: CloseReason::Expired,
                sequence_number: 1,
            },
        );
        assert_eq!(m.drain().len(), 1);
        assert!(m.ids().is_empty());
        assert!(m.take_tombstone(SubscriptionId::new(2)).is_none());
    }
}
