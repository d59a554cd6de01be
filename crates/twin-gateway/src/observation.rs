//! Process-wide registry of resource observers.
//!
//! Observers are indexed twice: by resource (to fan out content changes) and
//! by remote address (to drop everything a closing connection registered).
//! Both indexes change under one lock and must always hold the same entries.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;
use twin_proto::{DeviceId, ResourceId, Token};

use crate::error::{GatewayError, GatewayResult};

/// Anything registered in an [`ObservationContainer`].
pub trait Observer: Send + Sync {
    /// Observed resource.
    fn resource_id(&self) -> &ResourceId;
    /// Connection that registered the observation.
    fn remote_addr(&self) -> SocketAddr;
    /// Token of the observe request.
    fn token(&self) -> &Token;
}

type ByToken<O> = HashMap<Token, Arc<O>>;

struct Indexes<O> {
    by_resource: HashMap<ResourceId, HashMap<SocketAddr, ByToken<O>>>,
    by_remote_addr: HashMap<SocketAddr, ByToken<O>>,
}

impl<O: Observer> Indexes<O> {
    fn remove_from_resource_index(
        &mut self,
        resource_id: &ResourceId,
        remote_addr: SocketAddr,
        token: &Token,
    ) -> Option<Arc<O>> {
        let by_addr = self.by_resource.get_mut(resource_id)?;
        let by_token = by_addr.get_mut(&remote_addr)?;
        let removed = by_token.remove(token);
        if by_token.is_empty() {
            by_addr.remove(&remote_addr);
        }
        if by_addr.is_empty() {
            self.by_resource.remove(resource_id);
        }
        removed
    }

    fn remove_from_addr_index(&mut self, remote_addr: SocketAddr, token: &Token) -> Option<Arc<O>> {
        let by_token = self.by_remote_addr.get_mut(&remote_addr)?;
        let removed = by_token.remove(token);
        if by_token.is_empty() {
            self.by_remote_addr.remove(&remote_addr);
        }
        removed
    }
}

/// Registry mapping resources to their observers.
pub struct ObservationContainer<O> {
    inner: Mutex<Indexes<O>>,
}

impl<O: Observer> ObservationContainer<O> {
    /// Create an empty container.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Indexes {
                by_resource: HashMap::new(),
                by_remote_addr: HashMap::new(),
            }),
        }
    }

    /// Register an observer.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` if the (resource, remote address, token) triple is
    /// already registered, or the token is already used by the connection for
    /// another resource. Nothing is inserted in either case.
    pub fn add(&self, observer: Arc<O>) -> GatewayResult<()> {
        let resource_id = observer.resource_id().clone();
        let remote_addr = observer.remote_addr();
        let token = observer.token().clone();

        let mut inner = self.inner.lock();
        let by_token = inner
            .by_resource
            .entry(resource_id.clone())
            .or_default()
            .entry(remote_addr)
            .or_default();
        if by_token.contains_key(&token) {
            return Err(GatewayError::BadRequest(format!(
                "observation {resource_id} from {remote_addr} with token {token} already exists"
            )));
        }
        by_token.insert(token.clone(), Arc::clone(&observer));

        let addr_tokens = inner.by_remote_addr.entry(remote_addr).or_default();
        if addr_tokens.contains_key(&token) {
            inner.remove_from_resource_index(&resource_id, remote_addr, &token);
            return Err(GatewayError::BadRequest(format!(
                "token {token} is already used by {remote_addr}"
            )));
        }
        addr_tokens.insert(token, observer);
        Ok(())
    }

    /// Snapshot of the observers of `resource_id`.
    #[must_use]
    pub fn find(&self, resource_id: &ResourceId) -> Vec<Arc<O>> {
        let inner = self.inner.lock();
        inner
            .by_resource
            .get(resource_id)
            .map(|by_addr| by_addr.values().flat_map(|t| t.values().cloned()).collect())
            .unwrap_or_default()
    }

    /// Snapshot of the observers of every resource of `device_id`.
    #[must_use]
    pub fn find_by_device(&self, device_id: &DeviceId) -> Vec<Arc<O>> {
        let inner = self.inner.lock();
        inner
            .by_resource
            .iter()
            .filter(|(id, _)| &id.device_id == device_id)
            .flat_map(|(_, by_addr)| by_addr.values().flat_map(|t| t.values().cloned()))
            .collect()
    }

    /// Remove one observation.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if it is not registered and `UnstableContainer` if
    /// the indexes disagree about it.
    pub fn remove_by_resource(
        &self,
        resource_id: &ResourceId,
        remote_addr: SocketAddr,
        token: &Token,
    ) -> GatewayResult<Arc<O>> {
        let mut inner = self.inner.lock();
        let removed = inner
            .remove_from_resource_index(resource_id, remote_addr, token)
            .ok_or_else(|| {
                GatewayError::NotFound(format!(
                    "observation {resource_id} from {remote_addr} with token {token}"
                ))
            })?;
        if inner.remove_from_addr_index(remote_addr, token).is_none() {
            return Err(unstable(format!(
                "{resource_id} from {remote_addr} with token {token} missing in address index"
            )));
        }
        Ok(removed)
    }

    /// Remove every observation registered by `remote_addr`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the address has none and `UnstableContainer` if
    /// the resource index lacks any of them.
    pub fn pop_by_remote_addr(&self, remote_addr: SocketAddr) -> GatewayResult<Vec<Arc<O>>> {
        let mut inner = self.inner.lock();
        let by_token = inner
            .by_remote_addr
            .remove(&remote_addr)
            .ok_or_else(|| GatewayError::NotFound(format!("observations of {remote_addr}")))?;

        let mut popped = Vec::with_capacity(by_token.len());
        let mut missing = 0usize;
        for (token, observer) in by_token {
            if inner
                .remove_from_resource_index(observer.resource_id(), remote_addr, &token)
                .is_none()
            {
                missing += 1;
            }
            popped.push(observer);
        }
        if missing > 0 {
            return Err(unstable(format!(
                "{missing} observations of {remote_addr} missing in resource index"
            )));
        }
        Ok(popped)
    }

    /// Remove the observation `token` of `remote_addr`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if it is not registered and `UnstableContainer` if
    /// the resource index lacks it.
    pub fn pop_by_remote_addr_token(
        &self,
        remote_addr: SocketAddr,
        token: &Token,
    ) -> GatewayResult<Arc<O>> {
        let mut inner = self.inner.lock();
        let observer = inner
            .remove_from_addr_index(remote_addr, token)
            .ok_or_else(|| {
                GatewayError::NotFound(format!("observation of {remote_addr} with token {token}"))
            })?;
        if inner
            .remove_from_resource_index(observer.resource_id(), remote_addr, token)
            .is_none()
        {
            return Err(unstable(format!(
                "{} from {remote_addr} with token {token} missing in resource index",
                observer.resource_id()
            )));
        }
        Ok(observer)
    }

    /// Entry counts of the resource and remote-address indexes.
    #[must_use]
    pub fn index_sizes(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        let by_resource = inner
            .by_resource
            .values()
            .flat_map(HashMap::values)
            .map(HashMap::len)
            .sum();
        let by_addr = inner.by_remote_addr.values().map(HashMap::len).sum();
        (by_resource, by_addr)
    }

    /// True when no observation is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.by_resource.is_empty() && inner.by_remote_addr.is_empty()
    }
}

impl<O: Observer> Default for ObservationContainer<O> {
    fn default() -> Self {
        Self::new()
    }
}

fn unstable(detail: String) -> GatewayError {
    error!(detail = %detail, "observation container indexes diverged");
    GatewayError::UnstableContainer(detail)
}

/// Observe option values 0 and 1 are reserved for register/deregister.
const OBSERVE_MIN: u32 = 2;
/// Observe option values are 24 bits wide.
const OBSERVE_LIMIT: u32 = 1 << 24;

/// Per-observer sequence of observe option values.
#[derive(Debug, Default)]
pub struct ObserveSequence(AtomicU32);

impl ObserveSequence {
    /// Start a sequence; the first value produced is 2.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Start a sequence after `value`.
    #[must_use]
    pub const fn starting_after(value: u32) -> Self {
        Self(AtomicU32::new(value))
    }

    /// Next observe value.
    pub fn next_value(&self) -> u32 {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = match current.saturating_add(1) {
                n if !(OBSERVE_MIN..OBSERVE_LIMIT).contains(&n) => OBSERVE_MIN,
                n => n,
            };
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug)]
    struct TestObserver {
        resource_id: ResourceId,
        remote_addr: SocketAddr,
        token: Token,
    }

    impl Observer for TestObserver {
        fn resource_id(&self) -> &ResourceId {
            &self.resource_id
        }

        fn remote_addr(&self) -> SocketAddr {
            self.remote_addr
        }

        fn token(&self) -> &Token {
            &self.token
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn observer(device: &str, href: &str, port: u16, token: u8) -> Arc<TestObserver> {
        Arc::new(TestObserver {
            resource_id: ResourceId::new(DeviceId::new(device), href),
            remote_addr: addr(port),
            token: Token::from_bytes(vec![token]),
        })
    }

    // ==================== Container Tests ====================

    #[test]
    fn test_add_and_find() {
        let container = ObservationContainer::new();
        container.add(observer("d", "/a", 1, 1)).unwrap();
        container.add(observer("d", "/a", 2, 1)).unwrap();
        container.add(observer("d", "/b", 1, 2)).unwrap();

        let id = ResourceId::new(DeviceId::new("d"), "/a");
        assert_eq!(container.find(&id).len(), 2);
        assert_eq!(container.find_by_device(&DeviceId::new("d")).len(), 3);
        assert_eq!(container.index_sizes(), (3, 3));
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let container = ObservationContainer::new();
        container.add(observer("d", "/a", 1, 1)).unwrap();
        let err = container.add(observer("d", "/a", 1, 1)).unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
        assert_eq!(container.index_sizes(), (1, 1));
    }

    #[test]
    fn test_token_reuse_on_other_resource_rolls_back() {
        let container = ObservationContainer::new();
        container.add(observer("d", "/a", 1, 1)).unwrap();
        assert!(container.add(observer("d", "/b", 1, 1)).is_err());
        assert!(container
            .find(&ResourceId::new(DeviceId::new("d"), "/b"))
            .is_empty());
        assert_eq!(container.index_sizes(), (1, 1));
    }

    #[test]
    fn test_find_returns_snapshot() {
        let container = ObservationContainer::new();
        container.add(observer("d", "/a", 1, 1)).unwrap();
        let id = ResourceId::new(DeviceId::new("d"), "/a");
        let snapshot = container.find(&id);
        container.remove_by_resource(&id, addr(1), &Token::from_bytes(vec![1])).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(container.find(&id).is_empty());
    }

    #[test]
    fn test_remove_missing_is_not_found() {
        let container: ObservationContainer<TestObserver> = ObservationContainer::new();
        let id = ResourceId::new(DeviceId::new("d"), "/a");
        let err = container
            .remove_by_resource(&id, addr(1), &Token::from_bytes(vec![1]))
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[test]
    fn test_pop_by_remote_addr() {
        let container = ObservationContainer::new();
        container.add(observer("d", "/a", 1, 1)).unwrap();
        container.add(observer("d", "/b", 1, 2)).unwrap();
        container.add(observer("d", "/a", 2, 1)).unwrap();

        let popped = container.pop_by_remote_addr(addr(1)).unwrap();
        assert_eq!(popped.len(), 2);
        assert_eq!(container.index_sizes(), (1, 1));
        assert!(matches!(
            container.pop_by_remote_addr(addr(1)),
            Err(GatewayError::NotFound(_))
        ));
    }

    #[test]
    fn test_pop_by_remote_addr_token() {
        let container = ObservationContainer::new();
        container.add(observer("d", "/a", 1, 1)).unwrap();
        container.add(observer("d", "/b", 1, 2)).unwrap();

        let popped = container
            .pop_by_remote_addr_token(addr(1), &Token::from_bytes(vec![2]))
            .unwrap();
        assert_eq!(popped.resource_id.href, "/b");
        assert_eq!(container.index_sizes(), (1, 1));
    }

    #[test]
    fn test_empty_after_removals() {
        let container = ObservationContainer::new();
        container.add(observer("d", "/a", 1, 1)).unwrap();
        container.pop_by_remote_addr(addr(1)).unwrap();
        assert!(container.is_empty());
    }

    // ==================== ObserveSequence Tests ====================

    #[test]
    fn test_sequence_starts_at_two() {
        let seq = ObserveSequence::new();
        assert_eq!(seq.next_value(), 2);
        assert_eq!(seq.next_value(), 3);
        assert_eq!(seq.next_value(), 4);
    }

    #[test]
    fn test_sequence_from_one_skips_reserved() {
        let seq = ObserveSequence::starting_after(1);
        assert_eq!(seq.next_value(), 2);
    }

    #[test]
    fn test_sequence_wraps_to_two() {
        let seq = ObserveSequence::starting_after(OBSERVE_LIMIT - 2);
        assert_eq!(seq.next_value(), OBSERVE_LIMIT - 1);
        assert_eq!(seq.next_value(), 2);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8, u16, u8),
        Remove(u8, u16, u8),
        PopAddr(u16),
        PopToken(u16, u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..3, 0u16..3, 0u8..4).prop_map(|(r, a, t)| Op::Add(r, a, t)),
            (0u8..3, 0u16..3, 0u8..4).prop_map(|(r, a, t)| Op::Remove(r, a, t)),
            (0u16..3).prop_map(Op::PopAddr),
            (0u16..3, 0u8..4).prop_map(|(a, t)| Op::PopToken(a, t)),
        ]
    }

    proptest! {
        #[test]
        fn prop_indexes_never_diverge(ops in proptest::collection::vec(op_strategy(), 0..64)) {
            let container = ObservationContainer::new();
            for op in ops {
                match op {
                    Op::Add(r, a, t) => {
                        let _ = container.add(observer("d", &format!("/r{r}"), a, t));
                    }
                    Op::Remove(r, a, t) => {
                        let id = ResourceId::new(DeviceId::new("d"), &format!("/r{r}"));
                        let res = container.remove_by_resource(&id, addr(a), &Token::from_bytes(vec![t]));
                        prop_assert!(!matches!(res, Err(GatewayError::UnstableContainer(_))));
                    }
                    Op::PopAddr(a) => {
                        let res = container.pop_by_remote_addr(addr(a));
                        prop_assert!(!matches!(res, Err(GatewayError::UnstableContainer(_))));
                    }
                    Op::PopToken(a, t) => {
                        let res = container.pop_by_remote_addr_token(addr(a), &Token::from_bytes(vec![t]));
                        prop_assert!(!matches!(res, Err(GatewayError::UnstableContainer(_))));
                    }
                }
                let (by_resource, by_addr) = container.index_sizes();
                prop_assert_eq!(by_resource, by_addr);
            }
        }

        #[test]
        fn prop_sequence_never_reserved(start in 0u32..OBSERVE_LIMIT) {
            let seq = ObserveSequence::starting_after(start);
            for _ in 0..4 {
                let v = seq.next_value();
                prop_assert!((OBSERVE_MIN..OBSERVE_LIMIT).contains(&v));
            }
        }
    }
}
