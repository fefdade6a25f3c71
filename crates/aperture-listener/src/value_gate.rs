//! Single-slot container that separates publishing from waiting

use tokio::sync::watch;

/// A slot that is either empty or holds one value
///
/// [`load`](ValueGate::load) suspends while the slot is empty and returns a
/// clone of the value once one is [`set`](ValueGate::set). Waiters stay
/// released until [`unset`](ValueGate::unset) empties the slot again.
///
/// ```ignore
/// let gate = ValueGate::new();
/// gate.set(7u32);
/// assert_eq!(gate.load().await, 7);
/// ```
#[derive(Debug)]
pub struct ValueGate<T> {
    slot: watch::Sender<Option<T>>,
}

impl<T: Clone> ValueGate<T> {
    /// Empty gate
    pub fn new() -> Self {
        Self {
            slot: watch::Sender::new(None),
        }
    }

    /// Publish a value, replacing any previous one, and release all waiters
    pub fn set(&self, value: T) {
        self.slot.send_replace(Some(value));
    }

    /// Retract the value; later `load` calls block until the next `set`
    pub fn unset(&self) -> Option<T> {
        self.slot.send_replace(None)
    }

    /// Current value without waiting
    pub fn try_load(&self) -> Option<T> {
        self.slot.borrow().clone()
    }

    /// Wait for a value and return a clone of it
    pub async fn load(&self) -> T {
        let mut rx = self.slot.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(value) = current {
                return value;
            }
            if rx.changed().await.is_err() {
                // The sender lives as long as `self`, so this cannot happen
                std::future::pending::<()>().await;
            }
        }
    }

    /// Whether a value is currently published
    pub fn is_set(&self) -> bool {
        self.slot.borrow().is_some()
    }
}

impl<T: Clone> Default for ValueGate<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn load_returns_immediately_when_set() {
        let gate = ValueGate::new();
        gate.set("a".to_string());
        assert_eq!(gate.load().await, "a");
        assert_eq!(gate.try_load().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn load_blocks_until_set() {
        let gate = Arc::new(ValueGate::<u32>::new());
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.load().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.set(42);
        let value = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released")
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn repeated_set_and_unset_are_idempotent() {
        let gate = ValueGate::new();
        gate.set(1);
        gate.set(1);
        assert_eq!(gate.load().await, 1);

        assert_eq!(gate.unset(), Some(1));
        assert_eq!(gate.unset(), None);
        assert!(!gate.is_set());

        let blocked = tokio::time::timeout(Duration::from_millis(20), gate.load()).await;
        assert!(blocked.is_err(), "load must block after unset");
    }

    #[tokio::test]
    async fn every_waiter_is_released() {
        let gate = Arc::new(ValueGate::<u8>::new());
        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.load().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.set(9);
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), 9);
        }
    }

    #[tokio::test]
    async fn set_replaces_previous_value() {
        let gate = ValueGate::new();
        gate.set(1);
        gate.set(2);
        assert_eq!(gate.load().await, 2);
    }
}
