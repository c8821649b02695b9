//! Keyed registry for session-scoped objects.
//!
//! One `Store` instance holds the session clients, another holds the active
//! inhibitors. The store emits `Added`/`Removed` events synchronously through
//! an unbounded channel so the coordinator observes membership changes in
//! exactly the order they happen.

use std::collections::HashMap;

use tokio::sync::mpsc::UnboundedSender;

/// Membership change notifications.
///
/// `Removed` carries the departed entry so observers can still inspect it
/// after it has left the table.
#[derive(Debug)]
pub enum StoreEvent<T> {
    Added { id: String },
    Removed { id: String, entry: T },
}

pub struct Store<T> {
    entries: HashMap<String, T>,
    locked: bool,
    events: UnboundedSender<StoreEvent<T>>,
}

impl<T: Clone> Store<T> {
    pub fn new(events: UnboundedSender<StoreEvent<T>>) -> Self {
        Self {
            entries: HashMap::new(),
            locked: false,
            events,
        }
    }

    /// Inserts `entry` under `id`. Fails without mutating anything when the
    /// store is locked or the id is already taken.
    pub fn add(&mut self, id: &str, entry: T) -> bool {
        if self.locked {
            log::debug!("Store: rejecting add of '{}': store is locked", id);
            return false;
        }
        if self.entries.contains_key(id) {
            log::warn!("Store: rejecting add of '{}': id already present", id);
            return false;
        }
        self.entries.insert(id.to_string(), entry);
        let _ = self.events.send(StoreEvent::Added { id: id.to_string() });
        true
    }

    /// Removes the entry under `id`, handing it to the `Removed` event.
    pub fn remove(&mut self, id: &str) -> bool {
        match self.entries.remove(id) {
            Some(entry) => {
                let _ = self.events.send(StoreEvent::Removed {
                    id: id.to_string(),
                    entry,
                });
                true
            }
            None => false,
        }
    }

    pub fn lookup(&self, id: &str) -> Option<T> {
        self.entries.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn foreach(&self, mut f: impl FnMut(&str, &T)) {
        for (id, entry) in &self.entries {
            f(id, entry);
        }
    }

    /// Removes every entry the predicate matches and returns how many went.
    ///
    /// Removals and their `Removed` events are deferred until the scan has
    /// visited the whole table, so a predicate (or an event handler it
    /// triggers) never observes the table mid-mutation.
    pub fn foreach_remove(&mut self, mut pred: impl FnMut(&str, &T) -> bool) -> usize {
        let matched: Vec<String> = self
            .entries
            .iter()
            .filter(|(id, entry)| pred(id, entry))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &matched {
            if let Some(entry) = self.entries.remove(id) {
                let _ = self.events.send(StoreEvent::Removed {
                    id: id.clone(),
                    entry,
                });
            }
        }
        matched.len()
    }

    /// Drops every entry without emitting events; used at teardown only.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn values(&self) -> Vec<T> {
        self.entries.values().cloned().collect()
    }
}
