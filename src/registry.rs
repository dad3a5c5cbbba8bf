//! Input callback registry
//!
//! Ordered list of handlers attached to an input device. The driver thread
//! dispatches every inbound event to all current registrations; handlers may
//! remove themselves (or anything else) mid-dispatch without corrupting the
//! iteration, because dispatch works from a snapshot of the list.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::midi::MidiEvent;

/// Handler invoked for every dispatched event.
pub type Handler = Arc<dyn Fn(&MidiEvent, &mut DispatchControl) + Send + Sync>;

/// Opaque identity of one registration, returned by [`CallbackRegistry::add`].
///
/// Tokens are unique for the lifetime of the registry, so registering the
/// same handler twice yields two removable entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationToken(u64);

/// Per-message dispatch state shared by all handlers of one event.
///
/// `cancel` is observable by later handlers but the dispatch loop does not
/// act on it; reserved.
#[derive(Debug, Default)]
pub struct DispatchControl {
    pub cancel: bool,
}

struct Registration {
    token: RegistrationToken,
    tag: Option<u32>,
    handler: Handler,
}

#[derive(Default)]
struct RegistryInner {
    next_token: u64,
    entries: Vec<Registration>,
}

/// Insertion-ordered callback registry. Shared between the application
/// thread and the MIDI driver thread.
#[derive(Default)]
pub struct CallbackRegistry {
    inner: Mutex<RegistryInner>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler; duplicates are permitted and get distinct tokens.
    pub fn add(&self, handler: Handler) -> RegistrationToken {
        self.add_inner(None, handler)
    }

    /// Append a handler carrying a group tag, removable via
    /// [`CallbackRegistry::remove_tagged`].
    pub fn add_tagged(&self, tag: u32, handler: Handler) -> RegistrationToken {
        self.add_inner(Some(tag), handler)
    }

    fn add_inner(&self, tag: Option<u32>, handler: Handler) -> RegistrationToken {
        let mut inner = self.inner.lock();
        let token = RegistrationToken(inner.next_token);
        inner.next_token += 1;
        inner.entries.push(Registration {
            token,
            tag,
            handler,
        });
        trace!("registered callback {:?}", token);
        token
    }

    /// Remove at most one entry, searching newest-first. Returns whether an
    /// entry was removed; removing an already-removed token is a no-op.
    pub fn remove(&self, token: RegistrationToken) -> bool {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.entries.iter().rposition(|r| r.token == token) {
            inner.entries.remove(pos);
            trace!("removed callback {:?}", token);
            true
        } else {
            false
        }
    }

    /// Remove every entry carrying the tag. Returns whether anything was
    /// removed.
    pub fn remove_tagged(&self, tag: u32) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|r| r.tag != Some(tag));
        inner.entries.len() != before
    }

    /// Remove every registration. Returns whether anything was removed.
    pub fn remove_all(&self) -> bool {
        let mut inner = self.inner.lock();
        let had_entries = !inner.entries.is_empty();
        inner.entries.clear();
        had_entries
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Invoke every current registration in registration order.
    ///
    /// The list is snapshotted up front; an entry removed by an earlier
    /// handler of the same event is skipped rather than invoked on a stale
    /// reference. The registry lock is never held across a handler call, so
    /// handlers are free to add or remove registrations.
    pub fn dispatch(&self, event: &MidiEvent) {
        let snapshot: Vec<(RegistrationToken, Handler)> = {
            let inner = self.inner.lock();
            inner
                .entries
                .iter()
                .map(|r| (r.token, Arc::clone(&r.handler)))
                .collect()
        };

        let mut control = DispatchControl::default();
        for (token, handler) in snapshot {
            let still_registered = {
                let inner = self.inner.lock();
                inner.entries.iter().any(|r| r.token == token)
            };
            if !still_registered {
                continue;
            }
            handler(event, &mut control);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_event, _control| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn duplicate_registrations_are_distinct() {
        let registry = CallbackRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(hits.clone());

        // Same handler, same tag, registered twice: two removable entries.
        let first = registry.add_tagged(5, handler.clone());
        let second = registry.add_tagged(5, handler);
        assert_ne!(first, second);
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(first));
        assert_eq!(registry.len(), 1);
        assert!(!registry.remove(first));

        registry.dispatch(&MidiEvent::Buffered(vec![0xF0, 0xF7]));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(registry.remove_tagged(5));
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_tagged_clears_every_match() {
        let registry = CallbackRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.add_tagged(7, counting_handler(hits.clone()));
        registry.add_tagged(7, counting_handler(hits.clone()));
        registry.add_tagged(9, counting_handler(hits.clone()));

        assert!(registry.remove_tagged(7));
        assert_eq!(registry.len(), 1);
        assert!(!registry.remove_tagged(7));

        assert!(registry.remove_all());
        assert!(registry.is_empty());
        assert!(!registry.remove_all());
    }

    #[test]
    fn dispatch_runs_in_registration_order() {
        let registry = CallbackRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in 0..3 {
            let order = order.clone();
            registry.add(Arc::new(move |_event, _control| {
                order.lock().push(id);
            }));
        }

        registry.dispatch(&MidiEvent::Buffered(vec![0xF0, 0xF7]));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn handler_may_remove_itself_mid_dispatch() {
        let registry = Arc::new(CallbackRegistry::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let token_slot = Arc::new(Mutex::new(None::<RegistrationToken>));
        let registry_ref = registry.clone();
        let slot_ref = token_slot.clone();
        let hits_ref = hits.clone();
        let token = registry.add(Arc::new(move |_event, _control| {
            hits_ref.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = *slot_ref.lock() {
                registry_ref.remove(token);
            }
        }));
        *token_slot.lock() = Some(token);

        let event = MidiEvent::Buffered(vec![0xF0, 0xF7]);
        registry.dispatch(&event);
        registry.dispatch(&event);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn handler_removed_earlier_in_dispatch_is_skipped() {
        let registry = Arc::new(CallbackRegistry::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let registry_ref = registry.clone();
        let victim_slot = Arc::new(Mutex::new(None::<RegistrationToken>));
        let slot_ref = victim_slot.clone();
        registry.add(Arc::new(move |_event, _control| {
            if let Some(token) = *slot_ref.lock() {
                registry_ref.remove(token);
            }
        }));
        let victim = registry.add(counting_handler(hits.clone()));
        *victim_slot.lock() = Some(victim);

        registry.dispatch(&MidiEvent::Buffered(vec![0xF0, 0xF7]));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_flag_does_not_short_circuit() {
        let registry = CallbackRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        registry.add(Arc::new(|_event, control| {
            control.cancel = true;
        }));
        registry.add(counting_handler(hits.clone()));

        registry.dispatch(&MidiEvent::Buffered(vec![0xF0, 0xF7]));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
