//! Global event and fault observers.
//!
//! Observers may register, unregister or stop themselves while a dispatch is
//! running. Removal during a dispatch only marks the entry; the list is
//! compacted once the outermost dispatch returns.

use crate::types::{Event, Fault, Handle};
use crate::viewer::Viewer;
use std::ops::ControlFlow;

/// Lifecycle and content events. Return `ControlFlow::Break(())` to
/// unregister.
pub type EventHandler = dyn FnMut(&mut Viewer, Handle, Event) -> ControlFlow<()>;

/// Provider faults. Return `ControlFlow::Break(())` to unregister.
pub type FaultHandler = dyn FnMut(&mut Viewer, &Fault) -> ControlFlow<()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct Entry<F: ?Sized> {
    id: ObserverId,
    /// `None` while the handler is running
    handler: Option<Box<F>>,
    deleted: bool,
}

pub(crate) struct Registry<F: ?Sized> {
    entries: Vec<Entry<F>>,
    next_id: u64,
    dispatching: usize,
}

impl<F: ?Sized> Default for Registry<F> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
            dispatching: 0,
        }
    }
}

impl<F: ?Sized> Registry<F> {
    pub(crate) fn add(&mut self, handler: Box<F>) -> ObserverId {
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        self.entries.push(Entry {
            id,
            handler: Some(handler),
            deleted: false,
        });
        id
    }

    /// Returns false if `id` is not registered.
    pub(crate) fn remove(&mut self, id: ObserverId) -> bool {
        let Some(pos) = self.entries.iter().position(|e| e.id == id && !e.deleted) else {
            return false;
        };
        if self.dispatching > 0 {
            self.entries[pos].deleted = true;
        } else {
            self.entries.remove(pos);
        }
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.deleted).count()
    }

    fn begin(&mut self) {
        self.dispatching += 1;
    }

    fn end(&mut self) {
        self.dispatching -= 1;
        if self.dispatching == 0 {
            self.entries.retain(|e| !e.deleted);
        }
    }

    fn take(&mut self, idx: usize) -> Option<(ObserverId, Box<F>)> {
        let entry = self.entries.get_mut(idx)?;
        if entry.deleted {
            return None;
        }
        let handler = entry.handler.take()?;
        Some((entry.id, handler))
    }

    fn restore(&mut self, idx: usize, id: ObserverId, handler: Box<F>, stop: bool) {
        // Entries are never spliced while dispatching, so the index holds.
        if let Some(entry) = self.entries.get_mut(idx).filter(|e| e.id == id) {
            entry.handler = Some(handler);
            if stop {
                entry.deleted = true;
            }
        }
    }
}

/// Run every live handler of the registry picked by `select`. Handlers get
/// the whole viewer and may call back into it.
fn dispatch<F: ?Sized>(
    viewer: &mut Viewer,
    select: fn(&mut Viewer) -> &mut Registry<F>,
    mut call: impl FnMut(&mut F, &mut Viewer) -> ControlFlow<()>,
) {
    select(viewer).begin();
    let mut idx = 0;
    while idx < select(viewer).entries.len() {
        if let Some((id, mut handler)) = select(viewer).take(idx) {
            let flow = call(&mut *handler, viewer);
            select(viewer).restore(idx, id, handler, flow.is_break());
        }
        idx += 1;
    }
    select(viewer).end();
}

fn events_of(viewer: &mut Viewer) -> &mut Registry<EventHandler> {
    &mut viewer.events
}

fn faults_of(viewer: &mut Viewer) -> &mut Registry<FaultHandler> {
    &mut viewer.faults
}

pub(crate) fn dispatch_event(viewer: &mut Viewer, handle: Handle, event: Event) {
    tracing::trace!("{handle}: {event:?}");
    dispatch(viewer, events_of, |h, v| h(v, handle, event));
}

pub(crate) fn dispatch_fault(viewer: &mut Viewer, fault: &Fault) {
    tracing::debug!("fault {:?} {:?}/{:?}", fault.kind, fault.pkgname, fault.id);
    dispatch(viewer, faults_of, |h, v| h(v, fault));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::viewer::fixture::viewer;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_remove_outside_dispatch_splices() {
        let mut reg: Registry<EventHandler> = Registry::default();
        let a = reg.add(Box::new(|_, _, _| ControlFlow::Continue(())));
        let b = reg.add(Box::new(|_, _, _| ControlFlow::Continue(())));
        assert!(reg.remove(a));
        assert!(!reg.remove(a));
        assert_eq!(reg.len(), 1);
        assert!(reg.remove(b));
        assert_eq!(reg.entries.len(), 0);
    }

    #[test]
    fn test_break_unregisters() {
        let (mut v, _sent) = viewer();
        let calls = Rc::new(RefCell::new(0));
        let c = calls.clone();
        v.add_event_handler(move |_, _, _| {
            *c.borrow_mut() += 1;
            ControlFlow::Break(())
        });
        dispatch_event(&mut v, Handle(1), Event::Created);
        dispatch_event(&mut v, Handle(1), Event::Created);
        assert_eq!(*calls.borrow(), 1);
        assert_eq!(v.events.len(), 0);
    }

    #[test]
    fn test_remove_during_dispatch_is_deferred() {
        let (mut v, _sent) = viewer();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let s = seen.clone();
        let second = Rc::new(RefCell::new(None));
        let target = second.clone();
        v.add_event_handler(move |v, _, _| {
            s.borrow_mut().push("first");
            if let Some(id) = target.borrow_mut().take() {
                assert!(v.remove_event_handler(id).is_ok());
                // Still present until the dispatch unwinds.
                assert_eq!(v.events.entries.len(), 2);
            }
            ControlFlow::Continue(())
        });
        let s = seen.clone();
        let id = v.add_event_handler(move |_, _, _| {
            s.borrow_mut().push("second");
            ControlFlow::Continue(())
        });
        *second.borrow_mut() = Some(id);

        dispatch_event(&mut v, Handle(1), Event::DboxUpdated);
        assert_eq!(*seen.borrow(), vec!["first"]);
        assert_eq!(v.events.entries.len(), 1);
    }

    #[test]
    fn test_nested_dispatch() {
        let (mut v, _sent) = viewer();
        let depth = Rc::new(RefCell::new(Vec::new()));
        let d = depth.clone();
        v.add_event_handler(move |v, h, ev| {
            d.borrow_mut().push(ev);
            if ev == Event::Created {
                dispatch_event(v, h, Event::DboxUpdated);
            }
            ControlFlow::Continue(())
        });
        let d = depth.clone();
        v.add_event_handler(move |_, _, ev| {
            d.borrow_mut().push(ev);
            ControlFlow::Continue(())
        });

        dispatch_event(&mut v, Handle(1), Event::Created);
        // The running handler is skipped by the nested dispatch.
        assert_eq!(
            *depth.borrow(),
            vec![Event::Created, Event::DboxUpdated, Event::Created]
        );
    }
}
