use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

enum Pending<D: ?Sized> {
    Add(Rc<D>),
    Remove(*const ()),
}

fn address<T: ?Sized>(delegate: &T) -> *const () {
    delegate as *const T as *const ()
}

/// Ordered set of subscribers that tolerates mutation from inside its own callbacks.
///
/// Adds and removes issued while [`for_each`](Self::for_each) is running are
/// queued and applied once the outermost pass returns. A delegate removed
/// mid-pass is skipped for the rest of that pass; one added mid-pass is first
/// called on the next pass. Identity is the address of the shared allocation,
/// so a delegate can remove itself through `&self`.
pub struct DelegateRegistry<D: ?Sized> {
    entries: RefCell<Vec<Rc<D>>>,
    pending: RefCell<Vec<Pending<D>>>,
    depth: Cell<usize>,
}

impl<D: ?Sized> DelegateRegistry<D> {
    pub fn new() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
            pending: RefCell::new(Vec::new()),
            depth: Cell::new(0),
        }
    }

    /// Returns `false` if the delegate is already registered.
    pub fn add(&self, delegate: Rc<D>) -> bool {
        if self.is_registered(address(&*delegate)) {
            return false;
        }

        if self.is_dispatching() {
            self.pending.borrow_mut().push(Pending::Add(delegate));
        } else {
            self.entries.borrow_mut().push(delegate);
        }
        true
    }

    /// Returns `false` if the delegate was not registered. Only the address
    /// of `delegate` is compared, so a borrow of any lifetime works.
    pub fn remove<T: ?Sized>(&self, delegate: &T) -> bool {
        let target = address(delegate);
        if !self.is_registered(target) {
            return false;
        }

        if self.is_dispatching() {
            self.pending.borrow_mut().push(Pending::Remove(target));
        } else {
            self.entries
                .borrow_mut()
                .retain(|entry| address(&**entry) != target);
        }
        true
    }

    pub fn contains<T: ?Sized>(&self, delegate: &T) -> bool {
        self.is_registered(address(delegate))
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dispatching(&self) -> bool {
        self.depth.get() > 0
    }

    /// Calls `f` for every registered delegate. No internal borrow is held
    /// while `f` runs, so `f` may re-enter the registry.
    pub fn for_each(&self, mut f: impl FnMut(&D)) {
        self.depth.set(self.depth.get() + 1);
        let _guard = DispatchGuard(self);

        let snapshot: Vec<Rc<D>> = self.entries.borrow().clone();
        for delegate in snapshot {
            if self.is_pending_removal(address(&*delegate)) {
                continue;
            }
            f(&*delegate);
        }
    }

    fn is_registered(&self, target: *const ()) -> bool {
        let mut registered = self
            .entries
            .borrow()
            .iter()
            .any(|entry| address(&**entry) == target);

        for op in self.pending.borrow().iter() {
            match op {
                Pending::Add(delegate) if address(&**delegate) == target => registered = true,
                Pending::Remove(removed) if *removed == target => registered = false,
                _ => {}
            }
        }
        registered
    }

    fn is_pending_removal(&self, target: *const ()) -> bool {
        self.pending
            .borrow()
            .iter()
            .rev()
            .find_map(|op| match op {
                Pending::Add(delegate) if address(&**delegate) == target => Some(false),
                Pending::Remove(removed) if *removed == target => Some(true),
                _ => None,
            })
            .unwrap_or(false)
    }

    fn apply_pending(&self) {
        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        let mut entries = self.entries.borrow_mut();
        for op in pending {
            match op {
                Pending::Add(delegate) => {
                    let target = address(&*delegate);
                    if !entries.iter().any(|entry| address(&**entry) == target) {
                        entries.push(delegate);
                    }
                }
                Pending::Remove(target) => entries.retain(|entry| address(&**entry) != target),
            }
        }
    }
}

impl<D: ?Sized> Default for DelegateRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: ?Sized> fmt::Debug for DelegateRegistry<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegateRegistry")
            .field("len", &self.len())
            .field("pending", &self.pending.borrow().len())
            .field("depth", &self.depth.get())
            .finish()
    }
}

struct DispatchGuard<'a, D: ?Sized>(&'a DelegateRegistry<D>);

impl<D: ?Sized> Drop for DispatchGuard<'_, D> {
    fn drop(&mut self) {
        let depth = self.0.depth.get() - 1;
        self.0.depth.set(depth);
        if depth == 0 {
            self.0.apply_pending();
        }
    }
}
