//! Capability-based service container.
//!
//! Components are registered once as `Arc` handles and declare the lifecycle
//! capabilities they implement through [`Component`]. Consumers pull what they
//! need by capability ([`Registry::assignable_to`]) or by concrete type
//! ([`Registry::entries_of`]), or let the registry fill their empty slots via
//! [`Populate`].

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::daemon::{Initializer, Service, Terminator};

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("instance of {type_name} is already registered")]
    AlreadyRegistered { type_name: &'static str },
}

/// A registrable service.
///
/// Each `as_*` method is an explicit capability declaration: a component that
/// implements [`Initializer`] returns `Some(self)` from `as_initializer`, and so
/// on. The defaults declare nothing.
pub trait Component: Any + Send + Sync {
    fn as_initializer(self: Arc<Self>) -> Option<Arc<dyn Initializer>> {
        None
    }

    fn as_service(self: Arc<Self>) -> Option<Arc<dyn Service>> {
        None
    }

    fn as_terminator(self: Arc<Self>) -> Option<Arc<dyn Terminator>> {
        None
    }
}

/// A capability that registry entries can be cast to.
pub trait Capability {
    fn cast(component: Arc<dyn Component>) -> Option<Arc<Self>>;
}

impl Capability for dyn Initializer {
    fn cast(component: Arc<dyn Component>) -> Option<Arc<Self>> {
        component.as_initializer()
    }
}

impl Capability for dyn Service {
    fn cast(component: Arc<dyn Component>) -> Option<Arc<Self>> {
        component.as_service()
    }
}

impl Capability for dyn Terminator {
    fn cast(component: Arc<dyn Component>) -> Option<Arc<Self>> {
        component.as_terminator()
    }
}

/// Handle to one registered instance.
#[derive(Clone)]
pub struct Entry {
    component: Arc<dyn Component>,
    instance: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Entry {
    fn new<T: Component>(instance: Arc<T>) -> Self {
        Self {
            component: instance.clone(),
            instance,
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Concrete handle, if the entry holds a `T`.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.instance.clone().downcast::<T>().ok()
    }

    /// Capability handle, if the entry declares `C`.
    pub fn cast<C: Capability + ?Sized>(&self) -> Option<Arc<C>> {
        C::cast(self.component.clone())
    }

    fn is_instance(&self, other: &Arc<dyn Any + Send + Sync>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.instance), Arc::as_ptr(other))
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// A consumer whose dependencies can be filled from a [`Registry`].
///
/// Implementations call [`Registry::fill`] for singular slots and
/// [`Registry::fill_all`] for sequence slots. Both leave a slot that already
/// holds a value untouched.
pub trait Populate {
    fn populate(&mut self, registry: &Registry);
}

/// Ordered sequence of registered components.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<Vec<Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_entries(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register one instance. The same instance cannot be registered twice.
    pub fn register<T: Component>(&self, instance: Arc<T>) -> Result<(), RegistrationError> {
        let entry = Entry::new(instance);
        let mut entries = self.lock_entries();
        if entries.iter().any(|e| e.is_instance(&entry.instance)) {
            return Err(RegistrationError::AlreadyRegistered {
                type_name: entry.type_name,
            });
        }
        debug!(
            event = "core.registry.register_completed",
            type_name = entry.type_name,
            position = entries.len(),
        );
        entries.push(entry);
        Ok(())
    }

    /// Snapshot of all entries in registration order.
    pub fn entries(&self) -> Vec<Entry> {
        self.lock_entries().clone()
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// Every entry declaring capability `C`, in registration order.
    pub fn assignable_to<C: Capability + ?Sized>(&self) -> Vec<Arc<C>> {
        self.entries().iter().filter_map(Entry::cast::<C>).collect()
    }

    /// Every entry whose concrete type is `T`, in registration order.
    pub fn entries_of<T: Any + Send + Sync>(&self) -> Vec<Arc<T>> {
        self.entries().iter().filter_map(Entry::downcast::<T>).collect()
    }

    /// Set an empty singular slot to the first entry declaring `C`.
    pub fn fill<C: Capability + ?Sized>(&self, slot: &mut Option<Arc<C>>) {
        if slot.is_some() {
            return;
        }
        *slot = self.assignable_to::<C>().into_iter().next();
    }

    /// Set an empty singular slot to the first entry of concrete type `T`.
    pub fn fill_instance<T: Any + Send + Sync>(&self, slot: &mut Option<Arc<T>>) {
        if slot.is_some() {
            return;
        }
        *slot = self.entries_of::<T>().into_iter().next();
    }

    /// Set an empty sequence slot to every entry declaring `C`.
    pub fn fill_all<C: Capability + ?Sized>(&self, slot: &mut Vec<Arc<C>>) {
        if !slot.is_empty() {
            return;
        }
        *slot = self.assignable_to::<C>();
    }

    pub fn populate<P: Populate + ?Sized>(&self, consumer: &mut P) {
        consumer.populate(self);
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.lock_entries().iter()).finish()
    }
}
