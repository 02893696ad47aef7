//! Handle registry
//!
//! Classes and watches get stable integer handles so records can reference
//! them compactly and the service can resolve a handle back to its object.
//! The registry is owned by the service and cleared when it stops.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;
use voltage_alarm_store::Handle;

use crate::class::AlarmClass;
use crate::error::{AlarmError, Result};
use crate::watch::AlarmWatch;

#[derive(Debug, Clone)]
pub enum RegisteredObject {
    Class(Arc<AlarmClass>),
    Watch(Arc<AlarmWatch>),
}

pub struct HandleRegistry {
    next_handle: AtomicU32,
    objects: DashMap<Handle, RegisteredObject>,
}

impl HandleRegistry {
    pub fn new(next_handle: u32) -> Self {
        Self {
            next_handle: AtomicU32::new(next_handle.max(1)),
            objects: DashMap::new(),
        }
    }

    /// Handle the next registration without a requested handle will get
    pub fn next_handle(&self) -> u32 {
        self.next_handle.load(Ordering::SeqCst)
    }

    /// Register the object built by `build` under `requested`, or under a
    /// fresh handle when none is requested. The counter is kept above every
    /// handle in use.
    fn register<F>(&self, requested: Option<Handle>, build: F) -> Result<RegisteredObject>
    where
        F: FnOnce(Handle) -> Result<RegisteredObject>,
    {
        if let Some(handle) = requested {
            if handle.0 == 0 {
                return Err(AlarmError::InvalidHandle(handle));
            }
            return match self.objects.entry(handle) {
                Entry::Occupied(_) => Err(AlarmError::AlreadyExists(format!("handle {}", handle))),
                Entry::Vacant(slot) => {
                    let object = build(handle)?;
                    slot.insert(object.clone());
                    self.next_handle
                        .fetch_max(handle.0.saturating_add(1), Ordering::SeqCst);
                    debug!("Registered handle {}", handle);
                    Ok(object)
                }
            };
        }

        let mut build = Some(build);
        loop {
            let handle = Handle(self.next_handle.fetch_add(1, Ordering::SeqCst));
            if handle.0 == u32::MAX {
                return Err(AlarmError::Config("handle space exhausted".to_string()));
            }
            if let Entry::Vacant(slot) = self.objects.entry(handle) {
                let build = build
                    .take()
                    .ok_or_else(|| AlarmError::Config("handle registration retried".to_string()))?;
                let object = build(handle)?;
                slot.insert(object.clone());
                debug!("Registered handle {}", handle);
                return Ok(object);
            }
        }
    }

    pub fn register_class<F>(&self, requested: Option<Handle>, build: F) -> Result<Arc<AlarmClass>>
    where
        F: FnOnce(Handle) -> Result<AlarmClass>,
    {
        match self.register(requested, |h| Ok(RegisteredObject::Class(Arc::new(build(h)?))))? {
            RegisteredObject::Class(class) => Ok(class),
            RegisteredObject::Watch(watch) => Err(AlarmError::InvalidHandle(watch.handle())),
        }
    }

    pub fn register_watch<F>(&self, requested: Option<Handle>, build: F) -> Result<Arc<AlarmWatch>>
    where
        F: FnOnce(Handle) -> Result<AlarmWatch>,
    {
        match self.register(requested, |h| Ok(RegisteredObject::Watch(Arc::new(build(h)?))))? {
            RegisteredObject::Watch(watch) => Ok(watch),
            RegisteredObject::Class(class) => Err(AlarmError::InvalidHandle(class.handle())),
        }
    }

    /// Remove a handle; fails with `InvalidHandle` if it is not registered
    pub fn unregister(&self, handle: Handle) -> Result<RegisteredObject> {
        self.objects
            .remove(&handle)
            .map(|(_, object)| {
                debug!("Unregistered handle {}", handle);
                object
            })
            .ok_or(AlarmError::InvalidHandle(handle))
    }

    pub fn get(&self, handle: Handle) -> Option<RegisteredObject> {
        self.objects.get(&handle).map(|entry| entry.value().clone())
    }

    pub fn class(&self, handle: Handle) -> Option<Arc<AlarmClass>> {
        match self.get(handle)? {
            RegisteredObject::Class(class) => Some(class),
            RegisteredObject::Watch(_) => None,
        }
    }

    pub fn watch(&self, handle: Handle) -> Option<Arc<AlarmWatch>> {
        match self.get(handle)? {
            RegisteredObject::Watch(watch) => Some(watch),
            RegisteredObject::Class(_) => None,
        }
    }

    /// Registered classes ordered by handle
    pub fn classes(&self) -> Vec<Arc<AlarmClass>> {
        let mut classes: Vec<_> = self
            .objects
            .iter()
            .filter_map(|entry| match entry.value() {
                RegisteredObject::Class(class) => Some(class.clone()),
                RegisteredObject::Watch(_) => None,
            })
            .collect();
        classes.sort_by_key(|c| c.handle());
        classes
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn clear(&self) {
        self.objects.clear();
    }
}
