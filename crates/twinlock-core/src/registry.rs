//! Element registry: generation-stamped slots plus an object-id index.
//!
//! Handles received from the peer are only ever resolved through here, so a
//! stale or forged handle fails the generation check instead of reaching a
//! recycled element.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;
use twinlock_cmi::{ElementHandle, ObjectId};

use crate::element::MetadataElement;
use crate::error::{MetadataError, MetadataResult};

struct Slot {
    generation: u32,
    element: Option<Arc<MetadataElement>>,
}

#[derive(Default)]
pub(crate) struct Registry {
    slots: RwLock<Vec<Slot>>,
    by_object: DashMap<ObjectId, ElementHandle>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the element built by `make` for `object_id`.
    pub fn insert(
        &self,
        object_id: ObjectId,
        make: impl FnOnce(ElementHandle) -> MetadataElement,
    ) -> MetadataResult<Arc<MetadataElement>> {
        match self.by_object.entry(object_id) {
            Entry::Occupied(_) => Err(MetadataError::AlreadyRegistered { object_id }),
            Entry::Vacant(vacant) => {
                let mut slots = self.slots.write();
                let index = match slots.iter().position(|s| s.element.is_none()) {
                    Some(index) => index,
                    None => {
                        slots.push(Slot {
                            generation: 0,
                            element: None,
                        });
                        slots.len() - 1
                    }
                };
                let slot = &mut slots[index];
                slot.generation = next_generation(slot.generation);
                let handle = ElementHandle::new(index as u32, slot.generation);
                let element = Arc::new(make(handle));
                slot.element = Some(Arc::clone(&element));
                vacant.insert(handle);
                info!(object_id, ?handle, "element registered");
                Ok(element)
            }
        }
    }

    pub fn get(&self, handle: ElementHandle) -> Option<Arc<MetadataElement>> {
        if handle.is_null() {
            return None;
        }
        let slots = self.slots.read();
        let slot = slots.get(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.element.clone()
    }

    pub fn by_object(&self, object_id: ObjectId) -> Option<Arc<MetadataElement>> {
        let handle = *self.by_object.get(&object_id)?;
        self.get(handle)
    }

    pub fn remove(&self, handle: ElementHandle) -> Option<Arc<MetadataElement>> {
        let element = {
            let mut slots = self.slots.write();
            let slot = slots.get_mut(handle.index() as usize)?;
            if slot.generation != handle.generation() {
                return None;
            }
            slot.element.take()?
        };
        self.by_object.remove(&element.object_id());
        info!(object_id = element.object_id(), ?handle, "element unregistered");
        Some(element)
    }

    pub fn all(&self) -> Vec<Arc<MetadataElement>> {
        self.slots
            .read()
            .iter()
            .filter_map(|s| s.element.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_object.len()
    }
}

fn next_generation(generation: u32) -> u32 {
    match generation.wrapping_add(1) {
        0 => 1,
        g => g,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DomainConfig, ElementConfig};

    fn make(object_id: ObjectId) -> impl FnOnce(ElementHandle) -> MetadataElement {
        move |h| MetadataElement::new(h, ElementConfig::new(object_id), &DomainConfig::default())
    }

    #[test]
    fn test_insert_and_lookup() {
        let reg = Registry::new();
        let el = reg.insert(7, make(7)).unwrap();
        assert_eq!(reg.get(el.handle()).unwrap().object_id(), 7);
        assert_eq!(reg.by_object(7).unwrap().handle(), el.handle());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let reg = Registry::new();
        reg.insert(7, make(7)).unwrap();
        assert!(matches!(
            reg.insert(7, make(7)),
            Err(MetadataError::AlreadyRegistered { object_id: 7 })
        ));
    }

    #[test]
    fn test_stale_handle_rejected_after_reuse() {
        let reg = Registry::new();
        let old = reg.insert(1, make(1)).unwrap().handle();
        reg.remove(old).unwrap();
        let new = reg.insert(2, make(2)).unwrap().handle();
        assert_eq!(old.index(), new.index());
        assert_ne!(old.generation(), new.generation());
        assert!(reg.get(old).is_none());
        assert!(reg.remove(old).is_none());
        assert!(reg.by_object(1).is_none());
    }

    #[test]
    fn test_null_never_resolves() {
        let reg = Registry::new();
        reg.insert(1, make(1)).unwrap();
        assert!(reg.get(ElementHandle::NULL).is_none());
    }

    #[test]
    fn test_generation_skips_zero() {
        assert_eq!(next_generation(u32::MAX), 1);
        assert_eq!(next_generation(0), 1);
    }
}
