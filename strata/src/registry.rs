// Binding set registry
//
// Maps layout hashes to the pool group serving them. Every resource that
// registers a hash holds one reference, the group and its pools are
// destroyed when the last one unregisters.
use crate::descpool::BindingPoolGroup;
use crate::device::GpuDevice;
use crate::layout::BindingLayout;
use crate::{Result, StrataError};
use ash::vk;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct RegisteredGroup {
    rg_group: BindingPoolGroup,
    rg_refcount: u32,
}

/// Shared binding set pools keyed by layout hash
///
/// Internally synchronized, share it through an Arc.
pub struct BindingSetRegistry {
    br_dev: Arc<dyn GpuDevice>,
    br_groups: Mutex<HashMap<u64, RegisteredGroup>>,
}

impl BindingSetRegistry {
    pub fn new(dev: Arc<dyn GpuDevice>) -> Self {
        Self {
            br_dev: dev,
            br_groups: Mutex::new(HashMap::new()),
        }
    }

    /// Take a reference on the group for `hash`
    ///
    /// The first registration creates the native set layout from `layout`
    /// and an empty group. Later ones only bump the reference count. The
    /// returned set layout stays valid until the last unregister.
    pub fn register_pool(&self, hash: u64, layout: &BindingLayout) -> Result<vk::DescriptorSetLayout> {
        let mut groups = self.br_groups.lock().unwrap();

        if let Some(rg) = groups.get_mut(&hash) {
            rg.rg_refcount += 1;
            return Ok(rg.rg_group.layout());
        }

        let set_layout = self
            .br_dev
            .create_descriptor_set_layout(&layout.native_bindings())?;
        let group = BindingPoolGroup::new(self.br_dev.clone(), set_layout, layout.descriptor_types());
        log::debug!("Registered binding layout {:#x}", hash);

        groups.insert(
            hash,
            RegisteredGroup {
                rg_group: group,
                rg_refcount: 1,
            },
        );

        Ok(set_layout)
    }

    /// Drop a reference on `hash`, destroying its group at zero
    pub fn unregister_pool(&self, hash: u64) -> Result<()> {
        let mut groups = self.br_groups.lock().unwrap();

        let rg = match groups.get_mut(&hash) {
            Some(rg) => rg,
            None => {
                debug_assert!(false, "unregistering unknown layout {:#x}", hash);
                return Err(StrataError::UNREGISTERED_LAYOUT(hash));
            }
        };

        rg.rg_refcount -= 1;
        if rg.rg_refcount == 0 {
            groups.remove(&hash);
            log::debug!("Destroyed binding pools for layout {:#x}", hash);
        }

        Ok(())
    }

    /// Allocate `count` sets of the layout registered under `hash`
    pub fn allocate(&self, hash: u64, count: usize) -> Result<Vec<vk::DescriptorSet>> {
        let mut groups = self.br_groups.lock().unwrap();

        match groups.get_mut(&hash) {
            Some(rg) => rg.rg_group.allocate(count),
            None => {
                debug_assert!(false, "allocating from unknown layout {:#x}", hash);
                Err(StrataError::UNREGISTERED_LAYOUT(hash))
            }
        }
    }

    /// Return sets allocated from `hash`
    pub fn free(&self, hash: u64, sets: &[vk::DescriptorSet]) -> Result<()> {
        let mut groups = self.br_groups.lock().unwrap();

        match groups.get_mut(&hash) {
            Some(rg) => {
                for set in sets.iter() {
                    rg.rg_group.free(*set);
                }
                Ok(())
            }
            None => {
                debug_assert!(false, "freeing sets of unknown layout {:#x}", hash);
                Err(StrataError::UNREGISTERED_LAYOUT(hash))
            }
        }
    }

    /// Number of references held on `hash`, zero if it isn't registered
    pub fn ref_count(&self, hash: u64) -> u32 {
        self.br_groups
            .lock()
            .unwrap()
            .get(&hash)
            .map(|rg| rg.rg_refcount)
            .unwrap_or(0)
    }

    /// Number of native pools behind `hash`
    pub fn pool_count(&self, hash: u64) -> usize {
        self.br_groups
            .lock()
            .unwrap()
            .get(&hash)
            .map(|rg| rg.rg_group.pool_count())
            .unwrap_or(0)
    }

    /// Number of sets of `hash` currently handed out
    pub fn sets_in_use(&self, hash: u64) -> usize {
        self.br_groups
            .lock()
            .unwrap()
            .get(&hash)
            .map(|rg| rg.rg_group.sets_in_use())
            .unwrap_or(0)
    }

    pub fn contains(&self, hash: u64) -> bool {
        self.br_groups.lock().unwrap().contains_key(&hash)
    }

    /// Number of registered layouts
    pub fn len(&self) -> usize {
        self.br_groups.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
