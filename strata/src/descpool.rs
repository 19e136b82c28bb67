/*
 * Fixed size pools of binding (descriptor) sets
 *
 * Every pool holds DESCRIPTOR_POOL_SIZE sets of exactly one layout. All
 * sets are allocated up front and recycled through a free list, so the
 * native pool never sees individual frees.
 */
use crate::device::GpuDevice;
use crate::Result;
use ash::vk;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// The number of sets in each pool
pub const DESCRIPTOR_POOL_SIZE: u32 = 8;

/// One native descriptor pool for a single layout
pub struct BindingPool {
    bp_dev: Arc<dyn GpuDevice>,
    bp_pool: vk::DescriptorPool,
    /// sets not handed out. Popped from the front, freed sets go on the back
    bp_free: VecDeque<vk::DescriptorSet>,
}

impl BindingPool {
    /// Create a pool and allocate all of its sets
    ///
    /// `types` holds the descriptor type of every binding in `layout`.
    pub fn new(
        dev: Arc<dyn GpuDevice>,
        layout: vk::DescriptorSetLayout,
        types: &[vk::DescriptorType],
    ) -> Result<Self> {
        let sizes: Vec<vk::DescriptorPoolSize> = types
            .iter()
            .map(|ty| vk::DescriptorPoolSize {
                ty: *ty,
                descriptor_count: DESCRIPTOR_POOL_SIZE,
            })
            .collect();

        let pool = dev.create_descriptor_pool(&sizes, DESCRIPTOR_POOL_SIZE)?;
        let sets = match dev.allocate_descriptor_sets(pool, layout, DESCRIPTOR_POOL_SIZE) {
            Ok(sets) => sets,
            Err(e) => {
                dev.destroy_descriptor_pool(pool);
                return Err(e);
            }
        };

        Ok(Self {
            bp_dev: dev,
            bp_pool: pool,
            bp_free: sets.into_iter().collect(),
        })
    }

    /// Take a set from the free list
    ///
    /// Returns None when every set of this pool is in use.
    pub fn allocate(&mut self) -> Option<vk::DescriptorSet> {
        self.bp_free.pop_front()
    }

    /// Return a set taken from this pool
    pub fn free(&mut self, set: vk::DescriptorSet) {
        debug_assert!(!self.bp_free.contains(&set), "binding set freed twice");
        debug_assert!(self.bp_free.len() < DESCRIPTOR_POOL_SIZE as usize);
        self.bp_free.push_back(set);
    }

    /// Number of sets left in this pool
    pub fn available(&self) -> usize {
        self.bp_free.len()
    }
}

impl Drop for BindingPool {
    fn drop(&mut self) {
        self.bp_dev.destroy_descriptor_pool(self.bp_pool);
    }
}

/// All pools for one layout signature
///
/// Grows by one pool at a time when every existing pool is exhausted.
/// Pools are kept until the group itself is dropped. The group owns the
/// set layout and destroys it after its pools.
pub struct BindingPoolGroup {
    pg_dev: Arc<dyn GpuDevice>,
    pg_layout: vk::DescriptorSetLayout,
    pg_types: Vec<vk::DescriptorType>,
    pg_pools: Vec<BindingPool>,
    /// Which pool each handed out set belongs to
    pg_owners: HashMap<vk::DescriptorSet, usize>,
}

impl BindingPoolGroup {
    /// Create an empty group, taking ownership of `layout`
    pub fn new(
        dev: Arc<dyn GpuDevice>,
        layout: vk::DescriptorSetLayout,
        types: Vec<vk::DescriptorType>,
    ) -> Self {
        Self {
            pg_dev: dev,
            pg_layout: layout,
            pg_types: types,
            pg_pools: Vec::new(),
            pg_owners: HashMap::new(),
        }
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.pg_layout
    }

    pub fn pool_count(&self) -> usize {
        self.pg_pools.len()
    }

    /// Number of sets currently handed out
    pub fn sets_in_use(&self) -> usize {
        self.pg_owners.len()
    }

    /// Adds and returns the index of a new pool
    fn add_pool(&mut self) -> Result<usize> {
        let pool = BindingPool::new(self.pg_dev.clone(), self.pg_layout, &self.pg_types)?;
        self.pg_pools.push(pool);
        log::debug!(
            "Binding pool group {:?} grew to {} pools",
            self.pg_layout,
            self.pg_pools.len()
        );

        Ok(self.pg_pools.len() - 1)
    }

    fn allocate_one(&mut self) -> Result<vk::DescriptorSet> {
        for (i, pool) in self.pg_pools.iter_mut().enumerate() {
            if let Some(set) = pool.allocate() {
                self.pg_owners.insert(set, i);
                return Ok(set);
            }
        }

        // If we couldn't find a pool then add a new one
        let index = self.add_pool()?;
        let set = self.pg_pools[index]
            .allocate()
            .ok_or(crate::StrataError::INVALID)?;
        self.pg_owners.insert(set, index);

        Ok(set)
    }

    /// Allocate `count` sets
    ///
    /// Existing pools are drained before a new pool is created. This only
    /// fails if the device refuses to create another pool, in which case
    /// nothing stays allocated.
    pub fn allocate(&mut self, count: usize) -> Result<Vec<vk::DescriptorSet>> {
        let mut ret = Vec::with_capacity(count);

        for _ in 0..count {
            match self.allocate_one() {
                Ok(set) => ret.push(set),
                Err(e) => {
                    for set in ret.drain(..) {
                        self.free(set);
                    }
                    return Err(e);
                }
            }
        }

        Ok(ret)
    }

    /// Return a set to the pool that it came from
    pub fn free(&mut self, set: vk::DescriptorSet) {
        match self.pg_owners.remove(&set) {
            Some(index) => self.pg_pools[index].free(set),
            None => debug_assert!(false, "binding set {:?} is not from this group", set),
        }
    }
}

impl Drop for BindingPoolGroup {
    fn drop(&mut self) {
        if !self.pg_owners.is_empty() {
            log::error!(
                "Destroying binding pool group with {} sets still in use",
                self.pg_owners.len()
            );
        }

        self.pg_pools.clear();
        self.pg_dev.destroy_descriptor_set_layout(self.pg_layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HeadlessDevice;

    fn group(dev: &Arc<HeadlessDevice>) -> BindingPoolGroup {
        let binding = vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build();
        let layout = dev.create_descriptor_set_layout(&[binding]).unwrap();

        BindingPoolGroup::new(
            dev.clone(),
            layout,
            vec![vk::DescriptorType::COMBINED_IMAGE_SAMPLER],
        )
    }

    #[test]
    fn pool_hands_out_its_capacity() {
        let dev = Arc::new(HeadlessDevice::new());
        let layout = dev.create_descriptor_set_layout(&[]).unwrap();
        let mut pool = BindingPool::new(
            dev.clone(),
            layout,
            &[vk::DescriptorType::UNIFORM_BUFFER],
        )
        .unwrap();

        let sets: Vec<_> = (0..DESCRIPTOR_POOL_SIZE)
            .map(|_| pool.allocate().unwrap())
            .collect();
        assert_eq!(pool.allocate(), None);

        // FIFO reuse, the first freed set comes back first
        pool.free(sets[3]);
        pool.free(sets[1]);
        assert_eq!(pool.allocate(), Some(sets[3]));
        assert_eq!(pool.allocate(), Some(sets[1]));
    }

    #[test]
    fn group_grows_by_one_pool() {
        let dev = Arc::new(HeadlessDevice::new());
        let mut group = group(&dev);
        assert_eq!(group.pool_count(), 0);

        let sets = group.allocate(DESCRIPTOR_POOL_SIZE as usize + 1).unwrap();
        assert_eq!(group.pool_count(), 2);
        assert_eq!(dev.live_pool_count(), 2);

        // freeing and reallocating reuses the same set without a new pool
        group.free(sets[2]);
        let again = group.allocate(1).unwrap();
        assert_eq!(again, vec![sets[2]]);
        assert_eq!(group.pool_count(), 2);
        assert_eq!(group.sets_in_use(), DESCRIPTOR_POOL_SIZE as usize + 1);

        drop(group);
        assert_eq!(dev.live_pool_count(), 0);
        assert_eq!(dev.live_layout_count(), 0);
    }

    #[test]
    fn sets_are_unique_across_pools() {
        let dev = Arc::new(HeadlessDevice::new());
        let mut group = group(&dev);

        let mut sets = group.allocate(3 * DESCRIPTOR_POOL_SIZE as usize).unwrap();
        assert_eq!(group.pool_count(), 3);
        sets.sort();
        sets.dedup();
        assert_eq!(sets.len(), 3 * DESCRIPTOR_POOL_SIZE as usize);

        for set in sets {
            group.free(set);
        }
        assert_eq!(group.sets_in_use(), 0);
    }
}
