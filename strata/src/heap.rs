// Device memory heap
//
// Arenas of device memory, one or more per memory type. Requests are
// placed in the first arena of the right type that has room, new arenas
// are appended when none do.
use crate::arena::MemoryArena;
use crate::device::GpuDevice;
use crate::{CreateInfo, Result, StrataError};
use ash::vk;

use std::sync::{Arc, Mutex};

/// A block of device memory handed out by the DeviceHeap
///
/// Records which arena it came from so it can be returned to it. This is
/// intentionally not Clone, `DeviceHeap::free_memory` consumes it.
#[derive(Debug)]
pub struct Allocation {
    al_arena: usize,
    al_memory_type: u32,
    al_memory: vk::DeviceMemory,
    al_offset: u64,
    al_size: u64,
}

impl Allocation {
    /// The arena's backing memory object
    pub fn memory(&self) -> vk::DeviceMemory {
        self.al_memory
    }

    /// Byte offset of this allocation inside `memory()`
    pub fn offset(&self) -> u64 {
        self.al_offset
    }

    /// Usable bytes, the requested size grown to the alignment
    pub fn size(&self) -> u64 {
        self.al_size
    }

    pub fn arena_index(&self) -> usize {
        self.al_arena
    }

    pub fn memory_type(&self) -> u32 {
        self.al_memory_type
    }
}

/// Snapshot of heap usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    pub arenas: usize,
    /// Bytes of device memory allocated for arenas
    pub bytes_reserved: u64,
    /// Bytes handed out, after power of two rounding
    pub bytes_in_use: u64,
    pub live_allocations: usize,
}

struct HeapArena {
    ha_arena: MemoryArena,
    ha_memory_type: u32,
    ha_memory: vk::DeviceMemory,
    ha_live: usize,
}

/// Device memory heap
///
/// Internally synchronized, share it through an Arc.
pub struct DeviceHeap {
    dh_dev: Arc<dyn GpuDevice>,
    dh_mem_props: vk::PhysicalDeviceMemoryProperties,
    dh_chunk_size: u64,
    dh_chunk_count: u64,
    /// Released arenas leave a None so allocation indices stay valid
    dh_arenas: Mutex<Vec<Option<HeapArena>>>,
}

impl DeviceHeap {
    /// Create an empty heap, arenas are added on first use
    ///
    /// Fails if the chunk size or count isn't a nonzero power of two.
    pub fn new(dev: Arc<dyn GpuDevice>, info: &CreateInfo) -> Result<Self> {
        info.check_arena_size()?;

        Ok(Self {
            dh_mem_props: dev.memory_properties(),
            dh_dev: dev,
            dh_chunk_size: info.arena_chunk_size,
            dh_chunk_count: info.arena_chunk_count,
            dh_arenas: Mutex::new(Vec::new()),
        })
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.dh_dev
    }

    /// Find a memory type allowed by `reqs` that has all of `flags`
    pub fn find_memory_type_index(
        props: &vk::PhysicalDeviceMemoryProperties,
        reqs: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        // for each memory type
        for (i, mem_type) in props
            .memory_types
            .iter()
            .take(props.memory_type_count as usize)
            .enumerate()
        {
            // Bit i of memoryBitTypes will be set if the resource supports
            // the ith memory type in props.
            if (reqs.memory_type_bits >> i) & 1 == 1 && mem_type.property_flags.contains(flags) {
                return Some(i as u32);
            }
        }
        None
    }

    /// Reserve memory satisfying `reqs` with the given properties
    ///
    /// Grows the heap by one arena if no existing arena of the selected
    /// type has room. Requests bigger than an arena get a dedicated arena
    /// rounded up to a power of two number of chunks.
    pub fn allocate_memory(
        &self,
        reqs: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<Allocation> {
        debug_assert!(reqs.size > 0, "zero sized device allocation");
        if reqs.size == 0 {
            return Err(StrataError::INVALID);
        }

        let memory_type = Self::find_memory_type_index(&self.dh_mem_props, reqs, flags)
            .ok_or(StrataError::NO_COMPATIBLE_MEMORY_TYPE)?;

        // With a power of two chunk size buddy blocks are aligned to their
        // own size, so reserving at least `alignment` bytes satisfies the
        // alignment
        let size = reqs.size.max(reqs.alignment);

        let mut arenas = self.dh_arenas.lock().unwrap();

        for (i, slot) in arenas.iter_mut().enumerate() {
            if let Some(ha) = slot {
                if ha.ha_memory_type != memory_type {
                    continue;
                }
                if let Some(offset) = ha.ha_arena.allocate(size) {
                    ha.ha_live += 1;
                    return Ok(Allocation {
                        al_arena: i,
                        al_memory_type: memory_type,
                        al_memory: ha.ha_memory,
                        al_offset: offset,
                        al_size: size,
                    });
                }
            }
        }

        // No room anywhere, add a new arena
        let chunks_needed = (size - 1) / self.dh_chunk_size + 1;
        let chunk_count = self
            .dh_chunk_count
            .max(chunks_needed.checked_next_power_of_two().ok_or(
                StrataError::ALLOCATION_TOO_LARGE(size),
            )?);
        let mut arena = MemoryArena::new(self.dh_chunk_size, chunk_count);
        let memory = self.dh_dev.allocate_memory(arena.size(), memory_type)?;
        log::debug!(
            "Adding {} byte arena for memory type {}",
            arena.size(),
            memory_type
        );

        // A fresh arena at least as large as the request always has room
        let offset = arena
            .allocate(size)
            .ok_or(StrataError::ALLOCATION_TOO_LARGE(size))?;
        let new_arena = HeapArena {
            ha_arena: arena,
            ha_memory_type: memory_type,
            ha_memory: memory,
            ha_live: 1,
        };

        // reuse a released slot if there is one
        let index = match arenas.iter().position(|a| a.is_none()) {
            Some(i) => {
                arenas[i] = Some(new_arena);
                i
            }
            None => {
                arenas.push(Some(new_arena));
                arenas.len() - 1
            }
        };

        Ok(Allocation {
            al_arena: index,
            al_memory_type: memory_type,
            al_memory: memory,
            al_offset: offset,
            al_size: size,
        })
    }

    /// Allocate memory for `buffer` and bind it
    pub fn allocate_for_buffer(
        &self,
        buffer: vk::Buffer,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<Allocation> {
        let reqs = self.dh_dev.buffer_memory_requirements(buffer);
        let alloc = self.allocate_memory(&reqs, flags)?;

        if let Err(e) = self
            .dh_dev
            .bind_buffer_memory(buffer, alloc.memory(), alloc.offset())
        {
            self.free_memory(alloc);
            return Err(e);
        }
        Ok(alloc)
    }

    /// Allocate memory for `image` and bind it
    pub fn allocate_for_image(
        &self,
        image: vk::Image,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<Allocation> {
        let reqs = self.dh_dev.image_memory_requirements(image);
        let alloc = self.allocate_memory(&reqs, flags)?;

        if let Err(e) = self
            .dh_dev
            .bind_image_memory(image, alloc.memory(), alloc.offset())
        {
            self.free_memory(alloc);
            return Err(e);
        }
        Ok(alloc)
    }

    /// Return an allocation to the arena that produced it
    pub fn free_memory(&self, alloc: Allocation) {
        let mut arenas = self.dh_arenas.lock().unwrap();

        match arenas.get_mut(alloc.al_arena).and_then(|a| a.as_mut()) {
            Some(ha) if ha.ha_memory == alloc.al_memory => {
                ha.ha_arena.free(alloc.al_size, alloc.al_offset);
                ha.ha_live -= 1;
            }
            _ => debug_assert!(false, "allocation does not belong to this heap"),
        }
    }

    /// Write `data` into a host visible allocation
    pub fn write(&self, alloc: &Allocation, offset: u64, data: &[u8]) -> Result<()> {
        if offset + data.len() as u64 > alloc.al_size {
            return Err(StrataError::INVALID);
        }
        self.dh_dev
            .write_memory(alloc.al_memory, alloc.al_offset + offset, data)
    }

    /// Give the memory of every empty arena back to the device
    ///
    /// Returns the number of arenas released.
    pub fn release_unused_arenas(&self) -> usize {
        let mut arenas = self.dh_arenas.lock().unwrap();
        let mut count = 0;

        for slot in arenas.iter_mut() {
            let empty = matches!(slot, Some(ha) if ha.ha_live == 0);
            if empty {
                if let Some(ha) = slot.take() {
                    self.dh_dev.free_memory(ha.ha_memory);
                    count += 1;
                }
            }
        }

        while let Some(None) = arenas.last() {
            arenas.pop();
        }

        count
    }

    pub fn stats(&self) -> HeapStats {
        let arenas = self.dh_arenas.lock().unwrap();

        arenas
            .iter()
            .flatten()
            .fold(HeapStats::default(), |mut stats, ha| {
                stats.arenas += 1;
                stats.bytes_reserved += ha.ha_arena.size();
                stats.bytes_in_use += ha.ha_arena.bytes_in_use();
                stats.live_allocations += ha.ha_live;
                stats
            })
    }
}

impl Drop for DeviceHeap {
    fn drop(&mut self) {
        let arenas = match self.dh_arenas.get_mut() {
            Ok(a) => a,
            Err(poisoned) => poisoned.into_inner(),
        };

        for ha in arenas.drain(..).flatten() {
            if ha.ha_live > 0 {
                log::error!(
                    "Freeing arena of memory type {} with {} live allocations",
                    ha.ha_memory_type,
                    ha.ha_live
                );
            }
            self.dh_dev.free_memory(ha.ha_memory);
        }
    }
}
