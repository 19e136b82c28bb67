// Buddy allocator over one device memory block
//
// The block is split into `chunk_count` leaf chunks of `chunk_size`
// bytes. Allocations are rounded up to a power of two number of chunks
// and placed by walking a binary tree of block states. Freeing a block
// merges it with its buddy all the way up while the buddy is free.

/// Default bytes per leaf chunk
pub const GPU_MEMORY_CHUNK_SIZE: u64 = 65536;
/// Default number of leaf chunks per arena (16MB arenas)
pub const GPU_MEMORY_ARENA_CHUNK_COUNT: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Available,
    /// Some block below this node is in use
    Split,
    Allocated,
}

/// Smallest power `p` such that `2^p >= n`
fn near_pow(n: u64) -> u32 {
    n.next_power_of_two().trailing_zeros()
}

/// A buddy allocated region of `chunk_size * chunk_count` bytes.
///
/// The arena only tracks offsets, the memory itself is owned by the
/// DeviceHeap. Node `i` of the tree has children `2i+1` and `2i+2`, the
/// root covers the whole arena at power `ma_max_power`.
pub struct MemoryArena {
    ma_chunk_size: u64,
    ma_max_power: u32,
    ma_tree: Vec<ChunkState>,
    /// bytes reserved by live allocations, after rounding
    ma_in_use: u64,
}

impl MemoryArena {
    /// Create an empty arena
    ///
    /// `chunk_count` must be a power of two.
    pub fn new(chunk_size: u64, chunk_count: u64) -> Self {
        assert!(chunk_size > 0);
        assert!(chunk_count.is_power_of_two());

        Self {
            ma_chunk_size: chunk_size,
            ma_max_power: chunk_count.trailing_zeros(),
            ma_tree: vec![ChunkState::Available; 2 * chunk_count as usize - 1],
            ma_in_use: 0,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.ma_chunk_size
    }

    pub fn chunk_count(&self) -> u64 {
        1 << self.ma_max_power
    }

    /// Total bytes managed by this arena
    pub fn size(&self) -> u64 {
        self.ma_chunk_size << self.ma_max_power
    }

    /// Bytes currently reserved, including power of two rounding
    pub fn bytes_in_use(&self) -> u64 {
        self.ma_in_use
    }

    /// True if nothing is allocated and the root has been merged back
    pub fn is_empty(&self) -> bool {
        self.ma_tree[0] == ChunkState::Available
    }

    /// Power of two (in chunks) a request of `size` bytes rounds up to
    fn power_for(&self, size: u64) -> u32 {
        let chunks = (size - 1) / self.ma_chunk_size + 1;
        near_pow(chunks)
    }

    /// Number of bytes an allocation of `size` actually reserves
    pub fn block_size(&self, size: u64) -> u64 {
        self.ma_chunk_size << self.power_for(size.max(1))
    }

    /// Tree index of the block of power `pow` containing `chunk`
    fn tree_index(&self, chunk: u64, pow: u32) -> usize {
        (((chunk + (1 << self.ma_max_power)) >> pow) - 1) as usize
    }

    /// First chunk of the block at tree `index`, which has power `pow`
    fn chunk_offset(&self, index: usize, pow: u32) -> u64 {
        ((index as u64 + 1) << pow) - (1 << self.ma_max_power)
    }

    /// Reserve a block of at least `size` bytes
    ///
    /// Returns the byte offset of the block inside the arena, or None if
    /// no free block of the needed power exists. Placement is first fit,
    /// always trying the left child first.
    pub fn allocate(&mut self, size: u64) -> Option<u64> {
        debug_assert!(size > 0, "zero sized arena allocation");
        if size == 0 {
            return None;
        }

        let pow = self.power_for(size);
        if pow > self.ma_max_power {
            return None;
        }

        let index = self.find_free_block(0, self.ma_max_power, pow)?;
        self.ma_in_use += self.ma_chunk_size << pow;

        Some(self.chunk_offset(index, pow) * self.ma_chunk_size)
    }

    fn find_free_block(&mut self, index: usize, cur_pow: u32, pow: u32) -> Option<usize> {
        match self.ma_tree[index] {
            ChunkState::Allocated => return None,
            ChunkState::Available if cur_pow == pow => {
                self.ma_tree[index] = ChunkState::Allocated;
                return Some(index);
            }
            // something below this node is in use
            ChunkState::Split if cur_pow == pow => return None,
            _ => {}
        }

        self.ma_tree[index] = ChunkState::Split;
        let left = 2 * index + 1;

        self.find_free_block(left, cur_pow - 1, pow)
            .or_else(|| self.find_free_block(left + 1, cur_pow - 1, pow))
    }

    /// Release the block of `size` bytes at byte `offset`
    ///
    /// `size` must be the size passed to the matching `allocate`.
    pub fn free(&mut self, size: u64, offset: u64) {
        debug_assert!(size > 0, "zero sized arena free");
        debug_assert!(offset % self.ma_chunk_size == 0);
        if size == 0 || offset >= self.size() {
            return;
        }

        let pow = self.power_for(size);
        let chunk = offset / self.ma_chunk_size;
        if pow > self.ma_max_power
            || self.ma_tree[self.tree_index(chunk, pow)] != ChunkState::Allocated
        {
            debug_assert!(false, "double free of arena block at offset {}", offset);
            return;
        }
        self.ma_in_use -= self.ma_chunk_size << pow;

        // Walk upwards merging with our buddy while it is free
        for level in pow..=self.ma_max_power {
            let index = self.tree_index(chunk, level);
            self.ma_tree[index] = ChunkState::Available;

            if level == self.ma_max_power {
                break;
            }

            let buddy = self.tree_index(chunk ^ (1 << level), level);
            if self.ma_tree[buddy] != ChunkState::Available {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KB: u64 = 1024;

    /// Tiny deterministic generator so the fuzz style tests are repeatable
    struct Lcg(u64);
    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            self.0 >> 33
        }
    }

    #[test]
    fn near_pow_rounds_up() {
        assert_eq!(near_pow(1), 0);
        assert_eq!(near_pow(2), 1);
        assert_eq!(near_pow(3), 2);
        assert_eq!(near_pow(4), 2);
        assert_eq!(near_pow(5), 3);
        assert_eq!(near_pow(256), 8);
    }

    #[test]
    fn power_rounding() {
        let mut arena = MemoryArena::new(64 * KB, 256);

        // 65KB needs two chunks, and two is already a power of two
        assert_eq!(arena.block_size(65 * KB), 128 * KB);
        // three chunks round up to four
        assert_eq!(arena.block_size(129 * KB), 256 * KB);
        assert_eq!(arena.block_size(1), 64 * KB);

        arena.allocate(65 * KB).unwrap();
        assert_eq!(arena.bytes_in_use(), 128 * KB);
    }

    #[test]
    fn first_fit_is_leftmost() {
        let mut arena = MemoryArena::new(64 * KB, 8);

        assert_eq!(arena.allocate(1), Some(0));
        assert_eq!(arena.allocate(1), Some(64 * KB));
        // a two chunk block can't go in the first pair, which is full
        assert_eq!(arena.allocate(128 * KB), Some(128 * KB));
        assert_eq!(arena.allocate(256 * KB), Some(256 * KB));
        // everything is now in use
        assert_eq!(arena.allocate(1), None);
    }

    #[test]
    fn oversize_fails_locally() {
        let mut arena = MemoryArena::new(64 * KB, 4);

        assert_eq!(arena.allocate(256 * KB + 1), None);
        assert!(arena.allocate(256 * KB).is_some());
        assert_eq!(arena.allocate(1), None);
    }

    #[test]
    fn free_merges_buddies() {
        let mut arena = MemoryArena::new(64 * KB, 4);

        let a = arena.allocate(1).unwrap();
        let b = arena.allocate(1).unwrap();
        let c = arena.allocate(128 * KB).unwrap();

        // Freeing one half of a pair must not merge it yet
        arena.free(1, a);
        assert!(!arena.is_empty());
        assert_eq!(arena.allocate(128 * KB), None);

        arena.free(1, b);
        // Now the first pair has merged and a two chunk block fits again
        let d = arena.allocate(128 * KB).unwrap();
        assert_eq!(d, 0);

        arena.free(128 * KB, c);
        arena.free(128 * KB, d);
        assert!(arena.is_empty());
        assert_eq!(arena.bytes_in_use(), 0);
        assert_eq!(arena.allocate(256 * KB), Some(0));
    }

    #[test]
    fn tiling_then_freeing_in_any_order_coalesces() {
        // sizes in chunks that exactly tile a 16 chunk arena
        let tiles = [8, 4, 2, 1, 1];

        for seed in 0..32 {
            let mut rng = Lcg(seed);
            let mut arena = MemoryArena::new(KB, 16);

            let mut live: Vec<(u64, u64)> = tiles
                .iter()
                .map(|chunks| {
                    let size = chunks * KB;
                    (size, arena.allocate(size).unwrap())
                })
                .collect();
            assert_eq!(arena.allocate(1), None);

            while !live.is_empty() {
                let i = (rng.next() as usize) % live.len();
                let (size, offset) = live.swap_remove(i);
                arena.free(size, offset);
            }

            assert!(arena.is_empty());
            // the whole arena is one block again
            assert_eq!(arena.allocate(16 * KB), Some(0));
        }
    }

    #[test]
    fn random_sequences_never_overlap() {
        let mut rng = Lcg(0xdecaf);
        let mut arena = MemoryArena::new(KB, 64);
        let mut live: Vec<(u64, u64, u64)> = Vec::new();

        for _ in 0..4000 {
            if live.is_empty() || rng.next() % 3 != 0 {
                let size = rng.next() % (20 * KB) + 1;
                if let Some(offset) = arena.allocate(size) {
                    let end = offset + arena.block_size(size);
                    assert!(end <= arena.size());
                    for &(_, o, e) in live.iter() {
                        assert!(end <= o || offset >= e, "overlapping blocks");
                    }
                    live.push((size, offset, end));
                }
            } else {
                let i = (rng.next() as usize) % live.len();
                let (size, offset, _) = live.swap_remove(i);
                arena.free(size, offset);
            }
        }

        for (size, offset, _) in live.drain(..) {
            arena.free(size, offset);
        }
        assert!(arena.is_empty());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic]
    fn double_free_asserts() {
        let mut arena = MemoryArena::new(KB, 4);
        let a = arena.allocate(KB).unwrap();
        arena.free(KB, a);
        arena.free(KB, a);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic]
    fn zero_size_asserts() {
        let mut arena = MemoryArena::new(KB, 4);
        arena.allocate(0);
    }
}
