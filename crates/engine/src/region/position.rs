/// Width (and depth) of a region, in chunks.
pub const REGION_SIZE: i32 = 32;
/// Number of chunks in one region.
pub const REGION_AREA: usize = (REGION_SIZE * REGION_SIZE) as usize;
/// `x >> REGION_SHIFT` is the region coordinate of chunk coordinate `x`.
pub const REGION_SHIFT: u32 = 5;

/// Chunk column position (each chunk is 16x16 blocks horizontally).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkCoord {
    pub x: i32,
    pub z: i32,
}

impl ChunkCoord {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// The region this chunk belongs to. Arithmetic shift, so `-1` lands in region `-1`.
    pub const fn region(&self) -> RegionCoord {
        RegionCoord {
            x: self.x >> REGION_SHIFT,
            z: self.z >> REGION_SHIFT,
        }
    }

    /// Bit index of this chunk inside its region (0..1024).
    pub const fn region_index(&self) -> usize {
        region_index(self.x, self.z)
    }
}

/// Region position (each region is 32x32 chunks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionCoord {
    pub x: i32,
    pub z: i32,
}

impl RegionCoord {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    pub const fn key(&self) -> RegionKey {
        pack(self.x, self.z)
    }
}

/// Region coordinates packed into one integer, used as a map key.
///
/// High 32 bits hold `rx`, low 32 bits hold `rz`, both reinterpreted as unsigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionKey(pub u64);

impl RegionKey {
    pub const fn unpack(self) -> RegionCoord {
        RegionCoord::new((self.0 >> 32) as u32 as i32, self.0 as u32 as i32)
    }
}

/// Pack a region coordinate pair. Collision-free over the whole `i32` range.
#[inline]
pub const fn pack(rx: i32, rz: i32) -> RegionKey {
    RegionKey(((rx as u32 as u64) << 32) | (rz as u32 as u64))
}

/// Row-major (z then x) index of chunk `(x, z)` inside its 32x32 region.
#[inline]
pub const fn region_index(x: i32, z: i32) -> usize {
    let lx = x.rem_euclid(REGION_SIZE) as usize;
    let lz = z.rem_euclid(REGION_SIZE) as usize;
    lz * REGION_SIZE as usize + lx
}
