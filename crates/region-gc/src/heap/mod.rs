//! The memory layer: regions, the region pool and the allocators built on it.

pub mod card_table;
pub mod humongous;
pub mod nonmovable;
pub mod object_allocator;
pub mod pool;
pub mod region;
pub mod region_allocator;
pub mod rem_set;
pub mod tlab;

pub use card_table::{CardIndex, CardState, CardTable, CARD_SIZE};
pub use humongous::RegionHumongousAllocator;
pub use nonmovable::{Reclaimed, RegionNonmovableAllocator, NONMOVABLE_RESERVE};
pub use object_allocator::{AllocationClass, AllocationKind, G1ObjectAllocator};
pub use pool::{RegionPool, RegionSpace};
pub use region::{region_size_for, Region, RegionFlags, RegionId, SpaceType};
pub use region_allocator::{ObjectStatus, RegionAllocator, RegionKind};
pub use rem_set::RemSet;
pub use tlab::Tlab;
