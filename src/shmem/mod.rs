//! Cross-process shared memory: engine-wide statistics and the slab
//! allocator that serves pooled buffers to every worker process (spec
//! §3 "Shared region layout"/"Slab pool", §4.8).

pub mod region;
pub mod slab;
pub mod spinlock;

pub use region::{EngineData, SharedRegion};
pub use slab::SlabPool;
