//! Per-partition indexing: definitions, repositories, event logs, drain
//! workers, flush tracking and the registry tying them together.

pub mod analyzers;
pub mod definition;
pub mod drain;
pub mod event_log;
pub mod flush;
pub mod journal;
pub mod registry;
pub mod repository;

pub use definition::{FieldSpec, IndexDefinition, IndexSchema};
pub use flush::{FlushCoordinator, FlushState};
pub use registry::{IndexEntry, IndexId, IndexRegistry, PartitionSlot};
pub use repository::{IndexRepository, LocalHits};
