//! Tape layout: segment maps, partitions and cartridges

pub mod cartridge;
pub mod partition;
pub mod segment;

pub use cartridge::{CartridgeId, CartridgeRegistry, CartridgeState, FormatVersion, TapeCartridge};
pub use partition::{FirstMetaSegmentExclusion, NoExclusion, SegmentExclusion, TapePartition};
pub use segment::{SegmentKind, TapeSegmentEntry, TapeSegmentMap};
