//! Call segment extraction
//!
//! - [`CallMetadataStore`] supplies per-recording onset/offset arrays
//! - [`SegmentExtractor`] converts one call into a padded, bounds-checked
//!   sample range and flags anomalous calls instead of rejecting them

mod extract;
mod metadata;

pub use extract::{compute_segment, ExtractedSegment, Segment, SegmentExtractor};
pub use metadata::{
    CallMetadata, CallMetadataStore, InMemoryCallMetadataStore, JsonCallMetadataStore,
    METADATA_SUFFIX,
};
