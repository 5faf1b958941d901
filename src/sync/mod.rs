//! Keeping the device's layout test tree in step with the host.
//!
//! - [`listing`] parses `ls -Rl` output into a [`RemoteFileInventory`].
//! - [`filter`] holds the exclusion predicates shared by both sides of a sync.
//! - [`archive`] packages stale files for a single push.
//! - [`engine`] plans and executes a sync pass.
//!
//! Bulk test files are compared by modification time only. The unpack helper
//! and the runtime package go through [`check_freshness`], which compares sizes
//! and then content hashes.

pub mod archive;
pub mod engine;
pub mod filter;
pub mod listing;

pub use archive::{ARCHIVE_NAME, ArchiveError, build_archive};
pub use engine::{
    DeviceFileSync, EXTRACT_OK_MARKER, Freshness, HostFile, PlannedFile, REMOTE_HELPER_PATH,
    SyncError, SyncPlan, SyncReport, SyncStage, align_device_clock, check_freshness,
    needs_transfer, plan_sync, select_stale,
};
pub use filter::{PathFilter, PrefixFilter, SyncFilter, is_expectation_or_http};
pub use listing::{
    ListingLine, RemoteFileEntry, RemoteFileInventory, parse_listing_line, parse_recursive_listing,
};
