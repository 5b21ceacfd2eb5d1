//! Frame storage and partial-refresh diffing for the slate broker.
//!
//! Responsibilities:
//! - content-addressed storage of rendered frames, keyed by instance
//! - deduplication of identical renders (retry storms collapse to one row)
//! - computing minimal rectangular deltas between two framebuffers for
//!   devices that support partial refresh

mod diff;
mod store;

pub use diff::{diff_buffers, FrameDelta, Region, RefreshPlan};
pub use store::{content_hash, Frame, FrameStore, PutResult};
