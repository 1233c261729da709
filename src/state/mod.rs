//! State module for tracking crawl and job progress
//!
//! # Components
//!
//! - `JobState`: the forward-only state machine of a supervised job
//! - `HostState`: per-host token bucket and crawl-delay bookkeeping

mod host_state;
mod job_state;

pub use host_state::HostState;
pub use job_state::JobState;
