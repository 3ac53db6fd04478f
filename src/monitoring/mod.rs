//! Execution Monitoring
//!
//! - [`ExecutionTimeline`]: per-step start/end timing for reports and Gantt charts

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
