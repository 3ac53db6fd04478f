//! Built-in Step Kinds
//!
//! Registered by [`StepRegistry::with_builtins`](crate::execution::StepRegistry::with_builtins):
//!
//! - [`input`]: entry-point data (`input`)
//! - [`output`]: labelled terminal node (`output`)
//! - [`trigger`]: external payload normalization (`trigger`)
//! - [`merge`]: multi-dependency fan-in (`merge`)
//! - [`subflow`]: nested workflow execution (`subflow`)
//! - [`approval`]: human-in-the-loop pause point (`human_approval`)

pub mod approval;
pub mod input;
pub mod merge;
pub mod output;
pub mod subflow;
pub mod trigger;

pub use approval::HumanApprovalStep;
pub use input::InputStep;
pub use merge::MergeStep;
pub use output::OutputStep;
pub use subflow::SubflowStep;
pub use trigger::TriggerStep;
