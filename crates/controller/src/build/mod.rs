//! Source-to-image build: Job construction, log relay and completion wait

pub mod completion;
pub mod job;
pub mod relay;

pub use completion::CompletionWaiter;
pub use job::{BuildJobSpec, BuildRunner, BuildStage, SubmittedBuild};
pub use relay::{stage_status, LogRelay, RelayEvent};
