pub mod lock;
pub mod passes;
pub mod prompt;
pub mod tracker;

pub use lock::PassLock;
pub use passes::{Pipeline, ReconcileSummary, TriageSummary};
pub use prompt::{REFLECTION_SYSTEM_PROMPT, build_reflection_prompt};
pub use tracker::TrackerClient;
