pub mod distill;
pub mod document;
pub mod error;
pub mod maintenance;
pub mod pending;
pub mod review;
pub mod schema;
pub mod similarity;
pub mod store;
pub mod triage;

pub use document::{CanonicalDocument, DailyLog, LogOutcome, append_to_section, replace_atomic};
pub use error::StoreError;
pub use maintenance::{MaintenanceReport, StoreMaintainer};
pub use pending::PendingStore;
pub use review::{Checklist, ChecklistMark, ReviewOutcome, reconcile};
pub use schema::{Observation, ObserverOutput, Proposal, ProposalId, Section, Segment};
pub use store::{
    MemoryVectorStore, ObservationFilter, ObservationPoint, PayloadPatch, VectorStore,
    record_recall,
};
pub use triage::{TriageAction, TriageDecision, TriageParams, triage};
