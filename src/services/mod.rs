pub mod collab_service;
pub mod doc_state_service;
pub mod merge;
pub mod presence_service;

pub use collab_service::CollabService;
pub use doc_state_service::{DocStateService, DocStateStats, FlushReport};
pub use merge::MergeOutcome;
pub use presence_service::{PresenceService, PresenceStats};
