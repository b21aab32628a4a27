pub mod agents;
pub mod build;
pub mod confirm;
pub mod decision;
pub mod diff;
pub mod fsops;
pub mod gitops;
pub mod javasrc;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod session;
pub mod streaming;

pub use confirm::{ConfirmationChannel, ConfirmationKind, ConfirmationPayload};
pub use pipeline::{Pipeline, PipelineDeps};
pub use progress::{ProgressBus, ProgressEvent};
pub use session::{
    generate_session_id, ExecutionMode, PipelineStage, PipelineStatus, SessionHandle,
    SessionState, SessionStore, StatusSnapshot,
};
