//! Stage execution: dispatch, state, validation and the controller

pub mod cancel;
pub mod collaborators;
pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod machine;
pub mod subprocess;
pub mod validation;

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use collaborators::{
    ArtifactBuilder, LaunchSpec, ModelTrainer, ServiceHandle, ServiceLauncher, SuiteReport,
    ValidationHarness,
};
pub use dispatcher::{Conclusion, StageDispatcher, StageInvocation, StageLease, UpstreamEvent};
pub use engine::{
    Collaborators, ControllerSettings, LeaseSettings, PipelineController, StageOutcome,
};
pub use events::{ControllerEvent, EventBus, EventHandler};
pub use machine::{CancelRequest, PipelineStateMachine, DEFAULT_LEASE_TIMEOUT};
pub use subprocess::ShellCollaborators;
pub use validation::{wait_until_ready, ValidationRunner, ValidationSettings};
