pub mod outbox_message;
pub mod run_step;
pub mod states;
pub mod step_attempt;
pub mod workflow_definition;
pub mod workflow_run;

pub use outbox_message::OutboxMessage;
pub use run_step::RunStep;
pub use states::{
    AttemptOutcome, AttemptType, CompensationStatus, OutboxStatus, RunStatus, StepStatus,
};
pub use step_attempt::StepAttempt;
pub use workflow_definition::{
    HttpRequestSpec, IdempotencyScope, OnFailure, RetryPolicy, StepDefinition,
    WorkflowDefinition, WorkflowSpec,
};
pub use workflow_run::WorkflowRun;
