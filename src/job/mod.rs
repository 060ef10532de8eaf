mod model;
mod state;

pub use model::{
    AuditRecord, CANCELLED_BY_USER, ControlFlags, Delays, Job, JobKind, JobStatus, MessageBlock,
    Progress, Target, VerificationResult, local_job_id,
};
pub use state::{StateMachine, Transition};
