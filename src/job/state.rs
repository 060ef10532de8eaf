use chrono::Utc;

use super::model::{CANCELLED_BY_USER, Job, JobStatus};
use crate::error::EngineError;

/// A requested change to a job record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// pending -> running
    Start,
    /// running (or a pending mirror) -> paused
    Pause,
    /// paused -> running
    Resume,
    /// Move `progress.current` forward to the given value.
    Advance(usize),
    /// Change `progress.total`; used when mirroring a remote job.
    Resize(usize),
    Complete,
    Fail(String),
    Cancel,
}

/// Guards every mutation of a job's status and progress.
///
/// - Terminal records are frozen: any transition returns [`EngineError::Frozen`].
/// - Status only moves toward a terminal state, except `running <-> paused`.
/// - `progress.current` never decreases and never exceeds `progress.total`.
pub struct StateMachine;

impl StateMachine {
    /// Whether the status graph allows `from -> to`.
    pub fn allows(from: JobStatus, to: JobStatus) -> bool {
        use JobStatus::*;
        match (from, to) {
            _ if from.is_terminal() => false,
            (_, Completed | Error | Cancelled) => true,
            (Pending, Running | Paused) => true,
            (Running, Paused) | (Paused, Running) => true,
            _ => from == to,
        }
    }

    /// Apply `transition` to `job`, enforcing the lifecycle invariants.
    pub fn apply(job: &mut Job, transition: Transition) -> Result<(), EngineError> {
        if job.status.is_terminal() {
            return Err(EngineError::Frozen {
                id: job.id.clone(),
                status: job.status,
            });
        }

        match transition {
            Transition::Start => Self::move_to(job, JobStatus::Running)?,
            Transition::Pause => Self::move_to(job, JobStatus::Paused)?,
            Transition::Resume => {
                if job.status != JobStatus::Paused {
                    return Err(Self::illegal(job, JobStatus::Running));
                }
                job.status = JobStatus::Running;
            }
            Transition::Advance(current) => {
                if current < job.progress.current || current > job.progress.total {
                    return Err(EngineError::IllegalProgress {
                        id: job.id.clone(),
                        from: job.progress.current,
                        to: current,
                        total: job.progress.total,
                    });
                }
                job.progress.current = current;
            }
            Transition::Resize(total) => {
                if total < job.progress.current {
                    return Err(EngineError::IllegalProgress {
                        id: job.id.clone(),
                        from: job.progress.current,
                        to: job.progress.current,
                        total,
                    });
                }
                job.progress.total = total;
            }
            Transition::Complete => {
                Self::move_to(job, JobStatus::Completed)?;
                job.progress.current = job.progress.total;
                job.error = None;
                job.control = Default::default();
            }
            Transition::Fail(reason) => {
                Self::move_to(job, JobStatus::Error)?;
                job.error = Some(reason);
                job.control = Default::default();
            }
            Transition::Cancel => {
                Self::move_to(job, JobStatus::Cancelled)?;
                job.error = Some(CANCELLED_BY_USER.to_string());
                job.control = Default::default();
            }
        }

        job.updated_at = Utc::now();
        Ok(())
    }

    fn move_to(job: &mut Job, to: JobStatus) -> Result<(), EngineError> {
        if !Self::allows(job.status, to) {
            return Err(Self::illegal(job, to));
        }
        job.status = to;
        Ok(())
    }

    fn illegal(job: &Job, to: JobStatus) -> EngineError {
        EngineError::IllegalTransition {
            id: job.id.clone(),
            from: job.status,
            to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Delays, MessageBlock, Target};

    fn make_job(steps: usize) -> Job {
        Job::local(
            "test",
            Target::single("5511000000000", "inst-1"),
            (0..steps).map(|i| MessageBlock::text(format!("block {i}"))).collect(),
            Delays::default(),
        )
    }

    #[test]
    fn happy_path_walks_all_states() {
        let mut job = make_job(2);
        StateMachine::apply(&mut job, Transition::Start).unwrap();
        assert_eq!(job.status, JobStatus::Running);

        StateMachine::apply(&mut job, Transition::Advance(1)).unwrap();
        StateMachine::apply(&mut job, Transition::Advance(2)).unwrap();
        StateMachine::apply(&mut job, Transition::Complete).unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress.current, 2);
        assert!(job.error.is_none());
    }

    #[test]
    fn pause_and_resume_alternate() {
        let mut job = make_job(1);
        StateMachine::apply(&mut job, Transition::Start).unwrap();
        for _ in 0..3 {
            StateMachine::apply(&mut job, Transition::Pause).unwrap();
            assert_eq!(job.status, JobStatus::Paused);
            StateMachine::apply(&mut job, Transition::Resume).unwrap();
            assert_eq!(job.status, JobStatus::Running);
        }
    }

    #[test]
    fn resume_requires_paused() {
        let mut job = make_job(1);
        StateMachine::apply(&mut job, Transition::Start).unwrap();
        let err = StateMachine::apply(&mut job, Transition::Resume).unwrap_err();
        assert!(matches!(err, EngineError::IllegalTransition { .. }));
    }

    #[test]
    fn progress_never_moves_backwards_or_past_total() {
        let mut job = make_job(2);
        StateMachine::apply(&mut job, Transition::Start).unwrap();
        StateMachine::apply(&mut job, Transition::Advance(2)).unwrap();

        let back = StateMachine::apply(&mut job, Transition::Advance(1)).unwrap_err();
        assert!(matches!(back, EngineError::IllegalProgress { from: 2, to: 1, .. }));

        let past = StateMachine::apply(&mut job, Transition::Advance(3)).unwrap_err();
        assert!(matches!(past, EngineError::IllegalProgress { total: 2, .. }));

        let shrink = StateMachine::apply(&mut job, Transition::Resize(1)).unwrap_err();
        assert!(matches!(shrink, EngineError::IllegalProgress { .. }));
    }

    #[test]
    fn terminal_jobs_are_frozen() {
        let mut job = make_job(3);
        StateMachine::apply(&mut job, Transition::Start).unwrap();
        StateMachine::apply(&mut job, Transition::Cancel).unwrap();
        assert_eq!(job.error.as_deref(), Some(CANCELLED_BY_USER));

        for transition in [
            Transition::Advance(1),
            Transition::Resume,
            Transition::Complete,
            Transition::Fail("late".into()),
        ] {
            let err = StateMachine::apply(&mut job, transition).unwrap_err();
            assert!(matches!(err, EngineError::Frozen { status: JobStatus::Cancelled, .. }));
        }
        assert_eq!(job.progress.current, 0);
    }

    #[test]
    fn failure_records_reason_and_clears_flags() {
        let mut job = make_job(3);
        StateMachine::apply(&mut job, Transition::Start).unwrap();
        job.control.pause_requested = true;
        StateMachine::apply(&mut job, Transition::Advance(1)).unwrap();
        StateMachine::apply(&mut job, Transition::Fail("number blocked".into())).unwrap();

        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("number blocked"));
        assert!(!job.control.pause_requested);
        assert_eq!(job.progress.current, 1);
    }

    #[test]
    fn status_graph() {
        use JobStatus::*;
        assert!(StateMachine::allows(Pending, Running));
        assert!(StateMachine::allows(Pending, Paused));
        assert!(StateMachine::allows(Paused, Cancelled));
        assert!(StateMachine::allows(Running, Running));
        assert!(!StateMachine::allows(Running, Pending));
        assert!(!StateMachine::allows(Completed, Running));
        assert!(!StateMachine::allows(Cancelled, Cancelled));
    }
}
