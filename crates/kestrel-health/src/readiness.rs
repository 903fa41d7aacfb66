//! Readiness assessment of a single workload status.
//!
//! A workload has converged when the controller has observed the latest
//! generation, every desired replica runs the new template and is
//! available, and the `Available` condition is true. A `Progressing`
//! condition of `False` is an explicit failure and ends verification early.

use kestrel_core::{ConditionStatus, WorkloadStatus};

/// Verdict on one observed status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Converged.
    Ready,
    /// Not converged yet; keep polling.
    Progressing { reason: String },
    /// The control plane gave up on the rollout.
    Stalled { reason: String },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Assess a workload status.
pub fn assess(status: &WorkloadStatus) -> Readiness {
    if let Some(progressing) = status.condition("Progressing") {
        if progressing.status == ConditionStatus::False {
            let reason = progressing
                .reason
                .clone()
                .or_else(|| progressing.message.clone())
                .unwrap_or_else(|| "Progressing condition is False".to_string());
            return Readiness::Stalled { reason };
        }
    }

    if status.observed_generation < status.generation {
        return Readiness::Progressing {
            reason: format!(
                "waiting for generation {} to be observed (observed {})",
                status.generation, status.observed_generation
            ),
        };
    }

    let desired = status.desired_replicas;
    if status.updated_replicas < desired {
        return Readiness::Progressing {
            reason: format!("{} of {desired} replicas updated", status.updated_replicas),
        };
    }
    if status.available_replicas != desired {
        return Readiness::Progressing {
            reason: format!(
                "{} of {desired} replicas available",
                status.available_replicas
            ),
        };
    }

    match status.condition("Available").map(|c| c.status) {
        Some(ConditionStatus::True) => Readiness::Ready,
        Some(_) => Readiness::Progressing {
            reason: "Available condition is not True".to_string(),
        },
        None => Readiness::Progressing {
            reason: "Available condition not reported".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::Condition;

    fn ready_status() -> WorkloadStatus {
        WorkloadStatus {
            desired_replicas: 3,
            available_replicas: 3,
            updated_replicas: 3,
            generation: 2,
            observed_generation: 2,
            image: Some("repo/api:v2".to_string()),
            conditions: vec![
                Condition::new("Available", ConditionStatus::True),
                Condition::new("Progressing", ConditionStatus::True),
            ],
        }
    }

    #[test]
    fn converged_is_ready() {
        assert_eq!(assess(&ready_status()), Readiness::Ready);
    }

    #[test]
    fn available_condition_false_is_not_ready() {
        let mut status = ready_status();
        status.conditions[0] = Condition::new("Available", ConditionStatus::False);
        assert!(!assess(&status).is_ready());
    }

    #[test]
    fn missing_available_condition_is_not_ready() {
        let mut status = ready_status();
        status.conditions.remove(0);
        assert!(!assess(&status).is_ready());
    }

    #[test]
    fn replica_mismatch_is_progressing() {
        let mut status = ready_status();
        status.available_replicas = 2;
        assert_eq!(
            assess(&status),
            Readiness::Progressing {
                reason: "2 of 3 replicas available".to_string()
            }
        );
    }

    #[test]
    fn old_replicas_do_not_count() {
        let mut status = ready_status();
        status.updated_replicas = 1;
        assert!(matches!(assess(&status), Readiness::Progressing { .. }));
    }

    #[test]
    fn unobserved_generation_is_progressing() {
        let mut status = ready_status();
        status.generation = 3;
        assert!(matches!(assess(&status), Readiness::Progressing { .. }));
    }

    #[test]
    fn progress_deadline_is_stalled() {
        let mut status = ready_status();
        status.conditions[1] = Condition::new("Progressing", ConditionStatus::False)
            .with_reason("ProgressDeadlineExceeded");
        assert_eq!(
            assess(&status),
            Readiness::Stalled {
                reason: "ProgressDeadlineExceeded".to_string()
            }
        );
    }

    #[test]
    fn scaled_to_zero_is_ready() {
        let mut status = ready_status();
        status.desired_replicas = 0;
        status.available_replicas = 0;
        status.updated_replicas = 0;
        assert!(assess(&status).is_ready());
    }
}
