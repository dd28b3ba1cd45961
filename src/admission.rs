//! Admission control: decide whether a submission may enter the queue and
//! whether a queued job may start.
//!
//! The controller is a pure policy over a [`Load`] snapshot. The registry
//! evaluates it while holding its state lock and reserves the slot in the
//! same critical section, so the check and the enqueue are one atomic step.

use std::fmt;

/// Capacity bounds enforced by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    /// Jobs allowed in `Running` at once.
    pub max_concurrent_jobs: usize,
    /// Jobs accepted but not yet started (including uploads being stored).
    pub max_queue_depth: usize,
    /// Queued plus running jobs allowed per client id.
    pub max_jobs_per_client: usize,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            max_queue_depth: 64,
            max_jobs_per_client: 16,
        }
    }
}

/// Current load, as seen by the registry at decision time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Load {
    pub running: usize,
    pub queued: usize,
    /// Active jobs of the submitting client; 0 for anonymous clients.
    pub client_active: usize,
}

/// Why a submission was turned away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    QueueFull { depth: usize, limit: usize },
    ClientLimit { active: usize, limit: usize },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::QueueFull { depth, limit } => {
                write!(f, "queue full ({depth}/{limit} jobs waiting)")
            }
            Rejection::ClientLimit { active, limit } => {
                write!(f, "client has {active} active jobs (limit {limit})")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionController {
    limits: AdmissionLimits,
}

impl AdmissionController {
    pub fn new(limits: AdmissionLimits) -> Self {
        Self { limits }
    }

    /// Decide whether one more job may be queued.
    pub fn admit(&self, load: &Load, identified_client: bool) -> Result<(), Rejection> {
        if load.queued >= self.limits.max_queue_depth {
            return Err(Rejection::QueueFull {
                depth: load.queued,
                limit: self.limits.max_queue_depth,
            });
        }
        if identified_client && load.client_active >= self.limits.max_jobs_per_client {
            return Err(Rejection::ClientLimit {
                active: load.client_active,
                limit: self.limits.max_jobs_per_client,
            });
        }
        Ok(())
    }

    /// Whether a worker may claim another job given `running` in flight.
    pub fn may_start(&self, running: usize) -> bool {
        running < self.limits.max_concurrent_jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(depth: usize, per_client: usize) -> AdmissionController {
        AdmissionController::new(AdmissionLimits {
            max_concurrent_jobs: 2,
            max_queue_depth: depth,
            max_jobs_per_client: per_client,
        })
    }

    #[test]
    fn rejects_when_queue_is_full() {
        let c = controller(2, 10);
        assert!(c.admit(&Load { queued: 1, ..Load::default() }, false).is_ok());
        let err = c
            .admit(&Load { queued: 2, ..Load::default() }, false)
            .unwrap_err();
        assert_eq!(err, Rejection::QueueFull { depth: 2, limit: 2 });
    }

    #[test]
    fn per_client_limit_only_applies_to_identified_clients() {
        let c = controller(100, 1);
        let load = Load {
            client_active: 1,
            ..Load::default()
        };
        assert!(c.admit(&load, false).is_ok());
        assert!(matches!(
            c.admit(&load, true),
            Err(Rejection::ClientLimit { active: 1, limit: 1 })
        ));
    }

    #[test]
    fn running_does_not_count_against_queue_depth() {
        let c = controller(1, 10);
        let load = Load {
            running: 50,
            queued: 0,
            client_active: 0,
        };
        assert!(c.admit(&load, false).is_ok());
    }

    #[test]
    fn may_start_respects_concurrency_bound() {
        let c = controller(10, 10);
        assert!(c.may_start(1));
        assert!(!c.may_start(2));
    }
}
