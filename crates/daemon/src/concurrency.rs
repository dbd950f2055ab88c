//! Worker pool sizing.
//!
//! Derives the number of concurrent encoder processes from configuration and
//! the host's logical core count.

use crate::config::Config;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of jobs in `processing` at once. Always at least 1.
    pub max_concurrent_jobs: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration, detecting cores via num_cpus.
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    /// Uses the following rules:
    /// - An explicit non-zero `max_concurrent_jobs` is used as is
    /// - Otherwise 2 jobs for 16+ cores, 1 job below that
    pub fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let max_concurrent_jobs = if cfg.jobs.max_concurrent_jobs > 0 {
            cfg.jobs.max_concurrent_jobs
        } else {
            derive_max_jobs(total_cores)
        };

        Self {
            total_cores,
            max_concurrent_jobs: max_concurrent_jobs.max(1),
        }
    }
}

/// Encoders already thread across cores, so only large hosts run two at once.
fn derive_max_jobs(cores: u32) -> u32 {
    if cores >= 16 {
        2
    } else {
        1
    }
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobsConfig;
    use proptest::prelude::*;

    fn config_with_jobs(max_concurrent_jobs: u32) -> Config {
        Config {
            jobs: JobsConfig {
                max_concurrent_jobs,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_auto_derivation(cores in 1u32..256) {
            let plan = ConcurrencyPlan::derive_with_cores(&config_with_jobs(0), cores);
            let expected = if cores >= 16 { 2 } else { 1 };
            prop_assert_eq!(plan.max_concurrent_jobs, expected);
            prop_assert_eq!(plan.total_cores, cores);
        }

        #[test]
        fn prop_explicit_value_wins(cores in 1u32..256, explicit in 1u32..64) {
            let plan = ConcurrencyPlan::derive_with_cores(&config_with_jobs(explicit), cores);
            prop_assert_eq!(plan.max_concurrent_jobs, explicit);
        }
    }

    #[test]
    fn test_plan_never_zero() {
        let plan = ConcurrencyPlan::derive_with_cores(&config_with_jobs(0), 0);
        assert_eq!(plan.max_concurrent_jobs, 1);
    }

    #[test]
    fn test_derive_plan_uses_host_cores() {
        let plan = derive_plan(&config_with_jobs(0));
        assert!(plan.total_cores >= 1);
        assert!(plan.max_concurrent_jobs >= 1);
    }
}
