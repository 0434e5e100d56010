//! Job selection: which waiting job should the next `start_job` claim?
//!
//! Pure functions over job snapshots. The store reads the waiting and started
//! sets inside its claim transaction and hands them here.
//!
//! A waiting job is eligible unless
//! - another job with the same unicity key is already started, or
//! - its namespace already holds `max_jobs_per_namespace` started jobs.
//!
//! Eligible jobs are ranked ascending by
//! 1. started jobs on the same dataset,
//! 2. started jobs in the same namespace,
//! 3. creation order.

use std::collections::{HashMap, HashSet};

use crate::types::Job;

type UnicityKey<'a> = (&'a str, &'a str, Option<&'a str>, Option<&'a str>);

fn unicity_key(job: &Job) -> UnicityKey<'_> {
    (
        job.job_type.as_str(),
        job.params.dataset.as_str(),
        job.params.config.as_deref(),
        job.params.split.as_deref(),
    )
}

/// Occupancy derived from the set of started jobs.
#[derive(Debug, Default)]
pub struct StartedLoad<'a> {
    keys: HashSet<UnicityKey<'a>>,
    per_dataset: HashMap<&'a str, usize>,
    per_namespace: HashMap<&'a str, usize>,
}

impl<'a> StartedLoad<'a> {
    pub fn new(started: &'a [Job]) -> Self {
        let mut load = Self::default();
        for job in started {
            load.keys.insert(unicity_key(job));
            *load.per_dataset.entry(job.params.dataset.as_str()).or_default() += 1;
            *load.per_namespace.entry(job.namespace()).or_default() += 1;
        }
        load
    }

    pub fn dataset_count(&self, dataset: &str) -> usize {
        self.per_dataset.get(dataset).copied().unwrap_or(0)
    }

    pub fn namespace_count(&self, namespace: &str) -> usize {
        self.per_namespace.get(namespace).copied().unwrap_or(0)
    }

    pub fn is_key_started(&self, job: &Job) -> bool {
        self.keys.contains(&unicity_key(job))
    }
}

/// Normalise the admission limit: `None` and non-positive values mean unlimited.
pub fn namespace_limit(max_jobs_per_namespace: Option<i64>) -> Option<usize> {
    max_jobs_per_namespace
        .filter(|n| *n > 0)
        .and_then(|n| usize::try_from(n).ok())
}

pub fn is_eligible(job: &Job, load: &StartedLoad<'_>, limit: Option<usize>) -> bool {
    if load.is_key_started(job) {
        return false;
    }
    match limit {
        Some(limit) => load.namespace_count(job.namespace()) < limit,
        None => true,
    }
}

/// Pick the next job to start, or `None` when nothing is eligible.
///
/// `waiting` must be in creation order (ties included): among equally
/// ranked jobs the earliest one in the slice wins.
pub fn select_next<'w>(
    waiting: &'w [Job],
    started: &[Job],
    max_jobs_per_namespace: Option<i64>,
) -> Option<&'w Job> {
    let load = StartedLoad::new(started);
    let limit = namespace_limit(max_jobs_per_namespace);

    waiting
        .iter()
        .filter(|job| is_eligible(job, &load, limit))
        .min_by_key(|job| {
            (
                load.dataset_count(&job.params.dataset),
                load.namespace_count(job.namespace()),
                job.created_at,
            )
        })
}
