//! The sync engine.
//!
//! A schedule pass turns the pending backlog of one (operand, action) pair
//! into submitted batch jobs; a check pass polls due jobs and reconciles their
//! results into the queue store. Both are discrete invocations that return once
//! their bounded amount of work is done. Outcomes are communicated through
//! persisted job and error state plus notifications, never through the return
//! value: `Err` only means the pass could not start.

mod orchestrator;
mod poller;
mod reconcile;

pub use orchestrator::NO_OPERATIONS;
pub use poller::PollOutcome;

use crate::config::EngineConfig;
use crate::model::{Action, Namespace, Operand};
use crate::notify::Notifier;
use crate::platform::PlatformAdapter;
use crate::store::{MetadataStore, QueueStore};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Runtime form of [`EngineConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub submit_delay: Duration,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    pub stuck_attempt_threshold: u32,
    pub max_poll_attempts: u32,
    pub parallel_job_ceiling: usize,
    pub pass_concurrency: usize,
    pub poll_concurrency: usize,
    pub poll_batch_limit: usize,
    pub flush_batch_size: usize,
}

impl From<&EngineConfig> for EngineSettings {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            submit_delay: Duration::from_secs(cfg.submit_delay_secs),
            backoff_base: Duration::from_secs(cfg.backoff_base_secs),
            max_backoff: Duration::from_secs(cfg.max_backoff_secs),
            stuck_attempt_threshold: cfg.stuck_attempt_threshold,
            max_poll_attempts: cfg.max_poll_attempts,
            parallel_job_ceiling: cfg.parallel_job_ceiling.max(1),
            pass_concurrency: cfg.pass_concurrency.max(1),
            poll_concurrency: cfg.poll_concurrency.max(1),
            poll_batch_limit: cfg.poll_batch_limit.max(1),
            flush_batch_size: cfg.flush_batch_size.max(1),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// Split `ids` into consecutive chunks of at most `size`, keeping order.
pub fn chunk_ids(ids: &[i64], size: usize) -> Vec<Vec<i64>> {
    ids.chunks(size.max(1)).map(<[i64]>::to_vec).collect()
}

/// `base × 2^attempts`, capped at `cap`.
pub fn backoff_delay(base: Duration, attempts: u32, cap: Duration) -> Duration {
    2u32.checked_pow(attempts)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(cap, |delay| delay.min(cap))
}

/// `now + delay`; saturates at `now` when the delay does not fit.
pub(crate) fn later(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}

/// Engine bound to one platform adapter and one store namespace.
pub struct SyncEngine<A> {
    namespace: Namespace,
    adapter: Arc<A>,
    queue: Arc<dyn QueueStore>,
    meta: Arc<dyn MetadataStore>,
    notifier: Arc<dyn Notifier>,
    settings: EngineSettings,
}

impl<A: PlatformAdapter> SyncEngine<A> {
    pub fn new(
        namespace: Namespace,
        adapter: Arc<A>,
        queue: Arc<dyn QueueStore>,
        meta: Arc<dyn MetadataStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            namespace,
            adapter,
            queue,
            meta,
            notifier,
            settings: EngineSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub async fn schedule_adds(&self, operand: Operand) -> Result<()> {
        self.schedule(operand, Action::Add).await
    }

    pub async fn schedule_updates(&self, operand: Operand) -> Result<()> {
        self.schedule(operand, Action::Update).await
    }

    pub async fn schedule_deletes(&self, operand: Operand) -> Result<()> {
        self.schedule(operand, Action::Remove).await
    }

    /// Adds parents first, then updates, then removes children first.
    pub async fn schedule_all(&self) -> Result<()> {
        for operand in Operand::ALL {
            self.schedule_adds(operand).await?;
        }
        for operand in Operand::ALL {
            self.schedule_updates(operand).await?;
        }
        for operand in Operand::ALL.into_iter().rev() {
            self.schedule_deletes(operand).await?;
        }
        Ok(())
    }
}
