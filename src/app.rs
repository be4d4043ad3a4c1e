//! Wiring shared by the binaries: one engine per enabled platform over a
//! single SQLite store.

use crate::config::Config;
use crate::db::SqliteStore;
use crate::engine::{EngineSettings, SyncEngine};
use crate::model::{Action, Namespace, Operand, Platform};
use crate::notify::{FanoutNotifier, LogNotifier, Notifier, WebhookNotifier};
use crate::platform::google::{GoogleAdapter, HttpGoogleTransport};
use crate::platform::microsoft::{HttpMicrosoftTransport, MicrosoftAdapter};
use crate::platform::PlatformAdapter;
use crate::store::{MetadataStore, QueueStore};
use anyhow::{Context, Result};
use std::sync::Arc;

/// Log sink plus the configured webhook, if any.
pub fn notifier(cfg: &Config) -> Arc<dyn Notifier> {
    let mut fanout = FanoutNotifier::new(vec![Arc::new(LogNotifier) as Arc<dyn Notifier>]);
    if let Some(url) = cfg.notify.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
        fanout.push(Arc::new(WebhookNotifier::new(url)));
    }
    Arc::new(fanout)
}

pub struct Engines {
    pub microsoft: Option<SyncEngine<MicrosoftAdapter<HttpMicrosoftTransport>>>,
    pub google: Option<SyncEngine<GoogleAdapter<HttpGoogleTransport>>>,
}

fn engine<A: PlatformAdapter>(
    cfg: &Config,
    adapter: A,
    store: &Arc<SqliteStore>,
    notifier: &Arc<dyn Notifier>,
) -> SyncEngine<A> {
    let queue: Arc<dyn QueueStore> = store.clone();
    let meta: Arc<dyn MetadataStore> = store.clone();
    SyncEngine::new(
        Namespace::new(cfg.app.namespace.clone()),
        Arc::new(adapter),
        queue,
        meta,
        notifier.clone(),
    )
    .with_settings(EngineSettings::from(&cfg.engine))
}

impl Engines {
    pub fn from_config(cfg: &Config, store: Arc<SqliteStore>) -> Result<Self> {
        let notifier = notifier(cfg);
        let microsoft = cfg
            .microsoft()
            .map(|c| MicrosoftAdapter::from_config(c).context("invalid microsoft platform settings"))
            .transpose()?
            .map(|adapter| engine(cfg, adapter, &store, &notifier));
        let google = cfg
            .google()
            .map(|c| GoogleAdapter::from_config(c).context("invalid google platform settings"))
            .transpose()?
            .map(|adapter| engine(cfg, adapter, &store, &notifier));
        Ok(Self { microsoft, google })
    }

    pub fn is_empty(&self) -> bool {
        self.microsoft.is_none() && self.google.is_none()
    }

    /// Platforms with an engine, in pass order.
    pub fn platforms(&self) -> Vec<Platform> {
        let mut out = Vec::new();
        if self.microsoft.is_some() {
            out.push(Platform::Microsoft);
        }
        if self.google.is_some() {
            out.push(Platform::Google);
        }
        out
    }

    pub async fn schedule(&self, operand: Operand, action: Action) -> Result<()> {
        if let Some(engine) = &self.microsoft {
            engine.schedule(operand, action).await?;
        }
        if let Some(engine) = &self.google {
            engine.schedule(operand, action).await?;
        }
        Ok(())
    }

    pub async fn schedule_all(&self) -> Result<()> {
        if let Some(engine) = &self.microsoft {
            engine.schedule_all().await?;
        }
        if let Some(engine) = &self.google {
            engine.schedule_all().await?;
        }
        Ok(())
    }

    pub async fn check(&self) -> Result<()> {
        if let Some(engine) = &self.microsoft {
            engine.check_batch_job_result().await?;
        }
        if let Some(engine) = &self.google {
            engine.check_batch_job_result().await?;
        }
        Ok(())
    }
}
