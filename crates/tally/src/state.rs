//! Application state and shared resources.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::{AppConfig, StoreBackend};
use crate::dataset::DatasetManager;
use crate::sink::{self, ExternalSink};
use crate::store::{CommitmentStore, MemoryStore, RedisStore};
use crate::tasks::{ExportPipeline, SolutionsTask, TaskCoordinator};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: AppConfig,

    /// Primary commitment store
    pub store: Arc<dyn CommitmentStore>,

    /// Single-flight task runner shared by every task
    pub coordinator: Arc<TaskCoordinator>,

    /// Export pipeline, absent when no external sink is configured
    pub export: Option<Arc<ExportPipeline>>,

    /// Solution recalculation
    pub solutions: Arc<SolutionsTask>,

    /// Dataset ingestion
    pub datasets: Arc<DatasetManager>,
}

impl AppState {
    /// Create new application state, connecting the store and sink
    pub async fn new(config: AppConfig) -> Result<Self> {
        let store: Arc<dyn CommitmentStore> = match config.store {
            StoreBackend::Redis => Arc::new(
                RedisStore::connect(&config.redis_url)
                    .await
                    .context("Failed to connect to Redis")?,
            ),
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory store, records are lost on exit");
                Arc::new(MemoryStore::new())
            }
        };

        let sink: Option<Arc<dyn ExternalSink>> = match &config.external_sink_uri {
            Some(uri) => Some(Arc::from(
                sink::connect(uri)
                    .await
                    .context("Failed to connect to external sink")?,
            )),
            None => None,
        };

        Ok(Self::with_parts(config, store, sink))
    }

    /// Wire the tasks around an existing store and sink
    pub fn with_parts(
        config: AppConfig,
        store: Arc<dyn CommitmentStore>,
        sink: Option<Arc<dyn ExternalSink>>,
    ) -> Self {
        let coordinator = Arc::new(
            TaskCoordinator::new(store.clone()).with_stale_after(config.tasks.stale_after_secs),
        );

        let export = sink.map(|sink| {
            Arc::new(ExportPipeline::new(
                coordinator.clone(),
                store.clone(),
                sink,
            ))
        });
        let solutions = Arc::new(SolutionsTask::new(
            coordinator.clone(),
            store.clone(),
            config.captcha_solutions.clone(),
        ));
        let datasets = Arc::new(DatasetManager::new(store.clone(), config.captchas.clone()));

        Self {
            config,
            store,
            coordinator,
            export,
            solutions,
            datasets,
        }
    }
}
