use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use troubadour_ai::http::{
    HttpAudioAnalyzer, HttpComparisonEnricher, HttpCritiqueGenerator, JsonEndpoint,
    TracingNotificationSink, WebhookNotificationSink,
};
use troubadour_ai::scripted::{ScriptedAudioAnalyzer, ScriptedCritiqueGenerator, ScriptedEnricher};
use troubadour_ai::{
    AudioAnalyzer, ComparisonEnricher, CritiqueGenerator, NotificationSink,
};
use troubadour_infra::catalog::{CatalogStore, InMemoryCatalog, PgCatalogStore};
use troubadour_infra::db;
use troubadour_infra::jobs::{
    Capabilities, InMemoryJobStore, JobStore, JobWorker, PgJobStore, StageContext, StageRegistry,
    WorkerTrigger,
};

use crate::config::AppConfig;

/// What the HTTP handlers need.
#[derive(Clone)]
pub struct AppServices {
    pub jobs: Arc<dyn JobStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub default_max_attempts: u32,
    trigger: Option<WorkerTrigger>,
}

impl AppServices {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        catalog: Arc<dyn CatalogStore>,
        default_max_attempts: u32,
    ) -> Self {
        Self {
            jobs,
            catalog,
            default_max_attempts,
            trigger: None,
        }
    }

    /// Poke the in-process worker on enqueue.
    pub fn with_trigger(mut self, trigger: WorkerTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn wake_worker(&self) {
        if let Some(trigger) = &self.trigger {
            trigger.wake();
        }
    }
}

/// Services plus the (not yet spawned) worker draining the same stores.
pub struct Wiring {
    pub services: AppServices,
    pub worker: JobWorker,
}

/// Wire stores and capabilities from configuration.
pub async fn build_services(config: &AppConfig) -> anyhow::Result<Wiring> {
    let (jobs, catalog): (Arc<dyn JobStore>, Arc<dyn CatalogStore>) =
        if config.use_persistent_stores {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;
            let pool = db::connect(url, config.max_db_connections)
                .await
                .context("failed to connect to Postgres")?;
            db::apply_schema(&pool)
                .await
                .context("failed to apply database schema")?;
            info!("using Postgres stores");
            (
                Arc::new(PgJobStore::new(pool.clone())),
                Arc::new(PgCatalogStore::new(pool)),
            )
        } else {
            info!("using in-memory stores");
            (InMemoryJobStore::arc(), InMemoryCatalog::arc())
        };

    let client = reqwest::Client::builder()
        .timeout(config.worker.capability_timeout)
        .build()
        .context("failed to build HTTP client")?;
    let capabilities = capabilities(config, &client);
    let notifier: Arc<dyn NotificationSink> = match &config.notify_webhook {
        Some(url) => Arc::new(WebhookNotificationSink::new(client, url.clone())),
        None => Arc::new(TracingNotificationSink),
    };

    Ok(wire(config, jobs, catalog, capabilities, notifier))
}

/// Assemble services and worker over explicit stores and capabilities.
pub fn wire(
    config: &AppConfig,
    jobs: Arc<dyn JobStore>,
    catalog: Arc<dyn CatalogStore>,
    capabilities: Capabilities,
    notifier: Arc<dyn NotificationSink>,
) -> Wiring {
    let ctx = StageContext::new(
        jobs.clone(),
        catalog.clone(),
        config.worker.capability_timeout,
    );
    let registry = StageRegistry::standard(ctx, capabilities);
    let worker = JobWorker::new(
        jobs.clone(),
        catalog.clone(),
        registry,
        notifier,
        config.worker.clone(),
    );
    Wiring {
        services: AppServices::new(jobs, catalog, config.worker.default_max_attempts),
        worker,
    }
}

fn endpoint(client: &reqwest::Client, url: &str) -> JsonEndpoint {
    JsonEndpoint::with_client(client.clone(), url)
}

/// HTTP capabilities where an endpoint is configured, scripted ones otherwise.
fn capabilities(config: &AppConfig, client: &reqwest::Client) -> Capabilities {
    let analyzer: Arc<dyn AudioAnalyzer> = match &config.audio_endpoint {
        Some(url) => Arc::new(HttpAudioAnalyzer::new(endpoint(client, url))),
        None => {
            warn!("TROUBADOUR_AUDIO_ENDPOINT not set; using scripted audio analyzer");
            Arc::new(ScriptedAudioAnalyzer::default())
        }
    };
    let critic: Arc<dyn CritiqueGenerator> = match &config.critique_endpoint {
        Some(url) => Arc::new(HttpCritiqueGenerator::new(endpoint(client, url))),
        None => {
            warn!("TROUBADOUR_CRITIQUE_ENDPOINT not set; using scripted critique generator");
            Arc::new(ScriptedCritiqueGenerator::default())
        }
    };
    let enricher: Arc<dyn ComparisonEnricher> = match &config.compare_endpoint {
        Some(url) => Arc::new(HttpComparisonEnricher::new(endpoint(client, url))),
        None => Arc::new(ScriptedEnricher::default()),
    };
    Capabilities {
        analyzer,
        critic,
        enricher,
    }
}

/// Fully in-memory wiring with default scripted capabilities (dev and tests).
pub fn in_memory(config: &AppConfig, catalog: Arc<InMemoryCatalog>) -> Wiring {
    wire(
        config,
        InMemoryJobStore::arc(),
        catalog,
        Capabilities {
            analyzer: Arc::new(ScriptedAudioAnalyzer::default()),
            critic: Arc::new(ScriptedCritiqueGenerator::default()),
            enricher: Arc::new(ScriptedEnricher::default()),
        },
        Arc::new(TracingNotificationSink),
    )
}

/// Time the HTTP layer waits for the worker to settle on shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
