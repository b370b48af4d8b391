use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flume::Sender;

use crate::backends::{
    AiBackend, BackendRegistry, CompletionBackend, CompletionProvider, OpenAiClient,
    ThreadBackend, ThreadProvider,
};
use crate::config::EngineConfig;
use crate::database::AssistantDatabase;
use crate::events::{EngineEvent, EventSink};
use crate::orchestrator::Orchestrator;

pub struct EngineRuntime {
    pub config: EngineConfig,
    pub database: Arc<AssistantDatabase>,
    pub orchestrator: Arc<Orchestrator>,
}

pub struct EngineRuntimeBuilder {
    config: EngineConfig,
    event_tx: Option<Sender<EngineEvent>>,
    database: Option<Arc<AssistantDatabase>>,
    completion_provider: Option<Arc<dyn CompletionProvider>>,
    thread_provider: Option<Arc<dyn ThreadProvider>>,
}

impl EngineRuntimeBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            event_tx: None,
            database: None,
            completion_provider: None,
            thread_provider: None,
        }
    }

    pub fn with_events(mut self, event_tx: Sender<EngineEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn with_database(mut self, database: Arc<AssistantDatabase>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_completion_provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.completion_provider = Some(provider);
        self
    }

    pub fn with_thread_provider(mut self, provider: Arc<dyn ThreadProvider>) -> Self {
        self.thread_provider = Some(provider);
        self
    }

    pub fn build(self) -> Result<EngineRuntime> {
        let config = self.config;

        let database = match self.database {
            Some(db) => db,
            None => Arc::new(
                AssistantDatabase::new(&config.database_path)
                    .with_context(|| format!("Failed to open database {}", config.database_path))?,
            ),
        };

        let needs_http = (config.enable_completion_backend && self.completion_provider.is_none())
            || (config.enable_thread_backend && self.thread_provider.is_none());
        let http_client = if needs_http {
            tracing::info!("Using OpenAI-compatible provider at {}", config.llm_api_url);
            Some(Arc::new(OpenAiClient::new(
                &config.llm_api_url,
                config.llm_api_key.clone(),
                Duration::from_secs(config.request_timeout_secs),
            )?))
        } else {
            None
        };

        let mut registry = BackendRegistry::new();
        if config.enable_completion_backend {
            let provider = match (self.completion_provider, &http_client) {
                (Some(provider), _) => Some(provider),
                (None, Some(client)) => Some(client.clone() as Arc<dyn CompletionProvider>),
                (None, None) => None,
            };
            if let Some(provider) = provider {
                registry.register(AiBackend::Completion(CompletionBackend::new(
                    provider,
                    &config.default_model,
                    config.max_output_tokens,
                )));
            }
        }
        if config.enable_thread_backend {
            let provider = match (self.thread_provider, &http_client) {
                (Some(provider), _) => Some(provider),
                (None, Some(client)) => Some(client.clone() as Arc<dyn ThreadProvider>),
                (None, None) => None,
            };
            if let Some(provider) = provider {
                registry.register(AiBackend::Thread(ThreadBackend::new(
                    provider,
                    config.thread.clone(),
                )));
            }
        }
        tracing::info!("Backends available: {:?}", registry.kinds());

        let events = match self.event_tx {
            Some(tx) => EventSink::new(tx),
            None => EventSink::disabled(),
        };
        let orchestrator =
            Arc::new(Orchestrator::new(database.clone(), registry, &config).with_events(events));

        Ok(EngineRuntime {
            config,
            database,
            orchestrator,
        })
    }
}

impl EngineRuntime {
    pub fn bootstrap(config: EngineConfig) -> Result<Self> {
        EngineRuntimeBuilder::new(config).build()
    }
}
