use crate::auth::ChannelAuthorizer;
use crate::llm::{LlmConfig, LlmManager};
use crate::opponent::{generate_personas, Persona};
use crate::session::{JsonFileStore, SessionRegistry, StoreResult};
use crate::transport::Hub;
use crate::types::*;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Process-level settings for the server binary
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// JSON file backing the session store; in-memory when unset
    pub session_store_path: Option<PathBuf>,
    /// Close WebSockets that stay silent this long
    pub ws_idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // 6573 is ascii for "AI"
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 6573)),
            session_store_path: None,
            ws_idle_timeout: Duration::from_secs(90),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("BIND_ADDR")
                .ok()
                .and_then(|s| match s.trim().parse() {
                    Ok(addr) => Some(addr),
                    Err(e) => {
                        tracing::warn!("Ignoring invalid BIND_ADDR '{}': {}", s, e);
                        None
                    }
                })
                .unwrap_or(defaults.bind_addr),
            session_store_path: std::env::var("SESSION_STORE_PATH")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            ws_idle_timeout: std::env::var("WS_IDLE_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .filter(|secs: &u64| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.ws_idle_timeout),
        }
    }

    /// Open the configured session store
    pub async fn open_sessions(&self) -> StoreResult<SessionRegistry> {
        match &self.session_store_path {
            Some(path) => {
                let store = JsonFileStore::open(path).await?;
                tracing::info!("Session store at {}", store.path().display());
                Ok(SessionRegistry::new(Arc::new(store)))
            }
            None => {
                tracing::info!("No SESSION_STORE_PATH set, sessions are kept in memory");
                Ok(SessionRegistry::in_memory())
            }
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub sessions: SessionRegistry,
    pub llm: Option<Arc<LlmManager>>,
    pub llm_config: LlmConfig,
    pub rules: GameRules,
    pub config: ServerConfig,
    /// Lobby personas, generated on first request
    personas: Arc<RwLock<Option<Vec<Persona>>>>,
}

impl AppState {
    pub fn new(authorizer: ChannelAuthorizer, sessions: SessionRegistry) -> Self {
        Self {
            hub: Hub::new(authorizer),
            sessions,
            llm: None,
            llm_config: LlmConfig::default(),
            rules: GameRules::default(),
            config: ServerConfig::default(),
            personas: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_llm(mut self, llm: Option<LlmManager>, llm_config: LlmConfig) -> Self {
        self.llm = llm.map(Arc::new);
        self.llm_config = llm_config;
        self
    }

    pub fn with_rules(mut self, rules: GameRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Seed the persona cache, skipping generation
    pub async fn set_personas(&self, personas: Vec<Persona>) {
        *self.personas.write().await = Some(personas);
    }

    /// Personas currently in the lobby, generating them on first use
    pub async fn personas(&self) -> Vec<Persona> {
        if let Some(personas) = self.personas.read().await.as_ref() {
            return personas.clone();
        }

        let mut cache = self.personas.write().await;
        // Another request may have generated them meanwhile
        if let Some(personas) = cache.as_ref() {
            return personas.clone();
        }
        let personas =
            generate_personas(self.llm.as_deref(), self.llm_config.default_timeout).await;
        *cache = Some(personas.clone());
        personas
    }

    pub async fn persona(&self, id: &str) -> Option<Persona> {
        self.personas().await.into_iter().find(|p| p.id == id)
    }

    /// Drop a persona whose session ended
    pub async fn retire_persona(&self, id: &str) -> bool {
        let mut cache = self.personas.write().await;
        match cache.as_mut() {
            Some(personas) => {
                let before = personas.len();
                personas.retain(|p| p.id != id);
                let retired = personas.len() != before;
                if retired {
                    tracing::info!("Persona {} left the lobby", id);
                }
                retired
            }
            None => false,
        }
    }
}
