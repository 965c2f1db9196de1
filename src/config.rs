//! Configuração do jobgate carregada a partir de `jobgate.toml`.
//!
//! A struct [`JobgateConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults.
//! As variáveis `JOBGATE_SECRET_KEY`, `JOBGATE_ORCHESTRATOR_TOKEN` e `PORT`
//! têm precedência sobre o arquivo.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::JobgateError;
use crate::links::DEFAULT_LINK_MAX_AGE;
use crate::store::{Limits, QueueId, QueuePolicy};

pub const DEFAULT_CONFIG_PATH: &str = "jobgate.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct JobgateConfig {
    /// Segundos entre ciclos de reconciliação.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Segredo compartilhado usado para verificar as assinaturas dos webhooks.
    #[serde(default)]
    pub secret_key: String,

    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Limite para processos sem `max_concurrent` explícito.
    #[serde(default = "default_max_concurrent")]
    pub default_max_concurrent: u32,

    /// Segundos que um vínculo de item de fila é mantido se a conclusão nunca chega.
    #[serde(default = "default_link_max_age_secs")]
    pub link_max_age_secs: u64,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub processes: Vec<ProcessConfig>,

    #[serde(default)]
    pub queues: Vec<QueueConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub token: String,
    /// Folder (organization unit) header sent with every call.
    #[serde(default)]
    pub folder_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    pub name: String,
    pub env_name: String,
    #[serde(default)]
    pub max_concurrent: Option<u32>,
    /// Arguments passed to jobs started by admission control.
    #[serde(default)]
    pub input_arguments: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub id: QueueId,
    /// Process whose jobs consume this queue.
    pub process: String,
    #[serde(default)]
    pub max_consumers: Option<u32>,
    /// Queue to start processing when an item of this queue completes.
    #[serde(default)]
    pub follow_up_queue: Option<QueueId>,
}

fn default_refresh_interval_secs() -> u64 {
    60
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_max_concurrent() -> u32 {
    1
}

fn default_link_max_age_secs() -> u64 {
    DEFAULT_LINK_MAX_AGE.as_secs()
}

fn default_base_url() -> String {
    "http://localhost".to_string()
}

impl Default for JobgateConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
            secret_key: String::new(),
            listen: default_listen(),
            default_max_concurrent: default_max_concurrent(),
            link_max_age_secs: default_link_max_age_secs(),
            orchestrator: OrchestratorConfig::default(),
            processes: Vec::new(),
            queues: Vec::new(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: String::new(),
            folder_id: None,
        }
    }
}

impl JobgateConfig {
    /// Carrega a configuração de `path`.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<JobgateConfig>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(key) = var("JOBGATE_SECRET_KEY")
            && !key.is_empty()
        {
            self.secret_key = key;
        }
        if let Some(token) = var("JOBGATE_ORCHESTRATOR_TOKEN")
            && !token.is_empty()
        {
            self.orchestrator.token = token;
        }
        if let Some(port) = var("PORT")
            && let Ok(port) = port.parse::<u16>()
        {
            self.listen.set_port(port);
        }
    }

    pub fn validate(&self) -> Result<(), JobgateError> {
        if self.refresh_interval_secs == 0 {
            return Err(JobgateError::Config(
                "refresh_interval_secs must be greater than zero".into(),
            ));
        }

        let mut names = HashSet::new();
        for process in &self.processes {
            if !names.insert(process.name.as_str()) {
                return Err(JobgateError::Config(format!(
                    "process {} is declared twice",
                    process.name
                )));
            }
        }

        let mut queue_ids = HashSet::new();
        let mut consumers = HashMap::new();
        for queue in &self.queues {
            if !queue_ids.insert(queue.id) {
                return Err(JobgateError::Config(format!(
                    "queue {} is declared twice",
                    queue.id
                )));
            }
            if !names.contains(queue.process.as_str()) {
                return Err(JobgateError::Config(format!(
                    "queue {} is consumed by undeclared process {}",
                    queue.id, queue.process
                )));
            }
            if let Some(first) = consumers.insert(queue.process.as_str(), queue.id) {
                return Err(JobgateError::Config(format!(
                    "process {} consumes both queue {} and queue {}",
                    queue.process, first, queue.id
                )));
            }
        }
        Ok(())
    }
}

/// Read-only view of the configured processes and queues.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    processes: Vec<ProcessConfig>,
    queues: Vec<QueueConfig>,
    by_name: HashMap<String, usize>,
    by_queue: HashMap<QueueId, usize>,
}

impl Catalog {
    pub fn new(processes: Vec<ProcessConfig>, queues: Vec<QueueConfig>) -> Self {
        let by_name = processes
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();
        let by_queue = queues.iter().enumerate().map(|(i, q)| (q.id, i)).collect();
        Self {
            processes,
            queues,
            by_name,
            by_queue,
        }
    }

    pub fn from_config(config: &JobgateConfig) -> Self {
        Self::new(config.processes.clone(), config.queues.clone())
    }

    pub fn process(&self, name: &str) -> Option<&ProcessConfig> {
        self.by_name.get(name).map(|&i| &self.processes[i])
    }

    pub fn queue(&self, id: QueueId) -> Option<&QueueConfig> {
        self.by_queue.get(&id).map(|&i| &self.queues[i])
    }

    /// The queue a process consumes, if any.
    pub fn queue_for_process(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.process == name)
    }

    pub fn processes(&self) -> &[ProcessConfig] {
        &self.processes
    }

    pub fn queues(&self) -> &[QueueConfig] {
        &self.queues
    }

    /// Store limits derived from the catalog.
    pub fn limits(&self, default_limit: u32) -> Limits {
        let mut limits = Limits::with_default(default_limit);
        for process in &self.processes {
            if let Some(max) = process.max_concurrent {
                limits = limits.with_process(process.name.clone(), max);
            }
        }
        for queue in &self.queues {
            limits = limits.with_queue(
                queue.id,
                QueuePolicy {
                    process: queue.process.clone(),
                    max_consumers: queue.max_consumers,
                },
            );
        }
        limits
    }
}
