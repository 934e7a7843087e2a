use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, net::SocketAddr, time::Duration};

use crate::{
    audio::policy::{EnqueueMode, RepeatMode},
    cluster::NodeId,
    session::{local::SessionSettings, MAX_VOLUME},
};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,

    // Cluster
    pub node_name: NodeId,
    pub listen_addr: Option<SocketAddr>,
    pub peers: HashMap<NodeId, SocketAddr>,
    pub coordinator: NodeId,
    #[serde(with = "human_duration")]
    pub remote_timeout: Duration,

    // Audio
    #[serde(with = "human_duration")]
    pub position_interval: Duration,
    pub default_volume: u16,
    pub max_queue_size: usize,
    pub default_repeat_mode: RepeatMode,
    pub default_enqueue_mode: EnqueueMode,

    // Rendimiento
    pub worker_threads: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Arma la configuración leyendo cada clave con `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let or = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let node_name = NodeId::new(or("NODE_NAME", "node-0"));
        let config = Self {
            // Discord
            discord_token: var("DISCORD_TOKEN").context("DISCORD_TOKEN no está definido")?,

            // Cluster
            listen_addr: var("LISTEN_ADDR")
                .map(|addr| addr.parse::<SocketAddr>())
                .transpose()
                .context("LISTEN_ADDR inválido")?,
            peers: parse_peers(&or("PEERS", ""))?,
            coordinator: var("COORDINATOR").map(NodeId::new).unwrap_or_else(|| node_name.clone()),
            node_name,
            remote_timeout: humantime::parse_duration(&or("REMOTE_TIMEOUT", "5s"))
                .context("REMOTE_TIMEOUT inválido")?,

            // Audio
            position_interval: humantime::parse_duration(&or("POSITION_INTERVAL", "5s"))
                .context("POSITION_INTERVAL inválido")?,
            default_volume: or("DEFAULT_VOLUME", "100")
                .parse::<u16>()
                .context("DEFAULT_VOLUME inválido")?,
            max_queue_size: or("MAX_QUEUE_SIZE", "1000")
                .parse::<usize>()
                .context("MAX_QUEUE_SIZE inválido")?,
            default_repeat_mode: or("DEFAULT_REPEAT_MODE", "none")
                .parse::<RepeatMode>()
                .map_err(anyhow::Error::msg)?,
            default_enqueue_mode: or("DEFAULT_ENQUEUE_MODE", "fifo")
                .parse::<EnqueueMode>()
                .map_err(anyhow::Error::msg)?,

            // Rendimiento
            worker_threads: match var("WORKER_THREADS") {
                Some(val) => val.parse::<usize>().context("WORKER_THREADS inválido")?,
                None => num_cpus::get(),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Volume must be between 0 and 1000
    /// - Queue size and worker threads must be greater than 0
    /// - Timeouts must be greater than 0
    /// - A node that is not its own coordinator must know how to reach it
    pub fn validate(&self) -> Result<()> {
        if self.default_volume > MAX_VOLUME {
            anyhow::bail!("Default volume must be between 0 and {}, got: {}", MAX_VOLUME, self.default_volume);
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.worker_threads == 0 {
            anyhow::bail!("Worker threads must be greater than 0");
        }

        if self.remote_timeout.is_zero() || self.position_interval.is_zero() {
            anyhow::bail!("Timeouts and intervals must be greater than 0");
        }

        if !self.is_coordinator() && !self.peers.contains_key(&self.coordinator) {
            anyhow::bail!("Coordinator {} is not listed in PEERS", self.coordinator);
        }

        if self.peers.contains_key(&self.node_name) {
            anyhow::bail!("PEERS must not list this node ({})", self.node_name);
        }

        Ok(())
    }

    /// Sin `LISTEN_ADDR` el proceso trabaja solo, con la red en memoria.
    pub fn is_standalone(&self) -> bool {
        self.listen_addr.is_none()
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator == self.node_name
    }

    /// Valores iniciales para cada sesión nueva.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            max_queue_size: self.max_queue_size,
            default_volume: self.default_volume,
            repeat: self.default_repeat_mode,
            enqueue_mode: self.default_enqueue_mode,
        }
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Excludes the Discord token.
    pub fn summary(&self) -> String {
        let mut peers: Vec<String> = self
            .peers
            .iter()
            .map(|(name, addr)| format!("{name}={addr}"))
            .collect();
        peers.sort();

        format!(
            "Config Summary:\n  \
            Node: {} (listen: {}, coordinator: {})\n  \
            Peers: [{}]\n  \
            Timeouts: remote {}, position every {}\n  \
            Sessions: {} vol, {} queue, repeat={}, enqueue={}\n  \
            Runtime: {} worker threads",
            self.node_name,
            self.listen_addr.map_or("standalone".to_string(), |addr| addr.to_string()),
            self.coordinator,
            peers.join(", "),
            humantime::format_duration(self.remote_timeout),
            humantime::format_duration(self.position_interval),
            self.default_volume,
            self.max_queue_size,
            self.default_repeat_mode,
            self.default_enqueue_mode,
            self.worker_threads
        )
    }
}

/// `name=host:port,name=host:port`
fn parse_peers(raw: &str) -> Result<HashMap<NodeId, SocketAddr>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, addr) = entry
                .split_once('=')
                .with_context(|| format!("Peer inválido '{entry}', se espera nombre=host:puerto"))?;
            let addr: SocketAddr = addr
                .trim()
                .parse()
                .with_context(|| format!("Dirección inválida para el peer '{name}'"))?;
            Ok((NodeId::new(name.trim()), addr))
        })
        .collect()
}

/// Duraciones en formato humano ("5s", "1m 30s") al serializar.
mod human_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        let node_name = NodeId::from("node-0");
        Self {
            // Discord (no defaults - must be provided)
            discord_token: String::new(),

            // Cluster defaults: standalone
            coordinator: node_name.clone(),
            node_name,
            listen_addr: None,
            peers: HashMap::new(),
            remote_timeout: Duration::from_secs(5),

            // Audio defaults
            position_interval: Duration::from_secs(5),
            default_volume: 100,
            max_queue_size: 1000,
            default_repeat_mode: RepeatMode::None,
            default_enqueue_mode: EnqueueMode::Fifo,

            // Performance defaults
            worker_threads: num_cpus::get(),
        }
    }
}
