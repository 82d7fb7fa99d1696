//! Daemon configuration loaded from the environment.

use std::net::SocketAddr;

use fluxgate_delivery::WorkerConfig;

/// Root daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Address the operator API listens on.
    pub listen_addr: SocketAddr,
    /// Delivery worker tuning.
    pub worker: WorkerConfig,
}

impl DaemonConfig {
    /// Load configuration from `FLUXGATE_*` environment variables.
    pub fn from_env() -> Result<Self, String> {
        let listen_addr = std::env::var("FLUXGATE_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .map_err(|e| format!("invalid FLUXGATE_LISTEN_ADDR: {e}"))?;

        let mut worker = WorkerConfig::default();
        if let Some(concurrency) = env_parse::<usize>("FLUXGATE_WORKER_CONCURRENCY")? {
            worker.concurrency = concurrency;
        }
        if let Some(poll_ms) = env_parse::<u64>("FLUXGATE_WORKER_POLL_MS")? {
            worker.poll_interval_ms = poll_ms;
        }
        if let Some(batch) = env_parse::<usize>("FLUXGATE_WORKER_BATCH_SIZE")? {
            worker.batch_size = batch;
        }

        Ok(Self {
            listen_addr,
            worker,
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, String>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| format!("invalid {name}: {e}")),
        Err(_) => Ok(None),
    }
}
