use config::Config;
use serde::Deserialize;

use std::net::SocketAddr;
use std::path::PathBuf;

mod logger;
pub use logger::LoggerConfig;

#[derive(Deserialize)]
pub struct NodeConfig {
    /// Address the accept loop listens on for inbound connections.
    pub listen_address: SocketAddr,

    pub pool: pool::PoolConfig,

    #[serde(default)]
    pub shutdown_timeout: Option<u64>,

    #[serde(default)]
    pub logger: LoggerConfig,
}

impl NodeConfig {
    pub fn from_path(path: PathBuf) -> eyre::Result<Self> {
        let config = Config::builder()
            .add_source(config::File::from(path))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
