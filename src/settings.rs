use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use config::{Config, ConfigError, Environment, File, FileFormat, Map, Source, Value};
use serde::Deserialize;

/// Store configuration, persisted separately from the control plane's bind
/// address so the two can be rotated independently.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    pub path: PathBuf,
    pub password: Option<String>,
}

/// Control plane bind address.
#[derive(Debug, Deserialize, Clone)]
pub struct ControlPlaneSettings {
    pub host: String,
    pub port: u16,
}

/// Retry and connection tuning shared by every [`crate::rpc::SubstrateRpcApi`] impl.
#[derive(Debug, Deserialize, Clone)]
pub struct RpcSettings {
    pub connect_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub store: StoreSettings,
    pub control_plane: ControlPlaneSettings,
    pub rpc: RpcSettings,
}

/// Flags accepted on the command line, overlaid on top of defaults and
/// environment variables. Each field is `Option` so an unset flag falls
/// through to whatever the lower-priority sources already provided.
#[derive(Parser, Debug, Clone, Default)]
#[clap(version, about = "Substrate multi-chain extrinsic indexer")]
pub struct CommandLineOptions {
    /// Path to a TOML config file layered on top of the built-in defaults.
    #[clap(long = "config-file")]
    pub config_file: Option<PathBuf>,

    #[clap(long = "store.path")]
    store_path: Option<PathBuf>,
    #[clap(long = "store.password")]
    store_password: Option<String>,
    #[clap(long = "control-plane.host")]
    control_plane_host: Option<String>,
    #[clap(long = "control-plane.port")]
    control_plane_port: Option<u16>,
}

impl Settings {
    /// Layers, lowest priority first: built-in defaults, an optional config
    /// file, `SI__`-prefixed environment variables, then command-line flags.
    pub fn load(opts: CommandLineOptions) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("store.path", "./data/substrate-indexer")?
            .set_default("control_plane.host", "localhost")?
            .set_default("control_plane.port", 5000)?
            .set_default("rpc.connect_timeout_seconds", 10)?
            .set_default("rpc.request_timeout_seconds", 10)?;

        if let Some(path) = &opts.config_file {
            builder = builder.add_source(File::from(path.clone()).format(FileFormat::Toml));
        }

        builder
            .add_source(Environment::with_prefix("SI").separator("__"))
            .add_source(opts)
            .build()?
            .try_deserialize()
    }
}

impl Source for CommandLineOptions {
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(self.clone())
    }

    fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
        let mut map: HashMap<String, Value> = HashMap::new();
        insert_opt(&mut map, "store.path", &self.store_path.as_ref().map(|p| p.display().to_string()));
        insert_opt(&mut map, "store.password", &self.store_password);
        insert_opt(&mut map, "control_plane.host", &self.control_plane_host);
        insert_opt(&mut map, "control_plane.port", &self.control_plane_port.map(|p| p as i64));
        Ok(map)
    }
}

fn insert_opt<T: Into<Value> + Clone>(map: &mut HashMap<String, Value>, key: &str, value: &Option<T>) {
    if let Some(v) = value {
        map.insert(key.to_owned(), v.clone().into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_nothing_else_is_set() {
        let settings = Settings::load(CommandLineOptions::default()).unwrap();
        assert_eq!(settings.control_plane.host, "localhost");
        assert_eq!(settings.control_plane.port, 5000);
    }

    #[test]
    fn command_line_flag_overrides_default() {
        let opts = CommandLineOptions {
            control_plane_port: Some(9000),
            ..Default::default()
        };
        let settings = Settings::load(opts).unwrap();
        assert_eq!(settings.control_plane.port, 9000);
    }
}
