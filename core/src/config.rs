// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing config from {}", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml")?;
        config = toml::from_str(&config_str).context("parsing config file")?;
    } else {
        info!("no config file given, using defaults");
    }

    config.verify()?;
    Ok(config)
}

/// An invalid or missing piece of configuration. Fatal at startup: the
/// `jobd` binary maps this to exit code 1.
#[derive(Debug)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    #[serde(default)]
    pub comm: CommConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

impl Config {
    fn verify(&self) -> Result<(), ConfigError> {
        self.comm.verify()?;
        self.server.verify()?;
        self.client.verify()?;
        Ok(())
    }
}

/// `comm`: where the daemon listens and where a client dials.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CommConfig {
    pub ip: String,
    pub port: u16,
}

impl Default for CommConfig {
    fn default() -> Self {
        CommConfig { ip: "127.0.0.1".to_string(), port: 4747 }
    }
}

impl CommConfig {
    fn verify(&self) -> Result<(), ConfigError> {
        if self.port < 1024 {
            return Err(ConfigError(format!("comm.port must be >= 1024, got {}", self.port)));
        }
        Ok(())
    }
}

/// `server`: the worker pool and on-disk layout.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub num_threads: usize,
    pub data_dir: PathBuf,
    pub cookies: PathBuf,
    pub descriptions: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            num_threads: 4,
            data_dir: PathBuf::from(""),
            cookies: PathBuf::from(""),
            descriptions: true,
        }
    }
}

impl ServerConfig {
    fn verify(&self) -> Result<(), ConfigError> {
        if self.num_threads < 1 {
            return Err(ConfigError(format!(
                "server.num_threads must be >= 1, got {}",
                self.num_threads
            )));
        }
        if !self.data_dir.as_os_str().is_empty() {
            fs::create_dir_all(&self.data_dir).map_err(|e| {
                ConfigError(format!("creating server.data_dir {:?}: {}", self.data_dir, e))
            })?;
        }
        if self.cookies.is_dir() {
            return Err(ConfigError(format!(
                "server.cookies ({:?}) must be a file, not a directory",
                self.cookies
            )));
        }
        Ok(())
    }
}

/// `client`: the three-tier response timeout policy used by the
/// client-library session (C6).
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ClientConfig {
    pub response_timeout_sec: f64,
    pub long_response_timeout_sec: f64,
    pub short_response_timeout_sec: f64,
    /// Where this machine's persistent client identity token is cached.
    /// Every connection loads (or creates) the token here and sends it in
    /// a `Hello`, so the daemon recognizes separate one-shot invocations
    /// sharing this file as the same logical client.
    pub identity_file: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            response_timeout_sec: 10.0,
            long_response_timeout_sec: 600.0,
            short_response_timeout_sec: 2.0,
            identity_file: default_identity_file(),
        }
    }
}

fn default_identity_file() -> PathBuf {
    let base = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(std::env::temp_dir);
    base.join(".jobd-client-id")
}

impl ClientConfig {
    fn verify(&self) -> Result<(), ConfigError> {
        for (name, v) in [
            ("client.response_timeout_sec", self.response_timeout_sec),
            ("client.long_response_timeout_sec", self.long_response_timeout_sec),
            ("client.short_response_timeout_sec", self.short_response_timeout_sec),
        ] {
            if v <= 0.0 {
                return Err(ConfigError(format!("{} must be > 0, got {}", name, v)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;

    #[test]
    #[timeout(30000)]
    fn parse_defaults() -> anyhow::Result<()> {
        let config: Config = toml::from_str("")?;
        assert_eq!(config.comm.port, 4747);
        assert_eq!(config.server.num_threads, 4);
        assert_eq!(config.client.response_timeout_sec, 10.0);
        Ok(())
    }

    #[test]
    #[timeout(30000)]
    fn parse_explicit() -> anyhow::Result<()> {
        let toml_str = r#"
            [comm]
            ip = "0.0.0.0"
            port = 5000

            [server]
            num_threads = 8
            data_dir = "/tmp/jobd-data"
            cookies = "/tmp/jobd-cookies.txt"
            descriptions = false

            [client]
            response_timeout_sec = 5.0
            long_response_timeout_sec = 120.0
            short_response_timeout_sec = 1.0
        "#;
        let config: Config = toml::from_str(toml_str)?;
        assert_eq!(config.comm.ip, "0.0.0.0");
        assert_eq!(config.server.num_threads, 8);
        assert!(!config.server.descriptions);
        assert_eq!(config.client.short_response_timeout_sec, 1.0);
        Ok(())
    }

    #[test]
    fn rejects_low_port() {
        let config = Config {
            comm: CommConfig { ip: "127.0.0.1".to_string(), port: 80 },
            ..Default::default()
        };
        assert!(config.verify().is_err());
    }

    #[test]
    fn rejects_zero_threads() {
        let config = Config {
            server: ServerConfig { num_threads: 0, ..Default::default() },
            ..Default::default()
        };
        assert!(config.verify().is_err());
    }

    #[test]
    fn rejects_nonpositive_timeout() {
        let config = Config {
            client: ClientConfig { response_timeout_sec: 0.0, ..Default::default() },
            ..Default::default()
        };
        assert!(config.verify().is_err());
    }
}
