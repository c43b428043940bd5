//! # icebroadcastd configuration
//!
//! Loads and persists the broadcaster's settings:
//! - Loading configuration from YAML files
//! - Merging with embedded default configuration
//! - Environment variable overrides
//! - Type-safe getters and setters for configuration values
//! - Thread-safe singleton access pattern
//!
//! ## Usage
//!
//! ```no_run
//! use iceconfig::get_config;
//!
//! let config = get_config();
//! let port = config.get_http_port();
//! config.set_http_port(9000)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{anyhow, Result};
use dirs::home_dir;
use iceutils::guess_local_ip;
use lazy_static::lazy_static;
use serde_yaml::{Mapping, Number, Value};
use std::{
    env, fs,
    path::Path,
    sync::{Arc, Mutex},
};
use tracing::info;

pub mod encryption;

const DEFAULT_CONFIG: &str = include_str!("default.yaml");

lazy_static! {
    static ref CONFIG: Arc<Config> =
        Arc::new(Config::load_config("").expect("failed to load icebroadcastd configuration"));
}

const ENV_CONFIG_DIR: &str = "ICEBROADCASTD_CONFIG";
const ENV_PREFIX: &str = "ICEBROADCASTD_CONFIG__";

const DEFAULT_HTTP_PORT: u16 = 8000;
const DEFAULT_LOG_BUFFER_CAPACITY: usize = 1000;
const DEFAULT_LOG_MIN_LEVEL: &str = "INFO";
const DEFAULT_LOG_ENABLE_CONSOLE: bool = true;
const DEFAULT_MAX_UNSYNCED_BYTES: usize = 8000;
const DEFAULT_MAX_CONCURRENT_RELAY_CONNECTS: usize = 3;
const DEFAULT_MASTER_UPDATE_INTERVAL_SECS: usize = 10;

/// Generates a getter/setter pair for `usize` values with a fallback default.
macro_rules! impl_usize_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<usize> {
            match self.get_value($path)? {
                Value::Number(n) if n.is_i64() => Ok(n.as_i64().unwrap() as usize),
                Value::Number(n) if n.is_u64() => Ok(n.as_u64().unwrap() as usize),
                _ => Ok($default),
            }
        }

        pub fn $setter(&self, size: usize) -> Result<()> {
            let n = Number::from(size);
            self.set_value($path, Value::Number(n))
        }
    };
}

/// Generates a getter/setter pair for `bool` values with a fallback default.
macro_rules! impl_bool_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<bool> {
            match self.get_value($path)? {
                Value::Bool(b) => Ok(b),
                _ => Ok($default),
            }
        }

        pub fn $setter(&self, value: bool) -> Result<()> {
            self.set_value($path, Value::Bool(value))
        }
    };
}

/// This process's own master-poll settings, read out of `master.*` when
/// `master.host` is set -- i.e. when this process runs as a relay/slave.
#[derive(Debug, Clone)]
pub struct MasterPollSettings {
    pub host: String,
    pub port: u16,
    pub ssl_port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub send_auth: bool,
}

/// Global, thread-safe configuration manager backed by a YAML file on disk.
#[derive(Debug)]
pub struct Config {
    config_dir: String,
    path: String,
    data: Mutex<Value>,
}

impl Clone for Config {
    fn clone(&self) -> Self {
        let data = self.data.lock().unwrap().clone();
        Self {
            config_dir: self.config_dir.clone(),
            path: self.path.clone(),
            data: Mutex::new(data),
        }
    }
}

impl Config {
    fn find_config_dir(directory: &str) -> String {
        if !directory.is_empty() {
            return directory.to_string();
        }

        if let Ok(env_path) = env::var(ENV_CONFIG_DIR) {
            info!(env_var = ENV_CONFIG_DIR, path = %env_path, "loading config dir from env");
            return env_path;
        }

        if Path::new(".icebroadcastd").exists() {
            return ".icebroadcastd".to_string();
        }

        if let Some(home) = home_dir() {
            let home_config = home.join(".icebroadcastd");
            if home_config.exists() {
                return home_config.to_string_lossy().to_string();
            }
        }

        ".icebroadcastd".to_string()
    }

    fn validate_config_dir(path: &Path) -> Result<()> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(anyhow!("config path is not a directory"));
        }

        let test_file = path.join(".write_test");
        fs::write(&test_file, b"test")?;
        fs::remove_file(&test_file)?;
        fs::read_dir(path)?;

        Ok(())
    }

    /// Resolves the configuration directory, trying in order: the given
    /// `directory`, the `ICEBROADCASTD_CONFIG` env var, `./.icebroadcastd`,
    /// then `~/.icebroadcastd`. Creates it if missing.
    pub fn config_dir(directory: &str) -> String {
        let dir_path = Self::find_config_dir(directory);
        let path = Path::new(&dir_path);
        Self::validate_config_dir(path).expect("could not validate the configuration directory");
        dir_path
    }

    /// Loads configuration: embedded defaults, merged with `config.yaml` in
    /// the config dir if present, then environment variable overrides.
    pub fn load_config(directory: &str) -> Result<Self> {
        let config_dir = Self::config_dir(directory);
        info!(config_dir = %config_dir, "using config directory");

        let config_file_path = Path::new(&config_dir).join("config.yaml");
        let path = config_file_path.to_string_lossy().to_string();

        let mut default_value: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;

        let yaml_data = if let Ok(data) = fs::read(&path) {
            info!(config_file = %path, "loaded config file");
            data
        } else {
            info!(config_file = %path, "config file not found, using embedded defaults");
            DEFAULT_CONFIG.as_bytes().to_vec()
        };

        let external_value: Value = serde_yaml::from_slice(&yaml_data)?;
        merge_yaml(&mut default_value, &external_value);
        let mut config_value = Self::lower_keys_value(default_value);

        Self::apply_env_overrides(&mut config_value);

        let config = Config {
            config_dir,
            path,
            data: Mutex::new(config_value),
        };

        config.save()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let data = self.data.lock().unwrap();
        let yaml = serde_yaml::to_string(&*data)?;
        fs::write(&self.path, yaml)?;
        Ok(())
    }

    pub fn set_value(&self, path: &[&str], value: Value) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        Self::set_value_internal(&mut data, path, value.clone())?;
        drop(data);
        self.save()?;
        Ok(())
    }

    fn set_value_internal(data: &mut Value, path: &[&str], value: Value) -> Result<()> {
        if path.is_empty() {
            *data = value;
            return Ok(());
        }
        if let Value::Mapping(map) = data {
            let key = path[0].to_lowercase();
            let key_value = Value::String(key.clone());
            if path.len() == 1 {
                map.insert(key_value, value);
            } else {
                let entry = map
                    .entry(key_value)
                    .or_insert(Value::Mapping(Mapping::new()));
                Self::set_value_internal(entry, &path[1..], value)?;
            }
            Ok(())
        } else {
            Err(anyhow!("current node is not a mapping"))
        }
    }

    pub fn get_value(&self, path: &[&str]) -> Result<Value> {
        let data = self.data.lock().unwrap();
        Self::get_value_internal(&data, path)
    }

    fn get_value_internal(data: &Value, path: &[&str]) -> Result<Value> {
        let mut current = data;
        for (i, key) in path.iter().enumerate() {
            if let Value::Mapping(map) = current {
                let key = key.to_lowercase();
                if let Some(next) = map.get(&Value::String(key)) {
                    current = next;
                } else {
                    return Err(anyhow!("path {} does not exist", path[..=i].join(".")));
                }
            } else {
                return Err(anyhow!("path {} is not a mapping", path[..i].join(".")));
            }
        }
        Ok(current.clone())
    }

    fn apply_env_overrides(config: &mut Value) {
        for (key, value) in env::vars() {
            if key.starts_with(ENV_PREFIX) {
                let key_path = key
                    .trim_start_matches(ENV_PREFIX)
                    .split("__")
                    .collect::<Vec<_>>();
                let yaml_value = Self::convert_env_value(&value);
                let _ = Self::set_value_internal(config, &key_path, yaml_value);
            }
        }
    }

    fn convert_env_value(value: &str) -> Value {
        if let Ok(parsed) = serde_yaml::from_str::<Value>(value) {
            return parsed;
        }
        Value::String(value.to_string())
    }

    fn lower_keys_value(value: Value) -> Value {
        match value {
            Value::Mapping(map) => {
                let mut new_map = Mapping::new();
                for (k, v) in map {
                    if let Value::String(s) = k {
                        new_map.insert(Value::String(s.to_lowercase()), Self::lower_keys_value(v));
                    } else {
                        new_map.insert(k, Self::lower_keys_value(v));
                    }
                }
                Value::Mapping(new_map)
            }
            Value::Sequence(seq) => {
                Value::Sequence(seq.into_iter().map(Self::lower_keys_value).collect())
            }
            _ => value,
        }
    }

    /// Base URL advertised to listeners/relays; falls back to a guessed
    /// local IP when unset.
    pub fn get_base_url(&self) -> String {
        match self.get_value(&["host", "base_url"]) {
            Ok(Value::String(s)) if !s.is_empty() => s,
            Ok(_) => {
                tracing::warn!("base_url not set, guessing local IP");
                guess_local_ip()
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to read base_url, guessing local IP");
                guess_local_ip()
            }
        }
    }

    pub fn get_http_port(&self) -> u16 {
        match self.get_value(&["host", "http_port"]) {
            Ok(Value::Number(n)) if n.is_i64() => n.as_i64().unwrap() as u16,
            Ok(Value::String(s)) => match s.parse::<u16>() {
                Ok(port) => port,
                Err(_) => {
                    tracing::warn!(value = %s, default = DEFAULT_HTTP_PORT, "invalid http_port, using default");
                    DEFAULT_HTTP_PORT
                }
            },
            _ => DEFAULT_HTTP_PORT,
        }
    }

    pub fn set_http_port(&self, port: u16) -> Result<()> {
        self.set_value(&["host", "http_port"], Value::Number(Number::from(port)))
    }

    impl_usize_config!(
        get_log_cache_size,
        set_log_cache_size,
        &["host", "logger", "buffer_capacity"],
        DEFAULT_LOG_BUFFER_CAPACITY
    );

    impl_bool_config!(
        get_log_enable_console,
        set_log_enable_console,
        &["host", "logger", "enable_console"],
        DEFAULT_LOG_ENABLE_CONSOLE
    );

    pub fn get_log_min_level(&self) -> Result<String> {
        match self.get_value(&["host", "logger", "min_level"])? {
            Value::String(s) => Ok(s),
            _ => Ok(DEFAULT_LOG_MIN_LEVEL.to_string()),
        }
    }

    pub fn set_log_min_level(&self, level: String) -> Result<()> {
        self.set_value(&["host", "logger", "min_level"], Value::String(level))
    }

    impl_usize_config!(
        get_max_unsynced_bytes,
        set_max_unsynced_bytes,
        &["limits", "max_unsynced_bytes"],
        DEFAULT_MAX_UNSYNCED_BYTES
    );

    impl_usize_config!(
        get_max_concurrent_relay_connects,
        set_max_concurrent_relay_connects,
        &["limits", "max_concurrent_relay_connects"],
        DEFAULT_MAX_CONCURRENT_RELAY_CONNECTS
    );

    impl_usize_config!(
        get_master_update_interval_secs,
        set_master_update_interval_secs,
        &["master", "update_interval_secs"],
        DEFAULT_MASTER_UPDATE_INTERVAL_SECS
    );

    impl_bool_config!(
        get_relay_on_demand,
        set_relay_on_demand,
        &["master", "on_demand"],
        false
    );

    /// Mount names configured under `mounts:`, in no particular order.
    pub fn get_mount_names(&self) -> Vec<String> {
        match self.get_value(&["mounts"]) {
            Ok(Value::Mapping(map)) => map
                .keys()
                .filter_map(|k| k.as_str().map(String::from))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// ICY metadata period for a given mount, `mounts.<mount>.icy_interval`.
    pub fn get_mount_icy_interval(&self, mount: &str) -> usize {
        match self.get_value(&["mounts", mount, "icy_interval"]) {
            Ok(Value::Number(n)) if n.is_u64() => n.as_u64().unwrap() as usize,
            _ => 16000,
        }
    }

    /// This process's own master, if it is configured as a relay/slave.
    /// `master.host` empty means "not a slave".
    pub fn get_master_poll_settings(&self) -> Option<MasterPollSettings> {
        let host = match self.get_value(&["master", "host"]) {
            Ok(Value::String(s)) if !s.is_empty() => s,
            _ => return None,
        };
        let port = match self.get_value(&["master", "port"]) {
            Ok(Value::Number(n)) if n.is_u64() => n.as_u64().unwrap() as u16,
            _ => DEFAULT_HTTP_PORT,
        };
        let ssl_port = match self.get_value(&["master", "ssl_port"]) {
            Ok(Value::Number(n)) if n.is_u64() => Some(n.as_u64().unwrap() as u16),
            _ => None,
        };
        let username = match self.get_value(&["master", "username"]) {
            Ok(Value::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        };
        let password = match self.get_value(&["master", "password"]) {
            Ok(Value::String(s)) if !s.is_empty() => encryption::decrypt(&s).ok(),
            _ => None,
        };
        let send_auth = self.get_relay_send_auth().unwrap_or(false);

        Some(MasterPollSettings {
            host,
            port,
            ssl_port,
            username,
            password,
            send_auth,
        })
    }

    impl_bool_config!(
        get_relay_send_auth,
        set_relay_send_auth,
        &["master", "send_auth"],
        false
    );

    /// Encrypts and stores a relay password under `relays.<localmount>.password`.
    pub fn set_relay_password(&self, localmount: &str, password: &str) -> Result<()> {
        let sealed = encryption::encrypt(password)?;
        self.set_value(
            &["relays", localmount, "password"],
            Value::String(sealed),
        )
    }

    /// Reads and decrypts a relay password, if one is configured.
    pub fn get_relay_password(&self, localmount: &str) -> Result<Option<String>> {
        match self.get_value(&["relays", localmount, "password"]) {
            Ok(Value::String(sealed)) => Ok(Some(encryption::decrypt(&sealed)?)),
            _ => Ok(None),
        }
    }
}

/// Returns the process-wide configuration instance, lazily loaded on first
/// access.
pub fn get_config() -> Arc<Config> {
    CONFIG.clone()
}

/// Recursively merges `external` into `default`: mappings merge key by key,
/// scalars and sequences are replaced outright.
fn merge_yaml(default: &mut Value, external: &Value) {
    match (default, external) {
        (Value::Mapping(dmap), Value::Mapping(emap)) => {
            for (k, v) in emap {
                match dmap.get_mut(k) {
                    Some(dv) => merge_yaml(dv, v),
                    None => {
                        dmap.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (d, e) => *d = e.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_falls_back_to_embedded_default_in_a_fresh_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_config(tmp.path().to_str().unwrap()).unwrap();
        assert_eq!(config.get_http_port(), DEFAULT_HTTP_PORT);
        assert_eq!(
            config.get_max_unsynced_bytes().unwrap(),
            DEFAULT_MAX_UNSYNCED_BYTES
        );
    }

    #[test]
    fn set_value_persists_across_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_str().unwrap();
        let config = Config::load_config(dir).unwrap();
        config.set_http_port(9200).unwrap();

        let reloaded = Config::load_config(dir).unwrap();
        assert_eq!(reloaded.get_http_port(), 9200);
    }

    #[test]
    fn relay_password_round_trips_through_encryption() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_config(tmp.path().to_str().unwrap()).unwrap();
        config.set_relay_password("/live", "s3cret").unwrap();
        assert_eq!(
            config.get_relay_password("/live").unwrap(),
            Some("s3cret".to_string())
        );
    }

    #[test]
    fn master_poll_settings_absent_when_host_unset() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_config(tmp.path().to_str().unwrap()).unwrap();
        assert!(config.get_master_poll_settings().is_none());
    }

    #[test]
    fn master_poll_settings_present_once_host_is_set() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_config(tmp.path().to_str().unwrap()).unwrap();
        config
            .set_value(&["master", "host"], Value::String("master.example".into()))
            .unwrap();
        let settings = config.get_master_poll_settings().unwrap();
        assert_eq!(settings.host, "master.example");
        assert_eq!(settings.port, DEFAULT_HTTP_PORT);
    }

    #[test]
    fn mount_names_reflects_configured_mounts() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_config(tmp.path().to_str().unwrap()).unwrap();
        config
            .set_value(
                &["mounts", "/live", "icy_interval"],
                Value::Number(Number::from(8000u64)),
            )
            .unwrap();
        assert_eq!(config.get_mount_names(), vec!["/live".to_string()]);
        assert_eq!(config.get_mount_icy_interval("/live"), 8000);
    }
}
