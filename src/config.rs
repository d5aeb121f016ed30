use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::XrpcError;

/// Read-only `key=value` store loaded from a configuration file.
///
/// Empty lines and `#` comments are skipped, keys and values are trimmed,
/// unknown keys are kept and ignored by the framework.
#[derive(Debug, Default, Clone)]
pub struct XrpcConfig {
    map: HashMap<String, String>,
}

impl XrpcConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, XrpcError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) => Err(XrpcError::Config(format!(
                "fail to open config file {:?}: {}",
                path, e
            ))),
        }
    }

    pub fn parse(content: &str) -> Self {
        let mut map = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if !key.is_empty() {
                map.insert(key.to_string(), value.trim().to_string());
            }
        }
        Self { map }
    }

    /// Raw lookup with a caller-supplied default.
    pub fn get<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        match self.map.get(key) {
            Some(v) => v.as_str(),
            None => default,
        }
    }

    /// Host of the coordination service, as `ip:port`.
    pub fn coord_host(&self) -> String {
        format!(
            "{}:{}",
            self.get("zookeeper_ip", "127.0.0.1"),
            self.get("zookeeper_port", "2181")
        )
    }

    /// Coordination session timeout.
    pub fn coord_timeout(&self) -> Duration {
        let ms = self
            .get("zookeeper_timeout_ms", "6000")
            .parse::<u64>()
            .unwrap_or(6000);
        Duration::from_millis(ms)
    }

    /// Bind address of the server, as `ip:port`.
    pub fn server_addr(&self) -> String {
        format!(
            "{}:{}",
            self.get("server_ip", "0.0.0.0"),
            self.get("server_port", "8080")
        )
    }

    pub fn log_file(&self) -> &str {
        self.get("log_file", "xrpc.log")
    }

    pub fn log_level(&self) -> &str {
        self.get("log_level", "info")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let cfg = XrpcConfig::parse(
            "# xrpc config\n\
             server_ip = 127.0.0.1\n\
             server_port=9000\n\
             \n\
             \t zookeeper_ip = 10.0.0.2 \n\
             not_a_pair\n\
             some_future_key = whatever\n",
        );
        assert_eq!(cfg.get("server_ip", ""), "127.0.0.1");
        assert_eq!(cfg.get("server_port", ""), "9000");
        assert_eq!(cfg.server_addr(), "127.0.0.1:9000");
        assert_eq!(cfg.get("zookeeper_ip", ""), "10.0.0.2");
        assert_eq!(cfg.coord_host(), "10.0.0.2:2181");
        // unknown keys are kept but harmless
        assert_eq!(cfg.get("some_future_key", ""), "whatever");
    }

    #[test]
    fn test_defaults() {
        let cfg = XrpcConfig::parse("");
        assert_eq!(cfg.coord_host(), "127.0.0.1:2181");
        assert_eq!(cfg.coord_timeout(), Duration::from_millis(6000));
        assert_eq!(cfg.server_addr(), "0.0.0.0:8080");
        assert_eq!(cfg.log_file(), "xrpc.log");
        assert_eq!(cfg.log_level(), "info");
    }

    #[test]
    fn test_bad_number_falls_back() {
        let cfg = XrpcConfig::parse("zookeeper_timeout_ms = not_a_number\n");
        assert_eq!(cfg.coord_timeout(), Duration::from_millis(6000));
    }

    #[test]
    fn test_load_missing_file() {
        let r = XrpcConfig::load("/nonexistent/xrpc.conf");
        assert!(r.is_err());
    }
}
