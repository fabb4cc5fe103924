use crate::error::{NetcacheError, Result};
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub cache_dir: PathBuf,
    /// Capacity in bytes that eviction measures occupancy against
    pub max_cache_size: u64,
    /// Fraction of capacity a sweep trims occupancy down to
    pub clean_ratio: f64,
    pub buffer_size: usize,
    pub bind_addr: IpAddr,
    /// Port accepting STORE, RECLAIM and RESET
    pub upload_port: u16,
    /// Port accepting FETCH
    pub download_port: u16,
    pub max_connections: usize,
    pub idle_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/tmp/wafcache"),
            max_cache_size: 10 * 1024 * 1024 * 1024, // 10GB
            clean_ratio: 0.8,
            buffer_size: 16 * 8192,
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            upload_port: 11001,
            download_port: 12001,
            max_connections: 512,
            idle_timeout: None,
        }
    }
}

impl ServerConfig {
    /// Parse configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Parse configuration from any variable source, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let cache_dir = lookup("NETCACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);
        let max_cache_size =
            parse_var(&lookup, "NETCACHE_MAX_SIZE")?.unwrap_or(defaults.max_cache_size);
        let clean_ratio =
            parse_var(&lookup, "NETCACHE_CLEAN_RATIO")?.unwrap_or(defaults.clean_ratio);
        let buffer_size =
            parse_var(&lookup, "NETCACHE_BUFFER_SIZE")?.unwrap_or(defaults.buffer_size);
        let bind_addr = parse_var(&lookup, "NETCACHE_BIND_ADDR")?.unwrap_or(defaults.bind_addr);
        let upload_port =
            parse_var(&lookup, "NETCACHE_UPLOAD_PORT")?.unwrap_or(defaults.upload_port);
        let download_port =
            parse_var(&lookup, "NETCACHE_DOWNLOAD_PORT")?.unwrap_or(defaults.download_port);
        let max_connections =
            parse_var(&lookup, "NETCACHE_MAX_CONNECTIONS")?.unwrap_or(defaults.max_connections);
        let idle_timeout = parse_var::<u64, _>(&lookup, "NETCACHE_IDLE_TIMEOUT_SECS")?
            .map(Duration::from_secs);

        let config = Self {
            cache_dir,
            max_cache_size,
            clean_ratio,
            buffer_size,
            bind_addr,
            upload_port,
            download_port,
            max_connections,
            idle_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.clean_ratio > 0.0 && self.clean_ratio <= 1.0) {
            return Err(NetcacheError::Config(format!(
                "NETCACHE_CLEAN_RATIO must be in (0, 1], got {}",
                self.clean_ratio
            )));
        }
        if self.buffer_size == 0 {
            return Err(NetcacheError::Config(
                "NETCACHE_BUFFER_SIZE must be positive".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(NetcacheError::Config(
                "NETCACHE_MAX_CONNECTIONS must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Both ports equal (and fixed) means one listener serving every command
    pub fn single_port(&self) -> bool {
        self.upload_port == self.download_port && self.upload_port != 0
    }

    /// Occupancy in bytes that RECLAIM trims down to
    pub fn target_size(&self) -> u64 {
        (self.max_cache_size as f64 * self.clean_ratio).floor() as u64
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            NetcacheError::Config(format!("invalid {} {:?}: {}", name, raw, e))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/wafcache"));
        assert_eq!(config.max_cache_size, 10 * 1024 * 1024 * 1024);
        assert_eq!(config.clean_ratio, 0.8);
        assert_eq!(config.buffer_size, 131072);
        assert_eq!(config.upload_port, 11001);
        assert_eq!(config.download_port, 12001);
        assert!(config.idle_timeout.is_none());
        assert!(!config.single_port());
    }

    #[test]
    fn test_from_lookup_empty_uses_defaults() {
        let config = ServerConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.upload_port, 11001);
        assert_eq!(config.max_connections, 512);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("NETCACHE_DIR", "/var/cache/netcache"),
            ("NETCACHE_MAX_SIZE", "1000"),
            ("NETCACHE_CLEAN_RATIO", "0.5"),
            ("NETCACHE_UPLOAD_PORT", "5000"),
            ("NETCACHE_DOWNLOAD_PORT", "5000"),
            ("NETCACHE_BIND_ADDR", "127.0.0.1"),
            ("NETCACHE_IDLE_TIMEOUT_SECS", "30"),
        ]))
        .unwrap();

        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/netcache"));
        assert_eq!(config.max_cache_size, 1000);
        assert_eq!(config.target_size(), 500);
        assert_eq!(config.bind_addr, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
        assert!(config.single_port());
    }

    #[test]
    fn test_invalid_number_is_config_error() {
        let err = ServerConfig::from_lookup(lookup_from(&[("NETCACHE_MAX_SIZE", "lots")]))
            .unwrap_err();
        assert!(matches!(err, NetcacheError::Config(_)));
        assert!(err.to_string().contains("NETCACHE_MAX_SIZE"));
    }

    #[test]
    fn test_ratio_out_of_range_rejected() {
        for ratio in ["0", "1.5", "-0.2", "NaN"] {
            let result = ServerConfig::from_lookup(lookup_from(&[("NETCACHE_CLEAN_RATIO", ratio)]));
            assert!(result.is_err(), "ratio {} should be rejected", ratio);
        }
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let result = ServerConfig::from_lookup(lookup_from(&[("NETCACHE_BUFFER_SIZE", "0")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_ephemeral_ports_are_not_single_port() {
        let config = ServerConfig {
            upload_port: 0,
            download_port: 0,
            ..ServerConfig::default()
        };
        assert!(!config.single_port());
    }
}
