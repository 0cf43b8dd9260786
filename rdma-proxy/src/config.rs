//! Crate-level tunables, loadable from TOML with the same defaults as the
//! original hard-coded constants.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rdma_buffer_size: usize,
    pub recv_slot_size: usize,
    pub max_recv_cqe: i32,
    pub max_send_cqe: i32,
    pub max_recv_wr: u32,
    pub max_send_wr: u32,
    pub resolve_timeout_ms: i32,
    pub listen_backlog: i32,
    pub log_path: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            rdma_buffer_size: 4096,
            recv_slot_size: 50,
            max_recv_cqe: 30,
            max_send_cqe: 30,
            max_recv_wr: 30,
            max_send_wr: 30,
            resolve_timeout_ms: 500,
            listen_backlog: 10,
            log_path: "rdma-proxy.log".to_string(),
        }
    }
}

impl Config {
    /// Deserializes `path` as TOML, falling back to defaults for any field
    /// the file omits. A missing file is not an error; it yields defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Config {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(text) => toml::from_str(&text).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_constants() {
        let c = Config::default();
        assert_eq!(c.rdma_buffer_size, 4096);
        assert_eq!(c.recv_slot_size, 50);
        assert_eq!(c.max_recv_cqe, 30);
        assert_eq!(c.max_send_cqe, 30);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let c = Config::load("/nonexistent/path/does-not-exist.toml");
        assert_eq!(c.rdma_buffer_size, Config::default().rdma_buffer_size);
    }

    #[test]
    fn partial_toml_fills_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        std::fs::write(&path, "recv_slot_size = 128\n").unwrap();
        let c = Config::load(&path);
        assert_eq!(c.recv_slot_size, 128);
        assert_eq!(c.rdma_buffer_size, 4096);
    }
}
