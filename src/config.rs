//! Runtime configuration.
//!
//! `src/bin/rdma_server.rs` reads a single address from an environment
//! variable with a hardcoded fallback (`env::var(ADDR_KEY)...
//! unwrap_or_else(|_| "0.0.0.0:9003".to_string())`). This module generalizes
//! that idiom to the handful of knobs the shared-memory channel, messenger
//! and RDMA primitives need, without introducing a config-file parser.

use std::env;
use std::time::Duration;

const SHM_ADDR_KEY: &str = "KIRO_SHM_ADDR";
const MSG_ADDR_KEY: &str = "KIRO_MSG_ADDR";
const QP_SEND_WRS_KEY: &str = "KIRO_QP_SEND_WRS";
const QP_RECV_WRS_KEY: &str = "KIRO_QP_RECV_WRS";
const PING_TIMEOUT_KEY: &str = "KIRO_PING_TIMEOUT_MS";

pub const DEFAULT_SHM_ADDR: &str = "0.0.0.0:60010";
pub const DEFAULT_MSG_ADDR: &str = "0.0.0.0:60011";
pub const DEFAULT_QP_SEND_WRS: u32 = 10;
pub const DEFAULT_QP_RECV_WRS: u32 = 10;
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 2000;

/// Process-wide knobs for a KIRO endpoint.
///
/// `Config::from_env` is the idiomatic constructor (mirrors the
/// `env::var(..).unwrap_or_else(..)` pattern used elsewhere in the crate);
/// `Config::default` is provided for tests that don't want to touch the
/// environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub shm_addr: String,
    pub msg_addr: String,
    pub qp_send_wrs: u32,
    pub qp_recv_wrs: u32,
    pub ping_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            shm_addr: DEFAULT_SHM_ADDR.to_string(),
            msg_addr: DEFAULT_MSG_ADDR.to_string(),
            qp_send_wrs: DEFAULT_QP_SEND_WRS,
            qp_recv_wrs: DEFAULT_QP_RECV_WRS,
            ping_timeout: Duration::from_millis(DEFAULT_PING_TIMEOUT_MS),
        }
    }
}

impl Config {
    pub fn from_env() -> Config {
        let defaults = Config::default();

        Config {
            shm_addr: env::var(SHM_ADDR_KEY).unwrap_or(defaults.shm_addr),
            msg_addr: env::var(MSG_ADDR_KEY).unwrap_or(defaults.msg_addr),
            qp_send_wrs: env::var(QP_SEND_WRS_KEY)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.qp_send_wrs),
            qp_recv_wrs: env::var(QP_RECV_WRS_KEY)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.qp_recv_wrs),
            ping_timeout: env::var(PING_TIMEOUT_KEY)
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.ping_timeout),
        }
    }
}
