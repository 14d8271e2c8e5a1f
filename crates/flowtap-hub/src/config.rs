use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_TRACE_SOCKET: &str = "/var/run/tcptrace.sock";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 3000;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 2;

#[derive(Clone, Debug)]
pub struct Config {
    /// TCP address observers connect to.
    pub listen_addr: String,
    /// Filesystem path of the tracing agent's Unix socket.
    pub trace_socket: PathBuf,
    /// Address and port advertised as this host's side of every observed
    /// connection. Empty means use the listener's bound address.
    pub local_addr: String,
    pub poll_interval: Duration,
    pub write_timeout: Duration,
    pub debug: bool,
    pub log_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            trace_socket: PathBuf::from(DEFAULT_TRACE_SOCKET),
            local_addr: String::new(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            debug: false,
            log_dir: String::new(),
        }
    }
}
