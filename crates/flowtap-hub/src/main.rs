use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use flowtap_hub::config::{
    Config, DEFAULT_LISTEN_ADDR, DEFAULT_POLL_INTERVAL_MS, DEFAULT_TRACE_SOCKET,
    DEFAULT_WRITE_TIMEOUT_SECS,
};
use flowtap_hub::server::HubServer;
use tokio::sync::watch;
use tracing::error;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "flowtap-hub")]
struct Args {
    /// TCP address observers connect to, host:port.
    #[arg(long, default_value = "")]
    addr: String,

    /// Path of the tracing agent's Unix socket.
    #[arg(long, default_value = "")]
    trace_socket: String,

    /// Address advertised as this host's side of observed connections,
    /// host:port. Defaults to the listener's bound address.
    #[arg(long, default_value = "")]
    local_addr: String,

    /// Milliseconds between repeat polls for each observed connection.
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    poll_interval: u64,

    /// Seconds before a stalled observer write is abandoned.
    #[arg(long, default_value_t = DEFAULT_WRITE_TIMEOUT_SECS)]
    write_timeout: u64,

    #[arg(long, default_value_t = false)]
    debug: bool,

    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);

    let server = match HubServer::bind(config).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    if let Err(err) = server.serve(shutdown_rx).await {
        error!(event = "hub_error", error = %err);
    }
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        listen_addr: resolve_addr(&args.addr),
        trace_socket: PathBuf::from(resolve_trace_socket(&args.trace_socket)),
        local_addr: args.local_addr,
        poll_interval: Duration::from_millis(args.poll_interval),
        write_timeout: Duration::from_secs(args.write_timeout),
        debug: args.debug || env_true("FLOWTAP_HUB_DEBUG"),
        log_dir: resolve_log_dir(&args.log_dir),
    }
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Ok(value) = std::env::var("FLOWTAP_HUB_ADDR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    DEFAULT_LISTEN_ADDR.to_string()
}

fn resolve_trace_socket(socket_flag: &str) -> String {
    if !socket_flag.trim().is_empty() {
        return socket_flag.to_string();
    }
    if let Ok(value) = std::env::var("FLOWTAP_TRACE_SOCKET") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    DEFAULT_TRACE_SOCKET.to_string()
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    if let Ok(value) = std::env::var("FLOWTAP_LOG_DIR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    ".flowtap/logs".to_string()
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("FLOWTAP_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match open_log_file(&config.log_dir) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("flowtap-hub.log");
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

/// Writes every log line to stdout and, when a log file is open, to the
/// file as well. Failures on either sink are ignored; logging must never
/// take the hub down.
struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}
