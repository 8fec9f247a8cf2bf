// crates/retrovue-airsrv/src/main.rs
//
// retrovue-airsrv: the playout process. Parses a handful of CLI flags and
// environment variables, wires up the shared MasterClock/MetricsStore and
// Engine, then blocks serving the control-plane and metrics listeners on
// the main thread — every other piece of work (decode, render, mux,
// orchestration) runs on the background threads those pieces already spawn.

mod control_plane;
mod engine;
mod metrics_http;

use std::net::TcpListener;
use std::sync::Arc;

use retrovue_core::clock::RealClock;
use retrovue_core::metrics::MetricsStore;

use control_plane::ControlPlaneAdapter;
use engine::Engine;

struct CliArgs {
    address: String,
    port: u16,
    metrics_port: u16,
}

/// Default control-plane RPC port (spec.md §6.4).
const DEFAULT_PORT: u16 = 50051;
/// Default Prometheus metrics port (spec.md §6.4); independent of the
/// control-plane port rather than derived from it.
const DEFAULT_METRICS_PORT: u16 = 9308;

/// Splits `--address`'s value into host/port, matching spec.md §6.4's
/// `--address <host:port>` (port overrides `--port`/the default). A value
/// with no `:` is treated as a bare host with the port left unchanged, so
/// `--address 0.0.0.0` still works without requiring a port suffix.
fn split_host_port(address: &str, default_port: u16) -> (String, u16) {
    match address.rsplit_once(':') {
        Some((host, port_str)) => match port_str.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (address.to_string(), default_port),
        },
        None => (address.to_string(), default_port),
    }
}

fn parse_args() -> Option<CliArgs> {
    let mut address = "127.0.0.1".to_string();
    let mut port = DEFAULT_PORT;
    let mut metrics_port = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--address" => {
                address = args.next().unwrap_or_else(|| {
                    eprintln!("--address requires a value");
                    std::process::exit(2);
                });
            }
            "--port" => {
                let value = args.next().unwrap_or_else(|| {
                    eprintln!("--port requires a value");
                    std::process::exit(2);
                });
                port = value.parse().unwrap_or_else(|_| {
                    eprintln!("--port must be a number, got '{value}'");
                    std::process::exit(2);
                });
            }
            "--metrics-port" => {
                let value = args.next().unwrap_or_else(|| {
                    eprintln!("--metrics-port requires a value");
                    std::process::exit(2);
                });
                metrics_port = Some(value.parse().unwrap_or_else(|_| {
                    eprintln!("--metrics-port must be a number, got '{value}'");
                    std::process::exit(2);
                }));
            }
            "--help" | "-h" => return None,
            other => {
                eprintln!("unrecognized argument: {other}");
                std::process::exit(2);
            }
        }
    }
    let (host, port) = split_host_port(&address, port);
    Some(CliArgs {
        address: host,
        port,
        metrics_port: metrics_port.unwrap_or(DEFAULT_METRICS_PORT),
    })
}

fn print_help() {
    println!(
        "retrovue-airsrv [--address <host>[:<port>]] [--port <port>] [--metrics-port <port>]\n\n\
         Defaults: --port {DEFAULT_PORT} (control plane), --metrics-port {DEFAULT_METRICS_PORT}\n\n\
         Environment variables:\n  \
         AIR_FAKE_VIDEO=1          force the stub decoder/encoder path for every channel\n  \
         AIR_TS_SOCKET_PATH=<tpl>  Unix socket path template for MPEG-TS sinks (overrides the TCP default); %d is replaced with the channel id\n\n\
         Each channel's MPEG-TS sink binds TCP on the port given in its StartChannel\n\
         command (default 9000) unless AIR_TS_SOCKET_PATH selects a Unix domain socket.\n"
    );
}

fn main() {
    let Some(args) = parse_args() else {
        print_help();
        return;
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if std::env::var("AIR_FAKE_VIDEO").ok().as_deref() == Some("1") {
        tracing::info!("AIR_FAKE_VIDEO=1: every channel will use the stub decode/encode path");
    }
    let ts_socket_template = std::env::var("AIR_TS_SOCKET_PATH").ok();

    let clock = Arc::new(RealClock::new());
    let metrics = Arc::new(MetricsStore::new());
    let engine = Arc::new(Engine::new(clock, metrics.clone()));
    let adapter = Arc::new(ControlPlaneAdapter::new(engine.clone(), ts_socket_template));

    let control_listener = match TcpListener::bind((args.address.as_str(), args.port)) {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, address = %args.address, port = args.port, "failed to bind control-plane listener");
            std::process::exit(1);
        }
    };
    tracing::info!(address = %args.address, port = args.port, "control plane listening");

    let metrics_listener = match TcpListener::bind((args.address.as_str(), args.metrics_port)) {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, address = %args.address, port = args.metrics_port, "failed to bind metrics listener");
            std::process::exit(1);
        }
    };
    tracing::info!(address = %args.address, port = args.metrics_port, "metrics listening");

    std::thread::spawn(move || metrics_http::serve(metrics_listener, metrics));
    control_plane::serve(control_listener, adapter);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_address_overrides_default_port() {
        assert_eq!(split_host_port("0.0.0.0:50051", 7), ("0.0.0.0".to_string(), 50051));
    }

    #[test]
    fn bare_host_address_keeps_default_port() {
        assert_eq!(split_host_port("0.0.0.0", 50051), ("0.0.0.0".to_string(), 50051));
    }

    #[test]
    fn unparseable_port_suffix_falls_back_to_default() {
        assert_eq!(
            split_host_port("not:a:port", 50051),
            ("not:a:port".to_string(), 50051)
        );
    }
}
