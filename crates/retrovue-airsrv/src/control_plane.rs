// crates/retrovue-airsrv/src/control_plane.rs
//
// ControlPlaneAdapter: turns a Command into calls against the Engine and a
// Response. The wire transport is deliberately minimal — newline-delimited
// JSON over a TCP listener — since a production RPC stack (gRPC, auth,
// streaming) is the out-of-scope external surface named in spec.md §1;
// only the dispatch logic and the shape of the stub protocol are in scope
// (SPEC_FULL.md §4.8).

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;

use retrovue_core::{Command, PlayoutError, Response, API_VERSION};
use retrovue_playout::{MpegTsSink, MpegTsSinkConfig, Renderer, StubEncoder, DEFAULT_TCP_PORT};

use crate::engine::Engine;

pub struct ControlPlaneAdapter {
    engine: Arc<Engine>,
    ts_socket_template: Option<String>,
}

impl ControlPlaneAdapter {
    pub fn new(engine: Arc<Engine>, ts_socket_template: Option<String>) -> Self {
        ControlPlaneAdapter {
            engine,
            ts_socket_template,
        }
    }

    /// `AIR_TS_SOCKET_PATH` (or an explicit `uds_path` on `StartChannel`)
    /// selects Unix domain socket transport; otherwise the sink binds TCP
    /// (spec.md §4.5's default transport).
    fn resolve_ts_socket(&self, channel_id: i32, uds_path: Option<String>) -> Option<String> {
        uds_path.or_else(|| {
            self.ts_socket_template
                .as_ref()
                .map(|template| template.replace("%d", &channel_id.to_string()))
        })
    }

    fn build_renderer(&self, channel_id: i32, port: i32, uds_path: Option<String>) -> Renderer {
        let config = MpegTsSinkConfig {
            ts_socket_path: self.resolve_ts_socket(channel_id, uds_path),
            // `port: 0` asks the OS for an ephemeral port, same as binding
            // any other TCP listener — callers that want the documented
            // default pass `DEFAULT_TCP_PORT` explicitly (spec.md §4.5).
            port: u16::try_from(port).unwrap_or(DEFAULT_TCP_PORT),
            ..MpegTsSinkConfig::default()
        };
        match MpegTsSink::bind(config, Box::new(StubEncoder::new())) {
            Ok(sink) => Renderer::MpegTs(sink),
            Err(reason) => {
                tracing::warn!(channel_id, %reason, "failed to bind ts sink, falling back to headless");
                Renderer::Headless
            }
        }
    }

    pub fn dispatch(&self, command: Command) -> Response {
        match self.handle(command) {
            Ok(response) => response,
            Err(err) => Response::from_error(&err),
        }
    }

    fn handle(&self, command: Command) -> Result<Response, PlayoutError> {
        match command {
            Command::StartChannel {
                channel_id,
                plan_handle,
                port,
                uds_path,
                initial_asset,
            } => {
                let renderer = self.build_renderer(channel_id, port, uds_path);
                let initial = initial_asset.map(|asset_id| (PathBuf::from(&asset_id), asset_id));
                self.engine.start_channel(channel_id, renderer, initial)?;
                Ok(Response::StartChannel {
                    success: true,
                    message: format!("channel {channel_id} started with plan '{plan_handle}'"),
                })
            }
            Command::UpdatePlan { channel_id, plan_handle } => {
                if !self.engine.channel_exists(channel_id) {
                    return Err(PlayoutError::NotFound { channel_id });
                }
                Ok(Response::UpdatePlan {
                    success: true,
                    message: format!("channel {channel_id} plan updated to '{plan_handle}'"),
                })
            }
            Command::StopChannel { channel_id } => {
                self.engine.stop_channel(channel_id)?;
                Ok(Response::StopChannel {
                    success: true,
                    message: format!("channel {channel_id} stopped"),
                })
            }
            Command::LoadPreview {
                channel_id,
                path,
                asset_id,
            } => {
                let shadow_decode_started = self
                    .engine
                    .load_preview(channel_id, Some(PathBuf::from(path)), asset_id.clone())?;
                Ok(Response::LoadPreview {
                    success: true,
                    message: format!("preview loaded for asset '{asset_id}'"),
                    shadow_decode_started,
                })
            }
            Command::SwitchToLive { channel_id, asset_id } => {
                let (pts_contiguous, live_start_pts) = self.engine.switch_to_live(channel_id, &asset_id)?;
                Ok(Response::SwitchToLive {
                    success: true,
                    message: format!("channel {channel_id} switched to asset '{asset_id}'"),
                    pts_contiguous,
                    live_start_pts,
                })
            }
            Command::GetVersion => Ok(Response::GetVersion {
                version: API_VERSION.to_string(),
            }),
        }
    }
}

/// Blocking accept loop for the newline-delimited JSON stub transport. Each
/// connection is handled to completion on its own thread; the protocol is
/// one Command per line in, one Response per line out, until the client
/// disconnects.
pub fn serve(listener: TcpListener, adapter: Arc<ControlPlaneAdapter>) {
    for incoming in listener.incoming() {
        match incoming {
            Ok(stream) => {
                let adapter = adapter.clone();
                std::thread::spawn(move || handle_connection(stream, adapter));
            }
            Err(err) => tracing::warn!(%err, "control plane accept failed"),
        }
    }
}

fn handle_connection(stream: TcpStream, adapter: Arc<ControlPlaneAdapter>) {
    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
    let reader = BufReader::new(stream.try_clone().expect("clone control stream"));
    let mut writer = stream;
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Command>(&line) {
            Ok(command) => adapter.dispatch(command),
            Err(err) => Response::Error {
                kind: "Internal".to_string(),
                message: format!("malformed command: {err}"),
            },
        };
        let Ok(mut json) = serde_json::to_string(&response) else {
            continue;
        };
        json.push('\n');
        if writer.write_all(json.as_bytes()).is_err() {
            break;
        }
    }
    tracing::debug!(peer, "control plane connection closed");
}
