// crates/retrovue-core/src/commands.rs
//
// Every external request the control plane accepts is expressed as a
// Command; every reply as a Response. Mirrors the teacher's
// EditorCommand-per-user-action convention (velocut_core::commands), but
// carries request/response pairs across a process boundary instead of
// driving an in-process UI event loop — so both sides derive Serialize /
// Deserialize for the stub transport (SPEC_FULL.md §4.8).

use serde::{Deserialize, Serialize};

use crate::error::PlayoutError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    StartChannel {
        channel_id: i32,
        plan_handle: String,
        port: i32,
        uds_path: Option<String>,
        /// Compat path (spec.md §9): if set, the adapter synthesizes an
        /// internal LoadPreview + SwitchToLive pair for this asset once the
        /// channel reaches Ready, instead of requiring a separate call.
        initial_asset: Option<String>,
    },
    UpdatePlan {
        channel_id: i32,
        plan_handle: String,
    },
    StopChannel {
        channel_id: i32,
    },
    LoadPreview {
        channel_id: i32,
        path: String,
        asset_id: String,
    },
    SwitchToLive {
        channel_id: i32,
        asset_id: String,
    },
    GetVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    StartChannel {
        success: bool,
        message: String,
    },
    UpdatePlan {
        success: bool,
        message: String,
    },
    StopChannel {
        success: bool,
        message: String,
    },
    LoadPreview {
        success: bool,
        message: String,
        shadow_decode_started: bool,
    },
    SwitchToLive {
        success: bool,
        message: String,
        pts_contiguous: bool,
        live_start_pts: i64,
    },
    GetVersion {
        version: String,
    },
    Error {
        kind: String,
        message: String,
    },
}

/// Baseline API version (spec.md §6.1). Bump on any schema-incompatible
/// change to Command/Response.
pub const API_VERSION: &str = "1.0.0";

impl Response {
    pub fn from_error(err: &PlayoutError) -> Response {
        Response::Error {
            kind: err.kind_name().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_roundtrips_through_json() {
        let cmd = Command::StartChannel {
            channel_id: 1,
            plan_handle: "plan-a".into(),
            port: 9000,
            uds_path: None,
            initial_asset: Some("asset-1".into()),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        let back: Command = serde_json::from_str(&json).unwrap();
        matches!(back, Command::StartChannel { .. });
    }

    #[test]
    fn error_response_carries_kind_name() {
        let err = PlayoutError::NotFound { channel_id: 4 };
        let resp = Response::from_error(&err);
        match resp {
            Response::Error { kind, .. } => assert_eq!(kind, "NotFound"),
            _ => panic!("expected Error response"),
        }
    }
}
