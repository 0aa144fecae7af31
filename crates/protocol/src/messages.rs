use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Command payloads
// ---------------------------------------------------------------------------

/// Asks the device server to print a QR label for an order.
///
/// `order_number` doubles as the correlation key of the reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintQrRequest {
    pub order_number: String,
    pub qr_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copies: Option<u32>,
}

/// Starts the scanner camera stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartCameraRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_index: Option<u32>,
}

/// Free-text diagnostic message echoed back by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestMessage {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

// ---------------------------------------------------------------------------
// Push payloads
// ---------------------------------------------------------------------------

/// Generic server status line (`status` event).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub message: String,
}

/// Camera stream state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraStatus {
    pub streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Camera failure report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraError {
    #[serde(alias = "message")]
    pub error: String,
}

/// A QR code decoded by the scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QrDetected {
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// Updated list of recently scanned codes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QrHistoryUpdated {
    #[serde(default)]
    pub history: Vec<QrDetected>,
}

/// Snapshot of device subsystems (camera, printer, CPU, ...).
///
/// The server reports an open set of components, so the payload is kept
/// as a sorted map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SystemStatus(pub BTreeMap<String, serde_json::Value>);

impl SystemStatus {
    /// Returns the reported value of one component, if present.
    pub fn component(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.get(name)
    }
}

/// Progress of a print job that is still running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_number: Option<String>,
    pub status: String,
}

/// Successful completion of a `print_qr` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintSuccess {
    pub order_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Failure of a `print_qr` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintError {
    pub order_number: String,
    #[serde(alias = "message")]
    pub error: String,
}

/// Label printer connectivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterStatus {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub printer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
