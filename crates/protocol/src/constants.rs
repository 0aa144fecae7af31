use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time allowed for the WebSocket handshake of a single connect attempt.
pub const WS_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Time to wait for a pong response (or any incoming message).
///
/// This acts as a read deadline: if *nothing* arrives within this window
/// (no pong, no reply, no push event), the session is considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(20);

/// How often to send pings (must be well under [`WS_PONG_WAIT`]).
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Maximum message size in bytes (1 MiB). Camera frames are not carried
/// on this channel, only control events.
pub const WS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default timeout for correlated request/reply operations.
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the outbound frame queue feeding the write pump.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Path appended to bare `host:port` endpoints.
pub const DEFAULT_WS_PATH: &str = "/ws";

/// Payload field carrying the correlation key in print replies.
pub const ORDER_NUMBER_FIELD: &str = "order_number";

/// Named event identifier.
///
/// Covers every event the device-control server knows about plus the
/// local lifecycle events raised by the client itself. Unknown names
/// deserialize to [`EventName::Unknown`]; the raw name is still carried
/// by the frame and routed by string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventName {
    // Commands from dashboard to device server
    #[serde(rename = "start_camera_stream")]
    StartCameraStream,
    #[serde(rename = "stop_camera_stream")]
    StopCameraStream,
    #[serde(rename = "get_system_status")]
    GetSystemStatus,
    #[serde(rename = "print_qr")]
    PrintQr,
    #[serde(rename = "check_printer_status")]
    CheckPrinterStatus,
    #[serde(rename = "test_message")]
    TestMessage,

    // Events pushed by the device server
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "camera_status")]
    CameraStatus,
    #[serde(rename = "camera_error")]
    CameraError,
    #[serde(rename = "qr_detected")]
    QrDetected,
    #[serde(rename = "qr_history_updated")]
    QrHistoryUpdated,
    #[serde(rename = "system_status")]
    SystemStatus,
    #[serde(rename = "print_status")]
    PrintStatus,
    #[serde(rename = "print_success")]
    PrintSuccess,
    #[serde(rename = "print_error")]
    PrintError,
    #[serde(rename = "printer_status")]
    PrinterStatus,

    // Local lifecycle events, never sent on the wire
    #[serde(rename = "connect")]
    Connect,
    #[serde(rename = "disconnect")]
    Disconnect,
    #[serde(rename = "connect_error")]
    ConnectError,
    #[serde(rename = "reconnect_attempt")]
    ReconnectAttempt,
    #[serde(rename = "reconnect_failed")]
    ReconnectFailed,

    /// Forward compatibility: unknown event names deserialize here.
    #[serde(other)]
    Unknown,
}

impl EventName {
    /// Events the device server pushes to the dashboard.
    pub const INBOUND: [EventName; 10] = [
        EventName::Status,
        EventName::CameraStatus,
        EventName::CameraError,
        EventName::QrDetected,
        EventName::QrHistoryUpdated,
        EventName::SystemStatus,
        EventName::PrintStatus,
        EventName::PrintSuccess,
        EventName::PrintError,
        EventName::PrinterStatus,
    ];

    /// Events the dashboard sends to the device server.
    pub const OUTBOUND: [EventName; 6] = [
        EventName::StartCameraStream,
        EventName::StopCameraStream,
        EventName::GetSystemStatus,
        EventName::PrintQr,
        EventName::CheckPrinterStatus,
        EventName::TestMessage,
    ];

    /// Wire name of the event.
    pub const fn as_str(self) -> &'static str {
        match self {
            EventName::StartCameraStream => "start_camera_stream",
            EventName::StopCameraStream => "stop_camera_stream",
            EventName::GetSystemStatus => "get_system_status",
            EventName::PrintQr => "print_qr",
            EventName::CheckPrinterStatus => "check_printer_status",
            EventName::TestMessage => "test_message",
            EventName::Status => "status",
            EventName::CameraStatus => "camera_status",
            EventName::CameraError => "camera_error",
            EventName::QrDetected => "qr_detected",
            EventName::QrHistoryUpdated => "qr_history_updated",
            EventName::SystemStatus => "system_status",
            EventName::PrintStatus => "print_status",
            EventName::PrintSuccess => "print_success",
            EventName::PrintError => "print_error",
            EventName::PrinterStatus => "printer_status",
            EventName::Connect => "connect",
            EventName::Disconnect => "disconnect",
            EventName::ConnectError => "connect_error",
            EventName::ReconnectAttempt => "reconnect_attempt",
            EventName::ReconnectFailed => "reconnect_failed",
            EventName::Unknown => "unknown",
        }
    }

    /// Looks up a wire name. Returns [`EventName::Unknown`] for anything
    /// outside the catalogue.
    pub fn from_wire(name: &str) -> Self {
        serde_json::from_value(serde_json::Value::String(name.to_string()))
            .unwrap_or(EventName::Unknown)
    }

    /// Returns `true` for lifecycle events raised locally by the client.
    pub const fn is_local(self) -> bool {
        matches!(
            self,
            EventName::Connect
                | EventName::Disconnect
                | EventName::ConnectError
                | EventName::ReconnectAttempt
                | EventName::ReconnectFailed
        )
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AsRef<str> for EventName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl From<EventName> for String {
    fn from(name: EventName) -> Self {
        name.as_str().to_string()
    }
}
