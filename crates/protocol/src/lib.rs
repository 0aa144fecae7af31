pub mod constants;
pub mod envelope;
pub mod messages;

// Re-export primary types for convenience.
pub use constants::EventName;
pub use envelope::{Frame, FrameError};
pub use messages::{
    CameraError, CameraStatus, PrintError, PrintQrRequest, PrintStatus, PrintSuccess,
    PrinterStatus, QrDetected, QrHistoryUpdated, StartCameraRequest, StatusMessage,
    SystemStatus, TestMessage,
};
