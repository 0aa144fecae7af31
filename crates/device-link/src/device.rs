//! Typed client for the scanner/printer device server.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::warn;

use sorthub_protocol::constants::EventName;
use sorthub_protocol::envelope::Frame;
use sorthub_protocol::messages::{
    CameraError, CameraStatus, PrintQrRequest, PrintStatus, PrintSuccess, PrinterStatus,
    QrDetected, QrHistoryUpdated, StartCameraRequest, StatusMessage, SystemStatus, TestMessage,
};

use crate::dispatcher::Subscription;
use crate::error::{ConnectError, RequestError};
use crate::manager::ConnectionManager;
use crate::types::{ClientConfig, ConnectionInfo};

/// Device server client with one method per command and typed
/// subscriptions for pushed events.
#[derive(Clone)]
pub struct DeviceClient {
    link: Arc<ConnectionManager>,
    /// Name attached to test messages.
    sender: Option<String>,
}

impl DeviceClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_manager(Arc::new(ConnectionManager::new(config)))
    }

    pub fn with_manager(link: Arc<ConnectionManager>) -> Self {
        Self { link, sender: None }
    }

    /// Sets the name reported in `test_message` payloads.
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.link
    }

    pub async fn connect(&self, endpoint: &str) -> Result<(), ConnectError> {
        self.link.connect(endpoint).await
    }

    pub async fn disconnect(&self) {
        self.link.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.link.connection_info()
    }

    // -- commands ---------------------------------------------------------

    pub fn start_camera_stream(&self, camera_index: Option<u32>) -> Result<(), RequestError> {
        self.link.emit(
            EventName::StartCameraStream.as_str(),
            &StartCameraRequest { camera_index },
        )
    }

    pub fn stop_camera_stream(&self) -> Result<(), RequestError> {
        self.link
            .emit_frame(&Frame::bare(EventName::StopCameraStream))
    }

    pub fn get_system_status(&self) -> Result<(), RequestError> {
        self.link
            .emit_frame(&Frame::bare(EventName::GetSystemStatus))
    }

    pub fn check_printer_status(&self) -> Result<(), RequestError> {
        self.link
            .emit_frame(&Frame::bare(EventName::CheckPrinterStatus))
    }

    pub fn send_test_message(&self, text: &str) -> Result<(), RequestError> {
        self.link.emit(
            EventName::TestMessage.as_str(),
            &TestMessage {
                message: text.to_string(),
                sender: self.sender.clone(),
            },
        )
    }

    /// Prints a QR label and waits for the printer's verdict.
    ///
    /// Resolves on `print_success` for `order_number`; a `print_error`
    /// for it becomes [`RequestError::Remote`].
    pub async fn print_qr_code(
        &self,
        order_number: &str,
        qr_data: &str,
    ) -> Result<PrintSuccess, RequestError> {
        let request = PrintQrRequest {
            order_number: order_number.to_string(),
            qr_data: qr_data.to_string(),
            copies: None,
        };
        let reply = self
            .link
            .request(order_number, EventName::PrintQr.as_str(), &request)
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    // -- subscriptions ----------------------------------------------------

    /// Subscribes to `event` with payloads parsed as `T`. Payloads that do
    /// not parse are logged and skipped.
    pub fn on_typed<T, F>(&self, event: EventName, callback: F) -> Subscription
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.link.on(event.as_str(), move |payload| {
            match T::deserialize(payload) {
                Ok(parsed) => callback(parsed),
                Err(e) => warn!(event = %event, "skipping malformed payload: {e}"),
            }
        })
    }

    pub fn on_qr_detected(&self, f: impl Fn(QrDetected) + Send + Sync + 'static) -> Subscription {
        self.on_typed(EventName::QrDetected, f)
    }

    pub fn on_qr_history_updated(
        &self,
        f: impl Fn(QrHistoryUpdated) + Send + Sync + 'static,
    ) -> Subscription {
        self.on_typed(EventName::QrHistoryUpdated, f)
    }

    pub fn on_camera_status(
        &self,
        f: impl Fn(CameraStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.on_typed(EventName::CameraStatus, f)
    }

    pub fn on_camera_error(&self, f: impl Fn(CameraError) + Send + Sync + 'static) -> Subscription {
        self.on_typed(EventName::CameraError, f)
    }

    pub fn on_system_status(
        &self,
        f: impl Fn(SystemStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.on_typed(EventName::SystemStatus, f)
    }

    pub fn on_print_status(&self, f: impl Fn(PrintStatus) + Send + Sync + 'static) -> Subscription {
        self.on_typed(EventName::PrintStatus, f)
    }

    pub fn on_printer_status(
        &self,
        f: impl Fn(PrinterStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.on_typed(EventName::PrinterStatus, f)
    }

    pub fn on_status(&self, f: impl Fn(StatusMessage) + Send + Sync + 'static) -> Subscription {
        self.on_typed(EventName::Status, f)
    }

    pub fn off(&self, subscription: &Subscription) -> bool {
        self.link.off(subscription)
    }
}
