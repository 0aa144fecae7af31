//! Subcommand implementations.

use anyhow::Context;
use tracing::{info, warn};

use sorthub_device_link::{ConnectionEvent, DeviceClient};
use sorthub_protocol::SystemStatus;
use sorthub_protocol::constants::EventName;

use crate::config::MonitorConfig;

async fn connect(config: &MonitorConfig) -> anyhow::Result<DeviceClient> {
    let client =
        DeviceClient::new(config.client_config()).with_sender(config.station_name.clone());
    client
        .connect(&config.device_endpoint)
        .await
        .with_context(|| format!("connecting to {}", config.device_endpoint))?;
    Ok(client)
}

/// Logs every pushed event until Ctrl-C or until reconnecting gives up.
pub async fn watch(config: &MonitorConfig) -> anyhow::Result<()> {
    let client = connect(config).await?;
    let link = client.manager();
    let mut events = link
        .take_events()
        .await
        .context("event channel already taken")?;

    for name in EventName::INBOUND {
        link.on(name.as_str(), move |payload| {
            info!(event = %name, %payload, "device event");
        });
    }
    link.on(EventName::Disconnect.as_str(), |payload| {
        warn!(%payload, "device server disconnected");
    });
    link.on(EventName::Connect.as_str(), |payload| {
        info!(%payload, "device server connected");
    });

    client.get_system_status()?;
    client.check_printer_status()?;

    let result = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for Ctrl-C")?;
                info!("interrupted, disconnecting");
                break Ok(());
            }
            event = events.recv() => match event {
                Some(ConnectionEvent::ReconnectFailed { attempts }) => {
                    break Err(anyhow::anyhow!(
                        "device server unreachable after {attempts} attempts"
                    ));
                }
                Some(ConnectionEvent::Reconnecting { attempt, next_retry_secs }) => {
                    info!(attempt, next_retry_secs, "waiting to reconnect");
                }
                Some(ConnectionEvent::StateChanged(_)) => {}
                None => break Ok(()),
            },
        }
    };

    client.disconnect().await;
    result
}

/// Prints a QR label and reports the printer's verdict.
pub async fn print(config: &MonitorConfig, order_number: &str, qr_data: &str) -> anyhow::Result<()> {
    let client = connect(config).await?;
    let result = client.print_qr_code(order_number, qr_data).await;
    client.disconnect().await;

    let success = result.with_context(|| format!("printing order {order_number}"))?;
    info!(order = %success.order_number, "label printed");
    println!(
        "{}: {}",
        success.order_number,
        success.message.as_deref().unwrap_or("printed")
    );
    Ok(())
}

/// Requests a system status snapshot and prints it as JSON.
pub async fn status(config: &MonitorConfig) -> anyhow::Result<()> {
    let client = connect(config).await?;

    let reply = client
        .manager()
        .wait_for(EventName::SystemStatus.as_str(), config.request_timeout());
    let result = match client.get_system_status() {
        Ok(()) => reply.await.context("waiting for system status"),
        Err(e) => Err(e).context("requesting system status"),
    };
    client.disconnect().await;

    let status: SystemStatus =
        serde_json::from_value(result?).context("malformed system status")?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
