use std::{env, sync::Arc};

use devicelink_mqtt::{Device, DeviceConfig, DeviceEvent, DeviceIdentity};
use serde::Serialize;
use tokio::{signal, time::Duration};
use tracing::{error, info, warn};

#[derive(Serialize, Debug)]
struct SensorReading {
    temperature: f32,
    humidity: f32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Credentials come from the environment, e.g.
    // DEVICE_ID=... DEVICE_KEY=... DEVICE_SECRET=... BROKER_HOST=localhost
    let identity = DeviceIdentity::new(
        env::var("DEVICE_ID").unwrap_or_default(),
        env::var("DEVICE_KEY").unwrap_or_default(),
        env::var("DEVICE_SECRET").unwrap_or_default(),
    )?;
    let config = DeviceConfig {
        host: env::var("BROKER_HOST").ok(),
        secure: env::var("BROKER_INSECURE").is_err(),
        ..Default::default()
    };

    let (device, mut events) = Device::new(identity, config)?;
    let device = Arc::new(device);
    device.connect().await?;
    info!("Connecting, commands arrive on {}", device.command_topic());

    // Readings are queued while offline and flushed on (re)connect
    let reporter = {
        let device = device.clone();
        tokio::spawn(async move {
            let mut counter = 0u32;
            loop {
                let reading = SensorReading {
                    temperature: 20.0 + counter as f32 * 0.5,
                    humidity: 50.0 + (counter % 20) as f32,
                };
                if let Err(e) = device.send_state(&reading) {
                    error!("Failed to send state: {}", e);
                    return;
                }
                counter += 1;
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        })
    };

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(DeviceEvent::Connect) => info!("Connected"),
                Some(DeviceEvent::Reconnect) => info!("Reconnected"),
                Some(DeviceEvent::Command(command)) => info!("Command: {}", command),
                Some(DeviceEvent::Close(reason)) => warn!("Connection closed: {:?}", reason),
                Some(DeviceEvent::Fault(reason)) => {
                    error!("Giving up: {}", reason);
                    break;
                }
                None => break,
            },
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal");
                device.close()?;
                break;
            }
        }
    }

    reporter.abort();
    Ok(())
}
