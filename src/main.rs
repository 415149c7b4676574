use std::{
    process,
    sync::{Arc, OnceLock},
};

use devicelink::{config::Config, logger::LoggerManager, print_error, reporter::Reporter};
use devicelink_mqtt::{Device, DeviceEvent};
use tracing::{debug, error, info, warn};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config();
    let mut logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting devicelink version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.device);

    let (device, mut events) =
        Device::new(cfg.identity.clone(), cfg.device.clone()).unwrap_or_else(|e| {
            error!("Failed to create device: {}", e);
            process::exit(1);
        });
    let device = Arc::new(device);

    info!(
        "Connecting device {} to {}:{}",
        device.device_id(),
        cfg.device.resolve_host(),
        cfg.device.resolve_port()
    );
    device.connect().await.unwrap_or_else(|e| {
        error!("Failed to connect: {}", e);
        process::exit(1);
    });

    let reporter = tokio::spawn(Reporter::new(device.clone(), cfg.report.clone()).run());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(DeviceEvent::Connect) => info!("Device connected"),
                Some(DeviceEvent::Reconnect) => info!("Device reconnected"),
                Some(DeviceEvent::Close(None)) => info!("Connection closed"),
                Some(DeviceEvent::Close(Some(reason))) => warn!("Connection closed: {}", reason),
                Some(DeviceEvent::Command(command)) => info!("Command received: {}", command),
                Some(DeviceEvent::Fault(reason)) => {
                    error!("Unrecoverable device failure: {}", reason);
                    reporter.abort();
                    process::exit(1);
                }
                None => {
                    error!("Device stopped unexpectedly");
                    process::exit(1);
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
                reporter.abort();
                if let Err(e) = device.close() {
                    debug!("Close failed: {}", e);
                }
                tokio::time::sleep(tokio::time::Duration::from_millis(300)).await;
                info!("Shutdown complete");
                break;
            }
        }
    }
    Ok(())
}
