//! Connects to every USB serial instrument it finds, asks each one to
//! describe itself, and prints what comes back.
//!
//! Run with `cargo run -p labwire-devices --example host_monitor`.

use std::time::{Duration, Instant};

use labwire_core::config::ConfigBuilder;
use labwire_core::message::Message;
use labwire_devices::{DeviceEvent, DeviceManager};
use serde_json::json;
use tracing::info;

fn main() -> anyhow::Result<()> {
    let config = ConfigBuilder::new().with_environment_prefix("labwire").build()?;
    labwire_core::logging::init_from_config(&config.logging)?;

    let mut manager = DeviceManager::new(config.manager.clone(), config.postman.clone());

    let ports = manager.scan_for_devices()?;
    if ports.is_empty() {
        info!("No instruments found");
        return Ok(());
    }

    for port in &ports {
        if manager.connect_device(&port.port, port.vid, port.pid) {
            for func in ["help", "get_info"] {
                manager.send_message(&port.port, &Message::instruction("host", func, json!({})))?;
            }
        }
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let Some(event) = manager.next_event(Duration::from_millis(100)) else {
            continue;
        };
        match &event {
            DeviceEvent::Recv { port, message } => {
                info!("[{}] {} {} {}", port, message.subsystem_name(), message.status(), message.payload())
            }
            DeviceEvent::Raw { port, raw } => info!("[{}] raw: {}", port, raw),
            DeviceEvent::Error { port, detail } => info!("[{}] listener stopped: {}", port, detail),
        }
        manager.apply_event(&event);
    }

    for device in manager.devices() {
        info!(
            "{}: {} {} ({} commands)",
            device.info(),
            device.firmware_name.as_deref().unwrap_or("?"),
            device.firmware_version.as_deref().unwrap_or("?"),
            device.commands.len()
        );
    }

    manager.disconnect_all();
    Ok(())
}
