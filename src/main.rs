use std::path::PathBuf;

use color_eyre::{eyre::eyre, Result};
use devicelink::config::DeviceConfig;
use devicelink::protocol::model::{
    Command, CommandOutcome, DeviceMessage, PropertiesSetRequest, PropertyQueryRequest,
    ServiceProperty,
};
use devicelink::{DeviceHandlers, IotDevice};
use serde_json::json;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    info!("Loading device configuration from {}", path.display());
    let config = DeviceConfig::load(&path).await?;

    let device = IotDevice::new(config, logging_handlers())?;
    if !device.connect().await {
        return Err(eyre!("Could not connect {}", device.device_id()));
    }
    info!("Device {} online, press Ctrl-C to stop", device.device_id());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    if !device.disconnect().await {
        warn!("Session did not close cleanly");
    }
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

fn default_config_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    });
    home.join(".config").join("devicelink").join("device.toml")
}

/// Handlers that only log what the platform sends
fn logging_handlers() -> DeviceHandlers {
    DeviceHandlers::new()
        .with_command_handler(|command: &Command| {
            info!(
                "Command {}/{}: {}",
                command.service_id, command.command_name, command.paras
            );
            CommandOutcome::success(json!({}))
        })
        .with_message_handler(|message: &DeviceMessage| {
            info!("Message received: {}", message.content);
        })
        .with_properties_set_handler(|request: &PropertiesSetRequest| {
            for service in &request.services {
                info!("Set {}: {:?}", service.service_id, service.properties);
            }
            true
        })
        .with_property_query_handler(|request: &PropertyQueryRequest| {
            info!("Property query for {}", request.service_id);
            ServiceProperty {
                service_id: request.service_id.clone(),
                ..ServiceProperty::default()
            }
        })
}
