use std::{
    process,
    sync::{Arc, OnceLock},
};

use mqttlink::{bridge::HostBridge, config::Config, logger::LoggerManager, print_error};
use mqttlink_session::{ClientManager, RumqttcEngineFactory};
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

fn log_clients_table(cfg: &Config) {
    let id_width = cfg
        .clients
        .iter()
        .map(|c| c.session.client_id.len())
        .max()
        .unwrap_or(10)
        .max("Client".len());

    info!("{:<width$} | Broker", "Client", width = id_width);
    info!("{}-+-{}", "-".repeat(id_width), "-".repeat(24));
    for client in &cfg.clients {
        let session = &client.session;
        let scheme = match (session.web_socket.use_web_socket, session.enable_ssl_config) {
            (true, true) => "wss",
            (true, false) => "ws",
            (false, true) => "mqtts",
            (false, false) => "mqtt",
        };
        info!(
            "{:<width$} | {}://{}:{}",
            session.client_id,
            scheme,
            session.host,
            session.port,
            width = id_width
        );
    }
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
    info!("Starting mqttlink version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);

    if cfg.clients.is_empty() {
        warn!("No clients configured");
    }
    log_clients_table(cfg);

    let mut manager = ClientManager::new(
        Arc::new(RumqttcEngineFactory::default()),
        Arc::new(HostBridge::logging()),
    );

    for entry in &cfg.clients {
        let client = match manager.create(&entry.session) {
            Ok(client) => client,
            Err(e) => {
                error!("Failed to create client '{}': {}", entry.session.client_id, e);
                continue;
            }
        };
        debug!("{:#?}", client.identity());

        for subscription in &entry.subscriptions {
            if let Err(e) =
                client.subscribe(subscription.subscriber_id(), &subscription.topic, subscription.qos)
            {
                error!("Failed to subscribe to '{}': {}", subscription.topic, e);
            }
        }
        if let Err(e) = client.connect(entry.session.connection_options()) {
            error!("Failed to connect client '{}': {}", client.client_id(), e);
        }
    }

    info!("{} client(s) running", manager.len());
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, initiating graceful shutdown...");

    manager.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}
