//! Bridge daemon: poll the Hue hub, resolve configured actions and drive
//! Govee, WLED, Switchbot and Twinkly devices.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use huesync::brightness::BrightnessCache;
use huesync::config::Configuration;
use huesync::dispatch::Dispatcher;
use huesync::events::EventQueues;
use huesync::govee::GoveeRegistry;
use huesync::hub::{self, HubPoller, HueBridge};
use huesync::resolver::ActionResolver;
use huesync::senders::{SwitchbotSender, TwinklySender, WledSender};
use huesync::server;
use huesync::status::StatusStore;

const EVENT_QUEUE_CAPACITY: usize = 64;

#[derive(Parser)]
#[command(name = "huesync")]
#[command(about = "Mirror Philips Hue activity onto Govee, WLED, Switchbot and Twinkly devices", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "configuration.json")]
    config: PathBuf,

    /// Address of the status endpoint
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let configuration = match Configuration::load(&cli.config) {
        Ok(configuration) => Arc::new(configuration),
        Err(err) => {
            error!("cannot load configuration from {}: {err}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };

    let status = Arc::new(StatusStore::new());
    for device in configuration.required_govee_devices() {
        status.register(&device, "govee");
    }
    for alias in configuration.switchbot_aliases() {
        status.register(&alias, "switchbot");
    }
    for alias in configuration.wled_aliases() {
        status.register(&alias, "wled");
    }
    for alias in configuration.twinkly_aliases() {
        status.register(&alias, "twinkly");
    }

    let brightness = Arc::new(BrightnessCache::new());
    let (queues, receivers) = EventQueues::bounded(EVENT_QUEUE_CAPACITY);

    let govee = GoveeRegistry::new(Arc::clone(&configuration));
    let twinkly = TwinklySender::new(&configuration);
    let switchbot = Arc::new(SwitchbotSender::new(&configuration));
    let wled = match WledSender::new(&configuration) {
        Ok(wled) => Arc::new(wled),
        Err(err) => {
            error!("cannot build WLED client: {err}");
            return ExitCode::FAILURE;
        }
    };

    let resolver = ActionResolver::new(
        Arc::clone(&configuration),
        Arc::clone(&status),
        Arc::clone(&brightness),
    );
    let dispatcher = Dispatcher::new(
        resolver,
        Arc::clone(&govee),
        Arc::clone(&twinkly),
        switchbot,
        wled,
    );

    let cancel = CancellationToken::new();
    let mut tasks = dispatcher.start(receivers, &cancel);

    tasks.push(tokio::spawn({
        let govee = Arc::clone(&govee);
        let cancel = cancel.clone();
        async move {
            if let Err(err) = govee.run(cancel).await {
                error!("Govee discovery could not start: {err}");
            }
        }
    }));

    tasks.push(tokio::spawn(Arc::clone(&twinkly).run(cancel.clone())));

    let poller = HubPoller::new(
        HueBridge::new(&configuration.bridge_ip, &configuration.bridge_username),
        Arc::clone(&configuration),
        brightness,
        queues,
    );
    tasks.push(tokio::spawn(poller.run(cancel.clone())));

    tasks.push(tokio::spawn(hub::run_sensor_inventory(
        HueBridge::new(&configuration.bridge_ip, &configuration.bridge_username),
        Arc::clone(&configuration),
        cancel.clone(),
    )));

    tasks.push(tokio::spawn({
        let status = Arc::clone(&status);
        let cancel = cancel.clone();
        async move {
            if let Err(err) = server::serve(cli.listen, status, cancel).await {
                error!("status endpoint stopped: {err}");
            }
        }
    }));

    info!("huesync started; press Ctrl-C to stop");
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("cannot listen for shutdown signal: {err}");
    }

    info!("shutting down");
    cancel.cancel();
    for task in tasks {
        if let Err(err) = task.await {
            error!("task ended abnormally: {err}");
        }
    }

    ExitCode::SUCCESS
}
