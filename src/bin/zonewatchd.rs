//! zonewatchd - zone intrusion analytics daemon
//!
//! This daemon:
//! 1. Resolves configuration (state store, config file, environment, flags)
//! 2. Loads the detector and optional MQTT sink
//! 3. Runs the ingest / detect / alarm pipeline until Ctrl-C
//! 4. Stops recording and drains event captures on the way out

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use zonewatch::{
    build_detector, logging, Broadcaster, ConfigStore, DetectorHandle, JsonConfigStore,
    LaunchOptions, MqttSink, MqttSinkConfig, Pipeline, Shutdown, ZonewatchConfig,
};

/// File name of the persisted configuration inside `--state-dir`.
const STATE_FILE: &str = "zonewatch.json";

#[derive(Parser, Debug)]
#[command(author, version, about = "Zone intrusion analytics daemon")]
struct Args {
    /// Config file (JSON, or TOML by extension).
    #[arg(long, env = "ZONEWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Video source address; overrides the config file.
    #[arg(long)]
    source: Option<String>,

    /// Directory holding the persisted configuration. Runtime changes are
    /// written back here.
    #[arg(long, env = "ZONEWATCH_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Start continuous recording at launch.
    #[arg(long, env = "ZONEWATCH_RECORD")]
    record: bool,
}

fn main() -> Result<()> {
    let forwarder = logging::init()?;
    let args = Args::parse();

    let store = args
        .state_dir
        .as_ref()
        .map(|dir| Arc::new(JsonConfigStore::new(dir.join(STATE_FILE))));
    let mut config = resolve_config(&args, store.as_deref())?;
    if let Some(source) = args.source {
        config.source_url = source;
    }
    if args.record {
        config.recording.auto_start = true;
    }

    let detector = DetectorHandle::empty();
    detector
        .swap(build_detector(&config.detector)?)
        .context("load detector")?;

    let mqtt = match &config.mqtt {
        Some(settings) => Some(Arc::new(MqttSink::connect(&MqttSinkConfig {
            broker: settings.broker.clone(),
            topic_prefix: settings.topic_prefix.clone(),
            client_id: settings.client_id.clone(),
        })?)),
        None => None,
    };
    let mut broadcaster = Broadcaster::new();
    if let Some(mqtt) = &mqtt {
        broadcaster = broadcaster.with_sink(mqtt.clone());
    }

    let shutdown = Arc::new(Shutdown::new());
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            log::info!("interrupt received");
            shutdown.trigger();
        })
        .expect("error setting Ctrl-C handler");
    }

    let mut options = LaunchOptions::new(detector, Arc::new(broadcaster), shutdown)
        .log_forwarder(forwarder);
    if let Some(store) = store {
        options = options.store(store);
    }
    let pipeline = Pipeline::launch(config, options)?;

    pipeline.wait();
    let status = serde_json::to_string(&pipeline.controller().status())
        .context("encode final status")?;
    log::info!("final status: {status}");
    pipeline.shutdown();

    if let Some(mqtt) = mqtt {
        mqtt.disconnect();
    }
    Ok(())
}

/// Explicit config file first, then the state store, then defaults. The
/// environment is applied on top in the first and last cases.
fn resolve_config(args: &Args, store: Option<&JsonConfigStore>) -> Result<ZonewatchConfig> {
    if let Some(path) = &args.config {
        log::info!("loading config from {}", path.display());
        return ZonewatchConfig::load_from(Some(path));
    }
    if let Some(store) = store.filter(|store| store.path().exists()) {
        log::info!("loading persisted state from {}", store.path().display());
        return store.load();
    }
    ZonewatchConfig::load_from(None)
}
