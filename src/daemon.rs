use anyhow::{bail, Context, Result};
use gjvdc32_lib::device::Gjvdc32;
use gjvdc32_lib::protocol::{DeviceSnapshot, VoltageReading};
use gjvdc32_lib::serialport::SerialTransport;
use log::{error, info, warn};
use serde_json::json;
use std::collections::BTreeMap;

use crate::{commandline, mqtt};

type Board = Gjvdc32<SerialTransport>;

#[derive(Debug)]
enum FetchedData {
    Voltages(Vec<VoltageReading>),
    Info(DeviceSnapshot),
    DropDurations(Vec<u16>),
    Thresholds(Vec<f32>),
}

/// Per-channel lists are keyed by channel number so that simple topics read `<topic>/voltages/1`.
fn per_channel<T: serde::Serialize>(values: impl Iterator<Item = T>) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = values
        .enumerate()
        .map(|(i, v)| ((i + 1).to_string(), json!(v)))
        .collect();
    serde_json::Value::Object(map)
}

/// Rounds through the decimal form, so 12.345f32 is published as 12.345 and not as its f64 widening.
fn decimal(value: f32, digits: usize) -> f64 {
    format!("{value:.digits$}").parse().unwrap_or(value as f64)
}

impl FetchedData {
    fn to_json_value(&self) -> Result<serde_json::Value> {
        match self {
            FetchedData::Voltages(readings) => Ok(per_channel(
                readings.iter().map(|r| decimal(r.voltage, 3)),
            )),
            FetchedData::Info(snapshot) => {
                let mut value = serde_json::to_value(snapshot)?;
                if let Some(version) = value.get_mut("firmware_version") {
                    *version = json!(decimal(snapshot.firmware_version, 1));
                }
                Ok(value)
            }
            FetchedData::DropDurations(seconds) => Ok(per_channel(seconds.iter())),
            FetchedData::Thresholds(volts) => {
                Ok(per_channel(volts.iter().map(|v| decimal(*v, 2))))
            }
        }
    }

    fn as_display_string(&self) -> String {
        match self {
            FetchedData::Voltages(readings) => readings
                .iter()
                .map(|r| format!("{:.3}", r.voltage))
                .collect::<Vec<_>>()
                .join(" "),
            FetchedData::Info(snapshot) => format!("{snapshot:?}"),
            FetchedData::DropDurations(seconds) => format!("{seconds:?}"),
            FetchedData::Thresholds(volts) => format!("{volts:?}"),
        }
    }
}

type Fetch = fn(&mut Board) -> gjvdc32_lib::Result<FetchedData>;

fn get_metrics() -> BTreeMap<&'static str, Fetch> {
    let mut metrics: BTreeMap<&'static str, Fetch> = BTreeMap::new();
    metrics.insert("voltages", |board| {
        board.read_all_voltages().map(FetchedData::Voltages)
    });
    metrics.insert("info", |board| {
        board.read_device_snapshot().map(FetchedData::Info)
    });
    metrics.insert("drop-durations", |board| {
        board.read_drop_durations().map(FetchedData::DropDurations)
    });
    metrics.insert("thresholds", |board| {
        board.read_drop_thresholds().map(FetchedData::Thresholds)
    });
    metrics
}

/// The library never re-sends a failed transaction; the daemon decides to.
fn fetch_with_retry(board: &mut Board, name: &str, fetch: Fetch, retries: u8) -> Result<FetchedData> {
    let mut attempt = 0;
    loop {
        match fetch(board) {
            Ok(data) => return Ok(data),
            Err(err) if attempt < retries => {
                attempt += 1;
                log::trace!("Failed try {attempt} of {retries} for '{name}', repeating ({err})");
            }
            Err(err) => return Err(err).with_context(|| format!("Cannot fetch '{name}'")),
        }
    }
}

fn publish_simple_format(
    publisher: &mut mqtt::MqttPublisher,
    base_topic: &str,
    metric_name: &str,
    value: &serde_json::Value,
) {
    fn publish_recursive(publisher: &mut mqtt::MqttPublisher, topic: &str, val: &serde_json::Value) {
        match val {
            serde_json::Value::Object(map) => {
                for (k, v) in map {
                    let sub_topic = format!("{topic}/{k}");
                    publish_recursive(publisher, &sub_topic, v);
                }
            }
            serde_json::Value::Array(arr) => {
                for (i, v) in arr.iter().enumerate() {
                    let sub_topic = format!("{topic}/{i}");
                    publish_recursive(publisher, &sub_topic, v);
                }
            }
            serde_json::Value::String(s) => {
                if let Err(e) = publisher.publish(topic, s) {
                    error!("Failed to publish message to topic {topic}: {e}");
                }
            }
            serde_json::Value::Number(n) => {
                if let Err(e) = publisher.publish(topic, &n.to_string()) {
                    error!("Failed to publish message to topic {topic}: {e}");
                }
            }
            serde_json::Value::Bool(b) => {
                if let Err(e) = publisher.publish(topic, &b.to_string()) {
                    error!("Failed to publish message to topic {topic}: {e}");
                }
            }
            serde_json::Value::Null => {}
        }
    }
    let root_topic = format!("{base_topic}/{metric_name}");
    publish_recursive(publisher, &root_topic, value);
}

fn publish_json(publisher: &mut mqtt::MqttPublisher, fetched_data: &BTreeMap<String, FetchedData>) {
    let mut data_to_publish = serde_json::Map::new();
    data_to_publish.insert(
        "timestamp".to_string(),
        json!(chrono::Utc::now().to_rfc3339()),
    );
    for (name, data) in fetched_data {
        match data.to_json_value() {
            Ok(val) => {
                data_to_publish.insert(name.clone(), val);
            }
            Err(e) => error!("Failed to serialize '{name}': {e}"),
        }
    }
    if data_to_publish.len() == 1 {
        info!("No data fetched in this cycle to publish via MQTT.");
        return;
    }
    match serde_json::to_string(&data_to_publish) {
        Ok(json_payload) => {
            let topic = publisher.topic().to_string();
            if let Err(e) = publisher.publish(&topic, &json_payload) {
                error!("Failed to publish data to MQTT: {e:?}");
            }
        }
        Err(e) => error!("Failed to serialize data to JSON string: {e}"),
    }
}

fn resolve_metrics(
    available: &BTreeMap<&'static str, Fetch>,
    requested: &[String],
) -> Result<Vec<&'static str>> {
    if requested.iter().any(|m| m == "all") {
        return Ok(available.keys().copied().collect());
    }
    requested
        .iter()
        .map(|name| match available.get_key_value(name.as_str()) {
            Some((key, _)) => Ok(*key),
            None => bail!("Unknown metric name '{}'", name),
        })
        .collect()
}

pub fn run(
    mut board: Board,
    output: commandline::DaemonOutput,
    interval: std::time::Duration,
    metrics_to_fetch: Vec<String>,
    retries: u8,
) -> Result<()> {
    info!(
        "Starting daemon mode: output={output:?}, interval={interval:?}, metrics={metrics_to_fetch:?}"
    );
    let available_metrics = get_metrics();
    let metrics = resolve_metrics(&available_metrics, &metrics_to_fetch)?;

    let mut mqtt_publisher: Option<mqtt::MqttPublisher> = None;
    if let commandline::DaemonOutput::Mqtt { config_file, .. } = &output {
        let config = mqtt::MqttConfig::load(config_file)
            .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
        info!("Successfully loaded MQTT config from {config_file}: {config:?}");
        mqtt_publisher =
            Some(mqtt::MqttPublisher::new(config).with_context(|| "Failed to create MQTT publisher")?);
    }

    loop {
        let mut fetched_data: BTreeMap<String, FetchedData> = BTreeMap::new();
        for name in &metrics {
            let fetch = available_metrics[name];
            match fetch_with_retry(&mut board, name, fetch, retries) {
                Ok(data) => {
                    fetched_data.insert(name.to_string(), data);
                }
                Err(e) => error!("{e:#}"),
            }
        }
        if let Some(snapshot) = board.last_snapshot() {
            if !snapshot.online {
                warn!("Unit {} did not answer the last info read", board.unit());
            }
        }

        match &output {
            commandline::DaemonOutput::Console => {
                println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
                for (name, data) in &fetched_data {
                    println!("{}: {}", name, data.as_display_string());
                }
                println!("--------------------------");
            }
            commandline::DaemonOutput::Mqtt { format, .. } => {
                if let Some(publisher) = mqtt_publisher.as_mut() {
                    match format {
                        commandline::MqttFormat::Json => publish_json(publisher, &fetched_data),
                        commandline::MqttFormat::Simple => {
                            let base_topic = publisher.topic().to_string();
                            for (name, data) in &fetched_data {
                                match data.to_json_value() {
                                    Ok(value) => publish_simple_format(
                                        publisher,
                                        &base_topic,
                                        name,
                                        &value,
                                    ),
                                    Err(e) => error!("Failed to serialize '{name}': {e}"),
                                }
                            }
                        }
                    }
                } else {
                    warn!("MQTT output selected, but publisher is not initialized. Skipping publish.");
                }
            }
        }
        std::thread::sleep(interval);
    }
}
