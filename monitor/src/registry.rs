//! Device and sensor registry.
//!
//! Lock ordering: the device map lock is always taken before a device's
//! sensor lock, never the other way round.

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::metrics::ALERT_QUEUE_FULL_TOTAL;
use crate::model::{Alert, Device, DeviceStatus, Sensor};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct DeviceSlot {
    /// Device fields; `sensors` is kept empty here and lives in the lock below.
    device: Device,
    sensors: RwLock<Vec<Sensor>>,
}

impl DeviceSlot {
    fn snapshot(&self) -> Device {
        let mut device = self.device.clone();
        device.sensors = self.sensors.read().clone();
        device
    }
}

pub struct Registry {
    devices: RwLock<HashMap<String, DeviceSlot>>,
    max_devices: usize,
    max_sensors_per_device: usize,
    scan_interval: Duration,
    alert_tx: Option<mpsc::Sender<Alert>>,
}

impl Registry {
    pub fn new(config: &Config) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            max_devices: config.max_devices,
            max_sensors_per_device: config.max_sensors_per_device,
            scan_interval: config.scan_interval(),
            alert_tx: None,
        }
    }

    /// Threshold breaches are pushed onto `tx` for the alert manager to pick up.
    pub fn with_alert_queue(mut self, tx: mpsc::Sender<Alert>) -> Self {
        self.alert_tx = Some(tx);
        self
    }

    pub fn register_device(&self, mut device: Device) -> Result<Device> {
        if device.id.is_empty() {
            return Err(Error::Validation("device id cannot be empty".to_string()));
        }

        let mut devices = self.devices.write();
        if devices.len() >= self.max_devices {
            return Err(Error::Capacity(format!(
                "maximum number of devices reached: {}",
                self.max_devices
            )));
        }
        if devices.contains_key(&device.id) {
            return Err(Error::Duplicate(format!(
                "device with id {} already exists",
                device.id
            )));
        }

        if device.last_seen.is_none() {
            device.last_seen = Some(Utc::now());
        }

        let mut sensors = std::mem::take(&mut device.sensors);
        if sensors.len() > self.max_sensors_per_device {
            return Err(Error::Capacity(format!(
                "maximum number of sensors per device reached: {}",
                self.max_sensors_per_device
            )));
        }
        for sensor in sensors.iter_mut() {
            sensor.device_id = device.id.clone();
            sensor.enabled = true;
        }

        let slot = DeviceSlot {
            device,
            sensors: RwLock::new(sensors),
        };
        let snapshot = slot.snapshot();
        info!(device_id = %snapshot.id, name = %snapshot.name, "Device registered");
        devices.insert(snapshot.id.clone(), slot);
        Ok(snapshot)
    }

    pub fn get_device(&self, device_id: &str) -> Result<Device> {
        self.devices
            .read()
            .get(device_id)
            .map(DeviceSlot::snapshot)
            .ok_or_else(|| device_not_found(device_id))
    }

    pub fn get_all_devices(&self) -> Vec<Device> {
        self.devices.read().values().map(DeviceSlot::snapshot).collect()
    }

    pub fn get_all_sensors(&self) -> Vec<Sensor> {
        let devices = self.devices.read();
        devices
            .values()
            .flat_map(|slot| slot.sensors.read().clone())
            .collect()
    }

    /// Overwrites the descriptive fields of an existing device; sensors are untouched.
    pub fn update_device(&self, update: Device) -> Result<Device> {
        let mut devices = self.devices.write();
        let slot = devices
            .get_mut(&update.id)
            .ok_or_else(|| device_not_found(&update.id))?;

        let device = &mut slot.device;
        device.name = update.name;
        device.device_type = update.device_type;
        device.location = update.location;
        device.status = update.status;
        device.last_seen = Some(Utc::now());
        device.ip_address = update.ip_address;
        device.mac_address = update.mac_address;
        device.firmware_version = update.firmware_version;

        info!(device_id = %device.id, "Device updated");
        Ok(slot.snapshot())
    }

    pub fn delete_device(&self, device_id: &str) -> Result<()> {
        match self.devices.write().remove(device_id) {
            Some(_) => {
                info!(device_id, "Device deleted");
                Ok(())
            }
            None => Err(device_not_found(device_id)),
        }
    }

    pub fn update_device_status(&self, device_id: &str, status: DeviceStatus) -> Result<()> {
        let mut devices = self.devices.write();
        let slot = devices
            .get_mut(device_id)
            .ok_or_else(|| device_not_found(device_id))?;

        if slot.device.status != status {
            debug!(device_id, from = %slot.device.status, to = %status, "Device status changed");
        }
        slot.device.status = status;
        slot.device.last_seen = Some(Utc::now());
        Ok(())
    }

    pub fn add_sensor(&self, device_id: &str, mut sensor: Sensor) -> Result<Sensor> {
        let devices = self.devices.read();
        let slot = devices
            .get(device_id)
            .ok_or_else(|| device_not_found(device_id))?;

        let mut sensors = slot.sensors.write();
        if sensors.len() >= self.max_sensors_per_device {
            return Err(Error::Capacity(format!(
                "maximum number of sensors per device reached: {}",
                self.max_sensors_per_device
            )));
        }
        if sensors.iter().any(|s| s.id == sensor.id) {
            return Err(Error::Duplicate(format!(
                "sensor {} already exists on device {}",
                sensor.id, device_id
            )));
        }

        sensor.device_id = device_id.to_string();
        sensor.enabled = true;
        sensors.push(sensor.clone());

        info!(device_id, sensor_id = %sensor.id, name = %sensor.name, "Sensor added");
        Ok(sensor)
    }

    pub fn get_sensor(&self, device_id: &str, sensor_id: &str) -> Result<Sensor> {
        let devices = self.devices.read();
        let slot = devices
            .get(device_id)
            .ok_or_else(|| device_not_found(device_id))?;

        let sensors = slot.sensors.read();
        sensors
            .iter()
            .find(|s| s.id == sensor_id)
            .cloned()
            .ok_or_else(|| sensor_not_found(device_id, sensor_id))
    }

    /// Records a new reading. A breach of the sensor's threshold queues an
    /// alert built from a snapshot taken while the locks were held.
    pub fn update_sensor_value(&self, device_id: &str, sensor_id: &str, value: f64) -> Result<()> {
        let breach = {
            let devices = self.devices.read();
            let slot = devices
                .get(device_id)
                .ok_or_else(|| device_not_found(device_id))?;

            let mut sensors = slot.sensors.write();
            let sensor = sensors
                .iter_mut()
                .find(|s| s.id == sensor_id)
                .ok_or_else(|| sensor_not_found(device_id, sensor_id))?;

            sensor.last_value = value;
            sensor.last_updated = Some(Utc::now());

            (sensor.enabled && value > sensor.threshold)
                .then(|| Alert::threshold_breach(device_id, &slot.device.name, sensor, value))
        };

        if let Some(alert) = breach {
            self.dispatch_alert(alert);
        }
        Ok(())
    }

    pub fn set_sensor_enabled(&self, device_id: &str, sensor_id: &str, enabled: bool) -> Result<()> {
        let devices = self.devices.read();
        let slot = devices
            .get(device_id)
            .ok_or_else(|| device_not_found(device_id))?;

        let mut sensors = slot.sensors.write();
        let sensor = sensors
            .iter_mut()
            .find(|s| s.id == sensor_id)
            .ok_or_else(|| sensor_not_found(device_id, sensor_id))?;
        sensor.enabled = enabled;
        Ok(())
    }

    pub fn remove_sensor(&self, device_id: &str, sensor_id: &str) -> Result<()> {
        let devices = self.devices.read();
        let slot = devices
            .get(device_id)
            .ok_or_else(|| device_not_found(device_id))?;

        let mut sensors = slot.sensors.write();
        let index = sensors
            .iter()
            .position(|s| s.id == sensor_id)
            .ok_or_else(|| sensor_not_found(device_id, sensor_id))?;
        sensors.remove(index);

        info!(device_id, sensor_id, "Sensor removed");
        Ok(())
    }

    pub fn device_count(&self) -> usize {
        self.devices.read().len()
    }

    pub fn sensor_count(&self) -> usize {
        self.devices
            .read()
            .values()
            .map(|slot| slot.sensors.read().len())
            .sum()
    }

    fn dispatch_alert(&self, alert: Alert) {
        let Some(tx) = &self.alert_tx else {
            debug!(alert_id = %alert.id, "No alert queue attached, dropping threshold alert");
            return;
        };

        match tx.try_send(alert) {
            Ok(()) => {}
            Err(TrySendError::Full(alert)) => {
                ALERT_QUEUE_FULL_TOTAL.inc();
                warn!(
                    device_id = %alert.device_id,
                    sensor_id = %alert.sensor_id,
                    "Alert queue full, dropping threshold alert"
                );
            }
            Err(TrySendError::Closed(alert)) => {
                warn!(alert_id = %alert.id, "Alert queue closed, dropping threshold alert");
            }
        }
    }

    /// Demotes devices that have not been heard from for two scan intervals.
    /// Returns how many devices went offline.
    ///
    /// Unlike `update_device_status`, demotion leaves `last_seen` alone so it
    /// keeps pointing at the last real contact.
    pub fn scan_devices(&self) -> usize {
        let cutoff = match chrono::Duration::from_std(self.scan_interval * 2) {
            Ok(window) => Utc::now() - window,
            Err(_) => return 0,
        };

        let mut demoted = 0;
        let mut devices = self.devices.write();
        for slot in devices.values_mut() {
            let stale = slot.device.last_seen.map_or(true, |seen| seen < cutoff);
            if stale && slot.device.status != DeviceStatus::Offline {
                slot.device.status = DeviceStatus::Offline;
                demoted += 1;
                info!(device_id = %slot.device.id, "Device marked offline");
            }
        }
        demoted
    }

    pub async fn run_liveness_scan(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval_secs = self.scan_interval.as_secs(), "Liveness scan started");
        let mut ticker = tokio::time::interval(self.scan_interval);
        // The first tick completes immediately; skip it so fresh devices get a full window.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Liveness scan stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let demoted = self.scan_devices();
                    if demoted > 0 {
                        debug!(demoted, "Liveness scan finished");
                    }
                }
            }
        }
    }
}

fn device_not_found(device_id: &str) -> Error {
    Error::NotFound(format!("device not found: {}", device_id))
}

fn sensor_not_found(device_id: &str, sensor_id: &str) -> Error {
    Error::NotFound(format!(
        "sensor not found: {} on device {}",
        sensor_id, device_id
    ))
}
