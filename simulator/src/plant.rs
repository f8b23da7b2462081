use monitor::model::{Device, Sensor, SensorSample};
use rand::Rng;

/// Normal operating band of a simulated sensor.
pub struct Channel {
    pub device_id: &'static str,
    pub sensor: Sensor,
    pub nominal: (f64, f64),
}

fn sensor(id: &str, kind: &str, unit: &str, max: f64, threshold: f64) -> Sensor {
    Sensor {
        id: id.to_string(),
        device_id: String::new(),
        name: kind.to_string(),
        sensor_type: kind.to_string(),
        unit: unit.to_string(),
        min_value: 0.0,
        max_value: max,
        threshold,
        last_value: 0.0,
        last_updated: None,
        enabled: true,
    }
}

fn device(id: &str, name: &str, kind: &str, location: &str) -> Device {
    Device {
        id: id.to_string(),
        name: name.to_string(),
        device_type: kind.to_string(),
        location: location.to_string(),
        firmware_version: "1.4.2".to_string(),
        ..Device::default()
    }
}

/// Two machines on a production line with three sensors between them.
pub fn plant() -> (Vec<Device>, Vec<Channel>) {
    let devices = vec![
        device("device_001", "Injection Machine A", "injection_molding", "Line 1"),
        device("device_002", "Packaging Machine B", "packaging", "Line 2"),
    ];
    let channels = vec![
        Channel {
            device_id: "device_001",
            sensor: sensor("sensor_001", "temperature", "°C", 200.0, 150.0),
            nominal: (110.0, 140.0),
        },
        Channel {
            device_id: "device_001",
            sensor: sensor("sensor_002", "pressure", "bar", 200.0, 180.0),
            nominal: (90.0, 160.0),
        },
        Channel {
            device_id: "device_002",
            sensor: sensor("sensor_003", "speed", "rpm", 3000.0, 2500.0),
            nominal: (1800.0, 2300.0),
        },
    ];
    (devices, channels)
}

pub fn reading(rng: &mut impl Rng, channel: &Channel, outlier_probability: f64) -> SensorSample {
    let value = if rng.gen_bool(outlier_probability) {
        // anywhere from under range to well past the threshold
        rng.gen_range(-0.1 * channel.sensor.max_value..1.2 * channel.sensor.max_value)
    } else {
        rng.gen_range(channel.nominal.0..channel.nominal.1)
    };
    SensorSample::new(channel.device_id, channel.sensor.id.as_str(), value)
}
