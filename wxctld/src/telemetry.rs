use wxctlp_frame::Metric;

pub const SENSOR_NODE_TYPE: &str = "weather_sensor";

/// Properties of a sensor node, in announcement order
pub const SENSOR_PROPERTIES: [&str; 6] = [
    "temperature",
    "humidity",
    "pressure",
    "rssi",
    "uptime",
    "battery",
];

/// Node name of a sensor: its radio node id
pub fn node_name(sensor: u8) -> String {
    sensor.to_string()
}

/// Property values of one report, floats with two decimals and counts as
/// plain integers
pub fn property_values(metric: &Metric) -> [(&'static str, String); 6] {
    [
        ("temperature", format!("{:.2}", metric.temperature)),
        ("humidity", format!("{:.2}", metric.humidity)),
        ("pressure", format!("{:.2}", metric.pressure)),
        ("rssi", metric.rssi.to_string()),
        ("uptime", metric.uptime.to_string()),
        ("battery", format!("{:.2}", metric.battery)),
    ]
}
