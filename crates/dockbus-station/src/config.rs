//! Configuration lookup and the typed settings built from it.

use std::path::Path;
use std::time::Duration;

use serde_json::Value;

use crate::error::{Result, StationError};
use crate::module::Module;

/// Keyed lookup of `section.key` settings with caller-supplied defaults.
pub trait ConfigLookup {
    fn get_string(&self, section: &str, key: &str, default: &str) -> String;

    fn get_int(&self, section: &str, key: &str, default: i64) -> i64;

    fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        self.get_int(section, key, i64::from(default)) != 0
    }
}

/// Configuration backed by a JSON document of one object per section.
#[derive(Debug, Clone, Default)]
pub struct JsonConfig {
    root: Value,
}

impl JsonConfig {
    /// A configuration where every lookup yields its default.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(Self {
            root: serde_json::from_str(text)?,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| StationError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    fn value(&self, section: &str, key: &str) -> Option<&Value> {
        self.root.get(section)?.get(key)
    }
}

impl ConfigLookup for JsonConfig {
    fn get_string(&self, section: &str, key: &str, default: &str) -> String {
        match self.value(section, key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => default.to_string(),
        }
    }

    fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
        match self.value(section, key) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(default),
            Some(Value::Bool(b)) => i64::from(*b),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }
}

/// Settings for one device bus and its control-plane endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    pub module: Module,
    pub enabled: bool,
    /// Serial device path.
    pub device: String,
    pub baud: u32,
    /// Echo transmitted frames back instead of opening `device`.
    pub loopback: bool,
    pub listen: String,
    /// How long a device may take to answer one transmission.
    pub device_timeout: Duration,
    /// Retransmissions after the first unanswered attempt.
    pub retries: u32,
    pub inter_byte_timeout: Duration,
    pub scan_on_start: bool,
}

impl BusConfig {
    pub fn defaults(module: Module) -> Self {
        let (device, listen) = match module {
            Module::Kr => ("/dev/ttyS2", "127.0.0.1:7302"),
            _ => ("/dev/ttyS1", "127.0.0.1:7301"),
        };
        Self {
            module,
            enabled: true,
            device: device.to_string(),
            baud: 115_200,
            loopback: false,
            listen: listen.to_string(),
            device_timeout: Duration::from_millis(100),
            retries: 2,
            inter_byte_timeout: Duration::from_millis(50),
            scan_on_start: true,
        }
    }

    pub fn from_lookup(lookup: &impl ConfigLookup, module: Module) -> Result<Self> {
        let d = Self::defaults(module);
        let section = module.name();
        Ok(Self {
            module,
            enabled: lookup.get_bool(section, "enabled", d.enabled),
            device: lookup.get_string(section, "device", &d.device),
            baud: non_negative(lookup, section, "baud", i64::from(d.baud))?,
            loopback: lookup.get_bool(section, "loopback", d.loopback),
            listen: lookup.get_string(section, "listen", &d.listen),
            device_timeout: millis(lookup, section, "timeout_ms", d.device_timeout)?,
            retries: non_negative(lookup, section, "retries", i64::from(d.retries))?,
            inter_byte_timeout: millis(
                lookup,
                section,
                "inter_byte_timeout_ms",
                d.inter_byte_timeout,
            )?,
            scan_on_start: lookup.get_bool(section, "scan_on_start", d.scan_on_start),
        })
    }

    /// Longest a blocking client waits: every attempt times out in turn.
    pub fn call_budget(&self) -> Duration {
        self.device_timeout * (self.retries + 1)
    }
}

/// Settings for the callback fan-out endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackConfig {
    pub enabled: bool,
    pub listen: String,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "127.0.0.1:7303".to_string(),
        }
    }
}

impl CallbackConfig {
    pub fn from_lookup(lookup: &impl ConfigLookup) -> Self {
        let d = Self::default();
        let section = Module::Callback.name();
        Self {
            enabled: lookup.get_bool(section, "enabled", d.enabled),
            listen: lookup.get_string(section, "listen", &d.listen),
        }
    }
}

/// Discovery pacing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// Broadcast rounds before giving up.
    pub max_rounds: u32,
    /// How often the discovered count is sampled.
    pub poll_interval: Duration,
    /// How long the count must hold still for a round to converge.
    pub settle: Duration,
    /// Cap on one round when devices keep trickling in.
    pub round_limit: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            poll_interval: Duration::from_millis(10),
            settle: Duration::from_secs(1),
            round_limit: Duration::from_secs(5),
        }
    }
}

impl ScanConfig {
    pub fn from_lookup(lookup: &impl ConfigLookup) -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            max_rounds: non_negative(lookup, "scan", "rounds", i64::from(d.max_rounds))?,
            poll_interval: millis(lookup, "scan", "poll_ms", d.poll_interval)?,
            settle: millis(lookup, "scan", "settle_ms", d.settle)?,
            round_limit: millis(lookup, "scan", "round_limit_ms", d.round_limit)?,
        })
    }
}

/// Everything `dockbus serve` needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationConfig {
    pub bdp: BusConfig,
    pub kr: BusConfig,
    pub callback: CallbackConfig,
    pub scan: ScanConfig,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            bdp: BusConfig::defaults(Module::Bdp),
            kr: BusConfig::defaults(Module::Kr),
            callback: CallbackConfig::default(),
            scan: ScanConfig::default(),
        }
    }
}

impl StationConfig {
    pub fn from_lookup(lookup: &impl ConfigLookup) -> Result<Self> {
        Ok(Self {
            bdp: BusConfig::from_lookup(lookup, Module::Bdp)?,
            kr: BusConfig::from_lookup(lookup, Module::Kr)?,
            callback: CallbackConfig::from_lookup(lookup),
            scan: ScanConfig::from_lookup(lookup)?,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_lookup(&JsonConfig::load(path)?)
    }

    pub fn bus(&self, module: Module) -> Option<&BusConfig> {
        match module {
            Module::Bdp => Some(&self.bdp),
            Module::Kr => Some(&self.kr),
            Module::Callback => None,
        }
    }

    pub fn buses(&self) -> impl Iterator<Item = &BusConfig> {
        [&self.bdp, &self.kr].into_iter()
    }
}

/// Settings for one application-side [`crate::BusClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub module: Module,
    /// Daemon endpoint for `module`.
    pub addr: String,
    /// Name stamped into every request.
    pub app_name: String,
    /// Per-attempt device timeout used when a call passes zero.
    pub device_timeout: Duration,
    pub retries: u32,
}

impl ClientConfig {
    pub fn for_bus(bus: &BusConfig, app_name: impl Into<String>) -> Self {
        Self {
            module: bus.module,
            addr: bus.listen.clone(),
            app_name: app_name.into(),
            device_timeout: bus.device_timeout,
            retries: bus.retries,
        }
    }
}

fn non_negative<T: TryFrom<i64>>(
    lookup: &impl ConfigLookup,
    section: &str,
    key: &str,
    default: i64,
) -> Result<T> {
    let raw = lookup.get_int(section, key, default);
    T::try_from(raw).map_err(|_| StationError::ConfigValue {
        section: section.to_string(),
        key: key.to_string(),
        reason: format!("{raw} is out of range"),
    })
}

fn millis(
    lookup: &impl ConfigLookup,
    section: &str,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    let ms: u64 = non_negative(lookup, section, key, default.as_millis() as i64)?;
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "bdp": {
            "device": "/dev/ttyUSB0",
            "baud": 57600,
            "listen": "127.0.0.1:0",
            "timeout_ms": 40,
            "retries": 3,
            "scan_on_start": false
        },
        "kr": { "loopback": true, "enabled": "1" },
        "callback": { "enabled": false },
        "scan": { "rounds": 4, "settle_ms": 200 }
    }"#;

    #[test]
    fn lookup_falls_back_to_defaults() {
        let config = JsonConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.get_string("bdp", "device", "x"), "/dev/ttyUSB0");
        assert_eq!(config.get_string("bdp", "missing", "x"), "x");
        assert_eq!(config.get_string("nope", "device", "y"), "y");
        assert_eq!(config.get_int("bdp", "baud", 0), 57600);
        assert_eq!(config.get_int("kr", "enabled", 0), 1);
        assert_eq!(config.get_int("kr", "loopback", 0), 1);
        assert!(!config.get_bool("callback", "enabled", true));
    }

    #[test]
    fn empty_config_yields_defaults() {
        let station = StationConfig::from_lookup(&JsonConfig::empty()).unwrap();
        assert_eq!(station, StationConfig::default());
        assert_eq!(station.bdp.listen, "127.0.0.1:7301");
        assert_eq!(station.kr.listen, "127.0.0.1:7302");
    }

    #[test]
    fn typed_config_from_document() {
        let station = StationConfig::from_lookup(&JsonConfig::parse(SAMPLE).unwrap()).unwrap();
        assert_eq!(station.bdp.baud, 57600);
        assert_eq!(station.bdp.device_timeout, Duration::from_millis(40));
        assert_eq!(station.bdp.retries, 3);
        assert!(!station.bdp.scan_on_start);
        assert_eq!(station.bdp.call_budget(), Duration::from_millis(160));
        assert!(station.kr.loopback);
        assert!(!station.callback.enabled);
        assert_eq!(station.scan.max_rounds, 4);
        assert_eq!(station.scan.settle, Duration::from_millis(200));
        assert_eq!(station.scan.poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn negative_values_rejected() {
        let config = JsonConfig::parse(r#"{"bdp": {"retries": -1}}"#).unwrap();
        let err = StationConfig::from_lookup(&config).unwrap_err();
        assert!(matches!(err, StationError::ConfigValue { ref key, .. } if key == "retries"));
    }

    #[test]
    fn malformed_document_is_an_error() {
        assert!(matches!(
            JsonConfig::parse("{ not json"),
            Err(StationError::ConfigParse(_))
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = JsonConfig::load("/nonexistent/dockbus.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/dockbus.json"));
    }

    #[test]
    fn client_config_follows_bus() {
        let bus = BusConfig::defaults(Module::Kr);
        let client = ClientConfig::for_bus(&bus, "kiosk");
        assert_eq!(client.module, Module::Kr);
        assert_eq!(client.addr, "127.0.0.1:7302");
        assert_eq!(client.retries, 2);
    }
}
