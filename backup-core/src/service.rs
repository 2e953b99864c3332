//! The closed set of services this tool backs up.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A backed-up data store. Adding a service means adding a variant here and a
/// driver in [`crate::drivers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceKind {
    #[serde(rename = "postgres")]
    Postgres,
    #[serde(rename = "influxdb")]
    TimeSeries,
    #[serde(rename = "redis")]
    KeyValue,
}

impl ServiceKind {
    /// Restore order used by disaster recovery.
    pub const ALL: [ServiceKind; 3] = [
        ServiceKind::Postgres,
        ServiceKind::TimeSeries,
        ServiceKind::KeyValue,
    ];

    /// Name used for directories, artifact prefixes and notifications.
    pub fn name(&self) -> &'static str {
        match self {
            ServiceKind::Postgres => "postgres",
            ServiceKind::TimeSeries => "influxdb",
            ServiceKind::KeyValue => "redis",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(ServiceKind::Postgres),
            "influxdb" | "influx" | "timeseries" => Ok(ServiceKind::TimeSeries),
            "redis" | "keyvalue" => Ok(ServiceKind::KeyValue),
            other => Err(format!(
                "unknown service '{}' (expected postgres, influxdb or redis)",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("postgresql".parse::<ServiceKind>().unwrap(), ServiceKind::Postgres);
        assert_eq!("Influx".parse::<ServiceKind>().unwrap(), ServiceKind::TimeSeries);
        assert_eq!("redis".parse::<ServiceKind>().unwrap(), ServiceKind::KeyValue);
        assert!("mysql".parse::<ServiceKind>().is_err());
    }

    #[test]
    fn test_serde_uses_directory_names() {
        assert_eq!(serde_json::to_string(&ServiceKind::TimeSeries).unwrap(), "\"influxdb\"");
        let kind: ServiceKind = serde_json::from_str("\"redis\"").unwrap();
        assert_eq!(kind, ServiceKind::KeyValue);
    }

    #[test]
    fn test_names_round_trip() {
        for kind in ServiceKind::ALL {
            assert_eq!(kind.name().parse::<ServiceKind>().unwrap(), kind);
        }
    }
}
