//! Identity atoms.
//!
//! DataInfoId: logical key of a published topic
//! RegisterId: client-chosen registration token
//! ConnectId: client<->session endpoint pair, the unit of session liveness

use std::fmt;
use std::net::SocketAddr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidId {
    #[error("invalid data info id {raw:?}: {reason}")]
    DataInfo { raw: String, reason: &'static str },

    #[error("invalid register id: empty")]
    Register,

    #[error("invalid connect id {raw:?}: {reason}")]
    Connect { raw: String, reason: &'static str },
}

/// Separator used in the canonical dataInfoId rendering.
const DATA_INFO_SEP: &str = "#@#";

/// Logical key for a published topic: dataId + instanceId + group.
///
/// Canonical wire rendering is `"{dataId}#@#{instanceId}#@#{group}"`; the
/// struct serializes as that string so it can key JSON maps.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataInfoId {
    data_id: String,
    instance_id: String,
    group: String,
}

impl DataInfoId {
    pub fn new(
        data_id: impl Into<String>,
        instance_id: impl Into<String>,
        group: impl Into<String>,
    ) -> Result<Self, InvalidId> {
        let data_id = data_id.into();
        let instance_id = instance_id.into();
        let group = group.into();
        for (part, name) in [
            (&data_id, "dataId"),
            (&instance_id, "instanceId"),
            (&group, "group"),
        ] {
            if part.is_empty() {
                return Err(InvalidId::DataInfo {
                    raw: format!("{data_id}{DATA_INFO_SEP}{instance_id}{DATA_INFO_SEP}{group}"),
                    reason: match name {
                        "dataId" => "empty dataId",
                        "instanceId" => "empty instanceId",
                        _ => "empty group",
                    },
                });
            }
            if part.contains(DATA_INFO_SEP) {
                return Err(InvalidId::DataInfo {
                    raw: part.clone(),
                    reason: "part contains separator",
                });
            }
        }
        Ok(Self {
            data_id,
            instance_id,
            group,
        })
    }

    pub fn parse(s: &str) -> Result<Self, InvalidId> {
        let mut parts = s.split(DATA_INFO_SEP);
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(data_id), Some(instance_id), Some(group), None) => {
                Self::new(data_id, instance_id, group)
            }
            _ => Err(InvalidId::DataInfo {
                raw: s.to_string(),
                reason: "expected dataId#@#instanceId#@#group",
            }),
        }
    }

    pub fn data_id(&self) -> &str {
        &self.data_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn group(&self) -> &str {
        &self.group
    }
}

impl fmt::Display for DataInfoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{DATA_INFO_SEP}{}{DATA_INFO_SEP}{}",
            self.data_id, self.instance_id, self.group
        )
    }
}

impl fmt::Debug for DataInfoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataInfoId({self})")
    }
}

impl Serialize for DataInfoId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DataInfoId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DataInfoId::parse(&raw).map_err(D::Error::custom)
    }
}

/// Client-chosen registration token, unique within a connection.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegisterId(String);

impl RegisterId {
    pub fn new(s: impl Into<String>) -> Result<Self, InvalidId> {
        let s = s.into();
        if s.is_empty() {
            Err(InvalidId::Register)
        } else {
            Ok(Self(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegisterId({:?})", self.0)
    }
}

/// Client endpoint paired with the session endpoint it registered through.
///
/// Wire rendering is `"{sourceIp}:{sourcePort}_{targetIp}:{targetPort}"` and
/// must parse round-trip.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectId {
    pub source: SocketAddr,
    pub target: SocketAddr,
}

impl ConnectId {
    pub fn new(source: SocketAddr, target: SocketAddr) -> Self {
        Self { source, target }
    }

    pub fn parse(s: &str) -> Result<Self, InvalidId> {
        let Some((source, target)) = s.split_once('_') else {
            return Err(InvalidId::Connect {
                raw: s.to_string(),
                reason: "missing '_' separator",
            });
        };
        let source = source.parse().map_err(|_| InvalidId::Connect {
            raw: s.to_string(),
            reason: "bad source address",
        })?;
        let target = target.parse().map_err(|_| InvalidId::Connect {
            raw: s.to_string(),
            reason: "bad target address",
        })?;
        Ok(Self { source, target })
    }
}

impl fmt::Display for ConnectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.source, self.target)
    }
}

impl fmt::Debug for ConnectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectId({self})")
    }
}

impl Serialize for ConnectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ConnectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ConnectId::parse(&raw).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_info_id_round_trips() {
        let id = DataInfoId::new("com.example.Echo", "instance2", "rpc").unwrap();
        let rendered = id.to_string();
        assert_eq!(rendered, "com.example.Echo#@#instance2#@#rpc");
        assert_eq!(DataInfoId::parse(&rendered).unwrap(), id);
    }

    #[test]
    fn data_info_id_rejects_empty_parts() {
        assert!(DataInfoId::new("", "i", "g").is_err());
        assert!(DataInfoId::parse("only-one-part").is_err());
        assert!(DataInfoId::parse("a#@#b").is_err());
        assert!(DataInfoId::parse("a#@#b#@#c#@#d").is_err());
    }

    #[test]
    fn connect_id_round_trips() {
        let raw = "192.168.1.1:12345_192.168.1.2:9600";
        let id = ConnectId::parse(raw).unwrap();
        assert_eq!(id.to_string(), raw);
        assert_eq!(id.source.port(), 12345);
        assert_eq!(id.target.port(), 9600);
    }

    #[test]
    fn connect_id_rejects_malformed() {
        assert!(ConnectId::parse("1.2.3.4:80").is_err());
        assert!(ConnectId::parse("nonsense_1.2.3.4:80").is_err());
        assert!(ConnectId::parse("1.2.3.4:80_nonsense").is_err());
    }

    #[test]
    fn data_info_id_serializes_as_string() {
        let id = DataInfoId::new("d", "i", "g").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"d#@#i#@#g\"");
        let back: DataInfoId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
