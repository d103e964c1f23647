use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// 100 % de la capacité d'un WTP, en points de base
pub const FULL_SHARE: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wtp-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SliceId(pub u32);

impl fmt::Display for SliceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Adresse physique d'un WTP (6 octets, ex: 00:0d:b9:2f:56:64)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WtpAddr(pub [u8; 6]);

impl fmt::Display for WtpAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid WTP address: {0}")]
pub struct AddrParseError(String);

impl FromStr for WtpAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');
        for byte in out.iter_mut() {
            let part = parts.next().ok_or_else(|| AddrParseError(s.to_string()))?;
            if part.len() != 2 {
                return Err(AddrParseError(s.to_string()));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| AddrParseError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(AddrParseError(s.to_string()));
        }
        Ok(WtpAddr(out))
    }
}

impl Serialize for WtpAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for WtpAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let txt = String::deserialize(deserializer)?;
        txt.parse().map_err(serde::de::Error::custom)
    }
}

/// Classe de trafic = valeur DSCP (6 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Dscp(u8);

impl Dscp {
    pub const MAX: u8 = 63;
    pub const BEST_EFFORT: Dscp = Dscp(0);

    pub fn new(value: u8) -> Option<Self> {
        (value <= Self::MAX).then_some(Dscp(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Codes normalisés : CS0-CS7, AF11-AF43, VA (44), EF (46)
    pub fn is_standard(self) -> bool {
        matches!(self.0, 0 | 8 | 16 | 24 | 32 | 40 | 48 | 56 | 10 | 12 | 14 | 18 | 20 | 22 | 26 | 28 | 30 | 34 | 36 | 38 | 44 | 46)
    }

    /// Octet TOS de réécriture (DSCP dans les 6 bits de poids fort) ;
    /// 0 pour un code non normalisé
    pub fn tos(self) -> u8 {
        if self.is_standard() {
            self.0 << 2
        } else {
            0
        }
    }
}

impl TryFrom<u8> for Dscp {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Dscp::new(value).ok_or_else(|| format!("DSCP value {value} out of range (0-63)"))
    }
}

impl From<Dscp> for u8 {
    fn from(d: Dscp) -> u8 {
        d.0
    }
}

impl fmt::Display for Dscp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Éléments (capacités) qu'un WTP peut annoncer au handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    DscpStats,
    TrafficRules,
    SliceQuantum,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub kind: ElementKind,
    #[serde(default = "default_element_version")]
    pub version: u16,
}

fn default_element_version() -> u16 {
    1
}

impl Element {
    pub fn new(kind: ElementKind, version: u16) -> Self {
        Self { kind, version }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Active,
    Draining,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Active => "active",
            ConnectionState::Draining => "draining",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wtp_addr_parse_and_display() {
        let addr: WtpAddr = "00:0D:B9:2f:56:64".parse().unwrap();
        assert_eq!(addr.0, [0x00, 0x0d, 0xb9, 0x2f, 0x56, 0x64]);
        assert_eq!(addr.to_string(), "00:0d:b9:2f:56:64");
        assert!("00:0d:b9:2f:56".parse::<WtpAddr>().is_err());
        assert!("00:0d:b9:2f:56:64:11".parse::<WtpAddr>().is_err());
        assert!("zz:0d:b9:2f:56:64".parse::<WtpAddr>().is_err());
    }

    #[test]
    fn test_dscp_bounds_and_tos() {
        assert!(Dscp::new(63).is_some());
        assert!(Dscp::new(64).is_none());
        assert_eq!(Dscp::new(46).unwrap().tos(), 184);
        assert_eq!(Dscp::new(34).unwrap().tos(), 136);
        assert_eq!(Dscp::new(2).unwrap().tos(), 0);
        assert_eq!(Dscp::new(63).unwrap().tos(), 0);
        assert!(serde_json::from_str::<Dscp>("70").is_err());
    }

    #[test]
    fn test_unknown_element_is_tolerated() {
        let el: Element = serde_json::from_str(r#"{"kind":"lvap_stats"}"#).unwrap();
        assert_eq!(el.kind, ElementKind::Unknown);
        assert_eq!(el.version, 1);
    }
}
