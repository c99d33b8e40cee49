//! DNS resource record model.
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// Record types we understand; everything else is carried raw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    A,
    Ns,
    Cname,
    Soa,
    Ptr,
    Mx,
    Txt,
    Aaaa,
    Srv,
    Any,
    Unknown(u16),
}

impl RecordType {
    pub fn from_u16(val: u16) -> Self {
        match val {
            1 => Self::A,
            2 => Self::Ns,
            5 => Self::Cname,
            6 => Self::Soa,
            12 => Self::Ptr,
            15 => Self::Mx,
            16 => Self::Txt,
            28 => Self::Aaaa,
            33 => Self::Srv,
            255 => Self::Any,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::A => 1,
            Self::Ns => 2,
            Self::Cname => 5,
            Self::Soa => 6,
            Self::Ptr => 12,
            Self::Mx => 15,
            Self::Txt => 16,
            Self::Aaaa => 28,
            Self::Srv => 33,
            Self::Any => 255,
            Self::Unknown(v) => v,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::Ns => write!(f, "NS"),
            Self::Cname => write!(f, "CNAME"),
            Self::Soa => write!(f, "SOA"),
            Self::Ptr => write!(f, "PTR"),
            Self::Mx => write!(f, "MX"),
            Self::Txt => write!(f, "TXT"),
            Self::Aaaa => write!(f, "AAAA"),
            Self::Srv => write!(f, "SRV"),
            Self::Any => write!(f, "ANY"),
            Self::Unknown(v) => write!(f, "TYPE{v}"),
        }
    }
}

/// Record data by type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    Ptr(String),
    Ns(String),
    Mx {
        preference: u16,
        exchange: String,
    },
    Txt(String),
    Soa {
        mname: String,
        rname: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    /// unknown types pass through untouched
    Raw(Vec<u8>),
}

/// One resource record. Class is always IN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: RecordType,
    pub ttl: u32,
    pub rdata: RData,
}

impl DnsRecord {
    pub fn a(name: &str, ip: Ipv4Addr, ttl: u32) -> Self {
        Self {
            name: name.to_lowercase(),
            rtype: RecordType::A,
            ttl,
            rdata: RData::A(ip),
        }
    }

    pub fn ptr(name: &str, target: &str, ttl: u32) -> Self {
        Self {
            name: name.to_lowercase(),
            rtype: RecordType::Ptr,
            ttl,
            rdata: RData::Ptr(target.to_lowercase()),
        }
    }

    pub fn aaaa(name: &str, ip: Ipv6Addr, ttl: u32) -> Self {
        Self {
            name: name.to_lowercase(),
            rtype: RecordType::Aaaa,
            ttl,
            rdata: RData::Aaaa(ip),
        }
    }
}

/// The reverse-lookup name for an IPv4 address.
pub fn reverse_name(ip: Ipv4Addr) -> String {
    let o = ip.octets();
    format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_codes_round_trip() {
        for t in [
            RecordType::A,
            RecordType::Ptr,
            RecordType::Aaaa,
            RecordType::Srv,
            RecordType::Unknown(64),
        ] {
            assert_eq!(RecordType::from_u16(t.to_u16()), t);
        }
    }

    #[test]
    fn reverse_names() {
        assert_eq!(
            reverse_name(Ipv4Addr::new(192, 168, 1, 100)),
            "100.1.168.192.in-addr.arpa"
        );
    }
}
