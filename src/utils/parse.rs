use std::error::Error;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnetwork::{Ipv4Network, Ipv6Network};

#[derive(Debug)]
pub struct ParseError {
    pub reason: String,
}

impl ParseError {
    pub fn new<S: Into<String>>(reason: S) -> Self {
        ParseError {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParseError: {}", self.reason)
    }
}

impl Error for ParseError {}

impl From<io::Error> for ParseError {
    fn from(error: io::Error) -> Self {
        ParseError::new(error.to_string())
    }
}

/// 48-bit Ethernet address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn from_u64(value: u64) -> Self {
        let b = value.to_be_bytes();
        MacAddr([b[2], b[3], b[4], b[5], b[6], b[7]])
    }

    pub fn to_u64(self) -> u64 {
        let o = self.0;
        u64::from_be_bytes([0, 0, o[0], o[1], o[2], o[3], o[4], o[5]])
    }

    pub fn is_multicast(self) -> bool {
        self.0[0] & 1 != 0
    }

    pub fn is_zero(self) -> bool {
        self.0 == [0; 6]
    }

    /// Top 24 bits (the OUI portion)
    pub fn prefix(self) -> u32 {
        (self.to_u64() >> 24) as u32
    }

    /// Bottom 24 bits
    pub fn suffix(self) -> u32 {
        (self.to_u64() & 0xff_ffff) as u32
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut count = 0;
        for part in s.split(':') {
            if count == 6 || part.len() != 2 {
                return Err(ParseError::new(format!("Invalid MAC address '{}'", s)));
            }
            octets[count] = u8::from_str_radix(part, 16)
                .map_err(|_| ParseError::new(format!("Invalid MAC address '{}'", s)))?;
            count += 1;
        }
        if count != 6 {
            return Err(ParseError::new(format!("Invalid MAC address '{}'", s)));
        }
        Ok(MacAddr(octets))
    }
}

/// IPv4 address with its configured prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V4Addr {
    pub addr: Ipv4Addr,
    pub plen: u8,
}

impl V4Addr {
    pub fn host(addr: Ipv4Addr) -> Self {
        V4Addr { addr, plen: 32 }
    }

    pub fn network(&self) -> Ipv4Addr {
        let mask = mask_v4(self.plen);
        Ipv4Addr::from(u32::from(self.addr) & mask)
    }

    pub fn bcast(&self) -> Ipv4Addr {
        let mask = mask_v4(self.plen);
        Ipv4Addr::from(u32::from(self.addr) | !mask)
    }

    pub fn network_str(&self) -> String {
        format!("{}/{}", self.network(), self.plen)
    }
}

fn mask_v4(plen: u8) -> u32 {
    if plen == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(plen))
    }
}

/// IPv6 address with its configured prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V6Addr {
    pub addr: Ipv6Addr,
    pub plen: u8,
}

impl V6Addr {
    pub fn host(addr: Ipv6Addr) -> Self {
        V6Addr { addr, plen: 128 }
    }

    pub fn network(&self) -> Ipv6Addr {
        let mask = mask_v6(self.plen);
        Ipv6Addr::from(u128::from(self.addr) & mask)
    }

    pub fn network_str(&self) -> String {
        format!("{}/{}", self.network(), self.plen)
    }

    /// Solicited-node multicast address (ff02::1:ffXX:XXXX)
    pub fn solicited_node(&self) -> Ipv6Addr {
        ipv6_solicited_node(self.addr)
    }

    pub fn is_link_local(&self) -> bool {
        u128::from(self.addr) >> 118 == 0b1111_1110_10
    }
}

fn mask_v6(plen: u8) -> u128 {
    if plen == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(plen))
    }
}

pub fn ipv6_solicited_node(addr: Ipv6Addr) -> Ipv6Addr {
    let low = u128::from(addr) & 0xff_ffff;
    let base: u128 = 0xff02_0000_0000_0000_0000_0001_ff00_0000;
    Ipv6Addr::from(base | low)
}

/// Parsed addresses of one logical port: one MAC plus its IPv4/IPv6
/// addresses. Mirrors the `MAC [IP...]` grammar used in the address and
/// port-security columns.
#[derive(Debug, Clone, PartialEq)]
pub struct LportAddresses {
    pub ea: MacAddr,
    pub ipv4: Vec<V4Addr>,
    pub ipv6: Vec<V6Addr>,
}

impl LportAddresses {
    pub fn new(ea: MacAddr) -> Self {
        LportAddresses {
            ea,
            ipv4: Vec::new(),
            ipv6: Vec::new(),
        }
    }

    /// Parse a `MAC [IP ...]` entry. Bare addresses default to host
    /// prefixes; CIDR notation is honored (port-security entries use it).
    pub fn from_entry(entry: &str) -> Result<Self, ParseError> {
        let mut words = entry.split_whitespace();
        let mac = words
            .next()
            .ok_or_else(|| ParseError::new("Empty address entry"))?;
        let mut parsed = LportAddresses::new(mac.parse()?);
        for word in words {
            parsed.push_addr(word)?;
        }
        Ok(parsed)
    }

    /// Parse a router-port address set: the `mac` column plus the
    /// `networks` column, every network carrying an explicit prefix.
    pub fn from_networks(mac: &str, networks: &[String]) -> Result<Self, ParseError> {
        let mut parsed = LportAddresses::new(mac.parse()?);
        for network in networks {
            if !network.contains('/') {
                return Err(ParseError::new(format!(
                    "Router network '{}' lacks a prefix length",
                    network
                )));
            }
            parsed.push_addr(network)?;
        }
        Ok(parsed)
    }

    fn push_addr(&mut self, word: &str) -> Result<(), ParseError> {
        if word.contains('/') {
            if let Ok(net) = word.parse::<Ipv4Network>() {
                self.ipv4.push(V4Addr {
                    addr: net.ip(),
                    plen: net.prefix(),
                });
                return Ok(());
            }
            let net: Ipv6Network = word
                .parse()
                .map_err(|_| ParseError::new(format!("Invalid address '{}'", word)))?;
            self.ipv6.push(V6Addr {
                addr: net.ip(),
                plen: net.prefix(),
            });
        } else if let Ok(v4) = word.parse::<Ipv4Addr>() {
            self.ipv4.push(V4Addr::host(v4));
        } else {
            let v6: Ipv6Addr = word
                .parse()
                .map_err(|_| ParseError::new(format!("Invalid address '{}'", word)))?;
            self.ipv6.push(V6Addr::host(v6));
        }
        Ok(())
    }

    /// `"MAC ip ip ..."` form used for dynamic_addresses and port-binding
    /// mac columns
    pub fn to_entry(&self) -> String {
        let mut out = self.ea.to_string();
        for v4 in &self.ipv4 {
            out.push(' ');
            out.push_str(&v4.addr.to_string());
        }
        for v6 in &self.ipv6 {
            out.push(' ');
            out.push_str(&v6.addr.to_string());
        }
        out
    }
}

/// One entry of a switch port's `addresses` column
#[derive(Debug, Clone, PartialEq)]
pub enum LspAddress {
    /// Flood unknown-destination traffic to this port
    Unknown,
    /// Addresses come from the peer router port
    Router,
    /// Allocate MAC and/or IPs; fixed components may be requested
    Dynamic {
        mac: Option<MacAddr>,
        ip4: Option<Ipv4Addr>,
        ip6: Option<Ipv6Addr>,
    },
    Static(LportAddresses),
}

impl LspAddress {
    pub fn parse(entry: &str) -> Result<Self, ParseError> {
        let trimmed = entry.trim();
        match trimmed {
            "unknown" => return Ok(LspAddress::Unknown),
            "router" => return Ok(LspAddress::Router),
            "dynamic" => {
                return Ok(LspAddress::Dynamic {
                    mac: None,
                    ip4: None,
                    ip6: None,
                })
            }
            _ => (),
        }
        let words: Vec<&str> = trimmed.split_whitespace().collect();
        if let Some(pos) = words.iter().position(|w| *w == "dynamic") {
            // "MAC dynamic" or "dynamic IP [IP]"
            let mac = if pos == 1 {
                Some(words[0].parse()?)
            } else if pos == 0 {
                None
            } else {
                return Err(ParseError::new(format!(
                    "Invalid dynamic address entry '{}'",
                    entry
                )));
            };
            let mut ip4 = None;
            let mut ip6 = None;
            for word in &words[pos + 1..] {
                if let Ok(v4) = word.parse::<Ipv4Addr>() {
                    ip4 = Some(v4);
                } else if let Ok(v6) = word.parse::<Ipv6Addr>() {
                    ip6 = Some(v6);
                } else {
                    return Err(ParseError::new(format!(
                        "Invalid requested address '{}'",
                        word
                    )));
                }
            }
            return Ok(LspAddress::Dynamic { mac, ip4, ip6 });
        }
        Ok(LspAddress::Static(LportAddresses::from_entry(trimmed)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_roundtrip() {
        let mac: MacAddr = "0a:00:20:ff:00:01".parse().unwrap();
        assert_eq!(mac.to_string(), "0a:00:20:ff:00:01");
        assert_eq!(MacAddr::from_u64(mac.to_u64()), mac);
        assert_eq!(mac.prefix(), 0x0a0020);
        assert_eq!(mac.suffix(), 0xff0001);
        assert!("0a:00:20:ff:00".parse::<MacAddr>().is_err());
        assert!("0a:00:20:ff:00:zz".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_mac_multicast() {
        let mcast: MacAddr = "01:00:5e:00:00:01".parse().unwrap();
        assert!(mcast.is_multicast());
        let ucast: MacAddr = "0a:00:00:00:00:01".parse().unwrap();
        assert!(!ucast.is_multicast());
    }

    #[test]
    fn test_v4_network() {
        let addr = V4Addr {
            addr: "10.0.0.5".parse().unwrap(),
            plen: 24,
        };
        assert_eq!(addr.network(), "10.0.0.0".parse::<Ipv4Addr>().unwrap());
        assert_eq!(addr.bcast(), "10.0.0.255".parse::<Ipv4Addr>().unwrap());
        assert_eq!(addr.network_str(), "10.0.0.0/24");
    }

    #[test]
    fn test_solicited_node() {
        let addr: Ipv6Addr = "2001:db8::2:7834:ce15".parse().unwrap();
        assert_eq!(
            ipv6_solicited_node(addr),
            "ff02::1:ff34:ce15".parse::<Ipv6Addr>().unwrap()
        );
    }

    #[test]
    fn test_lport_addresses() {
        let parsed =
            LportAddresses::from_entry("0a:00:00:00:00:01 10.0.0.4 2001:db8::4").unwrap();
        assert_eq!(parsed.ipv4.len(), 1);
        assert_eq!(parsed.ipv6.len(), 1);
        assert_eq!(parsed.ipv4[0].plen, 32);
        assert_eq!(parsed.to_entry(), "0a:00:00:00:00:01 10.0.0.4 2001:db8::4");
        assert!(LportAddresses::from_entry("not-a-mac 10.0.0.4").is_err());
    }

    #[test]
    fn test_lrp_networks() {
        let parsed = LportAddresses::from_networks(
            "00:00:20:12:34:56",
            &["192.168.1.1/24".to_string(), "fd00::1/64".to_string()],
        )
        .unwrap();
        assert_eq!(parsed.ipv4[0].plen, 24);
        assert_eq!(parsed.ipv4[0].network_str(), "192.168.1.0/24");
        assert_eq!(parsed.ipv6[0].plen, 64);
        let bare = LportAddresses::from_networks("00:00:20:12:34:56", &["10.0.0.1".to_string()]);
        assert!(bare.is_err());
    }

    #[test]
    fn test_lsp_address_kinds() {
        assert_eq!(LspAddress::parse("unknown").unwrap(), LspAddress::Unknown);
        assert_eq!(LspAddress::parse("router").unwrap(), LspAddress::Router);
        match LspAddress::parse("dynamic").unwrap() {
            LspAddress::Dynamic { mac, ip4, ip6 } => {
                assert!(mac.is_none() && ip4.is_none() && ip6.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        match LspAddress::parse("0a:00:00:00:00:05 dynamic").unwrap() {
            LspAddress::Dynamic { mac, .. } => {
                assert_eq!(mac.unwrap().to_string(), "0a:00:00:00:00:05")
            }
            other => panic!("unexpected {:?}", other),
        }
        match LspAddress::parse("dynamic 10.0.0.9").unwrap() {
            LspAddress::Dynamic { ip4, .. } => {
                assert_eq!(ip4.unwrap(), "10.0.0.9".parse::<Ipv4Addr>().unwrap())
            }
            other => panic!("unexpected {:?}", other),
        }
        match LspAddress::parse("0a:00:00:00:00:05 10.0.0.5").unwrap() {
            LspAddress::Static(addrs) => assert_eq!(addrs.ipv4.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
    }
}
