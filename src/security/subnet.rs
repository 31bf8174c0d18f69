//! Trusted subnet allow-list

use super::SecurityError;
use ipnet::IpNet;
use std::net::IpAddr;

/// Header carrying the caller-supplied client address
pub const REAL_IP_HEADER: &str = "X-Real-IP";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustedSubnet {
    net: IpNet,
}

impl TrustedSubnet {
    pub fn new(net: IpNet) -> Self {
        Self { net }
    }

    pub fn parse(cidr: &str) -> Result<Self, SecurityError> {
        cidr.trim()
            .parse::<IpNet>()
            .map(Self::new)
            .map_err(|e| SecurityError::InvalidSubnet {
                cidr: cidr.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn net(&self) -> IpNet {
        self.net
    }

    /// Admit a request by its `X-Real-IP` value
    pub fn check(&self, real_ip: Option<&str>) -> Result<IpAddr, SecurityError> {
        let raw = real_ip
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(SecurityError::MissingRealIp)?;

        let ip = raw
            .parse::<IpAddr>()
            .map_err(|_| SecurityError::InvalidRealIp(raw.to_string()))?;

        if self.net.contains(&ip) {
            Ok(ip)
        } else {
            Err(SecurityError::UntrustedIp(ip))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check() {
        let subnet = TrustedSubnet::parse("192.168.1.0/24").unwrap();

        assert!(subnet.check(Some("192.168.1.17")).is_ok());
        assert!(matches!(
            subnet.check(Some("10.0.0.1")),
            Err(SecurityError::UntrustedIp(_))
        ));
        assert!(matches!(subnet.check(None), Err(SecurityError::MissingRealIp)));
        assert!(matches!(subnet.check(Some("  ")), Err(SecurityError::MissingRealIp)));
        assert!(matches!(
            subnet.check(Some("not-an-ip")),
            Err(SecurityError::InvalidRealIp(_))
        ));
    }

    #[test]
    fn test_ipv6() {
        let subnet = TrustedSubnet::parse("fd00::/8").unwrap();
        assert!(subnet.check(Some("fd12::1")).is_ok());
        assert!(subnet.check(Some("2001:db8::1")).is_err());
    }

    #[test]
    fn test_invalid_cidr() {
        assert!(TrustedSubnet::parse("192.168.1.0/33").is_err());
    }
}
