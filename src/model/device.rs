//! Device and network snapshot captured when a session is created.

use base64ct::{Base64UrlUnpadded, Encoding};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

static BOT_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)bot|crawler|spider|slurp|curl|wget|python-requests").ok());
static TABLET_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)ipad|tablet|playbook|silk").ok());
static MOBILE_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)mobile|iphone|ipod|android|blackberry|opera mini|iemobile").ok());

fn matches(re: &Lazy<Option<Regex>>, value: &str) -> bool {
    re.as_ref().is_some_and(|re| re.is_match(value))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Tablet,
    Bot,
    Unknown,
}

impl DeviceType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Mobile => "mobile",
            Self::Tablet => "tablet",
            Self::Bot => "bot",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "desktop" => Ok(Self::Desktop),
            "mobile" => Ok(Self::Mobile),
            "tablet" => Ok(Self::Tablet),
            "bot" => Ok(Self::Bot),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown device type: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub user_agent: String,
    pub device_type: DeviceType,
    pub browser: String,
    pub operating_system: String,
    pub fingerprint: String,
}

impl DeviceInfo {
    /// Classify a user agent and derive its fingerprint.
    ///
    /// `extra_signal` is mixed into the fingerprint when the caller has one (for example a
    /// client-provided device id) so two identical browsers can still be told apart.
    #[must_use]
    pub fn from_user_agent(user_agent: &str, extra_signal: Option<&str>) -> Self {
        let user_agent = user_agent.trim();
        Self {
            user_agent: user_agent.to_string(),
            device_type: detect_device_type(user_agent),
            browser: detect_browser(user_agent).to_string(),
            operating_system: detect_operating_system(user_agent).to_string(),
            fingerprint: fingerprint(user_agent, extra_signal),
        }
    }

    /// Human readable label such as `Firefox on Linux`.
    #[must_use]
    pub fn display_name(&self) -> String {
        format!("{} on {}", self.browser, self.operating_system)
    }
}

#[must_use]
pub fn fingerprint(user_agent: &str, extra_signal: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{user_agent}|{}", extra_signal.unwrap_or_default()).as_bytes());
    Base64UrlUnpadded::encode_string(&hasher.finalize())
}

fn detect_device_type(user_agent: &str) -> DeviceType {
    if user_agent.is_empty() {
        DeviceType::Unknown
    } else if matches(&BOT_RE, user_agent) {
        DeviceType::Bot
    } else if matches(&TABLET_RE, user_agent)
        || (user_agent.contains("Android") && !user_agent.contains("Mobile"))
    {
        DeviceType::Tablet
    } else if matches(&MOBILE_RE, user_agent) {
        DeviceType::Mobile
    } else {
        DeviceType::Desktop
    }
}

fn detect_browser(user_agent: &str) -> &'static str {
    // Order matters: Edge and Opera also advertise Chrome, and Chrome advertises Safari.
    if user_agent.contains("Edg/") || user_agent.contains("Edge/") {
        "Edge"
    } else if user_agent.contains("OPR/") || user_agent.contains("Opera") {
        "Opera"
    } else if user_agent.contains("Firefox/") {
        "Firefox"
    } else if user_agent.contains("Chrome/") || user_agent.contains("CriOS/") {
        "Chrome"
    } else if user_agent.contains("Safari/") {
        "Safari"
    } else {
        "Unknown"
    }
}

fn detect_operating_system(user_agent: &str) -> &'static str {
    if user_agent.contains("Windows") {
        "Windows"
    } else if user_agent.contains("iPhone") || user_agent.contains("iPad") {
        "iOS"
    } else if user_agent.contains("Mac OS X") || user_agent.contains("Macintosh") {
        "macOS"
    } else if user_agent.contains("Android") {
        "Android"
    } else if user_agent.contains("Linux") {
        "Linux"
    } else {
        "Unknown"
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationInfo {
    pub ip_address: String,
    pub country: Option<String>,
    pub city: Option<String>,
}

impl LocationInfo {
    #[must_use]
    pub fn from_ip(ip_address: &str) -> Self {
        Self {
            ip_address: ip_address.trim().to_string(),
            country: None,
            city: None,
        }
    }

    #[must_use]
    pub fn is_valid_ip(&self) -> bool {
        self.ip_address.parse::<IpAddr>().is_ok()
    }

    /// Loopback and private-range addresses.
    #[must_use]
    pub fn is_local(&self) -> bool {
        match self.ip_address.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => ip.is_loopback() || ip.is_private(),
            Ok(IpAddr::V6(ip)) => ip.is_loopback(),
            Err(_) => false,
        }
    }

    #[must_use]
    pub fn display(&self) -> String {
        match (&self.city, &self.country) {
            (Some(city), Some(country)) => format!("{city}, {country}"),
            (None, Some(country)) => country.clone(),
            _ if self.is_local() => "Local network".to_string(),
            _ => "Unknown location".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIREFOX_LINUX: &str =
        "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";
    const SAFARI_IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1";
    const EDGE_WINDOWS: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0";
    const IPAD: &str = "Mozilla/5.0 (iPad; CPU OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/604.1";

    #[test]
    fn classifies_common_agents() {
        let firefox = DeviceInfo::from_user_agent(FIREFOX_LINUX, None);
        assert_eq!(firefox.device_type, DeviceType::Desktop);
        assert_eq!(firefox.display_name(), "Firefox on Linux");

        let safari = DeviceInfo::from_user_agent(SAFARI_IPHONE, None);
        assert_eq!(safari.device_type, DeviceType::Mobile);
        assert_eq!(safari.browser, "Safari");
        assert_eq!(safari.operating_system, "iOS");

        let edge = DeviceInfo::from_user_agent(EDGE_WINDOWS, None);
        assert_eq!(edge.browser, "Edge");
        assert_eq!(edge.operating_system, "Windows");

        assert_eq!(
            DeviceInfo::from_user_agent(IPAD, None).device_type,
            DeviceType::Tablet
        );
        assert_eq!(
            DeviceInfo::from_user_agent("curl/8.5.0", None).device_type,
            DeviceType::Bot
        );
        assert_eq!(
            DeviceInfo::from_user_agent("", None).device_type,
            DeviceType::Unknown
        );
    }

    #[test]
    fn fingerprint_depends_on_extra_signal() {
        let plain = fingerprint(FIREFOX_LINUX, None);
        assert_eq!(plain, fingerprint(FIREFOX_LINUX, None));
        assert_ne!(plain, fingerprint(FIREFOX_LINUX, Some("device-1")));
        assert!(!plain.contains(FIREFOX_LINUX));
    }

    #[test]
    fn local_addresses() {
        assert!(LocationInfo::from_ip("127.0.0.1").is_local());
        assert!(LocationInfo::from_ip("10.1.2.3").is_local());
        assert!(LocationInfo::from_ip("172.20.0.1").is_local());
        assert!(LocationInfo::from_ip("192.168.1.1").is_local());
        assert!(LocationInfo::from_ip("::1").is_local());
        assert!(!LocationInfo::from_ip("172.32.0.1").is_local());
        assert!(!LocationInfo::from_ip("8.8.8.8").is_local());
        assert!(!LocationInfo::from_ip("unknown").is_valid_ip());
        assert_eq!(LocationInfo::from_ip("10.0.0.1").display(), "Local network");
    }
}
