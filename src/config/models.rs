use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::transport::HttpConfig;

/// Top-level configuration for the binary.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub log: LogConfig,
}

/// Engine-level knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FetchConfig {
    #[serde(default = "default_verify_media_type")]
    pub verify_media_type: bool,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            verify_media_type: default_verify_media_type(),
            max_redirects: default_max_redirects(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// HTTP transport tunables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpSection {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Response body cap, human-readable (`100MB`); absent means unlimited.
    #[serde(default)]
    pub max_body: Option<ByteSize>,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            user_agent: default_user_agent(),
            max_body: None,
        }
    }
}

impl HttpSection {
    pub fn to_transport_config(&self) -> HttpConfig {
        HttpConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            user_agent: self.user_agent.clone(),
            max_body_bytes: self.max_body.map(|b| b.as_u64()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// tracing filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { filter: default_log_filter() }
    }
}

fn default_verify_media_type() -> bool {
    true
}

fn default_max_redirects() -> u32 {
    crate::binding::DEFAULT_MAX_REDIRECTS
}

fn default_queue_capacity() -> usize {
    crate::binding::DEFAULT_QUEUE_CAPACITY
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_user_agent() -> String {
    concat!("bindbox/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_log_filter() -> String {
    "bindbox=info".to_string()
}

/// Byte count parsed from plain integers or `KB`/`MB`/`GB` suffixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn display(self) -> String {
        const UNITS: &[(u64, &str)] = &[
            (1 << 30, "GB"),
            (1 << 20, "MB"),
            (1 << 10, "KB"),
        ];
        for &(divisor, unit) in UNITS {
            if self.0 >= divisor {
                let whole = self.0 / divisor;
                let tenths = (self.0 % divisor) * 10 / divisor;
                return if tenths == 0 {
                    format!("{whole}{unit}")
                } else {
                    format!("{whole}.{tenths}{unit}")
                };
            }
        }
        format!("{}B", self.0)
    }
}

impl FromStr for ByteSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        let (digits, unit) = s.split_at(split);
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid byte size: {s}"))?;
        let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
            "" | "B" => 1,
            "KB" | "K" => 1 << 10,
            "MB" | "M" => 1 << 20,
            "GB" | "G" => 1 << 30,
            other => return Err(format!("invalid byte unit: {other}")),
        };
        value
            .checked_mul(multiplier)
            .map(ByteSize)
            .ok_or_else(|| format!("byte size overflows: {s}"))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(ByteSize(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_size_parsing() {
        assert_eq!("1024".parse::<ByteSize>().unwrap(), ByteSize(1024));
        assert_eq!("5MB".parse::<ByteSize>().unwrap(), ByteSize(5 * 1024 * 1024));
        assert_eq!("2 GB".parse::<ByteSize>().unwrap(), ByteSize(2 << 30));
        assert_eq!("10k".parse::<ByteSize>().unwrap(), ByteSize(10 * 1024));
        assert!("abc".parse::<ByteSize>().is_err());
        assert!("5XB".parse::<ByteSize>().is_err());
    }

    #[test]
    fn test_byte_size_display() {
        assert_eq!(ByteSize(512).display(), "512B");
        assert_eq!(ByteSize(1536).display(), "1.5KB");
        assert_eq!(ByteSize(5 * 1024 * 1024).display(), "5MB");
    }

    #[test]
    fn test_http_section_conversion() {
        let section = HttpSection {
            connect_timeout_secs: 5,
            request_timeout_secs: 30,
            user_agent: "test/1".to_string(),
            max_body: Some(ByteSize(1024)),
        };
        let config = section.to_transport_config();
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_body_bytes, Some(1024));
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.fetch.verify_media_type);
        assert_eq!(config.fetch.max_redirects, 10);
        assert_eq!(config.http.connect_timeout_secs, 10);
        assert!(config.http.max_body.is_none());
        assert_eq!(config.log.filter, "bindbox=info");
    }
}
