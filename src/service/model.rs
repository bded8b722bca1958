//! Discovered service instances and their routing weight.

use crate::service::Filter;
use serde::{Deserialize, Serialize};

/// Tag prefix carrying the datacenter a service was registered in.
const DATACENTER_TAG: &str = "DC=";

/// Tag prefix carrying the CPU usage percentage of an instance.
const CPU_USAGE_TAG: &str = "CPU_USAGE=";

/// Tag prefix carrying the memory usage percentage of an instance.
const MEMORY_USAGE_TAG: &str = "MEMORY_USAGE=";

/// Largest routing weight a service can carry. Keeps pool totals far from
/// overflow however many members a pool has.
pub const MAX_WEIGHT: u64 = u32::MAX as u64;

/// Health status reported by the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Undefined,
    #[serde(alias = "pass")]
    Passing,
    #[serde(alias = "warn")]
    Warning,
    #[serde(alias = "fail", alias = "fall")]
    Critical,
}

impl Status {
    /// Map a registry health-check state onto a status.
    ///
    /// Unknown states map to [`Status::Undefined`].
    pub fn from_check(state: &str) -> Self {
        match state {
            "pass" | "passing" => Status::Passing,
            "warn" | "warning" => Status::Warning,
            "fail" | "fall" | "critical" => Status::Critical,
            _ => Status::Undefined,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Undefined => "undefined",
            Status::Passing => "passing",
            Status::Warning => "warning",
            Status::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// One discovered service instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    /// Registry-assigned identifier, unique within the registry.
    pub id: String,
    /// Logical service name; instances sharing it form one upstream.
    pub name: String,
    pub datacenter: String,
    pub address: String,
    pub port: u16,
    /// `key=value` annotations, in registry order.
    pub tags: Vec<String>,
    pub status: Status,
    weight: i64,
}

impl Service {
    /// Create an undefined-status service with no tags.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            datacenter: String::new(),
            address: address.into(),
            port,
            tags: Vec::new(),
            status: Status::Undefined,
            weight: 0,
        }
    }

    /// Replace the tags, deriving the datacenter from a `DC=` tag if present.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        if let Some(dc) = datacenter_from_tags(&self.tags) {
            self.datacenter = dc.to_string();
        }
        self
    }

    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = datacenter.into();
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// Assign the stored weight without touching the status.
    pub fn with_weight(mut self, weight: i64) -> Self {
        self.weight = weight;
        self
    }

    /// Routable `address:port` of the instance.
    pub fn host(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// Effective routing weight.
    ///
    /// Zero unless the service is passing; a passing service weighs between
    /// one and [`MAX_WEIGHT`].
    pub fn weight(&self) -> u64 {
        if self.status != Status::Passing {
            return 0;
        }
        self.weight.clamp(1, MAX_WEIGHT as i64) as u64
    }

    /// Store a new weight. A non-positive weight takes the service out of
    /// rotation by resetting its status to [`Status::Undefined`].
    pub fn set_weight(&mut self, weight: i64) {
        if weight < 1 {
            self.status = Status::Undefined;
        }
        self.weight = weight;
    }

    /// Whether the service satisfies `filter`. No filter matches everything.
    pub fn test(&self, filter: Option<&Filter>) -> bool {
        filter.is_none_or(|f| f.matches(self))
    }
}

/// Load score derived from `CPU_USAGE=` and `MEMORY_USAGE=` tags.
///
/// Both tags hold percentages (0-100); the score is
/// `round(1000 * (mem / 2 + cpu) / 150)`, so it grows with usage and
/// tops out at 1000. Missing or malformed tags count as zero usage;
/// out-of-range values are clamped.
pub fn weight_by_tags<S: AsRef<str>>(tags: &[S]) -> i64 {
    let mut cpu_usage = 0.0_f64;
    let mut memory_usage = 0.0_f64;

    for tag in tags {
        let tag = tag.as_ref();
        if let Some(value) = tag.strip_prefix(CPU_USAGE_TAG) {
            cpu_usage = parse_usage(value);
        } else if let Some(value) = tag.strip_prefix(MEMORY_USAGE_TAG) {
            memory_usage = parse_usage(value);
        }
    }

    (1000.0 * ((memory_usage / 2.0 + cpu_usage) / 150.0)).round() as i64
}

/// Usage percentage clamped to 0-100; non-numeric and non-finite values
/// count as zero.
fn parse_usage(value: &str) -> f64 {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map_or(0.0, |v| v.clamp(0.0, 100.0))
}

/// Datacenter named by the first `DC=` tag.
pub fn datacenter_from_tags<S: AsRef<str>>(tags: &[S]) -> Option<&str> {
    tags.iter()
        .find_map(|tag| tag.as_ref().strip_prefix(DATACENTER_TAG))
}

/// Order services by registry ID.
pub fn sort_by_id(services: &mut [Service]) {
    services.sort_by(|a, b| a.id.cmp(&b.id));
}
