//! Strong types for VM configuration values.
//!
//! Each type can only hold a value inside the range the host accepts, so
//! anything that reaches a [`HostSession`](crate::host::HostSession) has
//! already been range checked.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Memory size in megabytes.
///
/// Validates that memory is within Hyper-V limits:
/// - Minimum: 32 MB
/// - Maximum: 12 TB (12,582,912 MB)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryMB(u64);

impl MemoryMB {
    /// Minimum memory in MB (32 MB).
    pub const MIN: u64 = 32;
    /// Maximum memory in MB (12 TB).
    pub const MAX: u64 = 12 * 1024 * 1024;
    /// Allocation unit the host rounds memory sizes to.
    pub const GRANULARITY: u64 = 2;

    /// Create from megabytes.
    ///
    /// Returns `None` if outside valid range (32 MB - 12 TB).
    pub fn new(mb: u64) -> Option<Self> {
        if (Self::MIN..=Self::MAX).contains(&mb) {
            Some(Self(mb))
        } else {
            None
        }
    }

    /// Create from gigabytes.
    pub fn from_gb(gb: u64) -> Option<Self> {
        Self::new(gb.saturating_mul(1024))
    }

    /// Get value in megabytes.
    pub fn as_mb(&self) -> u64 {
        self.0
    }

    /// Round up to the host allocation unit.
    ///
    /// `MAX` is already aligned, so the result stays in range.
    pub fn aligned(&self) -> Self {
        let rem = self.0 % Self::GRANULARITY;
        if rem == 0 {
            *self
        } else {
            Self(self.0 + (Self::GRANULARITY - rem))
        }
    }
}

impl Default for MemoryMB {
    fn default() -> Self {
        Self(1024)
    }
}

impl fmt::Display for MemoryMB {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 && self.0 % 1024 == 0 {
            write!(f, "{} GB", self.0 / 1024)
        } else {
            write!(f, "{} MB", self.0)
        }
    }
}

/// Virtual processor count.
///
/// Validates that processor count is within Hyper-V limits:
/// - Minimum: 1
/// - Maximum: 240
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessorCount(u32);

impl ProcessorCount {
    /// Minimum processor count.
    pub const MIN: u32 = 1;
    /// Maximum processor count.
    pub const MAX: u32 = 240;

    /// Create a new processor count.
    ///
    /// Returns `None` if outside valid range (1-240).
    pub fn new(count: u32) -> Option<Self> {
        if (Self::MIN..=Self::MAX).contains(&count) {
            Some(Self(count))
        } else {
            None
        }
    }

    /// Get the processor count.
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl Default for ProcessorCount {
    fn default() -> Self {
        Self(1)
    }
}

impl fmt::Display for ProcessorCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} vCPU{}", self.0, if self.0 == 1 { "" } else { "s" })
    }
}

/// Dynamic memory bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DynamicMemory {
    pub minimum: MemoryMB,
    pub maximum: MemoryMB,
}

/// Startup memory plus optional dynamic bounds, as applied to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryConfiguration {
    pub startup: MemoryMB,
    pub dynamic: Option<DynamicMemory>,
}

impl MemoryConfiguration {
    /// Static memory of the given size.
    pub fn fixed(startup: MemoryMB) -> Self {
        Self {
            startup,
            dynamic: None,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic.is_some()
    }

    /// Round every value up to the host allocation unit.
    pub fn aligned(&self) -> Self {
        Self {
            startup: self.startup.aligned(),
            dynamic: self.dynamic.map(|d| DynamicMemory {
                minimum: d.minimum.aligned(),
                maximum: d.maximum.aligned(),
            }),
        }
    }
}

impl fmt::Display for MemoryConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dynamic {
            Some(d) => write!(
                f,
                "{} dynamic ({} - {})",
                self.startup, d.minimum, d.maximum
            ),
            None => write!(f, "{} static", self.startup),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_mb_validation() {
        assert!(MemoryMB::new(31).is_none());
        assert!(MemoryMB::new(32).is_some());
        assert!(MemoryMB::new(MemoryMB::MAX).is_some());
        assert!(MemoryMB::new(MemoryMB::MAX + 1).is_none());
        assert_eq!(MemoryMB::from_gb(4).map(|m| m.as_mb()), Some(4096));
    }

    #[test]
    fn test_memory_mb_alignment() {
        let odd = MemoryMB::new(1001).unwrap();
        assert_eq!(odd.aligned().as_mb(), 1002);
        let even = MemoryMB::new(1000).unwrap();
        assert_eq!(even.aligned(), even);
        let max = MemoryMB::new(MemoryMB::MAX).unwrap();
        assert_eq!(max.aligned(), max);
    }

    #[test]
    fn test_memory_mb_display() {
        assert_eq!(MemoryMB::new(2048).unwrap().to_string(), "2 GB");
        assert_eq!(MemoryMB::new(1000).unwrap().to_string(), "1000 MB");
    }

    #[test]
    fn test_processor_count_validation() {
        assert!(ProcessorCount::new(0).is_none());
        assert!(ProcessorCount::new(1).is_some());
        assert!(ProcessorCount::new(240).is_some());
        assert!(ProcessorCount::new(241).is_none());
        assert_eq!(ProcessorCount::new(4).unwrap().to_string(), "4 vCPUs");
        assert_eq!(ProcessorCount::default().to_string(), "1 vCPU");
    }

    #[test]
    fn test_memory_configuration_alignment() {
        let config = MemoryConfiguration {
            startup: MemoryMB::new(1023).unwrap(),
            dynamic: Some(DynamicMemory {
                minimum: MemoryMB::new(511).unwrap(),
                maximum: MemoryMB::new(4096).unwrap(),
            }),
        };
        let aligned = config.aligned();
        assert_eq!(aligned.startup.as_mb(), 1024);
        assert_eq!(aligned.dynamic.unwrap().minimum.as_mb(), 512);
        assert_eq!(aligned.dynamic.unwrap().maximum.as_mb(), 4096);
        assert!(aligned.is_dynamic());
        assert!(!MemoryConfiguration::fixed(MemoryMB::default()).is_dynamic());
    }
}
