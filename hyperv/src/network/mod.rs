//! Virtual network adapter attachments.

mod attachment;

pub use attachment::NetworkAttachmentManager;

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Adapter name used when none is given.
pub const DEFAULT_ADAPTER_NAME: &str = "Network Adapter";

fn default_adapter_name() -> String {
    DEFAULT_ADAPTER_NAME.to_string()
}

/// A synthetic network adapter bound to a virtual switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAdapterSpec {
    #[serde(default = "default_adapter_name")]
    pub name: String,
    /// Name of an existing virtual switch on the host.
    pub switch_name: String,
    /// Static MAC address. `None` lets the host assign one dynamically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

impl NetworkAdapterSpec {
    pub fn new(switch_name: impl Into<String>) -> Self {
        Self {
            name: default_adapter_name(),
            switch_name: switch_name.into(),
            mac_address: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac_address = Some(mac.into());
        self
    }

    /// Static MAC in host form (12 upper-case hex digits), if one is set and valid.
    pub fn static_mac(&self) -> Option<String> {
        self.mac_address.as_deref().and_then(normalize_mac)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation(
                "networkAdapters.name",
                "adapter name cannot be empty",
            ));
        }
        if self.switch_name.trim().is_empty() {
            return Err(Error::validation(
                "networkAdapters.switchName",
                "switch name is required",
            ));
        }
        if let Some(mac) = &self.mac_address {
            if normalize_mac(mac).is_none() {
                return Err(Error::validation(
                    "networkAdapters.macAddress",
                    format!("'{}' is not a MAC address", mac),
                ));
            }
        }
        Ok(())
    }
}

// Adapters carry no host identity of their own, so two specs are the same
// adapter when name, switch and static MAC agree.
impl PartialEq for NetworkAdapterSpec {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.switch_name == other.switch_name
            && self.static_mac() == other.static_mac()
    }
}

impl Eq for NetworkAdapterSpec {}

impl fmt::Display for NetworkAdapterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' on switch '{}'", self.name, self.switch_name)?;
        if let Some(mac) = self.static_mac() {
            write!(f, " ({})", mac)?;
        }
        Ok(())
    }
}

/// Normalize a MAC address to 12 upper-case hex digits.
///
/// Accepts `00:15:5D:01:02:03`, `00-15-5d-01-02-03` and `00155D010203`.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let digits: String = mac
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect();
    if digits.len() == 12 && digits.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(digits.to_ascii_uppercase())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_mac() {
        assert_eq!(
            normalize_mac("00:15:5d:01:02:03").as_deref(),
            Some("00155D010203")
        );
        assert_eq!(
            normalize_mac("00-15-5D-01-02-03").as_deref(),
            Some("00155D010203")
        );
        assert_eq!(normalize_mac("00155d010203").as_deref(), Some("00155D010203"));
        assert!(normalize_mac("00:15:5d:01:02").is_none());
        assert!(normalize_mac("zz:15:5d:01:02:03").is_none());
    }

    #[test]
    fn test_adapter_defaults_from_json() {
        let adapter: NetworkAdapterSpec =
            serde_json::from_str(r#"{"switchName":"Default Switch"}"#).unwrap();
        assert_eq!(adapter.name, DEFAULT_ADAPTER_NAME);
        assert_eq!(adapter.switch_name, "Default Switch");
        assert!(adapter.mac_address.is_none());
    }

    #[test]
    fn test_adapter_equality_ignores_mac_formatting() {
        let a = NetworkAdapterSpec::new("external").with_mac("00:15:5d:aa:bb:cc");
        let b = NetworkAdapterSpec::new("external").with_mac("00155DAABBCC");
        assert_eq!(a, b);
        assert_ne!(a, NetworkAdapterSpec::new("external"));
        assert_ne!(
            NetworkAdapterSpec::new("external"),
            NetworkAdapterSpec::new("internal")
        );
    }

    #[test]
    fn test_adapter_validation() {
        assert!(NetworkAdapterSpec::new("external").validate().is_ok());
        assert!(NetworkAdapterSpec::new("").validate().is_err());
        assert!(NetworkAdapterSpec::new("external")
            .named(" ")
            .validate()
            .is_err());
        assert!(matches!(
            NetworkAdapterSpec::new("external").with_mac("nope").validate(),
            Err(Error::Validation { field: "networkAdapters.macAddress", .. })
        ));
    }
}
