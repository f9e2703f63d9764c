//! Validation of fleet configuration and machine descriptions.

use crate::{CorralError, CorralResult};

use super::{FleetConfig, VmSpec, MAX_NUM_VCPUS, MIN_MEMORY_MIB, MIN_NUM_VCPUS};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmSpec {
    /// Validates this machine description against fleet-wide limits.
    ///
    /// All violations are collected so the caller sees every problem at once.
    pub fn validate(&self, config: &FleetConfig) -> CorralResult<()> {
        let mut errors = Vec::new();

        self.validate_name(&mut errors);
        self.validate_resources(&mut errors);
        self.validate_network(config, &mut errors);
        self.validate_storage(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CorralError::SpecValidation(errors))
        }
    }

    /// Ensures the name is non-empty, reasonably short, and uses a safe alphabet.
    fn validate_name(&self, errors: &mut Vec<String>) {
        if self.name.is_empty() {
            errors.push("name cannot be empty".to_string());
            return;
        }

        if self.name.len() > 63 {
            errors.push(format!(
                "name '{}' is longer than 63 characters",
                self.name
            ));
        }

        let valid_chars = self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid_chars || !self.name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            errors.push(format!(
                "name '{}' must start alphanumeric and contain only alphanumerics, '-' and '_'",
                self.name
            ));
        }

        if self.owner_id.is_empty() {
            errors.push("owner_id cannot be empty".to_string());
        }
    }

    /// Ensures vcpus and memory are within global and OS-family bounds.
    fn validate_resources(&self, errors: &mut Vec<String>) {
        if self.vcpus < MIN_NUM_VCPUS || self.vcpus > MAX_NUM_VCPUS {
            errors.push(format!(
                "vcpus must be between {} and {}, got {}",
                MIN_NUM_VCPUS, MAX_NUM_VCPUS, self.vcpus
            ));
        }

        if self.memory_mib < MIN_MEMORY_MIB {
            errors.push(format!(
                "memory_mib must be at least {}, got {}",
                MIN_MEMORY_MIB, self.memory_mib
            ));
        }

        if self.vcpus < self.os_kind.min_vcpus() {
            errors.push(format!(
                "{} guests require at least {} vcpus, got {}",
                self.os_kind,
                self.os_kind.min_vcpus(),
                self.vcpus
            ));
        }

        if self.memory_mib < self.os_kind.min_memory_mib() {
            errors.push(format!(
                "{} guests require at least {} MiB of memory, got {}",
                self.os_kind,
                self.os_kind.min_memory_mib(),
                self.memory_mib
            ));
        }
    }

    /// Ensures a requested static address lies inside the configured subnet.
    fn validate_network(&self, config: &FleetConfig, errors: &mut Vec<String>) {
        if let Some(static_ip) = self.network.static_ip {
            let subnet = config.get_network().get_subnet();
            if !subnet.contains(static_ip) {
                errors.push(format!(
                    "static ip {} is not inside the configured subnet {}",
                    static_ip, subnet
                ));
            }
        }
    }

    fn validate_storage(&self, errors: &mut Vec<String>) {
        if let Some(disk_size_gib) = self.storage.disk_size_gib {
            if disk_size_gib == 0 {
                errors.push("disk_size_gib cannot be zero".to_string());
            }
        }
    }
}

impl FleetConfig {
    /// Validates the configuration's internal consistency.
    pub fn validate(&self) -> CorralResult<()> {
        let mut errors = Vec::new();

        let network = self.get_network();
        if network.get_forward_port_start() > network.get_forward_port_end() {
            errors.push(format!(
                "forward port range is empty: {}..={}",
                network.get_forward_port_start(),
                network.get_forward_port_end()
            ));
        }

        if network.get_subnet().size() < 4 {
            errors.push(format!(
                "subnet {} is too small to carve an address pool from",
                network.get_subnet()
            ));
        }

        let capacity = self.get_capacity();
        if *capacity.get_total_cpus() == 0 || *capacity.get_total_memory_mib() == 0 {
            errors.push("system capacity cannot be zero".to_string());
        }

        let mut tier_names = std::collections::HashSet::new();
        for tier in capacity.get_tiers() {
            if !tier_names.insert(tier.get_name().as_str()) {
                errors.push(format!("duplicate quota tier '{}'", tier.get_name()));
            }
        }
        for (owner, tier_name) in capacity.get_owners() {
            if !tier_names.contains(tier_name.as_str()) {
                errors.push(format!(
                    "owner '{}' references unknown quota tier '{}'",
                    owner, tier_name
                ));
            }
        }

        let monitor = self.get_monitor();
        if monitor.get_low_watermark() >= monitor.get_high_watermark() {
            errors.push(format!(
                "low watermark {} must be below high watermark {}",
                monitor.get_low_watermark(),
                monitor.get_high_watermark()
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CorralError::ConfigValidation(errors))
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OsKind, VmNetworkSpec};

    mod fixtures {
        use super::*;

        pub fn linux_spec(name: &str) -> VmSpec {
            VmSpec::builder()
                .name(name)
                .os_kind(OsKind::Linux)
                .vcpus(2)
                .memory_mib(512)
                .owner_id("owner-1")
                .build()
        }
    }

    #[test]
    fn test_valid_spec_passes() {
        let config = FleetConfig::default();
        assert!(fixtures::linux_spec("web-1").validate(&config).is_ok());
    }

    #[test]
    fn test_vcpu_bounds_rejected() {
        let config = FleetConfig::default();

        let mut spec = fixtures::linux_spec("web-1");
        spec.vcpus = 0;
        let err = spec.validate(&config).unwrap_err();
        assert!(matches!(err, CorralError::SpecValidation(_)));

        let mut spec = fixtures::linux_spec("web-1");
        spec.vcpus = 65;
        assert!(spec.validate(&config).is_err());
    }

    #[test]
    fn test_windows_minimums_enforced() {
        let config = FleetConfig::default();

        let mut spec = fixtures::linux_spec("win-1");
        spec.os_kind = OsKind::Windows;
        spec.vcpus = 1;
        spec.memory_mib = 512;

        let err = spec.validate(&config).unwrap_err();
        let CorralError::SpecValidation(errors) = err else {
            panic!("expected spec validation errors");
        };
        assert!(errors.iter().any(|e| e.contains("at least 2 vcpus")));
        assert!(errors.iter().any(|e| e.contains("1024 MiB")));
    }

    #[test]
    fn test_bad_name_rejected() {
        let config = FleetConfig::default();

        for bad in ["", "-leading-dash", "has space", "has/slash"] {
            let mut spec = fixtures::linux_spec("placeholder");
            spec.name = bad.to_string();
            assert!(spec.validate(&config).is_err(), "name {:?} passed", bad);
        }
    }

    #[test]
    fn test_static_ip_outside_subnet_rejected() {
        let config = FleetConfig::default();

        let mut spec = fixtures::linux_spec("web-1");
        spec.network = VmNetworkSpec {
            bridge: None,
            static_ip: Some("192.168.250.7".parse().unwrap()),
        };

        let err = spec.validate(&config).unwrap_err();
        let CorralError::SpecValidation(errors) = err else {
            panic!("expected spec validation errors");
        };
        assert!(errors.iter().any(|e| e.contains("not inside")));
    }

    #[test]
    fn test_fleet_config_watermark_ordering_enforced() {
        let mut config = FleetConfig::default();
        config.monitor.low_watermark = 0.9;
        config.monitor.high_watermark = 0.5;
        assert!(config.validate().is_err());
    }
}
