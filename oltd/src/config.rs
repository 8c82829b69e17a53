// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Configuration for `oltd`.

use serde::Deserialize;

use crate::types::OltError;
use crate::types::OltResult;
use common::logging::LogFormat;

/// The Config structure captures all of the run-time settings of the daemon:
/// the provisioning knobs (deserialized from an optional TOML file whose keys
/// use the knobs' canonical camelCase names) and the process-level options
/// that only make sense on the command line.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct Config {
    /// Create DHCP trap flows on NNI ports.
    pub enable_dhcp_on_nni: bool,

    /// Trap DHCPv4 when a service requires DHCP.
    pub enable_dhcp_v4: bool,

    /// Trap DHCPv6 when a service requires DHCP.
    pub enable_dhcp_v6: bool,

    /// Create IGMP trap flows on NNI ports.
    pub enable_igmp_on_nni: bool,

    /// Send EAPOL authentication trap flows before subscriber provisioning.
    pub enable_eapol: bool,

    /// Send PPPoED authentication trap flows.
    pub enable_pppoe: bool,

    /// Technology profile id substituted when a service doesn't carry one.
    pub default_tech_profile_id: i32,

    /// Hold a subscriber's provisioning until the default EAPOL removal is
    /// confirmed, so the removal and the tagged add never share a batch.
    pub wait_for_removal: bool,

    /// Bandwidth profile backing the default EAPOL trap meter.
    pub default_bp_id: String,

    /// Services carrying this name get no dataplane flows of their own;
    /// multicast delivery is programmed elsewhere.
    pub multicast_service_name: String,

    /// How long a task may stay parked waiting for MAC learning before it is
    /// dropped, in seconds.  Zero disables the cap.
    pub mac_learning_timeout_secs: u64,

    /// If set, where the log should be written.  If not set, the log goes to
    /// stdout.
    #[serde(skip)]
    pub log_file: Option<String>,

    /// Output log info in unstructured text or json?
    #[serde(skip)]
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enable_dhcp_on_nni: true,
            enable_dhcp_v4: true,
            enable_dhcp_v6: false,
            enable_igmp_on_nni: false,
            enable_eapol: true,
            enable_pppoe: false,
            default_tech_profile_id: 64,
            wait_for_removal: true,
            default_bp_id: "Default".to_string(),
            multicast_service_name: "multicastServiceName".to_string(),
            mac_learning_timeout_secs: 300,
            log_file: None,
            log_format: LogFormat::Json,
        }
    }
}

// Use the command-line arguments to update the run-time config.
fn update_from_cli(opts: &crate::Opt, config: &mut Config) {
    if let Some(log_file) = &opts.log_file {
        config.log_file = Some(log_file.to_string());
    }

    if let Some(log_format) = opts.log_format {
        config.log_format = log_format;
    }
}

/// This builds a Config struct containing the tunable settings used to
/// adjust the daemon's behavior: the defaults, overridden by the TOML knob
/// file when one is given, overridden by command-line options.
pub fn build_config(opts: &crate::Opt) -> OltResult<Config> {
    let mut config = match &opts.config {
        Some(path) => {
            let txt = std::fs::read_to_string(path)?;
            toml::from_str(&txt)
                .map_err(|e| OltError::Other(e.to_string()))?
        }
        None => Config::default(),
    };

    update_from_cli(opts, &mut config);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert!(c.enable_dhcp_on_nni);
        assert!(c.enable_dhcp_v4);
        assert!(!c.enable_dhcp_v6);
        assert!(!c.enable_igmp_on_nni);
        assert!(c.enable_eapol);
        assert!(!c.enable_pppoe);
        assert_eq!(c.default_tech_profile_id, 64);
        assert!(c.wait_for_removal);
        assert_eq!(c.default_bp_id, "Default");
        assert_eq!(c.multicast_service_name, "multicastServiceName");
    }

    #[test]
    fn test_knob_file_uses_canonical_names() {
        let c: Config = toml::from_str(
            r#"
            enableDhcpV6 = true
            enableEapol = false
            defaultBpId = "High-Speed-Internet"
            defaultTechProfileId = 66
            "#,
        )
        .unwrap();
        assert!(c.enable_dhcp_v6);
        assert!(!c.enable_eapol);
        assert_eq!(c.default_bp_id, "High-Speed-Internet");
        assert_eq!(c.default_tech_profile_id, 66);
        // unset knobs keep their defaults
        assert!(c.wait_for_removal);
    }

    #[test]
    fn test_unknown_knob_is_rejected() {
        assert!(toml::from_str::<Config>("enableFoo = true").is_err());
    }
}
