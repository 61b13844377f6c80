//! Per-platform command profiles used by the SSH adapter.
//!
//! Driver names follow the short napalm style (`ios`, `eos`, ...); the
//! netmiko style device types (`cisco_ios`, `arista_eos`, ...) are accepted
//! as aliases.

/// Commands and wrappers for one device platform
#[derive(Debug)]
pub struct DriverProfile {
    pub name: &'static str,
    /// Privilege escalation command sent before the enable secret
    pub enable: Option<&'static str>,
    /// Disables output paging for the session
    pub disable_paging: Option<&'static str>,
    pub config_enter: &'static str,
    pub config_exit: &'static str,
    /// Wrapper for merging a candidate; `{CONFIG}` is replaced with the payload
    pub merge_command: &'static str,
    /// Wrapper for replacing the running configuration, if the platform can
    pub replace_command: Option<&'static str>,
    pub rollback_command: Option<&'static str>,
    /// getter name -> show command
    pub getters: &'static [(&'static str, &'static str)],
    /// Output prefixes that mean the device rejected a line
    pub error_markers: &'static [&'static str],
}

impl DriverProfile {
    pub fn getter_command(&self, getter: &str) -> Option<&'static str> {
        self.getters
            .iter()
            .find(|(name, _)| *name == getter)
            .map(|(_, cmd)| *cmd)
    }

    /// Return the first line of `output` that looks like a device error
    pub fn find_error<'a>(&self, output: &'a str) -> Option<&'a str> {
        output.lines().map(str::trim).find(|line| {
            self.error_markers
                .iter()
                .any(|marker| line.starts_with(marker))
        })
    }
}

const CISCO_ERRORS: &[&str] = &["% Invalid", "% Incomplete", "% Ambiguous", "% Unknown", "% Error"];

static IOS: DriverProfile = DriverProfile {
    name: "ios",
    enable: Some("enable"),
    disable_paging: Some("terminal length 0"),
    config_enter: "configure terminal",
    config_exit: "end",
    merge_command: "configure terminal\n{CONFIG}\nend\nwrite memory",
    replace_command: Some("configure replace terminal force\n{CONFIG}\nend"),
    rollback_command: Some("configure replace flash:rollback-0 force"),
    getters: &[
        ("get_facts", "show version"),
        ("get_interfaces", "show interfaces"),
        ("get_interfaces_ip", "show ip interface brief"),
        ("get_arp_table", "show ip arp"),
        ("get_mac_address_table", "show mac address-table"),
        ("get_lldp_neighbors", "show lldp neighbors"),
        ("get_bgp_neighbors", "show ip bgp summary"),
        ("get_environment", "show environment all"),
        ("get_config", "show running-config"),
    ],
    error_markers: CISCO_ERRORS,
};

static EOS: DriverProfile = DriverProfile {
    name: "eos",
    enable: Some("enable"),
    disable_paging: Some("terminal length 0"),
    config_enter: "configure terminal",
    config_exit: "end",
    merge_command: "configure session forge\n{CONFIG}\ncommit\nwrite memory",
    replace_command: Some("configure session forge\nrollback clean-config\n{CONFIG}\ncommit\nwrite memory"),
    rollback_command: Some("configure replace checkpoint:forge-rollback"),
    getters: &[
        ("get_facts", "show version"),
        ("get_interfaces", "show interfaces"),
        ("get_interfaces_ip", "show ip interface brief"),
        ("get_arp_table", "show arp"),
        ("get_mac_address_table", "show mac address-table"),
        ("get_lldp_neighbors", "show lldp neighbors"),
        ("get_bgp_neighbors", "show ip bgp summary"),
        ("get_environment", "show environment all"),
        ("get_config", "show running-config"),
    ],
    error_markers: CISCO_ERRORS,
};

static NXOS: DriverProfile = DriverProfile {
    name: "nxos",
    enable: None,
    disable_paging: Some("terminal length 0"),
    config_enter: "configure terminal",
    config_exit: "end",
    merge_command: "configure terminal\n{CONFIG}\nend\ncopy running-config startup-config",
    replace_command: None,
    rollback_command: Some("rollback running-config checkpoint forge-rollback"),
    getters: &[
        ("get_facts", "show version"),
        ("get_interfaces", "show interface"),
        ("get_interfaces_ip", "show ip interface brief"),
        ("get_arp_table", "show ip arp"),
        ("get_mac_address_table", "show mac address-table"),
        ("get_lldp_neighbors", "show lldp neighbors"),
        ("get_bgp_neighbors", "show ip bgp summary"),
        ("get_environment", "show environment"),
        ("get_config", "show running-config"),
    ],
    error_markers: CISCO_ERRORS,
};

static IOSXR: DriverProfile = DriverProfile {
    name: "iosxr",
    enable: None,
    disable_paging: Some("terminal length 0"),
    config_enter: "configure terminal",
    config_exit: "end",
    merge_command: "configure terminal\n{CONFIG}\ncommit\nend",
    replace_command: Some("configure terminal\n{CONFIG}\ncommit replace\nend"),
    rollback_command: Some("rollback configuration last 1"),
    getters: &[
        ("get_facts", "show version"),
        ("get_interfaces", "show interfaces"),
        ("get_interfaces_ip", "show ipv4 interface brief"),
        ("get_arp_table", "show arp"),
        ("get_lldp_neighbors", "show lldp neighbors"),
        ("get_bgp_neighbors", "show bgp summary"),
        ("get_config", "show running-config"),
    ],
    error_markers: CISCO_ERRORS,
};

static JUNOS: DriverProfile = DriverProfile {
    name: "junos",
    enable: None,
    disable_paging: Some("set cli screen-length 0"),
    config_enter: "configure",
    config_exit: "exit configuration-mode",
    merge_command: "configure\nload merge terminal relative\n{CONFIG}\n\u{4}\ncommit and-quit",
    replace_command: Some("configure\nload override terminal\n{CONFIG}\n\u{4}\ncommit and-quit"),
    rollback_command: Some("configure\nrollback 1\ncommit and-quit"),
    getters: &[
        ("get_facts", "show version"),
        ("get_interfaces", "show interfaces"),
        ("get_interfaces_ip", "show interfaces terse"),
        ("get_arp_table", "show arp no-resolve"),
        ("get_mac_address_table", "show ethernet-switching table"),
        ("get_lldp_neighbors", "show lldp neighbors"),
        ("get_bgp_neighbors", "show bgp summary"),
        ("get_environment", "show chassis environment"),
        ("get_config", "show configuration"),
    ],
    error_markers: &["error:", "syntax error", "unknown command"],
};

/// Resolve a driver name (napalm or netmiko style) to its profile
pub fn lookup(driver: &str) -> Option<&'static DriverProfile> {
    match driver.trim().to_lowercase().as_str() {
        "ios" | "cisco_ios" | "cisco_xe" | "cisco_ios_ssh" => Some(&IOS),
        "eos" | "arista_eos" | "arista" => Some(&EOS),
        "nxos" | "nxos_ssh" | "cisco_nxos" => Some(&NXOS),
        "iosxr" | "cisco_xr" | "cisco_iosxr" => Some(&IOSXR),
        "junos" | "juniper" | "juniper_junos" => Some(&JUNOS),
        _ => None,
    }
}
