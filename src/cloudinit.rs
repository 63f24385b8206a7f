//! NoCloud seed contents for a fresh VM.
//!
//! Three documents go into the seed ISO: `meta-data` (instance id and
//! hostname), `user-data` (`#cloud-config` with the login user and our SSH
//! key) and `network-config` (netplan v2). The network document is also
//! reused by the second-stage script to pin the address with netplan.

use crate::error::Result;
use crate::vm_config::VmConfig;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
struct MetaData<'a> {
    #[serde(rename = "instance-id")]
    instance_id: &'a str,
    #[serde(rename = "local-hostname")]
    local_hostname: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct CloudUser<'a> {
    name: &'a str,
    sudo: &'static str,
    shell: &'static str,
    groups: Vec<&'static str>,
    lock_passwd: bool,
    ssh_authorized_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct UserData<'a> {
    hostname: &'a str,
    manage_etc_hosts: bool,
    users: Vec<CloudUser<'a>>,
    ssh_pwauth: bool,
    package_update: bool,
    packages: Vec<&'static str>,
    runcmd: Vec<Vec<&'static str>>,
}

/// netplan v2 `network:` body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkConfig {
    pub version: u8,
    pub ethernets: BTreeMap<String, Ethernet>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ethernet {
    #[serde(rename = "match")]
    pub match_rule: BTreeMap<String, String>,
    #[serde(rename = "set-name", skip_serializing_if = "Option::is_none")]
    pub set_name: Option<String>,
    pub dhcp4: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nameservers: Option<Nameservers>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Route {
    pub to: String,
    pub via: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Nameservers {
    pub addresses: Vec<String>,
}

impl NetworkConfig {
    /// Static address when the record has address and gateway, DHCP
    /// otherwise. Matches the virtio NIC by driver so interface naming
    /// does not matter.
    pub fn for_vm(cfg: &VmConfig) -> Self {
        let mut eth = Ethernet {
            match_rule: BTreeMap::from([("driver".to_string(), "virtio_net".to_string())]),
            set_name: Some("eth0".to_string()),
            dhcp4: true,
            addresses: Vec::new(),
            routes: Vec::new(),
            nameservers: None,
        };
        if let Some((ip, gw)) = cfg.static_network() {
            eth.dhcp4 = false;
            eth.addresses.push(format!("{}/{}", ip, cfg.prefix));
            eth.routes.push(Route {
                to: "default".to_string(),
                via: gw.to_string(),
            });
            eth.nameservers = Some(Nameservers {
                addresses: cfg.dns.iter().map(|d| d.to_string()).collect(),
            });
        }
        Self {
            version: 2,
            ethernets: BTreeMap::from([("eth0".to_string(), eth)]),
        }
    }
}

/// The three seed documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seed {
    pub meta_data: String,
    pub user_data: String,
    pub network_config: String,
}

/// Render the seed for `cfg`, authorizing `ssh_keys` for the login user.
pub fn render_seed(cfg: &VmConfig, ssh_keys: &[String]) -> Result<Seed> {
    let meta = MetaData {
        instance_id: &cfg.name,
        local_hostname: &cfg.name,
    };
    let user_data = UserData {
        hostname: &cfg.name,
        manage_etc_hosts: true,
        users: vec![CloudUser {
            name: &cfg.user,
            sudo: "ALL=(ALL) NOPASSWD:ALL",
            shell: "/bin/bash",
            groups: vec!["sudo"],
            lock_passwd: true,
            ssh_authorized_keys: ssh_keys.iter().map(|k| k.trim().to_string()).collect(),
        }],
        ssh_pwauth: false,
        package_update: true,
        packages: vec!["qemu-guest-agent", "openssh-server"],
        runcmd: vec![vec!["systemctl", "enable", "--now", "qemu-guest-agent"]],
    };
    Ok(Seed {
        meta_data: serde_yaml::to_string(&meta)?,
        user_data: format!("#cloud-config\n{}", serde_yaml::to_string(&user_data)?),
        network_config: serde_yaml::to_string(&NetworkConfig::for_vm(cfg))?,
    })
}

/// netplan file for the guest (`network:` wrapper around [`NetworkConfig`]).
pub fn render_netplan(cfg: &VmConfig) -> Result<String> {
    let doc = BTreeMap::from([("network", NetworkConfig::for_vm(cfg))]);
    Ok(serde_yaml::to_string(&doc)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn static_vm() -> VmConfig {
        let mut cfg = VmConfig::default_for("dev");
        cfg.ip = Some(Ipv4Addr::new(192, 168, 122, 50));
        cfg.gateway = Some(Ipv4Addr::new(192, 168, 122, 1));
        cfg
    }

    #[test]
    fn test_user_data_header_and_key() {
        let seed = render_seed(&static_vm(), &["ssh-ed25519 AAAA lab\n".to_string()]).unwrap();
        assert!(seed.user_data.starts_with("#cloud-config\n"));
        let parsed: serde_yaml::Value =
            serde_yaml::from_str(seed.user_data.trim_start_matches("#cloud-config\n")).unwrap();
        assert_eq!(parsed["users"][0]["name"], "ubuntu");
        assert_eq!(parsed["users"][0]["ssh_authorized_keys"][0], "ssh-ed25519 AAAA lab");
        assert_eq!(parsed["users"][0]["sudo"], "ALL=(ALL) NOPASSWD:ALL");
        assert!(seed.meta_data.contains("instance-id: dev"));
    }

    #[test]
    fn test_static_network() {
        let seed = render_seed(&static_vm(), &[]).unwrap();
        let net: serde_yaml::Value = serde_yaml::from_str(&seed.network_config).unwrap();
        let eth = &net["ethernets"]["eth0"];
        assert_eq!(net["version"], 2);
        assert_eq!(eth["dhcp4"], false);
        assert_eq!(eth["addresses"][0], "192.168.122.50/24");
        assert_eq!(eth["routes"][0]["via"], "192.168.122.1");
        assert_eq!(eth["nameservers"]["addresses"][0], "1.1.1.1");
    }

    #[test]
    fn test_dhcp_network_has_no_addresses() {
        let net = NetworkConfig::for_vm(&VmConfig::default_for("dev"));
        let eth = &net.ethernets["eth0"];
        assert!(eth.dhcp4);
        assert!(eth.addresses.is_empty());
        assert!(eth.nameservers.is_none());
    }

    #[test]
    fn test_netplan_wraps_network() {
        let text = render_netplan(&static_vm()).unwrap();
        assert!(text.starts_with("network:\n"));
    }
}
