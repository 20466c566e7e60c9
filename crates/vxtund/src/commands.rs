//! Shell command builders for overlay network operations

use std::net::Ipv4Addr;

use vxtun_common::shell::{self, shellquote};

/// Build interface existence query
pub fn build_link_show_cmd(ifname: &str) -> String {
    format!("{} link show dev {}", shell::IP_CMD, shellquote(ifname))
}

/// Build VXLAN interface creation command
///
/// The interface encapsulates towards `remote` on UDP `dstport` and leaves
/// the host through `egress`.
pub fn build_add_vxlan_cmd(
    ifname: &str,
    vni: u32,
    remote: Ipv4Addr,
    dstport: u16,
    egress: &str,
) -> String {
    format!(
        "{} link add {} type vxlan id {} remote {} dstport {} dev {}",
        shell::IP_CMD,
        shellquote(ifname),
        vni,
        shellquote(&remote.to_string()),
        dstport,
        shellquote(egress)
    )
}

/// Build interface deletion command
pub fn build_del_link_cmd(ifname: &str) -> String {
    format!("{} link del dev {}", shell::IP_CMD, shellquote(ifname))
}

/// Build interface bring-up command
pub fn build_set_link_up_cmd(ifname: &str) -> String {
    format!("{} link set dev {} up", shell::IP_CMD, shellquote(ifname))
}

/// Build address assignment command
pub fn build_add_address_cmd(ip_prefix: &str, ifname: &str) -> String {
    format!(
        "{} addr add {} dev {}",
        shell::IP_CMD,
        shellquote(ip_prefix),
        shellquote(ifname)
    )
}

/// Build route add/replace command
///
/// Uses 'replace' so an existing kernel route for the prefix is not an error.
pub fn build_add_route_cmd(prefix: &str, ifname: &str) -> String {
    format!(
        "{} route replace {} dev {}",
        shell::IP_CMD,
        shellquote(prefix),
        shellquote(ifname)
    )
}

/// Build route deletion command
pub fn build_del_route_cmd(prefix: &str, ifname: &str) -> String {
    format!(
        "{} route del {} dev {}",
        shell::IP_CMD,
        shellquote(prefix),
        shellquote(ifname)
    )
}

/// Build default route query
pub fn build_default_route_cmd() -> String {
    format!("{} route show default", shell::IP_CMD)
}

/// Build route lookup for a destination
pub fn build_route_get_cmd(dest: Ipv4Addr) -> String {
    format!("{} route get {}", shell::IP_CMD, shellquote(&dest.to_string()))
}

/// Extract the device name following `dev` in `ip route` output
pub fn parse_route_dev(output: &str) -> Option<String> {
    let mut tokens = output.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "dev" {
            return tokens.next().map(str::to_string);
        }
    }
    None
}

/// Build IPv4 forwarding enable command
pub fn build_enable_forwarding_cmd() -> String {
    format!("{} -w net.ipv4.ip_forward=1", shell::SYSCTL_CMD)
}

/// iptables operation on a single rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Check,
    Append,
    Delete,
}

impl RuleAction {
    fn flag(&self) -> &'static str {
        match self {
            RuleAction::Check => "-C",
            RuleAction::Append => "-A",
            RuleAction::Delete => "-D",
        }
    }
}

/// One iptables rule (table, chain and match/target arguments)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub table: &'static str,
    pub chain: &'static str,
    pub spec: Vec<String>,
}

/// Rules that give a relay tunnel's overlay subnet egress through `egress`
///
/// Order: MASQUERADE for the subnet, forward overlay to egress, forward
/// established replies back.
pub fn nat_rules(ifname: &str, subnet: &str, egress: &str) -> Vec<FirewallRule> {
    vec![
        FirewallRule {
            table: "nat",
            chain: "POSTROUTING",
            spec: vec![
                "-s".to_string(),
                shellquote(subnet),
                "-o".to_string(),
                shellquote(egress),
                "-j".to_string(),
                "MASQUERADE".to_string(),
            ],
        },
        FirewallRule {
            table: "filter",
            chain: "FORWARD",
            spec: vec![
                "-i".to_string(),
                shellquote(ifname),
                "-o".to_string(),
                shellquote(egress),
                "-j".to_string(),
                "ACCEPT".to_string(),
            ],
        },
        FirewallRule {
            table: "filter",
            chain: "FORWARD",
            spec: vec![
                "-i".to_string(),
                shellquote(egress),
                "-o".to_string(),
                shellquote(ifname),
                "-m".to_string(),
                "state".to_string(),
                "--state".to_string(),
                "RELATED,ESTABLISHED".to_string(),
                "-j".to_string(),
                "ACCEPT".to_string(),
            ],
        },
    ]
}

/// Build an iptables command for `rule`
pub fn build_iptables_cmd(action: RuleAction, rule: &FirewallRule) -> String {
    format!(
        "{} -t {} {} {} {}",
        shell::IPTABLES_CMD,
        rule.table,
        action.flag(),
        rule.chain,
        rule.spec.join(" ")
    )
}

/// Build listening socket query for a TCP/UDP port
pub fn build_port_check_cmd(port: u16) -> String {
    format!(
        "{} -H -tuln {}",
        shell::SS_CMD,
        shellquote(&format!("sport = :{}", port))
    )
}
