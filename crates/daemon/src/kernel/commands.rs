//! Shell command builders for the kernel-side session plumbing
//!
//! Every mutation has a matching probe or inverse so the glue layer can stay
//! idempotent. Interface names come from trusted supervisor-derived values,
//! but they are still quoted before entering a command line.

use once_cell::sync::Lazy;
use regex::Regex;

/// Path to the `ip` command for routing and bridge configuration.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the `iptables` command for forwarding/NAT rules.
pub const IPTABLES_CMD: &str = "/sbin/iptables";

/// Path to the `sysctl` command for the ip_forward toggle.
pub const SYSCTL_CMD: &str = "/sbin/sysctl";

/// Name of the L2 stitch bridge.
pub const BRIDGE_NAME: &str = "br0";

/// Policy routing table for traffic entering from the master side.
pub const MASTER_SIDE_TABLE: u32 = 1;

/// Policy routing table for traffic entering from the onsite side.
pub const ONSITE_SIDE_TABLE: u32 = 2;

/// Regex for characters that need escaping inside shell double-quotes.
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quote a string for safe use in shell commands.
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

// --- ip_forward -------------------------------------------------------------

pub fn read_ip_forward() -> String {
    format!("{} -n net.ipv4.ip_forward", SYSCTL_CMD)
}

pub fn write_ip_forward(enabled: bool) -> String {
    format!(
        "{} -w net.ipv4.ip_forward={}",
        SYSCTL_CMD,
        if enabled { 1 } else { 0 }
    )
}

// --- FORWARD policy ---------------------------------------------------------

pub fn read_forward_policy() -> String {
    format!("{} -S FORWARD 1", IPTABLES_CMD)
}

pub fn set_forward_policy(policy: &str) -> String {
    format!("{} -P FORWARD {}", IPTABLES_CMD, policy)
}

// --- FORWARD accept rules ---------------------------------------------------

fn forward_accept_rule(in_iface: &str, out_iface: &str) -> String {
    format!(
        "FORWARD -i {} -o {} -j ACCEPT",
        shellquote(in_iface),
        shellquote(out_iface)
    )
}

pub fn check_forward_accept(in_iface: &str, out_iface: &str) -> String {
    format!("{} -C {}", IPTABLES_CMD, forward_accept_rule(in_iface, out_iface))
}

pub fn add_forward_accept(in_iface: &str, out_iface: &str) -> String {
    format!("{} -A {}", IPTABLES_CMD, forward_accept_rule(in_iface, out_iface))
}

pub fn del_forward_accept(in_iface: &str, out_iface: &str) -> String {
    format!("{} -D {}", IPTABLES_CMD, forward_accept_rule(in_iface, out_iface))
}

fn forward_accept_in_rule(in_iface: &str) -> String {
    format!("FORWARD -i {} -j ACCEPT", shellquote(in_iface))
}

pub fn check_forward_accept_in(in_iface: &str) -> String {
    format!("{} -C {}", IPTABLES_CMD, forward_accept_in_rule(in_iface))
}

pub fn add_forward_accept_in(in_iface: &str) -> String {
    format!("{} -A {}", IPTABLES_CMD, forward_accept_in_rule(in_iface))
}

pub fn del_forward_accept_in(in_iface: &str) -> String {
    format!("{} -D {}", IPTABLES_CMD, forward_accept_in_rule(in_iface))
}

// --- NAT masquerade ---------------------------------------------------------

fn masquerade_rule(out_iface: &str) -> String {
    format!("POSTROUTING -o {} -j MASQUERADE", shellquote(out_iface))
}

pub fn check_masquerade(out_iface: &str) -> String {
    format!("{} -t nat -C {}", IPTABLES_CMD, masquerade_rule(out_iface))
}

pub fn add_masquerade(out_iface: &str) -> String {
    format!("{} -t nat -A {}", IPTABLES_CMD, masquerade_rule(out_iface))
}

pub fn del_masquerade(out_iface: &str) -> String {
    format!("{} -t nat -D {}", IPTABLES_CMD, masquerade_rule(out_iface))
}

// --- Policy routing ---------------------------------------------------------

pub fn replace_default_route(table: u32, gateway: &str, iface: &str) -> String {
    format!(
        "{} route replace default via {} dev {} table {}",
        IP_CMD,
        shellquote(gateway),
        shellquote(iface),
        table
    )
}

pub fn flush_table(table: u32) -> String {
    format!("{} route flush table {}", IP_CMD, table)
}

pub fn add_iif_rule(iface: &str, table: u32) -> String {
    format!("{} rule add iif {} lookup {}", IP_CMD, shellquote(iface), table)
}

pub fn del_iif_rule(iface: &str, table: u32) -> String {
    format!("{} rule del iif {} lookup {}", IP_CMD, shellquote(iface), table)
}

// --- L2 bridge --------------------------------------------------------------

pub fn check_bridge_exists() -> String {
    format!("{} link show {} 2>/dev/null", IP_CMD, BRIDGE_NAME)
}

pub fn add_bridge() -> String {
    format!("{} link add {} type bridge", IP_CMD, BRIDGE_NAME)
}

pub fn del_bridge() -> String {
    format!("{} link del {}", IP_CMD, BRIDGE_NAME)
}

pub fn set_bridge_up() -> String {
    format!("{} link set {} up", IP_CMD, BRIDGE_NAME)
}

pub fn set_bridge_down() -> String {
    format!("{} link set {} down", IP_CMD, BRIDGE_NAME)
}

pub fn enslave_iface(iface: &str) -> String {
    format!(
        "{} link set {} master {}",
        IP_CMD,
        shellquote(iface),
        BRIDGE_NAME
    )
}

pub fn release_iface(iface: &str) -> String {
    format!("{} link set {} nomaster", IP_CMD, shellquote(iface))
}
