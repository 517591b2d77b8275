use crate::context::PlanContext;
use crate::step::{ApplyScope, ExecutionError, Findings, StepController, StepKind, ValidationError};
use alpinst_runtime::target_config;
use alpinst_schema::{AddressMethod, InstallPlan, Interface};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv6Addr};
use tracing::info;

pub struct NetworkStep;

const IFNAMSIZ: usize = 15;

pub(crate) fn implied(plan: &InstallPlan) -> Vec<&'static str> {
    match plan.network() {
        Some(n) if !n.interfaces.is_empty() => vec!["ifupdown-ng"],
        _ => Vec::new(),
    }
}

/// RFC 1123 host name: dot-separated labels of letters, digits and
/// hyphens, no label starting or ending with a hyphen.
pub fn is_valid_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            (1..=63).contains(&label.len())
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// `http(s)://host[:port][/]`.
pub fn is_valid_proxy(url: &str) -> bool {
    let Some(rest) = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
    else {
        return false;
    };
    let authority = rest.strip_suffix('/').unwrap_or(rest);
    let authority = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    let valid_port = |p: &str| p.parse::<u16>().is_ok_and(|p| p > 0);

    if let Some(v6) = authority.strip_prefix('[') {
        let Some((host, tail)) = v6.split_once(']') else {
            return false;
        };
        return host.parse::<Ipv6Addr>().is_ok()
            && (tail.is_empty() || tail.strip_prefix(':').is_some_and(valid_port));
    }
    match authority.split_once(':') {
        Some((host, port)) => is_valid_hostname(host) && valid_port(port),
        None => is_valid_hostname(authority),
    }
}

fn check_interface(f: &mut Findings, i: usize, iface: &Interface) {
    let field = |name: &str| format!("interfaces[{i}].{name}");
    if iface.name.is_empty() {
        f.constraint(field("name"), "empty");
    } else if iface.name.len() > IFNAMSIZ
        || iface.name.contains(|c: char| c == '/' || c == ':' || c.is_whitespace())
    {
        f.constraint(field("name"), format!("'{}' is not a valid interface name", iface.name));
    }

    match iface.method {
        AddressMethod::Dhcp => {
            if iface.address.is_some() || iface.prefix.is_some() || iface.gateway.is_some() {
                f.constraint(field("method"), "address, prefix and gateway need method = \"static\"");
            }
        }
        AddressMethod::Static => {
            let addr = match iface.address.as_deref().map(str::parse::<IpAddr>) {
                None => {
                    f.constraint(field("address"), "required for a static interface");
                    None
                }
                Some(Err(_)) => {
                    f.constraint(field("address"), "not an IP address");
                    None
                }
                Some(Ok(a)) => Some(a),
            };
            match (iface.prefix, addr) {
                (None, _) => f.constraint(field("prefix"), "required for a static interface"),
                (Some(p), Some(IpAddr::V4(_))) if p > 32 => {
                    f.constraint(field("prefix"), format!("/{p} is too long for IPv4"));
                }
                (Some(p), _) if p > 128 => {
                    f.constraint(field("prefix"), format!("/{p} is too long"));
                }
                _ => {}
            }
            if let Some(gw) = &iface.gateway {
                match gw.parse::<IpAddr>() {
                    Err(_) => f.constraint(field("gateway"), "not an IP address"),
                    Ok(g) if addr.is_some_and(|a| a.is_ipv4() != g.is_ipv4()) => {
                        f.constraint(field("gateway"), "address family differs from the interface address");
                    }
                    Ok(_) => {}
                }
            }
        }
    }
}

impl StepController for NetworkStep {
    fn kind(&self) -> StepKind {
        StepKind::Network
    }

    fn validate(&self, plan: &InstallPlan, _ctx: &PlanContext) -> Result<(), Vec<ValidationError>> {
        let mut f = Findings::new(StepKind::Network);
        let Some(net) = plan.network() else {
            f.constraint("network", "not answered");
            return f.finish();
        };
        if !is_valid_hostname(&net.hostname) {
            f.constraint("hostname", format!("'{}' is not a valid host name", net.hostname));
        }

        let mut seen = HashSet::new();
        for (i, iface) in net.interfaces.iter().enumerate() {
            check_interface(&mut f, i, iface);
            if !iface.name.is_empty() && !seen.insert(iface.name.as_str()) {
                f.constraint(
                    format!("interfaces[{i}].name"),
                    format!("interface '{}' declared twice", iface.name),
                );
            }
        }

        for (i, server) in net.dns.iter().enumerate() {
            if server.parse::<IpAddr>().is_err() {
                f.constraint(format!("dns[{i}]"), format!("'{server}' is not an IP address"));
            }
        }
        if let Some(proxy) = &net.proxy {
            if !is_valid_proxy(proxy) {
                f.constraint("proxy", format!("'{proxy}' is not http(s)://host[:port]"));
            }
        }
        f.finish()
    }

    fn apply(&mut self, plan: &InstallPlan, scope: &ApplyScope<'_>) -> Result<(), ExecutionError> {
        let fail = |e| ExecutionError::new(StepKind::Network, e);
        let net = plan
            .network()
            .ok_or_else(|| ExecutionError::not_answered(StepKind::Network))?;
        info!("network: host {} with {} interface(s)", net.hostname, net.interfaces.len());
        scope.staging.ensure_exists().map_err(fail)?;
        target_config::write_network(scope.staging, net).map_err(fail)
    }
}
