// src/utils/net.rs

use std::net::Ipv4Addr;

/// 虚拟网卡前缀，生成证书 SAN 和广播时过滤
const VIRTUAL_PREFIXES: &[&str] = &["lo", "docker", "br-", "veth", "virbr", "vmnet", "tap", "tun"];

fn is_virtual_interface(name: &str) -> bool {
    let lower = name.to_lowercase();
    VIRTUAL_PREFIXES.iter().any(|p| lower.starts_with(p)) || lower.contains("virtual")
}

/// 主机上所有非回环、非虚拟网卡的 IPv4 地址
pub fn local_ipv4_addresses() -> Vec<Ipv4Addr> {
    let mut addrs = Vec::new();
    let interfaces = match if_addrs::get_if_addrs() {
        Ok(list) => list,
        Err(e) => {
            tracing::warn!("Failed to enumerate network interfaces: {}", e);
            return addrs;
        }
    };

    for iface in interfaces {
        if iface.is_loopback() || is_virtual_interface(&iface.name) {
            continue;
        }
        if let if_addrs::IfAddr::V4(v4) = iface.addr {
            addrs.push(v4.ip);
        }
    }
    addrs
}

/// 发现信标的广播目标地址：受限广播加上每个物理网卡的定向广播
pub fn broadcast_addresses() -> Vec<Ipv4Addr> {
    let mut addrs = vec![Ipv4Addr::BROADCAST];

    if let Ok(interfaces) = if_addrs::get_if_addrs() {
        for iface in interfaces {
            if iface.is_loopback() || is_virtual_interface(&iface.name) {
                continue;
            }
            if let if_addrs::IfAddr::V4(v4) = iface.addr {
                if let Some(broadcast) = v4.broadcast {
                    if !addrs.contains(&broadcast) {
                        addrs.push(broadcast);
                    }
                }
            }
        }
    }
    addrs
}
