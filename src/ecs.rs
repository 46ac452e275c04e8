use std::net::IpAddr;
use std::str::FromStr;

use hickory_proto::op::{Edns, Message};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsCode, EdnsOption};
use ipnet::IpNet;

pub const ECS_PREFIX_V4: u8 = 24;
pub const ECS_PREFIX_V6: u8 = 48;

pub fn has_ecs(msg: &Message) -> bool {
    msg.extensions()
        .as_ref()
        .is_some_and(|edns| edns.option(EdnsCode::Subnet).is_some())
}

/// Client subnet for `addr`, /24 for IPv4 and /48 for IPv6, host bits cleared.
pub fn subnet_for(addr: IpAddr) -> Option<ClientSubnet> {
    let prefix = match addr {
        IpAddr::V4(_) => ECS_PREFIX_V4,
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => return subnet_for(IpAddr::V4(v4)),
            None => ECS_PREFIX_V6,
        },
    };
    let net = IpNet::new(addr, prefix).ok()?.trunc();
    ClientSubnet::from_str(&net.to_string()).ok()
}

/// Replaces any ECS option of `msg` with `subnet`, adding an OPT record if needed.
pub fn set_ecs(msg: &mut Message, subnet: ClientSubnet) {
    let edns = msg.extensions_mut().get_or_insert_with(Edns::new);
    edns.options_mut().remove(EdnsCode::Subnet);
    edns.options_mut().insert(EdnsOption::Subnet(subnet));
}

/// Returns true if an ECS option was removed.
pub fn strip_ecs(msg: &mut Message) -> bool {
    if let Some(edns) = msg.extensions_mut().as_mut() {
        if edns.option(EdnsCode::Subnet).is_some() {
            edns.options_mut().remove(EdnsCode::Subnet);
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_prefix_follows_family() {
        let v4 = subnet_for("1.2.3.77".parse().unwrap()).unwrap();
        assert_eq!(v4, ClientSubnet::from_str("1.2.3.0/24").unwrap());
        let v6 = subnet_for("2001:db8:1:2::5".parse().unwrap()).unwrap();
        assert_eq!(v6, ClientSubnet::from_str("2001:db8:1::/48").unwrap());
    }

    #[test]
    fn set_then_strip() {
        let mut msg = Message::new();
        assert!(!has_ecs(&msg));
        set_ecs(&mut msg, subnet_for("10.9.8.7".parse().unwrap()).unwrap());
        assert!(has_ecs(&msg));
        assert!(strip_ecs(&mut msg));
        assert!(!has_ecs(&msg));
        assert!(!strip_ecs(&mut msg));
        assert!(msg.extensions().is_some(), "OPT record itself is kept");
    }

    #[test]
    fn set_replaces_existing_subnet() {
        let mut msg = Message::new();
        set_ecs(&mut msg, subnet_for("10.0.0.1".parse().unwrap()).unwrap());
        set_ecs(&mut msg, subnet_for("192.0.2.1".parse().unwrap()).unwrap());
        let edns = msg.extensions().as_ref().unwrap();
        match edns.option(EdnsCode::Subnet) {
            Some(EdnsOption::Subnet(s)) => {
                assert_eq!(*s, ClientSubnet::from_str("192.0.2.0/24").unwrap())
            }
            other => panic!("unexpected option {other:?}"),
        }
    }
}
