//! Manual cleanup script.
//!
//! For operators who have to clean up by hand (service down, state store
//! lost on another host): a bash script issuing the same DELETE calls the
//! cleanup service would, in the same order.

use std::fmt::Write;

use nodeforge_cloud::rest;
use nodeforge_core::ForgeConfig;

use crate::saga::ResourceSet;

fn delete(out: &mut String, what: &str, url: &str, region: &str) {
    let _ = writeln!(out, "# {what}");
    let _ = writeln!(
        out,
        "curl -sS -X DELETE -H \"Authorization: Bearer ${{NODEFORGE_TOKEN}}\" \"{url}?region={region}\" || failures=$((failures + 1))"
    );
}

/// Render a bash script deleting `resources` of `owner`.
pub fn cleanup_script(owner: &str, resources: &ResourceSet, config: &ForgeConfig) -> String {
    let base = config.provider.endpoint.as_str();
    let region = config.provider.region.as_str();

    let mut out = String::new();
    out.push_str("#!/usr/bin/env bash\n");
    let _ = writeln!(out, "# Cleanup for {owner}: {} resource(s).", resources.len());
    out.push_str("# Requires NODEFORGE_TOKEN in the environment.\n");
    out.push_str("set -u\nfailures=0\n\n");

    for a in &resources.attachments {
        delete(
            &mut out,
            &format!("attachment {} ({} {})", a.handle, a.role, a.address),
            &rest::attachment_url(base, &a.handle),
            region,
        );
    }
    for r in &resources.dns_records {
        delete(
            &mut out,
            &format!("dns record {} -> {}", r.name, r.target),
            &rest::dns_record_url(base, &r.zone, &r.handle),
            region,
        );
    }
    for r in &resources.addresses {
        match &r.handle {
            Some(handle) => delete(
                &mut out,
                &format!("reserved address {} ({})", r.address, r.role),
                &rest::reserved_address_url(base, &r.subnet, handle),
                region,
            ),
            None => {
                let _ = writeln!(
                    out,
                    "# reserved address {} in {} has no provider handle, nothing to delete",
                    r.address, r.subnet
                );
            }
        }
    }
    if let Some(server_id) = &resources.server_id {
        delete(
            &mut out,
            &format!("server {server_id}"),
            &rest::server_url(base, server_id),
            region,
        );
    }

    out.push_str("\nif [ \"$failures\" -ne 0 ]; then\n");
    out.push_str("  echo \"$failures delete call(s) failed\" >&2\n  exit 1\nfi\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeforge_state::{AddressRole, DnsRecord, NetworkAttachment, ReservedAddress};

    #[test]
    fn script_deletes_in_dependency_order() {
        let resources = ResourceSet {
            attachments: vec![NetworkAttachment {
                node: "node-1".to_string(),
                role: AddressRole::Management,
                handle: "vna-3".to_string(),
                address: "10.10.0.10".to_string(),
                subnet: "subnet-mgmt".to_string(),
                security_groups: Vec::new(),
                created_at: 0,
            }],
            dns_records: vec![DnsRecord {
                owner: "node-1".to_string(),
                zone: "default".to_string(),
                name: "node-1-mgmt.nodeforge.local".to_string(),
                record_type: "A".to_string(),
                target: "10.10.0.10".to_string(),
                address_role: AddressRole::Management,
                handle: "rec-2".to_string(),
                created_at: 0,
            }],
            addresses: vec![ReservedAddress {
                owner: "node-1".to_string(),
                role: AddressRole::Management,
                address: "10.10.0.10".to_string(),
                subnet: "subnet-mgmt".to_string(),
                handle: Some("rip-1".to_string()),
                claimed_at: 0,
            }],
            server_id: Some("srv-4".to_string()),
        };
        let script = cleanup_script("node-1", &resources, &ForgeConfig::sample());

        assert!(script.starts_with("#!/usr/bin/env bash"));
        let pos = |needle: &str| script.find(needle).unwrap();
        assert!(pos("/network_attachments/vna-3") < pos("/dns_zones/default/records/rec-2"));
        assert!(pos("/records/rec-2") < pos("/subnets/subnet-mgmt/reserved_ips/rip-1"));
        assert!(pos("/reserved_ips/rip-1") < pos("/bare_metal_servers/srv-4"));
        assert!(script.contains("region=region-1"));
    }

    #[test]
    fn empty_set_is_a_noop_script() {
        let script = cleanup_script("node-9", &ResourceSet::default(), &ForgeConfig::sample());
        assert!(!script.contains("curl"));
        assert!(script.contains("0 resource(s)"));
    }
}
