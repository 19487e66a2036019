use pop_ipam::config::Config;
use pop_ipam::models::*;
use pop_ipam::{AddressSpaceAllocator, PopPlan, PopProvisioner, Store};

async fn provisioner(plan: PopPlan) -> PopProvisioner<Store> {
    let allocator = AddressSpaceAllocator::new(Store::in_memory().await.unwrap());
    allocator
        .register_container("10.0.0.0/8".parse().unwrap(), None, Some("POP Global Pool".into()))
        .await
        .unwrap();
    PopProvisioner::new(allocator, plan)
}

fn devices(site: &str) -> Vec<String> {
    ["leaf-01", "leaf-02", "spine-01"]
        .iter()
        .map(|d| format!("{site}-{d}"))
        .collect()
}

#[tokio::test]
async fn test_two_sites_get_disjoint_pops() {
    let prov = provisioner(PopPlan::default()).await;
    let nyc = prov.provision_site("NYC1", &devices("NYC1")).await.unwrap();
    let lax = prov.provision_site("LAX1", &devices("LAX1")).await.unwrap();

    assert_eq!(nyc.container.to_string(), "10.0.0.0/16");
    assert_eq!(lax.container.to_string(), "10.1.0.0/16");

    let addrs: Vec<String> = lax.loopbacks.iter().map(|l| l.address.to_string()).collect();
    assert_eq!(addrs, vec!["10.1.128.1", "10.1.128.2", "10.1.128.3"]);
    assert_eq!(
        lax.loopbacks[2].dns_name.as_deref(),
        Some("LAX1-spine-01.LAX1.dc.example.net")
    );
}

#[tokio::test]
async fn test_rack_vlans_after_provisioning() {
    let prov = provisioner(PopPlan::default()).await;
    prov.provision_site("NYC1", &devices("NYC1")).await.unwrap();

    let mut prefixes = Vec::new();
    for rack in ["NYC1-101", "NYC1-102"] {
        let vlans = prov.allocate_rack_vlans("NYC1", rack).await.unwrap();
        assert_eq!(vlans[0].name, format!("{rack}-server"));
        assert_eq!(vlans[1].vlan_id, 99);
        prefixes.extend(vlans.into_iter().map(|v| v.prefix.to_string()));
    }
    assert_eq!(
        prefixes,
        vec!["10.0.0.0/24", "10.0.64.0/24", "10.0.1.0/24", "10.0.65.0/24"]
    );

    let util = prov
        .allocator()
        .utilization(
            prov.allocator()
                .find_by_cidr(&"10.0.0.0/18".parse().unwrap())
                .await
                .unwrap()
                .unwrap()
                .id,
        )
        .await
        .unwrap();
    assert_eq!(util.used, 512);
}

#[tokio::test]
async fn test_custom_layout_from_config() {
    let cfg = Config {
        role_layout: vec![Role::Loopback, Role::Server],
        role_prefix_size: 17,
        vlan_roles: vec![(Role::Server, 1000)],
        dns_suffix: "example.org".into(),
        ..Config::default()
    };
    let prov = provisioner(PopPlan::from(&cfg)).await;
    let pop = prov.provision_site("AMS1", &["r1".to_string()]).await.unwrap();

    let subnets: Vec<String> = pop.subnets.iter().map(|s| format!("{}={}", s.role, s.prefix)).collect();
    assert_eq!(subnets, vec!["loopback=10.0.0.0/17", "server=10.0.128.0/17"]);
    assert_eq!(pop.loopbacks[0].dns_name.as_deref(), Some("r1.AMS1.example.org"));

    let vlans = prov.allocate_rack_vlans("AMS1", "AMS1-101").await.unwrap();
    assert_eq!(vlans.len(), 1);
    assert_eq!(vlans[0].gateway.to_string(), "10.0.128.1");
}

#[tokio::test]
async fn test_layout_without_loopback_rejects_devices() {
    let plan = PopPlan {
        role_layout: vec![Role::Server],
        ..PopPlan::default()
    };
    let prov = provisioner(plan).await;
    let err = prov.provision_site("NYC1", &devices("NYC1")).await.unwrap_err();
    assert!(err.to_string().contains("loopback"));
}

#[tokio::test]
async fn test_allocation_serializes_to_json() {
    let prov = provisioner(PopPlan::default()).await;
    let pop = prov.provision_site("NYC1", &["leaf".to_string()]).await.unwrap();
    let json = serde_json::to_value(&pop).unwrap();
    assert_eq!(json["container"], "10.0.0.0/16");
    assert_eq!(json["subnets"][2]["role"], "loopback");
    assert_eq!(json["loopbacks"][0]["address"], "10.0.128.1");
}
