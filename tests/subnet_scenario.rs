use peerprobe::protocols::P2P;
use peerprobe::scenario::{MockSubnet, MockSubnetConfig, Reserve, ScenarioError};
use std::time::{Duration, Instant};

fn addrs(hosts: &[&str]) -> Vec<String> {
    hosts.iter().map(|h| format!("{}:20338", h)).collect()
}

/// Poll `check_all` until it passes or `timeout` runs out.
async fn settle(subnet: &MockSubnet, timeout: Duration) -> Result<(), ScenarioError> {
    let deadline = Instant::now() + timeout;
    loop {
        match subnet.check_all() {
            Ok(()) => return Ok(()),
            Err(e) if Instant::now() >= deadline => return Err(e),
            Err(_) => tokio::time::sleep(Duration::from_millis(250)).await,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_gov_and_normal_nodes_separate() {
    let seeds = addrs(&["10.20.0.1"]);
    let govs = addrs(&["10.20.1.1", "10.20.1.2", "10.20.1.3"]);
    let norms = addrs(&["10.20.2.1", "10.20.2.2"]);
    let config = MockSubnetConfig::new(seeds.clone(), govs.clone(), norms.clone());
    let subnet = MockSubnet::new(config, Vec::new()).unwrap();

    subnet.start_all().await;
    settle(&subnet, Duration::from_secs(30)).await.unwrap();

    for gov in &govs {
        let members = subnet.members_of(gov).unwrap();
        assert_eq!(members.len(), 2, "members of {}", gov);
        assert!(members.iter().all(|m| m.connected && m.listen_addr != *gov));
    }
    for norm in &norms {
        assert!(subnet.members_of(norm).unwrap().is_empty());
    }
    assert_eq!(subnet.members_of(&seeds[0]).unwrap().len(), 3);
    // the seed serves ordinary nodes without leaking members to them
    subnet.check_gov_seed(&seeds[0]).unwrap();

    subnet.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_demoted_gov_node_keeps_running() {
    let govs = addrs(&["10.21.1.1", "10.21.1.2", "10.21.1.3"]);
    let config = MockSubnetConfig::new(
        addrs(&["10.21.0.1"]),
        govs.clone(),
        addrs(&["10.21.2.1", "10.21.2.2"]),
    );
    let mut subnet = MockSubnet::new(config, Vec::new()).unwrap();
    subnet.start_all().await;
    settle(&subnet, Duration::from_secs(30)).await.unwrap();

    subnet.del_gov_node(&govs[2]).unwrap();
    assert!(matches!(
        subnet.del_gov_node(&govs[2]),
        Err(ScenarioError::NotGovNode(_))
    ));
    tokio::time::sleep(Duration::from_secs(2)).await;
    settle(&subnet, Duration::from_secs(30)).await.unwrap();

    let demoted = subnet.server(&govs[2]).unwrap();
    assert!(!demoted.is_closed());
    assert!(demoted.connection_count() > 0);

    subnet.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_added_gov_node_joins_members() {
    let govs = addrs(&["10.22.1.1", "10.22.1.2"]);
    let config = MockSubnetConfig::new(addrs(&["10.22.0.1"]), govs.clone(), addrs(&["10.22.2.1"]));
    let mut subnet = MockSubnet::new(config, Vec::new()).unwrap();
    subnet.start_all().await;
    settle(&subnet, Duration::from_secs(30)).await.unwrap();

    let added = subnet.add_gov_node("10.22.1.3:20338").unwrap();
    added.start().await;
    settle(&subnet, Duration::from_secs(30)).await.unwrap();

    let mut all_govs = govs.clone();
    all_govs.push("10.22.1.3:20338".to_string());
    for gov in &all_govs {
        assert_eq!(subnet.members_of(gov).unwrap().len(), 2, "members of {}", gov);
    }
    subnet.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reserved_only_node_talks_to_its_list() {
    let seeds = addrs(&["10.23.0.1"]);
    let norms = addrs(&["10.23.2.1", "10.23.2.2", "10.23.2.3"]);
    let config = MockSubnetConfig::new(seeds.clone(), Vec::new(), norms.clone());
    let reserves = vec![Reserve {
        host: "10.23.2.1".into(),
        rsv: seeds.clone(),
    }];
    let subnet = MockSubnet::new(config, reserves).unwrap();
    subnet.start_all().await;

    let restricted = subnet.server(&norms[0]).unwrap();
    let open = subnet.server(&norms[1]).unwrap();
    let deadline = Instant::now() + Duration::from_secs(30);
    while open.connection_count() < 2 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    // give the others a few more discovery rounds to try the restricted node
    tokio::time::sleep(Duration::from_secs(2)).await;

    let neighbors: Vec<String> = restricted
        .get_neighbors()
        .iter()
        .map(|p| p.listen_addr())
        .collect();
    assert_eq!(neighbors, seeds);
    assert_eq!(open.connection_count(), 2);

    subnet.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_demoted_gov_node_ages_out_of_member_lists() {
    let seeds = addrs(&["10.24.0.1"]);
    let govs = addrs(&["10.24.1.1", "10.24.1.2", "10.24.1.3"]);
    let norms = addrs(&["10.24.2.1"]);
    let mut config = MockSubnetConfig::new(seeds.clone(), govs.clone(), norms);
    config.subnet.max_inactive = Duration::from_secs(3);
    let mut subnet = MockSubnet::new(config, Vec::new()).unwrap();
    subnet.start_all().await;
    settle(&subnet, Duration::from_secs(30)).await.unwrap();

    subnet.del_gov_node(&govs[2]).unwrap();
    let watchers = [&govs[0], &govs[1], &seeds[0]];
    let listed_by = |subnet: &MockSubnet| -> Vec<String> {
        watchers
            .iter()
            .filter(|w| {
                subnet
                    .members_of(w)
                    .unwrap()
                    .iter()
                    .any(|m| m.listen_addr == govs[2])
            })
            .map(|w| w.to_string())
            .collect()
    };

    let deadline = Instant::now() + Duration::from_secs(30);
    while !listed_by(&subnet).is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    assert!(listed_by(&subnet).is_empty(), "demoted still listed by {:?}", listed_by(&subnet));

    // the remaining gov nodes still know each other
    for gov in &govs[..2] {
        let members = subnet.members_of(gov).unwrap();
        assert_eq!(members.len(), 1, "members of {}", gov);
    }
    subnet.stop_all().await;
}
