//! Discovery over loopback UDP: bonding through a bootnode and the
//! dial loop picking up discovered candidates.

use std::time::Duration;

use anyhow::{bail, Result};

use granite_core::config::NetConfig;

use crate::{start_node, test_config};

fn discovery_config(max_peers: usize) -> NetConfig {
    let mut config = test_config(max_peers);
    config.discovery.enabled = true;
    config
}

#[tokio::test]
async fn nodes_bond_through_a_bootnode() -> Result<()> {
    let a = start_node(discovery_config(8)).await?;
    let a_udp = a.handle.udp_addr().expect("discovery enabled");

    let mut config = discovery_config(8);
    config.peers.bootnodes = vec![format!(
        "{}@{}",
        hex::encode(a.handle.local_id().as_bytes()),
        a_udp
    )];
    let b = start_node(config).await?;

    // B pings its bootnode on the first refresh; A bonds back. Both
    // tables end up knowing the other node.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if a.handle.known_nodes().await >= 1 && b.handle.known_nodes().await >= 1 {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("bonding did not complete");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    a.handle.shutdown().await;
    b.handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn discovered_candidates_are_dialed_into_sessions() -> Result<()> {
    // The bootnode string points at the UDP port, which on these nodes
    // differs from the TCP port — discovery carries the real TCP port in
    // its ping, so the dial loop still finds the session endpoint.
    let a = start_node(discovery_config(8)).await?;
    let a_udp = a.handle.udp_addr().expect("discovery enabled");

    let mut config = discovery_config(8);
    config.peers.bootnodes = vec![format!(
        "{}@{}",
        hex::encode(a.handle.local_id().as_bytes()),
        a_udp
    )];
    let b = start_node(config).await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        if a.handle.peer_count() == 1 && b.handle.peer_count() == 1 {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("discovered candidate was never dialed");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(a.handle.session(&b.handle.local_id()).is_some());
    assert!(b.handle.session(&a.handle.local_id()).is_some());

    a.handle.shutdown().await;
    b.handle.shutdown().await;
    Ok(())
}
