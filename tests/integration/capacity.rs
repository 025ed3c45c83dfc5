//! Pool limits: a full node turns inbound connections away without
//! touching its existing sessions.

use std::time::Duration;

use anyhow::Result;

use granite_core::wire::DisconnectReason;
use granite_net::peerman::PeerEvent;

use crate::{next_event, start_node, test_config, wait_until};

#[tokio::test]
async fn full_pool_rejects_inbound_with_too_many_peers() -> Result<()> {
    let mut a = start_node(test_config(1)).await?;
    let b = start_node(test_config(1)).await?;
    let c = start_node(test_config(1)).await?;

    b.handle
        .connect(a.handle.local_id(), a.handle.tcp_addr())
        .await?;
    assert!(matches!(
        next_event(&mut a.events).await?,
        PeerEvent::Connected { .. }
    ));
    assert_eq!(a.handle.peer_count(), 1);

    // The third node never completes a handshake; its socket is dropped
    // on arrival.
    let refused = c
        .handle
        .connect(a.handle.local_id(), a.handle.tcp_addr())
        .await;
    assert!(refused.is_err(), "connect into a full pool must fail");

    assert!(matches!(
        next_event(&mut a.events).await?,
        PeerEvent::InboundRejected {
            reason: DisconnectReason::TooManyPeers,
            ..
        }
    ));

    // The pool is exactly as it was.
    assert_eq!(a.handle.peer_count(), 1);
    assert!(a.handle.session(&b.handle.local_id()).is_some());
    assert_eq!(c.handle.peer_count(), 0);

    a.handle.shutdown().await;
    b.handle.shutdown().await;
    c.handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn freed_capacity_is_reusable() -> Result<()> {
    let a = start_node(test_config(1)).await?;
    let b = start_node(test_config(1)).await?;
    let c = start_node(test_config(1)).await?;

    b.handle
        .connect(a.handle.local_id(), a.handle.tcp_addr())
        .await?;
    b.handle
        .disconnect(&a.handle.local_id(), DisconnectReason::DisconnectRequested)
        .await;
    wait_until("the slot to free", Duration::from_secs(5), || {
        a.handle.peer_count() == 0
    })
    .await?;

    c.handle
        .connect(a.handle.local_id(), a.handle.tcp_addr())
        .await?;
    assert_eq!(a.handle.peer_count(), 1);
    assert!(a.handle.session(&c.handle.local_id()).is_some());

    a.handle.shutdown().await;
    b.handle.shutdown().await;
    c.handle.shutdown().await;
    Ok(())
}
