//! Two nodes over loopback TCP: handshake, capability negotiation, and
//! an application message in both directions.

use std::time::Duration;

use anyhow::{Context, Result};

use granite_core::wire::DisconnectReason;
use granite_net::peerman::PeerEvent;
use granite_net::SessionState;

use crate::{next_event, sample_status, start_node, test_config, wait_until, Status};

#[tokio::test]
async fn handshake_negotiate_and_exchange_status() -> Result<()> {
    let mut a = start_node(test_config(8)).await?;
    let mut b = start_node(test_config(8)).await?;

    a.handle
        .connect(b.handle.local_id(), b.handle.tcp_addr())
        .await
        .context("dial failed")?;

    // Both sides observe an Active session with eth/63 negotiated.
    let a_session = a
        .handle
        .session(&b.handle.local_id())
        .context("a has no session")?;
    assert_eq!(a_session.state(), SessionState::Active);
    assert!(a_session.capabilities().get("eth").is_some());
    assert_eq!(a_session.capabilities().get("eth").unwrap().version, 63);

    wait_until("b to register the session", Duration::from_secs(5), || {
        b.handle.peer_count() == 1
    })
    .await?;
    let b_session = b
        .handle
        .session(&a.handle.local_id())
        .context("b has no session")?;
    assert_eq!(b_session.state(), SessionState::Active);

    assert!(matches!(
        next_event(&mut a.events).await?,
        PeerEvent::Connected { inbound: false, .. }
    ));
    assert!(matches!(
        next_event(&mut b.events).await?,
        PeerEvent::Connected { inbound: true, .. }
    ));

    // Status flows in both directions and survives the codec intact.
    let status = sample_status();
    a.handle
        .send(&b.handle.local_id(), "eth", 0, &status)
        .await?;
    let at_b = tokio::time::timeout(Duration::from_secs(5), b.inbound.recv())
        .await?
        .context("b inbound closed")?;
    assert_eq!(at_b.peer, a.handle.local_id());
    assert_eq!(at_b.capability, "eth");
    assert_eq!(at_b.id, 0);
    assert_eq!(at_b.message.downcast::<Status>().unwrap(), status);

    b.handle
        .send(&a.handle.local_id(), "eth", 0, &status)
        .await?;
    let at_a = tokio::time::timeout(Duration::from_secs(5), a.inbound.recv())
        .await?
        .context("a inbound closed")?;
    assert_eq!(at_a.message.downcast::<Status>().unwrap(), status);

    a.handle.shutdown().await;
    b.handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn graceful_shutdown_propagates_client_quitting() -> Result<()> {
    let mut a = start_node(test_config(4)).await?;
    let b = start_node(test_config(4)).await?;

    a.handle
        .connect(b.handle.local_id(), b.handle.tcp_addr())
        .await?;
    assert!(matches!(
        next_event(&mut a.events).await?,
        PeerEvent::Connected { .. }
    ));

    b.handle.shutdown().await;

    loop {
        match next_event(&mut a.events).await? {
            PeerEvent::Disconnected {
                reason: DisconnectReason::ClientQuitting,
                ..
            } => break,
            _ => continue,
        }
    }
    wait_until("a to drop the session", Duration::from_secs(5), || {
        a.handle.peer_count() == 0
    })
    .await?;

    a.handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn sessions_survive_idle_periods_via_keepalive() -> Result<()> {
    let a = start_node(test_config(4)).await?;
    let b = start_node(test_config(4)).await?;

    a.handle
        .connect(b.handle.local_id(), b.handle.tcp_addr())
        .await?;

    // Longer than the ping interval, far shorter than the read timeout:
    // pings must keep both ends alive.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(a.handle.peer_count(), 1);
    assert_eq!(b.handle.peer_count(), 1);
    let session = a.handle.session(&b.handle.local_id()).unwrap();
    assert_eq!(session.state(), SessionState::Active);

    a.handle.shutdown().await;
    b.handle.shutdown().await;
    Ok(())
}
