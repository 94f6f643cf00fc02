use crate::*;

use veil_router::TokioScheduler;

const WAIT: Duration = Duration::from_secs(3);

/// Dial from A to B and wait until both sides hold an authenticated session.
async fn connected_pair() -> Result<(Node, Node)> {
    let a = Node::spawn()?;
    let b = Node::spawn()?;
    assert!(a.link.try_establish_to(&b.contact()?));
    assert_eq!(a.link.num_pending(), 1);

    let (a_id, b_id) = (a.id(), b.id());
    wait_until(WAIT, "a → b session", || a.link.has_session_to(&b_id)).await?;
    wait_until(WAIT, "b → a session", || b.link.has_session_to(&a_id)).await?;
    assert_eq!(a.link.num_pending(), 0);
    assert_eq!(b.link.num_pending(), 0);
    Ok((a, b))
}

#[tokio::test]
async fn test_handshake_and_send() -> Result<()> {
    init_tracing();
    let (a, b) = connected_pair().await?;
    let (a_id, b_id) = (a.id(), b.id());

    assert!(a.link.send_to(&b_id, b"over the link"));
    wait_until(WAIT, "delivery at b", || !b.dialect.observed.delivered.lock().is_empty()).await?;
    assert_eq!(
        b.dialect.observed.delivered.lock()[0],
        (a_id, b"over the link".to_vec())
    );

    // no session to an unknown router
    assert!(!a.link.send_to(&RouterId([7; 32]), b"nowhere"));

    let status = serde_json::to_value(a.link.extract_status())?;
    assert_eq!(status["name"], DIALECT);
    assert_eq!(status["addr"], a.link.local_addr().map(|s| s.to_string()).unwrap_or_default());
    let established = status["sessions"]["established"].as_array().cloned().unwrap_or_default();
    assert_eq!(established.len(), 1);
    assert_eq!(established[0]["identity"], b_id.to_string());

    a.shutdown().await?;
    b.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_duplicate_dial_is_refused() -> Result<()> {
    init_tracing();
    let a = Node::spawn()?;
    let b = Node::spawn()?;
    let rc = b.contact()?;
    assert!(a.link.try_establish_to(&rc));
    // the first dial is still pending: the receive loops have not run yet
    assert!(!a.link.try_establish_to(&rc));
    assert_eq!(a.link.num_pending(), 1);

    wait_until(WAIT, "a → b session", || a.link.has_session_to(&b.id())).await?;
    assert_eq!(a.link.num_sessions_to(&b.id()), 1);

    a.shutdown().await?;
    b.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_keep_alive_and_close() -> Result<()> {
    init_tracing();
    let (a, b) = connected_pair().await?;
    let (a_id, b_id) = (a.id(), b.id());

    a.link.keep_alive_session_to(&b_id);
    wait_until(WAIT, "keep-alive at b", || {
        b.dialect.observed.keep_alives.load(Ordering::SeqCst) == 1
    })
    .await?;

    a.link.close_session_to(&b_id);
    assert!(!a.link.has_session_to(&b_id));
    // b sees the close, its session times out and the next pump drops it
    wait_until(WAIT, "b drops closed session", || !b.link.has_session_to(&a_id)).await?;

    a.shutdown().await?;
    b.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_tick_loop_runs_until_stop() -> Result<()> {
    init_tracing();
    let (a, b) = connected_pair().await?;
    let a_id = a.id();
    let scheduler = Arc::new(TokioScheduler::current());

    assert!(a.link.start(scheduler.clone()));
    wait_until(WAIT, "ticks", || a.dialect.observed.ticks.load(Ordering::SeqCst) >= 3).await?;
    assert_eq!(scheduler.pending(), 1);

    a.link.stop();
    assert_eq!(scheduler.pending(), 0);
    let ticks = a.dialect.observed.ticks.load(Ordering::SeqCst);
    tokio::time::sleep(veil_router::link::TICK_INTERVAL * 4).await;
    assert_eq!(a.dialect.observed.ticks.load(Ordering::SeqCst), ticks);

    // stop sent a close to b
    wait_until(WAIT, "b drops session after stop", || !b.link.has_session_to(&a_id)).await?;

    a.shutdown().await?;
    b.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_closes_sessions() -> Result<()> {
    init_tracing();
    let (a, b) = connected_pair().await?;
    let b_id = b.id();

    b.shutdown().await?;
    wait_until(WAIT, "a drops session after b shutdown", || !a.link.has_session_to(&b_id)).await?;
    a.shutdown().await?;
    Ok(())
}
