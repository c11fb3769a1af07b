use std::time::Duration;

use nova_jdwp_mux::wire::mock::MockJdwpVm;
use nova_jdwp_mux::{JdwpError, PipelineFactories, SessionState, Termination};

use crate::harness::{connect, event, join, spawn_collector, TIMEOUT};

#[tokio::test]
async fn eof_completes_active_and_future_receivers() {
    let vm = MockJdwpVm::spawn().await.unwrap();
    let shared = connect(&vm, &PipelineFactories::new()).await;
    assert!(matches!(shared.state(), SessionState::Idle));

    let (ready, active) = spawn_collector(&shared, "active", None);
    ready.await.unwrap();
    assert!(matches!(shared.state(), SessionState::Running));

    vm.emit(&event(1)).await.unwrap();
    vm.close_connection().await;
    assert_eq!(join(active).await.unwrap(), vec![1]);
    assert!(matches!(
        shared.state(),
        SessionState::Terminated(Termination::Eof)
    ));

    let later = tokio::time::timeout(
        Duration::from_secs(1),
        shared
            .new_packet_receiver()
            .receive_first_or_none(|_| true),
    )
    .await
    .expect("a receiver on an ended session must not block")
    .unwrap();
    assert!(later.is_none());

    let err = shared.send_packet(&event(2)).await.unwrap_err();
    assert!(matches!(err, JdwpError::EndOfStream));
}

#[tokio::test]
async fn framing_error_fails_every_receiver() {
    let vm = MockJdwpVm::spawn().await.unwrap();
    let shared = connect(&vm, &PipelineFactories::new()).await;

    let (ready_a, a) = spawn_collector(&shared, "a", None);
    let (ready_b, b) = spawn_collector(&shared, "b", None);
    ready_a.await.unwrap();
    ready_b.await.unwrap();

    // Advertised length 3 is shorter than the header itself.
    vm.emit_raw(&[0, 0, 0, 3, 0, 0, 0, 1, 0, 1, 1]).await.unwrap();

    assert!(matches!(join(a).await, Err(JdwpError::Protocol(_))));
    assert!(matches!(join(b).await, Err(JdwpError::Protocol(_))));
    assert!(matches!(
        shared.wait_terminated().await,
        Termination::Failed(JdwpError::Protocol(_))
    ));

    let err = shared
        .new_packet_receiver()
        .receive(|_| Ok::<_, JdwpError>(()))
        .await
        .unwrap_err();
    assert!(matches!(err, JdwpError::Protocol(_)));
}

#[tokio::test]
async fn close_unblocks_receivers_and_pending_sends() {
    let vm = MockJdwpVm::spawn().await.unwrap();
    let shared = connect(&vm, &PipelineFactories::new()).await;

    let (ready, waiting) = spawn_collector(&shared, "waiting", None);
    ready.await.unwrap();
    vm.wait_connected().await;

    tokio::time::timeout(TIMEOUT, shared.close()).await.unwrap();
    assert!(matches!(join(waiting).await, Err(JdwpError::Closed)));
    assert!(matches!(
        shared.send_packet(&event(1)).await,
        Err(JdwpError::Closed)
    ));
}

#[tokio::test]
async fn dropping_every_handle_closes_the_connection() {
    let vm = MockJdwpVm::spawn().await.unwrap();
    let shared = connect(&vm, &PipelineFactories::new()).await;
    let (ready, task) = spawn_collector(&shared, "only", None);
    ready.await.unwrap();
    vm.wait_connected().await;

    let observer = shared.clone();
    drop(shared);
    assert!(!observer.is_terminated());
    drop(observer);

    // The collector holds the last handle; once it is gone the session closes.
    task.abort();
    let _ = task.await;

    let err = tokio::time::timeout(TIMEOUT, async {
        loop {
            if let Err(err) = vm.emit(&event(1)).await {
                return err;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(matches!(
        err.kind(),
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
    ));
}

#[tokio::test]
async fn cancelled_receiver_leaves_session_running() {
    let vm = MockJdwpVm::spawn().await.unwrap();
    let shared = connect(&vm, &PipelineFactories::new()).await;

    let (keep_ready, keep) = spawn_collector(&shared, "keep", None);
    let (cancel_ready, cancel) = spawn_collector(&shared, "cancel", None);
    keep_ready.await.unwrap();
    cancel_ready.await.unwrap();

    vm.emit(&event(1)).await.unwrap();
    cancel.abort();
    assert!(cancel.await.unwrap_err().is_cancelled());

    vm.emit(&event(2)).await.unwrap();
    vm.close_connection().await;
    assert_eq!(join(keep).await.unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn failed_activation_ends_only_that_receiver() {
    let vm = MockJdwpVm::spawn().await.unwrap();
    let shared = connect(&vm, &PipelineFactories::new()).await;

    let (ready, survivor) = spawn_collector(&shared, "survivor", None);
    ready.await.unwrap();

    let err = tokio::time::timeout(
        TIMEOUT,
        shared
            .new_packet_receiver()
            .with_activation(|| async { Err(JdwpError::Unsupported("activation")) })
            .receive(|_| Ok::<_, JdwpError>(())),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(matches!(err, JdwpError::Unsupported("activation")));

    vm.emit(&event(1)).await.unwrap();
    vm.close_connection().await;
    assert_eq!(join(survivor).await.unwrap(), vec![1]);
}

#[tokio::test]
async fn peer_eof_terminates_session_without_receivers() {
    let vm = MockJdwpVm::spawn().await.unwrap();
    let shared = connect(&vm, &PipelineFactories::new()).await;

    let first = event(1);
    let (received, sent) = tokio::join!(
        tokio::time::timeout(
            TIMEOUT,
            shared.new_packet_receiver().receive_first(|_| true)
        ),
        vm.emit(&first)
    );
    sent.unwrap();
    assert_eq!(received.unwrap().unwrap(), first);
    assert!(matches!(shared.state(), SessionState::Running));

    vm.close_connection().await;
    let termination = tokio::time::timeout(TIMEOUT, shared.wait_terminated())
        .await
        .expect("EOF must be noticed with no receiver registered");
    assert!(termination.is_eof());
    assert!(shared.is_terminated());
}

#[tokio::test]
async fn shutdown_lets_the_peer_finish_the_session() {
    let vm = MockJdwpVm::spawn().await.unwrap();
    let shared = connect(&vm, &PipelineFactories::new()).await;
    let (ready, collector) = spawn_collector(&shared, "collector", None);
    ready.await.unwrap();

    vm.emit(&event(1)).await.unwrap();
    shared.shutdown().await.unwrap();
    tokio::time::timeout(TIMEOUT, vm.wait_disconnected())
        .await
        .expect("the VM should see EOF");
    assert!(!shared.is_terminated());

    vm.emit(&event(2)).await.unwrap();
    vm.close_connection().await;
    assert_eq!(join(collector).await.unwrap(), vec![1, 2]);
    assert!(shared.wait_terminated().await.is_eof());
}
