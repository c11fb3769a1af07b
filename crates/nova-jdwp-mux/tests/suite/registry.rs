use nova_jdwp_mux::ddms::{create_ddms_packet, DdmsChunkType};
use nova_jdwp_mux::wire::mock::MockJdwpVm;
use nova_jdwp_mux::{
    no_ddms_filter_id, JdwpSession, JdwpSessionConfig, SessionKey, SharedJdwpSessionRegistry,
};

use crate::harness::{event, init_tracing, join, spawn_collector};

#[tokio::test]
async fn default_filter_hides_ddms_traffic_from_bound_receivers() {
    init_tracing();
    let vm = MockJdwpVm::spawn().await.unwrap();
    let registry = SharedJdwpSessionRegistry::default();
    let addr = vm.addr();
    let shared = registry
        .get_or_open(SessionKey::new("emulator-5554", 77), || {
            JdwpSession::connect(addr, JdwpSessionConfig::default())
        })
        .await
        .unwrap();

    let (plain_ready, plain) = spawn_collector(&shared, "plain", Some(no_ddms_filter_id()));
    let (raw_ready, raw) = spawn_collector(&shared, "raw", None);
    plain_ready.await.unwrap();
    raw_ready.await.unwrap();

    // Our own DDMS command and the VM's (empty) reply to it.
    shared.handle_ddms_hpgc(None).await.unwrap();
    // An unsolicited DDMS packet from the VM, then a regular event.
    vm.emit(&create_ddms_packet(5, DdmsChunkType::APNM, b"app").unwrap())
        .await
        .unwrap();
    vm.emit(&event(6)).await.unwrap();
    vm.close_connection().await;

    assert_eq!(join(plain).await.unwrap(), vec![6]);
    let raw_ids = join(raw).await.unwrap();
    assert_eq!(raw_ids.len(), 3);
    assert_eq!(&raw_ids[1..], &[5, 6]);
}

#[tokio::test]
async fn one_session_per_process() {
    let vm = MockJdwpVm::spawn().await.unwrap();
    let registry = SharedJdwpSessionRegistry::default();
    let addr = vm.addr();
    let key = SessionKey::new("emulator-5554", 78);

    let (first, second) = tokio::join!(
        registry.get_or_open(key.clone(), || JdwpSession::connect(
            addr,
            JdwpSessionConfig::default()
        )),
        registry.get_or_open(key.clone(), || JdwpSession::connect(
            addr,
            JdwpSessionConfig::default()
        )),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    // Both handles drive the same connection: a receiver on one sees traffic
    // requested through the other.
    let (ready, task) = spawn_collector(&first, "first", None);
    ready.await.unwrap();
    vm.emit(&event(1)).await.unwrap();
    second.close().await;
    assert!(first.is_terminated());
    assert!(join(task).await.is_err());
    assert!(registry.get(&key).await.is_none());
}
