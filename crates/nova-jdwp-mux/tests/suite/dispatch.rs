use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use nova_jdwp_mux::wire::mock::MockJdwpVm;
use nova_jdwp_mux::{
    FilterId, JdwpError, JdwpPacket, JdwpPacketView, Packet, PipelineFactories, SessionKey,
    SharedJdwpSessionFilter,
};

use crate::harness::{connect, event, join, spawn_collector, TIMEOUT};

struct RejectIds {
    id: FilterId,
    rejected: Vec<u32>,
}

impl SharedJdwpSessionFilter for RejectIds {
    fn id(&self) -> &FilterId {
        &self.id
    }

    fn filter(&mut self, packet: &JdwpPacketView<'_>) -> bool {
        !self.rejected.contains(&packet.id())
    }
}

fn reject_ids(id: &FilterId, rejected: Vec<u32>) -> PipelineFactories {
    let id = id.clone();
    PipelineFactories::new().with_filter(move |_: &SessionKey| {
        Some(Box::new(RejectIds {
            id: id.clone(),
            rejected: rejected.clone(),
        }) as Box<dyn SharedJdwpSessionFilter>)
    })
}

#[tokio::test]
async fn unfiltered_and_filtered_receivers_see_their_packets_then_eof() {
    let vm = MockJdwpVm::spawn().await.unwrap();
    let skip_two = FilterId::new("skip-two");
    let shared = connect(&vm, &reject_ids(&skip_two, vec![2])).await;

    let (r1_ready, r1) = spawn_collector(&shared, "r1", None);
    let (r2_ready, r2) = spawn_collector(&shared, "r2", Some(skip_two));
    r1_ready.await.unwrap();
    r2_ready.await.unwrap();

    for id in 1..=3 {
        vm.emit(&event(id)).await.unwrap();
    }
    vm.close_connection().await;

    assert_eq!(join(r1).await.unwrap(), vec![1, 2, 3]);
    assert_eq!(join(r2).await.unwrap(), vec![1, 3]);
    assert!(shared.wait_terminated().await.is_eof());
}

#[tokio::test]
async fn different_filters_select_different_subsets() {
    let vm = MockJdwpVm::spawn().await.unwrap();
    let odd = FilterId::new("odd");
    let even = FilterId::new("even");
    let factories = {
        let (odd, even) = (odd.clone(), even.clone());
        PipelineFactories::new()
            .with_filter(move |_: &SessionKey| {
                Some(Box::new(RejectIds {
                    id: odd.clone(),
                    rejected: vec![2, 4],
                }) as Box<dyn SharedJdwpSessionFilter>)
            })
            .with_filter(move |_: &SessionKey| {
                Some(Box::new(RejectIds {
                    id: even.clone(),
                    rejected: vec![1, 3],
                }) as Box<dyn SharedJdwpSessionFilter>)
            })
    };
    let shared = connect(&vm, &factories).await;

    let (odd_ready, odd_task) = spawn_collector(&shared, "odd", Some(odd));
    let (even_ready, even_task) = spawn_collector(&shared, "even", Some(even));
    let (all_ready, all_task) = spawn_collector(&shared, "all", None);
    for ready in [odd_ready, even_ready, all_ready] {
        ready.await.unwrap();
    }

    for id in 1..=4 {
        vm.emit(&event(id)).await.unwrap();
    }
    vm.close_connection().await;

    assert_eq!(join(odd_task).await.unwrap(), vec![1, 3]);
    assert_eq!(join(even_task).await.unwrap(), vec![2, 4]);
    assert_eq!(join(all_task).await.unwrap(), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn receivers_finish_each_packet_before_the_next_starts() {
    let vm = MockJdwpVm::spawn().await.unwrap();
    let shared = connect(&vm, &PipelineFactories::new()).await;
    let journal = Arc::new(Mutex::new(Vec::new()));

    let mut tasks = Vec::new();
    for name in ["first", "second", "third"] {
        let (ready_tx, ready) = tokio::sync::oneshot::channel();
        let journal = journal.clone();
        let receiver = shared
            .new_packet_receiver()
            .with_name(name)
            .with_activation(move || async move {
                let _ = ready_tx.send(());
                Ok(())
            });
        tasks.push(tokio::spawn(async move {
            receiver
                .receive(|packet| {
                    journal.lock().unwrap().push(format!("{name}:{}", packet.id()));
                    Ok::<_, JdwpError>(())
                })
                .await
        }));
        ready.await.unwrap();
    }

    for id in 1..=3 {
        vm.emit(&event(id)).await.unwrap();
    }
    vm.close_connection().await;
    for task in tasks {
        join(task).await.unwrap();
    }

    let expected: Vec<String> = (1..=3)
        .flat_map(|id| ["first", "second", "third"].map(|name| format!("{name}:{id}")))
        .collect();
    assert_eq!(*journal.lock().unwrap(), expected);
}

#[tokio::test]
async fn failing_receiver_does_not_disturb_others() {
    let vm = MockJdwpVm::spawn().await.unwrap();
    let shared = connect(&vm, &PipelineFactories::new()).await;

    let (ready_tx, ready) = tokio::sync::oneshot::channel();
    let failing = shared
        .new_packet_receiver()
        .with_name("failing")
        .with_activation(move || async move {
            let _ = ready_tx.send(());
            Ok(())
        });
    let failing = tokio::spawn(failing.receive(|packet| {
        if packet.id() == 1 {
            Err(JdwpError::InvalidArgument("bad packet".into()))
        } else {
            Ok(())
        }
    }));
    ready.await.unwrap();
    let (healthy_ready, healthy) = spawn_collector(&shared, "healthy", None);
    healthy_ready.await.unwrap();

    vm.emit(&event(1)).await.unwrap();
    let err = join(failing).await.unwrap_err();
    assert!(matches!(err, JdwpError::InvalidArgument(_)));
    assert!(!shared.is_terminated());

    vm.emit(&event(2)).await.unwrap();
    vm.close_connection().await;
    assert_eq!(join(healthy).await.unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn first_match_stops_without_consuming_the_stream() {
    let vm = MockJdwpVm::spawn().await.unwrap();
    let shared = connect(&vm, &PipelineFactories::new()).await;

    let (ready, rest) = spawn_collector(&shared, "rest", None);
    ready.await.unwrap();

    let finder = shared.new_packet_receiver().with_name("finder");
    let emitter = async {
        for id in 1..=3 {
            vm.emit(&event(id)).await.unwrap();
        }
    };
    let (found, ()) = tokio::join!(
        tokio::time::timeout(TIMEOUT, finder.receive_first(|packet| packet.id() == 2)),
        emitter
    );
    let found = found.unwrap().unwrap();
    assert_eq!(found.id(), 2);
    assert!(!shared.is_terminated());

    let ids = shared
        .new_packet_receiver()
        .receive_map_first(|packet| {
            Ok::<_, JdwpError>(if packet.id() == 4 {
                ControlFlow::Break(packet.id())
            } else {
                ControlFlow::Continue(())
            })
        });
    let fourth = event(4);
    let (id, sent) = tokio::join!(tokio::time::timeout(TIMEOUT, ids), vm.emit(&fourth));
    sent.unwrap();
    assert_eq!(id.unwrap().unwrap(), Some(4));

    vm.close_connection().await;
    assert_eq!(join(rest).await.unwrap(), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn flow_packets_outlive_later_reads() {
    let vm = MockJdwpVm::spawn().await.unwrap();
    let shared = connect(&vm, &PipelineFactories::new()).await;

    let emitter = async {
        vm.emit(&event(1)).await.unwrap();
        vm.emit(&JdwpPacket::command(2, 64, 100, vec![0xff; 64]).unwrap())
            .await
            .unwrap();
        vm.close_connection().await;
    };
    let (packets, ()) = tokio::join!(
        tokio::time::timeout(
            TIMEOUT,
            shared.new_packet_receiver().flow().collect::<Vec<_>>()
        ),
        emitter
    );
    let packets: Vec<JdwpPacket> = packets
        .unwrap()
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(packets.len(), 2);
    assert_eq!(packets[0], event(1));
    assert_eq!(packets[0].payload(), &1u32.to_be_bytes());
    assert_eq!(packets[1].payload(), &[0xff; 64][..]);
}

#[tokio::test]
async fn flow_consumer_can_send_commands_between_packets() {
    let vm = MockJdwpVm::spawn().await.unwrap();
    let shared = connect(&vm, &PipelineFactories::new()).await;

    let mut flow = shared.new_packet_receiver().with_name("flow").flow();
    let consumer = async {
        let mut events = Vec::new();
        let mut replies = Vec::new();
        while let Some(packet) = flow.next().await {
            let packet = packet?;
            if !packet.is_command() {
                continue;
            }
            events.push(packet.id());
            let version = JdwpPacket::command(shared.next_packet_id()?, 1, 1, Vec::new())?;
            let code = shared
                .handle_jdwp_command(&version, None, |reply| Ok(reply.error_code()))
                .await?;
            replies.push(code);
            if events.len() == 3 {
                break;
            }
        }
        Ok::<_, JdwpError>((events, replies))
    };
    let emitter = async {
        for id in 1..=3 {
            vm.emit(&event(id)).await.unwrap();
        }
    };

    let (consumed, ()) = tokio::join!(tokio::time::timeout(TIMEOUT, consumer), emitter);
    let (events, replies) = consumed.expect("flow consumer stalled").unwrap();

    assert_eq!(events, vec![1, 2, 3]);
    assert_eq!(replies, vec![Some(0); 3]);
    drop(flow);
    shared.close().await;
}
