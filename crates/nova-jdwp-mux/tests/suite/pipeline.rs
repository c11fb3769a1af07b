use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use nova_jdwp_mux::wire::mock::MockJdwpVm;
use nova_jdwp_mux::{
    FilterId, JdwpPacketView, Packet, PipelineFactories, SessionKey, SharedJdwpSessionFilter,
    SharedJdwpSessionMonitor, TracingPacketMonitor,
};
use tracing::{field::Visit, Event};
use tracing_subscriber::{layer::Context, prelude::*, Layer};

use crate::harness::{connect, event, join, spawn_collector};

type Journal = Arc<Mutex<Vec<String>>>;

struct JournalFilter {
    id: FilterId,
    journal: Journal,
}

impl SharedJdwpSessionFilter for JournalFilter {
    fn id(&self) -> &FilterId {
        &self.id
    }

    fn before_send_packet(&mut self, packet: &JdwpPacketView<'_>) {
        self.journal.lock().unwrap().push(format!("filter:send:{}", packet.id()));
    }

    fn filter(&mut self, packet: &JdwpPacketView<'_>) -> bool {
        self.journal.lock().unwrap().push(format!("filter:filter:{}", packet.id()));
        true
    }

    fn after_receive_packet(&mut self, packet: &JdwpPacketView<'_>) {
        self.journal.lock().unwrap().push(format!("filter:receive:{}", packet.id()));
    }

    fn close(&mut self) {
        self.journal.lock().unwrap().push("filter:close".to_string());
    }
}

struct JournalMonitor {
    journal: Journal,
}

impl SharedJdwpSessionMonitor for JournalMonitor {
    fn on_send_packet(&mut self, packet: &JdwpPacketView<'_>) {
        self.journal.lock().unwrap().push(format!("monitor:send:{}", packet.id()));
    }

    fn on_receive_packet(&mut self, packet: &JdwpPacketView<'_>) {
        self.journal.lock().unwrap().push(format!("monitor:receive:{}", packet.id()));
    }

    fn close(&mut self) {
        self.journal.lock().unwrap().push("monitor:close".to_string());
    }
}

fn journal_factories(journal: &Journal, id: &FilterId) -> PipelineFactories {
    let (filter_journal, monitor_journal, id) = (journal.clone(), journal.clone(), id.clone());
    PipelineFactories::new()
        .with_filter(move |_: &SessionKey| {
            Some(Box::new(JournalFilter {
                id: id.clone(),
                journal: filter_journal.clone(),
            }) as Box<dyn SharedJdwpSessionFilter>)
        })
        .with_monitor(move |_: &SessionKey| {
            Some(Box::new(JournalMonitor {
                journal: monitor_journal.clone(),
            }) as Box<dyn SharedJdwpSessionMonitor>)
        })
}

#[tokio::test]
async fn filters_observe_before_monitors_in_both_directions() {
    let vm = MockJdwpVm::spawn().await.unwrap();
    let journal = Journal::default();
    let id = FilterId::new("journal");
    let shared = connect(&vm, &journal_factories(&journal, &id)).await;

    let (ready, bound) = spawn_collector(&shared, "bound", Some(id));
    ready.await.unwrap();

    shared
        .handle_jdwp_command(&event(10), None, |_| Ok(()))
        .await
        .unwrap();
    vm.emit(&event(1)).await.unwrap();
    vm.close_connection().await;
    assert_eq!(join(bound).await.unwrap(), vec![10, 1]);
    shared.wait_terminated().await;

    assert_eq!(
        *journal.lock().unwrap(),
        vec![
            "filter:send:10",
            "monitor:send:10",
            // The mock VM answers the command with a reply carrying the same id.
            "filter:filter:10",
            "filter:receive:10",
            "monitor:receive:10",
            "filter:filter:1",
            "filter:receive:1",
            "monitor:receive:1",
            "filter:close",
            "monitor:close",
        ]
    );
}

#[tokio::test]
async fn unbound_filters_still_see_every_packet() {
    let vm = MockJdwpVm::spawn().await.unwrap();
    let journal = Journal::default();
    let shared = connect(&vm, &journal_factories(&journal, &FilterId::new("unused"))).await;

    let (ready, unfiltered) = spawn_collector(&shared, "unfiltered", None);
    ready.await.unwrap();
    vm.emit(&event(5)).await.unwrap();
    vm.close_connection().await;
    assert_eq!(join(unfiltered).await.unwrap(), vec![5]);
    shared.wait_terminated().await;

    let journal = journal.lock().unwrap();
    assert!(journal.contains(&"filter:receive:5".to_string()));
    assert!(!journal.iter().any(|entry| entry.starts_with("filter:filter")));
    assert_eq!(journal.iter().filter(|e| e.ends_with(":close")).count(), 2);
}

#[tokio::test]
async fn factories_may_opt_out_per_session() {
    let vm = MockJdwpVm::spawn().await.unwrap();
    let created = Arc::new(Mutex::new(Vec::new()));
    let seen = created.clone();
    let factories = PipelineFactories::new().with_monitor(move |key: &SessionKey| {
        seen.lock().unwrap().push(key.clone());
        if key.pid == 4242 {
            None
        } else {
            Some(Box::new(TracingPacketMonitor::new(key.clone())) as Box<dyn SharedJdwpSessionMonitor>)
        }
    });
    let shared = connect(&vm, &factories).await;

    assert_eq!(*created.lock().unwrap(), vec![shared.key().clone()]);
    shared.close().await;
}

#[derive(Clone, Default)]
struct CapturingLayer {
    events: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

impl<S> Layer<S> for CapturingLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        self.events.lock().unwrap().push(visitor.fields);
    }
}

#[derive(Default)]
struct FieldVisitor {
    fields: HashMap<String, String>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.fields.insert(field.name().to_string(), format!("{value:?}"));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }
}

#[test]
fn tracing_monitor_logs_both_directions() {
    let layer = CapturingLayer::default();
    let events = layer.events.clone();
    let subscriber = tracing_subscriber::registry().with(layer);
    let _guard = tracing::subscriber::set_default(subscriber);

    let mut monitor = TracingPacketMonitor::new(SessionKey::new("emulator-5554", 7));
    let packet = event(3);
    monitor.on_send_packet(&packet.as_view());
    monitor.on_receive_packet(&packet.as_view());

    let events = events.lock().unwrap();
    let directions: Vec<_> = events
        .iter()
        .filter(|fields| fields.get("target").map(String::as_str) == Some("nova.jdwp"))
        .filter_map(|fields| fields.get("direction").cloned())
        .collect();
    assert_eq!(directions, vec!["send", "receive"]);
    assert!(events
        .iter()
        .all(|fields| fields.get("session").map(String::as_str) == Some("emulator-5554/7")));
}
