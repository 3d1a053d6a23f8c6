use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, Once, PoisonError,
    },
};

use maplit::hashmap;
use pretty_assertions::assert_eq;
use zbus::zvariant::Value;

use super::ObjectNode;
use crate::{
    mock::{MockInterface, MockTransport},
    Error, FieldDefinition, PropValue, PropertyMap, Subtree,
};

const SERVICE: &str = "org.example.Service";
const ROOT: &str = "/root";

type Node = ObjectNode<MockTransport>;

fn paths(items: &[&str]) -> PropValue {
    PropValue::PathList(items.iter().map(|path| path.to_string()).collect())
}

fn path(path: &str) -> PropValue {
    PropValue::Path(path.to_owned())
}

fn count_changes(node: &Node) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let count_moved = count.clone();
    node.on_properties_changed(move |_| {
        count_moved.fetch_add(1, Ordering::Relaxed);
    });
    count
}

fn item() -> FieldDefinition<MockTransport> {
    FieldDefinition::new("X.Item", Subtree::new())
}

fn root_definition() -> Arc<FieldDefinition<MockTransport>> {
    Arc::new(FieldDefinition::new(
        "X.Root",
        Subtree::new().scalar("Name").object("Items", item()).object("Current", item()),
    ))
}

/// A transport with items at `/a`, `/b` and `/c`, and an object at `/bare` that isn't an item.
fn transport() -> Arc<MockTransport> {
    let transport = MockTransport::new();
    for item in ["/a", "/b", "/c"] {
        transport.add_object(item, "X.Item", PropertyMap::new());
    }
    transport.add_bare_object("/bare");
    transport
}

async fn root(transport: &Arc<MockTransport>, properties: PropertyMap) -> Arc<Node> {
    transport.add_object(ROOT, "X.Root", properties);
    ObjectNode::create(transport.clone(), SERVICE, ROOT, root_definition(), None).await.unwrap()
}

fn member_paths(node: &Node, key: &str) -> Vec<String> {
    node.children(key).iter().map(|child| child.path().to_owned()).collect()
}

#[tokio::test]
async fn test_collection_swap() {
    let transport = transport();
    let root = root(&transport, PropertyMap::new()).await;
    let changes = count_changes(&root);

    assert!(root.parse_properties(hashmap! { "Items".to_owned() => paths(&["/a", "/b"]) }).await.is_empty());
    assert_eq!(member_paths(&root, "Items"), vec!["/a", "/b"]);
    assert_eq!(changes.load(Ordering::Relaxed), 1);
    let a = root.member("Items", "/a").unwrap();
    let b = root.member("Items", "/b").unwrap();

    assert!(root.parse_properties(hashmap! { "Items".to_owned() => paths(&["/b", "/c"]) }).await.is_empty());
    assert_eq!(member_paths(&root, "Items"), vec!["/b", "/c"]);
    assert_eq!(changes.load(Ordering::Relaxed), 2);
    assert!(a.is_destroyed());
    assert!(Arc::ptr_eq(&b, &root.member("Items", "/b").unwrap()));
    assert_eq!(transport.resolutions("/b", "X.Item"), 1);
    assert_eq!(transport.resolutions("/c", "X.Item"), 1);
}

#[tokio::test]
async fn test_collection_converges() {
    let transport = transport();
    let root = root(&transport, PropertyMap::new()).await;

    let rounds = [
        (vec!["/a", "/b", "/bare"], vec!["/a", "/b"]),
        (vec!["/c", "/a"], vec!["/c", "/a"]),
        (vec![], vec![]),
        (vec!["/b", "/bare", "/a", "/b"], vec!["/b", "/a"]),
        (vec!["/a", "/b", "/c"], vec!["/a", "/b", "/c"]),
    ];
    for (incoming, expected) in rounds {
        assert!(root.parse_properties(hashmap! { "Items".to_owned() => paths(&incoming) }).await.is_empty());
        assert_eq!(member_paths(&root, "Items"), expected);
        // one subscription for the root, one per member
        assert_eq!(transport.total_subscriptions(), 1 + expected.len());
    }
}

#[tokio::test]
async fn test_single_reference() {
    let transport = transport();
    let root = root(&transport, hashmap! { "Current".to_owned() => path("/a") }).await;
    let a = root.child("Current").unwrap();

    assert!(root.parse_properties(hashmap! { "Current".to_owned() => path("/a") }).await.is_empty());
    assert!(Arc::ptr_eq(&a, &root.child("Current").unwrap()));
    assert!(!a.is_destroyed());
    assert_eq!(transport.resolutions("/a", "X.Item"), 1);

    assert!(root.parse_properties(hashmap! { "Current".to_owned() => path("/b") }).await.is_empty());
    assert!(a.is_destroyed());
    assert_eq!(root.child("Current").unwrap().path(), "/b");
    assert_eq!(transport.resolutions("/b", "X.Item"), 1);
    assert_eq!(transport.subscriptions_at("/a"), 0);
    assert_eq!(transport.unsubscribed().len(), 1);

    assert!(root.parse_properties(hashmap! { "Current".to_owned() => path("/bare") }).await.is_empty());
    assert!(root.child("Current").is_none());
    assert_eq!(root.dump(), serde_json::json!({ "Current": null, "path": "/root" }));
}

#[tokio::test]
async fn test_changes_cascade_upwards() {
    let transport = MockTransport::new();
    transport.add_object("/mid", "X.Mid", hashmap! { "Leaf".to_owned() => path("/leaf") });
    transport.add_object("/leaf", "X.Leaf", hashmap! { "Level".to_owned() => PropValue::UInt(1) });
    transport.add_object(ROOT, "X.Root", hashmap! { "Mid".to_owned() => path("/mid") });

    let leaf = FieldDefinition::new("X.Leaf", Subtree::new().scalar("Level"));
    let mid = FieldDefinition::new("X.Mid", Subtree::new().object("Leaf", leaf));
    let definition = Arc::new(FieldDefinition::new("X.Root", Subtree::new().object("Mid", mid)));
    let root = ObjectNode::create(transport.clone(), SERVICE, ROOT, definition, None).await.unwrap();

    let mid = root.child("Mid").unwrap();
    let leaf = mid.child("Leaf").unwrap();
    let counts = [count_changes(&root), count_changes(&mid), count_changes(&leaf)];

    transport.emit_properties_changed("/leaf", "X.Leaf", hashmap! { "Level".to_owned() => PropValue::UInt(2) }).await;
    assert_eq!(counts.iter().map(|count| count.load(Ordering::Relaxed)).collect::<Vec<_>>(), vec![1, 1, 1]);
    assert_eq!(leaf.value("Level"), Some(PropValue::UInt(2)));

    // PropertiesChanged of another interface on the same object
    transport.emit_properties_changed("/leaf", "X.Other", hashmap! { "Level".to_owned() => PropValue::UInt(3) }).await;
    assert_eq!(counts.iter().map(|count| count.load(Ordering::Relaxed)).collect::<Vec<_>>(), vec![1, 1, 1]);
    assert_eq!(
        root.dump(),
        serde_json::json!({
            "Mid": { "Leaf": { "Level": 2, "path": "/leaf" }, "path": "/mid" },
            "path": "/root",
        })
    );
}

#[tokio::test]
async fn test_undeclared_properties_are_ignored() {
    let transport = transport();
    let root = root(
        &transport,
        hashmap! {
            "Name".to_owned() => PropValue::from("kiosk"),
            "Secret".to_owned() => PropValue::from("hunter2"),
        },
    )
    .await;
    assert_eq!(root.dump(), serde_json::json!({ "Name": "kiosk", "path": "/root" }));

    let changes = count_changes(&root);
    assert!(root.parse_properties(hashmap! { "Secret".to_owned() => PropValue::from("swordfish") }).await.is_empty());
    assert_eq!(changes.load(Ordering::Relaxed), 0);
    assert_eq!(root.value("Secret"), None);
}

#[tokio::test]
async fn test_resent_scalar_still_notifies() {
    let transport = transport();
    let root = root(&transport, hashmap! { "Name".to_owned() => PropValue::from("kiosk") }).await;
    let changes = count_changes(&root);
    transport.emit_properties_changed(ROOT, "X.Root", hashmap! { "Name".to_owned() => PropValue::from("kiosk") }).await;
    assert_eq!(changes.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_try_create_tolerates_absent_interface() {
    let transport = transport();
    transport.fail_path("/broken", "Connection reset");

    let created =
        ObjectNode::try_create(transport.clone(), SERVICE.to_owned(), "/bare".to_owned(), Arc::new(item()), None).await;
    assert!(matches!(created, Ok(None)));

    let err = ObjectNode::try_create(transport.clone(), SERVICE.to_owned(), "/broken".to_owned(), Arc::new(item()), None)
        .await
        .unwrap_err();
    assert_eq!(err.remote_message(), Some("Connection reset"));

    let missing = ObjectNode::try_create(transport.clone(), SERVICE.to_owned(), "/nowhere".to_owned(), Arc::new(item()), None);
    assert!(missing.await.is_err());
}

#[tokio::test]
async fn test_failing_member_does_not_abort_siblings() {
    let transport = transport();
    transport.fail_path("/broken", "Connection reset");
    let root = root(&transport, PropertyMap::new()).await;
    let changes = count_changes(&root);

    let failures = root.parse_properties(hashmap! { "Items".to_owned() => paths(&["/a", "/broken", "/b"]) }).await;
    assert_eq!(failures.len(), 1);
    assert_eq!((failures[0].key.as_str(), failures[0].path.as_str()), ("Items", "/broken"));
    assert_eq!(failures[0].error.remote_message(), Some("Connection reset"));
    assert_eq!(member_paths(&root, "Items"), vec!["/a", "/b"]);
    assert_eq!(changes.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_failing_member_during_initial_sync() {
    let transport = transport();
    transport.fail_path("/broken", "Connection reset");
    let root = root(
        &transport,
        hashmap! { "Items".to_owned() => paths(&["/a", "/broken", "/b"]), "Current".to_owned() => path("/broken") },
    )
    .await;

    assert!(root.is_live());
    assert_eq!(member_paths(&root, "Items"), vec!["/a", "/b"]);
    assert!(root.child("Current").is_none());
    // the root and both members are subscribed, nothing for the failed branch
    assert_eq!(transport.total_subscriptions(), 3);
    assert_eq!(transport.subscriptions_at("/broken"), 0);

    // once the object is reachable again, the next change picks it up
    transport.add_object("/d", "X.Item", PropertyMap::new());
    transport.emit_properties_changed(ROOT, "X.Root", hashmap! { "Items".to_owned() => paths(&["/a", "/d", "/b"]) }).await;
    assert_eq!(member_paths(&root, "Items"), vec!["/a", "/d", "/b"]);
}

#[tokio::test]
async fn test_failing_grandchild_keeps_the_tree() {
    let transport = MockTransport::new();
    transport.add_object(ROOT, "X.Root", hashmap! { "Devices".to_owned() => paths(&["/dev", "/dev2"]) });
    transport.add_object("/dev", "X.Device", hashmap! { "Aps".to_owned() => paths(&["/ap1", "/gone"]) });
    transport.add_object("/dev2", "X.Device", hashmap! { "Aps".to_owned() => paths(&[]) });
    transport.add_object("/ap1", "X.Ap", hashmap! { "Strength".to_owned() => PropValue::UInt(70) });
    transport.fail_path("/gone", "Connection reset");

    let ap = FieldDefinition::new("X.Ap", Subtree::new().scalar("Strength"));
    let device = FieldDefinition::new("X.Device", Subtree::new().object("Aps", ap));
    let definition = Arc::new(FieldDefinition::new("X.Root", Subtree::new().object("Devices", device)));
    let root = ObjectNode::create(transport.clone(), SERVICE, ROOT, definition, None).await.unwrap();

    assert_eq!(member_paths(&root, "Devices"), vec!["/dev", "/dev2"]);
    let dev = root.member("Devices", "/dev").unwrap();
    assert!(dev.is_live());
    assert_eq!(member_paths(&dev, "Aps"), vec!["/ap1"]);
    assert_eq!(
        root.dump(),
        serde_json::json!({
            "Devices": [
                { "Aps": [{ "Strength": 70, "path": "/ap1" }], "path": "/dev" },
                { "Aps": [], "path": "/dev2" },
            ],
            "path": "/root",
        })
    );
}

/// Collects every log record, so tests can check what got reported at which level.
struct Recorder {
    records: Mutex<Vec<(log::Level, String)>>,
}

impl log::Log for Recorder {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.push((record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}

static RECORDER: Recorder = Recorder { records: Mutex::new(Vec::new()) };

fn record_logs() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        log::set_logger(&RECORDER).unwrap();
        log::set_max_level(log::LevelFilter::Debug);
    });
}

/// Levels of the records logged so far that mention `path`.
fn logged_about(path: &str) -> Vec<log::Level> {
    let records = RECORDER.records.lock().unwrap_or_else(PoisonError::into_inner);
    let pattern = format!("{} ", path);
    records.iter().filter(|(_, message)| message.contains(&pattern)).map(|(level, _)| *level).collect()
}

#[tokio::test]
async fn test_absent_interface_is_not_a_warning() {
    record_logs();
    let transport = transport();
    transport.add_bare_object("/quiet");
    transport.fail_path("/flaky", "Connection reset");

    let created =
        ObjectNode::try_create(transport.clone(), SERVICE.to_owned(), "/quiet".to_owned(), Arc::new(item()), None).await;
    assert!(matches!(created, Ok(None)));
    let created =
        ObjectNode::try_create(transport.clone(), SERVICE.to_owned(), "/flaky".to_owned(), Arc::new(item()), None).await;
    assert!(created.is_err());

    let quiet = logged_about("/quiet");
    assert!(quiet.contains(&log::Level::Debug));
    assert!(quiet.iter().all(|level| *level > log::Level::Warn));
    assert_eq!(logged_about("/flaky").iter().filter(|level| **level == log::Level::Warn).count(), 1);
}

#[tokio::test]
async fn test_create_fails_on_unexpected_error() {
    let transport = transport();
    transport.fail_path(ROOT, "Access denied");
    let err = ObjectNode::create(transport.clone(), SERVICE, ROOT, root_definition(), None).await.unwrap_err();
    assert!(!err.is_interface_absent("X.Root", ROOT));
    assert_eq!(transport.total_subscriptions(), 0);
}

#[tokio::test]
async fn test_destroy_is_idempotent() {
    let transport = transport();
    let root = root(&transport, hashmap! { "Items".to_owned() => paths(&["/a", "/b"]), "Current".to_owned() => path("/c") })
        .await;
    let children = root.children("Items");
    let changes = count_changes(&root);
    assert_eq!(transport.total_subscriptions(), 4);

    root.destroy();
    root.destroy();
    assert!(root.is_destroyed());
    assert!(!root.is_live());
    assert!(children.iter().all(|child| child.is_destroyed()));
    assert_eq!(transport.total_subscriptions(), 0);

    let unsubscribed = transport.unsubscribed();
    assert_eq!(unsubscribed.len(), 4);
    assert_eq!(unsubscribed.iter().collect::<HashSet<_>>().len(), 4);

    // late signals and parses don't revive anything
    transport.emit_properties_changed(ROOT, "X.Root", hashmap! { "Items".to_owned() => paths(&["/c"]) }).await;
    assert!(root.parse_properties(hashmap! { "Items".to_owned() => paths(&["/c"]) }).await.is_empty());
    assert_eq!(changes.load(Ordering::Relaxed), 0);
    assert_eq!(root.dump(), serde_json::json!({ "path": "/root" }));
}

#[tokio::test]
async fn test_destroy_during_child_creation() {
    let transport = transport();
    transport.add_object("/slow", "X.Item", PropertyMap::new());
    transport.gate_path("/slow");
    let root = root(&transport, PropertyMap::new()).await;

    let parsing = tokio::spawn({
        let root = root.clone();
        async move { root.parse_properties(hashmap! { "Items".to_owned() => paths(&["/a", "/slow"]) }).await }
    });
    while transport.waiting_at("/slow") == 0 {
        tokio::task::yield_now().await;
    }

    root.destroy();
    transport.open_gate("/slow");
    assert!(parsing.await.unwrap().is_empty());

    assert_eq!(transport.resolutions("/slow", "X.Item"), 1);
    assert!(root.children("Items").is_empty());
    assert_eq!(transport.total_subscriptions(), 0);
}

#[tokio::test]
async fn test_listener_removal() {
    let transport = transport();
    let root = root(&transport, PropertyMap::new()).await;
    let count = Arc::new(AtomicUsize::new(0));
    let count_moved = count.clone();
    let id = root.on_properties_changed(move |_| {
        count_moved.fetch_add(1, Ordering::Relaxed);
    });

    assert!(root.parse_properties(hashmap! { "Name".to_owned() => PropValue::from("one") }).await.is_empty());
    assert!(root.remove_listener(id));
    assert!(!root.remove_listener(id));
    assert!(root.parse_properties(hashmap! { "Name".to_owned() => PropValue::from("two") }).await.is_empty());
    assert_eq!(count.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_failing_signal_handler_is_isolated() {
    let transport = MockTransport::new();
    transport.add_object("/dev", "X.Device", PropertyMap::new());
    let pings = Arc::new(AtomicUsize::new(0));
    let pings_moved = pings.clone();
    let definition = FieldDefinition::new("X.Device", Subtree::new())
        .with_listener("Boom", |_node, _args| async {
            Err(Error::UnexpectedReply { method: "Boom".to_owned(), reason: "always fails".to_owned() })
        })
        .with_listener("Ping", move |_node, args| {
            let pings = pings_moved.clone();
            async move {
                assert_eq!(args, vec![PropValue::from("hello")]);
                pings.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        });
    let node = ObjectNode::create(transport.clone(), SERVICE, "/dev", Arc::new(definition), None).await.unwrap();
    assert_eq!(transport.subscriptions_at("/dev"), 3);

    transport.emit("/dev", "X.Device", "Boom", Vec::new()).await;
    transport.emit("/dev", "X.Device", "Ping", vec![PropValue::from("hello")]).await;
    assert_eq!(pings.load(Ordering::Relaxed), 1);
    assert!(node.is_live());
}

#[tokio::test]
async fn test_init_hook_runs_before_subscribing() {
    let transport = MockTransport::new();
    transport.add_object("/conn", "X.Connection", hashmap! { "Unsaved".to_owned() => PropValue::from(false) });
    let transport_moved = transport.clone();
    let definition = FieldDefinition::new("X.Connection", Subtree::new().scalar("Unsaved").scalar("Settings"))
        .with_listener("Updated", |_node, _args| async { Ok(()) })
        .with_init(move |node| {
            let transport = transport_moved.clone();
            async move {
                assert_eq!(transport.subscriptions_at(node.path()), 0);
                assert_eq!(node.value("Unsaved"), Some(PropValue::Bool(false)));
                node.store_local(vec![("Settings".to_owned(), PropValue::from("wifi"))])
            }
        });

    let node = ObjectNode::create(transport.clone(), SERVICE, "/conn", Arc::new(definition), None).await.unwrap();
    assert_eq!(node.value("Settings"), Some(PropValue::from("wifi")));
    assert_eq!(transport.subscriptions_at("/conn"), 2);
}

#[tokio::test]
async fn test_failing_init_hook_fails_creation() {
    let transport = MockTransport::new();
    transport.add_object("/conn", "X.Connection", PropertyMap::new());
    let definition = FieldDefinition::new("X.Connection", Subtree::new()).with_init(|node| async move {
        node.call_method("GetSettings", Vec::new()).await?;
        Ok(())
    });
    transport.reply("GetSettings", "/conn", Err("Permission denied"));

    let result = ObjectNode::create(transport.clone(), SERVICE, "/conn", Arc::new(definition), None).await;
    assert!(result.is_err());
    assert_eq!(transport.total_subscriptions(), 0);
}

#[tokio::test]
async fn test_store_local() {
    let transport = transport();
    let root = root(&transport, PropertyMap::new()).await;
    let changes = count_changes(&root);

    let err = root.store_local(vec![("Items".to_owned(), PropValue::from("x"))]).unwrap_err();
    assert!(matches!(err, Error::UndeclaredField(key) if key == "Items"));
    assert_eq!(changes.load(Ordering::Relaxed), 0);

    root.store_local(vec![("Name".to_owned(), PropValue::from("local"))]).unwrap();
    assert_eq!(root.value("Name"), Some(PropValue::from("local")));
    assert_eq!(changes.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_set_property_goes_to_the_bus() {
    let transport = transport();
    let root = root(&transport, hashmap! { "Name".to_owned() => PropValue::from("before") }).await;

    root.set_property("Name", Value::from("after")).await.unwrap();
    let calls = transport.set_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, MockInterface { path: ROOT.to_owned(), name: "X.Root".to_owned() });
    assert_eq!(calls[0].1, "Name");
    // only the remote's change signal updates the mirror
    assert_eq!(root.value("Name"), Some(PropValue::from("before")));
}

#[tokio::test]
async fn test_unsynced_node() {
    let transport = transport();
    let node = ObjectNode::new(transport.clone(), SERVICE.to_owned(), "/a".to_owned(), Arc::new(item()), None);

    node.set_property("Name", Value::from("ignored")).await.unwrap();
    assert!(transport.set_calls().is_empty());
    assert!(matches!(node.call_method("RequestScan", Vec::new()).await, Err(Error::Unresolved { .. })));
    assert!(!node.is_live());

    node.destroy();
    assert!(transport.unsubscribed().is_empty());
}

#[tokio::test]
async fn test_call_method() {
    let transport = transport();
    let root = root(&transport, PropertyMap::new()).await;
    transport.reply("GetSettings", ROOT, Ok(vec![PropValue::from("settings")]));

    let reply = root.call_method("GetSettings", vec![Value::from("802-11-wireless")]).await.unwrap();
    assert_eq!(reply, vec![PropValue::from("settings")]);
    let calls = transport.method_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, "GetSettings");
    assert_eq!(calls[0].2, vec![PropValue::from("802-11-wireless")]);
}
