/// Multi-site collaborative editing scenarios
/// Sites exchange frames through an in-memory hub instead of a socket
use chrono::{Duration, Utc};
use coedit::*;
use tokio::sync::mpsc;

struct Site {
    engine: SyncEngine<ConnectionManager>,
    outbox: mpsc::UnboundedReceiver<String>,
}

fn site(name: &str, seed: &str) -> Site {
    let mut config = EngineConfig::new("doc", format!("user-{}", name)).with_site_id(name);
    config.sync.batch_size = 1;
    config.sync.require_ack = false;

    let mut transport = ConnectionManager::new(TransportConfig::default());
    let (tx, outbox) = mpsc::unbounded_channel();
    transport.connect();
    transport.on_open(tx);

    let document = Document::with_content("doc", seed, SiteId::from("seed"));
    Site {
        engine: SyncEngine::with_document(config, document, transport),
        outbox,
    }
}

/// Deliver every outgoing frame to every other site until all are quiet
fn pump(sites: &mut [Site]) {
    loop {
        let mut moved = false;
        for from in 0..sites.len() {
            let mut frames = Vec::new();
            while let Ok(frame) = sites[from].outbox.try_recv() {
                frames.push(frame);
            }
            for frame in frames {
                moved = true;
                for (to, site) in sites.iter_mut().enumerate() {
                    if to != from {
                        site.engine.handle_incoming(&frame).unwrap();
                    }
                }
            }
        }
        if !moved {
            break;
        }
    }
}

fn engine(site: &str, seed: &str) -> CrdtEngine {
    let document = Document::with_content("doc", seed, SiteId::from("seed"));
    CrdtEngine::with_document(SiteId::from(site), document, CrdtConfig::default())
}

#[tokio::test]
async fn test_two_sites_concurrent_inserts_converge() {
    // Both sites start from "ac"
    let mut site_a = engine("A", "ac");
    let mut site_b = engine("B", "ac");

    // A inserts "b" at 1, B concurrently inserts "d" at 2
    let op_a = site_a.insert_text(1, "b").unwrap();
    let op_b = site_b.insert_text(2, "d").unwrap();
    assert_eq!(site_a.content(), "abc");
    assert_eq!(site_b.content(), "acd");

    // Exchange
    site_a.apply_remote_operation(op_b).unwrap();
    site_b.apply_remote_operation(op_a).unwrap();

    assert_eq!(site_a.content(), "abcd");
    assert_eq!(site_b.content(), "abcd");
}

#[tokio::test]
async fn test_three_sites_converge_through_hub() {
    let mut sites = vec![site("a", "hello"), site("b", "hello"), site("c", "hello")];

    // Everyone edits before hearing from anyone
    sites[0].engine.insert_text(0, ">> ").unwrap();
    sites[1].engine.delete_text(1, 3).unwrap();
    sites[1].engine.insert_text(2, " there").unwrap();
    sites[2].engine.insert_text(5, "!").unwrap();
    sites[2].engine.delete_text(0, 1).unwrap();

    pump(&mut sites);

    let content = sites[0].engine.content().to_string();
    for site in &sites {
        assert_eq!(site.engine.content(), content);
        assert!(site.engine.document().verify_integrity());
        assert_eq!(site.engine.crdt().buffered_count(), 0);
    }

    // A second round built on the merged state
    sites[1].engine.insert_text(0, "#").unwrap();
    pump(&mut sites);
    for site in &sites {
        assert_eq!(site.engine.content(), format!("#{}", content));
    }
}

#[tokio::test]
async fn test_offline_edits_sync_after_reconnect() {
    let mut online = site("a", "");

    // Site b starts without a connection
    let mut config = EngineConfig::new("doc", "user-b").with_site_id("b");
    config.sync.batch_size = 1;
    config.sync.require_ack = false;
    let mut offline = SyncEngine::with_document(
        config,
        Document::with_content("doc", "", SiteId::from("seed")),
        ConnectionManager::new(TransportConfig::default()),
    );

    offline.insert_text(0, "written offline").unwrap();
    assert_eq!(offline.transport().queued(), 1);

    // Reconnect: the transport flushes its queue, the engine asks for catch-up
    online.engine.insert_text(0, "meanwhile ").unwrap();
    let (tx, mut outbox) = mpsc::unbounded_channel();
    offline.transport_mut().connect();
    offline.transport_mut().on_open(tx);
    offline.on_connected().unwrap();

    while let Ok(frame) = outbox.try_recv() {
        online.engine.handle_incoming(&frame).unwrap();
    }
    while let Ok(frame) = online.outbox.try_recv() {
        offline.handle_incoming(&frame).unwrap();
    }

    assert_eq!(online.engine.content(), offline.content());
    assert!(offline.content().contains("written offline"));
    assert!(offline.content().contains("meanwhile "));
}

#[tokio::test]
async fn test_out_of_order_delivery_is_buffered() {
    let mut author = engine("A", "");
    let first = author.insert_text(0, "one").unwrap();
    let second = author.insert_text(3, " two").unwrap();

    let mut reader = engine("B", "");
    assert!(reader.apply_remote_operation(second).unwrap().is_empty());
    assert_eq!(reader.buffered_count(), 1);
    assert_eq!(reader.content(), "");

    let applied = reader.apply_remote_operation(first).unwrap();
    assert_eq!(applied.len(), 2);
    assert_eq!(reader.content(), "one two");
    assert_eq!(reader.buffered_count(), 0);
}

#[tokio::test]
async fn test_replayed_operation_is_ignored() {
    let mut author = engine("A", "abc");
    let op = author.delete_text(0, 1).unwrap();

    let mut reader = engine("B", "abc");
    reader.apply_remote_operation(op.clone()).unwrap();
    let before = reader.document().snapshot();
    assert!(reader.apply_remote_operation(op).unwrap().is_empty());
    assert_eq!(reader.document().snapshot(), before);
    assert_eq!(reader.content(), "bc");
}

#[test]
fn test_lamport_update_exceeds_both_inputs() {
    let local = Timestamp::new(4, "a");
    let remote = Timestamp::new(9, "b");
    let merged = update_timestamp(&local, &remote);
    assert!(merged.counter > local.counter);
    assert!(merged.counter > remote.counter);
    assert_eq!(merged.site_id, SiteId::from("a"));
}

#[test]
fn test_insert_insert_same_position_is_high_severity() {
    let a = Operation::new(
        Timestamp::new(1, "A"),
        OperationKind::Insert {
            position: 5,
            content: "x".to_string(),
        },
        VersionVector::new(),
    );
    let b = Operation::new(
        Timestamp::new(1, "B"),
        OperationKind::Insert {
            position: 5,
            content: "y".to_string(),
        },
        VersionVector::new(),
    );

    let conflict = detect_conflict(&a, &b, &ConflictDetectionConfig::default()).unwrap();
    assert_eq!(conflict.conflict_type, ConflictType::InsertInsert);
    assert_eq!(conflict.severity, ConflictSeverity::High);
}

#[test]
fn test_last_write_wins_keeps_later_update() {
    let update = |counter, site: &str| {
        Operation::new(
            Timestamp::new(counter, site),
            OperationKind::Update {
                position: 0,
                length: 1,
                content: site.to_string(),
                properties: Default::default(),
            },
            VersionVector::new(),
        )
    };
    let conflict = ConflictInfo::new(
        update(3, "A"),
        update(5, "B"),
        ConflictType::UpdateUpdate,
        ConflictSeverity::High,
    );

    let result = last_write_wins(&conflict).unwrap();
    assert!(result.resolved);
    assert_eq!(result.resolved_operations.len(), 1);
    assert_eq!(result.resolved_operations[0].site_id, SiteId::from("B"));
}

#[test]
fn test_missing_operations_against_version_vector() {
    let mut site_a = engine("A", "");
    let mut site_b = engine("B", "");

    site_a.insert_text(0, "1").unwrap();
    let a2 = site_a.insert_text(1, "2").unwrap();
    let b1 = site_b.insert_text(0, "x").unwrap();
    site_a.apply_remote_operation(b1).unwrap();

    let mut vector = VersionVector::new();
    vector.advance(&SiteId::from("A"), 1);
    vector.advance(&SiteId::from("B"), 1);

    let missing = site_a.document().missing_operations(&vector);
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].id, a2.id);
}

#[test]
fn test_transport_backoff_is_bounded() {
    let mut manager = ConnectionManager::new(TransportConfig {
        max_reconnect_attempts: 5,
        reconnect_delay_ms: 1_000,
        max_reconnect_delay_ms: 2_000,
        ..TransportConfig::default()
    });
    manager.connect();

    let mut delays = Vec::new();
    for _ in 0..3 {
        if let CloseAction::Reconnect { delay, .. } = manager.on_close(ABNORMAL_CLOSURE, "lost") {
            delays.push(delay);
        }
        manager.begin_reconnect();
    }
    assert_eq!(delays.len(), 3);
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    assert!(delays
        .iter()
        .all(|d| *d <= std::time::Duration::from_millis(2_000)));

    manager.on_close(ABNORMAL_CLOSURE, "lost");
    manager.begin_reconnect();
    manager.on_close(ABNORMAL_CLOSURE, "lost");
    manager.begin_reconnect();
    assert_eq!(manager.on_close(ABNORMAL_CLOSURE, "lost"), CloseAction::GiveUp);
}

#[test]
fn test_presence_cap_evicts_least_recently_active() {
    let mut tracker = PresenceTracker::new(PresenceConfig {
        max_presences_per_document: 3,
        ..PresenceConfig::default()
    });
    let start = Utc::now();

    for i in 0..4 {
        tracker.update_presence_at(
            &format!("user-{}", i),
            "laptop",
            "someone",
            PresenceUpdate::default(),
            start + Duration::seconds(i),
        );
    }

    assert_eq!(tracker.len(), 3);
    assert!(tracker.get("user-0", "laptop").is_none());
    assert!(tracker.get("user-3", "laptop").is_some());
}

#[tokio::test]
async fn test_compaction_keeps_sites_in_step() {
    let mut a = engine("A", "");
    let mut b = engine("B", "");

    for i in 0..20 {
        let op = a.insert_text(i, "x").unwrap();
        b.apply_remote_operation(op).unwrap();
    }
    a.compact(5).unwrap();
    assert_eq!(a.document().operations().len(), 5);

    let op = b.delete_text(0, 10).unwrap();
    a.apply_remote_operation(op).unwrap();
    assert_eq!(a.content(), b.content());
    assert_eq!(a.content().len(), 10);
}
