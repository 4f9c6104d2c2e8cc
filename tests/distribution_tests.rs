//! Distributed cooking: director/worker assignment, retraction
//! priorities, fences, and an end-to-end multi-worker build.

use std::fs;
use std::path::{Path, PathBuf};

use serial_test::serial;
use tempfile::TempDir;

use kiln::collab::{
    Collaborators, FsArtifactWriter, FsContentHasher, FsDependencyProvider, FsItemLoader,
    ObjectClassSplitter, SplitterRegistry, StaggeredReadiness,
};
use kiln::config::{ColocationPolicy, KilnConfig};
use kiln::distrib::{
    assign_requests, channel_fabric, select_retractions, spawn_local_workers, AssignCandidate,
    Assignment,
};
use kiln::item::generation::{GenerationOrder, GenerationPool};
use kiln::item::instigator::Instigator;
use kiln::item::record::{ItemId, ItemState, LoadStage, RequestPhase, SaveStage, WorkerPin};
use kiln::item::store::ItemStore;
use kiln::request::BuildRequest;
use kiln::session::{CookSession, SessionMode};

fn project(temp: &TempDir) -> (KilnConfig, PathBuf) {
    let mut config = KilnConfig::default();
    config.scheduler.max_sleep_ms = 5;
    config.scheduler.busy_retry_ms = 2;
    config.distribution.heartbeat_secs = 1;
    let root = temp.path().to_path_buf();
    fs::create_dir_all(root.join("content")).unwrap();
    (config, root)
}

fn write_item(root: &Path, name: &str, body: &str) {
    let path = root.join("content").join(format!("{}.item", name));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, body).unwrap();
}

#[test]
#[serial]
fn test_distributed_cook_end_to_end() {
    let temp = TempDir::new().unwrap();
    let (mut config, root) = project(&temp);
    config.distribution.workers = 2;
    for index in 0..6 {
        write_item(&root, &format!("item{}", index), "object o mesh\n");
    }

    let collab = Collaborators::filesystem(&root.join(&config.project.src));
    let mut session =
        CookSession::new(config.clone(), root.clone(), collab, SessionMode::Batch).unwrap();
    let (fabric, links) = channel_fabric(config.distribution.workers);
    session.attach_director(Box::new(fabric));
    let workers = spawn_local_workers(&config, &root, links);

    for index in 0..6 {
        session.submit(BuildRequest::new(
            ItemId::new(format!("item{}", index)),
            Instigator::command_line(),
        ));
    }
    session.run_to_completion(&|| false);
    session.store().verify_membership().unwrap();
    let report = session.finish().unwrap();
    for handle in workers {
        handle.join().unwrap();
    }

    assert!(report.is_success());
    assert_eq!(report.profiles["default"].succeeded, 6);
    for index in 0..6 {
        assert!(
            root.join(format!("cooked/default/item{}.art", index)).exists(),
            "artifact for item{} missing",
            index
        );
    }
}

#[test]
#[serial]
fn test_distributed_cook_with_failures_reports_them() {
    let temp = TempDir::new().unwrap();
    let (mut config, root) = project(&temp);
    config.distribution.workers = 2;
    write_item(&root, "good", "object g mesh\n");

    let collab = Collaborators::filesystem(&root.join(&config.project.src));
    let mut session =
        CookSession::new(config.clone(), root.clone(), collab, SessionMode::Batch).unwrap();
    let (fabric, links) = channel_fabric(config.distribution.workers);
    session.attach_director(Box::new(fabric));
    let workers = spawn_local_workers(&config, &root, links);

    session.submit(BuildRequest::new(ItemId::new("good"), Instigator::command_line()));
    session.submit(BuildRequest::new(ItemId::new("ghost"), Instigator::command_line()));
    session.run_to_completion(&|| false);
    let report = session.finish().unwrap();
    for handle in workers {
        handle.join().unwrap();
    }

    assert!(!report.is_success());
    assert_eq!(report.profiles["default"].succeeded, 1);
    assert_eq!(report.profiles["default"].failed, 1);
}

#[test]
#[serial]
fn test_local_only_pin_stays_on_the_director() {
    let temp = TempDir::new().unwrap();
    let (mut config, root) = project(&temp);
    config.distribution.workers = 1;
    write_item(&root, "local", "object l mesh\n");

    let collab = Collaborators::filesystem(&root.join(&config.project.src));
    let mut session =
        CookSession::new(config.clone(), root.clone(), collab, SessionMode::Batch).unwrap();
    let (fabric, links) = channel_fabric(1);
    session.attach_director(Box::new(fabric));
    let workers = spawn_local_workers(&config, &root, links);

    session.submit(
        BuildRequest::new(ItemId::new("local"), Instigator::command_line())
            .with_pin(WorkerPin::LocalOnly),
    );
    session.run_to_completion(&|| false);
    let report = session.finish().unwrap();
    for handle in workers {
        handle.join().unwrap();
    }

    // cooked locally despite workers being available
    assert_eq!(report.profiles["default"].succeeded, 1);
    assert!(root.join("cooked/default/local.art").exists());
}

#[test]
#[serial]
fn test_impossible_pin_demotes_with_assignment_error() {
    let temp = TempDir::new().unwrap();
    let (mut config, root) = project(&temp);
    config.distribution.workers = 1;
    write_item(&root, "a", "object a mesh\n");

    let collab = Collaborators::filesystem(&root.join(&config.project.src));
    let mut session =
        CookSession::new(config.clone(), root.clone(), collab, SessionMode::Batch).unwrap();
    let (fabric, links) = channel_fabric(1);
    session.attach_director(Box::new(fabric));
    let workers = spawn_local_workers(&config, &root, links);

    // pinned to a worker that does not exist
    session.submit(
        BuildRequest::new(ItemId::new("a"), Instigator::command_line())
            .with_pin(WorkerPin::Worker(7)),
    );
    session.run_to_completion(&|| false);
    let report = session.finish().unwrap();
    for handle in workers {
        handle.join().unwrap();
    }

    assert!(!report.is_success());
    assert_eq!(report.profiles["default"].failed, 1);
}

// ---- assignment constraints ----

fn candidate(name: &str, pin: WorkerPin, family: Option<&str>, is_generator: bool) -> AssignCandidate {
    AssignCandidate {
        id: ItemId::new(name),
        pin,
        family: family.map(ItemId::new),
        is_generator,
    }
}

#[test]
fn test_assignment_honors_pins_and_balance() {
    let candidates = vec![
        candidate("pinned", WorkerPin::Worker(1), None, false),
        candidate("local", WorkerPin::LocalOnly, None, false),
        candidate("free", WorkerPin::None, None, false),
    ];
    let mut load = vec![3, 0];
    let out = assign_requests(
        &candidates,
        &Default::default(),
        ColocationPolicy::AnyWorker,
        &mut load,
    );
    assert_eq!(out[0], Assignment::Worker(1));
    assert_eq!(out[1], Assignment::Local);
    // the free item lands on the lighter worker
    assert_eq!(out[2], Assignment::Worker(1));
}

#[test]
fn test_same_worker_policy_constrains_family() {
    let candidates = vec![
        candidate("world", WorkerPin::None, Some("world"), true),
        candidate("world/_generated_/t0", WorkerPin::None, Some("world"), false),
        candidate("world/_generated_/t1", WorkerPin::None, Some("world"), false),
        candidate("unrelated", WorkerPin::None, None, false),
    ];
    let mut load = vec![0, 0, 0];
    let out = assign_requests(
        &candidates,
        &Default::default(),
        ColocationPolicy::SameWorker,
        &mut load,
    );
    let anchor = match out[0] {
        Assignment::Worker(worker) => worker,
        other => panic!("generator not placed: {:?}", other),
    };
    assert_eq!(out[1], Assignment::Worker(anchor));
    assert_eq!(out[2], Assignment::Worker(anchor));
}

#[test]
fn test_none_same_worker_policy_excludes_anchor() {
    let candidates = vec![
        candidate("world", WorkerPin::None, Some("world"), true),
        candidate("world/_generated_/t0", WorkerPin::None, Some("world"), false),
    ];
    let mut load = vec![0, 0];
    let out = assign_requests(
        &candidates,
        &Default::default(),
        ColocationPolicy::NoneSameWorker,
        &mut load,
    );
    let anchor = match out[0] {
        Assignment::Worker(worker) => worker,
        other => panic!("generator not placed: {:?}", other),
    };
    match out[1] {
        Assignment::Worker(worker) => assert_ne!(worker, anchor),
        other => panic!("generated not placed: {:?}", other),
    }
}

// ---- retraction priorities (worker-side) ----

#[test]
fn test_retraction_prefers_least_progressed_non_pinned_items() {
    let mut store = ItemStore::new(1);
    let gen_pool = GenerationPool::new();

    let add = |store: &mut ItemStore, name: &str, state: ItemState| -> ItemId {
        let id = ItemId::new(name);
        store.ensure(&id, Instigator::director());
        store.move_to(&id, state);
        id
    };

    // memory-pressure scenario: three retractions requested
    let deep_save = add(&mut store, "deep-save", ItemState::Save);
    store.get_mut(&deep_save).unwrap().save_stage = SaveStage::WaitForAsyncCache;
    let fresh_save = add(&mut store, "fresh-save", ItemState::Save);
    let preloading = add(&mut store, "preloading", ItemState::Load(LoadStage::ActivePreload));
    let inbox = add(&mut store, "inbox", ItemState::Load(LoadStage::Inbox));
    let staged = add(&mut store, "staged", ItemState::Request(RequestPhase::Staged));
    let _ = fresh_save;

    let picked = select_retractions(&store, &gen_pool, 3);
    // request stage first, then load before preload, then preloading
    assert_eq!(picked, vec![staged, inbox, preloading]);
    assert!(!picked.contains(&deep_save));
}

#[test]
fn test_retraction_never_selects_pinned_or_generation_items() {
    let mut store = ItemStore::new(1);
    let mut gen_pool = GenerationPool::new();

    let pinned = ItemId::new("pinned");
    store.ensure(&pinned, Instigator::director());
    store.get_mut(&pinned).unwrap().pin = WorkerPin::Worker(0);
    store.move_to(&pinned, ItemState::Request(RequestPhase::Staged));

    let generator = ItemId::new("world");
    store.ensure(&generator, Instigator::director());
    store.move_to(&generator, ItemState::Request(RequestPhase::Staged));
    gen_pool.helper_for_generator(&generator, GenerationOrder::Independent);

    let free = ItemId::new("free");
    store.ensure(&free, Instigator::director());
    store.move_to(&free, ItemState::Request(RequestPhase::Staged));

    let picked = select_retractions(&store, &gen_pool, 8);
    assert_eq!(picked, vec![free]);
}

#[test]
fn test_worker_session_retract_returns_items_cleanly() {
    let temp = TempDir::new().unwrap();
    let (config, root) = project(&temp);
    for index in 0..4 {
        write_item(&root, &format!("item{}", index), "object o shader\n");
    }

    // readiness that never completes keeps items resident so the
    // retraction request has targets
    let src = root.join(&config.project.src);
    let mut splitters = SplitterRegistry::new();
    splitters.register(Box::new(ObjectClassSplitter::new("generator")));
    let collab = Collaborators {
        loader: Box::new(FsItemLoader::new(src.clone())),
        writer: Box::new(FsArtifactWriter::new()),
        readiness: Box::new(StaggeredReadiness::new(1_000_000)),
        deps: Box::new(FsDependencyProvider::new(src.clone())),
        hasher: Box::new(FsContentHasher::new(src)),
        splitters,
    };
    let mut session =
        CookSession::new(config.clone(), root.clone(), collab, SessionMode::Worker).unwrap();
    for index in 0..4 {
        session.submit(BuildRequest::new(
            ItemId::new(format!("item{}", index)),
            Instigator::director(),
        ));
    }
    for _ in 0..10 {
        session.tick();
        if session.store().queues().save.len() > 0 {
            break;
        }
    }
    let before = session.outstanding_items();
    assert!(before > 0);

    let returned = session.retract(2);
    assert_eq!(returned.len(), 2);
    for id in &returned {
        let record = session.store().get(id).unwrap();
        assert_eq!(record.state(), ItemState::Idle);
        // returned quietly: no failure recorded
        assert!(record.last_demote.is_none());
    }
    session.store().verify_membership().unwrap();
    assert_eq!(session.outstanding_items(), before - 2);

    session.cancel();
    assert!(session.finish().unwrap().canceled);
}
