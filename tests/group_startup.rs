//! Group startup against the in-memory runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use cntest::probe::LogMatch;
use cntest::runtime::{ContainerRuntime, EventKind, ImageBehavior, MemoryRuntime};
use cntest::{Container, ContainerGroup, Error, GroupedContainer, ReadinessCheck, harness};
use proptest::prelude::*;

const TICK: Duration = Duration::from_millis(5);

fn container(rt: &Arc<MemoryRuntime>, name: &str, image: &str) -> Container {
    let mut c = Container::new(rt.clone());
    c.with_image(image)
        .set_name(name)
        .with_poll_interval(TICK)
        .with_max_start_time(Duration::from_secs(2));
    c
}

#[test]
fn app_is_created_after_db_is_ready() {
    let rt = Arc::new(MemoryRuntime::new().with_image(
        "postgres",
        ImageBehavior {
            logs: "database system is ready to accept connections\n".into(),
            log_delay: Duration::from_millis(100),
            ..ImageBehavior::default()
        },
    ));

    let mut db = container(&rt, "db", "postgres");
    db.with_readiness(LogMatch::new("ready to accept connections").unwrap());
    let db = GroupedContainer::new(db);
    let mut app = GroupedContainer::new(container(&rt, "app", "app"));
    app.depends_on(&[&db]);

    let mut group = ContainerGroup::new();
    group.add(db).unwrap();
    group.add(app).unwrap();
    group.start().unwrap();
    group.await_all();

    let db_started = rt.first(EventKind::Start, "db").unwrap();
    let app_created = rt.first(EventKind::Create, "app").unwrap();
    assert!(app_created.duration_since(db_started) >= Duration::from_millis(100));

    let ids: Vec<String> = group.nodes().map(|n| n.container().id().unwrap()).collect();
    group.cleanup().unwrap();
    for id in ids {
        assert!(rt.inspect(&id).unwrap_err().is_not_found());
    }
}

#[test]
fn siblings_start_concurrently() {
    let slow = ImageBehavior {
        start_delay: Duration::from_millis(200),
        ..ImageBehavior::default()
    };
    let rt = Arc::new(
        MemoryRuntime::new()
            .with_image("a", slow.clone())
            .with_image("b", slow.clone())
            .with_image("c", slow),
    );
    let mut group = ContainerGroup::new();
    for name in ["a", "b", "c"] {
        group.add(GroupedContainer::new(container(&rt, name, name))).unwrap();
    }

    let started = std::time::Instant::now();
    group.start().unwrap();
    group.await_timeout(Duration::from_secs(5)).unwrap();
    // Sequential startup would need at least 600ms.
    assert!(started.elapsed() < Duration::from_millis(550));
    group.cleanup().unwrap();
}

#[test]
fn every_waiter_is_released() {
    let rt = Arc::new(MemoryRuntime::new().with_image(
        "slow",
        ImageBehavior {
            start_delay: Duration::from_millis(50),
            ..ImageBehavior::default()
        },
    ));
    let mut group = ContainerGroup::new();
    group.add(GroupedContainer::new(container(&rt, "db", "slow"))).unwrap();
    let node = group.get("db").unwrap().clone();

    let waiters: Vec<_> = (0..8)
        .map(|_| {
            let node = node.clone();
            thread::spawn(move || {
                node.await_started();
                node.is_signaled()
            })
        })
        .collect();

    group.start().unwrap();
    for waiter in waiters {
        assert!(waiter.join().unwrap());
    }
    // Late waiters return immediately.
    assert!(node.await_started_timeout(Duration::ZERO));
    group.cleanup().unwrap();
}

#[test]
fn crashed_dependency_is_reported_with_logs() {
    let rt = Arc::new(MemoryRuntime::new().with_image(
        "db",
        ImageBehavior {
            logs: "FATAL: data directory has wrong ownership\n".into(),
            exits_on_start: true,
            ..ImageBehavior::default()
        },
    ));
    let db = GroupedContainer::new(container(&rt, "db", "db"));
    let mut app = GroupedContainer::new(container(&rt, "app", "app"));
    app.depends_on(&[&db]);

    let mut group = ContainerGroup::new();
    group.add(db).unwrap();
    group.add(app).unwrap();

    let err = harness::run_with_group(&group, Duration::from_millis(300), |_| Ok(())).unwrap_err();
    let text = format!("{err:#}");
    assert!(text.contains("already exited"), "{text}");
    assert!(text.contains("wrong ownership"), "{text}");
    assert!(text.contains("pending: app, db"), "{text}");
    assert!(rt.first(EventKind::Create, "app").is_none());
    assert_eq!(rt.live_count(), 0);
}

#[test]
fn environment_is_passed_on_create() {
    let rt = Arc::new(MemoryRuntime::new());
    let mut c = container(&rt, "api", "api");
    c.add_all_env([("DATABASE_HOST", "db"), ("DATABASE_PORT", "5432")])
        .add_env("DATABASE_HOST", "db.internal")
        .with_cmd(["serve", "--port", "8080"]);
    c.start().unwrap();

    let opts = rt.created_options("api").unwrap();
    assert_eq!(opts.env, vec!["DATABASE_HOST=db.internal", "DATABASE_PORT=5432"]);
    assert_eq!(opts.cmd, vec!["serve", "--port", "8080"]);
    c.remove().unwrap();
}

#[test]
fn reusing_a_removed_container_fails() {
    let rt = Arc::new(MemoryRuntime::new());
    let c = container(&rt, "once", "img");
    harness::run_with_container(&c, |_| Ok(())).unwrap();
    assert!(matches!(c.start(), Err(Error::Removed(_))));
}

#[test]
fn slow_create_is_cleaned_up_after_timeout() {
    let rt = Arc::new(MemoryRuntime::new().with_image(
        "db",
        ImageBehavior {
            create_delay: Duration::from_millis(300),
            ..ImageBehavior::default()
        },
    ));
    let db = GroupedContainer::new(container(&rt, "db", "db"));
    let mut app = GroupedContainer::new(container(&rt, "app", "app"));
    app.depends_on(&[&db]);

    let mut group = ContainerGroup::new();
    group.add(db).unwrap();
    group.add(app).unwrap();

    let err = harness::run_with_group(&group, Duration::from_millis(50), |_| Ok(())).unwrap_err();
    assert!(format!("{err:#}").contains("pending: app, db"), "{err:#}");

    thread::sleep(Duration::from_millis(600));
    assert_eq!(rt.live_count(), 0);
    assert!(rt.first(EventKind::Start, "db").is_none());
    assert!(rt.first(EventKind::Create, "app").is_none());
}

/// Log readiness that remembers when it first held for each container.
fn logged_ready(ready_at: &Arc<Mutex<HashMap<String, Instant>>>) -> impl ReadinessCheck + 'static {
    let log = LogMatch::new("ready").unwrap();
    let ready_at = Arc::clone(ready_at);
    move |c: &Container| -> cntest::Result<bool> {
        let ready = log.is_ready(c)?;
        if ready {
            ready_at
                .lock()
                .unwrap()
                .entry(c.name().to_string())
                .or_insert_with(Instant::now);
        }
        Ok(ready)
    }
}

/// Node `i` may depend on any node with a lower index, so every generated
/// graph is acyclic.
fn dag() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (2usize..6).prop_flat_map(|n| {
        (0..n)
            .map(|i| proptest::collection::vec(any::<bool>(), i))
            .collect::<Vec<_>>()
            .prop_map(|masks| {
                masks
                    .into_iter()
                    .map(|mask| {
                        mask.into_iter()
                            .enumerate()
                            .filter_map(|(j, on)| on.then_some(j))
                            .collect::<Vec<usize>>()
                    })
                    .collect::<Vec<_>>()
            })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn dependents_are_created_after_dependencies_are_ready(deps in dag()) {
        let rt = Arc::new(MemoryRuntime::new().with_image(
            "img",
            ImageBehavior {
                logs: "ready\n".into(),
                log_delay: Duration::from_millis(20),
                ..ImageBehavior::default()
            },
        ));
        let ready_at = Arc::new(Mutex::new(HashMap::new()));
        let mut nodes: Vec<GroupedContainer> = Vec::new();
        for (i, dep_idx) in deps.iter().enumerate() {
            let mut c = container(&rt, &format!("n{i}"), "img");
            c.with_readiness(logged_ready(&ready_at));
            let mut node = GroupedContainer::new(c);
            {
                let parents: Vec<&GroupedContainer> = dep_idx.iter().map(|&j| &nodes[j]).collect();
                node.depends_on(&parents);
            }
            nodes.push(node);
        }

        let mut group = ContainerGroup::new();
        for node in nodes {
            group.add(node).unwrap();
        }
        group.start().unwrap();
        group.await_timeout(Duration::from_secs(10)).unwrap();

        let ready_at = ready_at.lock().unwrap().clone();
        prop_assert_eq!(ready_at.len(), deps.len());
        for (i, dep_idx) in deps.iter().enumerate() {
            let created = rt.first(EventKind::Create, &format!("n{i}")).unwrap();
            for j in dep_idx {
                let dep_ready = ready_at[&format!("n{j}")];
                prop_assert!(created >= dep_ready, "n{} created before n{} was ready", i, j);
            }
        }
        group.cleanup().unwrap();
        prop_assert_eq!(rt.live_count(), 0);
    }
}
