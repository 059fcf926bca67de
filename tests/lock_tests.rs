//! Integration tests for per-name locking.
//!
//! Covers re-entrancy, arrival-order serialization, lost-update freedom, and
//! cooperation between independent store instances through the lock file.

use futures_util::future::join_all;
use rdc_config_store::config::{LockConfig, StoreConfig};
use rdc_config_store::{ConfigDocument, ConfigStore, StoreError};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn setup_store() -> (TempDir, ConfigStore) {
    let temp = TempDir::new().expect("Failed to create temp directory");
    let store = ConfigStore::new(temp.path());
    (temp, store)
}

/// Second handle on the same directory that shares nothing in memory.
fn independent_store(dir: &std::path::Path) -> ConfigStore {
    ConfigStore::open(&StoreConfig {
        config_dir: dir.to_path_buf(),
        lock: LockConfig {
            stale_after_secs: None,
            poll_interval_ms: 2,
            max_poll_interval_ms: 10,
        },
    })
}

/// Independent handle that takes over lock files older than one second.
fn expiring_store(dir: &std::path::Path) -> ConfigStore {
    ConfigStore::open(&StoreConfig {
        config_dir: dir.to_path_buf(),
        lock: LockConfig {
            stale_after_secs: Some(1),
            poll_interval_ms: 5,
            max_poll_interval_ms: 20,
        },
    })
}

fn add_machine(i: usize) -> impl FnOnce(&ConfigDocument) -> ConfigDocument {
    move |cfg| {
        let mut machines = cfg.field("machines").cloned().unwrap_or_else(|| json!({}));
        machines[format!("m{i}")] = json!({ "index": i });
        cfg.clone().with_field("machines", machines)
    }
}

fn machine_count(doc: &ConfigDocument) -> usize {
    doc.field("machines")
        .and_then(Value::as_object)
        .map(|m| m.len())
        .unwrap_or(0)
}

mod with_lock_tests {
    use super::*;

    #[tokio::test]
    async fn returns_work_result() {
        let (_temp, store) = setup_store();

        let work = || async { Ok::<_, StoreError>(json!({ "status": "success", "data": 42 })) };
        let result = store.with_lock("cfg", work).await.unwrap();

        assert_eq!(result, json!({ "status": "success", "data": 42 }));
    }

    #[tokio::test]
    async fn lock_file_exists_only_while_held() {
        let (_temp, store) = setup_store();
        let lock_path = store.lock_path("cfg");

        let probe = &lock_path;
        let during = store
            .with_lock("cfg", move || async move { Ok::<_, StoreError>(probe.exists()) })
            .await
            .unwrap();

        assert!(during);
        assert!(!lock_path.exists());
        assert_eq!(store.lock_depth("cfg"), 0);
    }

    #[tokio::test]
    async fn lock_file_names_its_holder() {
        let (_temp, store) = setup_store();
        let lock_path = store.lock_path("cfg");

        let probe = &lock_path;
        let owner: Value = store
            .with_lock("cfg", move || async move {
                let raw = std::fs::read(probe).unwrap();
                Ok::<_, StoreError>(serde_json::from_slice(&raw).unwrap())
            })
            .await
            .unwrap();

        assert_eq!(owner["pid"], json!(std::process::id()));
        assert!(owner["nonce"].is_string());
        assert!(owner["acquired_at"].is_u64());
    }

    #[tokio::test]
    async fn fresh_grant_forces_disk_read() {
        let (_temp, store) = setup_store();
        store.init("cfg").await.unwrap();
        store.load("cfg").await.unwrap();

        let external = ConfigDocument::new().with_field("token", "new-token-from-other-process");
        ConfigStore::new(store.config_dir())
            .save(&external, "cfg")
            .await
            .unwrap();

        let store = &store;
        let loaded = store
            .with_lock("cfg", move || async move { store.load("cfg").await })
            .await
            .unwrap();

        assert_eq!(loaded.field("token"), Some(&json!("new-token-from-other-process")));
    }

    #[tokio::test]
    async fn error_propagates_and_lock_is_released() {
        let (_temp, store) = setup_store();

        let err = store
            .with_lock("cfg", || async {
                Err::<(), _>(StoreError::NotFound {
                    name: "custom".into(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { ref name } if name == "custom"));
        assert!(!store.lock_path("cfg").exists());
        assert_eq!(store.lock_depth("cfg"), 0);

        let recovered = store
            .with_lock("cfg", || async { Ok::<_, StoreError>("recovered") })
            .await
            .unwrap();
        assert_eq!(recovered, "recovered");
    }

    #[derive(Debug)]
    enum AppError {
        Store(#[allow(dead_code)] StoreError),
        Custom(&'static str),
    }

    impl From<StoreError> for AppError {
        fn from(err: StoreError) -> Self {
            AppError::Store(err)
        }
    }

    #[tokio::test]
    async fn caller_error_types_pass_through() {
        let (_temp, store) = setup_store();

        let err = store
            .with_lock("cfg", || async { Err::<(), _>(AppError::Custom("boom")) })
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Custom("boom")));
    }

    #[tokio::test]
    async fn dropped_work_releases_lock() {
        let (_temp, store) = setup_store();
        let lock_path = store.lock_path("cfg");

        let store_ref = &store;
        let pending = store_ref.with_lock("cfg", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, StoreError>(())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(50), pending).await;

        assert!(timed_out.is_err());
        assert!(!lock_path.exists());
        assert_eq!(store.lock_depth("cfg"), 0);
    }

    #[tokio::test]
    async fn different_names_do_not_block_each_other() {
        let (_temp, store) = setup_store();
        let store = &store;

        let inner = store
            .with_lock("a", move || async move {
                store
                    .with_lock("b", move || async move {
                        Ok::<_, StoreError>((store.lock_depth("a"), store.lock_depth("b")))
                    })
                    .await
            })
            .await
            .unwrap();

        assert_eq!(inner, (1, 1));
    }
}

mod reentrancy_tests {
    use super::*;

    #[tokio::test]
    async fn triple_nesting_tracks_depth() {
        let (_temp, store) = setup_store();
        let store = &store;
        let lock_path = store.lock_path("cfg");
        let lock_path = &lock_path;

        let depths = store
            .with_lock("cfg", move || async move {
                let d1 = store.lock_depth("cfg");
                let (d2, d3) = store
                    .with_lock("cfg", move || async move {
                        let d2 = store.lock_depth("cfg");
                        let d3 = store
                            .with_lock("cfg", move || async move {
                                store.load("cfg").await?;
                                Ok::<_, StoreError>(store.lock_depth("cfg"))
                            })
                            .await?;
                        assert_eq!(store.lock_depth("cfg"), 2);
                        assert!(lock_path.exists());
                        Ok::<_, StoreError>((d2, d3))
                    })
                    .await?;
                assert_eq!(store.lock_depth("cfg"), 1);
                assert!(lock_path.exists());
                Ok::<_, StoreError>((d1, d2, d3))
            })
            .await
            .unwrap();

        assert_eq!(depths, (1, 2, 3));
        assert!(!lock_path.exists());
        assert_eq!(store.lock_depth("cfg"), 0);
    }

    #[tokio::test]
    async fn update_inside_with_lock() {
        let (_temp, store) = setup_store();
        let store = &store;

        let updated = store
            .with_lock("cfg", move || async move {
                store
                    .update("cfg", |cfg| cfg.clone().with_field("token", "new-token"))
                    .await
            })
            .await
            .unwrap();

        assert_eq!(updated.field("token"), Some(&json!("new-token")));
        store.clear_cache();
        assert_eq!(
            store.load("cfg").await.unwrap().field("token"),
            Some(&json!("new-token"))
        );
    }

    #[tokio::test]
    async fn sequential_updates_inside_with_lock() {
        let (_temp, store) = setup_store();
        let store = &store;

        let result = store
            .with_lock("cfg", move || async move {
                store.update("cfg", |c| c.clone().with_field("first", 1)).await?;
                store.update("cfg", |c| c.clone().with_field("second", 2)).await?;
                Ok::<_, StoreError>("completed")
            })
            .await
            .unwrap();

        assert_eq!(result, "completed");
        let loaded = store.load("cfg").await.unwrap();
        assert_eq!(loaded.field("first"), Some(&json!(1)));
        assert_eq!(loaded.field("second"), Some(&json!(2)));
        assert_eq!(loaded.version(), 3);
    }

    #[tokio::test]
    async fn nested_error_unwinds_all_levels() {
        let (_temp, store) = setup_store();
        let store = &store;

        let err = store
            .with_lock("cfg", move || async move {
                store
                    .with_lock("cfg", move || async move {
                        Err::<(), _>(StoreError::NotFound {
                            name: "inner".into(),
                        })
                    })
                    .await
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::NotFound { .. }));
        assert_eq!(store.lock_depth("cfg"), 0);
        assert!(!store.lock_path("cfg").exists());
    }

    #[tokio::test]
    async fn get_or_create_default_inside_lock() {
        let (_temp, store) = setup_store();
        let store = &store;

        let doc = store
            .with_lock(rdc_config_store::DEFAULT_CONFIG_NAME, move || async move {
                store.get_or_create_default().await
            })
            .await
            .unwrap();

        assert_eq!(doc.version(), 1);
    }
}

mod concurrency_tests {
    use super::*;

    #[tokio::test]
    async fn concurrent_locked_operations_do_not_interleave() {
        let (_temp, store) = setup_store();
        let counter = AtomicUsize::new(0);
        let results = Mutex::new(Vec::new());
        let (store, counter, results) = (&store, &counter, &results);

        let ops = (0..10).map(|_| {
            store.with_lock("shared", move || async move {
                let mine = counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                results.lock().unwrap().push(mine);
                Ok::<_, StoreError>(mine)
            })
        });
        join_all(ops).await;

        assert_eq!(*results.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn contenders_granted_in_arrival_order() {
        let (_temp, store) = setup_store();
        let order = Mutex::new(Vec::new());
        let (store, order) = (&store, &order);

        let ops = (0..10).map(|i| {
            store.with_lock("shared", move || async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                order.lock().unwrap().push(i);
                Ok::<_, StoreError>(())
            })
        });
        join_all(ops).await;

        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn spawned_locked_operations_do_not_interleave() {
        let (_temp, store) = setup_store();
        let counter = Arc::new(AtomicUsize::new(0));
        let results = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let store = store.clone();
                let counter = Arc::clone(&counter);
                let results = Arc::clone(&results);
                tokio::spawn(async move {
                    store
                        .with_lock("shared", move || async move {
                            let mine = counter.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            results.lock().unwrap().push(mine);
                            Ok::<_, StoreError>(())
                        })
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*results.lock().unwrap(), (0..10).collect::<Vec<_>>());
        assert!(!store.lock_path("shared").exists());
    }

    #[tokio::test]
    async fn concurrent_updates_lose_nothing() {
        let (_temp, store) = setup_store();
        let store = &store;

        let ops = (0..5).map(|i| store.update("shared", add_machine(i)));
        for result in join_all(ops).await {
            result.unwrap();
        }

        store.clear_cache();
        let loaded = store.load("shared").await.unwrap();
        assert_eq!(machine_count(&loaded), 5);
        assert_eq!(loaded.version(), 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn spawned_updates_lose_nothing() {
        let (_temp, store) = setup_store();

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.update("shared", add_machine(i)).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let loaded = ConfigStore::new(store.config_dir()).load("shared").await.unwrap();
        assert_eq!(machine_count(&loaded), 5);
    }

    #[tokio::test]
    async fn interleaved_read_modify_write_under_lock() {
        let (_temp, store) = setup_store();
        let store = &store;

        let ops = (0..5).map(|i| {
            store.with_lock("shared", move || async move {
                let current = store.load("shared").await?;
                let token = current
                    .field("token")
                    .and_then(Value::as_str)
                    .unwrap_or("initial")
                    .to_string();
                tokio::time::sleep(Duration::from_millis(3)).await;
                store
                    .update("shared", move |cfg| {
                        cfg.clone().with_field("token", format!("{token}-{i}"))
                    })
                    .await?;
                Ok::<_, StoreError>(i)
            })
        });
        let mut done: Vec<_> = join_all(ops).await.into_iter().map(Result::unwrap).collect();
        done.sort();
        assert_eq!(done, vec![0, 1, 2, 3, 4]);

        let loaded = store.load("shared").await.unwrap();
        assert_eq!(loaded.field("token"), Some(&json!("initial-0-1-2-3-4")));
    }
}

mod cross_instance_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn independent_instances_serialize_through_lock_file() {
        let temp = TempDir::new().unwrap();
        let stores: Vec<_> = (0..4).map(|_| independent_store(temp.path())).collect();

        let handles: Vec<_> = stores
            .iter()
            .enumerate()
            .flat_map(|(s, store)| {
                (0..3).map(move |j| {
                    let store = store.clone();
                    tokio::spawn(async move {
                        store.update("shared", add_machine(s * 3 + j)).await
                    })
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let loaded = independent_store(temp.path()).load("shared").await.unwrap();
        assert_eq!(machine_count(&loaded), 12);
        assert_eq!(loaded.version(), 13);
        assert!(!temp.path().join("shared.json.lock").exists());
    }

    #[tokio::test]
    async fn waits_for_foreign_lock_file() {
        let temp = TempDir::new().unwrap();
        let store = independent_store(temp.path());
        let lock_path = store.lock_path("cfg");
        std::fs::write(&lock_path, "").unwrap();

        let release = {
            let lock_path = lock_path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                std::fs::remove_file(lock_path).unwrap();
            })
        };

        let started = std::time::Instant::now();
        store
            .with_lock("cfg", || async { Ok::<_, StoreError>(()) })
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(90));
        release.await.unwrap();
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn stale_foreign_lock_file_is_taken_over() {
        let temp = TempDir::new().unwrap();
        let store = expiring_store(temp.path());
        let lock_path = store.lock_path("cfg");
        std::fs::write(&lock_path, "").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&lock_path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(30))
            .unwrap();

        let doc = store.update("cfg", |c| c.clone().with_field("ok", true)).await.unwrap();

        assert_eq!(doc.field("ok"), Some(&json!(true)));
        assert!(!lock_path.exists());
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn live_holder_past_threshold_keeps_the_lock() {
        let temp = TempDir::new().unwrap();
        let first = expiring_store(temp.path());
        let second = expiring_store(temp.path());
        let lock_path = first.lock_path("cfg");

        let inside = Arc::new(AtomicUsize::new(0));
        let most = Arc::new(AtomicUsize::new(0));
        let enter = {
            let (inside, most) = (Arc::clone(&inside), Arc::clone(&most));
            move || {
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                most.fetch_max(now, Ordering::SeqCst);
            }
        };

        let long = {
            let (enter, inside) = (enter.clone(), Arc::clone(&inside));
            tokio::spawn(async move {
                first
                    .with_lock("cfg", move || async move {
                        enter();
                        tokio::time::sleep(Duration::from_millis(1800)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, StoreError>(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let probe = lock_path.clone();
        let held_file = second
            .with_lock("cfg", move || async move {
                enter();
                let present = probe.exists();
                inside.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, StoreError>(present)
            })
            .await
            .unwrap();
        long.await.unwrap().unwrap();

        assert_eq!(most.load(Ordering::SeqCst), 1);
        assert!(held_file);
        assert!(!lock_path.exists());
    }
}
