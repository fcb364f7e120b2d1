//! Scheduler tests
//!
//! A fake launcher stands in for worker processes so that scheduling can be
//! driven tick by tick.

use super::*;
use crate::error::{Result, SiftError};
use crate::health::{components, ComponentStatus, HealthRegistry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Default)]
struct FakeWorkers {
    launched: Vec<String>,
    launch_ids: Vec<u64>,
    exits: HashMap<String, bool>,
    terminated: Vec<String>,
    fail_launch: bool,
}

type Shared = Arc<Mutex<FakeWorkers>>;

struct FakeLauncher {
    workers: Shared,
}

impl WorkerLauncher for FakeLauncher {
    fn launch(&mut self, job: &QueueEntry, launch_id: u64) -> Result<Box<dyn WorkerHandle>> {
        let mut workers = self.workers.lock().unwrap();
        if workers.fail_launch {
            return Err(SiftError::Scheduling("no such program".to_string()));
        }
        workers.launched.push(job.project_id.clone());
        workers.launch_ids.push(launch_id);
        Ok(Box::new(FakeHandle {
            project_id: job.project_id.clone(),
            workers: self.workers.clone(),
        }))
    }
}

struct FakeHandle {
    project_id: String,
    workers: Shared,
}

#[async_trait]
impl WorkerHandle for FakeHandle {
    fn try_wait(&mut self) -> Result<Option<bool>> {
        Ok(self.workers.lock().unwrap().exits.get(&self.project_id).copied())
    }

    async fn terminate(&mut self, _grace: Duration) -> Result<()> {
        self.workers
            .lock()
            .unwrap()
            .terminated
            .push(self.project_id.clone());
        Ok(())
    }
}

fn manager(max_workers: usize) -> (TaskManager, Shared) {
    let workers = Shared::default();
    let config = TaskManagerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        max_workers,
        poll_interval: Duration::from_millis(20),
        shutdown_grace: Duration::from_millis(10),
    };
    let launcher = FakeLauncher {
        workers: workers.clone(),
    };
    let manager =
        TaskManager::new(config, WaitingQueue::in_memory().unwrap(), Box::new(launcher)).unwrap();
    (manager, workers)
}

fn waiting_ids(manager: &TaskManager) -> Vec<String> {
    manager
        .queue()
        .list()
        .unwrap()
        .into_iter()
        .map(|e| e.project_id)
        .collect()
}

mod scheduling_tests {
    use super::*;

    #[tokio::test]
    async fn test_single_slot_promotes_in_order() {
        let (mut manager, workers) = manager(1);
        manager.submit(Message::insert("alpha", false));
        manager.submit(Message::insert("beta", false));
        manager.tick().await.unwrap();

        assert_eq!(manager.pending_ids(), vec!["alpha"]);
        assert_eq!(waiting_ids(&manager), vec!["beta"]);

        manager.submit(Message::remove("alpha"));
        manager.tick().await.unwrap();

        assert_eq!(manager.pending_ids(), vec!["beta"]);
        assert!(manager.queue().is_empty().unwrap());
        assert_eq!(workers.lock().unwrap().launched, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_duplicate_insert_keeps_one_row() {
        let (mut manager, workers) = manager(1);
        manager.submit(Message::insert("busy", false));
        manager.tick().await.unwrap();

        manager.submit(Message::insert("same", false));
        manager.submit(Message::insert("same", true));
        manager.tick().await.unwrap();

        let entries = manager.queue().list().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].simulation);
        assert_eq!(workers.lock().unwrap().launched, vec!["busy"]);
    }

    #[tokio::test]
    async fn test_status_reports_slots() {
        let (mut manager, _) = manager(3);
        manager.submit(Message::insert("b", false));
        manager.submit(Message::insert("a", true));
        manager.tick().await.unwrap();

        let status = manager.status();
        assert_eq!(status.max_workers, 3);
        assert_eq!(status.currently_running, 2);
        assert_eq!(status.available_slots, 1);
        assert_eq!(status.running_project_ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_insert_outside_projects_root_is_dropped() {
        let (mut manager, workers) = manager(2);
        manager.submit(Message::insert("/etc", false));
        manager.submit(Message::insert("../../home/victim", true));
        manager.submit(Message::insert("ok", false));
        manager.tick().await.unwrap();

        assert_eq!(manager.pending_ids(), vec!["ok"]);
        assert!(manager.queue().is_empty().unwrap());
        assert_eq!(workers.lock().unwrap().launched, vec!["ok"]);
    }

    #[tokio::test]
    async fn test_launch_ids_increase() {
        let (mut manager, workers) = manager(2);
        manager.submit(Message::insert("a", false));
        manager.submit(Message::insert("b", false));
        manager.tick().await.unwrap();
        assert_eq!(workers.lock().unwrap().launch_ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let launcher = FakeLauncher {
            workers: Shared::default(),
        };
        let config = TaskManagerConfig {
            max_workers: 0,
            ..TaskManagerConfig::default()
        };
        assert!(matches!(
            TaskManager::new(config, WaitingQueue::in_memory().unwrap(), Box::new(launcher)),
            Err(SiftError::Config(_))
        ));
    }
}

mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_remove_is_not_fatal() {
        let (mut manager, _) = manager(1);
        manager.submit(Message::remove("ghost"));
        manager.submit(Message::failure("ghost"));
        manager.submit(Message::insert("real", false));
        manager.tick().await.unwrap();
        assert_eq!(manager.pending_ids(), vec!["real"]);
    }

    #[tokio::test]
    async fn test_failure_frees_slot_without_retry() {
        let (mut manager, workers) = manager(1);
        manager.submit(Message::insert("flaky", false));
        manager.tick().await.unwrap();
        manager.submit(Message::failure("flaky"));
        manager.tick().await.unwrap();

        assert!(manager.pending_ids().is_empty());
        assert!(manager.queue().is_empty().unwrap());
        assert_eq!(workers.lock().unwrap().launched, vec!["flaky"]);
    }

    #[tokio::test]
    async fn test_crashed_worker_is_reaped() {
        let (mut manager, workers) = manager(1);
        manager.submit(Message::insert("crash", false));
        manager.submit(Message::insert("next", false));
        manager.tick().await.unwrap();

        workers
            .lock()
            .unwrap()
            .exits
            .insert("crash".to_string(), false);
        manager.tick().await.unwrap();
        assert_eq!(manager.pending_ids(), vec!["next"]);
    }

    #[tokio::test]
    async fn test_late_report_from_reaped_worker_is_ignored() {
        let (mut manager, workers) = manager(1);
        manager.submit(Message::insert("job", false));
        manager.tick().await.unwrap();

        workers.lock().unwrap().exits.insert("job".to_string(), false);
        manager.tick().await.unwrap();
        assert!(manager.pending_ids().is_empty());

        workers.lock().unwrap().exits.clear();
        manager.submit(Message::insert("job", false));
        manager.tick().await.unwrap();
        assert_eq!(workers.lock().unwrap().launch_ids, vec![1, 2]);

        manager.submit(Message::failure("job").for_launch(Some(1)));
        manager.tick().await.unwrap();
        assert_eq!(manager.pending_ids(), vec!["job"]);

        manager.submit(Message::remove("job").for_launch(Some(2)));
        manager.tick().await.unwrap();
        assert!(manager.pending_ids().is_empty());
    }

    #[tokio::test]
    async fn test_clean_exit_waits_for_remove() {
        let (mut manager, workers) = manager(1);
        manager.submit(Message::insert("done", false));
        manager.tick().await.unwrap();

        workers.lock().unwrap().exits.insert("done".to_string(), true);
        manager.tick().await.unwrap();
        assert_eq!(manager.pending_ids(), vec!["done"]);

        manager.submit(Message::remove("done"));
        manager.tick().await.unwrap();
        assert!(manager.pending_ids().is_empty());
    }

    #[tokio::test]
    async fn test_launch_failure_leaves_job_waiting() {
        let (mut manager, workers) = manager(2);
        workers.lock().unwrap().fail_launch = true;
        manager.submit(Message::insert("stuck", false));
        manager.tick().await.unwrap();

        assert!(manager.pending_ids().is_empty());
        assert_eq!(waiting_ids(&manager), vec!["stuck"]);

        workers.lock().unwrap().fail_launch = false;
        manager.tick().await.unwrap();
        assert_eq!(manager.pending_ids(), vec!["stuck"]);
    }

    #[tokio::test]
    async fn test_reset_terminates_and_keeps_queue() {
        let (mut manager, workers) = manager(1);
        manager.submit(Message::insert("running", false));
        manager.submit(Message::insert("queued", false));
        manager.tick().await.unwrap();

        manager.reset_pending().await;
        assert!(manager.pending_ids().is_empty());
        assert_eq!(workers.lock().unwrap().terminated, vec!["running"]);
        assert_eq!(waiting_ids(&manager), vec!["queued"]);
    }
}

mod health_tests {
    use super::*;

    #[tokio::test]
    async fn test_saturated_pool_degrades_workers() {
        let (manager, _) = manager(1);
        let health = HealthRegistry::new();
        let mut manager = manager.with_health(health.clone());
        manager.submit(Message::insert("a", false));
        manager.submit(Message::insert("b", false));
        manager.tick().await.unwrap();

        let response = health.health().await;
        assert_eq!(
            response.components[components::WORKERS].status,
            ComponentStatus::Degraded
        );
        assert_eq!(
            response.components[components::QUEUE].status,
            ComponentStatus::Healthy
        );
    }
}

mod socket_tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_client_round_trip() {
        let (mut manager, workers) = manager(1);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let server = tokio::spawn(async move {
            manager.serve(listener, shutdown_rx).await.unwrap();
            manager
        });

        let client = TaskClient::new(addr).with_timeout(Duration::from_secs(5));
        client.insert("p1", false).await.unwrap();
        client.insert("p2", true).await.unwrap();

        let mut status = client.status().await.unwrap();
        for _ in 0..50 {
            if status.currently_running == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = client.status().await.unwrap();
        }
        assert_eq!(status.currently_running, 1);
        assert_eq!(status.available_slots, 0);
        assert_eq!(status.running_project_ids, vec!["p1"]);

        client.remove("p1", Some(1)).await.unwrap();
        for _ in 0..50 {
            status = client.status().await.unwrap();
            if status.running_project_ids == vec!["p2".to_string()] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status.running_project_ids, vec!["p2"]);

        shutdown_tx.send(()).unwrap();
        let manager = server.await.unwrap();
        assert!(manager.pending_ids().is_empty());
        assert_eq!(workers.lock().unwrap().terminated, vec!["p2"]);
    }

    #[tokio::test]
    async fn test_bind_failure_is_scheduling_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let workers = Shared::default();
        let config = TaskManagerConfig {
            bind_addr: addr,
            ..TaskManagerConfig::default()
        };
        let launcher = FakeLauncher {
            workers: workers.clone(),
        };
        let mut manager =
            TaskManager::new(config, WaitingQueue::in_memory().unwrap(), Box::new(launcher))
                .unwrap();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        assert!(matches!(
            manager.run(shutdown_rx).await,
            Err(SiftError::Scheduling(_))
        ));
        assert!(workers.lock().unwrap().launched.is_empty());
        drop(taken);
    }

    #[tokio::test]
    async fn test_unreachable_manager_is_scheduling_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = TaskClient::new(addr);
        assert!(matches!(
            client.status().await,
            Err(SiftError::Scheduling(_))
        ));
    }
}
