// ABOUTME: Integration tests composing the admission gateway and lifecycle coordinator.
// ABOUTME: Plays the orchestrator role: admit, run, pause, resume, and finish a deck.

use std::sync::Arc;
use std::time::Duration;

use deckgate::prelude::*;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Harness {
    manager: Arc<ConcurrencyManager>,
    coordinator: Arc<LifecycleCoordinator>,
}

impl Harness {
    fn new(limits: Limits) -> Self {
        Self {
            manager: Arc::new(ConcurrencyManager::new(limits).unwrap()),
            coordinator: Arc::new(LifecycleCoordinator::new(MemoryCheckpointStore::shared())),
        }
    }

    /// Register a cancellable unit with the coordinator and run it.
    async fn spawn_unit(
        &self,
        user_id: &str,
        job_id: &str,
        index: usize,
        work: Duration,
    ) -> JoinHandle<bool> {
        let task_id = unit_task_id(job_id, index);
        let token = CancellationToken::new();
        self.coordinator
            .register_unit_task(job_id, &task_id, Arc::new(token.clone()))
            .await;

        let manager = self.manager.clone();
        let coordinator = self.coordinator.clone();
        let user_id = user_id.to_string();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            if !manager.acquire_for_user(&user_id, &task_id).await.unwrap() {
                coordinator.unregister_unit_task(&job_id, &task_id).await;
                return false;
            }
            coordinator
                .update_unit(&job_id, index, UnitUpdate::in_progress())
                .await;

            let finished = tokio::select! {
                () = token.cancelled() => false,
                () = tokio::time::sleep(work) => {
                    coordinator
                        .update_unit(&job_id, index, UnitUpdate::completed(json!({"slide": index})))
                        .await;
                    true
                }
            };

            coordinator.unregister_unit_task(&job_id, &task_id).await;
            manager.release_for_user(&user_id, &task_id).await;
            finished
        })
    }
}

fn roomy_limits() -> Limits {
    Limits {
        max_global_concurrent_units: 8,
        max_api_concurrent_calls: 8,
        max_units_per_user: 6,
        api_calls_per_minute: 1000,
        api_calls_per_hour: 10_000,
        cleanup_completed_after: Duration::from_secs(60),
    }
}

fn deck(units: usize) -> JobSpec {
    (0..units).fold(JobSpec::new("Roadmap"), |spec, i| spec.unit(format!("Part {}", i)))
}

async fn prepare(harness: &Harness, user_id: &str, job_id: &str, units: usize) {
    assert!(harness.manager.acquire_job_lock(job_id).await);
    assert_eq!(
        harness
            .manager
            .acquire_for_user(user_id, &job_task_id(job_id))
            .await,
        Ok(true)
    );
    harness
        .coordinator
        .register_job(job_id, user_id, deck(units), json!({"theme": "auto"}))
        .await;
    for event in [JobEvent::PrepFinished, JobEvent::MediaFinished] {
        assert!(harness.coordinator.transition(job_id, event).await);
    }
    harness
        .coordinator
        .update_job(
            job_id,
            JobPatch::new()
                .artifact(ArtifactSlot::Theme, json!({"font": "Inter"}))
                .completed_steps(3),
        )
        .await;
    assert!(
        harness
            .coordinator
            .transition(job_id, JobEvent::UnitsStarted)
            .await
    );
}

async fn finish(harness: &Harness, user_id: &str, job_id: &str) {
    assert!(harness.coordinator.transition(job_id, JobEvent::Finalize).await);
    assert!(harness.coordinator.transition(job_id, JobEvent::Complete).await);
    harness
        .manager
        .release_for_user(user_id, &job_task_id(job_id))
        .await;
    harness.manager.release_job_lock(job_id).await;
}

#[tokio::test]
async fn test_deck_runs_to_completion() {
    let harness = Harness::new(roomy_limits());
    prepare(&harness, "u1", "deck-1", 3).await;

    let mut units = Vec::new();
    for index in 0..3 {
        units.push(
            harness
                .spawn_unit("u1", "deck-1", index, Duration::from_millis(5))
                .await,
        );
    }
    for unit in units {
        assert!(unit.await.unwrap());
    }
    finish(&harness, "u1", "deck-1").await;

    let job = harness.coordinator.get_job("deck-1").await.unwrap();
    assert_eq!(job.state, JobPhase::Completed);
    assert!(
        job.unit_states
            .values()
            .all(|unit| unit.status == UnitStatus::Completed)
    );
    assert!(!harness.manager.is_job_running("deck-1").await);

    let stats = harness.manager.get_stats().await;
    assert_eq!(stats.completed_requests, 4);
    assert_eq!(stats.active_tasks, 0);
    assert_eq!(stats.rejected_requests, 0);
}

#[tokio::test]
async fn test_pause_then_resume_redoes_only_unfinished_units() {
    let harness = Harness::new(roomy_limits());
    prepare(&harness, "u1", "deck-1", 4).await;

    let mut first_round = Vec::new();
    for index in 0..4 {
        let work = if index < 2 {
            Duration::from_millis(5)
        } else {
            Duration::from_secs(30)
        };
        first_round.push(harness.spawn_unit("u1", "deck-1", index, work).await);
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.coordinator.pause("deck-1").await);

    let outcomes: Vec<bool> = futures::future::join_all(first_round)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(outcomes, vec![true, true, false, false]);

    assert!(harness.coordinator.can_resume("deck-1").await);
    let context = harness
        .coordinator
        .get_resume_context("deck-1")
        .await
        .unwrap();
    assert_eq!(context.completed_units, vec![0, 1]);
    assert_eq!(context.pending_units, vec![2, 3]);
    assert!(context.artifacts.contains_key(&ArtifactSlot::Theme));

    assert!(harness.coordinator.mark_resumed("deck-1").await);
    let mut second_round = Vec::new();
    for index in context.pending_units {
        second_round.push(
            harness
                .spawn_unit("u1", "deck-1", index, Duration::from_millis(5))
                .await,
        );
    }
    for unit in second_round {
        assert!(unit.await.unwrap());
    }
    finish(&harness, "u1", "deck-1").await;

    let job = harness.coordinator.get_job("deck-1").await.unwrap();
    assert_eq!(job.state, JobPhase::Completed);
    assert_eq!(job.unit_states[&0].data, Some(json!({"slide": 0})));
    assert_eq!(job.unit_states[&3].status, UnitStatus::Completed);
    assert!(job.total_pause_duration > 0.0);

    assert!(harness.coordinator.cleanup("deck-1").await);
    assert_eq!(harness.manager.get_user_active_count("u1").await, 0);
}

#[tokio::test]
async fn test_same_job_cannot_start_twice() {
    let harness = Harness::new(roomy_limits());
    prepare(&harness, "u1", "deck-1", 1).await;

    assert!(!harness.manager.acquire_job_lock("deck-1").await);
    assert_eq!(
        harness.manager.get_user_active_decks("u1").await,
        vec!["deck-1"]
    );
}

#[tokio::test]
async fn test_user_cap_spans_all_their_decks() {
    let harness = Harness::new(Limits {
        max_units_per_user: 2,
        ..roomy_limits()
    });
    prepare(&harness, "u1", "deck-1", 2).await;
    prepare(&harness, "u1", "deck-2", 2).await;

    // Both job-level slots are taken, so no unit can be admitted.
    let unit = harness
        .spawn_unit("u1", "deck-1", 0, Duration::from_millis(1))
        .await;
    assert!(!unit.await.unwrap());

    let stats = harness.manager.get_stats().await;
    assert_eq!(stats.rejected_requests, 1);
    assert_eq!(
        harness.manager.get_user_active_decks("u1").await,
        vec!["deck-1", "deck-2"]
    );
}
