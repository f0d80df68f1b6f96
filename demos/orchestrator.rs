// ABOUTME: Example orchestrator driving one deck through admission, pause, and resume.
// ABOUTME: Run with `RUST_LOG=deckgate=debug cargo run --example orchestrator`.

use std::sync::Arc;
use std::time::Duration;

use deckgate::prelude::*;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const UNITS: usize = 6;

/// Stand-in for the external slide generator.
async fn render_unit(index: usize) -> serde_json::Value {
    tokio::time::sleep(Duration::from_millis(50 * (index as u64 + 1))).await;
    json!({ "slide": index, "html": format!("<section>{}</section>", index) })
}

async fn run_unit(
    manager: Arc<ConcurrencyManager>,
    coordinator: Arc<LifecycleCoordinator>,
    user_id: String,
    job_id: String,
    index: usize,
    token: CancellationToken,
) -> Result<(), DeckgateError> {
    let task_id = unit_task_id(&job_id, index);
    if !manager.acquire_for_user(&user_id, &task_id).await? {
        tracing::info!(task_id = %task_id, "unit not admitted, will retry on resume");
        coordinator.unregister_unit_task(&job_id, &task_id).await;
        return Ok(());
    }

    coordinator
        .update_unit(&job_id, index, UnitUpdate::in_progress())
        .await;
    tokio::select! {
        () = token.cancelled() => {}
        data = render_unit(index) => {
            coordinator
                .update_unit(&job_id, index, UnitUpdate::completed(data))
                .await;
        }
    }

    coordinator.unregister_unit_task(&job_id, &task_id).await;
    manager.release_for_user(&user_id, &task_id).await;
    Ok(())
}

async fn run_units(
    manager: &Arc<ConcurrencyManager>,
    coordinator: &Arc<LifecycleCoordinator>,
    user_id: &str,
    job_id: &str,
    indices: &[usize],
) -> Result<(), DeckgateError> {
    let mut handles = Vec::new();
    for &index in indices {
        let token = CancellationToken::new();
        coordinator
            .register_unit_task(job_id, &unit_task_id(job_id, index), Arc::new(token.clone()))
            .await;
        handles.push(tokio::spawn(run_unit(
            manager.clone(),
            coordinator.clone(),
            user_id.to_string(),
            job_id.to_string(),
            index,
            token,
        )));
    }

    for handle in futures::future::join_all(handles).await {
        match handle {
            Ok(result) => result?,
            Err(e) => tracing::warn!(error = %e, "unit task panicked"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), DeckgateError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("deckgate=info")),
        )
        .init();

    let limits = Limits::from_env()?;
    let manager = Arc::new(ConcurrencyManager::new(limits)?);
    let store = Arc::new(FileCheckpointStore::new(
        std::env::temp_dir().join("deckgate-checkpoints"),
    ));
    let coordinator = Arc::new(LifecycleCoordinator::new(store));

    let user_id = "demo-user";
    let job_id = uuid::Uuid::new_v4().to_string();

    if !manager.acquire_job_lock(&job_id).await
        || !manager.acquire_for_user(user_id, &job_task_id(&job_id)).await?
    {
        tracing::warn!("job not admitted");
        return Ok(());
    }

    let spec = (0..UNITS).fold(JobSpec::new("Demo deck"), |spec, i| {
        spec.unit(format!("Slide {}", i + 1))
    });
    coordinator
        .register_job(&job_id, user_id, spec, json!({ "style": "minimal" }))
        .await;
    coordinator.transition(&job_id, JobEvent::PrepFinished).await;
    coordinator
        .update_job(
            &job_id,
            JobPatch::new().artifact(ArtifactSlot::Theme, json!({ "palette": "slate" })),
        )
        .await;
    coordinator.transition(&job_id, JobEvent::MediaFinished).await;
    coordinator.transition(&job_id, JobEvent::UnitsStarted).await;

    // Pause part-way through the first round.
    let all: Vec<usize> = (0..UNITS).collect();
    let pauser = {
        let coordinator = coordinator.clone();
        let job_id = job_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            coordinator.pause(&job_id).await
        })
    };
    run_units(&manager, &coordinator, user_id, &job_id, &all).await?;
    let paused = pauser.await.unwrap_or(false);
    tracing::info!(paused, "first round finished");

    if coordinator.can_resume(&job_id).await {
        if let Some(context) = coordinator.get_resume_context(&job_id).await {
            tracing::info!(
                completed = ?context.completed_units,
                pending = ?context.pending_units,
                "resuming"
            );
            coordinator.mark_resumed(&job_id).await;
            run_units(&manager, &coordinator, user_id, &job_id, &context.pending_units).await?;
        }
    }

    coordinator.transition(&job_id, JobEvent::Finalize).await;
    coordinator.transition(&job_id, JobEvent::Complete).await;
    if let Some(job) = coordinator.get_job(&job_id).await {
        tracing::info!(
            state = %job.state,
            paused_secs = job.total_pause_duration,
            "deck finished"
        );
    }

    coordinator.cleanup(&job_id).await;
    manager.release_for_user(user_id, &job_task_id(&job_id)).await;
    manager.release_job_lock(&job_id).await;

    let stats = manager.get_stats().await;
    tracing::info!(
        total = stats.total_requests,
        rejected = stats.rejected_requests,
        completed = stats.completed_requests,
        "admission stats"
    );
    Ok(())
}
