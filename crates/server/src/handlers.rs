//! Request dispatch. Store and telemetry calls block, so they run on
//! tokio's blocking pool.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use grab_core::protocol::{
    CancelParams, CancelReply, ListParams, ListReply, LogsParams, LogsReply, Request, Response,
    StatusConfig, StatusReply, SubmitParams, SubmitReply,
};
use grab_core::NewTask;
use grab_scheduler::read_log;
use tracing::{debug, info, warn};

use crate::state::DaemonState;

/// Answer one request. Failures become an error response, never a panic.
pub async fn handle(state: Arc<DaemonState>, request: Request) -> Response {
    let action = request.action();
    debug!(action, "handling request");
    let result = match request {
        Request::Submit(params) => submit(state, params).await,
        Request::Status(_) => status(state).await,
        Request::List(params) => list(state, params).await,
        Request::Cancel(params) => cancel(state, params).await,
        Request::Logs(params) => logs(state, params).await,
    };
    result.unwrap_or_else(|e| {
        debug!(action, error = %e, "request failed");
        Response::error(format!("{e:#}"))
    })
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("request worker panicked")?
}

async fn submit(state: Arc<DaemonState>, params: SubmitParams) -> Result<Response> {
    let requirements = state.config.requirement_with_defaults(
        params.gpu_ids.unwrap_or_default(),
        params.min_free_memory_gb,
        params.max_util_percent,
        params.gpu_count,
    );
    let spec = NewTask {
        name: params.name.unwrap_or_default(),
        command: params.command,
        working_dir: params.working_dir,
        env: params.env,
        requirements,
        priority: params.priority,
    };
    spec.validate()?;

    let store = Arc::clone(&state.store);
    let task_id = blocking(move || Ok(store.add(spec)?)).await?;
    info!(task_id = %task_id, "task submitted");
    Ok(Response::ok(&SubmitReply { task_id })?)
}

async fn status(state: Arc<DaemonState>) -> Result<Response> {
    let monitor = Arc::clone(&state.monitor);
    let gpus = blocking(move || Ok(monitor.sample()))
        .await?
        .unwrap_or_else(|e| {
            warn!(error = %e, "gpu sample failed for status request");
            Vec::new()
        });

    let store = Arc::clone(&state.store);
    let tasks = blocking(move || Ok(store.counts()?)).await?;
    let metrics = state.metrics_snapshot();

    Ok(Response::ok(&StatusReply {
        gpus,
        tasks,
        running: state.scheduler_running(),
        uptime_seconds: metrics.uptime_seconds(Utc::now()),
        config: StatusConfig {
            check_interval: state.config.check_interval,
            max_concurrent_tasks: state.config.max_concurrent_tasks,
        },
        metrics,
    })?)
}

async fn list(state: Arc<DaemonState>, params: ListParams) -> Result<Response> {
    let store = Arc::clone(&state.store);
    let tasks = blocking(move || Ok(store.list(params.status)?)).await?;
    Ok(Response::ok(&ListReply { tasks })?)
}

async fn cancel(state: Arc<DaemonState>, params: CancelParams) -> Result<Response> {
    let store = Arc::clone(&state.store);
    let (task_id, outcome) = blocking(move || {
        let task = store.resolve(&params.task_id)?;
        let outcome = store.cancel(&task.id)?;
        Ok((task.id, outcome))
    })
    .await?;

    Ok(Response::ok(&CancelReply {
        task_id,
        cancelled: outcome.accepted(),
        status: outcome.status(),
    })?)
}

async fn logs(state: Arc<DaemonState>, params: LogsParams) -> Result<Response> {
    let store = Arc::clone(&state.store);
    let logs = blocking(move || {
        let task = store.resolve(&params.task_id)?;
        let Some(path) = task.log_file else {
            return Ok("No log file available".to_string());
        };
        if !path.exists() {
            return Ok(format!("Log file not found: {}", path.display()));
        }
        read_log(&path, params.tail).with_context(|| format!("reading {}", path.display()))
    })
    .await?;
    Ok(Response::ok(&LogsReply { logs })?)
}
