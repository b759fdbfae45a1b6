use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ai_dispatch::command::{CommandSpec, HelperScripts};
use ai_dispatch::config::DispatchConfig;
use ai_dispatch::keepalive::{KeepaliveClient, KeepaliveConfig};
use ai_dispatch::persist::{JsonFileStore, StateHandle};
use ai_dispatch::scheduler::{Scheduler, SchedulerDeps};
use ai_dispatch::task::{TaskLedger, spawn_retention_sweep};
use ai_dispatch::transport::LogTransport;
use ai_dispatch::worker::WorkerRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Keep the non-blocking writer guard alive for the whole process.
    let _log_guard = init_tracing();

    let config = DispatchConfig::from_env();

    let state_path = std::env::var("AI_DISPATCH_STATE_PATH")
        .unwrap_or_else(|_| "./data/ai-dispatch.json".to_string());
    let general_workdir = std::env::var("AI_DISPATCH_GENERAL_WORKDIR")
        .or_else(|_| std::env::var("HOME"))
        .unwrap_or_else(|_| ".".to_string());

    eprintln!("🛰  ai-dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   State: {state_path}");
    eprintln!("   General workdir: {general_workdir}");
    eprintln!(
        "   Limits: {} workers, {} queued jobs",
        config.max_workers, config.max_queued_jobs
    );

    let state = Arc::new(
        StateHandle::load(Box::new(JsonFileStore::new(&state_path)))
            .await
            .map_err(|e| anyhow::anyhow!("failed to load state from {state_path}: {e}"))?,
    );

    let registry = Arc::new(WorkerRegistry::new(state.clone(), config.max_workers));
    let general = registry
        .ensure_general(&PathBuf::from(&general_workdir), "General")
        .await?;
    eprintln!("   General worker: {}", general.display_name);

    let ledger = Arc::new(TaskLedger::new(state.clone(), config.retention.clone()));
    let _sweep = spawn_retention_sweep(ledger.clone(), Duration::from_secs(3600));

    let commands = Arc::new(HelperScripts::from_env());
    let tts = keepalive_from_env("tts", "AI_DISPATCH_TTS_KEEPALIVE", &commands);
    let stt = keepalive_from_env("stt", "AI_DISPATCH_STT_KEEPALIVE", &commands);
    eprintln!(
        "   Keepalive: tts={}, stt={}",
        if tts.is_some() { "on" } else { "off" },
        if stt.is_some() { "on" } else { "off" },
    );

    let (scheduler, mut exit_rx) = Scheduler::new(
        config,
        SchedulerDeps {
            registry,
            ledger,
            commands,
            transport: Arc::new(LogTransport),
            tts,
            stt,
        },
    );

    tracing::info!("ai-dispatch up");

    let restart_requested = tokio::select! {
        _ = tokio::signal::ctrl_c() => false,
        _ = exit_rx.changed() => true,
    };

    if restart_requested {
        let code = exit_rx.borrow().unwrap_or(0);
        scheduler.shutdown().await;
        // The launcher treats this code as "relaunch me".
        std::process::exit(code);
    }

    tracing::info!("interrupt received; shutting down");
    scheduler.shutdown().await;
    Ok(())
}

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if let Ok(dir) = std::env::var("AI_DISPATCH_LOG_DIR") {
        let appender = tracing_appender::rolling::daily(dir, "ai-dispatch.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(writer)
            .with_ansi(false)
            .with_target(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
        None
    }
}

/// Build a keepalive client when its env toggle is set. The backend is the
/// same helper script as the one-shot path, held open with `--keepalive`.
fn keepalive_from_env(
    label: &str,
    toggle: &str,
    scripts: &HelperScripts,
) -> Option<Arc<KeepaliveClient>> {
    let enabled = std::env::var(toggle)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if !enabled {
        return None;
    }

    let script = match label {
        "tts" => &scripts.synthesize_script,
        _ => &scripts.transcribe_script,
    };
    let mut spec = CommandSpec::new(&scripts.python_bin)
        .arg(script.to_string_lossy())
        .arg("--keepalive");
    if label == "tts" {
        if let Some(env_file) = &scripts.env_file {
            spec = spec.args(["--env-file".into(), env_file.to_string_lossy().into_owned()]);
        }
    }
    Some(KeepaliveClient::spawn(KeepaliveConfig::new(label, spec)))
}
