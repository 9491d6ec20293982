use anyhow::Result;
use tracing_subscriber::EnvFilter;

use rollcalld::config::Config;
use rollcalld::provider::{ScriptedProvider, SyntheticProvider};
use rollcalld::session::{spawn_session, SessionHandle};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env();
    let handle = match &config.script_path {
        Some(path) => {
            let provider = ScriptedProvider::from_path(path)?;
            tracing::info!(script = %path.display(), frames = provider.remaining(), "replaying detection script");
            run(provider, &config)
        }
        None => {
            let people = config.synthetic_people;
            tracing::info!(people, "no script configured; running synthetic classroom");
            run(SyntheticProvider::new(people), &config)
        }
    };

    tracing::info!("rollcalld ready");
    tokio::signal::ctrl_c().await?;

    handle.stop().await?;
    tracing::info!("rollcalld shutting down");
    Ok(())
}

fn run<P: rollcalld::provider::DetectionProvider>(provider: P, config: &Config) -> SessionHandle {
    let (handle, mut frame_rx, mut attendance_rx) = spawn_session(provider, config.session_config());

    // Rendering consumer: log each published cycle snapshot.
    tokio::spawn(async move {
        while frame_rx.changed().await.is_ok() {
            let snapshot = frame_rx.borrow_and_update();
            tracing::debug!(
                cycle = snapshot.cycle,
                faces = snapshot.detections.len(),
                live_tracks = snapshot.live_tracks,
                "frame"
            );
        }
    });

    // Attendance sink: print records as JSON lines.
    tokio::spawn(async move {
        while let Some(record) = attendance_rx.recv().await {
            match serde_json::to_string(&record) {
                Ok(line) => println!("{line}"),
                Err(err) => tracing::warn!(error = %err, "failed to serialize attendance record"),
            }
        }
    });

    handle
}
