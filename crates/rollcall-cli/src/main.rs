use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::time::Duration;

use rollcall_core::TrackId;
use rollcalld::provider::{DetectionProvider, ScriptedProvider, SyntheticProvider};
use rollcalld::session::{spawn_session, SessionConfig, SessionHandle};

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance session runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSON detection script through a live session
    Replay {
        /// Path to the script (JSON array of frames)
        script: PathBuf,
        /// Bind a track id to a student up front, e.g. --enroll 1=alice
        #[arg(long = "enroll", value_name = "TRACK=STUDENT")]
        enrollments: Vec<String>,
        /// Milliseconds between cycles
        #[arg(long, default_value_t = 250)]
        period_ms: u64,
        /// Milliseconds the session pauses after a scripted rate limit
        #[arg(long, default_value_t = 61_000)]
        rate_limit_pause_ms: u64,
    },
    /// Run a synthetic classroom for a fixed number of cycles
    Synthetic {
        /// Number of simulated people
        #[arg(long, default_value_t = 3)]
        people: usize,
        /// Number of cycles to run before exiting
        #[arg(long, default_value_t = 20)]
        cycles: u64,
        /// Bind a track id to a student up front, e.g. --enroll 1=alice
        #[arg(long = "enroll", value_name = "TRACK=STUDENT")]
        enrollments: Vec<String>,
        /// Milliseconds between cycles
        #[arg(long, default_value_t = 250)]
        period_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Replay {
            script,
            enrollments,
            period_ms,
            rate_limit_pause_ms,
        } => {
            let provider = ScriptedProvider::from_path(&script)
                .with_context(|| format!("loading script {}", script.display()))?;
            let frames = provider.remaining() as u64;
            let config = SessionConfig {
                period: Duration::from_millis(period_ms),
                rate_limit_pause: Duration::from_millis(rate_limit_pause_ms),
                ..SessionConfig::default()
            };
            run_session(provider, config, &enrollments, frames).await
        }
        Commands::Synthetic {
            people,
            cycles,
            enrollments,
            period_ms,
        } => {
            let config = SessionConfig {
                period: Duration::from_millis(period_ms),
                ..SessionConfig::default()
            };
            run_session(SyntheticProvider::new(people), config, &enrollments, cycles).await
        }
    }
}

/// Drive a session for `cycles` cycles, printing attendance records as
/// JSON lines, then a final status summary.
async fn run_session<P: DetectionProvider>(
    provider: P,
    config: SessionConfig,
    enrollments: &[String],
    cycles: u64,
) -> Result<()> {
    let period = config.period;
    let (handle, _frame_rx, mut attendance_rx) = spawn_session(provider, config);

    for binding in enrollments {
        let (track_id, student_id) = parse_enrollment(binding)?;
        handle.enroll(track_id, student_id).await?;
    }

    let printer = tokio::spawn(async move {
        while let Some(record) = attendance_rx.recv().await {
            if let Ok(line) = serde_json::to_string(&record) {
                println!("{line}");
            }
        }
    });

    wait_for_cycles(&handle, cycles, period).await?;

    let status = handle.status().await?;
    eprintln!("{}", serde_json::to_string_pretty(&status)?);

    handle.stop().await?;
    drop(handle);
    let _ = printer.await;
    Ok(())
}

/// Poll session status until `cycles` cycles completed. Cycles abandoned
/// to provider errors or rate-limit pauses never complete, so give up
/// after a generous deadline rather than hanging.
async fn wait_for_cycles(handle: &SessionHandle, cycles: u64, period: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + cycle_deadline(cycles, period);
    loop {
        if handle.status().await?.cycles >= cycles {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(cycles, "deadline reached before all cycles completed");
            return Ok(());
        }
        tokio::time::sleep(period.min(Duration::from_millis(100))).await;
    }
}

/// Wall-clock budget for `cycles` cycles plus a grace margin, computed in
/// u64 milliseconds so large cycle counts neither truncate nor overflow.
fn cycle_deadline(cycles: u64, period: Duration) -> Duration {
    let ms = (period.as_millis() as u64)
        .saturating_mul(cycles.saturating_add(4))
        .saturating_add(2_000);
    Duration::from_millis(ms)
}

/// Parse a `TRACK=STUDENT` enrollment binding.
fn parse_enrollment(binding: &str) -> Result<(TrackId, String)> {
    let Some((track, student)) = binding.split_once('=') else {
        bail!("invalid enrollment {binding:?}: expected TRACK=STUDENT");
    };
    let track_id: TrackId = track
        .trim()
        .parse()
        .with_context(|| format!("invalid track id in {binding:?}"))?;
    if student.trim().is_empty() {
        bail!("invalid enrollment {binding:?}: empty student id");
    }
    Ok((track_id, student.trim().to_string()))
}
