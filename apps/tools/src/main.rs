use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use client_core::{PollSettings, SimulationClient};
use shared::{domain::SensorPose, protocol::SensorPoseRequest};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "simctl", about = "Drive a stepwise simulation control service")]
struct Cli {
    #[arg(long, default_value = "http://127.0.0.1:50051")]
    server: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    StepBatch,
    StepSample(PoseArgs),
    PollBatch,
    PollRender,
    End,
    Status,
    /// Runs whole batches end to end and prints every produced file.
    Drive {
        #[arg(long, default_value_t = 2)]
        batches: u32,
        #[arg(long, default_value_t = 3)]
        samples: u32,
        #[arg(long, default_value_t = 200)]
        poll_interval_ms: u64,
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
        /// Leave the simulation running when done.
        #[arg(long)]
        keep_running: bool,
    },
}

#[derive(Args, Debug)]
struct PoseArgs {
    #[arg(long, allow_hyphen_values = true)]
    x: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    y: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    z: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    qw: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    qx: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    qy: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    qz: Option<f64>,
}

impl From<PoseArgs> for SensorPoseRequest {
    fn from(args: PoseArgs) -> Self {
        Self {
            x: args.x,
            y: args.y,
            z: args.z,
            qw: args.qw,
            qx: args.qx,
            qy: args.qy,
            qz: args.qz,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let client = SimulationClient::new(&cli.server)?;

    match cli.command {
        Command::StepBatch => print_json(&client.step_batch().await?)?,
        Command::StepSample(pose) => print_json(&client.step_sample(pose.into()).await?)?,
        Command::PollBatch => print_json(&client.poll_batch_creation().await?)?,
        Command::PollRender => print_json(&client.poll_render_finished().await?)?,
        Command::End => print_json(&client.end_simulation().await?)?,
        Command::Status => print_json(&client.status().await?)?,
        Command::Drive {
            batches,
            samples,
            poll_interval_ms,
            timeout_secs,
            keep_running,
        } => {
            let poll = PollSettings {
                interval: Duration::from_millis(poll_interval_ms),
                timeout: Duration::from_secs(timeout_secs),
            };
            drive(&client, batches, samples, poll).await?;
            if !keep_running {
                client.end_simulation().await?;
                println!("simulation ended");
            }
        }
    }

    Ok(())
}

async fn drive(
    client: &SimulationClient,
    batches: u32,
    samples: u32,
    poll: PollSettings,
) -> Result<()> {
    for batch in 0..batches {
        client.step_batch().await?;
        client.wait_for_batch(poll).await?;
        info!(batch, "batch ready");

        for sample in 0..samples {
            let pose = sweep_pose(sample, samples);
            let ticket = client
                .step_sample(SensorPoseRequest::from_pose(&pose))
                .await?;
            let rendered = client.wait_for_render(&ticket, poll).await?;
            println!(
                "batch {} sample {}: {} file(s)",
                ticket.batch_id,
                ticket.sample_id,
                rendered.file_paths.len()
            );
            for path in &rendered.file_paths {
                println!("  {path}");
            }
        }
    }
    Ok(())
}

// Walks the sensor along x across [-1, 1] so consecutive samples differ.
fn sweep_pose(sample: u32, samples: u32) -> SensorPose {
    let x = if samples <= 1 {
        0.0
    } else {
        -1.0 + 2.0 * f64::from(sample) / f64::from(samples - 1)
    };
    SensorPose::identity_at(x, 0.0, 0.0)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_covers_both_ends() {
        assert_eq!(sweep_pose(0, 3).position, [-1.0, 0.0, 0.0]);
        assert_eq!(sweep_pose(1, 3).position, [0.0, 0.0, 0.0]);
        assert_eq!(sweep_pose(2, 3).position, [1.0, 0.0, 0.0]);
        assert_eq!(sweep_pose(0, 1).position, [0.0, 0.0, 0.0]);
    }

    #[test]
    fn pose_flags_parse_negative_values() {
        let cli = Cli::try_parse_from([
            "simctl", "step-sample", "--x", "-0.5", "--qw", "1", "--qz", "-0",
        ])
        .expect("parse");
        let Command::StepSample(args) = cli.command else {
            panic!("expected step-sample");
        };
        let pose = SensorPoseRequest::from(args);
        assert_eq!(pose.x, Some(-0.5));
        assert_eq!(pose.qw, Some(1.0));
        assert_eq!(pose.y, None);
    }
}
