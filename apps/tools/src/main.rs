use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coordinator::{AssignmentCoordinator, ParticipantStore};
use sequence::{flatten, StudySpec};
use shared::domain::{ConditionName, ParticipantId, StudyId};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/studies.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a study file the way the server does at startup.
    Validate { file: PathBuf },
    /// Print the step order one participant would see.
    Flatten {
        file: PathBuf,
        #[arg(long)]
        condition: String,
        #[arg(long)]
        participant: String,
    },
    Counters {
        #[arg(long)]
        study: String,
    },
    Participants {
        #[arg(long)]
        study: String,
    },
    Abandon {
        #[arg(long)]
        study: String,
        #[arg(long)]
        participant: String,
    },
}

fn read_spec(file: &Path) -> Result<StudySpec> {
    let raw = fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    StudySpec::from_json(&raw).with_context(|| format!("parsing {}", file.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Validate { file } => {
            let spec = read_spec(&file)?;
            spec.validate()
                .with_context(|| format!("study '{}' is invalid", spec.study_id))?;
            println!(
                "ok study_id={} conditions={} steps={}",
                spec.study_id,
                spec.conditions.len(),
                spec.leaf_ids().len()
            );
        }
        Command::Flatten {
            file,
            condition,
            participant,
        } => {
            let spec = read_spec(&file)?;
            let sequence = flatten(
                &spec,
                &ConditionName::new(condition),
                &ParticipantId::new(participant),
            )?;
            for (index, step) in sequence.iter().enumerate() {
                println!("{index}\t{step}");
            }
        }
        Command::Counters { study } => {
            let storage = Storage::new(&cli.database_url).await?;
            let counters = storage
                .read_condition_counters(&StudyId::new(study))
                .await?;
            for (condition, assigned) in counters {
                println!("{condition}\t{assigned}");
            }
        }
        Command::Participants { study } => {
            let storage = Storage::new(&cli.database_url).await?;
            for stored in storage.list_participants(&StudyId::new(study)).await? {
                let record = stored.record;
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    record.participant_id,
                    record.assigned_condition,
                    record.current_step_index,
                    record.completion_state,
                    stored.updated_at.to_rfc3339()
                );
            }
        }
        Command::Abandon { study, participant } => {
            let storage = Storage::new(&cli.database_url).await?;
            let coordinator = AssignmentCoordinator::new(storage);
            let changed = coordinator
                .abandon(&StudyId::new(study), &ParticipantId::new(participant.clone()))
                .await?;
            if changed {
                println!("abandoned participant_id={participant}");
            } else {
                println!("participant_id={participant} was already closed");
            }
        }
    }

    Ok(())
}
