//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use fairrec_ml::training::{Checkpoint, CheckpointStore, TrainingPlan};
use fairrec_ml::TrainerConfig;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Handle a CLI subcommand.
pub fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, workspace),
        Commands::Plan { config } => {
            let config = resolve_config(workspace, &config)?;
            print!("{}", render_plan(&config)?);
            Ok(())
        }
        Commands::Inspect { checkpoint, json } => {
            let checkpoint = CheckpointStore::load(&checkpoint)
                .map_err(|e| anyhow::anyhow!("Failed to load checkpoint: {}", e))?;
            let summary = CheckpointSummary::from(&checkpoint);
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", summary.render());
            }
            Ok(())
        }
    }
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = init_config(workspace)?;
            println!("Configuration at: {}", config_path.display());
            Ok(())
        }
        ConfigAction::Show { config } => {
            let config = resolve_config(workspace, &config)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Write the default configuration unless a file already exists.
fn init_config(workspace: &Path) -> anyhow::Result<PathBuf> {
    let config_dir = workspace.join(".fairrec");
    std::fs::create_dir_all(&config_dir)?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        tracing::info!(path = %config_path.display(), "configuration already exists");
        return Ok(config_path);
    }

    let toml_str = toml::to_string_pretty(&TrainerConfig::default())?;
    fairrec_core::persistence::atomic_write(&config_path, toml_str.as_bytes())?;
    tracing::info!(path = %config_path.display(), "created default configuration");
    Ok(config_path)
}

/// Default user/workspace files, then `extra`, then `FAIRREC_*` variables.
fn resolve_config(workspace: &Path, extra: &[PathBuf]) -> anyhow::Result<TrainerConfig> {
    let mut files = fairrec_core::default_config_files(Some(workspace));
    files.extend(extra.iter().cloned());
    TrainerConfig::load(&files, None).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

fn render_plan(config: &TrainerConfig) -> anyhow::Result<String> {
    let plan = TrainingPlan::for_model(config)?;
    let mut out = String::new();
    writeln!(out, "model:   {} ({:?})", config.model, plan.kind)?;
    writeln!(out, "variant: {:?}", plan.variant)?;
    writeln!(out, "stage:   {}", plan.initial_stage)?;
    if !config.sst_attr_list.is_empty() {
        writeln!(out, "sensitive attributes: {}", config.sst_attr_list.join(", "))?;
    }
    writeln!(out, "optimizer roles:")?;
    for spec in &plan.roles {
        let groups: Vec<String> = spec
            .groups
            .iter()
            .map(|g| match g.learning_rate {
                Some(lr) => format!("{} (lr {lr})", g.prefix),
                None => g.prefix.clone(),
            })
            .collect();
        writeln!(out, "  {:<14} {:?} loss: {}", spec.role.as_str(), spec.loss, groups.join(", "))?;
    }
    Ok(out)
}

/// What `inspect` reports about a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
struct CheckpointSummary {
    model: String,
    fingerprint: String,
    format_version: u32,
    stage: String,
    epoch: i64,
    next_epoch: usize,
    step: usize,
    best_score: Option<f64>,
    parameters: Vec<(String, Vec<usize>)>,
    parameter_count: usize,
    optimizer_roles: Vec<String>,
    created_at: String,
}

impl From<&Checkpoint> for CheckpointSummary {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            model: checkpoint.model.clone(),
            fingerprint: checkpoint.fingerprint.clone(),
            format_version: checkpoint.format_version,
            stage: checkpoint.stage.to_string(),
            epoch: checkpoint.epoch,
            next_epoch: checkpoint.next_epoch(),
            step: checkpoint.step,
            best_score: checkpoint.best_score,
            parameters: checkpoint
                .state_dict
                .iter()
                .map(|(name, value)| (name.clone(), value.shape().to_vec()))
                .collect(),
            parameter_count: checkpoint.parameter_count(),
            optimizer_roles: checkpoint.optimizers.keys().cloned().collect(),
            created_at: checkpoint.created_at.to_rfc3339(),
        }
    }
}

impl CheckpointSummary {
    fn render(&self) -> String {
        let best = self
            .best_score
            .map_or_else(|| "-".to_string(), |s| format!("{s:.6}"));
        let mut out = format!(
            "model:       {}\nfingerprint: {}\nstage:       {}\nepoch:       {} (resumes at {})\nstep:        {}\nbest score:  {}\nsaved at:    {}\n",
            self.model,
            self.fingerprint,
            self.stage,
            self.epoch,
            self.next_epoch,
            self.step,
            best,
            self.created_at,
        );
        out.push_str(&format!("parameters ({} values):\n", self.parameter_count));
        for (name, shape) in &self.parameters {
            out.push_str(&format!("  {name} {shape:?}\n"));
        }
        out.push_str(&format!("optimizer roles: {}\n", self.optimizer_roles.join(", ")));
        out
    }
}
