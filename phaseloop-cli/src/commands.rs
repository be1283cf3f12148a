//! CLI subcommand handlers.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use phaseloop_core::cpu::{CpuBackend, CpuFactory};
use phaseloop_core::phases::describe;
use phaseloop_core::{
    CheckpointHook, LocalTrainer, PhasePlanSpec, Task, TaskConfig, build_phases, load_checkpoint,
    load_config,
};
use serde_json::{Value, json};
use tracing::info;

use crate::{Commands, ConfigAction};

/// Handle a CLI subcommand.
pub fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Train {
            config,
            checkpoint,
            checkpoint_dir,
        } => {
            let summary = run_train(&config, checkpoint, checkpoint_dir)?;
            println!("{summary}");
            Ok(())
        }
        Commands::Plan {
            epochs,
            period,
            phases_per_epoch,
            test_only,
        } => {
            let spec = PhasePlanSpec {
                num_epochs: epochs,
                phases_per_epoch,
                test_phase_period: period,
                test_only,
            };
            println!("{}", render_plan(&spec)?);
            Ok(())
        }
        Commands::Inspect { checkpoint } => {
            println!("{}", render_checkpoint(&checkpoint)?);
            Ok(())
        }
        Commands::Config { action } => handle_config(action),
    }
}

fn handle_config(action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init { path } => {
            if path.exists() {
                println!("Configuration file already exists at: {}", path.display());
                return Ok(());
            }
            std::fs::write(&path, TaskConfig::starter_toml()?)?;
            println!("Created starter configuration at: {}", path.display());
            Ok(())
        }
        ConfigAction::Show { config } => {
            let config = load_config(Some(&config))
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Load a configuration, apply command-line overrides, and train it to
/// completion. Returns a one-line summary.
pub fn run_train(
    config_path: &Path,
    checkpoint: Option<PathBuf>,
    checkpoint_dir: Option<PathBuf>,
) -> anyhow::Result<String> {
    let mut config = load_config(Some(config_path))
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    if let Some(path) = checkpoint {
        config.checkpoint = Some(path);
    }
    if let Some(dir) = checkpoint_dir {
        add_checkpoint_hook(&mut config, &dir);
    }

    let mut task = Task::<CpuBackend>::from_config(&config, &CpuFactory::default())?;
    info!(config = %config_path.display(), "Training");
    LocalTrainer::new().train(&mut task)?;

    let mut summary = format!(
        "Finished {} phases ({} updates)",
        task.phases().len(),
        task.num_updates()
    );
    if let Some(loss) = task.average_loss() {
        write!(summary, ", final test loss {loss:.6}")?;
    }
    for meter in task.meters() {
        write!(summary, ", {} {}", meter.name(), meter.value())?;
    }
    Ok(summary)
}

/// Route checkpoints to `dir`, replacing any configured checkpoint hook.
fn add_checkpoint_hook(config: &mut TaskConfig, dir: &Path) {
    config
        .hooks
        .retain(|hook| hook.get("name").and_then(Value::as_str) != Some(CheckpointHook::NAME));
    config.hooks.push(json!({
        "name": CheckpointHook::NAME,
        "dir": dir,
        "period": 1,
    }));
}

pub fn render_plan(spec: &PhasePlanSpec) -> anyhow::Result<String> {
    let phases = build_phases(spec)?;
    let train = phases.iter().filter(|p| p.train).count();
    Ok(format!(
        "{}\n{} phases: {} train, {} test",
        describe(&phases),
        phases.len(),
        train,
        phases.len() - train
    ))
}

pub fn render_checkpoint(path: &Path) -> anyhow::Result<String> {
    let file = load_checkpoint(path)?;
    let state = &file.task_state;
    let mut out = String::new();
    writeln!(out, "version:         {}", file.version)?;
    writeln!(out, "saved_at:        {}", file.saved_at.to_rfc3339())?;
    writeln!(out, "phase_idx:       {}", state.phase_idx)?;
    writeln!(out, "train_phase_idx: {}", state.train_phase_idx)?;
    writeln!(out, "train:           {}", state.train)?;
    writeln!(out, "num_updates:     {}", state.num_updates)?;
    writeln!(out, "losses:          {}", state.losses.len())?;
    let hooks: Vec<&str> = state.hooks.keys().map(String::as_str).collect();
    write!(out, "hooks:           {}", hooks.join(", "))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write_config(dir: &Path) -> PathBuf {
        let path = dir.join("task.toml");
        std::fs::write(&path, TaskConfig::starter_toml().unwrap()).unwrap();
        path
    }

    #[test]
    fn test_render_plan() {
        let spec = PhasePlanSpec {
            num_epochs: 3,
            test_phase_period: 2,
            ..Default::default()
        };
        assert_eq!(
            render_plan(&spec).unwrap(),
            "train,train,test,train,test\n5 phases: 3 train, 2 test"
        );
    }

    #[test]
    fn test_render_plan_rejects_bad_period() {
        let spec = PhasePlanSpec {
            test_phase_period: 0,
            ..Default::default()
        };
        assert!(render_plan(&spec).is_err());
    }

    #[test]
    fn test_checkpoint_hook_replaces_existing() {
        let mut config = TaskConfig::starter();
        config
            .hooks
            .push(json!({"name": "checkpoint", "dir": "/old", "period": 5}));
        add_checkpoint_hook(&mut config, Path::new("/new"));
        let dirs: Vec<&str> = config
            .hooks
            .iter()
            .filter(|h| h["name"] == "checkpoint")
            .filter_map(|h| h["dir"].as_str())
            .collect();
        assert_eq!(dirs, vec!["/new"]);
        assert_eq!(config.hooks.len(), 2);
    }

    #[test]
    fn test_train_then_inspect_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path());
        let ckpt = dir.path().join("ckpt");

        let summary = run_train(&config, None, Some(ckpt.clone())).unwrap();
        assert!(summary.starts_with("Finished 4 phases (128 updates)"));

        let report = render_checkpoint(&ckpt).unwrap();
        assert!(report.contains("phase_idx:       3"));
        assert!(report.contains("num_updates:     128"));
        assert!(report.contains("checkpoint"));

        // Resuming from the final phase leaves nothing to run.
        let resumed = run_train(&config, Some(ckpt), None).unwrap();
        assert!(resumed.starts_with("Finished 4 phases (128 updates)"));
    }

    #[test]
    fn test_inspect_missing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        assert!(render_checkpoint(&dir.path().join("none.json")).is_err());
    }
}
