//! One function per subcommand.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use grab_core::protocol::{
    CancelParams, CancelReply, ListParams, ListReply, LogsParams, LogsReply, Request,
    StatusParams, StatusReply, SubmitParams, SubmitReply,
};
use grab_core::{short_id, GrabConfig};

use crate::cli::{CliArgs, Command, ConfigAction, SubmitArgs};
use crate::client::DaemonClient;
use crate::terminal::Terminal;

pub async fn run(args: CliArgs, terminal: &Terminal) -> Result<()> {
    let config_path = args
        .config
        .unwrap_or_else(GrabConfig::default_config_path);
    let socket = args.socket;
    let client = || daemon_client(&config_path, socket.clone());

    match args.command {
        Command::Config { action } => config_command(&action, &config_path, terminal)?,
        Command::Submit(submit) => {
            let params = submit_params(submit, &std::env::current_dir()?);
            let reply: SubmitReply = client()?.call(&Request::Submit(params)).await?;
            terminal.print_ok(&format!(
                "Task submitted. ID: {} ({})",
                reply.task_id,
                short_id(&reply.task_id)
            ))?;
        }
        Command::Status => {
            let reply: StatusReply = client()?
                .call(&Request::Status(StatusParams::default()))
                .await?;
            terminal.print_status(&reply)?;
        }
        Command::List { status } => {
            let reply: ListReply = client()?
                .call(&Request::List(ListParams {
                    status: status.as_option(),
                }))
                .await?;
            terminal.print_tasks(&reply.tasks)?;
        }
        Command::Cancel { task_id } => {
            let reply: CancelReply = client()?
                .call(&Request::Cancel(CancelParams { task_id }))
                .await?;
            let id = short_id(&reply.task_id);
            if !reply.cancelled {
                bail!("task {id} cannot be cancelled: it is already {}", reply.status);
            }
            terminal.print_ok(&format!("Task {id} {}.", reply.status))?;
        }
        Command::Logs { task_id, tail } => {
            let reply: LogsReply = client()?
                .call(&Request::Logs(LogsParams {
                    task_id,
                    tail: Some(tail),
                }))
                .await?;
            terminal.print_raw(&reply.logs)?;
            if !reply.logs.is_empty() && !reply.logs.ends_with('\n') {
                terminal.print_raw("\n")?;
            }
        }
    }
    Ok(())
}

/// `--socket` wins over the configured socket path.
fn daemon_client(config_path: &Path, socket: Option<PathBuf>) -> Result<DaemonClient> {
    let socket = match socket {
        Some(path) => path,
        None => GrabConfig::load(Some(config_path))
            .with_context(|| {
                format!("failed to load configuration from {}", config_path.display())
            })?
            .socket_path(),
    };
    Ok(DaemonClient::new(socket))
}

/// Build the wire request; relative working directories resolve against `cwd`.
fn submit_params(args: SubmitArgs, cwd: &Path) -> SubmitParams {
    let working_dir = match &args.workdir {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => cwd.join(dir),
        None => cwd.to_path_buf(),
    };
    SubmitParams {
        max_util_percent: args.max_util_percent(),
        env: args.env_map(),
        command: args.command,
        name: args.name,
        working_dir: Some(working_dir),
        gpu_ids: (!args.gpus.is_empty()).then_some(args.gpus),
        min_free_memory_gb: args.memory,
        gpu_count: args.gpu_count,
        priority: args.priority,
    }
}

fn config_command(action: &ConfigAction, path: &Path, terminal: &Terminal) -> Result<()> {
    match action {
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                bail!(
                    "{} already exists; pass --force to overwrite it",
                    path.display()
                );
            }
            GrabConfig::default()
                .save(path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            terminal.print_ok(&format!("Wrote default config to {}", path.display()))
        }
        ConfigAction::Show => {
            let config = GrabConfig::load(Some(path))
                .with_context(|| format!("failed to load configuration from {}", path.display()))?;
            terminal.print_raw(&format!("# {}\n", path.display()))?;
            terminal.print_raw(&config.to_yaml()?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn submit_args(argv: &[&str]) -> SubmitArgs {
        let mut full = vec!["gpu-grab", "submit"];
        full.extend_from_slice(argv);
        match CliArgs::parse_from(full).command {
            Command::Submit(args) => args,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_working_dir_resolution() {
        let cwd = Path::new("/home/me/project");

        let params = submit_params(submit_args(&["make"]), cwd);
        assert_eq!(params.working_dir, Some(PathBuf::from("/home/me/project")));

        let params = submit_params(submit_args(&["make", "-w", "sub/dir"]), cwd);
        assert_eq!(params.working_dir, Some(PathBuf::from("/home/me/project/sub/dir")));

        let params = submit_params(submit_args(&["make", "-w", "/data"]), cwd);
        assert_eq!(params.working_dir, Some(PathBuf::from("/data")));
    }

    #[test]
    fn test_unset_requirements_stay_unset() {
        let params = submit_params(submit_args(&["make", "-u", "20", "-g", "3"]), Path::new("/"));
        assert_eq!(params.gpu_ids, Some(vec![3]));
        assert_eq!(params.max_util_percent, Some(80.0));
        assert_eq!(params.min_free_memory_gb, None);
        assert_eq!(params.gpu_count, None);
        assert_eq!(params.name, None);
    }

    #[test]
    fn test_config_init_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let terminal = Terminal::new();

        config_command(&ConfigAction::Init { force: false }, &path, &terminal).unwrap();
        let written = GrabConfig::load(Some(&path)).unwrap();
        assert_eq!(written.max_concurrent_tasks, GrabConfig::default().max_concurrent_tasks);

        assert!(config_command(&ConfigAction::Init { force: false }, &path, &terminal).is_err());
        config_command(&ConfigAction::Init { force: true }, &path, &terminal).unwrap();
    }
}
