//! Turning a [`Command`] into the tasks that run it.

use super::tar::{remote_tar_command, TarSource};
use super::{Client, Command, EnvList, Error, LocalhostClient};

use std::path::PathBuf;

/// Where a task's input comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskInput {
    /// A `tar` archive produced locally when the task starts.
    Tar(TarSource),
    /// This process's standard input.
    Stdin,
}

/// The clients a task runs on.
#[derive(Debug)]
pub enum TaskClients {
    /// Hosts of the network, by index.
    Hosts(Vec<usize>),
    /// A localhost client created for this task alone.
    Local(Box<Client>),
}

/// One shell text, run by a set of clients in parallel.
#[derive(Debug)]
pub struct Task {
    /// The shell text every client runs, before its environment prefix.
    pub run: String,
    /// Input fed to every client's stdin.
    pub input: Option<TaskInput>,
    /// Who runs it.
    pub clients: TaskClients,
    /// Whether a pseudo-terminal is requested.
    pub tty: bool,
}

/// Build the tasks of `cmd` for a network of `hosts` hosts sharing `env`.
///
/// Tasks come out as uploads, script, local, run. Every host-bound task is fanned out the same
/// way: to the first host if `once`, to consecutive groups of `serial` hosts if set, and to all
/// hosts otherwise. If `debug` is set every command is traced with `set -x`.
pub async fn build_tasks(
    cmd: &Command,
    hosts: usize,
    env: &EnvList,
    debug: bool,
) -> Result<Vec<Task>, Error> {
    let trace = |run: &str| {
        if debug {
            format!("set -x;{}", run)
        } else {
            run.to_owned()
        }
    };
    let groups = fan_out(cmd, hosts);
    let mut tasks = Vec::new();

    for upload in &cmd.upload {
        let src = env.expand(&upload.src).await?;
        let source = TarSource::new(".", src, &upload.exclude);
        for group in &groups {
            tasks.push(Task {
                run: trace(&remote_tar_command(&upload.dst)),
                input: Some(TaskInput::Tar(source.clone())),
                clients: TaskClients::Hosts(group.clone()),
                tty: false,
            });
        }
    }

    if let Some(ref script) = cmd.script {
        // `./deploy.sh -x` names `./deploy.sh`
        let path = PathBuf::from(script.split_whitespace().next().unwrap_or_default());
        let data = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| Error::Script { path, source })?;
        for group in &groups {
            tasks.push(Task {
                run: trace(&data),
                input: stdin(cmd),
                clients: TaskClients::Hosts(group.clone()),
                tty: cmd.stdin,
            });
        }
    }

    if let Some(ref local) = cmd.local {
        let mut client = Client::from(LocalhostClient::new(env.as_export()));
        client.connect("localhost").await?;
        tasks.push(Task {
            run: trace(local),
            input: stdin(cmd),
            clients: TaskClients::Local(Box::new(client)),
            tty: false,
        });
    }

    if let Some(ref run) = cmd.run {
        for group in &groups {
            tasks.push(Task {
                run: trace(run),
                input: stdin(cmd),
                clients: TaskClients::Hosts(group.clone()),
                tty: cmd.stdin,
            });
        }
    }

    tracing::debug!(command = %cmd.name, count = tasks.len(), "tasks built");
    Ok(tasks)
}

fn stdin(cmd: &Command) -> Option<TaskInput> {
    if cmd.stdin {
        Some(TaskInput::Stdin)
    } else {
        None
    }
}

/// Host indices of every group a host-bound task of `cmd` runs on, in order.
///
/// `serial` wins over `once`; the Fanfile refuses commands that set both.
fn fan_out(cmd: &Command, hosts: usize) -> Vec<Vec<usize>> {
    if hosts == 0 {
        return Vec::new();
    }

    let all: Vec<usize> = (0..hosts).collect();
    if cmd.serial > 0 {
        all.chunks(cmd.serial).map(<[usize]>::to_vec).collect()
    } else if cmd.once {
        vec![vec![0]]
    } else {
        vec![all]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Upload;
    use pretty_assertions::assert_eq;

    fn hosts(task: &Task) -> Vec<usize> {
        match task.clients {
            TaskClients::Hosts(ref h) => h.clone(),
            TaskClients::Local(_) => panic!("local task"),
        }
    }

    #[tokio::test]
    async fn all_hosts() {
        let cmd = Command::run("ping", "echo pong");
        let tasks = build_tasks(&cmd, 3, &EnvList::new(), false).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].run, "echo pong");
        assert_eq!(hosts(&tasks[0]), vec![0, 1, 2]);
        assert!(tasks[0].input.is_none());
        assert!(!tasks[0].tty);
    }

    #[tokio::test]
    async fn once() {
        let mut cmd = Command::run("migrate", "./migrate");
        cmd.once = true;
        let tasks = build_tasks(&cmd, 5, &EnvList::new(), false).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(hosts(&tasks[0]), vec![0]);
    }

    #[tokio::test]
    async fn serial_groups() {
        let mut cmd = Command::run("restart", "restart");
        cmd.serial = 2;
        let tasks = build_tasks(&cmd, 5, &EnvList::new(), false).await.unwrap();
        let groups: Vec<_> = tasks.iter().map(hosts).collect();
        assert_eq!(groups, vec![vec![0, 1], vec![2, 3], vec![4]]);
    }

    #[test]
    fn serial_wins_over_once() {
        let mut cmd = Command::run("x", "x");
        cmd.once = true;
        cmd.serial = 3;
        assert_eq!(fan_out(&cmd, 4), vec![vec![0, 1, 2], vec![3]]);
        assert!(fan_out(&cmd, 0).is_empty());
    }

    #[tokio::test]
    async fn order_and_debug() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("deploy.sh");
        std::fs::write(&script, "echo from script\n").unwrap();

        let mut env = EnvList::new();
        env.set("DST", "/srv");
        let cmd = Command {
            name: "all".into(),
            upload: vec![Upload {
                src: "dist".into(),
                dst: "/srv".into(),
                exclude: "*.log".into(),
            }],
            script: Some(format!("{} --fast", script.display())),
            local: Some("make".into()),
            run: Some("restart".into()),
            stdin: true,
            ..Default::default()
        };

        let tasks = build_tasks(&cmd, 2, &env, true).await.unwrap();
        let runs: Vec<_> = tasks.iter().map(|t| t.run.as_str()).collect();
        assert_eq!(
            runs,
            vec![
                "set -x;tar -C \"/srv\" -xzf -",
                "set -x;echo from script\n",
                "set -x;make",
                "set -x;restart",
            ]
        );

        assert_eq!(
            tasks[0].input,
            Some(TaskInput::Tar(TarSource::new(".", "dist", "*.log")))
        );
        assert!(!tasks[0].tty);
        assert_eq!(tasks[1].input, Some(TaskInput::Stdin));
        assert!(tasks[1].tty);
        assert!(matches!(tasks[2].clients, TaskClients::Local(_)));
        assert!(tasks[3].tty);
    }

    #[tokio::test]
    async fn upload_source_expanded() {
        let mut env = EnvList::new();
        env.set("APP", "web");
        let cmd = Command {
            name: "up".into(),
            upload: vec![Upload {
                src: "build/$APP".into(),
                dst: "/tmp".into(),
                exclude: String::new(),
            }],
            serial: 1,
            ..Default::default()
        };

        let tasks = build_tasks(&cmd, 2, &env, false).await.unwrap();
        assert_eq!(tasks.len(), 2);
        for task in &tasks {
            assert_eq!(
                task.input,
                Some(TaskInput::Tar(TarSource::new(".", "build/web", "")))
            );
        }
    }

    #[tokio::test]
    async fn missing_script() {
        let cmd = Command {
            name: "s".into(),
            script: Some("/nonexistent/fanout-script.sh".into()),
            ..Default::default()
        };
        assert!(matches!(
            build_tasks(&cmd, 1, &EnvList::new(), false).await,
            Err(Error::Script { .. })
        ));
    }
}
