#![allow(dead_code)]

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use fanout::{Command, EnvList, Error, Network, Output, RunOptions, Runner};
use tokio::io::AsyncWrite;

pub fn addr() -> String {
    std::env::var("TEST_HOST").unwrap_or("ssh://test-user@127.0.0.1:2222".to_string())
}

/// An in-memory sink that can be read back after a run.
#[derive(Debug, Clone, Default)]
pub struct Buffer(Arc<Mutex<Vec<u8>>>);

impl Buffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(String::from).collect()
    }
}

impl AsyncWrite for Buffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

pub struct Outcome {
    pub result: Result<(), Error>,
    pub stdout: Buffer,
    pub stderr: Buffer,
}

pub fn network(hosts: &[&str]) -> Network {
    Network {
        name: "test".into(),
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
        ..Default::default()
    }
}

pub fn localhosts(n: usize) -> Network {
    network(&vec!["localhost"; n])
}

pub async fn run_with(
    network: &Network,
    env: &EnvList,
    commands: &[Command],
    options: RunOptions,
    input: &'static [u8],
) -> Outcome {
    let stdout = Buffer::default();
    let stderr = Buffer::default();
    let result = Runner::new(options)
        .output(Output::new(stdout.clone(), stderr.clone()))
        .input(input)
        .run(network, env, commands)
        .await;
    Outcome {
        result,
        stdout,
        stderr,
    }
}

pub async fn run(network: &Network, commands: &[Command]) -> Outcome {
    run_with(
        network,
        &EnvList::new(),
        commands,
        RunOptions::default(),
        b"",
    )
    .await
}

/// The text of output lines, without their host label.
pub fn texts(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .map(|l| match l.split_once(" | ") {
            Some((_, text)) => text.to_owned(),
            None => l.clone(),
        })
        .collect()
}
