//! Delve 命令行入口
//!
//! 用法：
//!   delve [--config <path>] [--thread <id>] <问题或澄清回答...>
//!   delve [--config <path>] --resume <id>
//!   delve [--config <path>] --reset <id>

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use delve::config::load_config;
use delve::core::{ResearchBuilder, ShutdownManager};
use delve::service::{AskOutcome, ResearchService};
use delve::workflow::{RunOutcome, RunStatus, WorkflowEvent};
use tokio::sync::mpsc::unbounded_channel;

#[derive(Debug, Default)]
struct CliArgs {
    config: Option<PathBuf>,
    thread: Option<String>,
    resume: Option<String>,
    reset: Option<String>,
    query: Vec<String>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<CliArgs> {
    let mut cli = CliArgs::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let mut value = |flag: &str| args.next().with_context(|| format!("{flag} requires a value"));
        match arg.as_str() {
            "--config" => cli.config = Some(PathBuf::from(value("--config")?)),
            "--thread" => cli.thread = Some(value("--thread")?),
            "--resume" => cli.resume = Some(value("--resume")?),
            "--reset" => cli.reset = Some(value("--reset")?),
            _ => cli.query.push(arg),
        }
    }
    Ok(cli)
}

fn print_outcome(outcome: &RunOutcome) {
    match &outcome.status {
        RunStatus::Completed => {
            println!("{}", outcome.state.final_report.as_deref().unwrap_or_default());
        }
        RunStatus::AwaitingInput => {
            println!("Clarification needed, answer with: delve --thread {} <answer>", outcome.thread_id);
        }
        RunStatus::Failed { stage, error } => {
            eprintln!("Research failed at {stage}: {error}");
            eprintln!("Retry with: delve --reset {0} && delve --resume {0}", outcome.thread_id);
        }
        _ => {
            eprintln!(
                "Research paused before {}, continue with: delve --resume {}",
                outcome.stage, outcome.thread_id
            );
        }
    }
}

async fn ask(service: &Arc<ResearchService>, thread_id: &str, text: &str) -> anyhow::Result<()> {
    match service.ask(thread_id, text).await.context("research request failed")? {
        AskOutcome::Clarification { thread_id, question } => {
            println!("{question}");
            println!("\nAnswer with: delve --thread {thread_id} <answer>");
        }
        AskOutcome::Researching(handle) => {
            eprintln!("Researching (thread {})...", handle.thread_id());
            let outcome = handle.wait().await.context("research failed")?;
            print_outcome(&outcome);
        }
        AskOutcome::Completed(outcome) => print_outcome(&outcome),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    delve::observability::init();

    let cli = parse_args(std::env::args().skip(1))?;
    let config = load_config(cli.config.clone()).context("Failed to load config")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let (event_tx, mut event_rx) = unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let WorkflowEvent::StageEntered {
                stage,
                research_iterations,
                ..
            } = &event
            {
                eprintln!("[{stage}] iteration {research_iterations}");
            }
        }
    });

    let service = ResearchBuilder::new(config)
        .with_cancel(shutdown.token())
        .with_observer(event_tx)
        .build()
        .await
        .context("Failed to build research service")?;

    if let Some(thread_id) = cli.reset {
        if service.reset(&thread_id).await? {
            println!("Thread {thread_id} reset, continue with: delve --resume {thread_id}");
        } else {
            println!("Thread {thread_id} is not in a failed state");
        }
        return Ok(());
    }

    if let Some(thread_id) = cli.resume {
        let outcome = service.resume(&thread_id).await.context("resume failed")?;
        print_outcome(&outcome);
        return Ok(());
    }

    if cli.query.is_empty() {
        bail!("usage: delve [--config <path>] [--thread <id>] <question> | --resume <id> | --reset <id>");
    }
    let thread_id = cli.thread.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    ask(&service, &thread_id, &cli.query.join(" ")).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_query_and_thread() {
        let cli = parse_args(args(&["--thread", "t1", "compare", "tokio"])).unwrap();
        assert_eq!(cli.thread.as_deref(), Some("t1"));
        assert_eq!(cli.query, vec!["compare", "tokio"]);
        assert!(cli.resume.is_none());
    }

    #[test]
    fn test_flag_without_value_is_error() {
        assert!(parse_args(args(&["--resume"])).is_err());
    }
}
