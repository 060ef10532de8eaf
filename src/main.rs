use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use wadispatch::cli::{Cli, Command, SendArgs};
use wadispatch::config::DispatchConfig;
use wadispatch::control::{Collaborators, ControlOutcome, JobControl, SendJobSpec, VerifyJobSpec};
use wadispatch::history::JsonlHistory;
use wadispatch::job::{Job, JobStatus};
use wadispatch::notify::JobChange;
use wadispatch::provider::ProviderClient;
use wadispatch::store::FileStore;
use wadispatch::toast::{LogToaster, Toaster};
use wadispatch::ui::{self, ConsoleToaster, JobProgress};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose);

    let config = DispatchConfig::load(cli.config.as_deref())?;
    let store = Arc::new(FileStore::open(config.ledger_dir())?);
    let stop = CancellationToken::new();
    let watcher = Arc::clone(&store).watch(config.watch_interval(), stop.clone());

    let client = Arc::new(ProviderClient::with_timeout(
        config.api_url.clone(),
        config.api_key.clone(),
        config.request_timeout(),
    )?);
    let toaster: Arc<dyn Toaster> = if console::user_attended_stderr() {
        Arc::new(ConsoleToaster)
    } else {
        Arc::new(LogToaster)
    };
    let control = JobControl::new(
        store,
        config.context.clone(),
        Collaborators {
            executor: client.clone(),
            authority: client,
            history: Arc::new(JsonlHistory::new(config.history_path())),
            toaster,
        },
        config.settings(),
    )?;

    let result = run(cli.command, &control, &config).await;

    // History writes are fire-and-forget; give the last one a moment to land.
    tokio::time::sleep(Duration::from_millis(100)).await;
    control.shutdown();
    stop.cancel();
    let _ = watcher.await;
    result
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "wadispatch=debug" } else { "wadispatch=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(command: Command, control: &JobControl, config: &DispatchConfig) -> Result<()> {
    match command {
        Command::Send(args) => send(args, control, config).await,
        Command::Verify {
            channels,
            numbers,
            delay_ms,
            detach,
        } => {
            control.start().await?;
            let rx = control.subscribe();
            let job = control
                .create_verification(VerifyJobSpec {
                    channels,
                    numbers,
                    delay_ms,
                })
                .await?;
            println!("Created verification job {}", job.id);
            if detach {
                return Ok(());
            }
            finish(follow(control, &job.id, rx).await?)
        }
        Command::List => {
            ui::print_jobs(&control.list()?);
            Ok(())
        }
        Command::Show { id } => match control.get(&id)? {
            Some(job) => {
                ui::print_job(&job);
                Ok(())
            }
            None => bail!("Job not found: {id}"),
        },
        Command::Pause { id } => report(&id, "pause", control.pause(&id).await?),
        Command::Resume { id } => report(&id, "resume", control.resume(&id).await?),
        Command::Cancel { id, force } => {
            let outcome = if force {
                control.abandon(&id).await?
            } else {
                control.cancel(&id).await?
            };
            report(&id, "cancel", outcome)
        }
        Command::Remove { id } => report(&id, "remove", control.remove(&id)?),
        Command::Clear => {
            let removed = control.clear_finished()?;
            println!("Removed {} finished job(s)", removed.len());
            Ok(())
        }
        Command::Watch { id } => watch(control, id.as_deref()).await,
    }
}

async fn send(args: SendArgs, control: &JobControl, config: &DispatchConfig) -> Result<()> {
    control.start().await?;
    let rx = control.subscribe();
    let handle = control.create_send(SendJobSpec {
        destination: args.to.clone(),
        channel: args.channel.clone(),
        steps: args.blocks(),
        delays: args.delays(config.settings().delays),
    })?;
    println!("Created send job {}", handle.job_id());
    finish(follow(control, handle.job_id(), rx).await?)
}

/// Render `job_id` until it reaches a terminal state. Ctrl-C cancels it.
async fn follow(
    control: &JobControl,
    job_id: &str,
    mut rx: broadcast::Receiver<JobChange>,
) -> Result<Job> {
    let Some(job) = control.get(job_id)? else {
        bail!("Job not found: {job_id}");
    };
    let bar = JobProgress::start(&job);
    if job.is_terminal() {
        bar.finish(&job);
        return Ok(job);
    }

    let mut interrupted = false;
    loop {
        let latest = tokio::select! {
            received = rx.recv() => match received {
                Ok(change) => change.job().filter(|j| j.id == job_id).cloned(),
                Err(RecvError::Lagged(_)) => control.get(job_id)?,
                Err(RecvError::Closed) => bail!("change stream closed while following {job_id}"),
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                control.cancel(job_id).await?;
                None
            }
        };

        if let Some(job) = latest {
            bar.update(&job);
            if job.is_terminal() {
                bar.finish(&job);
                return Ok(job);
            }
        }
    }
}

fn finish(job: Job) -> Result<()> {
    if job.status == JobStatus::Error {
        bail!("job {} failed: {}", job.id, job.error.unwrap_or_default());
    }
    Ok(())
}

fn report(id: &str, action: &str, outcome: ControlOutcome) -> Result<()> {
    match outcome {
        ControlOutcome::Applied => println!("{action} requested for {id}"),
        ControlOutcome::Unchanged => println!("{id}: nothing to {action}"),
        // Already surfaced as a warning.
        ControlOutcome::Ignored(_) => {}
    }
    Ok(())
}

async fn watch(control: &JobControl, only: Option<&str>) -> Result<()> {
    control.start().await?;
    let mut rx = control.subscribe();
    ui::print_jobs(&control.list()?);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(change) => {
                    if only.is_none_or(|id| id == change.job_id()) {
                        println!("{}", ui::change_line(&change));
                    }
                }
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Watch fell behind"),
                Err(RecvError::Closed) => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}
