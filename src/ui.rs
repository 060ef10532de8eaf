//! Interface de terminal do wadispatch: barras de progresso, notificações
//! coloridas e tabelas de jobs.
//!
//! Usa `indicatif` para a barra de progresso ao vivo e `console` para a
//! estilização com cores. O [`JobProgress`] acompanha um job até o fim.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::job::{Job, JobKind, JobStatus};
use crate::notify::JobChange;
use crate::toast::{Severity, Toaster};

/// Barra de progresso ao vivo de um job.
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobProgress {
    pub fn start(job: &Job) -> Self {
        let pb = ProgressBar::new(job.progress.total as u64);
        // Template constante; se for rejeitado, usa a barra padrão.
        let style = ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style.progress_chars("=> "));
        pb.set_position(job.progress.current as u64);
        pb.set_message(format!("{} {}", label(job), job.status));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    pub fn update(&self, job: &Job) {
        self.pb.set_length(job.progress.total as u64);
        self.pb.set_position(job.progress.current as u64);
        self.pb.set_message(format!("{} {}", label(job), job.status));
    }

    /// Limpa a barra e imprime o estado final.
    pub fn finish(&self, job: &Job) {
        self.pb.finish_and_clear();
        let reason = job.error.as_deref().unwrap_or("");
        match job.status {
            JobStatus::Completed => {
                println!("  {} {} completed ({})", self.green.apply_to("✓"), job.id, job.progress);
            }
            JobStatus::Cancelled => {
                println!("  {} {} cancelled at {}", self.yellow.apply_to("■"), job.id, job.progress);
            }
            _ => {
                println!("  {} {} failed at {}: {reason}", self.red.apply_to("✗"), job.id, job.progress);
            }
        }
    }
}

/// Imprime notificações no stderr, coloridas pela severidade.
pub struct ConsoleToaster;

impl Toaster for ConsoleToaster {
    fn notify(&self, message: &str, severity: Severity) {
        let (style, mark) = match severity {
            Severity::Info => (Style::new().cyan(), "i"),
            Severity::Success => (Style::new().green().bold(), "✓"),
            Severity::Warning => (Style::new().yellow(), "!"),
            Severity::Error => (Style::new().red().bold(), "✗"),
        };
        eprintln!("{} {message}", style.apply_to(mark));
    }
}

fn label(job: &Job) -> String {
    match job.kind {
        JobKind::LocalSequentialSend => {
            format!("send to {}", job.target.destination().unwrap_or("?"))
        }
        JobKind::RemoteVerification => format!("verification {}", job.id),
    }
}

fn status_style(status: JobStatus) -> Style {
    match status {
        JobStatus::Completed => Style::new().green(),
        JobStatus::Error => Style::new().red(),
        JobStatus::Cancelled | JobStatus::Paused => Style::new().yellow(),
        JobStatus::Pending | JobStatus::Running => Style::new().cyan(),
    }
}

/// Uma linha da tabela de jobs.
pub fn job_row(job: &Job) -> String {
    let kind = match job.kind {
        JobKind::LocalSequentialSend => "send",
        JobKind::RemoteVerification => "verify",
    };
    format!(
        "{:<36} {:<7} {:<10} {:>9}  {}",
        job.id,
        kind,
        job.status.as_str(),
        job.progress.to_string(),
        job.error.as_deref().unwrap_or("")
    )
}

pub fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No jobs.");
        return;
    }
    let header = Style::new().bold();
    println!(
        "{}",
        header.apply_to(format!("{:<36} {:<7} {:<10} {:>9}  {}", "ID", "KIND", "STATUS", "PROGRESS", "ERROR"))
    );
    for job in jobs {
        println!("{}", status_style(job.status).apply_to(job_row(job)));
    }
}

pub fn print_job(job: &Job) {
    let style = status_style(job.status);
    println!("{}", style.apply_to(format!("─── {} ───", job.id)));
    match serde_json::to_string_pretty(job) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("failed to render job: {e}"),
    }
}

/// Uma linha descrevendo uma mudança ao vivo, usada pelo `watch`.
pub fn change_line(change: &JobChange) -> String {
    let origin = format!("{:?}", change.origin()).to_lowercase();
    match change {
        JobChange::Updated { job, .. } => format!("[{origin}] {}", job_row(job)),
        JobChange::Removed { job_id, .. } => format!("[{origin}] {job_id} removed"),
    }
}
