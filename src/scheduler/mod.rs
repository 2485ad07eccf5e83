use anyhow::{Context, Result};
use tokio::sync::mpsc::UnboundedSender;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::ScheduleConfig;
use crate::model::Message;

/// Wrapper around tokio-cron-scheduler for scheduled commands
pub struct Scheduler {
    inner: JobScheduler,
}

impl Scheduler {
    /// Create a new scheduler
    pub async fn new() -> Result<Self> {
        let inner = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        Ok(Self { inner })
    }

    /// Add a recurring cron job
    pub async fn add_cron_job<F>(&self, cron_expr: &str, name: &str, task: F) -> Result<()>
    where
        F: Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            + Send
            + Sync
            + 'static,
    {
        let job_name = name.to_string();
        let job = Job::new_async(cron_expr, move |_uuid, _lock| {
            let name = job_name.clone();
            let fut = task();
            Box::pin(async move {
                info!("Running scheduled task: {}", name);
                fut.await;
            })
        })
        .with_context(|| format!("Failed to create cron job: {}", name))?;

        self.inner
            .add(job)
            .await
            .with_context(|| format!("Failed to add job: {}", name))?;

        info!("Scheduled task '{}' with cron: {}", name, cron_expr);
        Ok(())
    }

    /// Register every configured schedule. Each firing enqueues one synthetic
    /// command per chat on the router queue.
    pub async fn add_command_schedules(
        &self,
        schedules: &[ScheduleConfig],
        queue: UnboundedSender<Message>,
    ) -> Result<()> {
        for schedule in schedules {
            let command = schedule.command.clone();
            let chat_ids = schedule.chat_ids.clone();
            let queue = queue.clone();
            let name = format!("command '{}'", schedule.command);

            self.add_cron_job(&schedule.cron, &name, move || {
                let events = synthetic_commands(&command, &chat_ids);
                let queue = queue.clone();
                Box::pin(async move {
                    for event in events {
                        if queue.send(event).is_err() {
                            warn!("Router queue closed, dropping scheduled command");
                            return;
                        }
                    }
                })
            })
            .await?;
        }
        Ok(())
    }

    /// Start the scheduler
    pub async fn start(&self) -> Result<()> {
        self.inner
            .start()
            .await
            .context("Failed to start scheduler")?;
        info!("Scheduler started");
        Ok(())
    }

    /// Shutdown the scheduler
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner
            .shutdown()
            .await
            .context("Failed to shutdown scheduler")?;
        info!("Scheduler stopped");
        Ok(())
    }
}

fn synthetic_commands(command: &str, chat_ids: &[i64]) -> Vec<Message> {
    chat_ids
        .iter()
        .map(|&chat_id| Message::synthetic_command(chat_id, command))
        .collect()
}
