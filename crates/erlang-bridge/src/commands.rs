//! Administrative command execution
//!
//! `api` runs the command on the blocking pool and replies in place. `bgapi`
//! answers with a job id at once; the command runs on a detached task bounded
//! by the worker semaphore, and its completion is both fired as a
//! `BACKGROUND_JOB` event and sent to the requester.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::CallEngine;
use crate::event::{Event, EventType};
use crate::listener::Listener;
use crate::node::ProcessAddress;
use crate::term::{Pid, StringEncoding, Term};

/// Outcome of one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResult {
    pub success: bool,
    pub output: String,
}

impl ApiResult {
    /// Classify raw engine output
    pub fn from_output(command: &str, output: Option<String>) -> Self {
        match output {
            None => Self::failure(format!("{}: Command not found!\n", command)),
            Some(output) if output.is_empty() => Self::failure("Command returned no output!"),
            Some(output) if output.starts_with('-') => Self::failure(output),
            Some(output) => Self {
                success: true,
                output,
            },
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }

    /// `{ok, Output}` or `{error, Output}`
    pub fn to_term(&self, encoding: StringEncoding) -> Term {
        let tag = if self.success { "ok" } else { "error" };
        Term::tuple(vec![Term::atom(tag), Term::text(self.output.as_str(), encoding)])
    }

    /// `{bgok, JobId, Output}` or `{bgerror, JobId, Output}`
    pub fn to_background_term(&self, job_id: &str, encoding: StringEncoding) -> Term {
        let tag = if self.success { "bgok" } else { "bgerror" };
        Term::tuple(vec![
            Term::atom(tag),
            Term::text(job_id, encoding),
            Term::text(self.output.as_str(), encoding),
        ])
    }
}

pub struct CommandPool {
    engine: Arc<dyn CallEngine>,
    workers: Arc<Semaphore>,
}

impl CommandPool {
    pub fn new(engine: Arc<dyn CallEngine>, workers: usize) -> Self {
        Self {
            engine,
            workers: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Run a command to completion
    pub async fn run_api(&self, command: &str, arg: &str) -> ApiResult {
        run(self.engine.clone(), command.to_string(), arg.to_string()).await
    }

    /// Id for the next background job
    pub fn new_job_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// Start `job_id` in the background; the requester already has the id
    pub fn spawn_background(&self, listener: Arc<Listener>, reply_to: Pid, job_id: &str, command: &str, arg: &str) {
        let engine = self.engine.clone();
        let workers = self.workers.clone();
        let command = command.to_string();
        let arg = arg.to_string();
        let job = job_id.to_string();

        tokio::spawn(async move {
            let _permit = match workers.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(job = %job, "Worker pool closed, dropping background job");
                    return;
                }
            };
            debug!(listener = listener.id(), job = %job, "Running background command {} {}", command, arg);

            let result = run(engine.clone(), command.clone(), arg.clone()).await;

            let mut event = Event::new(EventType::BackgroundJob)
                .with_header("Job-UUID", job.as_str())
                .with_header("Job-Command", command.as_str())
                .with_body(result.output.as_str());
            if !arg.is_empty() {
                event.add_header("Job-Command-Arg", arg.as_str());
            }
            event.add_header("Job-Successful", if result.success { "true" } else { "false" });
            engine.fire_event(event);

            // The listener may be tearing down; the event above is enough then
            let Some(_hold) = listener.try_hold() else {
                info!(listener = listener.id(), job = %job, "Listener closing, background reply dropped");
                return;
            };
            if !listener.is_running() {
                return;
            }
            let reply = result.to_background_term(&job, listener.encoding());
            let to = ProcessAddress::Pid(reply_to);
            match listener.connection().send_to_address(&to, reply.clone()).await {
                Ok(()) => listener.retries().schedule(job.clone(), to, reply),
                Err(e) => warn!(listener = listener.id(), job = %job, "Failed to send background reply: {}", e),
            }
        });
    }
}

async fn run(engine: Arc<dyn CallEngine>, command: String, arg: String) -> ApiResult {
    let name = command.clone();
    match tokio::task::spawn_blocking(move || engine.execute_api(&command, &arg)).await {
        Ok(output) => ApiResult::from_output(&name, output),
        Err(e) => {
            warn!("Command {} panicked or was cancelled: {}", name, e);
            ApiResult::failure(format!("{}: command failed\n", name))
        }
    }
}
