//! Built-in job handlers.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use super::{JobContext, JobError, JobHandler};

/// Surface the echo handler writes to.
pub const EVENT_LOG_SURFACE: &str = "event_log";

/// Handler: `ping`. Liveness probe for the pipeline; returns a timestamp.
#[derive(Debug, Clone, Default)]
pub struct PingHandler;

#[async_trait]
impl JobHandler for PingHandler {
    fn job_type(&self) -> &str {
        "ping"
    }

    async fn execute(&self, ctx: &JobContext) -> Result<Value, JobError> {
        Ok(json!({
            "pong": true,
            "attempt": ctx.attempt(),
            "at": Utc::now(),
        }))
    }
}

/// Handler: `echo`. Writes the payload to the event log and returns it.
///
/// A payload with `"fail": "retryable"` or `"fail": "fatal"` makes the
/// attempt fail that way, which is handy for exercising retries end to end.
#[derive(Debug, Clone, Default)]
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    fn job_type(&self) -> &str {
        "echo"
    }

    async fn execute(&self, ctx: &JobContext) -> Result<Value, JobError> {
        match ctx.payload().get("fail").and_then(Value::as_str) {
            Some("retryable") => return Err(JobError::retryable("echo asked to fail").with_code("ECHO_FAIL")),
            Some("fatal") => return Err(JobError::fatal("echo asked to fail").with_code("ECHO_FAIL")),
            _ => {}
        }

        ctx.assert_write(EVENT_LOG_SURFACE)?;
        ctx.log_info("echo", Some(ctx.payload().clone())).await?;

        Ok(json!({
            "echo": ctx.payload(),
            "step": ctx.step_key("echo"),
        }))
    }
}
