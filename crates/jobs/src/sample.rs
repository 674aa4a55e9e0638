//! Built-in demo job.
//!
//! Walks through `steps` check-ins, `interval_ms` apart, honouring stop
//! commands and shutdown between steps. `fail: true` makes every run fail.

use std::time::Duration;

use async_trait::async_trait;
use jobservice_core::Parameters;

use crate::context::{JobContext, OpCommand, Params};
use crate::handler::{HandlerError, JobHandler, ParamError};

pub const SAMPLE_JOB: &str = "SAMPLE";

const DEFAULT_STEPS: u64 = 3;
const MAX_STEPS: u64 = 100;
const DEFAULT_INTERVAL_MS: u64 = 100;
const MAX_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Default, Clone, Copy)]
pub struct SampleJob;

impl SampleJob {
    fn steps(params: Params<'_>) -> Result<u64, ParamError> {
        Ok(params.u64("steps")?.unwrap_or(DEFAULT_STEPS))
    }

    fn interval(params: Params<'_>) -> Result<Duration, ParamError> {
        Ok(Duration::from_millis(
            params.u64("interval_ms")?.unwrap_or(DEFAULT_INTERVAL_MS),
        ))
    }

    async fn stop_requested(ctx: &dyn JobContext) -> bool {
        ctx.op_command().await == Some(OpCommand::Stop)
    }
}

#[async_trait]
impl JobHandler for SampleJob {
    fn max_fails(&self) -> u32 {
        2
    }

    fn should_retry(&self) -> bool {
        true
    }

    fn validate(&self, params: &Parameters) -> Result<(), ParamError> {
        let params = Params::new(params);
        if let Some(image) = params.str("image")? {
            if image.trim().is_empty() {
                return Err(ParamError::invalid("image", "must not be empty"));
            }
        }
        if Self::steps(params)? > MAX_STEPS {
            return Err(ParamError::invalid("steps", format!("at most {MAX_STEPS} steps")));
        }
        if Self::interval(params)? > Duration::from_millis(MAX_INTERVAL_MS) {
            return Err(ParamError::invalid(
                "interval_ms",
                format!("at most {MAX_INTERVAL_MS} ms"),
            ));
        }
        params.bool("fail")?;
        Ok(())
    }

    async fn run(&self, ctx: &dyn JobContext, params: &Parameters) -> Result<(), HandlerError> {
        let params = Params::new(params);
        let steps = Self::steps(params)?;
        let interval = Self::interval(params)?;
        let image = params.str("image")?.unwrap_or("none");
        let logger = ctx.logger();
        logger.info(format!("sample job started: image={image} steps={steps}"));

        for step in 1..=steps {
            if Self::stop_requested(ctx).await {
                logger.info(format!("stop requested at step {step}"));
                return Err(HandlerError::Stopped);
            }
            ctx.check_in(&format!("step {step}/{steps}")).await?;
            logger.debug(format!("step {step}/{steps} done"));

            tokio::select! {
                _ = ctx.system_cancellation().cancelled() => {
                    logger.warning("interrupted by system shutdown");
                    return Err(HandlerError::failed("interrupted by system shutdown"));
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }

        if Self::stop_requested(ctx).await {
            return Err(HandlerError::Stopped);
        }
        if params.bool("fail")?.unwrap_or(false) {
            logger.error("failing on request");
            return Err(HandlerError::failed("failure requested by parameters"));
        }
        logger.info("sample job finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobservice_core::JobId;
    use jobservice_observability::JobLogger;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    use crate::context::ContextError;

    struct FakeContext {
        id: JobId,
        cancel: CancellationToken,
        logger: JobLogger,
        params: Parameters,
        check_ins: Mutex<Vec<String>>,
        stop_after: Option<usize>,
    }

    impl FakeContext {
        fn new(params: serde_json::Value, stop_after: Option<usize>) -> Self {
            Self {
                id: JobId::generate(),
                cancel: CancellationToken::new(),
                logger: JobLogger::noop("test"),
                params: params.as_object().cloned().unwrap_or_default(),
                check_ins: Mutex::new(Vec::new()),
                stop_after,
            }
        }
    }

    #[async_trait]
    impl JobContext for FakeContext {
        fn job_id(&self) -> &JobId {
            &self.id
        }

        fn system_cancellation(&self) -> &CancellationToken {
            &self.cancel
        }

        async fn check_in(&self, message: &str) -> Result<(), ContextError> {
            self.check_ins.lock().unwrap().push(message.to_string());
            Ok(())
        }

        async fn op_command(&self) -> Option<OpCommand> {
            let seen = self.check_ins.lock().unwrap().len();
            match self.stop_after {
                Some(n) if seen >= n => Some(OpCommand::Stop),
                _ => None,
            }
        }

        fn logger(&self) -> &JobLogger {
            &self.logger
        }

        fn params(&self) -> Params<'_> {
            Params::new(&self.params)
        }
    }

    #[tokio::test]
    async fn runs_all_steps_and_succeeds() {
        let ctx = FakeContext::new(json!({"steps": 3, "interval_ms": 1}), None);
        SampleJob.run(&ctx, &ctx.params).await.unwrap();
        assert_eq!(
            *ctx.check_ins.lock().unwrap(),
            vec!["step 1/3", "step 2/3", "step 3/3"]
        );
    }

    #[tokio::test]
    async fn stop_command_yields_stopped() {
        let ctx = FakeContext::new(json!({"steps": 5, "interval_ms": 1}), Some(2));
        let err = SampleJob.run(&ctx, &ctx.params).await.unwrap_err();
        assert!(err.is_stopped());
        assert_eq!(ctx.check_ins.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_run() {
        let ctx = FakeContext::new(json!({"steps": 5, "interval_ms": 10_000}), None);
        ctx.cancel.cancel();
        let err = SampleJob.run(&ctx, &ctx.params).await.unwrap_err();
        assert!(matches!(err, HandlerError::Failed(_)));
    }

    #[tokio::test]
    async fn fail_flag_fails_after_steps() {
        let ctx = FakeContext::new(json!({"steps": 1, "interval_ms": 1, "fail": true}), None);
        assert!(matches!(
            SampleJob.run(&ctx, &ctx.params).await,
            Err(HandlerError::Failed(_))
        ));
    }

    #[test]
    fn validation_limits() {
        let job = SampleJob;
        assert!(job.validate(json!({}).as_object().unwrap()).is_ok());
        assert!(job.validate(json!({"image": ""}).as_object().unwrap()).is_err());
        assert!(job.validate(json!({"steps": 1000}).as_object().unwrap()).is_err());
        assert!(job.validate(json!({"fail": "yes"}).as_object().unwrap()).is_err());
    }
}
