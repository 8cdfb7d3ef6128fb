use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use async_trait::async_trait;
use serde_json::Value;

use crate::{QueueResult, QueueError, Job, JobError, JobRecord, worker::Processor};

/// Type-erased handler for one job type
#[async_trait]
pub trait JobHandler<C>: Send + Sync {
    /// Decode `payload` and run the job with `ctx`
    async fn execute(&self, payload: &Value, ctx: C) -> Result<(), JobError>;

    fn job_type(&self) -> &'static str;
}

struct TypedHandler<J: Job> {
    _job: PhantomData<fn() -> J>,
}

#[async_trait]
impl<J: Job> JobHandler<J::Context> for TypedHandler<J> {
    async fn execute(&self, payload: &Value, ctx: J::Context) -> Result<(), JobError> {
        // A payload that does not decode will never decode
        let job: J = serde_json::from_value(payload.clone())?;
        job.execute(ctx).await
    }

    fn job_type(&self) -> &'static str {
        J::JOB_TYPE
    }
}

/// Dispatches jobs of one queue to typed handlers by `job_type`.
///
/// A router is a [`Processor`], so it plugs straight into
/// [`QueueRegistry::process_queue`](crate::QueueRegistry::process_queue).
pub struct JobRouter<C> {
    context: C,
    handlers: HashMap<&'static str, Arc<dyn JobHandler<C>>>,
}

impl<C: Clone + Send + Sync + 'static> JobRouter<C> {
    pub fn new(context: C) -> Self {
        Self {
            context,
            handlers: HashMap::new(),
        }
    }

    /// Register a job type; each type may be registered once
    pub fn register<J: Job<Context = C>>(&mut self) -> QueueResult<()> {
        if self.handlers.contains_key(J::JOB_TYPE) {
            return Err(QueueError::InvalidConfig(format!("job type '{}' already registered", J::JOB_TYPE)));
        }

        let handler: Arc<dyn JobHandler<C>> = Arc::new(TypedHandler::<J> { _job: PhantomData });
        self.handlers.insert(J::JOB_TYPE, handler);
        Ok(())
    }

    /// Builder form of [`register`](Self::register)
    pub fn with<J: Job<Context = C>>(mut self) -> QueueResult<Self> {
        self.register::<J>()?;
        Ok(self)
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }
}

#[async_trait]
impl<C: Clone + Send + Sync + 'static> Processor for JobRouter<C> {
    async fn process(&self, job: JobRecord) -> Result<(), JobError> {
        let handler = self
            .handlers
            .get(job.job_type.as_str())
            .ok_or_else(|| JobError::permanent(format!("unknown job type: {}", job.job_type)))?;

        handler.execute(&job.payload, self.context.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BackoffPolicy, JobId, JobOptions, JobPriority};
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    type Sent = Arc<Mutex<Vec<String>>>;

    #[derive(Serialize, Deserialize)]
    struct SendEmail {
        to: String,
        template: String,
    }

    #[async_trait]
    impl Job for SendEmail {
        type Context = Sent;

        const JOB_TYPE: &'static str = "send_email";
        const QUEUE: &'static str = "email";
        const PRIORITY: JobPriority = JobPriority::High;

        async fn execute(&self, ctx: Self::Context) -> Result<(), JobError> {
            if self.to.is_empty() {
                return Err(JobError::permanent("missing recipient"));
            }
            ctx.lock().push(format!("{}:{}", self.template, self.to));
            Ok(())
        }
    }

    fn record(job_type: &str, payload: Value) -> JobRecord {
        JobRecord::new(
            JobId::from("9"),
            "email",
            job_type,
            payload,
            &JobOptions::new(),
            5,
            BackoffPolicy::exponential(3000),
        )
    }

    #[tokio::test]
    async fn dispatches_by_job_type() {
        let sent = Sent::default();
        let router = JobRouter::new(sent.clone()).with::<SendEmail>().unwrap();
        assert_eq!(router.registered_types(), vec!["send_email"]);

        router
            .process(record("send_email", json!({"to": "cook@example.com", "template": "welcome"})))
            .await
            .unwrap();

        assert_eq!(*sent.lock(), vec!["welcome:cook@example.com".to_string()]);
    }

    #[tokio::test]
    async fn unknown_type_and_bad_payload_are_permanent() {
        let router = JobRouter::new(Sent::default()).with::<SendEmail>().unwrap();

        let unknown = router.process(record("send_sms", json!({}))).await.unwrap_err();
        assert!(!unknown.is_retryable());

        let malformed = router.process(record("send_email", json!({"to": 42}))).await.unwrap_err();
        assert!(!malformed.is_retryable());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut router = JobRouter::new(Sent::default());
        router.register::<SendEmail>().unwrap();
        assert!(matches!(router.register::<SendEmail>(), Err(QueueError::InvalidConfig(_))));
    }

    #[test]
    fn default_options_carry_priority() {
        let job = SendEmail { to: "a@b.c".into(), template: "reset".into() };
        assert_eq!(job.options().priority, JobPriority::High);
    }
}
