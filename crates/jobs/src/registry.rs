//! Job name to handler factory mapping.
//!
//! Populated once during bootstrap through [`JobRegistryBuilder`]; the built
//! [`JobRegistry`] is immutable and shared read-only by every worker.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use jobservice_core::Parameters;
use thiserror::Error;

use crate::handler::{JobHandler, ParamError};

type Factory = Arc<dyn Fn() -> Box<dyn JobHandler> + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("job name must not be empty")]
    EmptyName,

    #[error("job '{0}' is already registered")]
    Duplicate(String),
}

/// Everything the service needs to know about one job type.
#[derive(Clone)]
pub struct JobDescriptor {
    name: String,
    max_fails: u32,
    should_retry: bool,
    factory: Factory,
}

impl fmt::Debug for JobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDescriptor")
            .field("name", &self.name)
            .field("max_fails", &self.max_fails)
            .field("should_retry", &self.should_retry)
            .finish()
    }
}

impl JobDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_fails(&self) -> u32 {
        self.max_fails
    }

    pub fn should_retry(&self) -> bool {
        self.should_retry
    }

    /// A fresh handler instance for one execution.
    pub fn create(&self) -> Box<dyn JobHandler> {
        (self.factory)()
    }

    pub fn validate(&self, params: &Parameters) -> Result<(), ParamError> {
        self.create().validate(params)
    }
}

#[derive(Default)]
pub struct JobRegistryBuilder {
    jobs: HashMap<String, JobDescriptor>,
}

impl JobRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: impl Into<String>, factory: F) -> Result<Self, RegistryError>
    where
        F: Fn() -> Box<dyn JobHandler> + Send + Sync + 'static,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.jobs.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        let probe = factory();
        let descriptor = JobDescriptor {
            name: name.clone(),
            max_fails: probe.max_fails(),
            should_retry: probe.should_retry(),
            factory: Arc::new(factory),
        };
        self.jobs.insert(name, descriptor);
        Ok(self)
    }

    /// Register a handler type that can be built with `Default`.
    pub fn register_default<H>(self, name: impl Into<String>) -> Result<Self, RegistryError>
    where
        H: JobHandler + Default,
    {
        self.register(name, || Box::new(H::default()) as Box<dyn JobHandler>)
    }

    pub fn build(self) -> JobRegistry {
        JobRegistry { jobs: self.jobs }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, JobDescriptor>,
}

impl JobRegistry {
    pub fn builder() -> JobRegistryBuilder {
        JobRegistryBuilder::new()
    }

    /// Look up a job type by name.
    pub fn is_known(&self, name: &str) -> Option<&JobDescriptor> {
        self.jobs.get(name)
    }

    pub fn validate_parameters(
        &self,
        descriptor: &JobDescriptor,
        params: &Parameters,
    ) -> Result<(), ParamError> {
        descriptor.validate(params)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{SAMPLE_JOB, SampleJob};
    use serde_json::json;

    #[test]
    fn registered_job_is_known_with_its_policy() {
        let registry = JobRegistry::builder()
            .register_default::<SampleJob>(SAMPLE_JOB)
            .unwrap()
            .build();

        let descriptor = registry.is_known(SAMPLE_JOB).unwrap();
        assert_eq!(descriptor.max_fails(), SampleJob::default().max_fails());
        assert!(descriptor.should_retry());
        assert!(registry.is_known("UNKNOWN").is_none());
        assert_eq!(registry.names(), vec![SAMPLE_JOB.to_string()]);
    }

    #[test]
    fn duplicate_and_empty_names_are_refused() {
        let builder = JobRegistry::builder()
            .register_default::<SampleJob>(SAMPLE_JOB)
            .unwrap();
        assert_eq!(
            builder.register_default::<SampleJob>(SAMPLE_JOB).err(),
            Some(RegistryError::Duplicate(SAMPLE_JOB.to_string()))
        );
        assert_eq!(
            JobRegistry::builder().register_default::<SampleJob>(" ").err(),
            Some(RegistryError::EmptyName)
        );
    }

    #[test]
    fn parameters_are_validated_by_the_handler() {
        let registry = JobRegistry::builder()
            .register_default::<SampleJob>(SAMPLE_JOB)
            .unwrap()
            .build();
        let descriptor = registry.is_known(SAMPLE_JOB).unwrap();

        let ok = json!({"image": "demo/x:v1"});
        assert!(registry.validate_parameters(descriptor, ok.as_object().unwrap()).is_ok());

        let bad = json!({"image": 42});
        assert!(registry.validate_parameters(descriptor, bad.as_object().unwrap()).is_err());
    }
}
