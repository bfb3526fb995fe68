use crate::error::{Error, Result};

/// What the allocators do when an operation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Return the error to the caller.
    #[default]
    Propagate,
    /// Log the error and abort the process.
    Abort,
}

impl FailurePolicy {
    /// Routes a failure according to the policy.
    ///
    /// Under [`FailurePolicy::Abort`] this never returns.
    pub fn fail<T>(self, err: Error) -> Result<T> {
        match self {
            FailurePolicy::Propagate => {
                tracing::warn!(error = %err, "allocator failure");
                Err(err)
            }
            FailurePolicy::Abort => {
                tracing::error!(error = %err, "allocator failure, aborting");
                std::process::abort()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub failure_policy: FailurePolicy,
    pub validate_headers: bool,
    pub thread_heap_reserve: usize,
    pub thread_heap_initial_commit: usize,
    pub thread_heap_commit_step: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            validate_headers: cfg!(debug_assertions),
            thread_heap_reserve: 1024 * 1024 * 1024,
            thread_heap_initial_commit: 4 * 1024 * 1024,
            thread_heap_commit_step: 1024 * 1024,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.thread_heap_reserve == 0 {
            return Err(Error::config("thread_heap_reserve must be > 0"));
        }

        if self.thread_heap_initial_commit > self.thread_heap_reserve {
            return Err(Error::config(
                "thread_heap_initial_commit must not exceed thread_heap_reserve",
            ));
        }

        if self.thread_heap_commit_step == 0 {
            return Err(Error::config("thread_heap_commit_step must be > 0"));
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.failure_policy = policy;
        self
    }

    pub fn validate_headers(mut self, validate: bool) -> Self {
        self.config.validate_headers = validate;
        self
    }

    pub fn thread_heap_reserve(mut self, bytes: usize) -> Self {
        self.config.thread_heap_reserve = bytes;
        self
    }

    pub fn thread_heap_initial_commit(mut self, bytes: usize) -> Self {
        self.config.thread_heap_initial_commit = bytes;
        self
    }

    pub fn thread_heap_commit_step(mut self, bytes: usize) -> Self {
        self.config.thread_heap_commit_step = bytes;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
