//! Job infrastructure: the immutable Job/Task recipe, the mutable Job
//! Run/Task Run execution state, the reliable queue, and the worker loop
//! that connects them.

pub mod builtins;
pub mod dag;
pub mod executor;
pub mod job_run;
pub mod logging;
pub mod model;
pub mod owner;
pub mod queue;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod script;
pub mod secrets;

pub use executor::{Executor, ExecutorConfig};
pub use job_run::{create_job_run, JobRun, JobRunDescriptor, JobRunStatus, TaskRun, TaskRunStatus};
pub use logging::{JobRunLogger, LogLevel, LogStream, LogType};
pub use model::{Job, ScriptConfig, ScriptLanguage, Task, TaskConfig, TaskType};
pub use queue::{QueueError, RedisQueue};
pub use registry::{default_registry, FrozenTaskRegistry, TaskError, TaskRegistry};
pub use scheduler::Scheduler;
pub use secrets::{Secret, SecretCipher, SecretError};
