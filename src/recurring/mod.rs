//! Cron-driven recurring jobs.

pub mod cron;
pub mod manager;
pub mod scheduler;

pub use self::cron::{CronSchedule, JobTimeZone, parse_time_zone};
pub use manager::{RECURRING_JOB_ID_PARAMETER, RecurringJobManager, RecurringJobOptions};
pub use scheduler::{DEFAULT_RECURRING_POLLING_DELAY, RecurringJobScheduler};
