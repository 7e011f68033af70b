//! Background Job Scheduler
//!
//! Drives the periodic maintenance jobs (counter flush, expiration reap,
//! stale-viewer cleanup):
//!
//! ```text
//!   register(id, interval, task)
//!            │
//!            ▼
//!   ┌──────────────────┐   tick    ┌───────────────────────────┐
//!   │  job loop (tokio) │ ───────▶ │ running CAS ─▶ catch_unwind │
//!   └──────────────────┘           │ record runs/failures/error │
//!            ▲                      └───────────────────────────┘
//!            │ cancel                          ▲
//!   stop() ──┘                      run_now() ─┘ (same flag)
//! ```
//!
//! A failed or panicking invocation is logged and recorded in
//! [`JobStatus`]; the job stays registered and keeps its schedule.

mod job;
mod runner;
mod task;

pub use job::JobStatus;
pub use runner::Scheduler;
pub use task::{FnTask, ScheduledTask};
