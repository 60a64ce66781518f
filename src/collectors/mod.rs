//! Rule expansion and task collection.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        RuleSet + RemovalPolicy          │
//! ├─────────────────────────────────────────┤
//! │             TaskExpander                │
//! │  ┌──────────┬───────────┬───────────┐   │
//! │  │ wildcard │ pre-cmds  │ families  │   │
//! │  └──────────┴───────────┴───────────┘   │
//! ├─────────────────────────────────────────┤
//! │      Collector (bounded parallel)       │
//! │  ┌──────────┬───────────┬───────────┐   │
//! │  │  files   │ commands  │  filters  │   │
//! │  └──────────┴───────────┴───────────┘   │
//! ├─────────────────────────────────────────┤
//! │          ArchiveEntry values            │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Usage Example
//!
//! ```no_run
//! use insights_agent::collectors::collector::{collect_tasks_parallel, Collector, TaskCollector};
//! use insights_agent::collectors::expander::{TargetContext, TaskExpander};
//! use insights_agent::config::{RemovalPolicy, RuleSet};
//! use insights_agent::models::Target;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn example(rules: RuleSet) -> anyhow::Result<()> {
//! let host = Target::host("web01");
//! let ctx = TargetContext::new(&host, Path::new("/"));
//! let tasks = TaskExpander::default().expand(&rules, &RemovalPolicy::default(), &ctx);
//!
//! let collector: Arc<dyn TaskCollector> = Arc::new(Collector::default());
//! let entries = collect_tasks_parallel(collector, tasks).await;
//! println!("Collected {} entries", entries.len());
//! # Ok(())
//! # }
//! ```

/// Task execution: files, commands, timeouts and the parallel driver
pub mod collector;

/// Rule expansion into concrete tasks
pub mod expander;

/// Archive names derived from command lines
pub mod mangle;

/// Line normalization and include/exclude filtering
pub mod pipeline;

/// One target from mount to staged archive
pub mod session;

/// Command families expanded against the live system
pub mod special;
