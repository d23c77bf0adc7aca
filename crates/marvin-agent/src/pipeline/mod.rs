//! The per-turn orchestration pipeline.
//!
//! Stage order for one inbound message:
//!
//! 1. rate gate (`ratelimit`)
//! 2. sanitize (`marvin_core::sanitize`)
//! 3. user commands (`commands`)
//! 4. aggregation + skill routing (`aggregate`, `skill_router`)
//! 5. context build (`prompt`)
//! 6. tool loop (`tools::tool_loop`, which consults the plan interceptor,
//!    compaction and flattening)
//! 7. outgoing preparation (`outgoing`)
//! 8. dispatch (`marvin_channels::ResponseRouter`)
//!
//! `turn.rs` owns the ordering, the per-turn timeout and the feedback
//! guarantee; `history.rs` is the only module that mutates session history.

pub mod commands;
pub mod compact;
pub mod context;
pub mod flatten;
pub mod history;
pub mod outgoing;
pub mod prompt;
pub mod turn;

pub use context::{TurnAttributes, TurnContext};
pub use history::HistoryWriter;
pub use turn::TurnScheduler;
