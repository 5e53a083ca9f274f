// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod compact;
mod events;
mod session;
mod turn;

pub use agent::{Agent, AgentOptions};
pub use compact::{generate_summary, is_overflow, CONTINUE_PROMPT, SUMMARY_PROMPT};
pub use events::AgentEvent;
pub use session::{
    EntryMeta, Session, SessionEntry, SessionHeader, SessionInfo, CURRENT_VERSION,
};
pub use turn::{run_single_turn, TurnOutcome, TurnRequest};
