//! Deal orchestration services
//!
//! Asynchronous layer over the pure `exportdesk-core` domain and the `exportdesk-db`
//! repositories:
//! - `JourneyService` applies deal journey transitions with a version check and audit trail
//! - `AgentEventBus` publishes events and owns the claimable task queue
//! - `WorkflowEngine` drives catalog workflows step by step from task completions
//! - `AgentRuntime` runs in-process agents against the bus
//!
//! # Safety Principle
//!
//! Negotiator drafts pass through the `NegotiationGuard` before they are marked sendable.
//! A `block` verdict replaces the draft; it is never merely logged.

pub mod agents;
pub mod bus;
pub mod guardrails;
pub mod journey;
pub mod realtime;
pub mod runtime;
pub mod workflow;

pub use agents::{Agent, AgentRegistry};
pub use bus::{handler_fn, AgentEventBus, EventHandler, SubscriptionHandle, ALL_EVENTS};
pub use guardrails::{DraftDisposition, GuardedDraft, GuardedNegotiator, NegotiationGuard};
pub use journey::JourneyService;
pub use realtime::{BroadcastRealtimeChannel, NoopRealtimeChannel, RealtimeChannel, RealtimeError};
pub use runtime::{AgentRuntime, RunSummary};
pub use workflow::WorkflowEngine;
