//! `taskbridge`: an asynchronous job-dispatch and event-streaming layer
//! sitting between an OpenAI-compatible HTTP facade and a synchronous
//! agent-execution backend.
//!
//! Five collaborating pieces, leaves first: [`broker`] (the key/value +
//! pub/sub abstraction), [`queue`] (typed job/event operations),
//! [`watchdog`] (stale-job sweep), [`worker`] (the dequeue-execute-publish
//! loop), and [`proxy`] (the SSE/blocking HTTP fan-in). [`config`] and
//! [`error`] are the ambient stack shared by all five.

pub mod broker;
pub mod config;
pub mod error;
pub mod proxy;
pub mod queue;
pub mod watchdog;
pub mod worker;
