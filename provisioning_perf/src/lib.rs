//! Pull-latency harness for the Provisioning API
//!
//! A [`Consumer`][consumer::Consumer] drains a subscription one message at a time, timing every
//! fetch and acknowledge, and stops once it has received its target, the queue stays empty for
//! too long, a call fails in fail-fast mode, or it is cancelled.
pub mod consumer;
pub mod fixtures;
pub mod idle;
pub mod latency;
pub mod queue;
