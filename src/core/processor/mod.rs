//! Turn processor module.
//!
//! The turn processor is the opaque speech/reasoning pipeline the scheduler
//! drives. It is defined as a narrow trait so production pipelines and
//! deterministic test fakes plug in the same way.
//!
//! # Architecture
//!
//! - `TurnProcessor` trait for the per-connection pipeline
//! - `ProcessorFactory` for creating one processor per connection
//! - `TurnEventSink` as the only channel a running turn uses to report results
//!
//! # Example
//!
//! ```rust,ignore
//! use parley_gateway::core::processor::{LoopbackConfig, LoopbackFactory, ProcessorFactory};
//!
//! let factory = LoopbackFactory::new(LoopbackConfig::default());
//! let processor = factory.create(&session)?;
//! processor.start_stream().await?;
//! ```

mod base;
pub mod loopback;

pub use base::{
    AudioFrame, ProcessorError, ProcessorFactory, ProcessorResult, Script, ScriptedTurnRequest,
    SharedProcessor, TurnEvent, TurnEventSink, TurnOutcome, TurnPayload, TurnProcessor,
    UserTurnRequest,
};
pub use loopback::{LoopbackConfig, LoopbackFactory, LoopbackProcessor};
