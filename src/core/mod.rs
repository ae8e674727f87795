pub mod processor;
pub mod session;
pub mod turn;

// Re-export commonly used types for convenience
pub use processor::{
    AudioFrame, LoopbackConfig, LoopbackFactory, LoopbackProcessor, ProcessorError,
    ProcessorFactory, ProcessorResult, Script, ScriptedTurnRequest, SharedProcessor, TurnEvent,
    TurnEventSink, TurnOutcome, TurnPayload, TurnProcessor, UserTurnRequest,
};

pub use session::{
    ContentContext, DirectoryError, DirectoryResult, InMemorySessionDirectory, LaunchMode, Session,
    SessionDirectory,
};

pub use turn::{
    ClientMessage, ErrorCode, Inbound, MessageRoute, SchedulerExit, SchedulerSettings,
    ServerMessage, TurnScheduler,
};
