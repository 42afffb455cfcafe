//! Ports: contracts for external collaborators consumed by the engine.

pub mod llm_client;
pub mod message_channel;
pub mod process_runner;
pub mod tool_registry;

pub use llm_client::{ChatMessage, LlmClient, NullLlm, PromptOptions, ScriptedLlm};
pub use message_channel::{BufferedChannel, MessageChannel};
pub use process_runner::{
    BoundedLineBuffer, OutputLine, OutputSink, OutputStream, ProcessOutput, ProcessRequest,
    ProcessRunner,
};
pub use tool_registry::{
    global_registry, set_global_registry, ToolDescriptor, ToolOutcome, ToolRegistry,
};
