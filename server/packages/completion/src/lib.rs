//! OpenAI-compatible chat completion client.

pub mod client;
pub mod types;

pub use client::{ChunkStream, CompletionClient, CompletionError};
pub use types::{
    ChatMessage, ChatRequest, CompletionChunk, ContentPart, FunctionDefinition, ImageUrl,
    MessageContent, ToolCallFragment, ToolDefinition,
};
