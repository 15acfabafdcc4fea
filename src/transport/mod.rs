pub mod llm;
pub mod ollama;
pub mod ws;
