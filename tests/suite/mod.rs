mod openai_client;
mod session_flow;
