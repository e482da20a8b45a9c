// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Fixed prompt and directive texts used by the loop.

use serde_json::{json, Value};

/// Name of the synthetic tool that carries a structured final answer.
pub const STRUCTURED_OUTPUT_TOOL: &str = "StructuredOutput";

pub const STRUCTURED_OUTPUT_DESCRIPTION: &str = "Use this tool to return your final response in the requested structured format.

IMPORTANT:
- You MUST call this tool exactly once at the end of your response
- The input must be valid JSON matching the required schema
- Complete all necessary research and tool calls BEFORE calling this tool
- This tool provides your final answer - no further actions are taken after calling it";

pub const STRUCTURED_OUTPUT_SYSTEM_PROMPT: &str = "IMPORTANT: The user has requested structured output. You MUST use the StructuredOutput tool to provide your final response. Do NOT respond with plain text - you MUST call the StructuredOutput tool with your answer formatted according to the schema.";

pub const STRUCTURED_OUTPUT_RETRY_NUDGE: &str = "You responded with plain text, but structured output was requested. Call the StructuredOutput tool now with your final answer formatted according to the schema.";

/// System prompt for the compaction step.
pub const COMPACTION_PROMPT: &str = "You are summarizing this conversation so it can continue in a smaller context window. Write a summary that covers: the user's goals, what has been done so far (including files read or changed and commands run), important decisions and their reasons, and what remains to be done. Be specific about identifiers, paths and values that later steps will need. Respond with the summary only.";

/// Terminal text written when the step budget runs out.
pub const MAX_STEPS_TEXT: &str = "Max iterations reached";

/// Directive injected after a user `agent` part so the primary agent
/// delegates through the task tool.
pub fn subtask_directive(agent: &str) -> String {
    format!(
        "Use the above message and context to generate a prompt and call the task tool with subagent: {agent}"
    )
}

/// Synthetic user text carrying a tool's result into the next model call.
pub fn tool_result_text(tool: &str, content: &str) -> String {
    format!("Tool {tool} result: {content}")
}

/// Synthetic text recording a file part expansion as a Read invocation.
pub fn file_read_text(file_path: &str) -> String {
    format!("Called the Read tool with the following input: {{\"filePath\":\"{file_path}\"}}")
}

/// Model-facing schema for the structured output tool.
pub fn structured_output_schema(schema: &Value) -> Value {
    json!({
        "name": STRUCTURED_OUTPUT_TOOL,
        "description": STRUCTURED_OUTPUT_DESCRIPTION,
        "inputSchema": schema,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtask_directive_names_the_agent() {
        assert!(subtask_directive("review").ends_with("subagent: review"));
    }

    #[test]
    fn structured_schema_embeds_user_schema() {
        let schema = json!({"type": "object", "properties": {"answer": {"type": "string"}}});
        let v = structured_output_schema(&schema);
        assert_eq!(v["name"], STRUCTURED_OUTPUT_TOOL);
        assert_eq!(v["inputSchema"]["properties"]["answer"]["type"], "string");
    }

    #[test]
    fn file_read_text_is_valid_json_payload() {
        let text = file_read_text("/tmp/x");
        let start = text.find('{').unwrap();
        let v: Value = serde_json::from_str(&text[start..]).unwrap();
        assert_eq!(v["filePath"], "/tmp/x");
    }
}
