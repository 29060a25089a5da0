//! Built-in desktop tool descriptions

use serde_json::json;

use super::{ToolCategory, ToolSpec};

/// Tools that only read local state or the network. Steps using them may be
/// run concurrently with one another.
pub const PARALLEL_SAFE_TOOLS: &[&str] = &[
    "web_search",
    "fetch_url",
    "get_current_time",
    "get_system_info",
    "read_file",
    "list_directory",
    "search_files",
];

/// Tools that run arbitrary code and need explicit permission
pub const CODE_EXECUTION_TOOLS: &[&str] = &["execute_command", "execute_python", "execute_javascript"];

/// Tools that write, move, copy, create or delete. Every path argument they
/// take is checked against reserved system paths.
pub const MUTATING_FILE_TOOLS: &[&str] = &[
    "write_file",
    "append_file",
    "delete_file",
    "move_file",
    "copy_file",
    "create_directory",
];

/// Tools that take a filesystem path and can conflict with each other
pub const FILESYSTEM_TOOLS: &[&str] = &[
    "read_file",
    "write_file",
    "append_file",
    "delete_file",
    "move_file",
    "copy_file",
    "create_directory",
    "list_directory",
    "search_files",
];

fn path_schema(extra: serde_json::Value) -> serde_json::Value {
    let mut schema = json!({
        "type": "object",
        "properties": {
            "path": { "type": "string", "minLength": 1 }
        },
        "required": ["path"]
    });
    if let Some(extra) = extra.as_object() {
        for (key, value) in extra {
            schema["properties"][key.as_str()] = value.clone();
        }
    }
    schema
}

fn code_schema(field: &str) -> serde_json::Value {
    let mut schema = json!({
        "type": "object",
        "properties": {
            "timeout_ms": { "type": "integer", "minimum": 0 }
        },
        "required": [field]
    });
    schema["properties"][field] = json!({ "type": "string", "minLength": 1 });
    schema
}

pub fn default_tools() -> Vec<ToolSpec> {
    vec![
        // Filesystem
        ToolSpec::new(
            "read_file",
            "Read a text file and return its contents",
            ToolCategory::Filesystem,
            path_schema(json!({})),
        ),
        ToolSpec::new(
            "write_file",
            "Create or overwrite a file with the given content",
            ToolCategory::Filesystem,
            {
                let mut schema = path_schema(json!({ "content": { "type": "string" } }));
                schema["required"] = json!(["path", "content"]);
                schema
            },
        ),
        ToolSpec::new(
            "append_file",
            "Append content to the end of a file",
            ToolCategory::Filesystem,
            {
                let mut schema = path_schema(json!({ "content": { "type": "string" } }));
                schema["required"] = json!(["path", "content"]);
                schema
            },
        ),
        ToolSpec::new(
            "delete_file",
            "Delete a file",
            ToolCategory::Filesystem,
            path_schema(json!({})),
        ),
        ToolSpec::new(
            "move_file",
            "Move or rename a file",
            ToolCategory::Filesystem,
            json!({
                "type": "object",
                "properties": {
                    "source": { "type": "string", "minLength": 1 },
                    "target": { "type": "string", "minLength": 1 }
                },
                "required": ["source", "target"]
            }),
        ),
        ToolSpec::new(
            "copy_file",
            "Copy a file to a new location",
            ToolCategory::Filesystem,
            json!({
                "type": "object",
                "properties": {
                    "source": { "type": "string", "minLength": 1 },
                    "target": { "type": "string", "minLength": 1 }
                },
                "required": ["source", "target"]
            }),
        ),
        ToolSpec::new(
            "create_directory",
            "Create a directory and any missing parents",
            ToolCategory::Filesystem,
            path_schema(json!({})),
        ),
        ToolSpec::new(
            "list_directory",
            "List the entries of a directory",
            ToolCategory::Filesystem,
            path_schema(json!({ "recursive": { "type": "boolean" } })),
        ),
        ToolSpec::new(
            "search_files",
            "Find files under a directory whose name or content matches a pattern",
            ToolCategory::Filesystem,
            {
                let mut schema = path_schema(json!({ "pattern": { "type": "string", "minLength": 1 } }));
                schema["required"] = json!(["path", "pattern"]);
                schema
            },
        ),
        // Web
        ToolSpec::new(
            "web_search",
            "Search the web and return the top results",
            ToolCategory::Web,
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "minLength": 1 },
                    "max_results": { "type": "integer", "minimum": 1, "maximum": 50 }
                },
                "required": ["query"]
            }),
        ),
        ToolSpec::new(
            "fetch_url",
            "Download a web page and return its text",
            ToolCategory::Web,
            json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "pattern": "^https?://" }
                },
                "required": ["url"]
            }),
        ),
        // System
        ToolSpec::new(
            "get_current_time",
            "Current local date and time",
            ToolCategory::System,
            json!({
                "type": "object",
                "properties": {
                    "timezone": { "type": "string" }
                }
            }),
        ),
        ToolSpec::new(
            "get_system_info",
            "Operating system, CPU, memory and disk information",
            ToolCategory::System,
            json!({ "type": "object" }),
        ),
        ToolSpec::new(
            "set_env_var",
            "Set an environment variable for subsequent commands",
            ToolCategory::System,
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "pattern": "^[A-Za-z_][A-Za-z0-9_]*$" },
                    "value": { "type": "string" }
                },
                "required": ["name", "value"]
            }),
        ),
        ToolSpec::new(
            "open_application",
            "Launch a desktop application by name",
            ToolCategory::System,
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "minLength": 1 }
                },
                "required": ["name"]
            }),
        ),
        // Code execution
        ToolSpec::new(
            "execute_command",
            "Run a shell command",
            ToolCategory::CodeExecution,
            code_schema("command"),
        ),
        ToolSpec::new(
            "execute_python",
            "Run a Python snippet",
            ToolCategory::CodeExecution,
            code_schema("code"),
        ),
        ToolSpec::new(
            "execute_javascript",
            "Run a JavaScript snippet",
            ToolCategory::CodeExecution,
            code_schema("code"),
        ),
    ]
}

pub fn is_parallel_safe(tool: &str) -> bool {
    PARALLEL_SAFE_TOOLS.contains(&tool)
}

pub fn is_code_execution(tool: &str) -> bool {
    CODE_EXECUTION_TOOLS.contains(&tool)
}

pub fn is_filesystem(tool: &str) -> bool {
    FILESYSTEM_TOOLS.contains(&tool)
}
