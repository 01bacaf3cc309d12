//! JSON shapes exchanged with the native debugger.
//!
//! Field names follow the native debugger's API (a mix of camelCase and exported
//! Go-style names such as `Cond`), which is why most fields carry explicit renames.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeBreakpoint {
    #[serde(default)]
    pub id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: i64,
    #[serde(rename = "functionName", default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(rename = "Cond", default, skip_serializing_if = "String::is_empty")]
    pub cond: String,
    #[serde(rename = "HitCond", default, skip_serializing_if = "String::is_empty")]
    pub hit_cond: String,
    #[serde(rename = "totalHitCount", default)]
    pub total_hit_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeThread {
    pub id: i64,
    #[serde(default)]
    pub pc: u64,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<Function>,
    #[serde(rename = "goroutineID", default)]
    pub goroutine_id: i64,
    #[serde(rename = "breakPoint", default, skip_serializing_if = "Option::is_none")]
    pub breakpoint: Option<NativeBreakpoint>,
}

impl NativeThread {
    pub fn function_name(&self) -> Option<&str> {
        self.function.as_ref().map(|f| f.name.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebuggerState {
    #[serde(rename = "Running", default)]
    pub running: bool,
    #[serde(rename = "currentThread", default, skip_serializing_if = "Option::is_none")]
    pub current_thread: Option<NativeThread>,
    #[serde(rename = "Threads", default)]
    pub threads: Vec<NativeThread>,
    #[serde(default)]
    pub exited: bool,
    #[serde(rename = "exitStatus", default)]
    pub exit_status: i64,
}

impl DebuggerState {
    /// The breakpoint the current thread is stopped at, if any.
    pub fn hit_breakpoint(&self) -> Option<&NativeBreakpoint> {
        self.current_thread
            .as_ref()
            .and_then(|thread| thread.breakpoint.as_ref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeFrame {
    #[serde(default)]
    pub pc: u64,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<Function>,
}

impl NativeFrame {
    pub fn function_name(&self) -> Option<&str> {
        self.function.as_ref().map(|f| f.name.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeVariable {
    pub name: String,
    #[serde(rename = "type", default)]
    pub type_name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub len: i64,
    #[serde(default)]
    pub children: Vec<NativeVariable>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unreadable: String,
}

impl NativeVariable {
    pub fn has_children(&self) -> bool {
        !self.children.is_empty() || self.len > 0
    }

    pub fn child(&self, name: &str) -> Option<&NativeVariable> {
        self.children.iter().find(|child| child.name == name)
    }
}

/// Which goroutine/frame an introspection request applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalScope {
    #[serde(rename = "GoroutineID")]
    pub goroutine_id: i64,
    #[serde(rename = "Frame")]
    pub frame: i64,
}

/// How much of a variable graph the native debugger loads per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadConfig {
    #[serde(rename = "FollowPointers")]
    pub follow_pointers: bool,
    #[serde(rename = "MaxVariableRecurse")]
    pub max_variable_recurse: i64,
    #[serde(rename = "MaxStringLen")]
    pub max_string_len: i64,
    #[serde(rename = "MaxArrayValues")]
    pub max_array_values: i64,
    #[serde(rename = "MaxStructFields")]
    pub max_struct_fields: i64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            follow_pointers: true,
            max_variable_recurse: 1,
            max_string_len: 256,
            max_array_values: 64,
            max_struct_fields: -1,
        }
    }
}

// Request/response envelopes of the individual RPC methods.

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CreateBreakpointIn {
    #[serde(rename = "Breakpoint")]
    pub breakpoint: NativeBreakpoint,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct BreakpointOut {
    #[serde(rename = "Breakpoint")]
    pub breakpoint: NativeBreakpoint,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ClearBreakpointIn {
    #[serde(rename = "Id")]
    pub id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CommandIn {
    pub name: String,
    #[serde(rename = "goroutineID", default, skip_serializing_if = "Option::is_none")]
    pub goroutine_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CommandOut {
    #[serde(rename = "State")]
    pub state: DebuggerState,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ListThreadsOut {
    #[serde(rename = "Threads", default)]
    pub threads: Vec<NativeThread>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StacktraceIn {
    #[serde(rename = "Id")]
    pub id: i64,
    #[serde(rename = "Depth")]
    pub depth: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StacktraceOut {
    #[serde(rename = "Locations", default)]
    pub locations: Vec<NativeFrame>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ListLocalVarsIn {
    #[serde(rename = "Scope")]
    pub scope: EvalScope,
    #[serde(rename = "Cfg")]
    pub cfg: LoadConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ListLocalVarsOut {
    #[serde(rename = "Variables", default)]
    pub variables: Vec<NativeVariable>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct EvalIn {
    #[serde(rename = "Scope")]
    pub scope: EvalScope,
    #[serde(rename = "Expr")]
    pub expr: String,
    #[serde(rename = "Cfg")]
    pub cfg: LoadConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct EvalOut {
    #[serde(rename = "Variable")]
    pub variable: NativeVariable,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DetachIn {
    #[serde(rename = "Kill")]
    pub kill: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_stopped_state_with_breakpoint() {
        let json = r#"{
            "Running": false,
            "currentThread": {
                "id": 7, "pc": 4242, "file": "/w/main.go", "line": 30,
                "function": {"name": "main.main"}, "goroutineID": 1,
                "breakPoint": {"id": 3, "file": "/w/main.go", "line": 30, "Cond": "x > 1"}
            },
            "Threads": [],
            "exited": false,
            "exitStatus": 0
        }"#;
        let state: DebuggerState = serde_json::from_str(json).unwrap();
        let thread = state.current_thread.as_ref().unwrap();
        assert_eq!(thread.goroutine_id, 1);
        assert_eq!(thread.function_name(), Some("main.main"));
        let bp = state.hit_breakpoint().unwrap();
        assert_eq!(bp.id, 3);
        assert_eq!(bp.cond, "x > 1");
    }

    #[test]
    fn breakpoint_request_omits_empty_conditions() {
        let bp = NativeBreakpoint {
            file: "/w/main.go".to_string(),
            line: 12,
            ..NativeBreakpoint::default()
        };
        let value = serde_json::to_value(&bp).unwrap();
        assert!(value.get("Cond").is_none());
        assert!(value.get("HitCond").is_none());
        assert_eq!(value["line"], 12);
    }
}
