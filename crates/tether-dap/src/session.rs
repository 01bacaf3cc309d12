//! Per-connection debug session state.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use parking_lot::RwLock;

use crate::catalog::CatalogEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Listening,
    Initialized,
    Launched,
    Running,
    Stepping,
    Stopped,
    Disconnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Listening => "listening",
            SessionState::Initialized => "initialized",
            SessionState::Launched => "launched",
            SessionState::Running => "running",
            SessionState::Stepping => "stepping",
            SessionState::Stopped => "stopped",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// A stack frame handed out to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRef {
    pub goroutine: i64,
    /// Position of the frame in the native stack, innermost = 0.
    pub index: i64,
    pub generated_file: String,
    pub generated_line: i64,
}

/// What a `variablesReference` expands to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableRef {
    /// All locals of a frame.
    Locals { goroutine: i64, frame: i64 },
    /// Children of the value at `path`, evaluated in a frame.
    Path { goroutine: i64, frame: i64, path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: i64,
    pub name: String,
}

/// Allocates opaque positive ids for values that only live until the next resume.
#[derive(Debug)]
struct HandleTable<T> {
    next: i64,
    map: HashMap<i64, T>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self {
            next: 0,
            map: HashMap::new(),
        }
    }
}

impl<T> HandleTable<T> {
    fn alloc(&mut self, value: T) -> i64 {
        self.next += 1;
        let id = self.next;
        self.map.insert(id, value);
        id
    }

    fn get(&self, id: i64) -> Option<&T> {
        self.map.get(&id)
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    // Ids keep increasing so a stale reference never aliases a new value.
    fn clear(&mut self) {
        self.map.clear();
    }
}

#[derive(Debug)]
struct Inner {
    state: SessionState,
    breakpoints: HashMap<String, Vec<Arc<CatalogEntry>>>,
    threads: BTreeMap<i64, ThreadInfo>,
    frames: HandleTable<FrameRef>,
    variables: HandleTable<VariableRef>,
}

#[derive(Debug)]
pub struct Session {
    id: u64,
    inner: RwLock<Inner>,
}

impl Session {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            inner: RwLock::new(Inner {
                state: SessionState::Listening,
                breakpoints: HashMap::new(),
                threads: BTreeMap::new(),
                frames: HandleTable::default(),
                variables: HandleTable::default(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.read().state
    }

    pub fn transition(&self, next: SessionState) {
        let mut inner = self.inner.write();
        if inner.state != next {
            tracing::debug!(session = self.id, from = %inner.state, to = %next, "session state");
            inner.state = next;
        }
    }

    /// Swap in the breakpoints of `file`, returning the batch they replace.
    pub fn replace_breakpoints(&self, file: &str, entries: Vec<Arc<CatalogEntry>>) -> Vec<Arc<CatalogEntry>> {
        let mut inner = self.inner.write();
        let previous = if entries.is_empty() {
            inner.breakpoints.remove(file)
        } else {
            inner.breakpoints.insert(file.to_string(), entries)
        };
        previous.unwrap_or_default()
    }

    pub fn breakpoints_for(&self, file: &str) -> Vec<Arc<CatalogEntry>> {
        self.inner
            .read()
            .breakpoints
            .get(file)
            .cloned()
            .unwrap_or_default()
    }

    pub fn all_breakpoints(&self) -> Vec<Arc<CatalogEntry>> {
        let inner = self.inner.read();
        let mut all: Vec<_> = inner.breakpoints.values().flatten().cloned().collect();
        all.sort_by_key(|entry| entry.id());
        all
    }

    pub fn owns_breakpoint(&self, id: u64) -> bool {
        self.inner
            .read()
            .breakpoints
            .values()
            .flatten()
            .any(|entry| entry.id() == id)
    }

    pub fn set_threads(&self, threads: impl IntoIterator<Item = ThreadInfo>) {
        let mut inner = self.inner.write();
        inner.threads = threads.into_iter().map(|thread| (thread.id, thread)).collect();
    }

    pub fn thread(&self, id: i64) -> Option<ThreadInfo> {
        self.inner.read().threads.get(&id).cloned()
    }

    pub fn alloc_frame(&self, frame: FrameRef) -> i64 {
        self.inner.write().frames.alloc(frame)
    }

    pub fn frame(&self, id: i64) -> Option<FrameRef> {
        self.inner.read().frames.get(id).cloned()
    }

    pub fn alloc_variable(&self, variable: VariableRef) -> i64 {
        self.inner.write().variables.alloc(variable)
    }

    pub fn variable(&self, id: i64) -> Option<VariableRef> {
        self.inner.read().variables.get(id).cloned()
    }

    pub fn handle_count(&self) -> usize {
        let inner = self.inner.read();
        inner.frames.len() + inner.variables.len()
    }

    /// Invalidate frame and variable ids; called whenever the debuggee resumes.
    pub fn clear_handles(&self) {
        let mut inner = self.inner.write();
        inner.frames.clear();
        inner.variables.clear();
    }

    /// Drop all per-session state and return the breakpoints that were held.
    pub fn reset(&self) -> Vec<Arc<CatalogEntry>> {
        let mut inner = self.inner.write();
        inner.frames.clear();
        inner.variables.clear();
        inner.threads.clear();
        let mut held: Vec<_> = inner.breakpoints.drain().flat_map(|(_, entries)| entries).collect();
        held.sort_by_key(|entry| entry.id());
        held
    }
}
