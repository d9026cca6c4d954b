use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Semantic marker attached to modules, threads and frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tag {
    LastExecuting,
    Deadlocked,
    NativeException,
    ManagedException,
    AssertionError,
    ExceptionInStack,
    ClrThreadSuspend,
    #[serde(rename = "dynatrace-agent")]
    DynatraceAgent,
    #[serde(rename = "dynatrace-agent-java")]
    DynatraceJavaAgent,
    #[serde(rename = "dynatrace-agent-dotnet")]
    DynatraceDotNetAgent,
    #[serde(rename = "dynatrace-agent-iis")]
    DynatraceIisAgent,
    #[serde(rename = "dynatrace-agent-node")]
    DynatraceNodeAgent,
    #[serde(rename = "dynatrace-agent-php")]
    DynatracePhpAgent,
    #[serde(rename = "dynatrace-agent-process")]
    DynatraceProcessAgent,
    #[serde(rename = "dynatrace-agent-log")]
    DynatraceLogAgent,
    #[serde(rename = "dynatrace-agent-os")]
    DynatraceOsAgent,
    #[serde(rename = "dynatrace-agent-plugin")]
    DynatracePluginAgent,
    #[serde(rename = "dynatrace-agent-network")]
    DynatraceNetworkAgent,
    #[serde(rename = "dynatrace-agent-nginx")]
    DynatraceNginxAgent,
    #[serde(rename = "dynatrace-agent-varnish")]
    DynatraceVarnishAgent,
    #[serde(rename = "dynatrace-agent-watchdog")]
    DynatraceWatchdog,
    #[serde(rename = "dynatrace-agent-loader")]
    DynatraceAgentLoader,
    ClrWaitForGc,
    ClrGcThread,
    BreakInstruction,
}

impl Tag {
    /// Stable, css-class compatible name.
    pub fn name(&self) -> &'static str {
        match self {
            Tag::LastExecuting => "last-executing",
            Tag::Deadlocked => "deadlocked",
            Tag::NativeException => "native-exception",
            Tag::ManagedException => "managed-exception",
            Tag::AssertionError => "assertion-error",
            Tag::ExceptionInStack => "exception-in-stack",
            Tag::ClrThreadSuspend => "clr-thread-suspend",
            Tag::DynatraceAgent => "dynatrace-agent",
            Tag::DynatraceJavaAgent => "dynatrace-agent-java",
            Tag::DynatraceDotNetAgent => "dynatrace-agent-dotnet",
            Tag::DynatraceIisAgent => "dynatrace-agent-iis",
            Tag::DynatraceNodeAgent => "dynatrace-agent-node",
            Tag::DynatracePhpAgent => "dynatrace-agent-php",
            Tag::DynatraceProcessAgent => "dynatrace-agent-process",
            Tag::DynatraceLogAgent => "dynatrace-agent-log",
            Tag::DynatraceOsAgent => "dynatrace-agent-os",
            Tag::DynatracePluginAgent => "dynatrace-agent-plugin",
            Tag::DynatraceNetworkAgent => "dynatrace-agent-network",
            Tag::DynatraceNginxAgent => "dynatrace-agent-nginx",
            Tag::DynatraceVarnishAgent => "dynatrace-agent-varnish",
            Tag::DynatraceWatchdog => "dynatrace-agent-watchdog",
            Tag::DynatraceAgentLoader => "dynatrace-agent-loader",
            Tag::ClrWaitForGc => "clr-wait-for-gc",
            Tag::ClrGcThread => "clr-gc-thread",
            Tag::BreakInstruction => "break-instruction",
        }
    }

    /// Ranking weight for threads carrying this tag (higher is more relevant).
    pub fn importance(&self) -> u8 {
        match self {
            Tag::LastExecuting => 100,
            Tag::Deadlocked => 90,
            Tag::NativeException => 81,
            Tag::ManagedException | Tag::AssertionError => 80,
            Tag::ExceptionInStack => 70,
            Tag::ClrThreadSuspend => 60,
            Tag::ClrWaitForGc | Tag::ClrGcThread | Tag::BreakInstruction => 0,
            _ => 10,
        }
    }

    /// Tags that mark a thread as the one that crashed.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Tag::NativeException
                | Tag::ManagedException
                | Tag::AssertionError
                | Tag::BreakInstruction
                | Tag::Deadlocked
        )
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set semantics make tag application idempotent.
pub type TagSet = BTreeSet<Tag>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Managed,
    Native,
    Special,
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameType::Managed => write!(f, "Managed"),
            FrameType::Native => write!(f, "Native"),
            FrameType::Special => write!(f, "Special"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Module {
    pub file_name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub tags: TagSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackFrame {
    pub frame_type: FrameType,
    #[serde(default)]
    pub module_name: String,
    #[serde(default)]
    pub method_name: Option<String>,
    #[serde(default)]
    pub instruction_pointer: u64,
    /// Index of the merged counterpart frame within the same thread's stack.
    #[serde(default)]
    pub linked_frame: Option<usize>,
    #[serde(default)]
    pub tags: TagSet,
}

impl StackFrame {
    pub fn new(frame_type: FrameType, module_name: &str, method_name: Option<&str>) -> Self {
        Self {
            frame_type,
            module_name: module_name.to_string(),
            method_name: method_name.map(str::to_string),
            instruction_pointer: 0,
            linked_frame: None,
            tags: TagSet::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub type_name: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: u32,
    /// Frames in stack order, innermost first.
    #[serde(default)]
    pub frames: Vec<StackFrame>,
    #[serde(default)]
    pub last_exception: Option<ExceptionInfo>,
    #[serde(default)]
    pub tags: TagSet,
}

impl Thread {
    pub fn new(id: u32, frames: Vec<StackFrame>) -> Self {
        Self {
            id,
            frames,
            last_exception: None,
            tags: TagSet::new(),
        }
    }

    /// Resolve a frame's linked counterpart.
    pub fn linked_frame(&self, frame: &StackFrame) -> Option<&StackFrame> {
        frame.linked_frame.and_then(|idx| self.frames.get(idx))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastEvent {
    pub event_type: String,
    pub description: String,
    pub thread_id: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemContext {
    #[serde(default)]
    pub system_architecture: Option<String>,
    #[serde(default)]
    pub process_architecture: Option<String>,
    /// Executable path (core dumps only).
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default)]
    pub process_args: Option<String>,
}

/// Normalized output of the native analyzer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default)]
    pub system: SystemContext,
    #[serde(default)]
    pub modules: Vec<Module>,
    #[serde(default)]
    pub threads: BTreeMap<u32, Thread>,
    #[serde(default)]
    pub last_executed_thread: Option<u32>,
    #[serde(default)]
    pub last_event: Option<LastEvent>,
    #[serde(default)]
    pub exception: Option<ExceptionInfo>,
}

impl AnalysisResult {
    /// The thread carrying the most important error tag, lowest id on ties.
    pub fn error_thread(&self) -> Option<&Thread> {
        self.threads
            .values()
            .filter_map(|t| {
                t.tags
                    .iter()
                    .filter(|tag| tag.is_error())
                    .map(|tag| tag.importance())
                    .max()
                    .map(|importance| (importance, t))
            })
            // max_by_key keeps the last maximum; iterate in reverse to favor low ids
            .rev()
            .max_by_key(|(importance, _)| *importance)
            .map(|(_, t)| t)
    }

    /// All tags in the tree, for summaries.
    pub fn all_tags(&self) -> TagSet {
        let mut tags = TagSet::new();
        for module in &self.modules {
            tags.extend(module.tags.iter().copied());
        }
        for thread in self.threads.values() {
            tags.extend(thread.tags.iter().copied());
            for frame in &thread.frames {
                tags.extend(frame.tags.iter().copied());
            }
        }
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_serializes_by_name() {
        let json = serde_json::to_string(&Tag::DynatracePhpAgent).unwrap();
        assert_eq!(json, r#""dynatrace-agent-php""#);
        let json = serde_json::to_string(&Tag::ClrWaitForGc).unwrap();
        assert_eq!(json, format!("\"{}\"", Tag::ClrWaitForGc.name()));
        let back: Tag = serde_json::from_str(r#""last-executing""#).unwrap();
        assert_eq!(back, Tag::LastExecuting);
    }

    #[test]
    fn test_tag_importance_ordering() {
        assert!(Tag::LastExecuting.importance() > Tag::NativeException.importance());
        assert!(Tag::NativeException.importance() > Tag::ManagedException.importance());
        assert_eq!(Tag::DynatracePhpAgent.importance(), 10);
    }

    #[test]
    fn test_error_thread_prefers_most_important_tag() {
        let mut result = AnalysisResult::default();
        let mut t1 = Thread::new(1, vec![]);
        t1.tags.insert(Tag::ManagedException);
        let mut t2 = Thread::new(2, vec![]);
        t2.tags.insert(Tag::NativeException);
        let t3 = Thread::new(3, vec![]);
        result.threads.insert(1, t1);
        result.threads.insert(2, t2);
        result.threads.insert(3, t3);

        assert_eq!(result.error_thread().map(|t| t.id), Some(2));
    }

    #[test]
    fn test_error_thread_ties_pick_lowest_id() {
        let mut result = AnalysisResult::default();
        for id in [7, 3, 5] {
            let mut t = Thread::new(id, vec![]);
            t.tags.insert(Tag::NativeException);
            result.threads.insert(id, t);
        }
        assert_eq!(result.error_thread().map(|t| t.id), Some(3));
    }

    #[test]
    fn test_error_thread_none_without_error_tags() {
        let mut result = AnalysisResult::default();
        let mut t = Thread::new(1, vec![]);
        t.tags.insert(Tag::LastExecuting);
        result.threads.insert(1, t);
        assert!(result.error_thread().is_none());
    }

    #[test]
    fn test_linked_frame_resolves_by_index() {
        let mut managed = StackFrame::new(FrameType::Managed, "app", Some("Main"));
        managed.linked_frame = Some(1);
        let native = StackFrame::new(FrameType::Native, "coreclr", Some("CallDescr"));
        let thread = Thread::new(1, vec![managed, native]);
        let linked = thread.linked_frame(&thread.frames[0]).unwrap();
        assert_eq!(linked.module_name, "coreclr");
        assert!(thread.linked_frame(&thread.frames[1]).is_none());
    }
}
