use crate::result::{AnalysisResult, Module, StackFrame, Tag, TagSet, Thread};

/// A composable tagging rule. Every hook defaults to a no-op.
///
/// Hooks only ever add tags, so rules applied to the same node commute
/// and re-running a rule set leaves the result unchanged.
pub trait TagRule: Send + Sync {
    /// Rule name, for logging.
    fn name(&self) -> &'static str;

    fn on_module(&self, _module: &mut Module) {}

    fn on_thread(&self, _thread: &mut Thread) {}

    /// Called for every frame in stack order. `thread_tags` belongs to the
    /// thread owning `frame`.
    fn on_frame(&self, _thread_tags: &mut TagSet, _frame: &mut StackFrame) {}

    fn on_result(&self, _result: &mut AnalysisResult) {}
}

/// Case-insensitive substring match against any of `keys`.
pub fn contains_any(haystack: &str, keys: &[&str]) -> bool {
    let haystack = haystack.to_lowercase();
    keys.iter().any(|k| haystack.contains(&k.to_lowercase()))
}

fn tag_both(thread_tags: &mut TagSet, frame: &mut StackFrame, tag: Tag) {
    frame.tags.insert(tag);
    thread_tags.insert(tag);
}

/// Walks one result's module/thread/frame tree once, applying every rule.
pub struct DynamicAnalysis {
    rules: Vec<Box<dyn TagRule>>,
}

impl DynamicAnalysis {
    pub fn new(rules: Vec<Box<dyn TagRule>>) -> Self {
        Self { rules }
    }

    /// Engine preloaded with [`default_rules`].
    pub fn with_default_rules() -> Self {
        Self::new(default_rules())
    }

    pub fn add(mut self, rule: Box<dyn TagRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn analyze(&self, result: &mut AnalysisResult) {
        for module in &mut result.modules {
            for rule in &self.rules {
                rule.on_module(module);
            }
        }

        for thread in result.threads.values_mut() {
            for rule in &self.rules {
                rule.on_thread(thread);
            }
            let Thread { frames, tags, .. } = thread;
            for frame in frames.iter_mut() {
                for rule in &self.rules {
                    rule.on_frame(tags, frame);
                }
            }
        }

        for rule in &self.rules {
            rule.on_result(result);
        }
    }
}

/// The full rule set applied by the pipeline.
pub fn default_rules() -> Vec<Box<dyn TagRule>> {
    vec![
        Box::new(DotNetTagRule),
        Box::new(AgentTagRule),
        Box::new(NativeExceptionTagRule),
        Box::new(LastExecutingTagRule),
        Box::new(LastEventTagRule),
    ]
}

/// CLR runtime internals: GC, suspension, debug asserts, managed exceptions.
pub struct DotNetTagRule;

impl TagRule for DotNetTagRule {
    fn name(&self) -> &'static str {
        "dotnet"
    }

    fn on_thread(&self, thread: &mut Thread) {
        if thread.last_exception.is_some() {
            thread.tags.insert(Tag::ManagedException);
        }
    }

    fn on_frame(&self, thread_tags: &mut TagSet, frame: &mut StackFrame) {
        let Some(method) = frame.method_name.clone() else {
            return;
        };
        if contains_any(&method, &["Thread::WaitSuspendEvents"]) {
            tag_both(thread_tags, frame, Tag::ClrThreadSuspend);
        }
        if contains_any(
            &method,
            &["GCHeap::WaitUntilGCComplete", "SVR::gc_heap::wait_for_gc_done"],
        ) {
            tag_both(thread_tags, frame, Tag::ClrWaitForGc);
        }
        if contains_any(&method, &["gc_heap::gc_thread_stub"]) {
            tag_both(thread_tags, frame, Tag::ClrGcThread);
        }
        if contains_any(&method, &["_CrtDbgReport"]) {
            tag_both(thread_tags, frame, Tag::AssertionError);
        }
    }
}

const AGENT_NAMES: &[&str] = &[
    "oneagent",
    "dtagent",
    "ruxitagent",
    "dtiisagent",
    "dtapacheagent",
];

/// Specific agent components, checked before the generic agent tag.
const AGENT_FAMILY: &[(&str, Tag)] = &[
    ("oneagentphp", Tag::DynatracePhpAgent),
    ("oneagentjava", Tag::DynatraceJavaAgent),
    ("oneagentdotnet", Tag::DynatraceDotNetAgent),
    ("oneagentloader", Tag::DynatraceAgentLoader),
    ("oneagentproc", Tag::DynatraceProcessAgent),
    ("oneagentiis", Tag::DynatraceIisAgent),
    ("oneagentloganalytics", Tag::DynatraceLogAgent),
    ("oneagentos", Tag::DynatraceOsAgent),
    ("oneagentplugin", Tag::DynatracePluginAgent),
    ("oneagentnetwork", Tag::DynatraceNetworkAgent),
    ("oneagentnginx", Tag::DynatraceNginxAgent),
    ("oneagentvarnish", Tag::DynatraceVarnishAgent),
    ("oneagentwatchdog", Tag::DynatraceWatchdog),
    ("nodejsagent", Tag::DynatraceNodeAgent),
];

/// Monitoring-agent frames and modules, plus exception frames.
///
/// Agent frames get every matching component tag; the generic
/// [`Tag::DynatraceAgent`] is only used when no component matched.
pub struct AgentTagRule;

impl AgentTagRule {
    fn frame_text(frame: &StackFrame, method: &str) -> String {
        format!("{}{}{}", frame.module_name, frame.frame_type, method)
    }
}

impl TagRule for AgentTagRule {
    fn name(&self) -> &'static str {
        "agent"
    }

    fn on_module(&self, module: &mut Module) {
        if contains_any(&module.file_name, AGENT_NAMES) {
            module.tags.insert(Tag::DynatraceAgent);
        }
    }

    fn on_frame(&self, thread_tags: &mut TagSet, frame: &mut StackFrame) {
        let Some(method) = frame.method_name.clone() else {
            return;
        };
        if contains_any(&method, &["exception"]) {
            tag_both(thread_tags, frame, Tag::ExceptionInStack);
        }

        let text = Self::frame_text(frame, &method);
        if !contains_any(&text, AGENT_NAMES) {
            return;
        }

        let mut matched_specific = false;
        for (key, tag) in AGENT_FAMILY {
            if contains_any(&text, &[*key]) {
                tag_both(thread_tags, frame, *tag);
                matched_specific = true;
            }
        }
        if !matched_specific {
            tag_both(thread_tags, frame, Tag::DynatraceAgent);
        }
    }
}

/// Signal/abort frames inside libc.
pub struct NativeExceptionTagRule;

impl TagRule for NativeExceptionTagRule {
    fn name(&self) -> &'static str {
        "native-exception"
    }

    fn on_frame(&self, thread_tags: &mut TagSet, frame: &mut StackFrame) {
        let Some(method) = frame.method_name.as_deref() else {
            return;
        };
        if frame.module_name.starts_with("libc") && contains_any(method, &["gsignal", "abort", "raise"])
        {
            tag_both(thread_tags, frame, Tag::NativeException);
        }
    }
}

/// Marks the thread that executed last.
pub struct LastExecutingTagRule;

impl TagRule for LastExecutingTagRule {
    fn name(&self) -> &'static str {
        "last-executing"
    }

    fn on_result(&self, result: &mut AnalysisResult) {
        let Some(id) = result.last_executed_thread else {
            return;
        };
        if let Some(thread) = result.threads.get_mut(&id) {
            thread.tags.insert(Tag::LastExecuting);
        }
    }
}

/// Classifies the debugger's last event onto the thread it happened on.
pub struct LastEventTagRule;

impl TagRule for LastEventTagRule {
    fn name(&self) -> &'static str {
        "last-event"
    }

    fn on_result(&self, result: &mut AnalysisResult) {
        let Some(event) = result.last_event.as_ref() else {
            return;
        };
        let tag = if event.description.starts_with("CLR exception") {
            Tag::ManagedException
        } else if event.description.starts_with("Access violation") {
            Tag::NativeException
        } else if event.description.starts_with("Break instruction exception") {
            Tag::BreakInstruction
        } else {
            return;
        };
        let thread_id = event.thread_id;
        if let Some(thread) = result.threads.get_mut(&thread_id) {
            thread.tags.insert(tag);
        }
    }
}
