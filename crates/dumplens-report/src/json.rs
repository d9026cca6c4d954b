use serde::Serialize;

use dumplens_core::cluster::ClusterSnapshot;
use dumplens_core::result::AnalysisResult;
use dumplens_core::types::DumpMetainfo;

fn render<T: Serialize + ?Sized>(value: &T, compact: bool) -> String {
    let rendered = if compact {
        serde_json::to_string(value)
    } else {
        serde_json::to_string_pretty(value)
    };
    rendered.expect("report types should be serializable")
}

/// Format a dump list as JSON.
pub fn format_status(dumps: &[DumpMetainfo], compact: bool) -> String {
    render(dumps, compact)
}

/// Format a cluster snapshot as JSON.
pub fn format_clusters(snapshot: &ClusterSnapshot, compact: bool) -> String {
    render(snapshot, compact)
}

/// One dump with its result and the union of all tags.
#[derive(Debug, Serialize)]
pub struct DumpReport<'a> {
    pub dump: &'a DumpMetainfo,
    pub tags: Vec<&'static str>,
    pub error_thread: Option<u32>,
    pub result: &'a AnalysisResult,
}

pub fn format_result(dump: &DumpMetainfo, result: &AnalysisResult, compact: bool) -> String {
    let report = DumpReport {
        dump,
        tags: result.all_tags().iter().map(|t| t.name()).collect(),
        error_thread: result.error_thread().map(|t| t.id),
        result,
    };
    render(&report, compact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dumplens_core::result::{FrameType, StackFrame, Tag, Thread};
    use dumplens_core::types::{DumpIdentifier, DumpStatus, DumpType};

    fn sample_dump() -> DumpMetainfo {
        let mut dump = DumpMetainfo::new(DumpIdentifier::new("b", "1"), DumpType::LinuxCoreDump, Utc::now());
        dump.status = DumpStatus::Succeeded;
        dump
    }

    #[test]
    fn test_status_round_trips_identifiers() {
        let json = format_status(&[sample_dump()], true);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["id"], "b:1");
        assert_eq!(parsed[0]["status"], "succeeded");
        assert_eq!(parsed[0]["dump_type"], "linux-core-dump");
        assert!(!json.contains('\n'));
    }

    #[test]
    fn test_pretty_output_is_multiline() {
        let json = format_clusters(&ClusterSnapshot::empty(), false);
        assert!(json.contains('\n'));
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["dump_count"], 0);
        assert!(parsed["clusters"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_result_report_lists_tags() {
        let mut thread = Thread::new(3, vec![StackFrame::new(FrameType::Native, "libc.so.6", Some("raise"))]);
        thread.tags.insert(Tag::NativeException);
        let mut result = AnalysisResult::default();
        result.threads.insert(3, thread);

        let json = format_result(&sample_dump(), &result, true);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["tags"][0], "native-exception");
        assert_eq!(parsed["error_thread"], 3);
        assert_eq!(parsed["result"]["threads"]["3"]["tags"][0], "native-exception");
    }
}
