use colored::Colorize;

use dumplens_core::cluster::{Cluster, ClusterSnapshot, PropertyStat};
use dumplens_core::result::{AnalysisResult, Tag, TagSet, Thread};
use dumplens_core::scheduler::QueueStats;
use dumplens_core::types::{DumpMetainfo, DumpStatus, DumpType};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const FRAMES_PER_THREAD: usize = 8;

fn header(title: &str) -> String {
    format!("\n{}\n{}\n\n", title.bold(), "=".repeat(40))
}

fn status_label(status: DumpStatus) -> String {
    let label = status.to_string();
    match status {
        DumpStatus::Succeeded => label.green().to_string(),
        DumpStatus::Failed => label.red().bold().to_string(),
        DumpStatus::Analyzing => label.yellow().to_string(),
        DumpStatus::Created => label.dimmed().to_string(),
    }
}

fn type_label(dump_type: DumpType) -> &'static str {
    match dump_type {
        DumpType::WindowsDump => "windows",
        DumpType::LinuxCoreDump => "linux-core",
        DumpType::Empty => "empty",
    }
}

fn tag_list(tags: &TagSet) -> String {
    let names: Vec<String> = tags
        .iter()
        .map(|t| {
            if t.is_error() {
                t.name().red().to_string()
            } else {
                t.name().cyan().to_string()
            }
        })
        .collect();
    names.join(", ")
}

/// Status table for a list of dumps.
pub fn format_status(dumps: &[DumpMetainfo]) -> String {
    let mut out = header("dumplens - Dump Status");

    if dumps.is_empty() {
        out.push_str("No dumps found.\n");
        return out;
    }

    for dump in dumps {
        let name = dump.dump_file_name.as_deref().unwrap_or("-");
        out.push_str(&format!(
            "  {:<16} {:<10} {:<20} {}\n",
            dump.id.to_string(),
            type_label(dump.dump_type),
            status_label(dump.status),
            name,
        ));
        if let Some(ref message) = dump.error_message {
            out.push_str(&format!("      {}: {}\n", "Error".red(), message));
        }
    }

    let count = |status: DumpStatus| dumps.iter().filter(|d| d.status == status).count();
    out.push_str(&format!(
        "\n{}: {} dumps, {} succeeded, {} failed, {} pending\n",
        "Summary".bold(),
        dumps.len(),
        count(DumpStatus::Succeeded),
        count(DumpStatus::Failed),
        count(DumpStatus::Created) + count(DumpStatus::Analyzing),
    ));
    out
}

fn format_property(stat: &PropertyStat) -> Option<String> {
    if stat.top.is_empty() {
        return None;
    }
    let values: Vec<String> = stat
        .top
        .iter()
        .map(|v| format!("{} ({:.1}%)", v.value, v.percentage * 100.0))
        .collect();
    Some(format!(
        "    {}: {} [{} distinct]\n",
        stat.name,
        values.join(", "),
        stat.distinct_count
    ))
}

fn format_cluster(cluster: &Cluster) -> String {
    let mut out = format!(
        "\n  {} ({} dumps)\n",
        format!("Cluster #{}", cluster.id).bold(),
        cluster.size()
    );
    out.push_str(&format!(
        "    First: {}  Latest: {}\n",
        cluster.first.format(TIME_FORMAT),
        cluster.latest.format(TIME_FORMAT)
    ));
    for stat in &cluster.common_properties {
        if let Some(line) = format_property(stat) {
            out.push_str(&line);
        }
    }
    let recent: Vec<String> = cluster.recent_dumps.iter().map(|d| d.to_string()).collect();
    out.push_str(&format!("    Recent: {}\n", recent.join(", ")));
    out
}

/// Cluster listing, largest clusters first.
pub fn format_clusters(snapshot: &ClusterSnapshot) -> String {
    let mut out = header("dumplens - Crash Clusters");

    out.push_str(&format!(
        "{}: {} dumps in {} clusters (built {})\n",
        "Summary".bold(),
        snapshot.dump_count,
        snapshot.clusters.len(),
        snapshot.built_at.format(TIME_FORMAT),
    ));

    if snapshot.clusters.is_empty() {
        out.push_str("\nNo clusters yet.\n");
        return out;
    }

    let mut clusters: Vec<&Cluster> = snapshot.clusters.iter().collect();
    clusters.sort_by(|a, b| b.size().cmp(&a.size()).then_with(|| a.id.cmp(&b.id)));
    for cluster in clusters {
        out.push_str(&format_cluster(cluster));
    }
    out.push('\n');
    out
}

fn thread_rank(thread: &Thread) -> u8 {
    thread.tags.iter().map(Tag::importance).max().unwrap_or(0)
}

/// Threads and tags of one analyzed dump, most important threads first.
pub fn format_result(dump: &DumpMetainfo, result: &AnalysisResult) -> String {
    let mut out = header(&format!("dumplens - Dump {}", dump.id));

    out.push_str(&format!("  Status: {}\n", status_label(dump.status)));
    let system = &result.system;
    for (label, value) in [
        ("System architecture", &system.system_architecture),
        ("Process architecture", &system.process_architecture),
        ("Executable", &system.executable),
        ("Arguments", &system.process_args),
    ] {
        if let Some(value) = value {
            out.push_str(&format!("  {label}: {value}\n"));
        }
    }
    if let Some(ref event) = result.last_event {
        out.push_str(&format!(
            "  Last event: {} ({}) on thread {}\n",
            event.description, event.event_type, event.thread_id
        ));
    }
    if let Some(ref exception) = result.exception {
        out.push_str(&format!(
            "  Exception: {}{}\n",
            exception.type_name.red(),
            exception
                .message
                .as_deref()
                .map(|m| format!(": {m}"))
                .unwrap_or_default()
        ));
    }

    let all_tags = result.all_tags();
    if !all_tags.is_empty() {
        out.push_str(&format!("  Tags: {}\n", tag_list(&all_tags)));
    }

    let error_thread = result.error_thread().map(|t| t.id);
    let mut threads: Vec<&Thread> = result.threads.values().collect();
    threads.sort_by(|a, b| thread_rank(b).cmp(&thread_rank(a)).then_with(|| a.id.cmp(&b.id)));

    out.push_str(&format!(
        "\n{} ({})\n{}\n",
        "Threads".bold(),
        threads.len(),
        "-".repeat(40)
    ));
    for thread in threads {
        let marker = if Some(thread.id) == error_thread {
            " *".red().bold().to_string()
        } else {
            String::new()
        };
        out.push_str(&format!("\n  Thread {}{}", thread.id, marker));
        if !thread.tags.is_empty() {
            out.push_str(&format!(" [{}]", tag_list(&thread.tags)));
        }
        out.push('\n');
        for frame in thread.frames.iter().take(FRAMES_PER_THREAD) {
            out.push_str(&format!(
                "    {}!{}",
                frame.module_name,
                frame.method_name.as_deref().unwrap_or("?")
            ));
            if !frame.tags.is_empty() {
                out.push_str(&format!(" [{}]", tag_list(&frame.tags)));
            }
            out.push('\n');
        }
        if thread.frames.len() > FRAMES_PER_THREAD {
            out.push_str(&format!(
                "    ... {} more frames\n",
                thread.frames.len() - FRAMES_PER_THREAD
            ));
        }
    }
    out.push('\n');
    out
}

/// Per-queue counters after a run.
pub fn format_queue_stats(stats: &[QueueStats]) -> String {
    let mut out = format!("\n{}\n{}\n", "Queues".bold(), "-".repeat(40));
    for q in stats {
        out.push_str(&format!(
            "  {:<20} workers={} enqueued={} completed={} failed={} peak={}\n",
            q.name, q.workers, q.enqueued, q.completed, q.failed, q.peak
        ));
    }
    out
}
