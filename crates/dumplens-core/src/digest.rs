use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::result::AnalysisResult;

/// Bumped whenever the hashing scheme changes; stale digests are rebuilt.
pub const MINI_INFO_VERSION: u32 = 3;

/// Compact fingerprint of a dump used for similarity detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpMiniInfo {
    pub version: u32,
    pub faulting_thread: Option<ThreadMiniInfo>,
    pub last_event: Option<LastEventMiniInfo>,
    pub exception: Option<ExceptionMiniInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadMiniInfo {
    /// Sorted, deduplicated.
    pub distinct_module_hashes: Vec<u64>,
    /// Sorted, deduplicated.
    pub distinct_frame_hashes: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastEventMiniInfo {
    pub type_hash: Option<u64>,
    pub description_hash: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionMiniInfo {
    pub type_hash: Option<u64>,
    pub message_hash: Option<u64>,
}

/// SHA-256 of the lower-cased text, truncated to 64 bits.
pub fn stable_hash(text: &str) -> u64 {
    let digest = Sha256::digest(text.to_lowercase().as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

fn hash_opt(text: Option<&str>) -> Option<u64> {
    text.filter(|t| !t.is_empty()).map(stable_hash)
}

impl DumpMiniInfo {
    pub fn from_result(result: &AnalysisResult) -> Self {
        let faulting_thread = result.error_thread().map(|thread| {
            let modules: BTreeSet<u64> = thread
                .frames
                .iter()
                .filter(|f| !f.module_name.is_empty())
                .map(|f| stable_hash(&f.module_name))
                .collect();
            let frames: BTreeSet<u64> = thread
                .frames
                .iter()
                .filter_map(|f| {
                    f.method_name
                        .as_deref()
                        .map(|m| stable_hash(&format!("{}!{}", f.module_name, m)))
                })
                .collect();
            ThreadMiniInfo {
                distinct_module_hashes: modules.into_iter().collect(),
                distinct_frame_hashes: frames.into_iter().collect(),
            }
        });

        let last_event = result.last_event.as_ref().map(|e| LastEventMiniInfo {
            type_hash: hash_opt(Some(&e.event_type)),
            description_hash: hash_opt(Some(&e.description)),
        });

        let exception = result
            .exception
            .as_ref()
            .or_else(|| {
                result
                    .error_thread()
                    .and_then(|t| t.last_exception.as_ref())
            })
            .map(|e| ExceptionMiniInfo {
                type_hash: hash_opt(Some(&e.type_name)),
                message_hash: hash_opt(e.message.as_deref()),
            });

        Self {
            version: MINI_INFO_VERSION,
            faulting_thread,
            last_event,
            exception,
        }
    }

    pub fn is_current(&self) -> bool {
        self.version == MINI_INFO_VERSION
    }
}

/// Per-dimension similarity between two dumps.
///
/// A dimension is `None` when neither dump has it and `0.0` when only
/// one does. `overall` is the mean of the present dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashSimilarity {
    pub stack_trace: Option<f64>,
    pub modules: Option<f64>,
    pub last_event: Option<f64>,
    pub exception: Option<f64>,
    pub overall: f64,
}

impl CrashSimilarity {
    /// Deterministic and symmetric in its arguments.
    pub fn calculate(a: &DumpMiniInfo, b: &DumpMiniInfo) -> Self {
        let (stack_trace, modules) = match (&a.faulting_thread, &b.faulting_thread) {
            (None, None) => (None, None),
            (Some(_), None) | (None, Some(_)) => (Some(0.0), Some(0.0)),
            (Some(ta), Some(tb)) => (
                set_similarity(&ta.distinct_frame_hashes, &tb.distinct_frame_hashes),
                set_similarity(&ta.distinct_module_hashes, &tb.distinct_module_hashes),
            ),
        };

        let last_event = pair_dimension(&a.last_event, &b.last_event, |x, y| {
            fields_similarity(&[
                (x.type_hash, y.type_hash),
                (x.description_hash, y.description_hash),
            ])
        });
        let exception = pair_dimension(&a.exception, &b.exception, |x, y| {
            fields_similarity(&[(x.type_hash, y.type_hash), (x.message_hash, y.message_hash)])
        });

        let present: Vec<f64> = [stack_trace, modules, last_event, exception]
            .into_iter()
            .flatten()
            .collect();
        let overall = if present.is_empty() {
            0.0
        } else {
            present.iter().sum::<f64>() / present.len() as f64
        };

        Self {
            stack_trace,
            modules,
            last_event,
            exception,
            overall,
        }
    }
}

fn pair_dimension<T>(
    a: &Option<T>,
    b: &Option<T>,
    f: impl Fn(&T, &T) -> Option<f64>,
) -> Option<f64> {
    match (a, b) {
        (None, None) => None,
        (Some(_), None) | (None, Some(_)) => Some(0.0),
        (Some(x), Some(y)) => f(x, y),
    }
}

/// |A ∩ B| / max(|A|, |B|) over sorted, deduplicated slices.
fn set_similarity(a: &[u64], b: &[u64]) -> Option<f64> {
    let larger = a.len().max(b.len());
    if larger == 0 {
        return None;
    }
    let (mut i, mut j, mut common) = (0, 0, 0usize);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                common += 1;
                i += 1;
                j += 1;
            }
        }
    }
    Some(common as f64 / larger as f64)
}

fn fields_similarity(fields: &[(Option<u64>, Option<u64>)]) -> Option<f64> {
    let scores: Vec<f64> = fields
        .iter()
        .filter_map(|pair| match pair {
            (None, None) => None,
            (Some(x), Some(y)) if x == y => Some(1.0),
            _ => Some(0.0),
        })
        .collect();
    if scores.is_empty() {
        None
    } else {
        Some(scores.iter().sum::<f64>() / scores.len() as f64)
    }
}
