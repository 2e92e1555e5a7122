//! Collection comparison
//!
//! Every worker collects on its own appliance. A worker whose collection
//! differs from the master's cannot be trusted with dispatched ids, so the
//! master compares the two sorted collections and reports a unified diff.

use parallelizer_common::TestId;
use tracing::warn;

/// Context lines around each hunk
const CONTEXT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal,
    Delete,
    Insert,
}

struct DiffLine<'a> {
    op: Op,
    text: &'a str,
    /// Position in the master side before this line
    a: usize,
    /// Position in the worker side before this line
    b: usize,
}

/// Merge two sorted sequences into diff lines
fn merge_sorted<'a>(master: &[&'a str], worker: &[&'a str]) -> Vec<DiffLine<'a>> {
    let (mut i, mut j) = (0, 0);
    let mut lines = Vec::with_capacity(master.len().max(worker.len()));
    while i < master.len() || j < worker.len() {
        let op = match (master.get(i), worker.get(j)) {
            (Some(a), Some(b)) if a == b => Op::Equal,
            (Some(a), Some(b)) if a < b => Op::Delete,
            (Some(_), None) => Op::Delete,
            _ => Op::Insert,
        };
        let text = match op {
            Op::Equal | Op::Delete => master[i],
            Op::Insert => worker[j],
        };
        lines.push(DiffLine { op, text, a: i, b: j });
        match op {
            Op::Equal => {
                i += 1;
                j += 1;
            }
            Op::Delete => i += 1,
            Op::Insert => j += 1,
        }
    }
    lines
}

fn format_range(start: usize, len: usize) -> String {
    match len {
        0 => format!("{},0", start),
        1 => format!("{}", start + 1),
        _ => format!("{},{}", start + 1, len),
    }
}

/// Unified diff of two sorted line sequences
fn unified_diff(master: &[&str], worker: &[&str], tofile: &str) -> String {
    let lines = merge_sorted(master, worker);
    let changes: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| l.op != Op::Equal)
        .map(|(i, _)| i)
        .collect();

    let mut hunks: Vec<(usize, usize)> = Vec::new();
    for &c in &changes {
        let lo = c.saturating_sub(CONTEXT);
        let hi = (c + CONTEXT + 1).min(lines.len());
        match hunks.last_mut() {
            Some(last) if lo <= last.1 => last.1 = last.1.max(hi),
            _ => hunks.push((lo, hi)),
        }
    }

    let mut out = vec!["--- master".to_string(), format!("+++ {}", tofile)];
    for (lo, hi) in hunks {
        let slice = &lines[lo..hi];
        let a_len = slice.iter().filter(|l| l.op != Op::Insert).count();
        let b_len = slice.iter().filter(|l| l.op != Op::Delete).count();
        out.push(format!(
            "@@ -{} +{} @@",
            format_range(slice[0].a, a_len),
            format_range(slice[0].b, b_len)
        ));
        for line in slice {
            let sign = match line.op {
                Op::Equal => ' ',
                Op::Delete => '-',
                Op::Insert => '+',
            };
            out.push(format!("{}{}", sign, line.text.trim_end()));
        }
    }
    out.join("\n")
}

/// Compare a worker's collection with the master's.
///
/// Returns `None` when both contain the same ids, otherwise
/// `"<worker> diff:\n<unified diff>\n"`. Order does not matter.
pub fn report_collection_diff(
    worker: &str,
    master: &[TestId],
    collected: &[TestId],
) -> Option<String> {
    let mut from: Vec<&str> = master.iter().map(String::as_str).collect();
    let mut to: Vec<&str> = collected.iter().map(String::as_str).collect();
    from.sort_unstable();
    to.sort_unstable();
    if from == to {
        return None;
    }

    let diff = format!("{} diff:\n{}\n", worker, unified_diff(&from, &to, worker));
    warn!("Collection of {} differs from master", worker);
    Some(diff)
}
