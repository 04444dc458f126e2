//! Recursive process-tree termination.
//!
//! Given a root pid, finds every descendant by walking `/proc` and signals
//! the whole tree, leaves first. Tolerates processes that have already
//! exited -- a descendant disappearing mid-walk or mid-kill is not an error.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;

/// Recursively terminate `root_pid` and all of its descendants with SIGKILL.
///
/// Returns `Ok(())` even if the root or some descendants are already gone;
/// only unexpected OS errors are propagated.
pub fn kill_tree(root_pid: u32) -> Result<(), String> {
    let pids = collect_descendants(root_pid as i32);

    // Kill children before parents so a parent can't respawn anything that
    // depends on a child that's still alive.
    let mut ordered: Vec<i32> = pids.into_iter().collect();
    ordered.sort_unstable_by(|a, b| b.cmp(a));

    for pid in ordered {
        match signal::kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) => {}
            Err(nix::errno::Errno::ESRCH) => {
                // Already exited -- not an error.
            }
            Err(e) => return Err(format!("failed to kill pid {pid}: {e}")),
        }
    }

    Ok(())
}

/// Walk `/proc` to build a parent -> children map, then BFS from `root_pid`
/// to collect the full descendant set (including the root itself).
fn collect_descendants(root_pid: i32) -> HashSet<i32> {
    let mut children_of: HashMap<i32, Vec<i32>> = HashMap::new();

    if let Ok(entries) = fs::read_dir("/proc") {
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok())
            else {
                continue;
            };
            if let Some(ppid) = read_ppid(pid) {
                children_of.entry(ppid).or_default().push(pid);
            }
        }
    }

    let mut seen = HashSet::new();
    let mut queue = VecDeque::new();
    seen.insert(root_pid);
    queue.push_back(root_pid);

    while let Some(pid) = queue.pop_front() {
        if let Some(children) = children_of.get(&pid) {
            for &child in children {
                if seen.insert(child) {
                    queue.push_back(child);
                }
            }
        }
    }

    seen
}

/// Read the parent pid of `pid` from `/proc/<pid>/stat`.
///
/// The command field (2nd field) is parenthesized and may itself contain
/// spaces or closing parens, so we split on the *last* `)` rather than
/// naively splitting on whitespace.
fn read_ppid(pid: i32) -> Option<i32> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let after_comm = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // fields[0] = state, fields[1] = ppid
    fields.get(1)?.parse::<i32>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_tree_tolerates_already_dead_pid() {
        // An implausibly large pid is essentially guaranteed not to exist.
        let result = kill_tree(i32::MAX as u32);
        assert!(result.is_ok());
    }

    #[test]
    fn collect_descendants_always_includes_root() {
        let pid = std::process::id() as i32;
        let set = collect_descendants(pid);
        assert!(set.contains(&pid));
    }
}
