/// Result Harvester - folds phase artifacts into the task's output bundle
///
/// **Output bundle (under `output_path`):**
/// - `output.txt`: phase logs in execution order, each ending `exit code: N`,
///   separated by a blank line
/// - `output.yaml`: deep merge of phase documents, later phase wins on
///   conflicting keys, each phase stamped with `exit_code`
/// - `{phase}-diff.txt`: container filesystem diff per phase, never merged
///
/// A phase that produced no log or no document is not an error.

use crate::executor::PhaseRun;
use crate::sandbox::remove_path;
use overseer_common::{Phase, TaskError};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::io;
use std::path::Path;
use tracing::{info, warn};

pub const OUTPUT_LOG: &str = "output.txt";
pub const OUTPUT_DOCUMENT: &str = "output.yaml";
pub const EMPTY_DIFF: &str = "nothing changed";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HarvestReport {
    pub log_merged: bool,
    pub document_merged: bool,
}

/// Delete any bundle left at `output_path` by an earlier attempt
pub fn reset_bundle(output_path: &Path) -> io::Result<()> {
    for name in [
        OUTPUT_LOG.to_string(),
        OUTPUT_DOCUMENT.to_string(),
        Phase::Build.diff_file(),
        Phase::Run.diff_file(),
    ] {
        remove_path(&output_path.join(name))?;
    }
    Ok(())
}

/// Append the `exit code: N` marker to a phase log
pub fn stamp_log(log: &str, exit_code: i64) -> String {
    let mut stamped = log.to_string();
    if !stamped.is_empty() && !stamped.ends_with('\n') {
        stamped.push('\n');
    }
    stamped.push_str(&format!("exit code: {}\n", exit_code));
    stamped
}

/// Append a phase block to the cumulative log, blank line between blocks
pub fn merge_log(existing: &str, incoming: &str) -> String {
    if existing.is_empty() {
        return incoming.to_string();
    }
    let mut merged = existing.to_string();
    if !merged.ends_with('\n') {
        merged.push('\n');
    }
    merged.push('\n');
    merged.push_str(incoming);
    merged
}

pub fn stamp_document(mut document: Mapping, exit_code: i64) -> Mapping {
    document.insert(
        Value::String("exit_code".to_string()),
        Value::Number(exit_code.into()),
    );
    document
}

/// Last-writer-wins deep merge: nested mappings merge key by key, any
/// other incoming value replaces the existing one.
pub fn merge_documents(mut existing: Mapping, incoming: Mapping) -> Mapping {
    for (key, value) in incoming {
        match existing.get_mut(&key) {
            Some(slot) => merge_value(slot, value),
            None => {
                existing.insert(key, value);
            }
        }
    }
    existing
}

fn merge_value(slot: &mut Value, incoming: Value) {
    match (slot, incoming) {
        (Value::Mapping(current), Value::Mapping(next)) => {
            let current_map = std::mem::take(current);
            *current = merge_documents(current_map, next);
        }
        (slot, next) => *slot = next,
    }
}

pub fn diff_artifact(diff: &str) -> &str {
    if diff.trim().is_empty() {
        EMPTY_DIFF
    } else {
        diff
    }
}

/// `None` when the text is not a usable mapping; an empty file is an empty mapping
fn parse_document(text: &str) -> Option<Mapping> {
    match serde_yaml::from_str::<Value>(text) {
        Ok(Value::Mapping(map)) => Some(map),
        Ok(Value::Null) => Some(Mapping::new()),
        _ => None,
    }
}

fn read_optional(path: &Path) -> io::Result<Option<String>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Pull a finished phase's artifacts out of `out_dir` into `output_path`.
pub fn harvest(run: &PhaseRun, out_dir: &Path, output_path: &Path) -> Result<HarvestReport, TaskError> {
    let mut report = HarvestReport::default();
    let phase = run.phase;
    let exit_code = run.exit.code;

    match read_optional(&run.log_file(out_dir))? {
        Some(log) => {
            let target = output_path.join(OUTPUT_LOG);
            let existing = read_optional(&target)?.unwrap_or_default();
            fs::write(&target, merge_log(&existing, &stamp_log(&log, exit_code)))?;
            report.log_merged = true;
            info!(phase = %phase, target = %target.display(), "Merged phase log");
        }
        None => info!(phase = %phase, "Phase produced no log"),
    }

    match read_optional(&run.document_file(out_dir))? {
        Some(text) => match parse_document(&text) {
            Some(document) => {
                let target = output_path.join(OUTPUT_DOCUMENT);
                let stamped = stamp_document(document, exit_code);
                let merged = match read_optional(&target)?.as_deref().and_then(parse_document) {
                    Some(existing) => merge_documents(existing, stamped),
                    None => stamped,
                };
                let yaml = serde_yaml::to_string(&Value::Mapping(merged))
                    .map_err(|e| TaskError::server(format!("Failed to serialise {}: {}", OUTPUT_DOCUMENT, e)))?;
                fs::write(&target, yaml)?;
                report.document_merged = true;
                info!(phase = %phase, target = %target.display(), "Merged phase document");
            }
            None => warn!(phase = %phase, "Phase document is not a YAML mapping, skipped"),
        },
        None => info!(phase = %phase, "Phase produced no document"),
    }

    let diff_target = output_path.join(phase.diff_file());
    fs::write(&diff_target, diff_artifact(&run.diff))?;
    info!(phase = %phase, target = %diff_target.display(), "Wrote diff artifact");

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ExitStatus;
    use std::time::Duration;

    fn mapping(yaml: &str) -> Mapping {
        parse_document(yaml).unwrap()
    }

    fn phase_run(phase: Phase, token: &str, code: i64, diff: &str) -> PhaseRun {
        PhaseRun {
            phase,
            token: token.to_string(),
            exit: ExitStatus::exited(code),
            diff: diff.to_string(),
            duration: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_log_blocks_separated_by_blank_line() {
        let build = stamp_log("compiling...\nok", 0);
        let run = stamp_log("tests passed\n", 0);
        let merged = merge_log(&merge_log("", &build), &run);
        assert_eq!(
            merged,
            "compiling...\nok\nexit code: 0\n\ntests passed\nexit code: 0\n"
        );
    }

    #[test]
    fn test_stamp_empty_log() {
        assert_eq!(stamp_log("", 2), "exit code: 2\n");
    }

    #[test]
    fn test_later_phase_wins_on_conflict() {
        let build = stamp_document(mapping("status: compiled\nwarnings: 2\n"), 0);
        let run = stamp_document(mapping("status: graded\nscore: 8\n"), 1);
        let merged = merge_documents(build, run);
        assert_eq!(merged, mapping("status: graded\nwarnings: 2\nexit_code: 1\nscore: 8\n"));
    }

    #[test]
    fn test_nested_mappings_merge_deeply() {
        let existing = mapping("tests:\n  compile: pass\n  style: fail\n");
        let incoming = mapping("tests:\n  style: pass\n  unit: pass\n");
        let merged = merge_documents(existing, incoming);
        assert_eq!(
            merged,
            mapping("tests:\n  compile: pass\n  style: pass\n  unit: pass\n")
        );
    }

    #[test]
    fn test_scalar_replaces_mapping() {
        let merged = merge_documents(mapping("a:\n  b: 1\n"), mapping("a: flat\n"));
        assert_eq!(merged, mapping("a: flat\n"));
    }

    #[test]
    fn test_parse_document_edge_cases() {
        assert_eq!(parse_document(""), Some(Mapping::new()));
        assert_eq!(parse_document("- a\n- b\n"), None);
        assert_eq!(parse_document("key: [unterminated"), None);
    }

    #[test]
    fn test_blank_diff_placeholder() {
        assert_eq!(diff_artifact("  \n"), EMPTY_DIFF);
        assert_eq!(diff_artifact("A /x"), "A /x");
    }

    #[test]
    fn test_harvest_two_phases() {
        let tmp = tempfile::tempdir().unwrap();
        let out_dir = tmp.path().join("sandbox-out");
        let output = tmp.path().join("output");
        fs::create_dir_all(&out_dir).unwrap();
        fs::create_dir_all(&output).unwrap();

        fs::write(out_dir.join("b1.txt"), "built").unwrap();
        fs::write(out_dir.join("b1.yaml"), "stage: build\nbuild_ok: true\n").unwrap();
        let build = harvest(&phase_run(Phase::Build, "b1", 0, ""), &out_dir, &output).unwrap();
        assert!(build.log_merged && build.document_merged);

        fs::write(out_dir.join("r1.txt"), "ran").unwrap();
        fs::write(out_dir.join("r1.yaml"), "stage: run\nscore: 10\n").unwrap();
        harvest(&phase_run(Phase::Run, "r1", 0, "C /home/overseer/work"), &out_dir, &output).unwrap();

        assert_eq!(
            fs::read_to_string(output.join(OUTPUT_LOG)).unwrap(),
            "built\nexit code: 0\n\nran\nexit code: 0\n"
        );
        let merged = mapping(&fs::read_to_string(output.join(OUTPUT_DOCUMENT)).unwrap());
        assert_eq!(
            merged,
            mapping("stage: run\nbuild_ok: true\nexit_code: 0\nscore: 10\n")
        );
        assert_eq!(fs::read_to_string(output.join("build-diff.txt")).unwrap(), EMPTY_DIFF);
        assert_eq!(
            fs::read_to_string(output.join("run-diff.txt")).unwrap(),
            "C /home/overseer/work"
        );
    }

    #[test]
    fn test_harvest_without_artifacts_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();

        let report = harvest(&phase_run(Phase::Build, "none", 1, ""), tmp.path(), tmp.path()).unwrap();

        assert_eq!(report, HarvestReport::default());
        assert!(!tmp.path().join(OUTPUT_LOG).exists());
        assert!(!tmp.path().join(OUTPUT_DOCUMENT).exists());
        assert!(tmp.path().join("build-diff.txt").exists());
    }

    #[test]
    fn test_reset_bundle_removes_stale_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        for name in [OUTPUT_LOG, OUTPUT_DOCUMENT, "build-diff.txt", "run-diff.txt", "keep.txt"] {
            fs::write(tmp.path().join(name), "stale").unwrap();
        }

        reset_bundle(tmp.path()).unwrap();

        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 1);
        assert!(tmp.path().join("keep.txt").exists());
    }
}
