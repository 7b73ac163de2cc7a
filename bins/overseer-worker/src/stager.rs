/// Archive Stager - places submission and assessment files in the sandbox
///
/// **Policies:**
/// - Submission zip: flatten to base names, never overwrite earlier entries
/// - Submission directory: recursive copy preserving relative paths
/// - Assessment zip: preserve relative paths, overwrite whatever is there
///
/// The assessment is always staged last so grading harness files replace
/// identically named student files.
///
/// Nothing is ever written outside the destination root: entry names are
/// re-assembled from their normal components and any `..` is rejected.

use crate::sandbox::SandboxPaths;
use overseer_common::{TaskEnvelope, TaskError};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::ZipArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Keep only the entry's base name
    Flatten,
    /// Keep the entry's relative path
    Preserve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    Skip,
    Overwrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractPolicy {
    pub layout: Layout,
    pub on_conflict: Conflict,
}

impl ExtractPolicy {
    pub const SUBMISSION: ExtractPolicy = ExtractPolicy {
        layout: Layout::Flatten,
        on_conflict: Conflict::Skip,
    };

    pub const ASSESSMENT: ExtractPolicy = ExtractPolicy {
        layout: Layout::Preserve,
        on_conflict: Conflict::Overwrite,
    };
}

/// One archive entry as listed, in archive order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub index: usize,
    pub name: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Overwrite,
    Skip,
    /// Unsafe name (parent segments or nothing left after normalising)
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedEntry {
    pub index: usize,
    pub source: String,
    /// Relative to the destination root; empty for rejected entries
    pub destination: PathBuf,
    pub action: Action,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagingResult {
    pub submission_files: usize,
    pub assessment_files: usize,
    pub skipped: usize,
    pub rejected: usize,
}

/// Decide where every file entry goes without touching the filesystem.
///
/// `exists` reports whether a relative destination is already occupied
/// before this archive is extracted; collisions inside the archive itself
/// are tracked here.
pub fn plan_extraction<F>(entries: &[ArchiveEntry], policy: ExtractPolicy, exists: F) -> Vec<PlannedEntry>
where
    F: Fn(&Path) -> bool,
{
    let mut planned: HashSet<PathBuf> = HashSet::new();
    let mut plan = Vec::new();

    for entry in entries.iter().filter(|e| !e.is_dir) {
        let Some(destination) = relative_destination(&entry.name, policy.layout) else {
            plan.push(PlannedEntry {
                index: entry.index,
                source: entry.name.clone(),
                destination: PathBuf::new(),
                action: Action::Reject,
            });
            continue;
        };

        let occupied = planned.contains(&destination) || exists(&destination);
        let action = match (occupied, policy.on_conflict) {
            (false, _) => Action::Create,
            (true, Conflict::Skip) => Action::Skip,
            (true, Conflict::Overwrite) => Action::Overwrite,
        };
        planned.insert(destination.clone());
        plan.push(PlannedEntry {
            index: entry.index,
            source: entry.name.clone(),
            destination,
            action,
        });
    }

    plan
}

fn relative_destination(name: &str, layout: Layout) -> Option<PathBuf> {
    let parts: Vec<&str> = name
        .split(['/', '\\'])
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    if parts.iter().any(|p| *p == "..") {
        return None;
    }
    match layout {
        Layout::Flatten => parts.last().map(PathBuf::from),
        Layout::Preserve if parts.is_empty() => None,
        Layout::Preserve => Some(parts.iter().collect()),
    }
}

fn open_archive(path: &Path) -> Result<ZipArchive<File>, TaskError> {
    let file = File::open(path)
        .map_err(|_| TaskError::client(format!("Zip file not found: {}", path.display())))?;
    ZipArchive::new(file)
        .map_err(|e| TaskError::client(format!("Invalid zip file: {} ({})", path.display(), e)))
}

/// List entries in archive order
pub fn list_entries(archive: &mut ZipArchive<File>, path: &Path) -> Result<Vec<ArchiveEntry>, TaskError> {
    (0..archive.len())
        .map(|index| {
            let file = archive.by_index(index).map_err(|e| {
                TaskError::client(format!("Invalid zip file: {} ({})", path.display(), e))
            })?;
            Ok(ArchiveEntry {
                index,
                name: file.name().to_string(),
                is_dir: file.is_dir(),
            })
        })
        .collect()
}

/// Extract `archive_path` into `dest` according to `policy`.
pub fn extract_archive(
    archive_path: &Path,
    dest: &Path,
    policy: ExtractPolicy,
) -> Result<Vec<PlannedEntry>, TaskError> {
    let mut archive = open_archive(archive_path)?;
    let entries = list_entries(&mut archive, archive_path)?;
    let plan = plan_extraction(&entries, policy, |rel| dest.join(rel).exists());

    for step in &plan {
        match step.action {
            Action::Reject => {
                warn!(source = %step.source, "Rejected archive entry with unsafe path");
                continue;
            }
            Action::Skip => {
                info!(
                    source = %step.source,
                    destination = %step.destination.display(),
                    "Skipped archive entry, destination already exists"
                );
                continue;
            }
            Action::Create | Action::Overwrite => {}
        }

        let target = dest.join(&step.destination);
        if policy.on_conflict == Conflict::Overwrite {
            clear_blocking_ancestors(dest, &target)?;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if target.is_dir() {
            fs::remove_dir_all(&target)?;
        }

        let mut file = archive.by_index(step.index).map_err(|e| {
            TaskError::client(format!("Invalid zip file: {} ({})", archive_path.display(), e))
        })?;
        let mut out = File::create(&target)?;
        io::copy(&mut file, &mut out).map_err(|e| {
            TaskError::client(format!(
                "Unreadable entry {} in {}: {}",
                step.source,
                archive_path.display(),
                e
            ))
        })?;

        info!(
            source = %step.source,
            kind = "file",
            destination = %target.display(),
            action = ?step.action,
            "Extracted archive entry"
        );
    }

    Ok(plan)
}

/// Remove any non-directory sitting where `target` needs a parent directory,
/// e.g. a flattened submission file named like an assessment directory.
/// Symlinks are removed rather than followed.
fn clear_blocking_ancestors(dest: &Path, target: &Path) -> io::Result<()> {
    let Ok(relative) = target.strip_prefix(dest) else {
        return Ok(());
    };
    let mut current = dest.to_path_buf();
    let mut components = relative.components().peekable();
    while let Some(component) = components.next() {
        if components.peek().is_none() {
            break;
        }
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if !meta.is_dir() => {
                warn!(path = %current.display(), "Replacing file that blocks an assessment directory");
                fs::remove_file(&current)?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Recursively copy a submission directory, hidden entries included.
/// Symlinks are not followed or recreated.
pub fn copy_directory(src: &Path, dest: &Path) -> Result<usize, TaskError> {
    if !src.is_dir() {
        return Err(TaskError::client(format!(
            "Submission directory not found: {}",
            src.display()
        )));
    }

    let mut copied = 0;
    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| TaskError::server(format!("Failed to walk submission: {}", e)))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| TaskError::server(e.to_string()))?;
        let target = dest.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_symlink() {
            warn!(source = %entry.path().display(), "Skipped symlink in submission");
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
            debug!(
                source = %entry.path().display(),
                kind = "file",
                destination = %target.display(),
                "Copied submission file"
            );
        }
    }

    info!(source = %src.display(), files = copied, "Copied submission directory");
    Ok(copied)
}

/// Confirm every path the envelope references exists and every archive
/// opens, before anything in the sandbox is touched.
pub fn preflight(envelope: &TaskEnvelope) -> Result<(), TaskError> {
    if !envelope.output_path.is_dir() {
        return Err(TaskError::client(format!(
            "Output path not found: {}",
            envelope.output_path.display()
        )));
    }
    if !envelope.submission.exists() {
        return Err(TaskError::client(format!(
            "Submission not found: {}",
            envelope.submission.display()
        )));
    }
    if !envelope.assessment.exists() {
        return Err(TaskError::client(format!(
            "Zip file not found: {}",
            envelope.assessment.display()
        )));
    }
    if envelope.zip_file {
        open_archive(&envelope.submission)?;
    } else if !envelope.submission.is_dir() {
        return Err(TaskError::client(format!(
            "Submission is not a directory: {}",
            envelope.submission.display()
        )));
    }
    open_archive(&envelope.assessment)?;
    Ok(())
}

/// Stage submission then assessment into the sandbox's exec dir.
pub fn stage(envelope: &TaskEnvelope, sandbox: &SandboxPaths) -> Result<StagingResult, TaskError> {
    let mut result = StagingResult::default();

    if envelope.zip_file {
        let plan = extract_archive(&envelope.submission, &sandbox.exec_dir, ExtractPolicy::SUBMISSION)?;
        tally(&plan, &mut result, true);
    } else {
        result.submission_files = copy_directory(&envelope.submission, &sandbox.exec_dir)?;
    }

    let plan = extract_archive(&envelope.assessment, &sandbox.exec_dir, ExtractPolicy::ASSESSMENT)?;
    tally(&plan, &mut result, false);

    info!(
        task_id = envelope.task_id,
        submission_files = result.submission_files,
        assessment_files = result.assessment_files,
        skipped = result.skipped,
        rejected = result.rejected,
        "Staging complete"
    );
    Ok(result)
}

fn tally(plan: &[PlannedEntry], result: &mut StagingResult, submission: bool) {
    for step in plan {
        match step.action {
            Action::Create | Action::Overwrite if submission => result.submission_files += 1,
            Action::Create | Action::Overwrite => result.assessment_files += 1,
            Action::Skip => result.skipped += 1,
            Action::Reject => result.rejected += 1,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    pub(crate) fn write_zip(path: &Path, files: &[(&str, &str)]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        for (name, contents) in files {
            if name.ends_with('/') {
                zip.add_directory(*name, FileOptions::default()).unwrap();
            } else {
                zip.start_file(*name, FileOptions::default()).unwrap();
                zip.write_all(contents.as_bytes()).unwrap();
            }
        }
        zip.finish().unwrap();
    }

    fn entries(names: &[&str]) -> Vec<ArchiveEntry> {
        names
            .iter()
            .enumerate()
            .map(|(index, name)| ArchiveEntry {
                index,
                name: name.to_string(),
                is_dir: name.ends_with('/'),
            })
            .collect()
    }

    #[test]
    fn test_plan_flattens_submission() {
        let plan = plan_extraction(
            &entries(&["main.py", "lib/", "lib/util.py"]),
            ExtractPolicy::SUBMISSION,
            |_| false,
        );
        let destinations: Vec<_> = plan.iter().map(|p| p.destination.clone()).collect();
        assert_eq!(destinations, vec![PathBuf::from("main.py"), PathBuf::from("util.py")]);
        assert!(plan.iter().all(|p| p.action == Action::Create));
    }

    #[test]
    fn test_plan_flatten_keeps_first_of_duplicate_names() {
        let plan = plan_extraction(
            &entries(&["a/util.py", "b/util.py"]),
            ExtractPolicy::SUBMISSION,
            |_| false,
        );
        assert_eq!(plan[0].action, Action::Create);
        assert_eq!(plan[1].action, Action::Skip);
        assert_eq!(plan[1].destination, PathBuf::from("util.py"));
    }

    #[test]
    fn test_plan_assessment_overwrites_existing() {
        let plan = plan_extraction(
            &entries(&["main.py", "tests/test_main.py"]),
            ExtractPolicy::ASSESSMENT,
            |rel| rel == Path::new("main.py"),
        );
        assert_eq!(plan[0].action, Action::Overwrite);
        assert_eq!(plan[1].action, Action::Create);
        assert_eq!(plan[1].destination, PathBuf::from("tests/test_main.py"));
    }

    #[test]
    fn test_plan_rejects_parent_segments() {
        let plan = plan_extraction(
            &entries(&["../../etc/cron.d/evil", "ok/../../x", "safe.txt"]),
            ExtractPolicy::ASSESSMENT,
            |_| false,
        );
        assert_eq!(plan[0].action, Action::Reject);
        assert_eq!(plan[1].action, Action::Reject);
        assert_eq!(plan[2].action, Action::Create);

        let flattened = plan_extraction(&entries(&["../evil.sh"]), ExtractPolicy::SUBMISSION, |_| false);
        assert_eq!(flattened[0].action, Action::Reject);
    }

    #[test]
    fn test_plan_neutralises_absolute_names() {
        let plan = plan_extraction(
            &entries(&["/etc/passwd", "./run.sh", "C:\\temp\\x.txt"]),
            ExtractPolicy::ASSESSMENT,
            |_| false,
        );
        assert_eq!(plan[0].destination, PathBuf::from("etc/passwd"));
        assert_eq!(plan[1].destination, PathBuf::from("run.sh"));
        assert_eq!(plan[2].destination, PathBuf::from("C:/temp/x.txt"));
        assert!(plan.iter().all(|p| p.destination.is_relative()));
    }

    #[test]
    fn test_extract_never_escapes_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("evil.zip");
        write_zip(&archive, &[("../escaped.txt", "boom"), ("inside.txt", "ok")]);
        let dest = tmp.path().join("sandbox");
        fs::create_dir_all(&dest).unwrap();

        let plan = extract_archive(&archive, &dest, ExtractPolicy::ASSESSMENT).unwrap();

        assert!(!tmp.path().join("escaped.txt").exists());
        assert_eq!(fs::read_to_string(dest.join("inside.txt")).unwrap(), "ok");
        assert_eq!(plan.iter().filter(|p| p.action == Action::Reject).count(), 1);
    }

    #[test]
    fn test_invalid_zip_is_client_fault() {
        let tmp = tempfile::tempdir().unwrap();
        let bogus = tmp.path().join("bogus.zip");
        fs::write(&bogus, "definitely not a zip").unwrap();

        let err = extract_archive(&bogus, tmp.path(), ExtractPolicy::ASSESSMENT).unwrap_err();
        assert_eq!(err.status(), 400);
        assert!(err.message().contains("Invalid zip file"));
    }

    #[test]
    fn test_copy_directory_includes_hidden_and_nested() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("submission");
        fs::create_dir_all(src.join("pkg")).unwrap();
        fs::write(src.join(".env"), "SECRET=1").unwrap();
        fs::write(src.join("pkg/mod.py"), "x = 1").unwrap();
        let dest = tmp.path().join("work");
        fs::create_dir_all(&dest).unwrap();

        let copied = copy_directory(&src, &dest).unwrap();

        assert_eq!(copied, 2);
        assert!(dest.join(".env").is_file());
        assert!(dest.join("pkg/mod.py").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_directory_skips_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("submission");
        fs::create_dir_all(&src).unwrap();
        fs::write(tmp.path().join("host-secret"), "secret").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("host-secret"), src.join("link")).unwrap();
        let dest = tmp.path().join("work");
        fs::create_dir_all(&dest).unwrap();

        assert_eq!(copy_directory(&src, &dest).unwrap(), 0);
        assert!(!dest.join("link").exists());
    }

    fn envelope(tmp: &Path, zip_file: bool) -> TaskEnvelope {
        TaskEnvelope {
            task_id: 1,
            overseer_assessment_id: 1,
            docker_image_name_tag: "img:latest".to_string(),
            submission: tmp.join(if zip_file { "submission.zip" } else { "submission" }),
            assessment: tmp.join("assessment.zip"),
            output_path: tmp.join("out"),
            timestamp: "t".to_string(),
            zip_file,
            skip_rm: false,
        }
    }

    fn sandbox(tmp: &Path) -> SandboxPaths {
        let sandbox = SandboxPaths {
            root: tmp.join("sandbox"),
            exec_dir: tmp.join("sandbox/work"),
            out_dir: tmp.join("sandbox/output"),
            container_name: "test".to_string(),
        };
        sandbox.reset().unwrap();
        sandbox
    }

    #[test]
    fn test_stage_flattens_submission_and_assessment_wins() {
        let tmp = tempfile::tempdir().unwrap();
        write_zip(
            &tmp.path().join("submission.zip"),
            &[("main.py", "student"), ("lib/", ""), ("lib/util.py", "helpers")],
        );
        write_zip(
            &tmp.path().join("assessment.zip"),
            &[("main.py", "harness"), ("run.sh", "#!/bin/sh"), ("tests/", ""), ("tests/t.py", "t")],
        );
        let sandbox = sandbox(tmp.path());

        let result = stage(&envelope(tmp.path(), true), &sandbox).unwrap();

        let work = &sandbox.exec_dir;
        assert_eq!(fs::read_to_string(work.join("main.py")).unwrap(), "harness");
        assert_eq!(fs::read_to_string(work.join("util.py")).unwrap(), "helpers");
        assert!(!work.join("lib/util.py").exists());
        assert!(work.join("tests/t.py").is_file());
        assert_eq!(result.submission_files, 2);
        assert_eq!(result.assessment_files, 3);
    }

    #[test]
    fn test_stage_assessment_directory_replaces_flattened_file() {
        let tmp = tempfile::tempdir().unwrap();
        write_zip(
            &tmp.path().join("submission.zip"),
            &[("src/", ""), ("src/tests", "student file"), ("main.py", "student")],
        );
        write_zip(
            &tmp.path().join("assessment.zip"),
            &[("tests/", ""), ("tests/t.py", "harness test")],
        );
        let sandbox = sandbox(tmp.path());

        let result = stage(&envelope(tmp.path(), true), &sandbox).unwrap();

        let work = &sandbox.exec_dir;
        assert!(work.join("tests").is_dir());
        assert_eq!(fs::read_to_string(work.join("tests/t.py")).unwrap(), "harness test");
        assert_eq!(fs::read_to_string(work.join("main.py")).unwrap(), "student");
        assert_eq!(result.assessment_files, 1);
    }

    #[test]
    fn test_clear_blocking_ancestors_leaves_directories() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        fs::write(tmp.path().join("a/b/keep.txt"), "x").unwrap();

        clear_blocking_ancestors(tmp.path(), &tmp.path().join("a/b/new.txt")).unwrap();

        assert!(tmp.path().join("a/b/keep.txt").is_file());
    }

    #[test]
    fn test_stage_copies_directory_submission() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("submission");
        fs::create_dir_all(src.join("src")).unwrap();
        fs::write(src.join("src/Main.java"), "class Main {}").unwrap();
        write_zip(&tmp.path().join("assessment.zip"), &[("build.sh", "javac")]);
        let sandbox = sandbox(tmp.path());

        stage(&envelope(tmp.path(), false), &sandbox).unwrap();

        assert!(sandbox.exec_dir.join("src/Main.java").is_file());
        assert!(sandbox.exec_dir.join("build.sh").is_file());
    }

    #[test]
    fn test_preflight_reports_missing_paths() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("out")).unwrap();

        let err = preflight(&envelope(tmp.path(), true)).unwrap_err();
        assert_eq!(err.status(), 400);
        assert!(err.message().contains("Submission not found"));
    }

    #[test]
    fn test_preflight_requires_output_dir() {
        let tmp = tempfile::tempdir().unwrap();
        write_zip(&tmp.path().join("submission.zip"), &[("a.py", "")]);
        write_zip(&tmp.path().join("assessment.zip"), &[("run.sh", "")]);

        let err = preflight(&envelope(tmp.path(), true)).unwrap_err();
        assert!(err.message().contains("Output path not found"));

        fs::create_dir_all(tmp.path().join("out")).unwrap();
        assert!(preflight(&envelope(tmp.path(), true)).is_ok());
    }

    #[test]
    fn test_preflight_rejects_invalid_assessment() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("out")).unwrap();
        fs::create_dir_all(tmp.path().join("submission")).unwrap();
        fs::write(tmp.path().join("assessment.zip"), "garbage").unwrap();

        let err = preflight(&envelope(tmp.path(), false)).unwrap_err();
        assert!(err.message().contains("Invalid zip file"));
    }
}
