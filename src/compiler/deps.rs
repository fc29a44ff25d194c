//! Header dependency manifests, so a reused artifact is never older than its headers
//!
//! The fingerprint covers sources and options only. Next to each artifact a
//! `<stem>.deps` manifest records the headers it was built from and their
//! md5. An existing artifact is reused only while every recorded header
//! still has the recorded contents.

use crate::error::{CompilerError, Result};
use crate::version::BuildRequest;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

/// Extensions treated as headers when a backend cannot list its dependencies.
pub const HEADER_EXTENSIONS: &[&str] = &["h", "hh", "hpp", "hxx", "inc", "def"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DependencyEntry {
    path: PathBuf,
    md5: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DependencyManifest {
    files: Vec<DependencyEntry>,
}

pub fn manifest_path(artifact_path: &Path) -> PathBuf {
    artifact_path.with_extension("deps")
}

/// Make-style dependency file a toolchain writes next to `output`.
pub fn depfile_path(output: &Path) -> PathBuf {
    let mut name: OsString = output.file_name().map(OsString::from).unwrap_or_default();
    name.push(".d");
    output.with_file_name(name)
}

fn push_token(token: &mut String, in_prerequisites: bool, deps: &mut Vec<PathBuf>) {
    if in_prerequisites && !token.is_empty() {
        let path = PathBuf::from(token.as_str());
        if !deps.contains(&path) {
            deps.push(path);
        }
    }
    token.clear();
}

/// Prerequisites of every rule in a make-style depfile (`out.so: a.c a.h \`).
pub fn parse_depfile(text: &str) -> Vec<PathBuf> {
    let mut deps = Vec::new();
    let mut token = String::new();
    let mut in_prerequisites = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.peek() {
                Some('\n') => {
                    chars.next();
                    push_token(&mut token, in_prerequisites, &mut deps);
                }
                Some('\r') => {
                    chars.next();
                    if chars.peek() == Some(&'\n') {
                        chars.next();
                    }
                    push_token(&mut token, in_prerequisites, &mut deps);
                }
                Some(' ') => {
                    chars.next();
                    token.push(' ');
                }
                _ => token.push('\\'),
            },
            '$' if chars.peek() == Some(&'$') => {
                chars.next();
                token.push('$');
            }
            ':' if !in_prerequisites
                && matches!(chars.peek(), None | Some(' ') | Some('\t') | Some('\n') | Some('\r')) =>
            {
                token.clear();
                in_prerequisites = true;
            }
            '\n' => {
                push_token(&mut token, in_prerequisites, &mut deps);
                in_prerequisites = false;
            }
            ' ' | '\t' | '\r' => push_token(&mut token, in_prerequisites, &mut deps),
            c => token.push(c),
        }
    }
    push_token(&mut token, in_prerequisites, &mut deps);
    deps
}

fn is_header(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| HEADER_EXTENSIONS.contains(&ext))
}

/// Conservative dependency set: header files next to the sources and in the
/// include directories, plus files forced in with `-include`.
pub fn header_candidates(request: &BuildRequest) -> Vec<PathBuf> {
    let source_dirs = request.sources().iter().map(|source| match source.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    });
    let mut dirs: Vec<PathBuf> = Vec::new();
    for dir in source_dirs.chain(request.include_dirs().iter().cloned()) {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }

    let mut headers = Vec::new();
    for dir in &dirs {
        let Ok(entries) = fs::read_dir(dir) else {
            continue;
        };
        headers.extend(
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_file() && is_header(path)),
        );
    }
    headers.extend(
        request
            .options()
            .iter()
            .filter(|option| option.prefix() == "-include")
            .map(|option| PathBuf::from(option.value())),
    );

    headers.sort();
    headers.dedup();
    headers
}

fn content_hash(path: &Path) -> Option<String> {
    fs::read(path).ok().map(|bytes| hex::encode(md5::compute(bytes).0))
}

/// Record `files` and their current contents in the manifest at `path`.
pub fn write_manifest(path: &Path, files: &[PathBuf]) -> Result<()> {
    let entries = files
        .iter()
        .filter_map(|file| match content_hash(file) {
            Some(md5) => Some(DependencyEntry {
                path: file.clone(),
                md5,
            }),
            None => {
                log::debug!("Dependency {} is not readable, not tracked", file.display());
                None
            }
        })
        .collect();
    let manifest = DependencyManifest { files: entries };
    let text = serde_json::to_string_pretty(&manifest)
        .map_err(|e| CompilerError::invalid_format(format!("dependency manifest: {}", e)))?;
    fs::write(path, text)?;
    Ok(())
}

/// Whether every file recorded in the manifest at `path` is unchanged.
///
/// A missing or unreadable manifest counts as stale.
pub fn manifest_is_current(path: &Path) -> bool {
    let manifest: DependencyManifest = match fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
    {
        Some(manifest) => manifest,
        None => {
            log::debug!("No usable dependency manifest at {}", path.display());
            return false;
        }
    };

    manifest.files.iter().all(|entry| {
        let current = content_hash(&entry.path).as_deref() == Some(entry.md5.as_str());
        if !current {
            log::info!("{} changed since it was last compiled", entry.path.display());
        }
        current
    })
}
