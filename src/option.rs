//! Compiler options and deterministic option-list merging

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

/// Key used by [`CompileOption::optimization`].
pub const OPT_LEVEL_KEY: &str = "opt-level";

/// A single compiler argument, optionally tagged with a key.
///
/// Options that share a key are alternative settings of the same axis
/// (optimization level, data type, dataset size, ...). Key-less options are
/// additive and always emitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompileOption {
    #[serde(default)]
    key: Option<String>,
    prefix: String,
    #[serde(default)]
    value: String,
}

fn flag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(-include|-isystem|-iquote|-[DIULlOo]|--?[A-Za-z][A-Za-z0-9_-]*=)(.+)$")
            .expect("flag pattern is a valid regex")
    })
}

/// Build a key-less option from a raw flag such as `-DMINI_DATASET` or `-O2`.
pub fn make_option(flag_spec: impl Into<String>) -> CompileOption {
    let flag_spec = flag_spec.into();
    let (prefix, value) = match flag_pattern().captures(&flag_spec) {
        Some(caps) => (caps[1].to_string(), caps[2].to_string()),
        None => (flag_spec.clone(), String::new()),
    };
    CompileOption {
        key: None,
        prefix,
        value,
    }
}

/// Build a keyed option; later options with the same key override earlier ones.
pub fn make_keyed_option(
    key: impl Into<String>,
    prefix: impl Into<String>,
    value: impl Into<String>,
) -> CompileOption {
    CompileOption {
        key: Some(key.into()),
        prefix: prefix.into(),
        value: value.into(),
    }
}

impl CompileOption {
    /// `-D<name>`, key-less.
    pub fn define(name: impl Into<String>) -> Self {
        Self {
            key: None,
            prefix: "-D".to_string(),
            value: name.into(),
        }
    }

    /// `-D<name>=<value>`, keyed by the macro name.
    pub fn define_value(name: &str, value: impl fmt::Display) -> Self {
        make_keyed_option(format!("define:{}", name), "-D", format!("{}={}", name, value))
    }

    pub fn include_dir(path: impl AsRef<Path>) -> Self {
        Self {
            key: None,
            prefix: "-I".to_string(),
            value: path.as_ref().to_string_lossy().into_owned(),
        }
    }

    /// `-O<level>`, keyed so that only one optimization level survives a merge.
    pub fn optimization(level: impl fmt::Display) -> Self {
        make_keyed_option(OPT_LEVEL_KEY, "-O", level.to_string())
    }

    /// Attach (or replace) the key of this option.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// The literal argument passed to the compiler.
    pub fn flag_text(&self) -> String {
        format!("{}{}", self.prefix, self.value)
    }
}

impl fmt::Display for CompileOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix)?;
        f.write_str(&self.value)
    }
}

/// Merge an ordered option list.
///
/// Keyed options keep the slot where their key was first seen but take the
/// value of the last option with that key. Key-less options pass through in
/// order.
pub fn merge_options(options: &[CompileOption]) -> Vec<CompileOption> {
    let mut merged: Vec<CompileOption> = Vec::with_capacity(options.len());
    let mut slots: HashMap<&str, usize> = HashMap::new();

    for option in options {
        match option.key.as_deref() {
            Some(key) => match slots.get(key) {
                Some(&slot) => merged[slot] = option.clone(),
                None => {
                    slots.insert(key, merged.len());
                    merged.push(option.clone());
                }
            },
            None => merged.push(option.clone()),
        }
    }

    merged
}

/// Merge and serialize into compiler arguments.
pub fn to_args(options: &[CompileOption]) -> Vec<String> {
    merge_options(options).iter().map(CompileOption::flag_text).collect()
}
