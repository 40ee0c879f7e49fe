//! Combiner configuration
//!
//! Built once (usually from TOML) and passed by reference into
//! [`crate::combine::combine`].
//!
//! ```toml
//! processors = "0-3,7"
//! append = true
//!
//! [[inputs]]
//! dir = "/scratch/run"
//! root = "crash000"
//!
//! [output]
//! dir = "/scratch/run"
//! root = "crash"
//!
//! [live]
//! poll_interval_ms = 500
//! timeout_secs = 600
//! ```

use crate::error::{MiliError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::Validate;

/// Where a family lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct FamilyLocation {
    pub dir: PathBuf,
    #[validate(length(min = 1))]
    pub root: String,
}

impl FamilyLocation {
    pub fn new(dir: impl Into<PathBuf>, root: impl Into<String>) -> Self {
        FamilyLocation {
            dir: dir.into(),
            root: root.into(),
        }
    }
}

/// Polling settings for combining a run that is still writing states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct LiveWait {
    #[validate(range(min = 1))]
    pub poll_interval_ms: u64,
    #[validate(range(min = 1))]
    pub timeout_secs: u64,
}

impl LiveWait {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_buffer_qty() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CombineConfig {
    /// Per-processor input families; processor `p` is `inputs[p]`
    #[validate(length(min = 1))]
    pub inputs: Vec<FamilyLocation>,

    #[validate(nested)]
    pub output: FamilyLocation,

    /// Processor selection list such as `"0-3,7"`; all when absent
    #[serde(default)]
    pub processors: Option<String>,

    /// First input state to combine (non-append runs)
    #[serde(default)]
    pub start_state: Option<usize>,

    /// Last input state to combine, inclusive
    #[serde(default)]
    pub stop_state: Option<usize>,

    /// Resume into an existing output instead of replacing it
    #[serde(default)]
    pub append: bool,

    #[serde(default)]
    #[validate(nested)]
    pub live: Option<LiveWait>,

    /// Number node/element objects without labels by processor offset
    #[serde(default)]
    pub synthesize_labels: bool,

    /// Read buffers per object-ordered input subrecord
    #[serde(default = "default_buffer_qty")]
    #[validate(range(min = 1))]
    pub buffer_qty: usize,

    /// State records per output state file (0 = unlimited)
    #[serde(default)]
    pub states_per_file: usize,
}

impl CombineConfig {
    pub fn new(inputs: Vec<FamilyLocation>, output: FamilyLocation) -> Self {
        CombineConfig {
            inputs,
            output,
            processors: None,
            start_state: None,
            stop_state: None,
            append: false,
            live: None,
            synthesize_labels: false,
            buffer_qty: default_buffer_qty(),
            states_per_file: 0,
        }
    }

    pub fn with_processors(mut self, selection: &str) -> Self {
        self.processors = Some(selection.to_string());
        self
    }

    pub fn with_state_range(mut self, start: Option<usize>, stop: Option<usize>) -> Self {
        self.start_state = start;
        self.stop_state = stop;
        self
    }

    pub fn with_append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    pub fn with_live_wait(mut self, poll_interval_ms: u64, timeout_secs: u64) -> Self {
        self.live = Some(LiveWait {
            poll_interval_ms,
            timeout_secs,
        });
        self
    }

    pub fn with_synthesized_labels(mut self) -> Self {
        self.synthesize_labels = true;
        self
    }

    pub fn with_buffer_qty(mut self, qty: usize) -> Self {
        self.buffer_qty = qty;
        self
    }

    pub fn with_states_per_file(mut self, states: usize) -> Self {
        self.states_per_file = states;
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: CombineConfig =
            toml::from_str(text).map_err(|e| MiliError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| MiliError::Config(e.to_string()))
    }

    /// Validate field rules and cross-field constraints
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| MiliError::Config(e.to_string()))?;
        for input in &self.inputs {
            input
                .validate()
                .map_err(|e| MiliError::Config(e.to_string()))?;
        }
        if let (Some(start), Some(stop)) = (self.start_state, self.stop_state) {
            if start > stop {
                return Err(MiliError::Config(format!(
                    "start state {} is after stop state {}",
                    start, stop
                )));
            }
        }
        if self.append && (self.start_state.is_some() || self.stop_state.is_some()) {
            return Err(MiliError::Config(
                "a state range cannot be combined with append".to_string(),
            ));
        }
        Ok(())
    }

    /// Selected processor indices, ascending
    pub fn selected_processors(&self) -> Result<Vec<usize>> {
        match &self.processors {
            None => Ok((0..self.inputs.len()).collect()),
            Some(list) => parse_selection(list, self.inputs.len()),
        }
    }
}

/// Parse a selection list like `"0-3, 7"` into sorted unique indices below `limit`
pub fn parse_selection(list: &str, limit: usize) -> Result<Vec<usize>> {
    let item = Regex::new(r"^\s*(\d+)\s*(?:-\s*(\d+)\s*)?$")
        .map_err(|e| MiliError::MalformedControlString(e.to_string()))?;
    let malformed = || MiliError::MalformedControlString(list.to_string());

    let mut selected = Vec::new();
    for part in list.split(',') {
        let caps = item.captures(part).ok_or_else(malformed)?;
        let first: usize = caps[1].parse().map_err(|_| malformed())?;
        let last: usize = match caps.get(2) {
            Some(m) => m.as_str().parse().map_err(|_| malformed())?,
            None => first,
        };
        if last < first || last >= limit {
            return Err(malformed());
        }
        selected.extend(first..=last);
    }
    selected.sort_unstable();
    selected.dedup();
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
processors = "0-1"
append = true

[[inputs]]
dir = "/tmp/run"
root = "p000"

[[inputs]]
dir = "/tmp/run"
root = "p001"

[[inputs]]
dir = "/tmp/run"
root = "p002"

[output]
dir = "/tmp/out"
root = "global"

[live]
poll_interval_ms = 250
timeout_secs = 30
"#;

    #[test]
    fn test_parse_toml() {
        let config = CombineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.inputs.len(), 3);
        assert_eq!(config.output.root, "global");
        assert!(config.append);
        assert_eq!(config.buffer_qty, 1);
        assert_eq!(config.live.unwrap().poll_interval(), Duration::from_millis(250));
        assert_eq!(config.selected_processors().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = CombineConfig::new(
            vec![FamilyLocation::new("/a", "p0")],
            FamilyLocation::new("/b", "out"),
        )
        .with_buffer_qty(4);
        let text = config.to_toml_string().unwrap();
        assert_eq!(CombineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_validation_failures() {
        let empty = CombineConfig::new(vec![], FamilyLocation::new("/b", "out"));
        assert!(matches!(empty.check(), Err(MiliError::Config(_))));

        let bad_root = CombineConfig::new(
            vec![FamilyLocation::new("/a", "")],
            FamilyLocation::new("/b", "out"),
        );
        assert!(bad_root.check().is_err());

        let bad_live = CombineConfig::new(
            vec![FamilyLocation::new("/a", "p0")],
            FamilyLocation::new("/b", "out"),
        )
        .with_live_wait(0, 10);
        assert!(bad_live.check().is_err());

        let bad_range = CombineConfig::new(
            vec![FamilyLocation::new("/a", "p0")],
            FamilyLocation::new("/b", "out"),
        )
        .with_state_range(Some(5), Some(2));
        assert!(bad_range.check().is_err());

        assert!(CombineConfig::from_toml_str("inputs = 3").is_err());
    }

    #[test]
    fn test_selection_lists() {
        assert_eq!(parse_selection("3, 0-1,1", 4).unwrap(), vec![0, 1, 3]);
        assert_eq!(parse_selection("2", 4).unwrap(), vec![2]);
        for bad in ["", "1-", "a", "3-1", "0-4", "1;2"] {
            assert!(
                matches!(
                    parse_selection(bad, 4),
                    Err(MiliError::MalformedControlString(_))
                ),
                "{} should be rejected",
                bad
            );
        }
    }
}
