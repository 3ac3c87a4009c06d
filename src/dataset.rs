//! Paired chat datasets
//!
//! One JSON object per line:
//!
//! ```json
//! {"id": "squad_000001_ctx", "condition": "with_context", "messages": [{"role": "user", "content": "..."}]}
//! ```
//!
//! Records come in strict alternation: the first condition of the pairing
//! scheme, then the second, for the same base example.

use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::chat::ChatMessage;

/// A single conversation under one condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: String,
    pub condition: String,
    pub messages: Vec<ChatMessage>,
}

impl ChatRecord {
    /// Record id with its trailing `_<suffix>` removed
    pub fn base_id(&self) -> &str {
        self.id
            .rsplit_once('_')
            .map_or(self.id.as_str(), |(base, _)| base)
    }
}

/// Which two conditions form a pair, in file order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingScheme {
    /// `with_context` then `no_context`
    Context,
    /// `unsafe` then `safe`
    Safety,
}

impl PairingScheme {
    /// Condition names, first then second
    pub fn conditions(&self) -> (&'static str, &'static str) {
        match self {
            PairingScheme::Context => ("with_context", "no_context"),
            PairingScheme::Safety => ("unsafe", "safe"),
        }
    }
}

impl fmt::Display for PairingScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingScheme::Context => write!(f, "context"),
            PairingScheme::Safety => write!(f, "safety"),
        }
    }
}

impl FromStr for PairingScheme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "context" => Ok(PairingScheme::Context),
            "safety" => Ok(PairingScheme::Safety),
            other => anyhow::bail!("Unknown pairing scheme '{other}' (expected context or safety)"),
        }
    }
}

/// Two records of the same base example
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionPair {
    pub base_id: String,
    pub first: ChatRecord,
    pub second: ChatRecord,
}

/// Resolve a directory to the single `.jsonl` file it contains
fn resolve_jsonl(path: &Path) -> Result<PathBuf> {
    if !path.is_dir() {
        return Ok(path.to_path_buf());
    }
    let mut candidates: Vec<PathBuf> = fs::read_dir(path)
        .with_context(|| format!("Failed to read directory {}", path.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
        .collect();
    candidates.sort();

    match candidates.as_slice() {
        [single] => Ok(single.clone()),
        _ => anyhow::bail!(
            "Expected exactly one .jsonl in directory {}, found {}",
            path.display(),
            candidates.len()
        ),
    }
}

/// Load records from a JSONL file, or a directory holding exactly one.
///
/// Blank lines are skipped.
pub fn load_jsonl(path: impl AsRef<Path>) -> Result<Vec<ChatRecord>> {
    let path = resolve_jsonl(path.as_ref())?;
    let file = fs::File::open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut records = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: ChatRecord = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid record", path.display(), lineno + 1))?;
        records.push(record);
    }
    Ok(records)
}

/// Group alternating records into pairs.
///
/// Odd record counts and out-of-order conditions are structural errors.
pub fn group_into_pairs(
    records: Vec<ChatRecord>,
    scheme: PairingScheme,
) -> Result<Vec<ConditionPair>> {
    anyhow::ensure!(
        records.len() % 2 == 0,
        "Record count must be even for {scheme} pairing, got {}",
        records.len()
    );
    let (first_cond, second_cond) = scheme.conditions();

    let mut pairs = Vec::with_capacity(records.len() / 2);
    let mut iter = records.into_iter().enumerate();
    while let (Some((i, first)), Some((j, second))) = (iter.next(), iter.next()) {
        anyhow::ensure!(
            first.condition == first_cond,
            "Alternation break at index {i}: expected {first_cond}, got {}",
            first.condition
        );
        anyhow::ensure!(
            second.condition == second_cond,
            "Alternation break at index {j}: expected {second_cond}, got {}",
            second.condition
        );
        pairs.push(ConditionPair {
            base_id: first.base_id().to_string(),
            first,
            second,
        });
    }
    Ok(pairs)
}

/// Deterministic random subset of `n` pairs
pub fn sample_pairs(pairs: &[ConditionPair], n: usize, seed: u64) -> Result<Vec<ConditionPair>> {
    anyhow::ensure!(
        n <= pairs.len(),
        "Sample size {n} exceeds number of pairs {}",
        pairs.len()
    );
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut sampled = pairs.to_vec();
    sampled.shuffle(&mut rng);
    sampled.truncate(n);
    Ok(sampled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, condition: &str) -> ChatRecord {
        ChatRecord {
            id: id.to_string(),
            condition: condition.to_string(),
            messages: vec![ChatMessage::user("q")],
        }
    }

    #[test]
    fn test_base_id() {
        assert_eq!(record("squad_000001_ctx", "x").base_id(), "squad_000001");
        assert_eq!(record("plain", "x").base_id(), "plain");
    }

    #[test]
    fn test_group_safety_pairs() {
        let records = vec![
            record("p1_unsafe", "unsafe"),
            record("p1_safe", "safe"),
            record("p2_unsafe", "unsafe"),
            record("p2_safe", "safe"),
        ];
        let pairs = group_into_pairs(records, PairingScheme::Safety).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1].base_id, "p2");
        assert_eq!(pairs[1].second.condition, "safe");
    }

    #[test]
    fn test_group_rejects_odd_and_swapped() {
        let odd = vec![record("a_1", "with_context")];
        assert!(group_into_pairs(odd, PairingScheme::Context).is_err());

        let swapped = vec![record("a_2", "no_context"), record("a_1", "with_context")];
        let err = group_into_pairs(swapped, PairingScheme::Context).unwrap_err();
        assert!(err.to_string().contains("index 0"));
    }

    #[test]
    fn test_sample_pairs_deterministic() {
        let records: Vec<ChatRecord> = (0..10)
            .flat_map(|i| {
                [
                    record(&format!("ex{i}_a"), "with_context"),
                    record(&format!("ex{i}_b"), "no_context"),
                ]
            })
            .collect();
        let pairs = group_into_pairs(records, PairingScheme::Context).unwrap();

        let a = sample_pairs(&pairs, 4, 42).unwrap();
        let b = sample_pairs(&pairs, 4, 42).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 4);
        assert_eq!(sample_pairs(&pairs, 10, 7).unwrap().len(), 10);
        assert!(sample_pairs(&pairs, 11, 42).is_err());
    }

    #[test]
    fn test_scheme_parse() {
        assert_eq!("Safety".parse::<PairingScheme>().unwrap(), PairingScheme::Safety);
        assert!("nope".parse::<PairingScheme>().is_err());
    }
}
