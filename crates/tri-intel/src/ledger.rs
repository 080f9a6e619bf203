// Error Ledger
// Minimal Markdown grammar: a line starting with `ERR-` opens an entry,
// `- key: value` lines fill its fields.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static FIELD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-\s*([A-Za-z0-9_]+):\s*(.*)$").expect("ledger field regex"));

/// One recurring-error entry from the ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub symptom: String,
    pub signature: String,
    pub rootcause: String,
    pub fix: String,
    pub prevention: String,
    pub verification: String,
    pub commit: String,
    pub raw_text: String,
}

impl LedgerEntry {
    /// Text fed to the embedder for this entry.
    pub fn embed_text(&self) -> String {
        [
            self.symptom.as_str(),
            self.signature.as_str(),
            self.rootcause.as_str(),
            self.fix.as_str(),
            self.prevention.as_str(),
        ]
        .join("\n")
        .trim()
        .to_string()
    }
}

/// Parse the full ledger document into entries.
pub fn parse_ledger_entries(ledger_text: &str) -> Vec<LedgerEntry> {
    let mut blocks: Vec<(String, Vec<String>)> = Vec::new();
    let mut current: Option<(String, Vec<String>)> = None;

    for line in ledger_text.lines() {
        if line.starts_with("ERR-") {
            if let Some(block) = current.take() {
                blocks.push(block);
            }
            current = Some((line.trim().to_string(), Vec::new()));
        } else if let Some((_, lines)) = current.as_mut() {
            lines.push(line.trim_end().to_string());
        }
    }
    if let Some(block) = current {
        blocks.push(block);
    }

    blocks
        .into_iter()
        .map(|(id, lines)| {
            let mut entry = LedgerEntry {
                id,
                raw_text: lines.join("\n").trim().to_string(),
                ..Default::default()
            };
            for line in &lines {
                let Some(caps) = FIELD_RE.captures(line) else {
                    continue;
                };
                let key = caps.get(1).map(|m| m.as_str().to_ascii_lowercase());
                let value = caps
                    .get(2)
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default();
                match key.as_deref() {
                    Some("symptom") => entry.symptom = value,
                    Some("signature") => entry.signature = value,
                    Some("rootcause") => entry.rootcause = value,
                    Some("fix") => entry.fix = value,
                    Some("prevention") => entry.prevention = value,
                    Some("verification") => entry.verification = value,
                    Some("commit") => entry.commit = value,
                    _ => {}
                }
            }
            entry
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEDGER: &str = "\
# Recurring Errors

ERR-0001 burst compile stall
- Symptom: build never finishes
- Signature: BeeStall in ScriptCompilationBuildProgram
- RootCause: stale bee cache
- Fix: delete Library/Bee and rebuild
- Prevention: nightly cache sweep
- Verification: pipeline_smoke green twice
- Commit: abc123

Some prose between entries is ignored.

ERR-0002 telemetry truncated
- Symptom: telemetry.truncated=1
- Fix: raise pack caps
";

    #[test]
    fn parses_entries_and_fields() {
        let entries = parse_ledger_entries(LEDGER);
        assert_eq!(entries.len(), 2);

        let first = &entries[0];
        assert_eq!(first.id, "ERR-0001 burst compile stall");
        assert_eq!(first.symptom, "build never finishes");
        assert_eq!(first.fix, "delete Library/Bee and rebuild");
        assert_eq!(first.commit, "abc123");
        assert!(first.raw_text.contains("stale bee cache"));

        let second = &entries[1];
        assert_eq!(second.id, "ERR-0002 telemetry truncated");
        assert_eq!(second.symptom, "telemetry.truncated=1");
        assert!(second.rootcause.is_empty());
    }

    #[test]
    fn embed_text_joins_salient_fields() {
        let entries = parse_ledger_entries(LEDGER);
        let text = entries[0].embed_text();
        assert!(text.contains("build never finishes"));
        assert!(text.contains("nightly cache sweep"));
        assert!(!text.contains("abc123"));
    }

    #[test]
    fn empty_ledger_parses_to_nothing() {
        assert!(parse_ledger_entries("").is_empty());
        assert!(parse_ledger_entries("# just a title\n").is_empty());
    }
}
