// Failure Signals
// Regex classification of compilation and stall evidence, bank extraction,
// and the small text normalizers shared by the ingestors.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

static BANK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bBANK:(?P<test_id>[^:]+):(?P<status>PASS|FAIL)\b").expect("bank regex")
});
static SMOKE_KV_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\*\s+(?P<key>[A-Za-z0-9_]+)\s*:\s*(?P<value>.*)\s*$").expect("smoke regex"));
static CS_ERROR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\berror\s+(CS\d+)\b").expect("cs regex"));
static BURST_ERROR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bBurst\s+error\s+(BC\d+)\b").expect("burst regex"));
static IL2CPP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bIL2CPP\b|\bil2cpp\.exe\b").expect("il2cpp regex"));
static LINKER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bUnityLinker\b|\blink(er)?\s+error\b|\bld:\s+error\b").expect("linker regex")
});
static SCRIPT_COMPILATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bScriptCompilation\b|\bCompilationFailedException\b").expect("script regex")
});
static BEE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bBeeStall\b|\bLibrary/Bee\b|\bScriptCompilationBuildProgram\b")
        .expect("bee regex")
});
static HANG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bHANG_TIMEOUT\b|\bhung\b|\bhang\b|\bstall\b|\bdeadlock\b|\bno progress\b")
        .expect("hang regex")
});
static BEESTALL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bBeeStall\b").expect("beestall regex"));
static ONDEMAND_TIMEOUT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bOnDemand\b.*\btimeout\b|\btimed out connecting\b|\bWorker timed out\b")
        .expect("ondemand regex")
});
static THREADPOOL_STARVATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bthread pool starvation\b").expect("threadpool regex"));

/// Bank signal extracted from a log tail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankSignal {
    pub found: bool,
    pub status: String,
    pub test_id: Option<String>,
    pub line: Option<String>,
}

impl BankSignal {
    pub fn missing() -> Self {
        Self {
            found: false,
            status: "MISSING".to_string(),
            test_id: None,
            line: None,
        }
    }
}

/// First BANK line in the text, if any.
pub fn extract_bank_signal(text: &str) -> BankSignal {
    for line in text.lines() {
        if !line.contains("BANK:") {
            continue;
        }
        let Some(caps) = BANK_RE.captures(line) else {
            continue;
        };
        let test_id = caps
            .name("test_id")
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty());
        let status = caps
            .name("status")
            .map(|m| m.as_str().to_ascii_uppercase())
            .unwrap_or_else(|| "UNKNOWN".to_string());
        return BankSignal {
            found: true,
            status,
            test_id,
            line: Some(line.trim().to_string()),
        };
    }
    BankSignal::missing()
}

/// Parse a `* key: value` smoke summary body into a flat map.
pub fn parse_smoke_summary(text: &str) -> BTreeMap<String, String> {
    let mut payload = BTreeMap::new();
    for line in text.lines() {
        if let Some(caps) = SMOKE_KV_RE.captures(line.trim()) {
            let key = caps.name("key").map(|m| m.as_str().trim()).unwrap_or("");
            let value = caps.name("value").map(|m| m.as_str().trim()).unwrap_or("");
            if !key.is_empty() {
                payload.insert(key.to_string(), value.to_string());
            }
        }
    }
    payload
}

/// Build/compile failure summary over arbitrary log text. Broad on purpose:
/// it classifies "compilation in general" rather than one subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompilationSignals {
    pub detected: bool,
    pub csharp_error_codes: Vec<String>,
    pub burst_error_codes: Vec<String>,
    pub has_il2cpp: bool,
    pub has_linker: bool,
    pub has_script_compilation: bool,
    pub has_bee: bool,
    pub sample_lines: Vec<String>,
}

pub fn extract_compilation_signals(text: &str) -> CompilationSignals {
    let mut signals = CompilationSignals::default();
    if text.is_empty() {
        return signals;
    }

    let mut csharp: Vec<String> = CS_ERROR_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect();
    csharp.sort();
    csharp.dedup();
    csharp.truncate(10);
    let mut burst: Vec<String> = BURST_ERROR_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect();
    burst.sort();
    burst.dedup();
    burst.truncate(10);

    signals.csharp_error_codes = csharp;
    signals.burst_error_codes = burst;
    signals.has_il2cpp = IL2CPP_RE.is_match(text);
    signals.has_linker = LINKER_RE.is_match(text);
    signals.has_script_compilation = SCRIPT_COMPILATION_RE.is_match(text);
    signals.has_bee = BEE_RE.is_match(text);

    let mut samples = Vec::new();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let lowered = line.to_ascii_lowercase();
        if lowered.contains("burst error bc")
            || lowered.contains("error cs")
            || lowered.contains("compilationfailedexception")
            || lowered.contains("scriptcompilation")
            || lowered.contains("unitylinker")
            || lowered.contains("linker error")
            || lowered.contains("il2cpp")
            || lowered.contains("beestall")
        {
            samples.push(line.to_string());
        }
        if samples.len() >= 15 {
            break;
        }
    }
    signals.sample_lines = samples;

    signals.detected = !signals.csharp_error_codes.is_empty()
        || !signals.burst_error_codes.is_empty()
        || signals.has_il2cpp
        || signals.has_linker
        || signals.has_script_compilation;
    signals
}

/// Hang/stall evidence over arbitrary log text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StallSignals {
    pub detected: bool,
    pub has_hang_timeout: bool,
    pub has_beestall: bool,
    pub has_on_demand_timeout: bool,
    pub has_threadpool_starvation: bool,
    pub sample_lines: Vec<String>,
}

pub fn extract_stall_signals(text: &str) -> StallSignals {
    let mut signals = StallSignals::default();
    if text.is_empty() {
        return signals;
    }
    signals.has_hang_timeout = HANG_RE.is_match(text);
    signals.has_beestall = BEESTALL_RE.is_match(text);
    signals.has_on_demand_timeout = ONDEMAND_TIMEOUT_RE.is_match(text);
    signals.has_threadpool_starvation = THREADPOOL_STARVATION_RE.is_match(text);

    let mut samples = Vec::new();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let lowered = line.to_ascii_lowercase();
        if lowered.contains("hang_timeout")
            || lowered.contains("beestall")
            || lowered.contains("thread pool starvation")
            || (lowered.contains("timed out")
                && (lowered.contains("worker") || lowered.contains("ondemand")))
        {
            samples.push(line.to_string());
        }
        if samples.len() >= 15 {
            break;
        }
    }
    signals.sample_lines = samples;

    signals.detected = signals.has_hang_timeout
        || signals.has_beestall
        || signals.has_on_demand_timeout
        || signals.has_threadpool_starvation;
    signals
}

/// Keep the trailing `max_chars` of a blob.
pub fn normalize_text(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let skip = trimmed.chars().count() - max_chars;
    trimmed.chars().skip(skip).collect()
}

/// Non-empty trimmed lines, keeping the last `max_lines`.
pub fn split_lines(text: &str, max_lines: usize) -> Vec<String> {
    let lines: Vec<String> = text
        .lines()
        .map(|line| line.trim_end().to_string())
        .filter(|line| !line.trim().is_empty())
        .collect();
    if lines.len() <= max_lines {
        lines
    } else {
        lines[lines.len() - max_lines..].to_vec()
    }
}

/// Truthiness over mixed JSON shapes (bool, number, "true"/"yes"/"1").
pub fn normalize_bool(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        serde_json::Value::String(s) => {
            matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "y" | "t")
        }
        _ => false,
    }
}

/// Simulator proof markers pulled from a log tail.
pub fn extract_proof_lines(text: &str, max_lines: usize) -> Vec<String> {
    split_lines(text, 200)
        .into_iter()
        .filter(|line| line.contains("[Anviloop]"))
        .take(max_lines)
        .collect()
}

/// Headline: last error-ish stderr line, else raw signature, else exit reason.
pub fn pick_headline(stderr_lines: &[String], raw_signature: &str, exit_reason: Option<&str>) -> String {
    for line in stderr_lines.iter().rev() {
        let lowered = line.to_ascii_lowercase();
        if lowered.contains("exception") || lowered.contains("error") || lowered.contains("fatal") {
            return line.trim().to_string();
        }
    }
    if !raw_signature.trim().is_empty() {
        return raw_signature.trim().to_string();
    }
    exit_reason.unwrap_or("UNKNOWN").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bank_signal_parses_pass_and_fail() {
        let text = "noise\nBANK:rewind.micro:PASS extra\nmore";
        let bank = extract_bank_signal(text);
        assert!(bank.found);
        assert_eq!(bank.status, "PASS");
        assert_eq!(bank.test_id.as_deref(), Some("rewind.micro"));

        let bank = extract_bank_signal("BANK:B1:fail reason=x");
        assert_eq!(bank.status, "FAIL");

        let bank = extract_bank_signal("no banks here");
        assert!(!bank.found);
        assert_eq!(bank.status, "MISSING");
    }

    #[test]
    fn smoke_summary_grammar() {
        let text = "# Title\n* status: SUCCESS\n* build_id: 20260101_010101_7_deadbeef\nnot a field\n*missing_space: x\n";
        let smoke = parse_smoke_summary(text);
        assert_eq!(smoke.get("status").map(String::as_str), Some("SUCCESS"));
        assert_eq!(
            smoke.get("build_id").map(String::as_str),
            Some("20260101_010101_7_deadbeef")
        );
        assert_eq!(smoke.len(), 2);
    }

    #[test]
    fn compilation_signals_collect_codes_and_samples() {
        let text = "Assets/Foo.cs(10,2): error CS1002: ; expected\nBurst error BC1042: oops\nerror CS1002 again\nIL2CPP step started\n";
        let signals = extract_compilation_signals(text);
        assert!(signals.detected);
        assert_eq!(signals.csharp_error_codes, vec!["CS1002"]);
        assert_eq!(signals.burst_error_codes, vec!["BC1042"]);
        assert!(signals.has_il2cpp);
        assert!(!signals.has_bee);
        assert!(!signals.sample_lines.is_empty());
    }

    #[test]
    fn stall_signals_detect_hangs() {
        let text = "watchdog: HANG_TIMEOUT after 300s\nWorker timed out waiting for import\n";
        let signals = extract_stall_signals(text);
        assert!(signals.detected);
        assert!(signals.has_hang_timeout);
        assert!(signals.has_on_demand_timeout);
        assert!(!signals.has_beestall);
    }

    #[test]
    fn clean_text_has_no_signals() {
        assert!(!extract_compilation_signals("all good").detected);
        assert!(!extract_stall_signals("all good").detected);
    }

    #[test]
    fn normalize_text_keeps_tail() {
        let text = format!("{}END", "x".repeat(100));
        let out = normalize_text(&text, 10);
        assert_eq!(out.len(), 10);
        assert!(out.ends_with("END"));
    }

    #[test]
    fn split_lines_keeps_last_n() {
        let text = "a\n\nb\nc\nd";
        assert_eq!(split_lines(text, 2), vec!["c", "d"]);
        assert_eq!(split_lines(text, 10).len(), 4);
    }

    #[test]
    fn normalize_bool_accepts_mixed_shapes() {
        assert!(normalize_bool(&json!(true)));
        assert!(normalize_bool(&json!(1)));
        assert!(normalize_bool(&json!("Yes")));
        assert!(!normalize_bool(&json!(0)));
        assert!(!normalize_bool(&json!("no")));
        assert!(!normalize_bool(&json!(null)));
    }

    #[test]
    fn headline_prefers_last_error_line() {
        let stderr = vec![
            "InvalidOperationException: early".to_string(),
            "plain line".to_string(),
            "Fatal: late crash".to_string(),
            "tail".to_string(),
        ];
        assert_eq!(pick_headline(&stderr, "", None), "Fatal: late crash");
        assert_eq!(pick_headline(&[], "sig123", None), "sig123");
        assert_eq!(pick_headline(&[], "", Some("TEST_FAIL")), "TEST_FAIL");
        assert_eq!(pick_headline(&[], "", None), "UNKNOWN");
    }

    #[test]
    fn proof_lines_filter_markers() {
        let text = "[Anviloop] proof one\nplain\n[Anviloop][FTL] proof two\n";
        let proof = extract_proof_lines(text, 10);
        assert_eq!(proof.len(), 2);
    }
}
