// Result Bundles
// One reader over the two physical shapes a result bundle arrives in:
// a zip archive or an already-extracted directory.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde_json::Value;

/// Read access to a result bundle's members by archive-relative name.
pub enum BundleReader {
    Zip {
        path: PathBuf,
        archive: zip::ZipArchive<File>,
    },
    Dir {
        path: PathBuf,
    },
}

impl BundleReader {
    pub fn open(path: &Path) -> Option<Self> {
        if path.is_dir() {
            return Some(BundleReader::Dir {
                path: path.to_path_buf(),
            });
        }
        let file = File::open(path).ok()?;
        let archive = zip::ZipArchive::new(file).ok()?;
        Some(BundleReader::Zip {
            path: path.to_path_buf(),
            archive,
        })
    }

    pub fn source_path(&self) -> &Path {
        match self {
            BundleReader::Zip { path, .. } => path,
            BundleReader::Dir { path } => path,
        }
    }

    pub fn has_entry(&mut self, member: &str) -> bool {
        match self {
            BundleReader::Zip { archive, .. } => archive.by_name(member).is_ok(),
            BundleReader::Dir { path } => path.join(member).exists(),
        }
    }

    fn read_bytes(&mut self, member: &str) -> Option<Vec<u8>> {
        match self {
            BundleReader::Zip { archive, .. } => {
                let mut entry = archive.by_name(member).ok()?;
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf).ok()?;
                Some(buf)
            }
            BundleReader::Dir { path } => std::fs::read(path.join(member)).ok(),
        }
    }

    /// Parse a JSON member; missing or malformed both read as None.
    pub fn read_json(&mut self, member: &str) -> Option<Value> {
        let bytes = self.read_bytes(member)?;
        serde_json::from_slice(&bytes).ok()
    }

    /// First member of the list that parses as JSON.
    pub fn read_json_any(&mut self, members: &[&str]) -> Option<Value> {
        members.iter().find_map(|member| self.read_json(member))
    }

    /// Trailing `max_bytes` of a text member, lossily decoded.
    pub fn read_tail_text(&mut self, member: &str, max_bytes: usize) -> String {
        let Some(bytes) = self.read_bytes(member) else {
            return String::new();
        };
        let slice = if bytes.len() > max_bytes {
            &bytes[bytes.len() - max_bytes..]
        } else {
            &bytes[..]
        };
        String::from_utf8_lossy(slice).to_string()
    }

    /// Leading `max_bytes` of a text member.
    pub fn read_head_text(&mut self, member: &str, max_bytes: usize) -> String {
        let Some(bytes) = self.read_bytes(member) else {
            return String::new();
        };
        let slice = if bytes.len() > max_bytes {
            &bytes[..max_bytes]
        } else {
            &bytes[..]
        };
        String::from_utf8_lossy(slice).to_string()
    }
}

/// Metric values from the last parsed lines of the telemetry tail.
pub fn parse_telemetry_tail_metrics(reader: &mut BundleReader) -> serde_json::Map<String, Value> {
    let mut metrics = serde_json::Map::new();
    let mut text = reader.read_tail_text("out/telemetry.ndjson", 262_144);
    if text.is_empty() {
        text = reader.read_tail_text("telemetry.ndjson", 262_144);
    }
    if text.is_empty() {
        return metrics;
    }
    let lines: Vec<&str> = text
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .collect();
    let start = lines.len().saturating_sub(200);
    for line in &lines[start..] {
        let Ok(payload) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let Some(obj) = payload.as_object() else {
            continue;
        };
        let name = obj
            .get("metric")
            .or_else(|| obj.get("key"))
            .and_then(|v| v.as_str());
        let (Some(name), Some(value)) = (name, obj.get("value")) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        metrics.insert(name.to_string(), value.clone());
    }
    metrics
}

/// Substring probe for a telemetry key across head and tail windows.
pub fn telemetry_contains_key(reader: &mut BundleReader, key: &str) -> bool {
    for member in ["out/telemetry.ndjson", "telemetry.ndjson"] {
        if reader.read_head_text(member, 1_048_576).contains(key) {
            return true;
        }
        if reader.read_tail_text(member, 1_048_576).contains(key) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn make_zip(temp: &tempfile::TempDir, members: &[(&str, &str)]) -> PathBuf {
        let path = temp.path().join("result_test.zip");
        let file = File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        for (name, body) in members {
            writer.start_file(*name, options).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    fn make_dir(temp: &tempfile::TempDir, members: &[(&str, &str)]) -> PathBuf {
        let root = temp.path().join("result_dir");
        for (name, body) in members {
            let dest = root.join(name);
            std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
            std::fs::write(dest, body).unwrap();
        }
        root
    }

    #[test]
    fn zip_and_dir_read_identically() {
        let members = [
            ("meta.json", r#"{"job_id":"j1"}"#),
            ("out/run_summary.json", r#"{"exit_reason":"OK"}"#),
            ("out/player.log", "line1\nBANK:B1:PASS\n"),
        ];
        let temp = tempfile::tempdir().unwrap();
        let zip_path = make_zip(&temp, &members);
        let dir_path = make_dir(&temp, &members);

        for path in [zip_path, dir_path] {
            let mut reader = BundleReader::open(&path).unwrap();
            assert!(reader.has_entry("meta.json"));
            assert!(!reader.has_entry("out/watchdog.json"));
            let meta = reader.read_json("meta.json").unwrap();
            assert_eq!(meta["job_id"], json!("j1"));
            let tail = reader.read_tail_text("out/player.log", 10);
            assert!(tail.contains("PASS"));
            assert!(reader.read_json("missing.json").is_none());
        }
    }

    #[test]
    fn telemetry_tail_metrics_take_last_values() {
        let telemetry = concat!(
            "{\"type\":\"metric\",\"key\":\"m\",\"value\":1}\n",
            "{\"type\":\"event\"}\n",
            "broken json\n",
            "{\"type\":\"metric\",\"metric\":\"m\",\"value\":7}\n",
            "{\"type\":\"metric\",\"key\":\"telemetry.truncated\",\"value\":0}\n",
        );
        let temp = tempfile::tempdir().unwrap();
        let path = make_zip(&temp, &[("out/telemetry.ndjson", telemetry)]);
        let mut reader = BundleReader::open(&path).unwrap();
        let metrics = parse_telemetry_tail_metrics(&mut reader);
        assert_eq!(metrics.get("m"), Some(&json!(7)));
        assert_eq!(metrics.get("telemetry.truncated"), Some(&json!(0)));
    }

    #[test]
    fn telemetry_key_probe_checks_both_members() {
        let temp = tempfile::tempdir().unwrap();
        let path = make_dir(
            &temp,
            &[("telemetry.ndjson", "{\"key\":\"telemetry.heartbeat\",\"value\":1}\n")],
        );
        let mut reader = BundleReader::open(&path).unwrap();
        assert!(telemetry_contains_key(&mut reader, "telemetry.heartbeat"));
        assert!(!telemetry_contains_key(&mut reader, "telemetry.oracle.heartbeat"));
    }
}
