// Subprocess Supervision
// Spawn the simulator, drain merged stdout/stderr line-by-line, enforce the
// wall-clock timeout, and collect bank signals and telemetry overrides.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use tri_types::BankResult;

/// How long to wait for the exit code after EOF or kill.
const EXIT_REAP_BUDGET: Duration = Duration::from_secs(5);
/// Poll interval for the supervision loop.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of one supervised child process.
#[derive(Debug)]
pub struct SuperviseOutcome {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub bank_results: Vec<BankResult>,
    pub telemetry_out: Option<PathBuf>,
}

/// Parse a `BANK:<test_id>:<STATUS> [reason=<tok>]` line.
pub fn parse_bank_line(line: &str) -> Option<BankResult> {
    let payload = line.strip_prefix("BANK:")?.trim();
    let mut parts = payload.splitn(3, ':');
    let test_id = parts.next()?.to_string();
    let status_part = parts.next()?;
    let status = status_part.split_whitespace().next().unwrap_or("").to_string();
    if test_id.is_empty() || status.is_empty() {
        return None;
    }
    let rest = parts.next().unwrap_or("");
    let reason = rest
        .split_whitespace()
        .find_map(|token| token.strip_prefix("reason=").map(String::from));
    Some(BankResult {
        id: test_id,
        status,
        reason,
        raw: line.trim().to_string(),
    })
}

/// Spawn and supervise the simulator child.
///
/// All stdout/stderr lines land in `stdout_log_path` in arrival order; bank
/// and telemetry-override signals are demuxed on the fly. The child is killed
/// once `timeout_s` of wall clock elapses.
pub fn supervise_child(
    binary: &Path,
    scenario_used: &Path,
    env: &BTreeMap<String, String>,
    stdout_log_path: &Path,
    timeout_s: u64,
) -> std::io::Result<SuperviseOutcome> {
    let mut log = BufWriter::new(File::create(stdout_log_path)?);

    let mut cmd = Command::new(binary);
    cmd.arg("-batchmode")
        .arg("-nographics")
        .arg("-logFile")
        .arg("-")
        .arg("--scenario")
        .arg(scenario_used)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn()?;

    // Drain both pipes from dedicated threads; an undrained pipe can wedge
    // the child once its stdio buffer fills.
    let (tx, rx) = mpsc::channel::<String>();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        let tx = tx.clone();
        readers.push(std::thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines().map_while(Result::ok) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        }));
    }
    if let Some(stderr) = child.stderr.take() {
        let tx = tx.clone();
        readers.push(std::thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines().map_while(Result::ok) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        }));
    }
    drop(tx);

    let start = Instant::now();
    let mut timed_out = false;
    let mut bank_results = Vec::new();
    let mut telemetry_out: Option<PathBuf> = None;

    let mut handle_line = |line: &str,
                           bank_results: &mut Vec<BankResult>,
                           telemetry_out: &mut Option<PathBuf>,
                           log: &mut BufWriter<File>| {
        let _ = writeln!(log, "{line}");
        let stripped = line.trim();
        if let Some(bank) = parse_bank_line(stripped) {
            bank_results.push(bank);
        }
        if let Some(rest) = stripped.strip_prefix("TELEMETRY_OUT:") {
            let path = rest.trim();
            if !path.is_empty() {
                *telemetry_out = Some(PathBuf::from(path));
            }
        }
    };

    loop {
        if timeout_s > 0 && start.elapsed() > Duration::from_secs(timeout_s) {
            timed_out = true;
            let _ = writeln!(log, "HEADLESSCTL: timeout after {timeout_s}s");
            let _ = log.flush();
            let _ = child.kill();
            break;
        }

        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(error = %err, "child wait failed");
                break;
            }
        }

        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(line) => handle_line(&line, &mut bank_results, &mut telemetry_out, &mut log),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                // Both pipes closed; the child is exiting.
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }

    // Drain whatever the readers still hold.
    while let Ok(line) = rx.recv_timeout(Duration::from_millis(200)) {
        handle_line(&line, &mut bank_results, &mut telemetry_out, &mut log);
    }
    let _ = log.flush();

    let exit_code = reap_exit_code(&mut child, timed_out);
    for reader in readers {
        let _ = reader.join();
    }

    Ok(SuperviseOutcome {
        exit_code,
        timed_out,
        bank_results,
        telemetry_out,
    })
}

/// Wait up to the reap budget for the exit status.
///
/// A timed-out child was killed by signal and carries no code; it reports
/// 124, as does a child whose status never lands inside the budget.
fn reap_exit_code(child: &mut std::process::Child, timed_out: bool) -> Option<i32> {
    let deadline = Instant::now() + EXIT_REAP_BUDGET;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return status
                    .code()
                    .or(Some(if timed_out { 124 } else { -1 }));
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    return Some(124);
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(_) => return Some(if timed_out { 124 } else { -1 }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bank_line_parsing_variants() {
        let bank = parse_bank_line("BANK:B1:PASS").unwrap();
        assert_eq!(bank.id, "B1");
        assert_eq!(bank.status, "PASS");
        assert!(bank.reason.is_none());

        let bank = parse_bank_line("BANK:B1:FAIL reason=starvation").unwrap();
        assert_eq!(bank.status, "FAIL");
        assert_eq!(bank.reason.as_deref(), Some("starvation"));

        let bank = parse_bank_line("BANK:rewind.micro:FAIL:extra reason=tick_drift").unwrap();
        assert_eq!(bank.id, "rewind.micro");
        assert_eq!(bank.reason.as_deref(), Some("tick_drift"));

        assert!(parse_bank_line("not a bank line").is_none());
        assert!(parse_bank_line("BANK:missing_status").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn supervises_short_child_and_captures_lines() {
        let temp = tempfile::tempdir().unwrap();
        let script = temp.path().join("fake_sim.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho BANK:B1:PASS\necho TELEMETRY_OUT:/tmp/other.ndjson\necho plain line\nexit 0\n",
        )
        .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script, perms).unwrap();
        }

        let log_path = temp.path().join("stdout.log");
        let outcome = supervise_child(
            &script,
            Path::new("/dev/null"),
            &BTreeMap::new(),
            &log_path,
            30,
        )
        .unwrap();

        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.timed_out);
        assert_eq!(outcome.bank_results.len(), 1);
        assert_eq!(outcome.bank_results[0].id, "B1");
        assert_eq!(
            outcome.telemetry_out,
            Some(PathBuf::from("/tmp/other.ndjson"))
        );
        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains("plain line"));
        assert!(log.contains("BANK:B1:PASS"));
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_the_child() {
        let temp = tempfile::tempdir().unwrap();
        let script = temp.path().join("sleeper.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script, perms).unwrap();
        }

        let log_path = temp.path().join("stdout.log");
        let start = Instant::now();
        let outcome = supervise_child(
            &script,
            Path::new("/dev/null"),
            &BTreeMap::new(),
            &log_path,
            1,
        )
        .unwrap();

        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, Some(124));
        assert!(start.elapsed() < Duration::from_secs(15));
        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains("timeout after 1s"));
    }
}
