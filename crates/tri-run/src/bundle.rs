// Artifact Bundling
// bundle_<run_id>.tar.gz inside the run directory, bundle itself excluded.

use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

use tri_core::Paths;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("bundle io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Create `bundle_<run_id>.tar.gz` inside the run dir and return its path.
pub fn bundle_artifacts(paths: &Paths, run_id: &str) -> Result<PathBuf, BundleError> {
    let run_dir = paths.run_dir(run_id);
    if !run_dir.exists() {
        return Err(BundleError::RunNotFound(run_id.to_string()));
    }
    let bundle_name = format!("bundle_{run_id}.tar.gz");
    let bundle_path = run_dir.join(&bundle_name);

    let file = File::create(&bundle_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let arcname = format!("run_{run_id}");
    append_dir_filtered(&mut builder, &run_dir, Path::new(&arcname), &bundle_name)?;

    let encoder = builder.into_inner()?;
    encoder.finish()?;
    Ok(bundle_path)
}

fn append_dir_filtered(
    builder: &mut tar::Builder<GzEncoder<File>>,
    dir: &Path,
    arc_prefix: &Path,
    skip_name: &str,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        if name.to_string_lossy() == skip_name {
            continue;
        }
        let arc_path = arc_prefix.join(&name);
        if path.is_dir() {
            builder.append_dir(&arc_path, &path)?;
            append_dir_filtered(builder, &path, &arc_path, skip_name)?;
        } else {
            let mut file = File::open(&path)?;
            builder.append_file(&arc_path, &mut file)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::fs;

    fn test_paths(temp: &tempfile::TempDir) -> Paths {
        Paths::with_roots(
            temp.path().join("tool"),
            temp.path().join("tri"),
            temp.path().join("state"),
        )
    }

    #[test]
    fn bundle_contains_run_files_but_not_itself() {
        let temp = tempfile::tempdir().unwrap();
        let paths = test_paths(&temp);
        let run_dir = paths.run_dir("abc123");
        fs::create_dir_all(run_dir.join("Templates")).unwrap();
        fs::write(run_dir.join("result.json"), "{}").unwrap();
        fs::write(run_dir.join("stdout.log"), "line\n").unwrap();
        fs::write(run_dir.join("Templates/t.json"), "{}").unwrap();

        let bundle_path = bundle_artifacts(&paths, "abc123").unwrap();
        assert!(bundle_path.exists());

        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&bundle_path).unwrap()));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.contains(&"run_abc123/result.json".to_string()));
        assert!(names.contains(&"run_abc123/Templates/t.json".to_string()));
        assert!(!names.iter().any(|n| n.contains("bundle_abc123.tar.gz")));
    }

    #[test]
    fn missing_run_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let paths = test_paths(&temp);
        assert!(matches!(
            bundle_artifacts(&paths, "nope"),
            Err(BundleError::RunNotFound(_))
        ));
    }
}
