//! # Artifact Emission
//!
//! Writes the three artifact files (`loader.sql`, `source.sql`,
//! `register.sql`) under an output directory. The writes run concurrently and
//! any single failure fails the whole call.

use mlepack_core::{BuildArtifact, MleError};
use std::path::{Path, PathBuf};

/// Write every artifact file under `dir`, creating it first.
///
/// Returns the written paths in artifact order.
pub async fn emit_artifact(artifact: &BuildArtifact, dir: &Path) -> Result<Vec<PathBuf>, MleError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| MleError::Io(format!("Failure while creating {}: {e}", dir.display())))?;

    let [load, register, wrappers] = artifact.files();
    let paths = [
        dir.join(load.0),
        dir.join(register.0),
        dir.join(wrappers.0),
    ];

    tokio::try_join!(
        write(&paths[0], &load.1),
        write(&paths[1], &register.1),
        write(&paths[2], &wrappers.1),
    )?;

    tracing::debug!("Emitted artifact files under {}", dir.display());
    Ok(paths.to_vec())
}

async fn write(path: &Path, contents: &str) -> Result<(), MleError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| MleError::Io(format!("Failure while writing {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlepack_core::{ArtifactGenerator, FunctionDescriptor, Parameter, Type};

    fn artifact() -> BuildArtifact {
        ArtifactGenerator::default()
            .generate(
                "bundle",
                &[
                    FunctionDescriptor::new("add", vec![Parameter::new("a", Type::Number)], Type::Number),
                    FunctionDescriptor::new("log", vec![Parameter::new("m", Type::String)], Type::None),
                ],
            )
            .expect("generate")
    }

    #[tokio::test]
    async fn writes_three_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("nested/dist");
        let paths = emit_artifact(&artifact(), &out).await.expect("emit");

        assert_eq!(paths.len(), 3);
        let loader = std::fs::read_to_string(out.join("loader.sql")).expect("loader");
        assert!(loader.starts_with("INSERT INTO mlemodules"));
        let register = std::fs::read_to_string(out.join("register.sql")).expect("register");
        assert_eq!(register.lines().count(), 2);
    }

    #[tokio::test]
    async fn unwritable_directory_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").expect("write");
        let result = emit_artifact(&artifact(), &blocker).await;
        assert!(matches!(result, Err(MleError::Io(_))));
    }
}
