//! Project scaffolding for `kiln init`.

use std::path::Path;

use kiln_config::manifest::MANIFEST_FILE;

use crate::error::EngineError;

/// Scaffold a new kiln project.
///
/// Creates the project directory (if it doesn't exist), a `kiln.toml` with
/// one source, one unit and one bundle, a `src/hello.sh` for that unit to
/// package, and a `.gitignore` covering the store and dist directories.
///
/// # Errors
/// Returns an error if:
/// - A `kiln.toml` already exists in `dir`
/// - The directory or files cannot be created
pub fn init_project(name: &str, dir: &Path) -> Result<(), EngineError> {
    let manifest_path = dir.join(MANIFEST_FILE);

    if manifest_path.exists() {
        return Err(EngineError::ProjectExists {
            path: manifest_path.display().to_string(),
        });
    }

    let src_dir = dir.join("src");
    kiln_util::fs::ensure_dir(&src_dir)?;

    write_file(&manifest_path, &manifest_template(name))?;
    write_file(
        &src_dir.join("hello.sh"),
        &format!("#!/bin/sh\necho \"Hello from {name}!\"\n"),
    )?;
    write_file(&dir.join(".gitignore"), ".kiln/\ndist/\n")?;

    // The generated manifest must load; a bad name would surface here.
    kiln_config::Manifest::from_path(&manifest_path)?;
    Ok(())
}

fn manifest_template(name: &str) -> String {
    let quoted = toml::Value::String(name.to_owned()).to_string();
    format!(
        r#"[project]
name = {quoted}

[sources.main]
path = "src"

[units.hello]
source = "main"
command = "mkdir -p $KILN_OUT/bin && cp $KILN_SRC/hello.sh $KILN_OUT/bin/hello && chmod +x $KILN_OUT/bin/hello"
outputs = ["bin"]

[bundles.{quoted}]
contents = [{{ unit = "hello", output = "bin", path = "bin" }}]
"#
    )
}

fn write_file(path: &Path, content: &str) -> Result<(), EngineError> {
    std::fs::write(path, content).map_err(|source| EngineError::Io {
        path: path.display().to_string(),
        source,
    })
}
