use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Name of the dotenv file for an environment: `.env` or `.env.{name}`.
pub fn dotenv_file_name(env: Option<&str>) -> String {
    match env {
        Some(name) => format!(".env.{}", name),
        None => ".env".to_string(),
    }
}

/// Load the dotenv file from the current directory or the closest ancestor
/// that has one.
///
/// A missing plain `.env` is fine since everything may already be in the
/// process environment. A missing `.env.{name}` is an error: the caller
/// asked for that environment explicitly.
pub fn load_dotenv_from_ancestors(env: Option<&str>) -> Result<Option<PathBuf>> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let file_name = dotenv_file_name(env);

    if let Some(path) = find_in_ancestors(&cwd, &file_name) {
        dotenvy::from_path(&path)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        return Ok(Some(path));
    }

    if env.is_some() {
        anyhow::bail!(
            "No {} file found.\n\n\
            Searched from {} to filesystem root.",
            file_name,
            cwd.display()
        );
    }

    Ok(None)
}

fn find_in_ancestors(start: &Path, file_name: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(file_name))
        .find(|path| path.is_file())
}
